pub mod actions;
pub mod models;

pub use actions::{find_owned_site, list_sites, register_site, RegisterSiteInput};
pub use models::Site;
