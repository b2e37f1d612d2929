pub mod site;

pub use site::{CreateSite, Site};
