// Business domains
pub mod auth;
pub mod automation;
pub mod bulk_operations;
pub mod scheduled_posts;
pub mod sites;
