// WordPress Automation Engine - Core
//
// Scheduling and batch execution for WordPress sites: bulk operations over
// remote posts, time-scheduled publishing with retries, and cron-driven
// content generation. Each domain owns its records; the kernel wires the
// managers to the store and the remote collaborators.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
