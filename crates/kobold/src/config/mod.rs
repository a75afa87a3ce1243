//! Environment-style configuration.

pub mod loader;
pub mod schema;

pub use loader::parse_bool;
pub use schema::{default_data_path, Config};
