pub mod fts;
pub mod migrations;
pub mod store;

pub use fts::sanitize_match_query;
pub use migrations::{SchemaStep, latest_schema_version, schema_steps, steps_after};
pub use store::SqliteStore;
