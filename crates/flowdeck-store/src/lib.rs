pub mod definitions;
pub mod executions;
pub mod store;

pub use store::SqliteStore;
