pub mod store;

pub use store::SqliteStateStore;
