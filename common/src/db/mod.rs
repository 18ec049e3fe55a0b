pub mod migrations;
pub mod repositories;
pub mod schema;
pub mod store;

pub use store::Store;
