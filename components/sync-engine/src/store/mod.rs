pub mod db;
pub mod queries;
mod schema;

pub use db::{SqliteDeviceIdStore, SyncDb};
