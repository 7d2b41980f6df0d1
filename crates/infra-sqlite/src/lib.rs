// Taskbed Infrastructure - SQLite Adapter
// Implements: Store, StoreTx

mod connection;
mod error;
mod migration;
mod store;

pub use connection::create_pool;
pub use error::map_sqlx_error;
pub use migration::{apply_migrations, run_migrations, MIGRATIONS};
pub use store::{SqliteStore, SqliteTx};
