// Persistent jobs: schema, engine, workers, startup recovery

mod engine;
pub mod memento;
mod recovery;
mod schema;
mod worker;

pub use engine::JobEngine;
pub use memento::{define_id_memento_cron, load_id_memento, save_id_memento};
pub use schema::{ErasedHandler, Schema};
