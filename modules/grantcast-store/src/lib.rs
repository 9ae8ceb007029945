pub mod cast_store;
pub mod kv;
pub mod migrate;
pub mod queue;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use cast_store::{CastStore, PgCastStore};
pub use kv::{KvStore, PgKvStore};
pub use queue::{JobQueue, PgJobQueue, QueueName, QueuedJob};
