mod hybrid;
mod memory;
mod postgres;
mod redis_lock;
mod traits;

pub use hybrid::HybridStateStore;
pub use memory::InMemoryStateStore;
pub use postgres::{PostgresTaskStore, PutResult, TaskStoreError};
pub use redis_lock::{LockStoreError, RedisLockStore};
pub use traits::{
    AcquireOutcome, ExtendOutcome, Finalization, Lock, ProgressUpdate, PutOutcome, StateStore,
};
