//! Session pool — credential records, persistence, pooling policy, and the
//! background producer that mints new sessions.

pub mod libsql_store;
pub mod model;
pub mod pool;
pub mod producer;
pub mod store;

pub use libsql_store::LibSqlSessionStore;
pub use model::{Session, SessionLimits};
pub use pool::{PoolConfig, SessionPool, spawn_janitor};
pub use producer::{CommandMinter, ProducerConfig, SessionMinter, SessionProducer};
pub use store::{SessionStore, StoreStats};
