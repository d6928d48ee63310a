//! Job dispatch — queue consumption and item execution.

pub mod engine;
pub mod worker;

pub use engine::{EngineFactory, HttpEngine, HttpEngineFactory, ItemRequest, ScrapeEngine};
pub use worker::{DispatchWorker, WorkerConfig, WorkerDeps};
