//! scrape-pool — session-pooled scraping core.
//!
//! Keeps a pool of expensive browser-minted sessions alive and healthy, and
//! dispatches queued scrape jobs against that pool without ever blocking a
//! job on the minting step.

pub mod config;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod session;
pub mod worker;
