//! Workload driver.
//!
//! Reads command streams, runs each stream on its own [`Worker`] under a
//! [`Supervisor`], and reports per-worker latency and throughput.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod reports;
pub mod supervisor;
pub mod worker;

pub use command::{Command, CommandKind, CommandReader};
pub use config::Config;
pub use error::{ParseError, Result, WorkloadError};
pub use reports::{
    ItemShare, LastOrder, OrderStatus, PopularItems, PopularOrder, RelatedCustomers, Reports,
    StockLevel, TopBalance,
};
pub use supervisor::{RunSummary, Supervisor};
pub use worker::{LatencySummary, Worker, WorkerReport};
