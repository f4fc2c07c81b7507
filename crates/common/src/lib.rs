//! Shared identifiers and value types for the order-processing workload.

pub mod money;
pub mod types;

pub use money::{Money, MoneyParseError};
pub use types::{CustomerKey, DistrictKey, LedgerId, OrderKey};
