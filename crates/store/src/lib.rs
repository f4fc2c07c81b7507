//! Storage boundary for the order-processing workload.
//!
//! Every read and write a saga performs happens inside a [`UnitOfWork`]
//! opened by [`Store::begin`]. A unit either commits as a whole or, when it
//! is dropped without [`UnitOfWork::commit`], leaves no trace.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use common::{CustomerKey, DistrictKey, LedgerId, Money, OrderKey};
pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, MemoryUnit, Operation};
pub use model::{
    Customer, Item, LedgerRecord, NewOrderRecord, OrderLineRecord, OrderRow, ProgressPointer,
    StockDelta, StockRow,
};
pub use postgres::{PostgresStore, PostgresUnit};
pub use store::{Store, UnitOfWork};
