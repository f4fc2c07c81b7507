//! Sagas for the order-processing workload.
//!
//! Each business transaction is split into atomic units committed one by
//! one, every unit run through a [`RetryExecutor`]:
//!
//! - [`PaymentSaga`]: ledger write, then warehouse and district totals. A
//!   total that could not be updated is repaired later by the
//!   [`CompensationEngine`].
//! - [`NewOrderSaga`]: order id, stock, order insert. A failed insert is
//!   undone by reverting the stock deltas.
//! - [`DeliveryService`]: claims orders district by district from a cursor
//!   that never skips an unresolved order.

pub mod compensation;
pub mod context;
pub mod delivery;
pub mod error;
pub mod new_order;
pub mod payment;
pub mod retry;

pub use compensation::{
    CompensationConfig, CompensationEngine, CompensationHandle, PointerFold, RoundSummary,
    SessionEnd, SessionSummary, spawn,
};
pub use context::ExecutionContext;
pub use delivery::{DeliveredOrder, DeliveryConfig, DeliveryService, DistrictDelivery, WalkEnd};
pub use error::{Result, SagaError};
pub use new_order::{
    NewOrderOutcome, NewOrderRequest, NewOrderSaga, OrderLineRequest, PlacedLine, RESTOCK,
    STOCK_FLOOR, VOID_CARRIER, next_stock_quantity,
};
pub use payment::{PaymentOutcome, PaymentRequest, PaymentSaga};
pub use retry::{RetryExecutor, RetryPolicy};
