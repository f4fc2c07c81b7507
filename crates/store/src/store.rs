use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CustomerKey, DistrictKey, LedgerId, Money, OrderKey};

use crate::Result;
use crate::model::{
    Customer, Item, LedgerRecord, NewOrderRecord, OrderLineRecord, OrderRow, ProgressPointer,
    StockDelta, StockRow,
};

/// Entry point to storage.
///
/// Implementations must be cheap to clone and thread-safe; every component
/// holds its own handle.
#[async_trait]
pub trait Store: Send + Sync {
    type Unit: UnitOfWork;

    /// Opens a new atomic unit of work.
    async fn begin(&self) -> Result<Self::Unit>;
}

/// One atomic unit of work against storage.
///
/// All statements are parameterized. Methods documented as locking hold a
/// row lock until the unit ends. Dropping a unit without calling
/// [`UnitOfWork::commit`] rolls it back.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Commits every statement issued through this unit.
    async fn commit(self) -> Result<()>;

    // ------------------------------------------------------------------
    // Customers
    // ------------------------------------------------------------------

    async fn customer(&mut self, key: CustomerKey) -> Result<Option<Customer>>;

    /// Returns up to `limit` customers with the highest balances, highest
    /// first. Equal balances are ordered by key.
    async fn top_balances(&mut self, limit: usize) -> Result<Vec<Customer>>;

    /// Decrements the balance by `amount` and bumps the payment counters.
    /// Returns the new balance.
    async fn apply_customer_payment(&mut self, key: CustomerKey, amount: Money) -> Result<Money>;

    /// Adds a delivered order's total to the balance and bumps the delivery
    /// counter.
    async fn apply_customer_delivery(&mut self, key: CustomerKey, amount: Money) -> Result<()>;

    /// Sets the customer's last order id unless it already points at a
    /// newer order.
    async fn raise_customer_last_order(&mut self, key: CustomerKey, order_id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Payment ledger
    // ------------------------------------------------------------------

    /// Appends a ledger row with both applied flags false.
    async fn insert_ledger(&mut self, customer: CustomerKey, amount: Money)
    -> Result<LedgerRecord>;

    /// Sets the warehouse-applied flag if it is still false. Returns whether
    /// this call flipped it.
    async fn mark_warehouse_applied(&mut self, id: LedgerId) -> Result<bool>;

    /// Sets the district-applied flag if it is still false. Returns whether
    /// this call flipped it.
    async fn mark_district_applied(&mut self, id: LedgerId) -> Result<bool>;

    /// Locks and returns up to `limit` ledger rows of `district` created
    /// after `after` (and no later than `until`, when given), oldest first.
    /// Rows stamped exactly `after` are included while either applied flag
    /// is still false, so a batch cut between equal timestamps loses nothing.
    async fn lock_ledger_after(
        &mut self,
        district: DistrictKey,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>>;

    /// Sets both applied flags of a ledger row.
    async fn mark_ledger_reconciled(&mut self, id: LedgerId) -> Result<()>;

    // ------------------------------------------------------------------
    // Running totals
    // ------------------------------------------------------------------

    async fn warehouse_ytd(&mut self, warehouse_id: i32) -> Result<Money>;

    async fn district_ytd(&mut self, district: DistrictKey) -> Result<Money>;

    /// `ytd = ytd + delta` on the warehouse row.
    async fn add_warehouse_ytd(&mut self, warehouse_id: i32, delta: Money) -> Result<()>;

    /// `ytd = ytd + delta` on the district row.
    async fn add_district_ytd(&mut self, district: DistrictKey, delta: Money) -> Result<()>;

    // ------------------------------------------------------------------
    // Progress pointers
    // ------------------------------------------------------------------

    /// Returns up to `limit` progress pointers ordered by district.
    async fn progress_pointers(&mut self, limit: usize) -> Result<Vec<ProgressPointer>>;

    /// Moves the watermark forward to `watermark`. A watermark never moves
    /// backwards; an older value leaves the pointer unchanged.
    async fn advance_progress_pointer(
        &mut self,
        district: DistrictKey,
        watermark: DateTime<Utc>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Districts and order ids
    // ------------------------------------------------------------------

    /// Returns the district ids of a warehouse in ascending order.
    async fn districts(&mut self, warehouse_id: i32) -> Result<Vec<i32>>;

    /// Locks the district's order-id counter, increments it and returns the
    /// id it held before.
    async fn claim_next_order_id(&mut self, district: DistrictKey) -> Result<i64>;

    /// Returns the next order id the district will hand out.
    async fn next_order_id(&mut self, district: DistrictKey) -> Result<i64>;

    // ------------------------------------------------------------------
    // Catalog and stock
    // ------------------------------------------------------------------

    async fn item(&mut self, item_id: i32) -> Result<Option<Item>>;

    /// Locks and returns one stock row.
    async fn lock_stock(&mut self, warehouse_id: i32, item_id: i32) -> Result<Option<StockRow>>;

    /// Overwrites a stock row previously read with [`UnitOfWork::lock_stock`].
    async fn write_stock(&mut self, row: &StockRow) -> Result<()>;

    /// Subtracts every column of `delta` from its stock row.
    async fn revert_stock(&mut self, delta: &StockDelta) -> Result<()>;

    /// Counts the stock rows of `warehouse_id` among `item_ids` whose
    /// quantity is below `threshold`.
    async fn count_stock_below(
        &mut self,
        warehouse_id: i32,
        item_ids: &[i32],
        threshold: i32,
    ) -> Result<i64>;

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    async fn insert_order(&mut self, order: &NewOrderRecord) -> Result<()>;

    async fn insert_order_line(&mut self, line: &OrderLineRecord) -> Result<()>;

    /// Locks and returns one order row.
    async fn lock_order(&mut self, key: OrderKey) -> Result<Option<OrderRow>>;

    /// Returns one order row without locking it.
    async fn order(&mut self, key: OrderKey) -> Result<Option<OrderRow>>;

    /// Returns the orders of `district` with ids in `[from_order, to_order)`,
    /// by id.
    async fn orders_between(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<OrderRow>>;

    /// Returns the ids of every order the customer placed, ascending.
    async fn customer_order_ids(&mut self, customer: CustomerKey) -> Result<Vec<i64>>;

    /// Returns the orders outside `excluded_warehouse` that contain at least
    /// `min_shared` distinct items of `item_ids`, by key.
    async fn orders_sharing_items(
        &mut self,
        excluded_warehouse: i32,
        item_ids: &[i32],
        min_shared: usize,
    ) -> Result<Vec<OrderRow>>;

    /// Sets the carrier of an order whose carrier is still unset.
    async fn set_order_carrier(&mut self, key: OrderKey, carrier_id: i32) -> Result<()>;

    /// Stamps every line of the order as delivered at `at` and returns the
    /// sum of their amounts.
    async fn deliver_order_lines(&mut self, key: OrderKey, at: DateTime<Utc>) -> Result<Money>;

    /// Returns the lines of an order by line number.
    async fn order_lines(&mut self, key: OrderKey) -> Result<Vec<OrderLineRecord>>;

    /// Returns the distinct item ids ordered in `district` by orders with ids
    /// in `[from_order, to_order)`.
    async fn ordered_items(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<i32>>;

    // ------------------------------------------------------------------
    // Delivery cursors
    // ------------------------------------------------------------------

    /// Returns the next order id eligible for a delivery claim.
    async fn delivery_cursor(&mut self, district: DistrictKey) -> Result<i64>;

    /// Moves the cursor to `next` if that is beyond its stored value.
    /// Returns whether the cursor moved.
    async fn raise_delivery_cursor(&mut self, district: DistrictKey, next: i64) -> Result<bool>;
}
