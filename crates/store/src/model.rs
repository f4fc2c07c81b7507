//! Row models. Values read inside a unit are snapshots valid only for that
//! unit.

use chrono::{DateTime, Utc};
use common::{CustomerKey, DistrictKey, LedgerId, Money, OrderKey};

/// One payment in the ledger.
///
/// Immutable once inserted apart from the two applied flags, which only ever
/// go from false to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub id: LedgerId,
    pub customer: CustomerKey,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    /// Amount has been added to the warehouse running total.
    pub warehouse_applied: bool,
    /// Amount has been added to the district running total.
    pub district_applied: bool,
}

impl LedgerRecord {
    pub fn district(&self) -> DistrictKey {
        self.customer.district()
    }

    pub fn is_fully_applied(&self) -> bool {
        self.warehouse_applied && self.district_applied
    }
}

/// Reconciliation watermark for one district's ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPointer {
    pub district: DistrictKey,
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub key: CustomerKey,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub balance: Money,
    pub ytd_payment: Money,
    pub payment_count: i32,
    pub delivery_count: i32,
    pub last_order_id: Option<i64>,
}

impl Customer {
    /// A customer with zeroed counters, used for seeding.
    pub fn new(key: CustomerKey, last_name: impl Into<String>, balance: Money) -> Self {
        Self {
            key,
            first_name: String::new(),
            middle_name: String::new(),
            last_name: last_name.into(),
            balance,
            ytd_payment: Money::zero(),
            payment_count: 0,
            delivery_count: 0,
            last_order_id: None,
        }
    }
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: i32,
    pub name: String,
    pub price: Money,
}

impl Item {
    pub fn new(id: i32, name: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            name: name.into(),
            price,
        }
    }
}

/// Stock of one item in one warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockRow {
    pub warehouse_id: i32,
    pub item_id: i32,
    pub quantity: i32,
    /// Units issued year to date.
    pub ytd: i64,
    pub order_count: i32,
    pub remote_count: i32,
}

impl StockRow {
    pub fn new(warehouse_id: i32, item_id: i32, quantity: i32) -> Self {
        Self {
            warehouse_id,
            item_id,
            quantity,
            ytd: 0,
            order_count: 0,
            remote_count: 0,
        }
    }

    /// Returns the per-column difference `after - self`.
    pub fn delta_to(&self, after: &StockRow) -> StockDelta {
        StockDelta {
            warehouse_id: self.warehouse_id,
            item_id: self.item_id,
            quantity: after.quantity - self.quantity,
            ytd: after.ytd - self.ytd,
            order_count: after.order_count - self.order_count,
            remote_count: after.remote_count - self.remote_count,
        }
    }

    /// Returns this row with `delta` subtracted from every column.
    pub fn reverted(&self, delta: &StockDelta) -> StockRow {
        StockRow {
            quantity: self.quantity - delta.quantity,
            ytd: self.ytd - delta.ytd,
            order_count: self.order_count - delta.order_count,
            remote_count: self.remote_count - delta.remote_count,
            ..*self
        }
    }
}

/// Exact change applied to a [`StockRow`], kept so it can be negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockDelta {
    pub warehouse_id: i32,
    pub item_id: i32,
    pub quantity: i32,
    pub ytd: i64,
    pub order_count: i32,
    pub remote_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderRecord {
    pub key: OrderKey,
    pub customer_id: i32,
    pub line_count: i32,
    pub all_local: bool,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRow {
    pub key: OrderKey,
    pub customer_id: i32,
    /// Unset until a delivery claims the order.
    pub carrier_id: Option<i32>,
    pub line_count: i32,
    pub all_local: bool,
    pub entered_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn customer(&self) -> CustomerKey {
        self.key.district().customer(self.customer_id)
    }

    pub fn is_claimed(&self) -> bool {
        self.carrier_id.is_some()
    }
}

impl From<&NewOrderRecord> for OrderRow {
    fn from(order: &NewOrderRecord) -> Self {
        Self {
            key: order.key,
            customer_id: order.customer_id,
            carrier_id: None,
            line_count: order.line_count,
            all_local: order.all_local,
            entered_at: order.entered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineRecord {
    pub order: OrderKey,
    /// 1-based position within the order.
    pub number: i32,
    pub item_id: i32,
    pub item_name: String,
    pub supply_warehouse_id: i32,
    pub quantity: i32,
    pub amount: Money,
    pub delivered_at: Option<DateTime<Utc>>,
}
