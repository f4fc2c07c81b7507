use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a payment ledger row.
///
/// Wraps a UUID so ledger ids cannot be mixed up with other UUID-based
/// identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(Uuid);

impl LedgerId {
    /// Creates a new random ledger ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a ledger ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LedgerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for LedgerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<LedgerId> for Uuid {
    fn from(id: LedgerId) -> Self {
        id.0
    }
}

/// A district within a warehouse. Aggregates, progress pointers, order-id
/// counters and delivery cursors are all keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DistrictKey {
    pub warehouse_id: i32,
    pub district_id: i32,
}

impl DistrictKey {
    pub fn new(warehouse_id: i32, district_id: i32) -> Self {
        Self {
            warehouse_id,
            district_id,
        }
    }

    /// Returns the key of a customer in this district.
    pub fn customer(&self, customer_id: i32) -> CustomerKey {
        CustomerKey {
            warehouse_id: self.warehouse_id,
            district_id: self.district_id,
            customer_id,
        }
    }

    /// Returns the key of an order in this district.
    pub fn order(&self, order_id: i64) -> OrderKey {
        OrderKey {
            warehouse_id: self.warehouse_id,
            district_id: self.district_id,
            order_id,
        }
    }
}

impl std::fmt::Display for DistrictKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.warehouse_id, self.district_id)
    }
}

/// A customer, identified within its district.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CustomerKey {
    pub warehouse_id: i32,
    pub district_id: i32,
    pub customer_id: i32,
}

impl CustomerKey {
    pub fn new(warehouse_id: i32, district_id: i32, customer_id: i32) -> Self {
        Self {
            warehouse_id,
            district_id,
            customer_id,
        }
    }

    /// Returns the district the customer belongs to.
    pub fn district(&self) -> DistrictKey {
        DistrictKey::new(self.warehouse_id, self.district_id)
    }
}

impl std::fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.warehouse_id, self.district_id, self.customer_id
        )
    }
}

/// An order, identified by its district and per-district sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub warehouse_id: i32,
    pub district_id: i32,
    pub order_id: i64,
}

impl OrderKey {
    /// Returns the district the order belongs to.
    pub fn district(&self) -> DistrictKey {
        DistrictKey::new(self.warehouse_id, self.district_id)
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.warehouse_id, self.district_id, self.order_id
        )
    }
}
