use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{CustomerKey, DistrictKey, LedgerId, Money, OrderKey};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{
    Customer, Item, LedgerRecord, NewOrderRecord, OrderLineRecord, OrderRow, ProgressPointer,
    StockDelta, StockRow,
};
use crate::store::{Store, UnitOfWork};
use crate::{Result, StoreError};

/// A statement of the in-memory store that tests can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Commit,
    CustomerPayment,
    CustomerDelivery,
    InsertLedger,
    MarkWarehouseApplied,
    MarkDistrictApplied,
    LockLedger,
    ReconcileLedger,
    AddWarehouseYtd,
    AddDistrictYtd,
    LoadPointers,
    AdvancePointer,
    ClaimOrderId,
    WriteStock,
    RevertStock,
    InsertOrder,
    InsertOrderLine,
    /// Locking an order row. Plain order reads never trip it.
    LockOrder,
    /// Setting the carrier of one specific order id.
    SetCarrier(i64),
}

#[derive(Debug, Clone, Copy)]
enum FaultMode {
    Always,
    Times(u32),
}

#[derive(Debug, Default)]
struct FaultPlan {
    faults: HashMap<Operation, FaultMode>,
    tripped: HashMap<Operation, u32>,
}

impl FaultPlan {
    fn trip(&mut self, op: Operation) -> Result<()> {
        let fire = match self.faults.get_mut(&op) {
            Some(FaultMode::Always) => true,
            Some(FaultMode::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        if fire {
            *self.tripped.entry(op).or_default() += 1;
            return Err(StoreError::Conflict {
                reason: format!("injected fault on {op:?}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct DistrictRow {
    ytd: Money,
    next_order_id: i64,
    delivery_cursor: i64,
    watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    warehouses: BTreeMap<i32, Money>,
    districts: BTreeMap<DistrictKey, DistrictRow>,
    customers: BTreeMap<CustomerKey, Customer>,
    /// Append order equals `created_at` order.
    ledger: Vec<LedgerRecord>,
    items: BTreeMap<i32, Item>,
    stock: BTreeMap<(i32, i32), StockRow>,
    orders: BTreeMap<OrderKey, OrderRow>,
    order_lines: BTreeMap<OrderKey, Vec<OrderLineRecord>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Issues strictly increasing ledger timestamps.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn district_mut(&mut self, district: DistrictKey) -> Result<&mut DistrictRow> {
        self.districts
            .get_mut(&district)
            .ok_or_else(|| StoreError::not_found("district", district))
    }

    fn ledger_mut(&mut self, id: LedgerId) -> Result<&mut LedgerRecord> {
        self.ledger
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found("ledger row", id))
    }
}

/// In-memory store for tests and local runs.
///
/// Units are serialized behind one async mutex: a unit works on a private
/// copy of the tables and swaps it in on commit. A [`Operation`] can be made
/// to fail with [`StoreError::Conflict`] to exercise retry and compensation
/// paths.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<StdMutex<FaultPlan>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every execution of `op` fail until faults are cleared.
    pub fn fail_on(&self, op: Operation) {
        self.fault_plan().faults.insert(op, FaultMode::Always);
    }

    /// Makes the next `times` executions of `op` fail.
    pub fn fail_times(&self, op: Operation, times: u32) {
        self.fault_plan().faults.insert(op, FaultMode::Times(times));
    }

    /// Removes every configured fault. Trip counts are kept.
    pub fn clear_faults(&self) {
        self.fault_plan().faults.clear();
    }

    /// Returns how many times a fault on `op` has fired.
    pub fn tripped(&self, op: Operation) -> u32 {
        self.fault_plan().tripped.get(&op).copied().unwrap_or(0)
    }

    fn fault_plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub async fn seed_warehouse(&self, warehouse_id: i32) {
        self.tables
            .lock()
            .await
            .warehouses
            .insert(warehouse_id, Money::zero());
    }

    /// Adds a district with its order-id counter, delivery cursor and
    /// progress pointer. Orders start at id 1.
    pub async fn seed_district(&self, district: DistrictKey) {
        let mut tables = self.tables.lock().await;
        tables
            .warehouses
            .entry(district.warehouse_id)
            .or_insert(Money::zero());
        tables.districts.insert(
            district,
            DistrictRow {
                ytd: Money::zero(),
                next_order_id: 1,
                delivery_cursor: 1,
                watermark: DateTime::<Utc>::UNIX_EPOCH,
            },
        );
    }

    pub async fn seed_customer(&self, customer: Customer) {
        self.tables
            .lock()
            .await
            .customers
            .insert(customer.key, customer);
    }

    pub async fn seed_item(&self, item: Item) {
        self.tables.lock().await.items.insert(item.id, item);
    }

    pub async fn seed_stock(&self, row: StockRow) {
        self.tables
            .lock()
            .await
            .stock
            .insert((row.warehouse_id, row.item_id), row);
    }

    /// Appends a ledger row with explicit flags, bypassing the payment path.
    pub async fn seed_ledger(
        &self,
        customer: CustomerKey,
        amount: Money,
        warehouse_applied: bool,
        district_applied: bool,
    ) -> LedgerRecord {
        let mut tables = self.tables.lock().await;
        let record = LedgerRecord {
            id: LedgerId::new(),
            customer,
            amount,
            created_at: tables.next_timestamp(),
            warehouse_applied,
            district_applied,
        };
        tables.ledger.push(record.clone());
        record
    }

    /// Appends an unapplied ledger row stamped `created_at`. Rows already
    /// stamped at or before it stay ahead of it.
    pub async fn seed_ledger_at(
        &self,
        customer: CustomerKey,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> LedgerRecord {
        let mut tables = self.tables.lock().await;
        let record = LedgerRecord {
            id: LedgerId::new(),
            customer,
            amount,
            created_at,
            warehouse_applied: false,
            district_applied: false,
        };
        let at = tables
            .ledger
            .partition_point(|r| r.created_at <= created_at);
        tables.ledger.insert(at, record.clone());
        tables.last_timestamp = tables.last_timestamp.max(Some(created_at));
        record
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn warehouse_ytd(&self, warehouse_id: i32) -> Option<Money> {
        self.tables
            .lock()
            .await
            .warehouses
            .get(&warehouse_id)
            .copied()
    }

    pub async fn district_ytd(&self, district: DistrictKey) -> Option<Money> {
        self.tables
            .lock()
            .await
            .districts
            .get(&district)
            .map(|d| d.ytd)
    }

    pub async fn watermark(&self, district: DistrictKey) -> Option<DateTime<Utc>> {
        self.tables
            .lock()
            .await
            .districts
            .get(&district)
            .map(|d| d.watermark)
    }

    pub async fn delivery_cursor(&self, district: DistrictKey) -> Option<i64> {
        self.tables
            .lock()
            .await
            .districts
            .get(&district)
            .map(|d| d.delivery_cursor)
    }

    pub async fn next_order_id(&self, district: DistrictKey) -> Option<i64> {
        self.tables
            .lock()
            .await
            .districts
            .get(&district)
            .map(|d| d.next_order_id)
    }

    pub async fn ledger(&self, district: DistrictKey) -> Vec<LedgerRecord> {
        self.tables
            .lock()
            .await
            .ledger
            .iter()
            .filter(|r| r.district() == district)
            .cloned()
            .collect()
    }

    pub async fn customer(&self, key: CustomerKey) -> Option<Customer> {
        self.tables.lock().await.customers.get(&key).cloned()
    }

    pub async fn stock(&self, warehouse_id: i32, item_id: i32) -> Option<StockRow> {
        self.tables
            .lock()
            .await
            .stock
            .get(&(warehouse_id, item_id))
            .copied()
    }

    pub async fn order(&self, key: OrderKey) -> Option<OrderRow> {
        self.tables.lock().await.orders.get(&key).cloned()
    }

    pub async fn order_lines(&self, key: OrderKey) -> Vec<OrderLineRecord> {
        self.tables
            .lock()
            .await
            .order_lines
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        self.fault_plan().trip(Operation::Begin)?;
        let guard = self.tables.clone().lock_owned().await;
        let tables = guard.clone();
        Ok(MemoryUnit {
            guard,
            tables,
            faults: self.faults.clone(),
        })
    }
}

/// Unit of work over [`InMemoryStore`]. Holds the store lock for its whole
/// lifetime.
pub struct MemoryUnit {
    guard: OwnedMutexGuard<Tables>,
    tables: Tables,
    faults: Arc<StdMutex<FaultPlan>>,
}

impl MemoryUnit {
    fn trip(&self, op: Operation) -> Result<()> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trip(op)
    }

    fn customer_mut(&mut self, key: CustomerKey) -> Result<&mut Customer> {
        self.tables
            .customers
            .get_mut(&key)
            .ok_or(StoreError::ZeroEffect {
                statement: "update_customer",
            })
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn commit(self) -> Result<()> {
        self.trip(Operation::Commit)?;
        let MemoryUnit {
            mut guard, tables, ..
        } = self;
        *guard = tables;
        Ok(())
    }

    async fn customer(&mut self, key: CustomerKey) -> Result<Option<Customer>> {
        Ok(self.tables.customers.get(&key).cloned())
    }

    async fn top_balances(&mut self, limit: usize) -> Result<Vec<Customer>> {
        let mut customers: Vec<Customer> = self.tables.customers.values().cloned().collect();
        customers.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.key.cmp(&b.key)));
        customers.truncate(limit);
        Ok(customers)
    }

    async fn apply_customer_payment(&mut self, key: CustomerKey, amount: Money) -> Result<Money> {
        self.trip(Operation::CustomerPayment)?;
        let customer = self.customer_mut(key)?;
        customer.balance -= amount;
        customer.ytd_payment += amount;
        customer.payment_count += 1;
        Ok(customer.balance)
    }

    async fn apply_customer_delivery(&mut self, key: CustomerKey, amount: Money) -> Result<()> {
        self.trip(Operation::CustomerDelivery)?;
        let customer = self.customer_mut(key)?;
        customer.balance += amount;
        customer.delivery_count += 1;
        Ok(())
    }

    async fn raise_customer_last_order(&mut self, key: CustomerKey, order_id: i64) -> Result<()> {
        if let Some(customer) = self.tables.customers.get_mut(&key)
            && customer.last_order_id.is_none_or(|last| last < order_id)
        {
            customer.last_order_id = Some(order_id);
        }
        Ok(())
    }

    async fn insert_ledger(
        &mut self,
        customer: CustomerKey,
        amount: Money,
    ) -> Result<LedgerRecord> {
        self.trip(Operation::InsertLedger)?;
        let record = LedgerRecord {
            id: LedgerId::new(),
            customer,
            amount,
            created_at: self.tables.next_timestamp(),
            warehouse_applied: false,
            district_applied: false,
        };
        self.tables.ledger.push(record.clone());
        Ok(record)
    }

    async fn mark_warehouse_applied(&mut self, id: LedgerId) -> Result<bool> {
        self.trip(Operation::MarkWarehouseApplied)?;
        let record = self.tables.ledger_mut(id)?;
        let flipped = !record.warehouse_applied;
        record.warehouse_applied = true;
        Ok(flipped)
    }

    async fn mark_district_applied(&mut self, id: LedgerId) -> Result<bool> {
        self.trip(Operation::MarkDistrictApplied)?;
        let record = self.tables.ledger_mut(id)?;
        let flipped = !record.district_applied;
        record.district_applied = true;
        Ok(flipped)
    }

    async fn lock_ledger_after(
        &mut self,
        district: DistrictKey,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>> {
        self.trip(Operation::LockLedger)?;
        Ok(self
            .tables
            .ledger
            .iter()
            .filter(|r| r.district() == district)
            .filter(|r| {
                r.created_at > after || (r.created_at == after && !r.is_fully_applied())
            })
            .filter(|r| until.is_none_or(|until| r.created_at <= until))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_ledger_reconciled(&mut self, id: LedgerId) -> Result<()> {
        self.trip(Operation::ReconcileLedger)?;
        let record = self.tables.ledger_mut(id)?;
        record.warehouse_applied = true;
        record.district_applied = true;
        Ok(())
    }

    async fn warehouse_ytd(&mut self, warehouse_id: i32) -> Result<Money> {
        self.tables
            .warehouses
            .get(&warehouse_id)
            .copied()
            .ok_or_else(|| StoreError::not_found("warehouse", warehouse_id))
    }

    async fn district_ytd(&mut self, district: DistrictKey) -> Result<Money> {
        Ok(self.tables.district_mut(district)?.ytd)
    }

    async fn add_warehouse_ytd(&mut self, warehouse_id: i32, delta: Money) -> Result<()> {
        self.trip(Operation::AddWarehouseYtd)?;
        let ytd = self
            .tables
            .warehouses
            .get_mut(&warehouse_id)
            .ok_or(StoreError::ZeroEffect {
                statement: "add_warehouse_ytd",
            })?;
        *ytd += delta;
        Ok(())
    }

    async fn add_district_ytd(&mut self, district: DistrictKey, delta: Money) -> Result<()> {
        self.trip(Operation::AddDistrictYtd)?;
        let row = self
            .tables
            .districts
            .get_mut(&district)
            .ok_or(StoreError::ZeroEffect {
                statement: "add_district_ytd",
            })?;
        row.ytd += delta;
        Ok(())
    }

    async fn progress_pointers(&mut self, limit: usize) -> Result<Vec<ProgressPointer>> {
        self.trip(Operation::LoadPointers)?;
        Ok(self
            .tables
            .districts
            .iter()
            .take(limit)
            .map(|(district, row)| ProgressPointer {
                district: *district,
                watermark: row.watermark,
            })
            .collect())
    }

    async fn advance_progress_pointer(
        &mut self,
        district: DistrictKey,
        watermark: DateTime<Utc>,
    ) -> Result<()> {
        self.trip(Operation::AdvancePointer)?;
        let row = self
            .tables
            .districts
            .get_mut(&district)
            .ok_or(StoreError::ZeroEffect {
                statement: "advance_progress_pointer",
            })?;
        row.watermark = row.watermark.max(watermark);
        Ok(())
    }

    async fn districts(&mut self, warehouse_id: i32) -> Result<Vec<i32>> {
        Ok(self
            .tables
            .districts
            .keys()
            .filter(|d| d.warehouse_id == warehouse_id)
            .map(|d| d.district_id)
            .collect())
    }

    async fn claim_next_order_id(&mut self, district: DistrictKey) -> Result<i64> {
        self.trip(Operation::ClaimOrderId)?;
        let row = self
            .tables
            .districts
            .get_mut(&district)
            .ok_or(StoreError::ZeroEffect {
                statement: "claim_next_order_id",
            })?;
        let claimed = row.next_order_id;
        row.next_order_id += 1;
        Ok(claimed)
    }

    async fn next_order_id(&mut self, district: DistrictKey) -> Result<i64> {
        Ok(self.tables.district_mut(district)?.next_order_id)
    }

    async fn item(&mut self, item_id: i32) -> Result<Option<Item>> {
        Ok(self.tables.items.get(&item_id).cloned())
    }

    async fn lock_stock(&mut self, warehouse_id: i32, item_id: i32) -> Result<Option<StockRow>> {
        Ok(self.tables.stock.get(&(warehouse_id, item_id)).copied())
    }

    async fn write_stock(&mut self, row: &StockRow) -> Result<()> {
        self.trip(Operation::WriteStock)?;
        let stored = self
            .tables
            .stock
            .get_mut(&(row.warehouse_id, row.item_id))
            .ok_or(StoreError::ZeroEffect {
                statement: "write_stock",
            })?;
        *stored = *row;
        Ok(())
    }

    async fn revert_stock(&mut self, delta: &StockDelta) -> Result<()> {
        self.trip(Operation::RevertStock)?;
        let stored = self
            .tables
            .stock
            .get_mut(&(delta.warehouse_id, delta.item_id))
            .ok_or(StoreError::ZeroEffect {
                statement: "revert_stock",
            })?;
        *stored = stored.reverted(delta);
        Ok(())
    }

    async fn count_stock_below(
        &mut self,
        warehouse_id: i32,
        item_ids: &[i32],
        threshold: i32,
    ) -> Result<i64> {
        let count = item_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|item_id| self.tables.stock.get(&(warehouse_id, *item_id)))
            .filter(|row| row.quantity < threshold)
            .count();
        Ok(count as i64)
    }

    async fn insert_order(&mut self, order: &NewOrderRecord) -> Result<()> {
        self.trip(Operation::InsertOrder)?;
        if self.tables.orders.contains_key(&order.key) {
            return Err(StoreError::InvalidData(format!(
                "duplicate order {}",
                order.key
            )));
        }
        self.tables.orders.insert(order.key, OrderRow::from(order));
        Ok(())
    }

    async fn insert_order_line(&mut self, line: &OrderLineRecord) -> Result<()> {
        self.trip(Operation::InsertOrderLine)?;
        let lines = self.tables.order_lines.entry(line.order).or_default();
        if lines.iter().any(|l| l.number == line.number) {
            return Err(StoreError::InvalidData(format!(
                "duplicate line {} of order {}",
                line.number, line.order
            )));
        }
        lines.push(line.clone());
        lines.sort_by_key(|l| l.number);
        Ok(())
    }

    async fn lock_order(&mut self, key: OrderKey) -> Result<Option<OrderRow>> {
        self.trip(Operation::LockOrder)?;
        Ok(self.tables.orders.get(&key).cloned())
    }

    async fn order(&mut self, key: OrderKey) -> Result<Option<OrderRow>> {
        Ok(self.tables.orders.get(&key).cloned())
    }

    async fn orders_between(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<OrderRow>> {
        Ok(self
            .tables
            .orders
            .range(district.order(from_order)..district.order(to_order.max(from_order)))
            .map(|(_, order)| order.clone())
            .collect())
    }

    async fn customer_order_ids(&mut self, customer: CustomerKey) -> Result<Vec<i64>> {
        let district = customer.district();
        Ok(self
            .tables
            .orders
            .range(district.order(i64::MIN)..=district.order(i64::MAX))
            .filter(|(_, order)| order.customer_id == customer.customer_id)
            .map(|(key, _)| key.order_id)
            .collect())
    }

    async fn orders_sharing_items(
        &mut self,
        excluded_warehouse: i32,
        item_ids: &[i32],
        min_shared: usize,
    ) -> Result<Vec<OrderRow>> {
        let wanted: BTreeSet<i32> = item_ids.iter().copied().collect();
        Ok(self
            .tables
            .order_lines
            .iter()
            .filter(|(key, _)| key.warehouse_id != excluded_warehouse)
            .filter(|(_, lines)| {
                let shared: BTreeSet<i32> = lines
                    .iter()
                    .map(|line| line.item_id)
                    .filter(|item| wanted.contains(item))
                    .collect();
                shared.len() >= min_shared
            })
            .filter_map(|(key, _)| self.tables.orders.get(key).cloned())
            .collect())
    }

    async fn set_order_carrier(&mut self, key: OrderKey, carrier_id: i32) -> Result<()> {
        self.trip(Operation::SetCarrier(key.order_id))?;
        match self.tables.orders.get_mut(&key) {
            Some(order) if order.carrier_id.is_none() => {
                order.carrier_id = Some(carrier_id);
                Ok(())
            }
            _ => Err(StoreError::ZeroEffect {
                statement: "set_order_carrier",
            }),
        }
    }

    async fn deliver_order_lines(&mut self, key: OrderKey, at: DateTime<Utc>) -> Result<Money> {
        let lines = self
            .tables
            .order_lines
            .get_mut(&key)
            .filter(|lines| !lines.is_empty())
            .ok_or(StoreError::ZeroEffect {
                statement: "deliver_order_lines",
            })?;
        for line in lines.iter_mut() {
            line.delivered_at = Some(at);
        }
        Ok(lines.iter().map(|l| l.amount).sum())
    }

    async fn order_lines(&mut self, key: OrderKey) -> Result<Vec<OrderLineRecord>> {
        Ok(self
            .tables
            .order_lines
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn ordered_items(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<i32>> {
        let items: BTreeSet<i32> = self
            .tables
            .order_lines
            .range(district.order(from_order)..district.order(to_order.max(from_order)))
            .flat_map(|(_, lines)| lines.iter().map(|l| l.item_id))
            .collect();
        Ok(items.into_iter().collect())
    }

    async fn delivery_cursor(&mut self, district: DistrictKey) -> Result<i64> {
        Ok(self.tables.district_mut(district)?.delivery_cursor)
    }

    async fn raise_delivery_cursor(&mut self, district: DistrictKey, next: i64) -> Result<bool> {
        let row = self.tables.district_mut(district)?;
        if next > row.delivery_cursor {
            row.delivery_cursor = next;
            return Ok(true);
        }
        Ok(false)
    }
}
