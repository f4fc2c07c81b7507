//! Read-only report transactions.
//!
//! Reports run as a single unit through the same [`saga::RetryExecutor`] as
//! the sagas, and never write.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use common::{CustomerKey, DistrictKey};
use saga::{ExecutionContext, Result, SagaError};
use store::{Customer, OrderLineRecord, OrderRow, Store, StoreError, UnitOfWork};

const UNIT_ORDER_STATUS: &str = "report.order_status";
const UNIT_STOCK_LEVEL: &str = "report.stock_level";
const UNIT_POPULAR_ITEMS: &str = "report.popular_items";
const UNIT_TOP_BALANCE: &str = "report.top_balance";
const UNIT_RELATED_CUSTOMERS: &str = "report.related_customers";

/// Customers listed by the top-balance report.
pub const TOP_BALANCE_LIMIT: usize = 10;

/// Distinct items two orders must have in common to relate their customers.
pub const MIN_SHARED_ITEMS: usize = 2;

/// An order of the popular-item window as read from storage.
type WindowOrder = (OrderRow, Option<Customer>, Vec<OrderLineRecord>);

/// A customer's balance and most recent order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatus {
    pub customer: Customer,
    pub last_order: Option<LastOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOrder {
    pub order: OrderRow,
    pub lines: Vec<OrderLineRecord>,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.customer;
        write!(
            f,
            "customer {} ({} {} {}) balance {}",
            c.key, c.first_name, c.middle_name, c.last_name, c.balance
        )?;
        let Some(last) = &self.last_order else {
            return write!(f, "; no orders");
        };
        let carrier = last
            .order
            .carrier_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(
            f,
            "; last order {} entered {} carrier {}",
            last.order.key,
            last.order.entered_at.to_rfc3339(),
            carrier
        )?;
        for line in &last.lines {
            let delivered = line
                .delivered_at
                .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
            write!(
                f,
                "; item {} from {} qty {} amount {} delivered {}",
                line.item_id, line.supply_warehouse_id, line.quantity, line.amount, delivered
            )?;
        }
        Ok(())
    }
}

/// Number of distinct recently-ordered items below a stock threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub district: DistrictKey,
    pub threshold: i32,
    pub last_orders: i64,
    pub low_stock: i64,
}

impl fmt::Display for StockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "district {}: {} items below {} in the last {} orders",
            self.district, self.low_stock, self.threshold, self.last_orders
        )
    }
}

/// The largest-quantity lines of a district's most recent orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularItems {
    pub district: DistrictKey,
    pub last_orders: i64,
    pub orders: Vec<PopularOrder>,
    /// Every item that was popular in at least one order, by item id.
    pub items: Vec<ItemShare>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularOrder {
    pub order: OrderRow,
    /// `None` when the customer row no longer exists.
    pub customer: Option<Customer>,
    /// Lines carrying the order's largest quantity. Ties are all kept.
    pub popular: Vec<OrderLineRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemShare {
    pub item_id: i32,
    pub item_name: String,
    /// Orders of the window that contain the item at all.
    pub orders: usize,
}

impl PopularItems {
    /// Percentage of the window's orders that contain `share`'s item.
    pub fn percent(&self, share: &ItemShare) -> f64 {
        if self.orders.is_empty() {
            return 0.0;
        }
        share.orders as f64 * 100.0 / self.orders.len() as f64
    }

    fn from_window(district: DistrictKey, last_orders: i64, window: Vec<WindowOrder>) -> Self {
        let window: Vec<WindowOrder> = window
            .into_iter()
            .filter(|(_, _, lines)| !lines.is_empty())
            .collect();

        let mut names: BTreeMap<i32, String> = BTreeMap::new();
        let orders: Vec<PopularOrder> = window
            .iter()
            .map(|(order, customer, lines)| {
                let top = lines.iter().map(|line| line.quantity).max().unwrap_or(0);
                let popular: Vec<OrderLineRecord> = lines
                    .iter()
                    .filter(|line| line.quantity == top)
                    .cloned()
                    .collect();
                for line in &popular {
                    names
                        .entry(line.item_id)
                        .or_insert_with(|| line.item_name.clone());
                }
                PopularOrder {
                    order: order.clone(),
                    customer: customer.clone(),
                    popular,
                }
            })
            .collect();

        let items = names
            .into_iter()
            .map(|(item_id, item_name)| ItemShare {
                item_id,
                item_name,
                orders: window
                    .iter()
                    .filter(|(_, _, lines)| lines.iter().any(|line| line.item_id == item_id))
                    .count(),
            })
            .collect();

        Self {
            district,
            last_orders,
            orders,
            items,
        }
    }
}

impl fmt::Display for PopularItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "district {}: {} orders in the last {}",
            self.district,
            self.orders.len(),
            self.last_orders
        )?;
        for entry in &self.orders {
            write!(
                f,
                "; order {} entered {}",
                entry.order.key,
                entry.order.entered_at.to_rfc3339()
            )?;
            if let Some(c) = &entry.customer {
                write!(f, " by {} {} {}", c.first_name, c.middle_name, c.last_name)?;
            }
            for line in &entry.popular {
                write!(f, " [{} x{}]", line.item_name, line.quantity)?;
            }
        }
        for share in &self.items {
            write!(
                f,
                "; item {} {} in {:.2}% of orders",
                share.item_id,
                share.item_name,
                self.percent(share)
            )?;
        }
        Ok(())
    }
}

/// Customers with the highest balances, highest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopBalance {
    pub customers: Vec<Customer>,
}

impl fmt::Display for TopBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "top {} balances", self.customers.len())?;
        for c in &self.customers {
            write!(
                f,
                "; {} ({} {} {}) {}",
                c.key, c.first_name, c.middle_name, c.last_name, c.balance
            )?;
        }
        Ok(())
    }
}

/// Customers of other warehouses who ordered at least [`MIN_SHARED_ITEMS`]
/// of the items in one of this customer's orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedCustomers {
    pub customer: CustomerKey,
    /// Distinct, ascending.
    pub related: Vec<CustomerKey>,
}

impl fmt::Display for RelatedCustomers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "customer {}: {} related customers",
            self.customer,
            self.related.len()
        )?;
        for key in &self.related {
            write!(f, "; {key}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Reports<S> {
    ctx: ExecutionContext<S>,
}

impl<S: Store + Clone> Reports<S> {
    pub fn new(ctx: ExecutionContext<S>) -> Self {
        Self { ctx }
    }

    /// Customer details plus the last order the customer placed, if any.
    #[tracing::instrument(skip(self, customer), fields(%customer))]
    pub async fn order_status(&self, customer: CustomerKey) -> Result<OrderStatus> {
        let store = &self.ctx.store;

        self.ctx
            .retry
            .run(UNIT_ORDER_STATUS, move || async move {
                let mut unit = store.begin().await?;
                let row = unit
                    .customer(customer)
                    .await?
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "customer",
                        key: customer.to_string(),
                    })?;

                let mut last_order = None;
                if let Some(order_id) = row.last_order_id {
                    let key = customer.district().order(order_id);
                    if let Some(order) = unit.order(key).await? {
                        let lines = unit.order_lines(key).await?;
                        last_order = Some(LastOrder { order, lines });
                    }
                }
                unit.commit().await?;

                Ok(OrderStatus {
                    customer: row,
                    last_order,
                })
            })
            .await
    }

    /// Counts the distinct items of the district's last `last_orders` orders
    /// whose stock at the district's warehouse is below `threshold`.
    #[tracing::instrument(skip(self, district), fields(%district))]
    pub async fn stock_level(
        &self,
        district: DistrictKey,
        threshold: i32,
        last_orders: i64,
    ) -> Result<StockLevel> {
        if last_orders < 1 {
            return Err(SagaError::InvalidRequest(format!(
                "stock level needs at least one order, got {last_orders}"
            )));
        }
        let store = &self.ctx.store;

        let low_stock = self
            .ctx
            .retry
            .run(UNIT_STOCK_LEVEL, move || async move {
                let mut unit = store.begin().await?;
                let next = unit.next_order_id(district).await?;
                let from = (next - last_orders).max(1);
                let items = unit.ordered_items(district, from, next).await?;
                let count = if items.is_empty() {
                    0
                } else {
                    unit.count_stock_below(district.warehouse_id, &items, threshold)
                        .await?
                };
                unit.commit().await?;
                Ok(count)
            })
            .await?;

        Ok(StockLevel {
            district,
            threshold,
            last_orders,
            low_stock,
        })
    }

    /// The largest-quantity items of each of the district's last
    /// `last_orders` orders, with the share of those orders each one
    /// appears in. Orders without lines are left out of the window.
    #[tracing::instrument(skip(self, district), fields(%district))]
    pub async fn popular_items(
        &self,
        district: DistrictKey,
        last_orders: i64,
    ) -> Result<PopularItems> {
        if last_orders < 1 {
            return Err(SagaError::InvalidRequest(format!(
                "popular items needs at least one order, got {last_orders}"
            )));
        }
        let store = &self.ctx.store;

        let window = self
            .ctx
            .retry
            .run(UNIT_POPULAR_ITEMS, move || async move {
                let mut unit = store.begin().await?;
                let next = unit.next_order_id(district).await?;
                let from = (next - last_orders).max(1);
                let mut window = Vec::new();
                for order in unit.orders_between(district, from, next).await? {
                    let customer = unit.customer(district.customer(order.customer_id)).await?;
                    let lines = unit.order_lines(order.key).await?;
                    window.push((order, customer, lines));
                }
                unit.commit().await?;
                Ok(window)
            })
            .await?;

        Ok(PopularItems::from_window(district, last_orders, window))
    }

    #[tracing::instrument(skip(self))]
    pub async fn top_balance(&self) -> Result<TopBalance> {
        let store = &self.ctx.store;

        let customers = self
            .ctx
            .retry
            .run(UNIT_TOP_BALANCE, move || async move {
                let mut unit = store.begin().await?;
                let customers = unit.top_balances(TOP_BALANCE_LIMIT).await?;
                unit.commit().await?;
                Ok(customers)
            })
            .await?;

        Ok(TopBalance { customers })
    }

    /// Walks every order of `customer` and collects the customers of other
    /// warehouses whose orders share at least [`MIN_SHARED_ITEMS`] of its
    /// items.
    #[tracing::instrument(skip(self, customer), fields(%customer))]
    pub async fn related_customers(&self, customer: CustomerKey) -> Result<RelatedCustomers> {
        let store = &self.ctx.store;

        let related = self
            .ctx
            .retry
            .run(UNIT_RELATED_CUSTOMERS, move || async move {
                let mut unit = store.begin().await?;
                let mut related = BTreeSet::new();
                for order_id in unit.customer_order_ids(customer).await? {
                    let key = customer.district().order(order_id);
                    let items: BTreeSet<i32> = unit
                        .order_lines(key)
                        .await?
                        .iter()
                        .map(|line| line.item_id)
                        .collect();
                    if items.len() < MIN_SHARED_ITEMS {
                        continue;
                    }
                    let items: Vec<i32> = items.into_iter().collect();
                    let shared = unit
                        .orders_sharing_items(customer.warehouse_id, &items, MIN_SHARED_ITEMS)
                        .await?;
                    related.extend(
                        shared
                            .iter()
                            .map(|order| order.key.district().customer(order.customer_id)),
                    );
                }
                unit.commit().await?;
                Ok(related.into_iter().collect::<Vec<_>>())
            })
            .await?;

        Ok(RelatedCustomers { customer, related })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::Money;
    use saga::RetryPolicy;
    use store::InMemoryStore;

    fn reports(store: &InMemoryStore) -> Reports<InMemoryStore> {
        Reports::new(ExecutionContext::new(store.clone(), RetryPolicy::immediate(2)))
    }

    #[tokio::test]
    async fn test_order_status_without_orders() {
        let store = InMemoryStore::new();
        let key = CustomerKey::new(1, 1, 1);
        store
            .seed_customer(Customer::new(key, "BARBARBAR", Money::from_cents(-1000)))
            .await;

        let status = reports(&store).order_status(key).await.unwrap();

        assert_eq!(status.customer.balance, Money::from_cents(-1000));
        assert!(status.last_order.is_none());
        assert!(status.to_string().ends_with("no orders"));
    }

    #[tokio::test]
    async fn test_order_status_unknown_customer_is_exhausted() {
        let store = InMemoryStore::new();
        let err = reports(&store)
            .order_status(CustomerKey::new(9, 9, 9))
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_stock_level_display() {
        let level = StockLevel {
            district: DistrictKey::new(1, 2),
            threshold: 15,
            last_orders: 20,
            low_stock: 3,
        };
        assert_eq!(
            level.to_string(),
            "district 1/2: 3 items below 15 in the last 20 orders"
        );
    }

    #[tokio::test]
    async fn test_stock_level_rejects_empty_window() {
        let store = InMemoryStore::new();
        let err = reports(&store)
            .stock_level(DistrictKey::new(1, 1), 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidRequest(_)));
    }

    fn line(order: store::OrderKey, number: i32, item_id: i32, quantity: i32) -> OrderLineRecord {
        OrderLineRecord {
            order,
            number,
            item_id,
            item_name: format!("item-{item_id}"),
            supply_warehouse_id: order.warehouse_id,
            quantity,
            amount: Money::from_cents(100),
            delivered_at: None,
        }
    }

    fn order_row(key: store::OrderKey, line_count: i32) -> OrderRow {
        OrderRow {
            key,
            customer_id: 1,
            carrier_id: None,
            line_count,
            all_local: true,
            entered_at: Utc::now(),
        }
    }

    #[test]
    fn test_popular_items_keep_ties_and_count_shares() {
        let district = DistrictKey::new(1, 1);
        let (first, second, void) = (district.order(1), district.order(2), district.order(3));
        let window = vec![
            (
                order_row(first, 3),
                None,
                vec![line(first, 1, 10, 5), line(first, 2, 11, 5), line(first, 3, 12, 1)],
            ),
            (
                order_row(second, 2),
                None,
                vec![line(second, 1, 12, 9), line(second, 2, 10, 2)],
            ),
            (order_row(void, 0), None, Vec::new()),
        ];

        let popular = PopularItems::from_window(district, 5, window);

        assert_eq!(popular.orders.len(), 2);
        let firsts: Vec<i32> = popular.orders[0].popular.iter().map(|l| l.item_id).collect();
        assert_eq!(firsts, vec![10, 11]);
        assert_eq!(popular.orders[1].popular[0].item_id, 12);

        let shares: Vec<(i32, usize)> = popular.items.iter().map(|s| (s.item_id, s.orders)).collect();
        assert_eq!(shares, vec![(10, 2), (11, 1), (12, 2)]);
        assert_eq!(popular.percent(&popular.items[1]), 50.0);
        assert!(popular.to_string().contains("item 11 item-11 in 50.00% of orders"));
    }

    #[test]
    fn test_empty_popular_window_has_no_shares() {
        let popular = PopularItems::from_window(DistrictKey::new(1, 1), 20, Vec::new());
        assert!(popular.items.is_empty());
        assert_eq!(
            popular.to_string(),
            "district 1/1: 0 orders in the last 20"
        );
    }

    #[tokio::test]
    async fn test_popular_items_rejects_empty_window() {
        let store = InMemoryStore::new();
        let err = reports(&store)
            .popular_items(DistrictKey::new(1, 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_top_balance_lists_at_most_ten() {
        let store = InMemoryStore::new();
        for id in 1..=12 {
            store
                .seed_customer(Customer::new(
                    CustomerKey::new(1, 1, id),
                    "CALLYCALLY",
                    Money::from_cents(i64::from(id) * 100),
                ))
                .await;
        }

        let top = reports(&store).top_balance().await.unwrap();

        assert_eq!(top.customers.len(), TOP_BALANCE_LIMIT);
        assert_eq!(top.customers[0].key, CustomerKey::new(1, 1, 12));
        assert_eq!(top.customers[9].key, CustomerKey::new(1, 1, 3));
        assert!(top.to_string().starts_with("top 10 balances; 1/1/12 (  CALLYCALLY) 12.00"));
    }

    #[test]
    fn test_related_customers_display() {
        let related = RelatedCustomers {
            customer: CustomerKey::new(1, 1, 1),
            related: vec![CustomerKey::new(2, 1, 4), CustomerKey::new(3, 2, 1)],
        };
        assert_eq!(
            related.to_string(),
            "customer 1/1/1: 2 related customers; 2/1/4; 3/2/1"
        );
    }

    #[test]
    fn test_order_status_display_lists_lines() {
        let key = CustomerKey::new(1, 1, 4);
        let order = key.district().order(7);
        let status = OrderStatus {
            customer: Customer::new(key, "OUGHTABLE", Money::zero()),
            last_order: Some(LastOrder {
                order: OrderRow {
                    key: order,
                    customer_id: 4,
                    carrier_id: None,
                    line_count: 1,
                    all_local: true,
                    entered_at: Utc::now(),
                },
                lines: vec![OrderLineRecord {
                    order,
                    number: 1,
                    item_id: 3,
                    item_name: "widget".to_string(),
                    supply_warehouse_id: 1,
                    quantity: 2,
                    amount: Money::from_cents(600),
                    delivered_at: None,
                }],
            }),
        };

        let text = status.to_string();
        assert!(text.contains("last order 1/1#7"));
        assert!(text.contains("carrier -"));
        assert!(text.contains("item 3 from 1 qty 2 amount 6.00 delivered -"));
    }
}
