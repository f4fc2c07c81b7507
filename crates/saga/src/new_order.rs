//! New-order saga: claim an order id, issue stock, insert the order. A failed
//! insert is undone by reverting the exact stock deltas.

use chrono::Utc;
use common::{CustomerKey, Money, OrderKey};
use store::{NewOrderRecord, OrderLineRecord, StockDelta, StockRow, Store, StoreError, UnitOfWork};

use crate::context::ExecutionContext;
use crate::error::{Result, SagaError};

pub const STEP_CLAIM_ID: &str = "new_order.claim_id";
pub const STEP_STOCK: &str = "new_order.stock";
pub const STEP_INSERT: &str = "new_order.insert";
pub const STEP_REVERT: &str = "new_order.revert_stock";
pub const STEP_VOID: &str = "new_order.void";

/// Carrier recorded on the order row of a compensated order. Real carriers
/// are positive, so delivery sees a void order as already claimed and moves
/// its cursor past the id.
pub const VOID_CARRIER: i32 = 0;

/// Stock below this level after an order is replenished.
pub const STOCK_FLOOR: i32 = 10;
/// Units added when stock falls below [`STOCK_FLOOR`].
pub const RESTOCK: i32 = 100;

/// Quantity left after issuing `ordered` units, restocked when it would
/// drop below the floor. `None` when the result does not fit in an `i32`.
pub fn next_stock_quantity(current: i32, ordered: i32) -> Option<i32> {
    let next = current.checked_sub(ordered)?;
    if next < STOCK_FLOOR {
        next.checked_add(RESTOCK)
    } else {
        Some(next)
    }
}

/// Stock row after issuing one order line from it.
fn issue(row: &StockRow, ordering_warehouse: i32, quantity: i32) -> store::Result<StockRow> {
    let overflow = || {
        StoreError::InvalidData(format!(
            "issuing {quantity} units overflows stock {}/{}",
            row.warehouse_id, row.item_id
        ))
    };
    let remote = i32::from(row.warehouse_id != ordering_warehouse);
    Ok(StockRow {
        quantity: next_stock_quantity(row.quantity, quantity).ok_or_else(overflow)?,
        ytd: row.ytd.checked_add(i64::from(quantity)).ok_or_else(overflow)?,
        order_count: row.order_count.checked_add(1).ok_or_else(overflow)?,
        remote_count: row.remote_count.checked_add(remote).ok_or_else(overflow)?,
        ..*row
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLineRequest {
    pub item_id: i32,
    pub supply_warehouse_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderRequest {
    pub customer: CustomerKey,
    pub lines: Vec<OrderLineRequest>,
}

impl NewOrderRequest {
    /// True when every line is supplied by the ordering warehouse.
    pub fn all_local(&self) -> bool {
        self.lines
            .iter()
            .all(|line| line.supply_warehouse_id == self.customer.warehouse_id)
    }
}

/// One line as issued from stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedLine {
    pub number: i32,
    pub item_id: i32,
    pub item_name: String,
    pub supply_warehouse_id: i32,
    pub quantity: i32,
    pub amount: Money,
    /// Stock quantity left after the line was issued.
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewOrderOutcome {
    Placed {
        order_id: OrderKey,
        total: Money,
        lines: Vec<PlacedLine>,
    },
    /// The insert failed and the stock changes were reverted. The order id
    /// stays consumed; `voided` tells whether a void order row now marks it.
    Compensated {
        order_id: OrderKey,
        reverted: Vec<StockDelta>,
        voided: bool,
    },
}

impl NewOrderOutcome {
    pub fn order_id(&self) -> OrderKey {
        match self {
            NewOrderOutcome::Placed { order_id, .. }
            | NewOrderOutcome::Compensated { order_id, .. } => *order_id,
        }
    }
}

/// Places orders as three units: claim an id, issue stock, insert the order.
///
/// A failed insert reverts the stock it issued and voids the claimed id.
#[derive(Debug, Clone)]
pub struct NewOrderSaga<S> {
    ctx: ExecutionContext<S>,
}

impl<S: Store + Clone> NewOrderSaga<S> {
    pub fn new(ctx: ExecutionContext<S>) -> Self {
        Self { ctx }
    }

    #[tracing::instrument(skip(self, request), fields(customer = %request.customer, lines = request.lines.len()))]
    pub async fn execute(&self, request: NewOrderRequest) -> Result<NewOrderOutcome> {
        if request.lines.is_empty() {
            return Err(SagaError::InvalidRequest("order has no lines".to_string()));
        }
        if let Some(line) = request.lines.iter().find(|line| line.quantity <= 0) {
            return Err(SagaError::InvalidRequest(format!(
                "item {} has non-positive quantity {}",
                line.item_id, line.quantity
            )));
        }

        let order_id = self.claim_order_id(request.customer).await?;
        let (lines, deltas) = match self.issue_stock(&request, order_id).await {
            Ok(issued) => issued,
            Err(err) => {
                // Nothing to revert, but the id is consumed.
                self.void_order(&request, order_id).await;
                return Err(err);
            }
        };

        match self.insert_order(&request, order_id, &lines).await {
            Ok(()) => {
                let total: Money = lines.iter().map(|line| line.amount).sum();
                tracing::info!(%order_id, %total, "order placed");
                Ok(NewOrderOutcome::Placed {
                    order_id,
                    total,
                    lines,
                })
            }
            Err(err) => {
                tracing::warn!(%order_id, error = %err, "order insert abandoned, reverting stock");
                self.revert_stock(order_id, &deltas).await?;
                let voided = self.void_order(&request, order_id).await;
                Ok(NewOrderOutcome::Compensated {
                    order_id,
                    reverted: deltas,
                    voided,
                })
            }
        }
    }

    /// Step 1. The id is never handed back, even if the saga fails later.
    async fn claim_order_id(&self, customer: CustomerKey) -> Result<OrderKey> {
        let store = &self.ctx.store;
        let district = customer.district();

        let order_id = self
            .ctx
            .retry
            .run(STEP_CLAIM_ID, move || async move {
                let mut unit = store.begin().await?;
                let order_id = unit.claim_next_order_id(district).await?;
                unit.commit().await?;
                Ok(order_id)
            })
            .await?;
        Ok(district.order(order_id))
    }

    /// Step 2: one unit issuing every line, recording the delta per line.
    async fn issue_stock(
        &self,
        request: &NewOrderRequest,
        order_id: OrderKey,
    ) -> Result<(Vec<PlacedLine>, Vec<StockDelta>)> {
        let store = &self.ctx.store;
        let ordering_warehouse = order_id.warehouse_id;

        self.ctx
            .retry
            .run(STEP_STOCK, move || async move {
                let mut unit = store.begin().await?;
                let mut placed = Vec::with_capacity(request.lines.len());
                let mut deltas = Vec::with_capacity(request.lines.len());

                for (number, line) in (1..).zip(&request.lines) {
                    let item = unit
                        .item(line.item_id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity: "item",
                            key: line.item_id.to_string(),
                        })?;
                    let before = unit
                        .lock_stock(line.supply_warehouse_id, line.item_id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity: "stock",
                            key: format!("{}/{}", line.supply_warehouse_id, line.item_id),
                        })?;

                    let amount = item.price.checked_multiply(line.quantity).ok_or_else(|| {
                        StoreError::InvalidData(format!(
                            "amount of {} x item {} overflows",
                            line.quantity, item.id
                        ))
                    })?;
                    let after = issue(&before, ordering_warehouse, line.quantity)?;
                    unit.write_stock(&after).await?;
                    deltas.push(before.delta_to(&after));
                    placed.push(PlacedLine {
                        number,
                        item_id: item.id,
                        item_name: item.name,
                        supply_warehouse_id: line.supply_warehouse_id,
                        quantity: line.quantity,
                        amount,
                        stock_quantity: after.quantity,
                    });
                }

                unit.commit().await?;
                Ok((placed, deltas))
            })
            .await
    }

    /// Step 3: the order row, its lines and the customer's last order.
    async fn insert_order(
        &self,
        request: &NewOrderRequest,
        order_id: OrderKey,
        lines: &[PlacedLine],
    ) -> Result<()> {
        let store = &self.ctx.store;
        let order = NewOrderRecord {
            key: order_id,
            customer_id: request.customer.customer_id,
            line_count: lines.len() as i32,
            all_local: request.all_local(),
            entered_at: Utc::now(),
        };
        let order = &order;
        let customer = request.customer;

        self.ctx
            .retry
            .run(STEP_INSERT, move || async move {
                let mut unit = store.begin().await?;
                unit.insert_order(order).await?;
                for line in lines {
                    unit.insert_order_line(&OrderLineRecord {
                        order: order_id,
                        number: line.number,
                        item_id: line.item_id,
                        item_name: line.item_name.clone(),
                        supply_warehouse_id: line.supply_warehouse_id,
                        quantity: line.quantity,
                        amount: line.amount,
                        delivered_at: None,
                    })
                    .await?;
                }
                unit.raise_customer_last_order(customer, order_id.order_id)
                    .await?;
                unit.commit().await?;
                Ok(())
            })
            .await
    }

    /// Backward compensation: subtracts every recorded delta, newest first.
    async fn revert_stock(&self, order_id: OrderKey, deltas: &[StockDelta]) -> Result<()> {
        let store = &self.ctx.store;

        let result = self
            .ctx
            .retry
            .run(STEP_REVERT, move || async move {
                let mut unit = store.begin().await?;
                for delta in deltas.iter().rev() {
                    unit.revert_stock(delta).await?;
                }
                unit.commit().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                metrics::counter!("saga_new_order_compensated_total").increment(1);
                tracing::info!(%order_id, lines = deltas.len(), "stock reverted");
                Ok(())
            }
            Err(err) => {
                tracing::error!(%order_id, error = %err, "stock reversal failed");
                Err(SagaError::CompensationFailed {
                    order: order_id,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Records the consumed id as a void order without lines, so delivery
    /// does not wait on it forever. Best effort: a failure is only logged.
    async fn void_order(&self, request: &NewOrderRequest, order_id: OrderKey) -> bool {
        let store = &self.ctx.store;
        let order = NewOrderRecord {
            key: order_id,
            customer_id: request.customer.customer_id,
            line_count: 0,
            all_local: request.all_local(),
            entered_at: Utc::now(),
        };
        let order = &order;

        let result = self
            .ctx
            .retry
            .run(STEP_VOID, move || async move {
                let mut unit = store.begin().await?;
                unit.insert_order(order).await?;
                unit.set_order_carrier(order_id, VOID_CARRIER).await?;
                unit.commit().await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    %order_id,
                    error = %err,
                    "void order not recorded, delivery for the district waits on this id"
                );
                false
            }
        }
    }
}
