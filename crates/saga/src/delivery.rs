//! Delivery: per-district walk from the persisted cursor, claiming orders
//! oldest first.
//!
//! The walk stops at the first id it cannot resolve, so the cursor never
//! passes an undelivered order and the next run resumes exactly there.

use chrono::Utc;
use common::{CustomerKey, DistrictKey, Money, OrderKey};
use store::{Store, UnitOfWork};

use crate::context::ExecutionContext;
use crate::error::{Result, SagaError};

const UNIT_DISTRICTS: &str = "delivery.districts";
const UNIT_CURSOR: &str = "delivery.cursor";
const UNIT_CLAIM: &str = "delivery.claim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Orders delivered per district per run.
    pub orders_per_district: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            orders_per_district: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredOrder {
    pub order_id: OrderKey,
    pub customer: CustomerKey,
    pub amount: Money,
}

/// Why a district walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    BudgetMet,
    /// Every assigned order id was walked.
    CaughtUp,
    /// The order row for this id is not visible yet.
    Pending(i64),
    /// Claiming this id failed on every attempt; the cursor stays on it.
    Blocked(i64),
    /// The cursor could not be read.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistrictDelivery {
    pub district: DistrictKey,
    pub delivered: Vec<DeliveredOrder>,
    pub end: WalkEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Delivered(DeliveredOrder),
    AlreadyClaimed,
    Pending,
}

#[derive(Debug, Clone)]
pub struct DeliveryService<S> {
    ctx: ExecutionContext<S>,
    config: DeliveryConfig,
}

/// Carrier 0 marks void orders, so a delivery must name a positive one.
fn check_carrier(carrier_id: i32) -> Result<()> {
    if carrier_id <= 0 {
        return Err(SagaError::InvalidRequest(format!(
            "carrier id must be positive, got {carrier_id}"
        )));
    }
    Ok(())
}

impl<S: Store + Clone> DeliveryService<S> {
    /// Creates a delivery service claiming up to
    /// `config.orders_per_district` orders per district and run.
    pub fn new(ctx: ExecutionContext<S>, config: DeliveryConfig) -> Self {
        Self { ctx, config }
    }

    /// Delivers for every district of `warehouse_id`, in district order.
    ///
    /// A district whose walk fails is reported and the others still run.
    #[tracing::instrument(skip(self))]
    pub async fn deliver_warehouse(
        &self,
        warehouse_id: i32,
        carrier_id: i32,
    ) -> Result<Vec<DistrictDelivery>> {
        check_carrier(carrier_id)?;
        let store = &self.ctx.store;
        let districts = self
            .ctx
            .retry
            .run(UNIT_DISTRICTS, move || async move {
                let mut unit = store.begin().await?;
                let districts = unit.districts(warehouse_id).await?;
                unit.commit().await?;
                Ok(districts)
            })
            .await?;

        let mut results = Vec::with_capacity(districts.len());
        for district_id in districts {
            let district = DistrictKey::new(warehouse_id, district_id);
            let delivery = match self.advance(district, carrier_id).await {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::warn!(%district, error = %err, "delivery cursor unavailable");
                    DistrictDelivery {
                        district,
                        delivered: Vec::new(),
                        end: WalkEnd::Unavailable(err.to_string()),
                    }
                }
            };
            results.push(delivery);
        }
        Ok(results)
    }

    /// Walks one district from its cursor towards its next order id.
    #[tracing::instrument(skip(self, district), fields(%district))]
    pub async fn advance(&self, district: DistrictKey, carrier_id: i32) -> Result<DistrictDelivery> {
        check_carrier(carrier_id)?;
        let store = &self.ctx.store;
        let (cursor, next_order_id) = self
            .ctx
            .retry
            .run(UNIT_CURSOR, move || async move {
                let mut unit = store.begin().await?;
                let cursor = unit.delivery_cursor(district).await?;
                let next_order_id = unit.next_order_id(district).await?;
                unit.commit().await?;
                Ok((cursor, next_order_id))
            })
            .await?;

        let mut delivered = Vec::new();
        let mut end = WalkEnd::CaughtUp;
        for order_id in cursor..next_order_id {
            if delivered.len() >= self.config.orders_per_district {
                end = WalkEnd::BudgetMet;
                break;
            }
            match self.claim(district.order(order_id), carrier_id).await {
                Ok(Claim::Delivered(order)) => {
                    metrics::counter!("delivery_claims_total").increment(1);
                    tracing::debug!(order_id = %order.order_id, amount = %order.amount, "order delivered");
                    delivered.push(order);
                }
                Ok(Claim::AlreadyClaimed) => {}
                Ok(Claim::Pending) => {
                    end = WalkEnd::Pending(order_id);
                    break;
                }
                Err(err) => {
                    tracing::warn!(order_id, error = %err, "claim abandoned, walk stops here");
                    end = WalkEnd::Blocked(order_id);
                    break;
                }
            }
        }
        if end == WalkEnd::CaughtUp && delivered.len() >= self.config.orders_per_district {
            end = WalkEnd::BudgetMet;
        }

        Ok(DistrictDelivery {
            district,
            delivered,
            end,
        })
    }

    /// Claims one order in one unit. An order someone else claimed is a
    /// successful no-op that still raises the cursor past it.
    async fn claim(&self, key: OrderKey, carrier_id: i32) -> Result<Claim> {
        let store = &self.ctx.store;
        let district = key.district();

        self.ctx
            .retry
            .run(UNIT_CLAIM, move || async move {
                let mut unit = store.begin().await?;
                let Some(order) = unit.lock_order(key).await? else {
                    return Ok(Claim::Pending);
                };
                if order.is_claimed() {
                    unit.raise_delivery_cursor(district, key.order_id + 1).await?;
                    unit.commit().await?;
                    return Ok(Claim::AlreadyClaimed);
                }

                unit.set_order_carrier(key, carrier_id).await?;
                unit.raise_delivery_cursor(district, key.order_id + 1).await?;
                let amount = unit.deliver_order_lines(key, Utc::now()).await?;
                let customer = order.customer();
                unit.apply_customer_delivery(customer, amount).await?;
                unit.commit().await?;

                Ok(Claim::Delivered(DeliveredOrder {
                    order_id: key,
                    customer,
                    amount,
                }))
            })
            .await
    }
}
