//! Payment saga: ledger write, then independent warehouse and district
//! aggregate steps.

use common::{CustomerKey, LedgerId, Money};
use store::{LedgerRecord, Store, UnitOfWork};

use crate::context::ExecutionContext;
use crate::error::{Result, SagaError};

pub const STEP_LEDGER: &str = "payment.ledger";
pub const STEP_WAREHOUSE: &str = "payment.warehouse";
pub const STEP_DISTRICT: &str = "payment.district";

/// A customer paying `amount` towards their balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentRequest {
    pub customer: CustomerKey,
    pub amount: Money,
}

impl PaymentRequest {
    /// Creates a request. The amount is checked when the saga runs.
    ///
    /// ```
    /// use common::{CustomerKey, Money};
    /// use saga::PaymentRequest;
    ///
    /// let request = PaymentRequest::new(CustomerKey::new(1, 2, 3), Money::from_cents(1_250));
    /// assert_eq!(request.customer.district().to_string(), "1/2");
    /// assert_eq!(request.amount.to_string(), "12.50");
    /// ```
    pub fn new(customer: CustomerKey, amount: Money) -> Self {
        Self { customer, amount }
    }
}

/// Result of a committed payment. The ledger row exists even when an
/// aggregate step was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub ledger_id: LedgerId,
    /// Customer balance after the payment.
    pub balance: Money,
    /// The warehouse step completed. When false the amount is folded in
    /// later by reconciliation.
    pub warehouse_applied: bool,
    /// The district step completed.
    pub district_applied: bool,
}

/// Takes a customer payment in three separately committed units.
///
/// Only the ledger step can fail the saga. The aggregate steps are
/// abandoned on exhaustion and never undo the customer's balance change;
/// the ledger row keeps its flag unset so reconciliation picks it up.
#[derive(Debug, Clone)]
pub struct PaymentSaga<S> {
    ctx: ExecutionContext<S>,
}

impl<S: Store + Clone> PaymentSaga<S> {
    pub fn new(ctx: ExecutionContext<S>) -> Self {
        Self { ctx }
    }

    #[tracing::instrument(skip(self, request), fields(customer = %request.customer, amount = %request.amount))]
    pub async fn execute(&self, request: PaymentRequest) -> Result<PaymentOutcome> {
        if !request.amount.is_positive() {
            return Err(SagaError::InvalidRequest(format!(
                "payment amount must be positive, got {}",
                request.amount
            )));
        }
        metrics::counter!("saga_payment_total").increment(1);

        let (balance, record) = self.record_payment(request).await?;

        let warehouse_applied = self
            .settle(STEP_WAREHOUSE, &record, self.apply_warehouse(&record).await);
        let district_applied =
            self.settle(STEP_DISTRICT, &record, self.apply_district(&record).await);

        tracing::info!(
            ledger_id = %record.id,
            %balance,
            warehouse_applied,
            district_applied,
            "payment recorded"
        );

        Ok(PaymentOutcome {
            ledger_id: record.id,
            balance,
            warehouse_applied,
            district_applied,
        })
    }

    /// Step 1: charge the customer and append the ledger row.
    async fn record_payment(&self, request: PaymentRequest) -> Result<(Money, LedgerRecord)> {
        let store = &self.ctx.store;
        let PaymentRequest { customer, amount } = request;

        self.ctx
            .retry
            .run(STEP_LEDGER, move || async move {
                let mut unit = store.begin().await?;
                let balance = unit.apply_customer_payment(customer, amount).await?;
                let record = unit.insert_ledger(customer, amount).await?;
                unit.commit().await?;
                Ok((balance, record))
            })
            .await
    }

    /// Step 2. The flag is flipped before the amount is added so a row that
    /// reconciliation already folded is not counted twice.
    async fn apply_warehouse(&self, record: &LedgerRecord) -> Result<bool> {
        let store = &self.ctx.store;
        let (id, warehouse_id, amount) = (record.id, record.customer.warehouse_id, record.amount);

        self.ctx
            .retry
            .run(STEP_WAREHOUSE, move || async move {
                let mut unit = store.begin().await?;
                let flipped = unit.mark_warehouse_applied(id).await?;
                if flipped {
                    unit.add_warehouse_ytd(warehouse_id, amount).await?;
                }
                unit.commit().await?;
                Ok(flipped)
            })
            .await
    }

    /// Step 3, same shape as step 2 on the district total.
    async fn apply_district(&self, record: &LedgerRecord) -> Result<bool> {
        let store = &self.ctx.store;
        let (id, district, amount) = (record.id, record.district(), record.amount);

        self.ctx
            .retry
            .run(STEP_DISTRICT, move || async move {
                let mut unit = store.begin().await?;
                let flipped = unit.mark_district_applied(id).await?;
                if flipped {
                    unit.add_district_ytd(district, amount).await?;
                }
                unit.commit().await?;
                Ok(flipped)
            })
            .await
    }

    fn settle(&self, step: &'static str, record: &LedgerRecord, result: Result<bool>) -> bool {
        match result {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(step, ledger_id = %record.id, "row already folded by reconciliation");
                true
            }
            Err(err) => {
                metrics::counter!("saga_step_abandoned_total", "step" => step).increment(1);
                tracing::warn!(
                    step,
                    ledger_id = %record.id,
                    error = %err,
                    "aggregate step abandoned, left for reconciliation"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use common::DistrictKey;
    use store::{Customer, InMemoryStore, Operation};

    async fn setup() -> (InMemoryStore, PaymentSaga<InMemoryStore>) {
        let store = InMemoryStore::new();
        store.seed_district(DistrictKey::new(1, 1)).await;
        store
            .seed_customer(Customer::new(
                CustomerKey::new(1, 1, 1),
                "ABLE",
                Money::from_cents(10_000),
            ))
            .await;
        let saga = PaymentSaga::new(ExecutionContext::new(
            store.clone(),
            RetryPolicy::immediate(3),
        ));
        (store, saga)
    }

    #[tokio::test]
    async fn test_happy_path_applies_all_three_steps() {
        let (store, saga) = setup().await;

        let outcome = saga
            .execute(PaymentRequest::new(
                CustomerKey::new(1, 1, 1),
                Money::from_cents(2_500),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.balance, Money::from_cents(7_500));
        assert!(outcome.warehouse_applied);
        assert!(outcome.district_applied);
        assert_eq!(store.warehouse_ytd(1).await, Some(Money::from_cents(2_500)));
        assert_eq!(
            store.district_ytd(DistrictKey::new(1, 1)).await,
            Some(Money::from_cents(2_500))
        );

        let ledger = store.ledger(DistrictKey::new(1, 1)).await;
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].is_fully_applied());
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let (store, saga) = setup().await;

        let result = saga
            .execute(PaymentRequest::new(CustomerKey::new(1, 1, 1), Money::zero()))
            .await;

        assert!(matches!(result, Err(SagaError::InvalidRequest(_))));
        assert!(store.ledger(DistrictKey::new(1, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_saga_without_side_effects() {
        let (store, saga) = setup().await;
        store.fail_on(Operation::InsertLedger);

        let result = saga
            .execute(PaymentRequest::new(
                CustomerKey::new(1, 1, 1),
                Money::from_cents(100),
            ))
            .await;

        assert!(matches!(
            result,
            Err(SagaError::RetryExhausted {
                unit: STEP_LEDGER,
                ..
            })
        ));
        let customer = store.customer(CustomerKey::new(1, 1, 1)).await.unwrap();
        assert_eq!(customer.balance, Money::from_cents(10_000));
        assert_eq!(customer.payment_count, 0);
    }

    #[tokio::test]
    async fn test_abandoned_warehouse_step_keeps_balance_and_runs_district_step() {
        let (store, saga) = setup().await;
        store.fail_on(Operation::AddWarehouseYtd);

        let outcome = saga
            .execute(PaymentRequest::new(
                CustomerKey::new(1, 1, 1),
                Money::from_cents(400),
            ))
            .await
            .unwrap();

        assert!(!outcome.warehouse_applied);
        assert!(outcome.district_applied);
        assert_eq!(outcome.balance, Money::from_cents(9_600));
        assert_eq!(store.tripped(Operation::AddWarehouseYtd), 3);
        assert_eq!(store.warehouse_ytd(1).await, Some(Money::zero()));

        let ledger = store.ledger(DistrictKey::new(1, 1)).await;
        assert!(!ledger[0].warehouse_applied);
        assert!(ledger[0].district_applied);
    }

    #[tokio::test]
    async fn test_transient_failure_is_masked_by_retry() {
        let (store, saga) = setup().await;
        store.fail_times(Operation::MarkDistrictApplied, 2);

        let outcome = saga
            .execute(PaymentRequest::new(
                CustomerKey::new(1, 1, 1),
                Money::from_cents(100),
            ))
            .await
            .unwrap();

        assert!(outcome.district_applied);
        assert_eq!(
            store.district_ytd(DistrictKey::new(1, 1)).await,
            Some(Money::from_cents(100))
        );
    }
}
