//! Sequential command execution for one command stream.

use std::io::BufRead;
use std::time::{Duration, Instant};

use saga::{
    DeliveryConfig, DeliveryService, ExecutionContext, NewOrderOutcome, NewOrderSaga,
    PaymentSaga, SagaError,
};
use serde::Serialize;
use store::Store;

use crate::command::{Command, CommandReader};
use crate::reports::Reports;

const REPORT: &str = "workload::report";

/// Summary of one worker's run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub source: String,
    /// Commands executed, failed ones included.
    pub executed: u64,
    pub failed: u64,
    pub elapsed_ms: f64,
    /// Executed commands per second.
    pub throughput: f64,
    pub latency: LatencySummary,
    /// Set when the stream could not be read to the end.
    pub aborted: Option<String>,
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    /// Nearest-rank percentiles over `samples`.
    pub fn from_samples(samples: &mut [Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let ms = |d: Duration| d.as_secs_f64() * 1_000.0;
        let rank = |p: f64| {
            let index = (p * samples.len() as f64).ceil() as usize;
            ms(samples[index.clamp(1, samples.len()) - 1])
        };
        let total: Duration = samples.iter().sum();

        Self {
            mean_ms: ms(total) / samples.len() as f64,
            p50_ms: rank(0.50),
            p95_ms: rank(0.95),
            p99_ms: rank(0.99),
            max_ms: ms(samples[samples.len() - 1]),
        }
    }
}

/// Runs the commands of one stream strictly in order.
///
/// A failing transaction is logged and counted; the worker moves on to the
/// next command. Only an unreadable stream stops it early.
#[derive(Debug, Clone)]
pub struct Worker<S> {
    id: usize,
    payment: PaymentSaga<S>,
    new_order: NewOrderSaga<S>,
    delivery: DeliveryService<S>,
    reports: Reports<S>,
}

impl<S: Store + Clone> Worker<S> {
    pub fn new(id: usize, ctx: ExecutionContext<S>, delivery: DeliveryConfig) -> Self {
        Self {
            id,
            payment: PaymentSaga::new(ctx.clone()),
            new_order: NewOrderSaga::new(ctx.clone()),
            delivery: DeliveryService::new(ctx.clone(), delivery),
            reports: Reports::new(ctx),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[tracing::instrument(skip(self, commands), fields(worker = self.id))]
    pub async fn run<R: BufRead>(
        &self,
        source: &str,
        commands: CommandReader<R>,
    ) -> WorkerReport {
        let started = Instant::now();
        let mut latencies = Vec::new();
        let mut failed = 0;
        let mut aborted = None;

        for command in commands {
            let command = match command {
                Ok(command) => command,
                Err(err) => {
                    tracing::error!(error = %err, "command stream aborted");
                    aborted = Some(err.to_string());
                    break;
                }
            };
            let kind = command.kind();

            let began = Instant::now();
            let result = self.execute(command).await;
            let latency = began.elapsed();

            let outcome = match result {
                Ok(()) => "ok",
                Err(err) => {
                    failed += 1;
                    tracing::warn!(%kind, error = %err, "transaction failed");
                    failure_outcome(&err)
                }
            };
            latencies.push(latency);
            metrics::counter!(
                "workload_transactions_total",
                "kind" => kind.as_str(),
                "outcome" => outcome
            )
            .increment(1);
            metrics::histogram!("workload_transaction_duration_seconds", "kind" => kind.as_str())
                .record(latency.as_secs_f64());
        }

        let elapsed = started.elapsed();
        let executed = latencies.len() as u64;
        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            executed as f64 / elapsed.as_secs_f64()
        };

        let report = WorkerReport {
            worker: self.id,
            source: source.to_string(),
            executed,
            failed,
            elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
            throughput,
            latency: LatencySummary::from_samples(&mut latencies),
            aborted,
        };
        tracing::info!(
            target: REPORT,
            worker = report.worker,
            executed = report.executed,
            failed = report.failed,
            throughput = report.throughput,
            p95_ms = report.latency.p95_ms,
            "worker finished"
        );
        report
    }

    /// Executes one command and logs its result.
    pub async fn execute(&self, command: Command) -> saga::Result<()> {
        match command {
            Command::NewOrder(request) => match self.new_order.execute(request).await? {
                NewOrderOutcome::Placed {
                    order_id,
                    total,
                    lines,
                } => {
                    tracing::info!(target: REPORT, %order_id, %total, lines = lines.len(), "new order placed");
                    for line in &lines {
                        tracing::debug!(
                            target: REPORT,
                            %order_id,
                            item = line.item_id,
                            name = %line.item_name,
                            supply_warehouse = line.supply_warehouse_id,
                            quantity = line.quantity,
                            amount = %line.amount,
                            stock = line.stock_quantity,
                            "order line"
                        );
                    }
                }
                NewOrderOutcome::Compensated {
                    order_id,
                    reverted,
                    voided,
                } => {
                    tracing::warn!(target: REPORT, %order_id, reverted = reverted.len(), voided, "new order compensated");
                }
            },
            Command::Payment(request) => {
                let outcome = self.payment.execute(request).await?;
                tracing::info!(
                    target: REPORT,
                    customer = %request.customer,
                    amount = %request.amount,
                    balance = %outcome.balance,
                    warehouse_applied = outcome.warehouse_applied,
                    district_applied = outcome.district_applied,
                    "payment"
                );
            }
            Command::Delivery {
                warehouse_id,
                carrier_id,
            } => {
                let districts = self
                    .delivery
                    .deliver_warehouse(warehouse_id, carrier_id)
                    .await?;
                for district in &districts {
                    tracing::info!(
                        target: REPORT,
                        district = %district.district,
                        delivered = district.delivered.len(),
                        end = ?district.end,
                        "delivery"
                    );
                }
            }
            Command::OrderStatus(customer) => {
                let status = self.reports.order_status(customer).await?;
                tracing::info!(target: REPORT, "order status: {status}");
            }
            Command::StockLevel {
                district,
                threshold,
                last_orders,
            } => {
                let level = self
                    .reports
                    .stock_level(district, threshold, last_orders)
                    .await?;
                tracing::info!(target: REPORT, "stock level: {level}");
            }
            Command::PopularItem {
                district,
                last_orders,
            } => {
                let popular = self.reports.popular_items(district, last_orders).await?;
                tracing::info!(target: REPORT, "popular items: {popular}");
            }
            Command::TopBalance => {
                let top = self.reports.top_balance().await?;
                tracing::info!(target: REPORT, "top balance: {top}");
            }
            Command::RelatedCustomer(customer) => {
                let related = self.reports.related_customers(customer).await?;
                tracing::info!(target: REPORT, "related customers: {related}");
            }
        }
        Ok(())
    }
}

/// Metric label for a failed command. A unit that ran out of attempts on
/// lock conflicts is `contended`, on anything else `exhausted`.
fn failure_outcome(err: &SagaError) -> &'static str {
    match err {
        SagaError::RetryExhausted { source, .. } if source.is_transient() => "contended",
        err if err.is_exhausted() => "exhausted",
        SagaError::InvalidRequest(_) => "rejected",
        _ => "failed",
    }
}
