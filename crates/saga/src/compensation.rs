//! Forward reconciliation of ledger rows the payment saga left unapplied.
//!
//! Each round walks the progress pointers. For one pointer, a single unit
//! locks the next batch of ledger rows past the watermark, adds the unapplied
//! amounts to the warehouse and district totals, flags the rows and moves the
//! watermark to the newest row folded. The flags, totals and watermark commit
//! together, so a row is either fully folded or selectable again next round.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::{DistrictKey, Money};
use store::{ProgressPointer, Store, UnitOfWork};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::ExecutionContext;
use crate::error::Result;

const UNIT_LOAD_POINTERS: &str = "compensation.load_pointers";
const UNIT_RECONCILE: &str = "compensation.reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationConfig {
    /// Pointers loaded per round.
    pub pointer_limit: usize,
    /// Ledger rows folded per pointer per round.
    pub batch_limit: usize,
    /// Pause between rounds.
    pub round_interval: Duration,
    /// Wall-clock length of one session. `None` runs until cancelled.
    pub session_budget: Option<Duration>,
    /// Rows younger than this are left for a later round, so a payment
    /// whose ledger unit has not committed yet cannot fall behind the
    /// watermark. Zero folds everything visible.
    pub settle_delay: Duration,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            pointer_limit: 10_000,
            batch_limit: 100,
            round_interval: Duration::from_secs(10),
            session_budget: Some(Duration::from_secs(5 * 60)),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// What one pointer's unit folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerFold {
    pub district: DistrictKey,
    pub rows: usize,
    pub warehouse_delta: Money,
    pub district_delta: Money,
    pub watermark: DateTime<Utc>,
}

/// Totals of one pass over the progress pointers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub pointers: usize,
    /// Pointers whose watermark moved.
    pub advanced: usize,
    /// Pointers whose unit ran out of attempts.
    pub skipped: usize,
    pub warehouse_delta: Money,
    pub district_delta: Money,
}

impl RoundSummary {
    fn absorb(&mut self, fold: &PointerFold) {
        self.advanced += 1;
        self.warehouse_delta += fold.warehouse_delta;
        self.district_delta += fold.district_delta;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    BudgetElapsed,
    Cancelled,
    /// The pointers could not be loaded. Safe to start a new session.
    Faulted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub rounds: u64,
    pub advanced: usize,
    pub skipped: usize,
    pub warehouse_delta: Money,
    pub district_delta: Money,
    pub end: SessionEnd,
}

/// Background reconciliation loop.
#[derive(Debug, Clone)]
pub struct CompensationEngine<S> {
    ctx: ExecutionContext<S>,
    config: CompensationConfig,
}

impl<S: Store + Clone> CompensationEngine<S> {
    /// Creates an engine. Nothing runs until a round or session is started.
    pub fn new(ctx: ExecutionContext<S>, config: CompensationConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &CompensationConfig {
        &self.config
    }

    /// Runs one pass over the progress pointers.
    ///
    /// A pointer whose unit is exhausted is skipped and the round goes on.
    /// Only a failure to load the pointers fails the round.
    #[tracing::instrument(skip(self))]
    pub async fn run_round(&self) -> Result<RoundSummary> {
        let pointers = self.load_pointers().await?;
        let until = self.cutoff();

        let mut summary = RoundSummary {
            pointers: pointers.len(),
            ..RoundSummary::default()
        };
        for pointer in pointers {
            match self.fold_pointer(pointer, until).await {
                Ok(Some(fold)) => summary.absorb(&fold),
                Ok(None) => {}
                Err(err) => {
                    summary.skipped += 1;
                    metrics::counter!("compensation_pointer_skipped_total").increment(1);
                    tracing::warn!(
                        district = %pointer.district,
                        error = %err,
                        "pointer skipped this round"
                    );
                }
            }
        }

        metrics::counter!("compensation_rounds_total").increment(1);
        tracing::info!(
            pointers = summary.pointers,
            advanced = summary.advanced,
            skipped = summary.skipped,
            warehouse_delta = %summary.warehouse_delta,
            district_delta = %summary.district_delta,
            "reconciliation round finished"
        );
        Ok(summary)
    }

    /// Folds the next batch of one pointer's ledger rows.
    ///
    /// Returns `None` when no rows are pending; the pointer is left as is.
    pub async fn reconcile_pointer(&self, pointer: ProgressPointer) -> Result<Option<PointerFold>> {
        self.fold_pointer(pointer, self.cutoff()).await
    }

    /// Runs rounds until the session budget elapses or `cancel` turns true.
    ///
    /// The pause between rounds wakes early on cancellation.
    pub async fn run_session(&self, mut cancel: watch::Receiver<bool>) -> SessionSummary {
        let deadline = self.config.session_budget.map(|budget| Instant::now() + budget);
        let mut summary = SessionSummary {
            rounds: 0,
            advanced: 0,
            skipped: 0,
            warehouse_delta: Money::zero(),
            district_delta: Money::zero(),
            end: SessionEnd::Cancelled,
        };

        summary.end = loop {
            if *cancel.borrow() {
                break SessionEnd::Cancelled;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break SessionEnd::BudgetElapsed;
            }

            match self.run_round().await {
                Ok(round) => {
                    summary.rounds += 1;
                    summary.advanced += round.advanced;
                    summary.skipped += round.skipped;
                    summary.warehouse_delta += round.warehouse_delta;
                    summary.district_delta += round.district_delta;
                }
                Err(err) => {
                    tracing::error!(error = %err, "reconciliation session aborted");
                    break SessionEnd::Faulted(err.to_string());
                }
            }

            let pause = match deadline {
                Some(deadline) => self
                    .config
                    .round_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.config.round_interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = cancel.changed() => {
                    // A dropped sender can never cancel; treat it as a stop.
                    if changed.is_err() {
                        break SessionEnd::Cancelled;
                    }
                }
            }
        };

        tracing::info!(
            rounds = summary.rounds,
            advanced = summary.advanced,
            skipped = summary.skipped,
            end = ?summary.end,
            "reconciliation session ended"
        );
        summary
    }

    async fn load_pointers(&self) -> Result<Vec<ProgressPointer>> {
        let store = &self.ctx.store;
        let limit = self.config.pointer_limit;

        self.ctx
            .retry
            .run(UNIT_LOAD_POINTERS, move || async move {
                let mut unit = store.begin().await?;
                let pointers = unit.progress_pointers(limit).await?;
                unit.commit().await?;
                Ok(pointers)
            })
            .await
    }

    async fn fold_pointer(
        &self,
        pointer: ProgressPointer,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<PointerFold>> {
        let store = &self.ctx.store;
        let batch = self.config.batch_limit;

        self.ctx
            .retry
            .run(UNIT_RECONCILE, move || async move {
                let district = pointer.district;
                let mut unit = store.begin().await?;
                let rows = unit
                    .lock_ledger_after(district, pointer.watermark, until, batch)
                    .await?;
                let Some(newest) = rows.last() else {
                    return Ok(None);
                };
                let watermark = newest.created_at;

                let warehouse_delta: Money = rows
                    .iter()
                    .filter(|row| !row.warehouse_applied)
                    .map(|row| row.amount)
                    .sum();
                let district_delta: Money = rows
                    .iter()
                    .filter(|row| !row.district_applied)
                    .map(|row| row.amount)
                    .sum();

                if warehouse_delta.is_positive() {
                    unit.add_warehouse_ytd(district.warehouse_id, warehouse_delta)
                        .await?;
                }
                if district_delta.is_positive() {
                    unit.add_district_ytd(district, district_delta).await?;
                }
                for row in rows.iter().filter(|row| !row.is_fully_applied()) {
                    unit.mark_ledger_reconciled(row.id).await?;
                }
                unit.advance_progress_pointer(district, watermark).await?;
                unit.commit().await?;

                Ok(Some(PointerFold {
                    district,
                    rows: rows.len(),
                    warehouse_delta,
                    district_delta,
                    watermark,
                }))
            })
            .await
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        if self.config.settle_delay.is_zero() {
            return None;
        }
        let delay = TimeDelta::from_std(self.config.settle_delay).unwrap_or(TimeDelta::MAX);
        Some(
            Utc::now()
                .checked_sub_signed(delay)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

/// Handle to a reconciliation task started with [`spawn`].
pub struct CompensationHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl CompensationHandle {
    /// Signals the task to stop after the round in flight.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the task and returns how many sessions it ran.
    pub async fn join(self) -> std::result::Result<u64, tokio::task::JoinError> {
        self.task.await
    }

    pub async fn shutdown(self) -> std::result::Result<u64, tokio::task::JoinError> {
        self.stop();
        self.join().await
    }
}

/// Runs reconciliation sessions back to back on a background task until
/// stopped. A faulted session is followed by one round interval of pause.
/// Dropping the handle stops the task as well.
pub fn spawn<S>(engine: CompensationEngine<S>) -> CompensationHandle
where
    S: Store + Clone + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        tracing::info!(
            interval_secs = engine.config.round_interval.as_secs(),
            "reconciliation task started"
        );
        let mut sessions = 0;
        loop {
            let summary = engine.run_session(cancel_rx.clone()).await;
            sessions += 1;
            match summary.end {
                SessionEnd::Cancelled => break,
                SessionEnd::BudgetElapsed => {}
                SessionEnd::Faulted(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(engine.config.round_interval) => {}
                        changed = cancel_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::info!(sessions, "reconciliation task stopped");
        sessions
    });

    CompensationHandle {
        cancel: cancel_tx,
        task,
    }
}
