//! Driver tests: command files through the supervisor against the in-memory store.

use std::path::PathBuf;
use std::time::Duration;

use common::{CustomerKey, DistrictKey, Money};
use saga::{
    CompensationConfig, CompensationEngine, DeliveryConfig, ExecutionContext, RetryPolicy,
};
use store::{Customer, InMemoryStore, Item, Operation, StockRow};
use tempfile::TempDir;
use workload::{Command, CommandReader, Reports, Supervisor, Worker, WorkloadError};

async fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    for district_id in 1..=2 {
        let district = DistrictKey::new(1, district_id);
        store.seed_district(district).await;
        for customer_id in 1..=3 {
            store
                .seed_customer(Customer::new(
                    district.customer(customer_id),
                    "ABLEPRI",
                    Money::from_cents(100_000),
                ))
                .await;
        }
    }
    for item_id in 1..=3 {
        store
            .seed_item(Item::new(
                item_id,
                format!("item-{item_id}"),
                Money::from_cents(250),
            ))
            .await;
        store.seed_stock(StockRow::new(1, item_id, 50)).await;
    }
    store
}

fn context(store: &InMemoryStore) -> ExecutionContext<InMemoryStore> {
    ExecutionContext::new(store.clone(), RetryPolicy::immediate(3))
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn parse(line: &str) -> Command {
    CommandReader::new(line.as_bytes()).next().unwrap().unwrap()
}

#[tokio::test]
async fn test_every_stream_runs_to_completion() {
    let store = seeded_store().await;
    let dir = TempDir::new().unwrap();
    let first = write_file(
        &dir,
        "first.txt",
        "N,1,1,1,2\n1,1,5\n2,1,1\nP,1,1,1,10.00\nO,1,1,1\n",
    );
    let second = write_file(&dir, "second.txt", "P,1,2,3,2.50\n\nP,1,2,3,2.50\nO,1,2,3\n");

    let summary = Supervisor::new(context(&store)).run(&[first, second]).await;

    assert!(summary.is_clean());
    let reports: Vec<_> = summary.reports().collect();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].worker, 1);
    assert_eq!(reports[0].executed, 3);
    assert_eq!(reports[1].executed, 3);
    assert_eq!(reports[0].failed + reports[1].failed, 0);
    assert!(summary.compensation_sessions.is_none());

    let paid = store.customer(CustomerKey::new(1, 1, 1)).await.unwrap();
    assert_eq!(paid.balance, Money::from_cents(99_000));
    assert_eq!(paid.last_order_id, Some(1));
    assert_eq!(
        store.warehouse_ytd(1).await,
        Some(Money::from_cents(1_500))
    );
    assert_eq!(
        store.district_ytd(DistrictKey::new(1, 2)).await,
        Some(Money::from_cents(500))
    );
    assert_eq!(store.stock(1, 1).await.unwrap().quantity, 45);
}

#[tokio::test]
async fn test_malformed_record_stops_only_its_worker() {
    let store = seeded_store().await;
    let dir = TempDir::new().unwrap();
    let broken = write_file(&dir, "broken.txt", "T\nP,1,1,1,5.00\nX,1\nP,1,1,1,5.00\n");
    let healthy = write_file(&dir, "healthy.txt", "P,1,1,2,1.00\n");

    let summary = Supervisor::new(context(&store))
        .run(&[broken, healthy])
        .await;

    assert!(!summary.is_clean());
    let reports: Vec<_> = summary.reports().collect();
    assert_eq!(reports[0].executed, 2);
    assert!(reports[0].aborted.as_deref().unwrap().contains("unknown command"));
    assert!(reports[1].aborted.is_none());
    assert_eq!(reports[1].executed, 1);

    let first = store.customer(CustomerKey::new(1, 1, 1)).await.unwrap();
    assert_eq!(first.balance, Money::from_cents(99_500));
}

#[tokio::test]
async fn test_unreadable_file_is_reported_per_worker() {
    let store = seeded_store().await;
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.txt");
    let present = write_file(&dir, "present.txt", "P,1,1,1,1.00\n");

    let summary = Supervisor::new(context(&store))
        .run(&[missing.clone(), present])
        .await;

    assert_eq!(summary.results.len(), 2);
    match &summary.results[0] {
        Err(WorkloadError::Io { path, .. }) => assert_eq!(path, &missing),
        other => panic!("expected an I/O failure, got {other:?}"),
    }
    assert!(summary.results[1].is_ok());
    assert_eq!(summary.failures().count(), 1);
}

#[tokio::test]
async fn test_failed_transactions_do_not_stop_the_worker() {
    let store = seeded_store().await;
    let dir = TempDir::new().unwrap();
    let file = write_file(
        &dir,
        "mixed.txt",
        "P,1,1,99,1.00\nP,1,1,1,0.00\nD,1,0\nP,1,1,1,2.00\n",
    );

    let summary = Supervisor::new(context(&store)).run(&[file]).await;

    let report = summary.reports().next().unwrap();
    assert_eq!(report.executed, 4);
    assert_eq!(report.failed, 3);
    assert!(report.aborted.is_none());
    assert_eq!(
        store.customer(CustomerKey::new(1, 1, 1)).await.unwrap().balance,
        Money::from_cents(99_800)
    );
}

#[tokio::test]
async fn test_reports_are_written_as_json() {
    let store = seeded_store().await;
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "one.txt", "P,1,1,1,1.00\nP,1,1,2,1.00\n");
    let report_dir = dir.path().join("reports");

    let summary = Supervisor::new(context(&store))
        .with_report_dir(&report_dir)
        .run(&[file])
        .await;
    assert!(summary.is_clean());

    let json = std::fs::read_to_string(report_dir.join("worker-1.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["worker"], 1);
    assert_eq!(value["executed"], 2);
    assert_eq!(value["failed"], 0);
    assert!(value["latency"]["p95_ms"].is_number());
    assert!(value["aborted"].is_null());
}

#[tokio::test]
async fn test_reconciliation_runs_alongside_workers() {
    let store = seeded_store().await;
    store.fail_on(Operation::MarkDistrictApplied);
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "payments.txt", "P,1,1,1,3.00\nP,1,1,2,4.00\n");
    let config = CompensationConfig {
        round_interval: Duration::from_millis(5),
        settle_delay: Duration::ZERO,
        ..CompensationConfig::default()
    };

    let summary = Supervisor::new(context(&store))
        .with_compensation(config)
        .run(&[file])
        .await;

    assert!(summary.is_clean());
    assert!(summary.compensation_sessions.unwrap() >= 1);
    assert_eq!(
        store.warehouse_ytd(1).await,
        Some(Money::from_cents(700))
    );

    // Whatever the background task did not fold yet, one more round does.
    CompensationEngine::new(context(&store), config)
        .run_round()
        .await
        .unwrap();
    assert_eq!(
        store.district_ytd(DistrictKey::new(1, 1)).await,
        Some(Money::from_cents(700))
    );
}

#[tokio::test]
async fn test_every_report_command_executes() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());

    for line in ["I,1,1,10", "T", "R,1,1,1", "O,1,1,1", "S,1,1,10,20"] {
        worker.execute(parse(line)).await.unwrap();
    }
    let err = worker.execute(parse("I,1,1,0")).await.unwrap_err();
    assert!(matches!(err, saga::SagaError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_stock_level_counts_recent_items_below_threshold() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));
    let district = DistrictKey::new(1, 1);

    // Item 1 drops to 20, item 2 to 45. Item 3 is low but never ordered.
    worker.execute(parse("N,1,1,1,1\n1,1,30")).await.unwrap();
    worker.execute(parse("N,2,1,1,1\n2,1,5")).await.unwrap();
    store.seed_stock(StockRow::new(1, 3, 1)).await;

    let level = reports.stock_level(district, 25, 10).await.unwrap();
    assert_eq!(level.low_stock, 1);

    let level = reports.stock_level(district, 50, 10).await.unwrap();
    assert_eq!(level.low_stock, 2);

    // Only the most recent order is inside the window.
    let level = reports.stock_level(district, 25, 1).await.unwrap();
    assert_eq!(level.low_stock, 0);
}

#[tokio::test]
async fn test_order_status_reports_the_last_order() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));
    let customer = CustomerKey::new(1, 2, 3);

    worker
        .execute(parse("N,3,1,2,2\n1,1,2\n3,1,1"))
        .await
        .unwrap();
    worker.execute(parse("D,1,7")).await.unwrap();

    let status = reports.order_status(customer).await.unwrap();
    let last = status.last_order.unwrap();
    assert_eq!(last.order.key, DistrictKey::new(1, 2).order(1));
    assert_eq!(last.order.carrier_id, Some(7));
    assert_eq!(last.lines.len(), 2);
    assert_eq!(last.lines[0].amount, Money::from_cents(500));
    assert!(last.lines.iter().all(|line| line.delivered_at.is_some()));
}

#[tokio::test]
async fn test_order_status_reads_without_locking_the_order() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));

    worker.execute(parse("N,1,1,1,1\n2,1,4")).await.unwrap();
    store.fail_on(Operation::LockOrder);

    let status = reports.order_status(CustomerKey::new(1, 1, 1)).await.unwrap();

    assert_eq!(status.last_order.unwrap().lines[0].quantity, 4);
    assert_eq!(store.tripped(Operation::LockOrder), 0);
}

#[tokio::test]
async fn test_popular_items_keep_tied_lines_of_recent_orders() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));
    let district = DistrictKey::new(1, 1);

    worker
        .execute(parse("N,1,1,1,2\n1,1,5\n2,1,5"))
        .await
        .unwrap();
    worker
        .execute(parse("N,2,1,1,2\n2,1,1\n3,1,7"))
        .await
        .unwrap();

    let popular = reports.popular_items(district, 10).await.unwrap();
    assert_eq!(popular.orders.len(), 2);
    assert_eq!(popular.orders[0].popular.len(), 2);
    assert_eq!(
        popular.orders[1].customer.as_ref().unwrap().key,
        district.customer(2)
    );
    let shares: Vec<(i32, usize)> = popular
        .items
        .iter()
        .map(|share| (share.item_id, share.orders))
        .collect();
    assert_eq!(shares, vec![(1, 1), (2, 2), (3, 1)]);
    assert_eq!(popular.percent(&popular.items[1]), 100.0);

    // Only the most recent order is inside the window.
    let popular = reports.popular_items(district, 1).await.unwrap();
    assert_eq!(popular.orders.len(), 1);
    assert_eq!(popular.items.len(), 1);
    assert_eq!(popular.items[0].item_id, 3);
}

#[tokio::test]
async fn test_top_balance_orders_customers_by_balance() {
    let store = seeded_store().await;
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));

    worker.execute(parse("P,1,2,3,10.00")).await.unwrap();
    worker.execute(parse("P,1,1,2,5.00")).await.unwrap();

    let top = reports.top_balance().await.unwrap();

    let keys: Vec<CustomerKey> = top.customers.iter().map(|c| c.key).collect();
    assert_eq!(keys.len(), 6);
    assert_eq!(keys[0], CustomerKey::new(1, 1, 1));
    assert_eq!(keys[4], CustomerKey::new(1, 1, 2));
    assert_eq!(keys[5], CustomerKey::new(1, 2, 3));
    assert_eq!(top.customers[5].balance, Money::from_cents(99_000));
}

#[tokio::test]
async fn test_related_customers_come_from_other_warehouses() {
    let store = seeded_store().await;
    let remote = DistrictKey::new(2, 1);
    store.seed_district(remote).await;
    for customer_id in 1..=2 {
        store
            .seed_customer(Customer::new(
                remote.customer(customer_id),
                "ANTIPRES",
                Money::zero(),
            ))
            .await;
    }
    let worker = Worker::new(1, context(&store), DeliveryConfig::default());
    let reports = Reports::new(context(&store));

    // The customer's order, a same-warehouse order with the same items, a
    // remote order sharing two items and a remote order sharing one.
    worker
        .execute(parse("N,1,1,1,3\n1,1,1\n2,1,1\n3,1,1"))
        .await
        .unwrap();
    worker
        .execute(parse("N,2,1,1,2\n1,1,1\n2,1,1"))
        .await
        .unwrap();
    worker
        .execute(parse("N,1,2,1,2\n1,1,1\n3,1,1"))
        .await
        .unwrap();
    worker.execute(parse("N,2,2,1,1\n2,1,1")).await.unwrap();

    let related = reports
        .related_customers(CustomerKey::new(1, 1, 1))
        .await
        .unwrap();

    assert_eq!(related.related, vec![remote.customer(1)]);
    assert_eq!(
        store.order(remote.order(2)).await.unwrap().customer_id,
        2
    );
}
