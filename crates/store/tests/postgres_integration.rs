//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use sqlx::PgPool;
use store::{
    CustomerKey, DistrictKey, Money, NewOrderRecord, OrderLineRecord, PostgresStore, Store,
    StoreError, UnitOfWork,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresStore::new(temp_pool.clone())
                .run_migrations()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh store over emptied tables, seeded with warehouse 1, district 1/1
/// and customer 1/1/1.
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE order_lines, orders, stocks, items, payment_ledger, customers, \
         payment_pointers, delivery_cursors, district_order_ids, districts, warehouses",
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::raw_sql(
        r#"
        INSERT INTO warehouses (warehouse_id, ytd) VALUES (1, 0);
        INSERT INTO districts (warehouse_id, district_id, ytd) VALUES (1, 1, 0), (1, 2, 0);
        INSERT INTO district_order_ids (warehouse_id, district_id) VALUES (1, 1), (1, 2);
        INSERT INTO delivery_cursors (warehouse_id, district_id) VALUES (1, 1), (1, 2);
        INSERT INTO payment_pointers (warehouse_id, district_id) VALUES (1, 1), (1, 2);
        INSERT INTO customers (warehouse_id, district_id, customer_id, last_name, balance)
            VALUES (1, 1, 1, 'BARBARABLE', 10000);
        INSERT INTO items (item_id, name, price) VALUES (7, 'widget', 250);
        INSERT INTO stocks (warehouse_id, item_id, quantity) VALUES (1, 7, 15);
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

fn district() -> DistrictKey {
    DistrictKey::new(1, 1)
}

fn customer() -> CustomerKey {
    CustomerKey::new(1, 1, 1)
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn payment_unit_commits_and_updates_customer() {
    let store = get_test_store().await;

    let mut unit = store.begin().await.unwrap();
    let balance = unit
        .apply_customer_payment(customer(), Money::from_cents(1500))
        .await
        .unwrap();
    let record = unit
        .insert_ledger(customer(), Money::from_cents(1500))
        .await
        .unwrap();
    unit.commit().await.unwrap();

    assert_eq!(balance, Money::from_cents(8500));
    assert!(!record.warehouse_applied);
    assert!(!record.district_applied);

    let mut unit = store.begin().await.unwrap();
    let loaded = unit.customer(customer()).await.unwrap().unwrap();
    assert_eq!(loaded.balance, Money::from_cents(8500));
    assert_eq!(loaded.ytd_payment, Money::from_cents(1500));
    assert_eq!(loaded.payment_count, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn dropped_unit_rolls_back() {
    let store = get_test_store().await;

    {
        let mut unit = store.begin().await.unwrap();
        unit.add_warehouse_ytd(1, Money::from_cents(700)).await.unwrap();
    }

    let mut unit = store.begin().await.unwrap();
    assert_eq!(unit.warehouse_ytd(1).await.unwrap(), Money::zero());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn applied_flag_flips_once() {
    let store = get_test_store().await;

    let mut unit = store.begin().await.unwrap();
    let record = unit
        .insert_ledger(customer(), Money::from_cents(100))
        .await
        .unwrap();
    assert!(unit.mark_warehouse_applied(record.id).await.unwrap());
    assert!(!unit.mark_warehouse_applied(record.id).await.unwrap());
    assert!(unit.mark_district_applied(record.id).await.unwrap());
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let missing = unit.mark_district_applied(store::LedgerId::new()).await;
    assert!(matches!(missing, Err(StoreError::ZeroEffect { .. })));
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn ledger_window_and_pointer_monotonicity() {
    let store = get_test_store().await;

    let mut unit = store.begin().await.unwrap();
    for cents in [1000, 2000, 3000] {
        unit.insert_ledger(customer(), Money::from_cents(cents))
            .await
            .unwrap();
    }
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let pointers = unit.progress_pointers(10).await.unwrap();
    assert_eq!(pointers.len(), 2);
    let rows = unit
        .lock_ledger_after(district(), pointers[0].watermark, None, 2)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].created_at < rows[1].created_at);
    assert_eq!(rows[0].amount, Money::from_cents(1000));

    unit.advance_progress_pointer(district(), rows[1].created_at)
        .await
        .unwrap();
    unit.advance_progress_pointer(district(), rows[0].created_at)
        .await
        .unwrap();
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let pointers = unit.progress_pointers(1).await.unwrap();
    assert_eq!(pointers[0].watermark, rows[1].created_at);

    // Only the unapplied row sitting exactly at the lower bound is left.
    let until = rows[1].created_at - Duration::microseconds(1);
    let remaining = unit
        .lock_ledger_after(district(), rows[0].created_at, Some(until), 10)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, rows[0].id);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn order_claim_and_delivery_lifecycle() {
    let store = get_test_store().await;

    let mut unit = store.begin().await.unwrap();
    let order_id = unit.claim_next_order_id(district()).await.unwrap();
    assert_eq!(order_id, 1);
    let key = district().order(order_id);
    unit.insert_order(&NewOrderRecord {
        key,
        customer_id: 1,
        line_count: 1,
        all_local: true,
        entered_at: Utc::now(),
    })
    .await
    .unwrap();
    unit.insert_order_line(&OrderLineRecord {
        order: key,
        number: 1,
        item_id: 7,
        item_name: "widget".to_string(),
        supply_warehouse_id: 1,
        quantity: 2,
        amount: Money::from_cents(500),
        delivered_at: None,
    })
    .await
    .unwrap();
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    assert_eq!(unit.next_order_id(district()).await.unwrap(), 2);
    let order = unit.lock_order(key).await.unwrap().unwrap();
    assert!(!order.is_claimed());
    unit.set_order_carrier(key, 4).await.unwrap();
    let total = unit.deliver_order_lines(key, Utc::now()).await.unwrap();
    assert_eq!(total, Money::from_cents(500));
    assert!(unit.raise_delivery_cursor(district(), 2).await.unwrap());
    assert!(!unit.raise_delivery_cursor(district(), 2).await.unwrap());
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let again = unit.set_order_carrier(key, 5).await;
    assert!(matches!(again, Err(StoreError::ZeroEffect { .. })));
    assert_eq!(unit.delivery_cursor(district()).await.unwrap(), 2);
    assert_eq!(unit.ordered_items(district(), 1, 2).await.unwrap(), vec![7]);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn stock_write_and_revert() {
    let store = get_test_store().await;

    let mut unit = store.begin().await.unwrap();
    let before = unit.lock_stock(1, 7).await.unwrap().unwrap();
    let after = store::StockRow {
        quantity: before.quantity - 2,
        ytd: before.ytd + 2,
        order_count: before.order_count + 1,
        ..before
    };
    unit.write_stock(&after).await.unwrap();
    unit.revert_stock(&before.delta_to(&after)).await.unwrap();
    assert_eq!(unit.lock_stock(1, 7).await.unwrap(), Some(before));
    assert_eq!(unit.count_stock_below(1, &[7], 20).await.unwrap(), 1);
    assert_eq!(unit.count_stock_below(1, &[7], 10).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn ledger_rows_tied_with_the_watermark_stay_selectable() {
    let store = get_test_store().await;
    let stamp = Utc::now() - Duration::seconds(5);

    sqlx::query(
        r#"
        INSERT INTO payment_ledger (id, warehouse_id, district_id, customer_id, amount, created_at)
        VALUES ($1, 1, 1, 1, 400, $3), ($2, 1, 1, 1, 600, $3)
        "#,
    )
    .bind(uuid::Uuid::new_v4())
    .bind(uuid::Uuid::new_v4())
    .bind(stamp)
    .execute(store.pool())
    .await
    .unwrap();

    let mut unit = store.begin().await.unwrap();
    let first = unit
        .lock_ledger_after(district(), stamp - Duration::seconds(1), None, 1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    unit.mark_ledger_reconciled(first[0].id).await.unwrap();
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let rest = unit
        .lock_ledger_after(district(), stamp, None, 10)
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_ne!(rest[0].id, first[0].id);
    assert_eq!(rest[0].created_at, first[0].created_at);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn report_reads_find_orders_and_balances() {
    let store = get_test_store().await;
    sqlx::raw_sql(
        r#"
        INSERT INTO warehouses (warehouse_id, ytd) VALUES (2, 0);
        INSERT INTO districts (warehouse_id, district_id, ytd) VALUES (2, 1, 0);
        INSERT INTO customers (warehouse_id, district_id, customer_id, last_name, balance)
            VALUES (1, 1, 2, 'OUGHTPRES', 50000), (2, 1, 1, 'ESEANTI', 20000);
        "#,
    )
    .execute(store.pool())
    .await
    .unwrap();

    let remote = DistrictKey::new(2, 1);
    let mut unit = store.begin().await.unwrap();
    for (key, customer_id, items) in [
        (district().order(1), 1, [7, 8]),
        (district().order(2), 2, [7, 9]),
        (remote.order(1), 1, [7, 8]),
    ] {
        unit.insert_order(&NewOrderRecord {
            key,
            customer_id,
            line_count: 2,
            all_local: true,
            entered_at: Utc::now(),
        })
        .await
        .unwrap();
        for (number, item_id) in (1..).zip(items) {
            unit.insert_order_line(&OrderLineRecord {
                order: key,
                number,
                item_id,
                item_name: format!("item-{item_id}"),
                supply_warehouse_id: key.warehouse_id,
                quantity: 1,
                amount: Money::from_cents(100),
                delivered_at: None,
            })
            .await
            .unwrap();
        }
    }
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let order = unit.order(district().order(2)).await.unwrap().unwrap();
    assert_eq!(order.customer_id, 2);
    assert!(unit.order(district().order(3)).await.unwrap().is_none());

    let window = unit.orders_between(district(), 1, 3).await.unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window[1].key, district().order(2));

    assert_eq!(unit.customer_order_ids(customer()).await.unwrap(), vec![1]);

    let shared = unit.orders_sharing_items(1, &[7, 8], 2).await.unwrap();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].key, remote.order(1));

    let top = unit.top_balances(2).await.unwrap();
    let keys: Vec<CustomerKey> = top.iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![CustomerKey::new(1, 1, 2), CustomerKey::new(2, 1, 1)]);
}
