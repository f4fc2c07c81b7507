use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CustomerKey, DistrictKey, LedgerId, Money, OrderKey};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::model::{
    Customer, Item, LedgerRecord, NewOrderRecord, OrderLineRecord, OrderRow, ProgressPointer,
    StockDelta, StockRow,
};
use crate::store::{Store, UnitOfWork};
use crate::{Result, StoreError};

/// PostgreSQL-backed store.
///
/// Units run at the database's default isolation (read committed) and take
/// row locks with `SELECT ... FOR UPDATE` / `UPDATE ... RETURNING` where the
/// trait asks for them.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("workload schema migrated");
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Unit = PostgresUnit;

    async fn begin(&self) -> Result<PostgresUnit> {
        Ok(PostgresUnit {
            tx: self.pool.begin().await?,
        })
    }
}

/// Unit of work backed by one PostgreSQL transaction.
pub struct PostgresUnit {
    tx: Transaction<'static, Postgres>,
}

fn money(row: &PgRow, column: &str) -> Result<Money> {
    Ok(Money::from_cents(row.try_get::<i64, _>(column)?))
}

fn row_to_ledger(row: PgRow) -> Result<LedgerRecord> {
    Ok(LedgerRecord {
        id: LedgerId::from_uuid(row.try_get::<Uuid, _>("id")?),
        customer: CustomerKey::new(
            row.try_get("warehouse_id")?,
            row.try_get("district_id")?,
            row.try_get("customer_id")?,
        ),
        amount: money(&row, "amount")?,
        created_at: row.try_get("created_at")?,
        warehouse_applied: row.try_get("warehouse_applied")?,
        district_applied: row.try_get("district_applied")?,
    })
}

fn row_to_customer(row: &PgRow, key: CustomerKey) -> Result<Customer> {
    Ok(Customer {
        key,
        first_name: row.try_get("first_name")?,
        middle_name: row.try_get("middle_name")?,
        last_name: row.try_get("last_name")?,
        balance: money(row, "balance")?,
        ytd_payment: money(row, "ytd_payment")?,
        payment_count: row.try_get("payment_count")?,
        delivery_count: row.try_get("delivery_count")?,
        last_order_id: row.try_get("last_order_id")?,
    })
}

fn row_to_order(row: PgRow) -> Result<OrderRow> {
    Ok(OrderRow {
        key: OrderKey {
            warehouse_id: row.try_get("warehouse_id")?,
            district_id: row.try_get("district_id")?,
            order_id: row.try_get("order_id")?,
        },
        customer_id: row.try_get("customer_id")?,
        carrier_id: row.try_get("carrier_id")?,
        line_count: row.try_get("line_count")?,
        all_local: row.try_get("all_local")?,
        entered_at: row.try_get("entered_at")?,
    })
}

fn row_to_order_line(row: PgRow) -> Result<OrderLineRecord> {
    Ok(OrderLineRecord {
        order: OrderKey {
            warehouse_id: row.try_get("warehouse_id")?,
            district_id: row.try_get("district_id")?,
            order_id: row.try_get("order_id")?,
        },
        number: row.try_get("line_number")?,
        item_id: row.try_get("item_id")?,
        item_name: row.try_get("item_name")?,
        supply_warehouse_id: row.try_get("supply_warehouse_id")?,
        quantity: row.try_get("quantity")?,
        amount: money(&row, "amount")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PostgresUnit {
    /// Flips one applied flag. Distinguishes "already set" from "no such row".
    async fn mark_applied(&mut self, sql: &'static str, id: LedgerId) -> Result<bool> {
        let result = sqlx::query(sql)
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payment_ledger WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&mut *self.tx)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::ZeroEffect {
                statement: "mark_ledger_applied",
            })
        }
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnit {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn customer(&mut self, key: CustomerKey) -> Result<Option<Customer>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT first_name, middle_name, last_name, balance, ytd_payment,
                   payment_count, delivery_count, last_order_id
            FROM customers
            WHERE warehouse_id = $1 AND district_id = $2 AND customer_id = $3
            "#,
        )
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.customer_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| row_to_customer(&row, key)).transpose()
    }

    async fn top_balances(&mut self, limit_rows: usize) -> Result<Vec<Customer>> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, customer_id, first_name, middle_name, last_name,
                   balance, ytd_payment, payment_count, delivery_count, last_order_id
            FROM customers
            ORDER BY balance DESC, warehouse_id, district_id, customer_id
            LIMIT $1
            "#,
        )
        .bind(limit(limit_rows))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                let key = CustomerKey::new(
                    row.try_get("warehouse_id")?,
                    row.try_get("district_id")?,
                    row.try_get("customer_id")?,
                );
                row_to_customer(row, key)
            })
            .collect()
    }

    async fn apply_customer_payment(&mut self, key: CustomerKey, amount: Money) -> Result<Money> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE customers
            SET balance = balance - $1,
                ytd_payment = ytd_payment + $1,
                payment_count = payment_count + 1
            WHERE warehouse_id = $2 AND district_id = $3 AND customer_id = $4
            RETURNING balance
            "#,
        )
        .bind(amount.cents())
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.customer_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        balance
            .map(Money::from_cents)
            .ok_or(StoreError::ZeroEffect {
                statement: "apply_customer_payment",
            })
    }

    async fn apply_customer_delivery(&mut self, key: CustomerKey, amount: Money) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET balance = balance + $1, delivery_count = delivery_count + 1
            WHERE warehouse_id = $2 AND district_id = $3 AND customer_id = $4
            "#,
        )
        .bind(amount.cents())
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.customer_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "apply_customer_delivery",
            });
        }
        Ok(())
    }

    async fn raise_customer_last_order(&mut self, key: CustomerKey, order_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE customers
            SET last_order_id = $1
            WHERE warehouse_id = $2 AND district_id = $3 AND customer_id = $4
              AND (last_order_id IS NULL OR last_order_id < $1)
            "#,
        )
        .bind(order_id)
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.customer_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_ledger(
        &mut self,
        customer: CustomerKey,
        amount: Money,
    ) -> Result<LedgerRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO payment_ledger (id, warehouse_id, district_id, customer_id, amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, warehouse_id, district_id, customer_id, amount, created_at,
                      warehouse_applied, district_applied
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer.warehouse_id)
        .bind(customer.district_id)
        .bind(customer.customer_id)
        .bind(amount.cents())
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_ledger(row)
    }

    async fn mark_warehouse_applied(&mut self, id: LedgerId) -> Result<bool> {
        self.mark_applied(
            "UPDATE payment_ledger SET warehouse_applied = TRUE WHERE id = $1 AND NOT warehouse_applied",
            id,
        )
        .await
    }

    async fn mark_district_applied(&mut self, id: LedgerId) -> Result<bool> {
        self.mark_applied(
            "UPDATE payment_ledger SET district_applied = TRUE WHERE id = $1 AND NOT district_applied",
            id,
        )
        .await
    }

    async fn lock_ledger_after(
        &mut self,
        district: DistrictKey,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit_rows: usize,
    ) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, warehouse_id, district_id, customer_id, amount, created_at,
                   warehouse_applied, district_applied
            FROM payment_ledger
            WHERE warehouse_id = $1 AND district_id = $2
              AND (created_at > $3
                   OR (created_at = $3 AND NOT (warehouse_applied AND district_applied)))
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            ORDER BY created_at ASC, id ASC
            LIMIT $5
            FOR UPDATE
            "#,
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .bind(after)
        .bind(until)
        .bind(limit(limit_rows))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_ledger).collect()
    }

    async fn mark_ledger_reconciled(&mut self, id: LedgerId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE payment_ledger SET warehouse_applied = TRUE, district_applied = TRUE WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "mark_ledger_reconciled",
            });
        }
        Ok(())
    }

    async fn warehouse_ytd(&mut self, warehouse_id: i32) -> Result<Money> {
        let ytd: Option<i64> =
            sqlx::query_scalar("SELECT ytd FROM warehouses WHERE warehouse_id = $1")
                .bind(warehouse_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        ytd.map(Money::from_cents)
            .ok_or_else(|| StoreError::not_found("warehouse", warehouse_id))
    }

    async fn district_ytd(&mut self, district: DistrictKey) -> Result<Money> {
        let ytd: Option<i64> = sqlx::query_scalar(
            "SELECT ytd FROM districts WHERE warehouse_id = $1 AND district_id = $2",
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        ytd.map(Money::from_cents)
            .ok_or_else(|| StoreError::not_found("district", district))
    }

    async fn add_warehouse_ytd(&mut self, warehouse_id: i32, delta: Money) -> Result<()> {
        let result = sqlx::query("UPDATE warehouses SET ytd = ytd + $1 WHERE warehouse_id = $2")
            .bind(delta.cents())
            .bind(warehouse_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "add_warehouse_ytd",
            });
        }
        Ok(())
    }

    async fn add_district_ytd(&mut self, district: DistrictKey, delta: Money) -> Result<()> {
        let result = sqlx::query(
            "UPDATE districts SET ytd = ytd + $1 WHERE warehouse_id = $2 AND district_id = $3",
        )
        .bind(delta.cents())
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "add_district_ytd",
            });
        }
        Ok(())
    }

    async fn progress_pointers(&mut self, limit_rows: usize) -> Result<Vec<ProgressPointer>> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, watermark
            FROM payment_pointers
            ORDER BY warehouse_id, district_id
            LIMIT $1
            "#,
        )
        .bind(limit(limit_rows))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ProgressPointer {
                    district: DistrictKey::new(
                        row.try_get("warehouse_id")?,
                        row.try_get("district_id")?,
                    ),
                    watermark: row.try_get("watermark")?,
                })
            })
            .collect()
    }

    async fn advance_progress_pointer(
        &mut self,
        district: DistrictKey,
        watermark: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_pointers
            SET watermark = GREATEST(watermark, $1)
            WHERE warehouse_id = $2 AND district_id = $3
            "#,
        )
        .bind(watermark)
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "advance_progress_pointer",
            });
        }
        Ok(())
    }

    async fn districts(&mut self, warehouse_id: i32) -> Result<Vec<i32>> {
        let ids = sqlx::query_scalar(
            "SELECT district_id FROM districts WHERE warehouse_id = $1 ORDER BY district_id",
        )
        .bind(warehouse_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn claim_next_order_id(&mut self, district: DistrictKey) -> Result<i64> {
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE district_order_ids
            SET next_order_id = next_order_id + 1
            WHERE warehouse_id = $1 AND district_id = $2
            RETURNING next_order_id - 1
            "#,
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        claimed.ok_or(StoreError::ZeroEffect {
            statement: "claim_next_order_id",
        })
    }

    async fn next_order_id(&mut self, district: DistrictKey) -> Result<i64> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_order_id FROM district_order_ids WHERE warehouse_id = $1 AND district_id = $2",
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        next.ok_or_else(|| StoreError::not_found("district order id", district))
    }

    async fn item(&mut self, item_id: i32) -> Result<Option<Item>> {
        let row: Option<PgRow> =
            sqlx::query("SELECT item_id, name, price FROM items WHERE item_id = $1")
                .bind(item_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        match row {
            Some(row) => Ok(Some(Item {
                id: row.try_get("item_id")?,
                name: row.try_get("name")?,
                price: money(&row, "price")?,
            })),
            None => Ok(None),
        }
    }

    async fn lock_stock(&mut self, warehouse_id: i32, item_id: i32) -> Result<Option<StockRow>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT quantity, ytd, order_count, remote_count
            FROM stocks
            WHERE warehouse_id = $1 AND item_id = $2
            FOR UPDATE
            "#,
        )
        .bind(warehouse_id)
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(StockRow {
                warehouse_id,
                item_id,
                quantity: row.try_get("quantity")?,
                ytd: row.try_get("ytd")?,
                order_count: row.try_get("order_count")?,
                remote_count: row.try_get("remote_count")?,
            })),
            None => Ok(None),
        }
    }

    async fn write_stock(&mut self, row: &StockRow) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stocks
            SET quantity = $1, ytd = $2, order_count = $3, remote_count = $4
            WHERE warehouse_id = $5 AND item_id = $6
            "#,
        )
        .bind(row.quantity)
        .bind(row.ytd)
        .bind(row.order_count)
        .bind(row.remote_count)
        .bind(row.warehouse_id)
        .bind(row.item_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "write_stock",
            });
        }
        Ok(())
    }

    async fn revert_stock(&mut self, delta: &StockDelta) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stocks
            SET quantity = quantity - $1,
                ytd = ytd - $2,
                order_count = order_count - $3,
                remote_count = remote_count - $4
            WHERE warehouse_id = $5 AND item_id = $6
            "#,
        )
        .bind(delta.quantity)
        .bind(delta.ytd)
        .bind(delta.order_count)
        .bind(delta.remote_count)
        .bind(delta.warehouse_id)
        .bind(delta.item_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "revert_stock",
            });
        }
        Ok(())
    }

    async fn count_stock_below(
        &mut self,
        warehouse_id: i32,
        item_ids: &[i32],
        threshold: i32,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM stocks
            WHERE warehouse_id = $1 AND item_id = ANY($2) AND quantity < $3
            "#,
        )
        .bind(warehouse_id)
        .bind(item_ids)
        .bind(threshold)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn insert_order(&mut self, order: &NewOrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (warehouse_id, district_id, order_id, customer_id, carrier_id,
                                line_count, all_local, entered_at)
            VALUES ($1, $2, $3, $4, NULL, $5, $6, $7)
            "#,
        )
        .bind(order.key.warehouse_id)
        .bind(order.key.district_id)
        .bind(order.key.order_id)
        .bind(order.customer_id)
        .bind(order.line_count)
        .bind(order.all_local)
        .bind(order.entered_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_order_line(&mut self, line: &OrderLineRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_lines (warehouse_id, district_id, order_id, line_number, item_id,
                                     item_name, supply_warehouse_id, quantity, amount, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(line.order.warehouse_id)
        .bind(line.order.district_id)
        .bind(line.order.order_id)
        .bind(line.number)
        .bind(line.item_id)
        .bind(&line.item_name)
        .bind(line.supply_warehouse_id)
        .bind(line.quantity)
        .bind(line.amount.cents())
        .bind(line.delivered_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_order(&mut self, key: OrderKey) -> Result<Option<OrderRow>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, order_id, customer_id, carrier_id,
                   line_count, all_local, entered_at
            FROM orders
            WHERE warehouse_id = $1 AND district_id = $2 AND order_id = $3
            FOR UPDATE
            "#,
        )
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn order(&mut self, key: OrderKey) -> Result<Option<OrderRow>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, order_id, customer_id, carrier_id,
                   line_count, all_local, entered_at
            FROM orders
            WHERE warehouse_id = $1 AND district_id = $2 AND order_id = $3
            "#,
        )
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn orders_between(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, order_id, customer_id, carrier_id,
                   line_count, all_local, entered_at
            FROM orders
            WHERE warehouse_id = $1 AND district_id = $2
              AND order_id >= $3 AND order_id < $4
            ORDER BY order_id
            "#,
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .bind(from_order)
        .bind(to_order)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_order).collect()
    }

    async fn customer_order_ids(&mut self, customer: CustomerKey) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT order_id
            FROM orders
            WHERE warehouse_id = $1 AND district_id = $2 AND customer_id = $3
            ORDER BY order_id
            "#,
        )
        .bind(customer.warehouse_id)
        .bind(customer.district_id)
        .bind(customer.customer_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn orders_sharing_items(
        &mut self,
        excluded_warehouse: i32,
        item_ids: &[i32],
        min_shared: usize,
    ) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query(
            r#"
            SELECT o.warehouse_id, o.district_id, o.order_id, o.customer_id, o.carrier_id,
                   o.line_count, o.all_local, o.entered_at
            FROM orders o
            JOIN order_lines ol
              ON ol.warehouse_id = o.warehouse_id
             AND ol.district_id = o.district_id
             AND ol.order_id = o.order_id
            WHERE o.warehouse_id <> $1 AND ol.item_id = ANY($2)
            GROUP BY o.warehouse_id, o.district_id, o.order_id
            HAVING COUNT(DISTINCT ol.item_id) >= $3
            ORDER BY o.warehouse_id, o.district_id, o.order_id
            "#,
        )
        .bind(excluded_warehouse)
        .bind(item_ids)
        .bind(limit(min_shared))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_order).collect()
    }

    async fn set_order_carrier(&mut self, key: OrderKey, carrier_id: i32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET carrier_id = $1
            WHERE warehouse_id = $2 AND district_id = $3 AND order_id = $4
              AND carrier_id IS NULL
            "#,
        )
        .bind(carrier_id)
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.order_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ZeroEffect {
                statement: "set_order_carrier",
            });
        }
        Ok(())
    }

    async fn deliver_order_lines(&mut self, key: OrderKey, at: DateTime<Utc>) -> Result<Money> {
        let amounts: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE order_lines
            SET delivered_at = $1
            WHERE warehouse_id = $2 AND district_id = $3 AND order_id = $4
            RETURNING amount
            "#,
        )
        .bind(at)
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.order_id)
        .fetch_all(&mut *self.tx)
        .await?;

        if amounts.is_empty() {
            return Err(StoreError::ZeroEffect {
                statement: "deliver_order_lines",
            });
        }
        Ok(amounts.into_iter().map(Money::from_cents).sum())
    }

    async fn order_lines(&mut self, key: OrderKey) -> Result<Vec<OrderLineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, district_id, order_id, line_number, item_id, item_name,
                   supply_warehouse_id, quantity, amount, delivered_at
            FROM order_lines
            WHERE warehouse_id = $1 AND district_id = $2 AND order_id = $3
            ORDER BY line_number
            "#,
        )
        .bind(key.warehouse_id)
        .bind(key.district_id)
        .bind(key.order_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_order_line).collect()
    }

    async fn ordered_items(
        &mut self,
        district: DistrictKey,
        from_order: i64,
        to_order: i64,
    ) -> Result<Vec<i32>> {
        let items = sqlx::query_scalar(
            r#"
            SELECT DISTINCT item_id
            FROM order_lines
            WHERE warehouse_id = $1 AND district_id = $2
              AND order_id >= $3 AND order_id < $4
            ORDER BY item_id
            "#,
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .bind(from_order)
        .bind(to_order)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(items)
    }

    async fn delivery_cursor(&mut self, district: DistrictKey) -> Result<i64> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT next_order_id FROM delivery_cursors WHERE warehouse_id = $1 AND district_id = $2",
        )
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        cursor.ok_or_else(|| StoreError::not_found("delivery cursor", district))
    }

    async fn raise_delivery_cursor(&mut self, district: DistrictKey, next: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_cursors
            SET next_order_id = $1
            WHERE warehouse_id = $2 AND district_id = $3 AND next_order_id < $1
            "#,
        )
        .bind(next)
        .bind(district.warehouse_id)
        .bind(district.district_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
