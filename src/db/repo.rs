use super::model::{DerivedFields, FlaggedRow, ProductRecord};
use crate::model::Availability;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, ensure the parent directory exists.
/// Leaves in-memory URLs and non-sqlite schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let path_part = rest.split('?').next().unwrap_or(rest);
    if !path_part.is_empty() {
        if let Some(parent) = std::path::Path::new(path_part).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
    url.to_string()
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Close the pool. Safe to call more than once; a close on an already-closed
/// pool is a logged no-op so cleanup paths can overlap.
pub async fn close_pool(pool: &Pool) {
    if pool.is_closed() {
        warn!("pool already closed; ignoring redundant close");
        return;
    }
    pool.close().await;
    info!("database pool closed");
}

fn row_to_product(row: &SqliteRow) -> Result<ProductRecord> {
    let availability: String = row.get("availability");
    let availability = Availability::parse(&availability)
        .with_context(|| format!("row has unknown availability '{availability}'"))?;
    Ok(ProductRecord {
        source_id: row.get("source_id"),
        sku: row.get("sku"),
        listing_sku: row.get("listing_sku"),
        price: row.get("price"),
        freight_cost: row.get("freight_cost"),
        total_price: row.get("total_price"),
        quantity: row.get("quantity"),
        availability,
        omd_handling_days: row.get("omd_handling_days"),
        supplier_handling_days: row.get("supplier_handling_days"),
        combined_handling_days: row.get("combined_handling_days"),
        update_flag: row.get("update_flag"),
        last_checked_at: row.try_get("last_checked_at").ok(),
    })
}

const PRODUCT_COLUMNS: &str = "source_id, sku, listing_sku, price, freight_cost, total_price, \
     quantity, availability, omd_handling_days, supplier_handling_days, \
     combined_handling_days, update_flag, last_checked_at";

#[instrument(skip_all)]
pub async fn products_for_source(pool: &Pool, source_id: &str) -> Result<Vec<ProductRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE source_id = ? ORDER BY sku"
    ))
    .bind(source_id)
    .fetch_all(pool)
    .await
    .context("failed to load products for source")?;
    rows.iter().map(row_to_product).collect()
}

pub async fn get_product(pool: &Pool, source_id: &str, sku: &str) -> Result<Option<ProductRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE source_id = ? AND sku = ?"
    ))
    .bind(source_id)
    .bind(sku)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_product).transpose()
}

/// Record a fetch attempt without changing product state.
#[instrument(skip_all)]
pub async fn touch_last_checked(pool: &Pool, source_id: &str, sku: &str) -> Result<()> {
    sqlx::query("UPDATE products SET last_checked_at = ? WHERE source_id = ? AND sku = ?")
        .bind(Utc::now())
        .bind(source_id)
        .bind(sku)
        .execute(pool)
        .await
        .context("failed to touch last_checked_at")?;
    Ok(())
}

/// Persist freshly derived fields for a changed row and mark it pending
/// submission with the source's flag value.
#[instrument(skip_all)]
pub async fn apply_derived_fields(
    pool: &Pool,
    source_id: &str,
    sku: &str,
    derived: &DerivedFields,
    flag_value: i64,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE products SET price = ?, freight_cost = ?, total_price = ?, quantity = ?, \
         availability = ?, supplier_handling_days = ?, combined_handling_days = ?, \
         update_flag = ?, last_checked_at = ? \
         WHERE source_id = ? AND sku = ?",
    )
    .bind(derived.price)
    .bind(derived.freight_cost)
    .bind(derived.total_price)
    .bind(derived.quantity)
    .bind(derived.availability.as_str())
    .bind(derived.supplier_handling_days)
    .bind(derived.combined_handling_days)
    .bind(flag_value)
    .bind(Utc::now())
    .bind(source_id)
    .bind(sku)
    .execute(pool)
    .await
    .context("failed to persist derived fields")?;
    if updated.rows_affected() == 0 {
        warn!(source_id, sku, "derived-field update matched no rows");
    }
    Ok(())
}

/// Proactively pull a listing when the supplier's endpoint is erroring:
/// quantity 0, out of stock, flagged for submission.
#[instrument(skip_all)]
pub async fn force_out_of_stock(
    pool: &Pool,
    source_id: &str,
    sku: &str,
    flag_value: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE products SET quantity = 0, availability = ?, update_flag = ?, \
         last_checked_at = ? WHERE source_id = ? AND sku = ?",
    )
    .bind(Availability::OutOfStock.as_str())
    .bind(flag_value)
    .bind(Utc::now())
    .bind(source_id)
    .bind(sku)
    .execute(pool)
    .await
    .context("failed to force row out of stock")?;
    Ok(())
}

/// Extract the projection of every row pending submission for a source.
#[instrument(skip_all)]
pub async fn flagged_rows(pool: &Pool, source_id: &str, flag_value: i64) -> Result<Vec<FlaggedRow>> {
    let rows = sqlx::query(
        "SELECT listing_sku, quantity, combined_handling_days FROM products \
         WHERE source_id = ? AND update_flag = ? ORDER BY listing_sku",
    )
    .bind(source_id)
    .bind(flag_value)
    .fetch_all(pool)
    .await
    .context("failed to extract flagged rows")?;
    Ok(rows
        .into_iter()
        .map(|row| FlaggedRow {
            listing_sku: row.get("listing_sku"),
            quantity: row.get("quantity"),
            combined_handling_days: row.get("combined_handling_days"),
        })
        .collect())
}

// SQLite's default host-parameter ceiling is 999; keep chunks comfortably under.
const RESET_CHUNK: usize = 500;

/// Reset `update_flag` to 0 for exactly the listing SKUs of one confirmed
/// batch, scoped by source so another source's pending flag is never touched.
#[instrument(skip_all)]
pub async fn reset_flags(
    pool: &Pool,
    source_id: &str,
    flag_value: i64,
    listing_skus: &[String],
) -> Result<u64> {
    let mut total = 0u64;
    for chunk in listing_skus.chunks(RESET_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE products SET update_flag = 0 \
             WHERE source_id = ? AND update_flag = ? AND listing_sku IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(source_id).bind(flag_value);
        for sku in chunk {
            query = query.bind(sku);
        }
        let res = query
            .execute(pool)
            .await
            .context("failed to reset update flags")?;
        total += res.rows_affected();
    }
    info!(source_id, reset = total, "update flags cleared");
    Ok(total)
}
