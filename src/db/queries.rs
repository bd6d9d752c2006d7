use anyhow::{Context, Result};
use sqlx::{Pool, Sqlite};

use crate::db::models::{Card, CreateCardData, Hit, Refund};

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub fn random_otp() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub async fn create_card(
    pool: &Pool<Sqlite>,
    data: &CreateCardData,
    wallet_id: &str,
) -> Result<Card> {
    let card_id = random_id().to_uppercase();
    let external_id = random_id();

    sqlx::query(
        "INSERT INTO cards (
            id, wallet, card_name, uid, external_id, counter,
            tx_limit, daily_limit, monthly_limit, limit_type,
            pin_limit, pin_try, pin, pin_enable,
            enable, expires_on,
            k0, k1, k2, prev_k0, prev_k1, prev_k2, otp
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&card_id)
    .bind(wallet_id)
    .bind(&data.card_name)
    .bind(data.uid.to_uppercase())
    .bind(&external_id)
    .bind(data.counter)
    .bind(data.tx_limit)
    .bind(data.daily_limit)
    .bind(data.monthly_limit)
    .bind(data.limit_type)
    .bind(data.pin_limit)
    .bind(&data.pin)
    .bind(data.pin_enable)
    .bind(data.enable)
    .bind(&data.expires_on)
    .bind(&data.k0)
    .bind(&data.k1)
    .bind(&data.k2)
    .bind(&data.prev_k0)
    .bind(&data.prev_k1)
    .bind(&data.prev_k2)
    .bind(random_otp())
    .execute(pool)
    .await?;

    get_card(pool, &card_id)
        .await?
        .context("newly created card couldn't be retrieved")
}

pub async fn get_card(pool: &Pool<Sqlite>, card_id: &str) -> Result<Option<Card>> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE id = ?")
        .bind(card_id)
        .fetch_optional(pool)
        .await?;
    Ok(card)
}

pub async fn get_card_by_uid(pool: &Pool<Sqlite>, uid: &str) -> Result<Option<Card>> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE uid = ?")
        .bind(uid.to_uppercase())
        .fetch_optional(pool)
        .await?;
    Ok(card)
}

pub async fn get_card_by_external_id(
    pool: &Pool<Sqlite>,
    external_id: &str,
) -> Result<Option<Card>> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE external_id = ?")
        .bind(external_id.to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(card)
}

pub async fn get_card_by_otp(pool: &Pool<Sqlite>, otp: &str) -> Result<Option<Card>> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE otp = ?")
        .bind(otp)
        .fetch_optional(pool)
        .await?;
    Ok(card)
}

pub async fn get_cards(pool: &Pool<Sqlite>, wallet_ids: &[String]) -> Result<Vec<Card>> {
    if wallet_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; wallet_ids.len()].join(", ");
    let sql = format!("SELECT * FROM cards WHERE wallet IN ({placeholders})");
    let mut query = sqlx::query_as::<_, Card>(&sql);
    for wallet_id in wallet_ids {
        query = query.bind(wallet_id);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Whole-record replace of a card's updatable columns. `wallet`,
/// `external_id` and `otp` are deliberately not written here.
pub async fn update_card(pool: &Pool<Sqlite>, card: &Card) -> Result<()> {
    sqlx::query(
        "UPDATE cards SET
            card_name = ?, uid = ?, counter = ?,
            tx_limit = ?, daily_limit = ?, monthly_limit = ?, limit_type = ?,
            pin_limit = ?, pin_try = ?, pin = ?, pin_enable = ?,
            enable = ?, expires_on = ?,
            k0 = ?, k1 = ?, k2 = ?, prev_k0 = ?, prev_k1 = ?, prev_k2 = ?
        WHERE id = ?",
    )
    .bind(&card.card_name)
    .bind(card.uid.to_uppercase())
    .bind(card.counter)
    .bind(card.tx_limit)
    .bind(card.daily_limit)
    .bind(card.monthly_limit)
    .bind(card.limit_type)
    .bind(card.pin_limit)
    .bind(card.pin_try)
    .bind(&card.pin)
    .bind(card.pin_enable)
    .bind(card.enable)
    .bind(&card.expires_on)
    .bind(&card.k0)
    .bind(&card.k1)
    .bind(&card.k2)
    .bind(&card.prev_k0)
    .bind(&card.prev_k1)
    .bind(&card.prev_k2)
    .bind(&card.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a card together with its hits and their refunds.
pub async fn delete_card(pool: &Pool<Sqlite>, card_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM refunds WHERE hit_id IN (SELECT id FROM hits WHERE card_id = ?)")
        .bind(card_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM hits WHERE card_id = ?")
        .bind(card_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM cards WHERE id = ?")
        .bind(card_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Advance a card's tap counter, but only forward. Returns false when the
/// stored counter is already at or past `counter` — the losing side of a
/// replay race sees that as a rejection.
pub async fn advance_card_counter(
    pool: &Pool<Sqlite>,
    card_id: &str,
    counter: i64,
) -> Result<bool> {
    let result = sqlx::query("UPDATE cards SET counter = ? WHERE id = ? AND counter < ?")
        .bind(counter)
        .bind(card_id)
        .bind(counter)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Enable or disable a card. Re-enabling clears the PIN try counter in
/// the same statement.
pub async fn enable_disable_card(
    pool: &Pool<Sqlite>,
    card_id: &str,
    enable: bool,
) -> Result<Option<Card>> {
    sqlx::query(
        "UPDATE cards SET enable = ?1, pin_try = CASE WHEN ?1 THEN 0 ELSE pin_try END
         WHERE id = ?2",
    )
    .bind(enable)
    .bind(card_id)
    .execute(pool)
    .await?;
    get_card(pool, card_id).await
}

pub async fn update_card_otp(pool: &Pool<Sqlite>, card_id: &str, otp: &str) -> Result<()> {
    sqlx::query("UPDATE cards SET otp = ? WHERE id = ?")
        .bind(otp)
        .bind(card_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_card_pin_try(
    pool: &Pool<Sqlite>,
    card_id: &str,
    pin_try: i64,
) -> Result<()> {
    sqlx::query("UPDATE cards SET pin_try = ? WHERE id = ?")
        .bind(pin_try)
        .bind(card_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_hit(
    pool: &Pool<Sqlite>,
    card_id: &str,
    ip: &str,
    useragent: &str,
    old_ctr: i64,
    new_ctr: i64,
) -> Result<Hit> {
    let hit_id = random_id();
    sqlx::query(
        "INSERT INTO hits (id, card_id, ip, useragent, spent, old_ctr, new_ctr, amount)
         VALUES (?, ?, ?, ?, FALSE, ?, ?, 0)",
    )
    .bind(&hit_id)
    .bind(card_id)
    .bind(ip)
    .bind(useragent)
    .bind(old_ctr)
    .bind(new_ctr)
    .execute(pool)
    .await?;

    get_hit(pool, &hit_id)
        .await?
        .context("newly recorded hit couldn't be retrieved")
}

pub async fn get_hit(pool: &Pool<Sqlite>, hit_id: &str) -> Result<Option<Hit>> {
    let hit = sqlx::query_as::<_, Hit>("SELECT * FROM hits WHERE id = ?")
        .bind(hit_id)
        .fetch_optional(pool)
        .await?;
    Ok(hit)
}

pub async fn get_hits(pool: &Pool<Sqlite>, card_ids: &[String]) -> Result<Vec<Hit>> {
    if card_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; card_ids.len()].join(", ");
    let sql = format!("SELECT * FROM hits WHERE card_id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, Hit>(&sql);
    for card_id in card_ids {
        query = query.bind(card_id);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Sum of spent hit amounts for the current UTC calendar day, in both
/// recorded denominations.
pub async fn spent_totals_today(pool: &Pool<Sqlite>, card_id: &str) -> Result<(i64, f64)> {
    let row: (i64, f64) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0), COALESCE(SUM(fiat_amount), 0.0)
         FROM hits WHERE card_id = ? AND spent = TRUE AND date(time) = date('now')",
    )
    .bind(card_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Same as [`spent_totals_today`] over the current UTC calendar month.
pub async fn spent_totals_this_month(
    pool: &Pool<Sqlite>,
    card_id: &str,
) -> Result<(i64, f64)> {
    let row: (i64, f64) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0), COALESCE(SUM(fiat_amount), 0.0)
         FROM hits WHERE card_id = ? AND spent = TRUE
           AND strftime('%Y-%m', time) = strftime('%Y-%m', 'now')",
    )
    .bind(card_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Transition a hit to spent and record the settled amount. The WHERE
/// clause on `spent` makes this the single-winner gate for concurrent
/// claims: only one caller can observe a true return.
pub async fn spend_hit(
    pool: &Pool<Sqlite>,
    hit_id: &str,
    amount: i64,
    fiat_amount: Option<f64>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE hits SET spent = TRUE, amount = ?, fiat_amount = ?
         WHERE id = ? AND spent = FALSE",
    )
    .bind(amount)
    .bind(fiat_amount)
    .bind(hit_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn link_hit(pool: &Pool<Sqlite>, hit_id: &str, payment_hash: &str) -> Result<()> {
    sqlx::query("UPDATE hits SET payment_hash = ? WHERE id = ?")
        .bind(payment_hash)
        .bind(hit_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a refund for a hit. Keyed by the settling payment's hash, so a
/// redelivered settlement event is a no-op; returns whether a row was
/// actually inserted.
pub async fn create_refund(
    pool: &Pool<Sqlite>,
    hit_id: &str,
    refund_amount: i64,
    payment_hash: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO refunds (id, hit_id, refund_amount, payment_hash)
         VALUES (?, ?, ?, ?)",
    )
    .bind(random_id())
    .bind(hit_id)
    .bind(refund_amount)
    .bind(payment_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_refunds(pool: &Pool<Sqlite>, hit_ids: &[String]) -> Result<Vec<Refund>> {
    if hit_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; hit_ids.len()].join(", ");
    let sql = format!("SELECT * FROM refunds WHERE hit_id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, Refund>(&sql);
    for hit_id in hit_ids {
        query = query.bind(hit_id);
    }
    Ok(query.fetch_all(pool).await?)
}
