use chrono::{NaiveDate, Utc};
use sqlx::{Pool, Sqlite};
use thiserror::Error;

use crate::crypto::{self, AesKey};
use crate::db::{models::Card, queries};

/// Terminal outcomes of tap verification. Display strings are the
/// `reason` values returned to the tapping device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TapError {
    #[error("Card not found.")]
    CardNotFound,
    #[error("Card is disabled.")]
    CardDisabled,
    #[error("Card is expired.")]
    CardExpired,
    #[error("Error decrypting card.")]
    Decrypt,
    #[error("Card UID mis-match.")]
    UidMismatch,
    #[error("CMAC does not check.")]
    MacMismatch,
    #[error("This link is already used.")]
    Replayed,
    #[error("Database error.")]
    Storage,
}

/// A tap that passed every check; its counter value has already been
/// persisted onto the card.
#[derive(Debug)]
pub struct VerifiedTap {
    pub card: Card,
    pub old_counter: i64,
    pub new_counter: i64,
}

fn storage(err: anyhow::Error) -> TapError {
    tracing::error!("storage failure during tap verification: {err:#}");
    TapError::Storage
}

fn is_expired(card: &Card) -> bool {
    let Some(expires_on) = card.expires_on.as_deref().filter(|s| !s.is_empty()) else {
        return false;
    };
    match NaiveDate::parse_from_str(expires_on, "%Y-%m-%d") {
        // The card stops working at the start of the expiry day.
        Ok(date) => date <= Utc::now().date_naive(),
        Err(err) => {
            tracing::warn!(card = %card.id, %err, "unparseable expiry date, treating as unset");
            false
        }
    }
}

/// Verify one tap end to end: resolve the card, decrypt and authenticate
/// the SUN payload, and enforce the strictly-increasing counter.
///
/// The counter is persisted through a conditional single-row update
/// *before* this returns, so a concurrent request carrying the same
/// counter value cannot also succeed.
pub async fn verify_tap(
    pool: &Pool<Sqlite>,
    external_id: &str,
    p: &str,
    c: &str,
) -> Result<VerifiedTap, TapError> {
    // Some wallets lowercase query params before forwarding them.
    let p = p.to_uppercase();
    let c = c.to_uppercase();

    let card = queries::get_card_by_external_id(pool, external_id)
        .await
        .map_err(storage)?
        .ok_or(TapError::CardNotFound)?;

    if !card.enable {
        return Err(TapError::CardDisabled);
    }
    if is_expired(&card) {
        return Err(TapError::CardExpired);
    }

    let k1 = AesKey::from_hex(&card.k1).map_err(|_| TapError::Decrypt)?;
    let p_bytes = hex::decode(&p).map_err(|_| TapError::Decrypt)?;
    let (uid, counter) = crypto::decrypt_sun(&k1, &p_bytes).map_err(|_| TapError::Decrypt)?;

    if !uid.matches_hex(&card.uid) {
        return Err(TapError::UidMismatch);
    }

    let k2 = AesKey::from_hex(&card.k2).map_err(|_| TapError::Decrypt)?;
    if hex::encode_upper(crypto::sun_mac(&k2, &uid, &counter)) != c {
        return Err(TapError::MacMismatch);
    }

    let new_counter = i64::from(counter.value());
    if new_counter <= card.counter {
        return Err(TapError::Replayed);
    }

    // The conditional update is the serialization point: of two racing
    // requests with the same counter, exactly one advances the row.
    let advanced = queries::advance_card_counter(pool, &card.id, new_counter)
        .await
        .map_err(storage)?;
    if !advanced {
        return Err(TapError::Replayed);
    }

    Ok(VerifiedTap {
        old_counter: card.counter,
        new_counter,
        card,
    })
}
