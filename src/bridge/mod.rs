use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use thiserror::Error;

use crate::config::Config;
use crate::db::models::{Card, Denomination, Hit};
use crate::db::queries;
use crate::lightning::{Invoice, LightningBackend};
use crate::limits::{SpendError, SpendEvaluator};
use crate::validation::{self, TapError};

/// Terminal outcomes of the withdraw/pay legs. `Internal` marks broken
/// invariants and surfaces as a server error instead of a typed reason.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Tap(#[from] TapError),
    #[error(transparent)]
    Spend(#[from] SpendError),
    #[error("LNURL-withdraw record not found.")]
    WithdrawRecordNotFound,
    #[error("LNURL-pay record not found.")]
    PayRecordNotFound,
    #[error("Missing K1 token")]
    MissingK1,
    #[error("K1 token does not match.")]
    K1Mismatch,
    #[error("Payment already claimed.")]
    AlreadyClaimed,
    #[error("Missing payment request.")]
    MissingPaymentRequest,
    #[error("Failed to decode payment request.")]
    InvalidPaymentRequest,
    #[error("Invoice has no amount.")]
    NoAmount,
    #[error("Missing amount.")]
    MissingAmount,
    #[error("Amount too low.")]
    AmountTooLow,
    #[error("Amount too high.")]
    AmountTooHigh,
    #[error("Card not found.")]
    CardNotFound,
    #[error("Card is disabled.")]
    CardDisabled,
    #[error("Payment failed - {0}")]
    PaymentFailed(String),
    #[error("Database error.")]
    Storage,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn storage(err: anyhow::Error) -> BridgeError {
    tracing::error!("storage failure in withdraw/pay bridge: {err:#}");
    BridgeError::Storage
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawOffer {
    pub tag: &'static str,
    pub callback: String,
    pub k1: String,
    pub min_withdrawable: u64,
    pub max_withdrawable: u64,
    pub default_description: String,
    /// LUD-19: the refund lnurlp endpoint for this hit.
    pub pay_link: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayOffer {
    pub tag: &'static str,
    pub callback: String,
    pub metadata: String,
    pub min_sendable: u64,
    pub max_sendable: u64,
}

fn refund_metadata() -> String {
    serde_json::json!([["text/plain", "Refund"]]).to_string()
}

/// Offer leg: one verified tap becomes one unspent hit and a withdraw
/// offer keyed by it.
pub async fn request_offer(
    pool: &Pool<Sqlite>,
    lightning: &dyn LightningBackend,
    config: &Config,
    external_id: &str,
    p: &str,
    c: &str,
    ip: &str,
    useragent: &str,
) -> Result<WithdrawOffer, BridgeError> {
    let tap = validation::verify_tap(pool, external_id, p, c).await?;

    // The final amount is the payer's choice; only the rolling aggregates
    // can be enforced this early.
    SpendEvaluator::new(pool, lightning)
        .check_aggregates(&tap.card)
        .await?;

    let hit = queries::create_hit(
        pool,
        &tap.card.id,
        ip,
        useragent,
        tap.old_counter,
        tap.new_counter,
    )
    .await?;

    tracing::info!(card = %tap.card.id, hit = %hit.id, counter = tap.new_counter, "tap accepted");

    let pay_link = config.pay_link(&hit.id);
    Ok(WithdrawOffer {
        tag: "withdrawRequest",
        callback: config.withdraw_callback_url(&hit.id),
        k1: hit.id.clone(),
        min_withdrawable: 1000,
        max_withdrawable: tap.card.tx_limit as u64 * 1000,
        default_description: format!("Boltcard (refund address {pay_link})"),
        pay_link,
    })
}

/// Callback leg: claim a hit with an invoice. The spent transition is the
/// double-spend gate and happens before payment execution; a failed
/// payment leaves the hit spent so it can never pay out twice.
pub async fn claim_offer(
    pool: &Pool<Sqlite>,
    lightning: &dyn LightningBackend,
    hit_id: &str,
    k1: Option<&str>,
    pr: Option<&str>,
    pin: Option<&str>,
) -> Result<(), BridgeError> {
    let k1 = k1.ok_or(BridgeError::MissingK1)?;
    if k1 != hit_id {
        return Err(BridgeError::K1Mismatch);
    }

    let hit = queries::get_hit(pool, hit_id)
        .await
        .map_err(storage)?
        .ok_or(BridgeError::WithdrawRecordNotFound)?;
    if hit.spent {
        return Err(BridgeError::AlreadyClaimed);
    }

    let pr = pr.ok_or(BridgeError::MissingPaymentRequest)?;
    let invoice = Invoice::from_str(pr).map_err(|_| BridgeError::InvalidPaymentRequest)?;
    let amount_msat = invoice.amount_msats().map_err(|_| BridgeError::NoAmount)?;
    let amount_sats = (amount_msat / 1000) as i64;

    let card = queries::get_card(pool, &hit.card_id)
        .await
        .map_err(storage)?
        .ok_or(BridgeError::CardNotFound)?;

    SpendEvaluator::new(pool, lightning)
        .authorize(&card, amount_sats, pin)
        .await?;

    let fiat_amount = match card.limit_type {
        Denomination::Sats => None,
        Denomination::Fiat => Some(
            lightning
                .fiat_equivalent(&card.wallet, amount_sats)
                .await
                .map_err(|_| BridgeError::Spend(SpendError::Conversion))?,
        ),
    };

    // Single-winner transition; a racing claim sees false here.
    let claimed = queries::spend_hit(pool, &hit.id, amount_sats, fiat_amount)
        .await
        .map_err(storage)?;
    if !claimed {
        return Err(BridgeError::AlreadyClaimed);
    }

    match lightning
        .pay_invoice(&card.wallet, &invoice, card.tx_limit, &hit.id)
        .await
    {
        Ok(payment_hash) => {
            queries::link_hit(pool, &hit.id, &payment_hash)
                .await
                .map_err(storage)?;
            tracing::info!(hit = %hit.id, amount_sats, "withdrawal paid");
            Ok(())
        }
        Err(err) => {
            // Deliberately no rollback: a slow-but-successful payment must
            // not become payable twice. Recovery goes through the refund
            // path.
            tracing::error!(hit = %hit.id, %err, "payment execution failed, hit stays spent");
            Err(BridgeError::PaymentFailed(err.to_string()))
        }
    }
}

/// Tap-verified wallet balance lookup. Consumes a counter like any tap.
pub async fn tap_balance(
    pool: &Pool<Sqlite>,
    lightning: &dyn LightningBackend,
    external_id: &str,
    p: &str,
    c: &str,
) -> Result<i64, BridgeError> {
    let tap = validation::verify_tap(pool, external_id, p, c).await?;
    let balance = lightning
        .wallet_balance(&tap.card.wallet)
        .await
        .map_err(BridgeError::Internal)?;
    Ok(balance)
}

async fn refund_target(pool: &Pool<Sqlite>, hit_id: &str) -> Result<(Hit, Card), BridgeError> {
    let hit = queries::get_hit(pool, hit_id)
        .await
        .map_err(storage)?
        .ok_or(BridgeError::PayRecordNotFound)?;
    let card = queries::get_card(pool, &hit.card_id)
        .await
        .map_err(storage)?
        .ok_or(BridgeError::CardNotFound)?;
    if !card.enable {
        return Err(BridgeError::CardDisabled);
    }
    Ok((hit, card))
}

/// Refund-offer leg: a pay offer anchored to an existing hit. Carries no
/// counter semantics of its own.
pub async fn refund_offer(
    pool: &Pool<Sqlite>,
    config: &Config,
    hit_id: &str,
) -> Result<PayOffer, BridgeError> {
    let (hit, card) = refund_target(pool, hit_id).await?;

    Ok(PayOffer {
        tag: "payRequest",
        callback: config.pay_callback_url(&hit.id),
        metadata: refund_metadata(),
        min_sendable: 1000,
        max_sendable: card.tx_limit as u64 * 1000,
    })
}

/// Refund-callback leg: issue an invoice for the payer-chosen amount,
/// tagged so its settlement is correlated back to the hit.
pub async fn refund_invoice(
    pool: &Pool<Sqlite>,
    lightning: &dyn LightningBackend,
    hit_id: &str,
    amount_msat: Option<u64>,
) -> Result<String, BridgeError> {
    let (hit, card) = refund_target(pool, hit_id).await?;

    let amount_msat = amount_msat.ok_or(BridgeError::MissingAmount)?;
    if amount_msat < 1000 {
        return Err(BridgeError::AmountTooLow);
    }
    if amount_msat > card.tx_limit as u64 * 1000 {
        return Err(BridgeError::AmountTooHigh);
    }

    let created = lightning
        .create_invoice(
            &card.wallet,
            (amount_msat / 1000) as i64,
            &format!("Refund {}", hit.id),
            &refund_metadata(),
            &hit.id,
        )
        .await
        .map_err(BridgeError::Internal)?;

    tracing::info!(hit = %hit.id, amount_msat, payment = %created.payment_hash, "refund invoice issued");
    Ok(created.bolt11)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::models::Card;
    use crate::db::queries::{create_card, get_card, get_hit};
    use crate::db::test_pool;
    use crate::db::test_support::card_data;
    use crate::lightning::MockLightning;
    use crate::lightning::test_support::{TEST_INVOICE, TEST_INVOICE_MSAT, TEST_INVOICE_SATS};
    use std::sync::Arc;

    const TAP_CTR1_P: &str = "40F82631D4E312CCCF457D55C8CD2B1F";
    const TAP_CTR1_C: &str = "F9708EBC6814C248";
    const TAP_CTR2_P: &str = "54E628665A09229B7A7967A77A4F8A1B";
    const TAP_CTR2_C: &str = "8D875A6C68EEC0AB";

    async fn seed_card(pool: &Pool<Sqlite>) -> Card {
        create_card(pool, &card_data("bridge", "01020304050607"), "w1")
            .await
            .unwrap()
    }

    async fn offer(
        pool: &Pool<Sqlite>,
        lightning: &MockLightning,
        card: &Card,
        p: &str,
        c: &str,
    ) -> WithdrawOffer {
        request_offer(
            pool,
            lightning,
            &test_config(),
            &card.external_id,
            p,
            c,
            "127.0.0.1",
            "tests",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn tap_yields_offer_and_replay_fails() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;

        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;
        assert_eq!(offer.tag, "withdrawRequest");
        assert_eq!(offer.min_withdrawable, 1000);
        assert_eq!(offer.max_withdrawable, card.tx_limit as u64 * 1000);
        assert!(offer.callback.ends_with(&format!("/lnurl/cb/{}", offer.k1)));
        assert!(offer.pay_link.starts_with("lnurlp://"));

        let hit = get_hit(&pool, &offer.k1).await.unwrap().unwrap();
        assert_eq!(hit.old_ctr, 0);
        assert_eq!(hit.new_ctr, 1);
        assert!(!hit.spent);

        let err = request_offer(
            &pool,
            &lightning,
            &test_config(),
            &card.external_id,
            TAP_CTR1_P,
            TAP_CTR1_C,
            "127.0.0.1",
            "tests",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Tap(TapError::Replayed)));
    }

    #[tokio::test]
    async fn offer_refused_when_daily_budget_gone() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let mut data = card_data("bridge", "01020304050607");
        data.daily_limit = 100;
        let card = create_card(&pool, &data, "w1").await.unwrap();

        let first = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;
        queries::spend_hit(&pool, &first.k1, 200, None).await.unwrap();

        let err = request_offer(
            &pool,
            &lightning,
            &test_config(),
            &card.external_id,
            TAP_CTR2_P,
            TAP_CTR2_C,
            "127.0.0.1",
            "tests",
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Spend(SpendError::DailyLimitExceeded)
        ));
    }

    #[tokio::test]
    async fn claim_pays_and_links_the_hit() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap();

        let hit = get_hit(&pool, &offer.k1).await.unwrap().unwrap();
        assert!(hit.spent);
        assert_eq!(hit.amount, TEST_INVOICE_SATS);
        assert!(hit.payment_hash.is_some());

        let payments = lightning.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].hit_id, offer.k1);
        assert_eq!(payments[0].wallet_id, "w1");
        assert_eq!(payments[0].amount_msat, TEST_INVOICE_MSAT);
    }

    #[tokio::test]
    async fn second_claim_is_rejected() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap();

        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyClaimed));
        assert_eq!(lightning.payments().len(), 1);
    }

    #[tokio::test]
    async fn racing_claims_have_one_winner() {
        let pool = test_pool().await;
        let lightning = Arc::new(MockLightning::new());
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            let lightning = lightning.clone();
            let hit_id = offer.k1.clone();
            tasks.push(tokio::spawn(async move {
                claim_offer(
                    &pool,
                    lightning.as_ref(),
                    &hit_id,
                    Some(hit_id.as_str()),
                    Some(TEST_INVOICE),
                    None,
                )
                .await
            }));
        }

        let mut ok = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(BridgeError::AlreadyClaimed) => already += 1,
                Err(other) => panic!("unexpected outcome: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already, 1);
        assert_eq!(lightning.payments().len(), 1);
    }

    #[tokio::test]
    async fn failed_payment_keeps_hit_spent() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        lightning.fail_payments();
        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::PaymentFailed(_)));

        let hit = get_hit(&pool, &offer.k1).await.unwrap().unwrap();
        assert!(hit.spent);

        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyClaimed));
    }

    #[tokio::test]
    async fn claim_validates_its_inputs() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        let err = claim_offer(&pool, &lightning, &offer.k1, None, Some(TEST_INVOICE), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingK1));

        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some("other"),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::K1Mismatch));

        let err = claim_offer(&pool, &lightning, &offer.k1, Some(offer.k1.as_str()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingPaymentRequest));

        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some("lnbc-not-an-invoice"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPaymentRequest));

        let err = claim_offer(
            &pool,
            &lightning,
            "missing",
            Some("missing"),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::WithdrawRecordNotFound));
    }

    #[tokio::test]
    async fn claim_enforces_pin_gate() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let mut data = card_data("bridge", "01020304050607");
        data.pin_enable = true;
        data.pin_limit = 1;
        data.pin = "4321".to_string();
        let card = create_card(&pool, &data, "w1").await.unwrap();
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        let err = claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Spend(SpendError::PinRequired)));

        claim_offer(
            &pool,
            &lightning,
            &offer.k1,
            Some(offer.k1.as_str()),
            Some(TEST_INVOICE),
            Some("4321"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn refund_legs_enforce_bounds() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;
        let offer = offer(&pool, &lightning, &card, TAP_CTR1_P, TAP_CTR1_C).await;

        let pay = refund_offer(&pool, &test_config(), &offer.k1).await.unwrap();
        assert_eq!(pay.tag, "payRequest");
        assert_eq!(pay.min_sendable, 1000);
        assert_eq!(pay.max_sendable, card.tx_limit as u64 * 1000);

        let err = refund_invoice(&pool, &lightning, &offer.k1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingAmount));

        let err = refund_invoice(&pool, &lightning, &offer.k1, Some(999))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AmountTooLow));

        let err = refund_invoice(
            &pool,
            &lightning,
            &offer.k1,
            Some(card.tx_limit as u64 * 1000 + 1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::AmountTooHigh));

        let pr = refund_invoice(&pool, &lightning, &offer.k1, Some(21_000))
            .await
            .unwrap();
        assert!(!pr.is_empty());

        let err = refund_offer(&pool, &test_config(), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PayRecordNotFound));
    }

    #[tokio::test]
    async fn balance_is_tap_gated() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = seed_card(&pool).await;

        let balance = tap_balance(&pool, &lightning, &card.external_id, TAP_CTR1_P, TAP_CTR1_C)
            .await
            .unwrap();
        assert!(balance > 0);

        // The counter is consumed; the same payload cannot be reused.
        let err = tap_balance(&pool, &lightning, &card.external_id, TAP_CTR1_P, TAP_CTR1_C)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Tap(TapError::Replayed)));

        let card = get_card(&pool, &card.id).await.unwrap().unwrap();
        assert_eq!(card.counter, 1);
    }
}
