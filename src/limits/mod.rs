use sqlx::{Pool, Sqlite};
use thiserror::Error;

use crate::db::models::{Card, Denomination};
use crate::db::queries;
use crate::lightning::LightningBackend;

/// Consecutive wrong PINs before the card is locked.
pub const MAX_PIN_TRIES: i64 = 2;

/// Terminal outcomes of spend authorization. Display strings are the
/// `reason` values returned to the caller.
#[derive(Debug, Error, PartialEq)]
pub enum SpendError {
    #[error("Card is disabled.")]
    CardDisabled,
    #[error("Max daily limit spent.")]
    DailyLimitExceeded,
    #[error("Max monthly limit spent.")]
    MonthlyLimitExceeded,
    #[error("Max transaction limit exceeded.")]
    TxLimitExceeded,
    #[error("PIN required.")]
    PinRequired,
    #[error("Wrong PIN. {remaining} tries left.")]
    WrongPin { remaining: i64 },
    #[error("Card is locked.")]
    CardLocked,
    #[error("Currency conversion failed.")]
    Conversion,
    #[error("Database error.")]
    Storage,
}

fn storage(err: anyhow::Error) -> SpendError {
    tracing::error!("storage failure during spend evaluation: {err:#}");
    SpendError::Storage
}

/// Evaluates a candidate spend against a card's ceilings.
///
/// This is the only component that knows whether a card's ceilings are
/// sats- or fiat-denominated; everything it compares has been converted
/// into the card's configured denomination first.
pub struct SpendEvaluator<'a> {
    pool: &'a Pool<Sqlite>,
    lightning: &'a dyn LightningBackend,
}

impl<'a> SpendEvaluator<'a> {
    pub fn new(pool: &'a Pool<Sqlite>, lightning: &'a dyn LightningBackend) -> Self {
        Self { pool, lightning }
    }

    /// Offer-time check: the final amount is unknown, so only the rolling
    /// day/month aggregates are enforced.
    pub async fn check_aggregates(&self, card: &Card) -> Result<(), SpendError> {
        let (day, month) = self.spent_sums(card).await?;
        if day > card.daily_limit as f64 {
            return Err(SpendError::DailyLimitExceeded);
        }
        if month > card.monthly_limit as f64 {
            return Err(SpendError::MonthlyLimitExceeded);
        }
        Ok(())
    }

    /// Full authorization of a concrete candidate amount, including the
    /// PIN gate. Invoked again at callback time even when an offer-time
    /// check already passed, because the payer chooses the final amount.
    pub async fn authorize(
        &self,
        card: &Card,
        amount_sats: i64,
        pin: Option<&str>,
    ) -> Result<(), SpendError> {
        if !card.enable {
            return Err(SpendError::CardDisabled);
        }

        let candidate = self.denominated(card, amount_sats).await?;
        let (day, month) = self.spent_sums(card).await?;

        if day + candidate > card.daily_limit as f64 {
            return Err(SpendError::DailyLimitExceeded);
        }
        if month + candidate > card.monthly_limit as f64 {
            return Err(SpendError::MonthlyLimitExceeded);
        }
        if candidate > card.tx_limit as f64 {
            return Err(SpendError::TxLimitExceeded);
        }

        if card.pin_enable && candidate >= card.pin_limit as f64 {
            self.check_pin(card, pin).await?;
        }

        Ok(())
    }

    async fn check_pin(&self, card: &Card, pin: Option<&str>) -> Result<(), SpendError> {
        let Some(pin) = pin else {
            return Err(SpendError::PinRequired);
        };

        if pin == card.pin {
            queries::update_card_pin_try(self.pool, &card.id, 0)
                .await
                .map_err(storage)?;
            return Ok(());
        }

        let tries = card.pin_try + 1;
        queries::update_card_pin_try(self.pool, &card.id, tries)
            .await
            .map_err(storage)?;

        if tries >= MAX_PIN_TRIES {
            queries::enable_disable_card(self.pool, &card.id, false)
                .await
                .map_err(storage)?;
            tracing::warn!(card = %card.id, "card locked after repeated wrong PINs");
            return Err(SpendError::CardLocked);
        }

        Err(SpendError::WrongPin {
            remaining: MAX_PIN_TRIES - tries,
        })
    }

    /// Convert a sat amount into the card's limit denomination.
    async fn denominated(&self, card: &Card, amount_sats: i64) -> Result<f64, SpendError> {
        match card.limit_type {
            Denomination::Sats => Ok(amount_sats as f64),
            Denomination::Fiat => self
                .lightning
                .fiat_equivalent(&card.wallet, amount_sats)
                .await
                .map_err(|err| {
                    tracing::warn!(card = %card.id, %err, "fiat rate lookup failed");
                    SpendError::Conversion
                }),
        }
    }

    /// Spent sums for today and this month, in the card's denomination.
    /// Fiat-denominated cards sum the fiat value captured when each hit
    /// settled, not today's rate.
    async fn spent_sums(&self, card: &Card) -> Result<(f64, f64), SpendError> {
        let (day_sats, day_fiat) = queries::spent_totals_today(self.pool, &card.id)
            .await
            .map_err(storage)?;
        let (month_sats, month_fiat) = queries::spent_totals_this_month(self.pool, &card.id)
            .await
            .map_err(storage)?;

        Ok(match card.limit_type {
            Denomination::Sats => (day_sats as f64, month_sats as f64),
            Denomination::Fiat => (day_fiat, month_fiat),
        })
    }
}
