use serde::{Deserialize, Serialize};

use crate::crypto::ZERO_KEY;

/// Whether a card's spend ceilings are denominated in sats or in the
/// wallet's fiat currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Denomination {
    Sats,
    Fiat,
}

impl Default for Denomination {
    fn default() -> Self {
        Self::Sats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Card {
    pub id: String,
    pub wallet: String,
    pub card_name: String,
    pub uid: String,
    pub external_id: String,
    pub counter: i64,
    pub tx_limit: i64,
    pub daily_limit: i64,
    pub monthly_limit: i64,
    pub limit_type: Denomination,
    pub pin_limit: i64,
    pub pin_try: i64,
    pub pin: String,
    pub pin_enable: bool,
    pub enable: bool,
    pub expires_on: Option<String>,
    pub k0: String,
    pub k1: String,
    pub k2: String,
    pub prev_k0: String,
    pub prev_k1: String,
    pub prev_k2: String,
    pub otp: String,
    pub time: String,
}

impl Card {
    /// Merge an update payload into this card, field by field.
    ///
    /// Only the fields named here can be changed through the update API;
    /// in particular `wallet`, `id`, `external_id` and `otp` are never
    /// taken from the payload.
    pub fn apply_update(&mut self, data: &CreateCardData) {
        self.card_name = data.card_name.clone();
        self.uid = data.uid.to_uppercase();
        self.counter = data.counter;
        self.tx_limit = data.tx_limit;
        self.daily_limit = data.daily_limit;
        self.monthly_limit = data.monthly_limit;
        self.limit_type = data.limit_type;
        self.pin_limit = data.pin_limit;
        self.pin = data.pin.clone();
        self.pin_enable = data.pin_enable;
        self.enable = data.enable;
        self.expires_on = data.expires_on.clone();
        self.k0 = data.k0.clone();
        self.k1 = data.k1.clone();
        self.k2 = data.k2.clone();
        self.prev_k0 = data.prev_k0.clone();
        self.prev_k1 = data.prev_k1.clone();
        self.prev_k2 = data.prev_k2.clone();
    }
}

fn zero_key() -> String {
    ZERO_KEY.to_string()
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCardData {
    pub card_name: String,
    pub uid: String,
    #[serde(default)]
    pub counter: i64,
    #[serde(default)]
    pub tx_limit: i64,
    #[serde(default)]
    pub daily_limit: i64,
    #[serde(default)]
    pub monthly_limit: i64,
    #[serde(default)]
    pub limit_type: Denomination,
    #[serde(default)]
    pub pin_limit: i64,
    #[serde(default)]
    pub pin: String,
    #[serde(default)]
    pub pin_enable: bool,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub expires_on: Option<String>,
    #[serde(default = "zero_key")]
    pub k0: String,
    #[serde(default = "zero_key")]
    pub k1: String,
    #[serde(default = "zero_key")]
    pub k2: String,
    #[serde(default = "zero_key")]
    pub prev_k0: String,
    #[serde(default = "zero_key")]
    pub prev_k1: String,
    #[serde(default = "zero_key")]
    pub prev_k2: String,
}

/// One accepted tap. Immutable after creation except for the single
/// spent transition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Hit {
    pub id: String,
    pub card_id: String,
    pub ip: String,
    pub useragent: String,
    pub spent: bool,
    pub old_ctr: i64,
    pub new_ctr: i64,
    pub amount: i64,
    pub fiat_amount: Option<f64>,
    pub payment_hash: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Refund {
    pub id: String,
    pub hit_id: String,
    pub refund_amount: i64,
    pub payment_hash: Option<String>,
    pub time: String,
}
