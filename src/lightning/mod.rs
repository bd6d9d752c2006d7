use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Newtype wrapper around Bolt11Invoice for convenience methods
#[derive(Debug, Clone)]
pub struct Invoice(Bolt11Invoice);

impl FromStr for Invoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s)
            .map(Self)
            .map_err(|e| anyhow!("Invalid invoice: {}", e))
    }
}

impl Invoice {
    pub fn amount_msats(&self) -> Result<u64> {
        self.0
            .amount_milli_satoshis()
            .ok_or_else(|| anyhow!("Invoice must have an amount"))
    }

    pub fn payment_hash(&self) -> String {
        hex::encode(self.0.payment_hash().as_ref() as &[u8])
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An invoice issued by the settlement engine on our behalf.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub payment_hash: String,
    pub bolt11: String,
}

/// One settled payment, as delivered on the settlement event stream.
#[derive(Debug, Clone)]
pub struct SettlementEvent {
    pub payment_hash: String,
    pub amount_msat: u64,
    /// Hit id this payment refunds, when the invoice was created through
    /// the refund leg.
    pub refund_hit: Option<String>,
    /// Set once the refund listener has recorded this settlement.
    pub processed: bool,
}

/// The custodial settlement engine this service drives. Implemented
/// elsewhere; the mock below stands in for tests and local runs.
#[async_trait]
pub trait LightningBackend: Send + Sync {
    /// Create an invoice on the wallet, tagged so its settlement event can
    /// be correlated back to `refund_hit`.
    async fn create_invoice(
        &self,
        wallet_id: &str,
        amount_sats: i64,
        memo: &str,
        metadata: &str,
        refund_hit: &str,
    ) -> Result<CreatedInvoice>;

    /// Pay an invoice from the wallet, capped at `max_sats`. Returns the
    /// payment hash on success.
    async fn pay_invoice(
        &self,
        wallet_id: &str,
        invoice: &Invoice,
        max_sats: i64,
        hit_id: &str,
    ) -> Result<String>;

    /// Wallet balance in sats.
    async fn wallet_balance(&self, wallet_id: &str) -> Result<i64>;

    /// Fiat value of `amount_sats` at the engine's current rate.
    async fn fiat_equivalent(&self, wallet_id: &str, amount_sats: i64) -> Result<f64>;

    /// Subscribe to settlement events. Each subscriber receives every
    /// event delivered after it subscribed; redelivery is possible.
    fn subscribe_settlements(&self, consumer: &str) -> mpsc::Receiver<SettlementEvent>;

    /// Persist the processed marker onto the payment record.
    async fn mark_settlement_processed(&self, payment_hash: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MockPayment {
    pub wallet_id: String,
    pub payment_hash: String,
    pub amount_msat: u64,
    pub hit_id: String,
}

struct MockState {
    balance_sats: i64,
    fiat_rate: f64,
    fail_payments: bool,
    payments: Vec<MockPayment>,
    processed: HashSet<String>,
    subscribers: Vec<mpsc::Sender<SettlementEvent>>,
}

/// In-process stand-in for the settlement engine.
pub struct MockLightning {
    state: Mutex<MockState>,
}

impl Default for MockLightning {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLightning {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance_sats: 1_000_000_000,
                fiat_rate: 0.0005,
                fail_payments: false,
                payments: Vec::new(),
                processed: HashSet::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn with_fiat_rate(rate: f64) -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().fiat_rate = rate;
        mock
    }

    /// Make subsequent pay_invoice calls fail, for failure-path tests.
    pub fn fail_payments(&self) {
        self.state.lock().unwrap().fail_payments = true;
    }

    pub fn payments(&self) -> Vec<MockPayment> {
        self.state.lock().unwrap().payments.clone()
    }

    pub fn is_processed(&self, payment_hash: &str) -> bool {
        self.state.lock().unwrap().processed.contains(payment_hash)
    }

    /// Deliver a settlement event to every subscriber.
    pub async fn settle(&self, event: SettlementEvent) {
        let subscribers: Vec<_> = self.state.lock().unwrap().subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }
}

#[async_trait]
impl LightningBackend for MockLightning {
    async fn create_invoice(
        &self,
        _wallet_id: &str,
        amount_sats: i64,
        _memo: &str,
        _metadata: &str,
        _refund_hit: &str,
    ) -> Result<CreatedInvoice> {
        let payment_hash = hex::encode(rand::random::<[u8; 32]>());
        Ok(CreatedInvoice {
            bolt11: format!("lnbcmock{}n1{}", amount_sats, &payment_hash[..16]),
            payment_hash,
        })
    }

    async fn pay_invoice(
        &self,
        wallet_id: &str,
        invoice: &Invoice,
        max_sats: i64,
        hit_id: &str,
    ) -> Result<String> {
        let amount_msat = invoice.amount_msats()?;
        let payment_hash = invoice.payment_hash();

        let mut state = self.state.lock().unwrap();
        if state.fail_payments {
            bail!("no route found");
        }
        if amount_msat > (max_sats as u64).saturating_mul(1000) {
            bail!("invoice amount exceeds payment cap");
        }
        if amount_msat as i64 > state.balance_sats * 1000 {
            bail!("insufficient balance");
        }
        state.balance_sats -= (amount_msat / 1000) as i64;
        state.payments.push(MockPayment {
            wallet_id: wallet_id.to_string(),
            payment_hash: payment_hash.clone(),
            amount_msat,
            hit_id: hit_id.to_string(),
        });
        Ok(payment_hash)
    }

    async fn wallet_balance(&self, _wallet_id: &str) -> Result<i64> {
        Ok(self.state.lock().unwrap().balance_sats)
    }

    async fn fiat_equivalent(&self, _wallet_id: &str, amount_sats: i64) -> Result<f64> {
        Ok(amount_sats as f64 * self.state.lock().unwrap().fiat_rate)
    }

    fn subscribe_settlements(&self, _consumer: &str) -> mpsc::Receiver<SettlementEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    async fn mark_settlement_processed(&self, payment_hash: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .processed
            .insert(payment_hash.to_string());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn parses_spec_example_invoice() {
        let invoice = Invoice::from_str(TEST_INVOICE).unwrap();
        assert_eq!(invoice.amount_msats().unwrap(), TEST_INVOICE_MSAT);
    }

    #[tokio::test]
    async fn mock_enforces_payment_cap() {
        let mock = MockLightning::new();
        let invoice = Invoice::from_str(TEST_INVOICE).unwrap();

        let err = mock
            .pay_invoice("w1", &invoice, TEST_INVOICE_SATS - 1, "hit")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cap"));

        mock.pay_invoice("w1", &invoice, TEST_INVOICE_SATS, "hit")
            .await
            .unwrap();
        assert_eq!(mock.payments().len(), 1);
        assert_eq!(mock.payments()[0].hit_id, "hit");
    }
}
