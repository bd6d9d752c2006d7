use anyhow::Result;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::queries;
use crate::lightning::{LightningBackend, SettlementEvent};

/// Long-lived consumer of the settlement event stream. Owns its task;
/// `stop` cancels the loop and waits for it to finish.
pub struct SettlementListener {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SettlementListener {
    pub fn spawn(pool: Pool<Sqlite>, lightning: Arc<dyn LightningBackend>) -> Self {
        // Subscribe before the task starts so no event delivered after
        // spawn returns can be missed.
        let events = lightning.subscribe_settlements("boltcards");
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(pool, lightning, events, shutdown_rx));
        Self { handle, shutdown }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn run(
    pool: Pool<Sqlite>,
    lightning: Arc<dyn LightningBackend>,
    mut events: tokio::sync::mpsc::Receiver<SettlementEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("settlement listener started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(err) = handle_event(&pool, lightning.as_ref(), &event).await {
                        tracing::error!(payment = %event.payment_hash, "settlement handling failed: {err:#}");
                    }
                }
                None => {
                    tracing::warn!("settlement stream closed");
                    break;
                }
            },
        }
    }

    tracing::info!("settlement listener stopped");
}

/// Record a refund for a settled refund-tagged payment. Safe under
/// redelivery: the refund row is keyed by the payment hash and the
/// processed marker is written back after it exists.
pub(crate) async fn handle_event(
    pool: &Pool<Sqlite>,
    lightning: &dyn LightningBackend,
    event: &SettlementEvent,
) -> Result<()> {
    let Some(hit_id) = event.refund_hit.as_deref() else {
        return Ok(());
    };
    if event.processed {
        return Ok(());
    }

    let Some(hit) = queries::get_hit(pool, hit_id).await? else {
        tracing::warn!(payment = %event.payment_hash, hit_id, "refund settlement for unknown hit");
        return Ok(());
    };

    let amount_sats = (event.amount_msat / 1000) as i64;
    let created = queries::create_refund(pool, &hit.id, amount_sats, &event.payment_hash).await?;
    if created {
        tracing::info!(hit = %hit.id, amount_sats, "refund recorded");
    }

    lightning
        .mark_settlement_processed(&event.payment_hash)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::{create_card, create_hit, get_refunds};
    use crate::db::test_pool;
    use crate::db::test_support::card_data;
    use crate::lightning::MockLightning;

    fn refund_event(hit_id: &str, payment_hash: &str, amount_msat: u64) -> SettlementEvent {
        SettlementEvent {
            payment_hash: payment_hash.to_string(),
            amount_msat,
            refund_hit: Some(hit_id.to_string()),
            processed: false,
        }
    }

    #[tokio::test]
    async fn records_refund_once_under_redelivery() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = create_card(&pool, &card_data("s", "01020304050607"), "w1")
            .await
            .unwrap();
        let hit = create_hit(&pool, &card.id, "127.0.0.1", "test", 0, 1)
            .await
            .unwrap();

        let event = refund_event(&hit.id, "hash1", 21_000);
        handle_event(&pool, &lightning, &event).await.unwrap();
        handle_event(&pool, &lightning, &event).await.unwrap();

        let refunds = get_refunds(&pool, &[hit.id.clone()]).await.unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].refund_amount, 21);
        assert!(lightning.is_processed("hash1"));
    }

    #[tokio::test]
    async fn ignores_untagged_and_processed_payments() {
        let pool = test_pool().await;
        let lightning = MockLightning::new();
        let card = create_card(&pool, &card_data("s", "01020304050607"), "w1")
            .await
            .unwrap();
        let hit = create_hit(&pool, &card.id, "127.0.0.1", "test", 0, 1)
            .await
            .unwrap();

        let untagged = SettlementEvent {
            payment_hash: "hash2".to_string(),
            amount_msat: 1000,
            refund_hit: None,
            processed: false,
        };
        handle_event(&pool, &lightning, &untagged).await.unwrap();

        let mut processed = refund_event(&hit.id, "hash3", 1000);
        processed.processed = true;
        handle_event(&pool, &lightning, &processed).await.unwrap();

        assert!(
            get_refunds(&pool, &[hit.id.clone()])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn listener_consumes_the_stream_and_stops() {
        let pool = test_pool().await;
        let lightning = Arc::new(MockLightning::new());
        let card = create_card(&pool, &card_data("s", "01020304050607"), "w1")
            .await
            .unwrap();
        let hit = create_hit(&pool, &card.id, "127.0.0.1", "test", 0, 1)
            .await
            .unwrap();

        let listener = SettlementListener::spawn(pool.clone(), lightning.clone());
        lightning.settle(refund_event(&hit.id, "hash4", 42_000)).await;

        // Give the task a beat to drain the channel.
        for _ in 0..50 {
            if !get_refunds(&pool, &[hit.id.clone()]).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let refunds = get_refunds(&pool, &[hit.id.clone()]).await.unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].refund_amount, 42);

        listener.stop().await;
    }
}
