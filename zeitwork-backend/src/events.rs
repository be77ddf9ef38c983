use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel every component publishes and listens on
pub const CHANNEL: &str = "zeitwork_events";

/// A change notification fanned out over Postgres LISTEN/NOTIFY.
///
/// Purely a latency optimisation: every subscriber also polls, so a lost
/// notification only delays convergence by one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub entity: String,
    pub id: Uuid,
}

/// Publish a change notification for an entity row
pub async fn publish(pool: &PgPool, entity: &str, id: Uuid) -> Result<()> {
    let payload = serde_json::to_string(&Event {
        entity: entity.to_string(),
        id,
    })
    .context("Failed to encode event")?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL)
        .bind(payload)
        .execute(pool)
        .await
        .context("Failed to publish event")?;

    Ok(())
}

/// Best-effort publish: notification loss is tolerated by design, so
/// failures are logged and swallowed.
pub async fn publish_quiet(pool: &PgPool, entity: &str, id: Uuid) {
    if let Err(e) = publish(pool, entity, id).await {
        tracing::debug!("Dropping event notification for {} {}: {}", entity, id, e);
    }
}

/// Subscribe to the event channel.
///
/// Returns a receiver of decoded events. The listener task reconnects by
/// itself (PgListener re-establishes its connection); if the channel dies
/// entirely the receiver closes and callers fall back to pure polling.
pub async fn subscribe(database_url: &str) -> Result<mpsc::Receiver<Event>> {
    let mut listener = PgListener::connect(database_url)
        .await
        .context("Failed to connect event listener")?;
    listener
        .listen(CHANNEL)
        .await
        .context("Failed to LISTEN on event channel")?;

    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<Event>(notification.payload()) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed event payload: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Event listener error, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok(rx)
}

/// Wait for either the next event or the tick timeout, whichever comes
/// first. The poll cadence is the correctness mechanism; events only make
/// reaction faster.
pub async fn next_wakeup(rx: &mut mpsc::Receiver<Event>, tick: Duration) {
    let _ = tokio::time::timeout(tick, rx.recv()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trips_as_json() {
        let event = Event {
            entity: "deployments".to_string(),
            id: Uuid::now_v7(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entity, event.entity);
        assert_eq!(back.id, event.id);
    }

    #[tokio::test]
    async fn test_next_wakeup_returns_on_timeout() {
        let (_tx, mut rx) = mpsc::channel::<Event>(1);
        let start = std::time::Instant::now();
        next_wakeup(&mut rx, Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_next_wakeup_returns_early_on_event() {
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        tx.send(Event {
            entity: "builds".to_string(),
            id: Uuid::now_v7(),
        })
        .await
        .unwrap();
        let start = std::time::Instant::now();
        next_wakeup(&mut rx, Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
