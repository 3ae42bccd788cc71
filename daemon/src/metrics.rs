//! # Prometheus Metrics
//!
//! Sync and breaker health for the wallet daemon, scraped at `/metrics`.
//!
//! Counters are fed from the wallet's event bus by [`track_events`];
//! gauges that mirror wallet state are refreshed from a
//! [`WalletStatus`] on every scrape.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use tessera_protocol::events::WalletEvent;
use tessera_protocol::WalletStatus;

use crate::api::AppState;

#[derive(Clone)]
pub struct DaemonMetrics {
    registry: Registry,
    pub syncs_completed_total: IntCounter,
    pub sync_failures_total: IntCounter,
    pub sync_duration_seconds: Histogram,
    pub local_mode_entries_total: IntCounter,
    pub transfers_sent_total: IntCounter,
    pub transfers_received_total: IntCounter,
    pub local_mode: IntGauge,
    pub consecutive_storage_failures: IntGauge,
    pub consecutive_conflicts: IntGauge,
    pub last_synced_sequence: IntGauge,
    pub tokens: IntGauge,
    pub pending_operations: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl DaemonMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("tessera".into()), None)?;

        let sync_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("sync_duration_seconds", "Wall time of one remote sync")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        Ok(Self {
            syncs_completed_total: counter(
                &registry,
                "syncs_completed_total",
                "Remote syncs that finished successfully",
            )?,
            sync_failures_total: counter(
                &registry,
                "sync_failures_total",
                "Sync requests from the API or CLI that failed",
            )?,
            sync_duration_seconds,
            local_mode_entries_total: counter(
                &registry,
                "local_mode_entries_total",
                "Times the circuit breaker suspended remote sync",
            )?,
            transfers_sent_total: counter(&registry, "transfers_sent_total", "Tokens sent to peers")?,
            transfers_received_total: counter(
                &registry,
                "transfers_received_total",
                "Tokens received from peers",
            )?,
            local_mode: gauge(&registry, "local_mode", "1 while remote sync is suspended")?,
            consecutive_storage_failures: gauge(
                &registry,
                "consecutive_storage_failures",
                "Storage failures since the last success",
            )?,
            consecutive_conflicts: gauge(
                &registry,
                "consecutive_conflicts",
                "Sync conflicts since the last clean merge",
            )?,
            last_synced_sequence: gauge(
                &registry,
                "last_synced_sequence",
                "Remote snapshot sequence the wallet reflects",
            )?,
            tokens: gauge(&registry, "tokens", "Tokens held in the local store")?,
            pending_operations: gauge(
                &registry,
                "pending_operations",
                "Transaction log entries not yet completed",
            )?,
            registry,
        })
    }

    pub fn observe(&self, event: &WalletEvent) {
        match event {
            WalletEvent::SyncCompleted { sequence, .. } => {
                self.syncs_completed_total.inc();
                self.last_synced_sequence.set(*sequence as i64);
            }
            WalletEvent::LocalModeEntered { .. } => {
                self.local_mode_entries_total.inc();
                self.local_mode.set(1);
            }
            WalletEvent::LocalModeExited => self.local_mode.set(0),
            WalletEvent::TransferSent { .. } => self.transfers_sent_total.inc(),
            WalletEvent::TransferReceived { .. } => self.transfers_received_total.inc(),
            WalletEvent::TokensChanged | WalletEvent::MessageStatusChanged { .. } => {}
        }
    }

    pub fn refresh(&self, status: &WalletStatus) {
        self.local_mode.set(i64::from(status.breaker.local_mode_active));
        self.consecutive_storage_failures
            .set(i64::from(status.breaker.consecutive_storage_failures));
        self.consecutive_conflicts
            .set(i64::from(status.breaker.consecutive_conflicts));
        self.tokens.set(status.token_count as i64);
        self.pending_operations.set(status.pending_operations as i64);
        if let Some(seq) = status.sync.last_seen_sequence {
            self.last_synced_sequence.set(seq as i64);
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<DaemonMetrics>;

/// Feeds wallet events into `metrics` until shutdown or the bus closes.
pub async fn track_events(
    metrics: SharedMetrics,
    mut events: broadcast::Receiver<WalletEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => metrics.observe(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "metrics fell behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.wallet.status() {
        Ok(status) => state.metrics.refresh(&status),
        Err(e) => tracing::warn!(error = %e, "wallet status unavailable for metrics"),
    }
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_move_counters_and_gauges() {
        let m = DaemonMetrics::new().unwrap();
        m.observe(&WalletEvent::SyncCompleted {
            sequence: 7,
            token_count: 2,
        });
        m.observe(&WalletEvent::LocalModeEntered {
            reason: "storage failures".into(),
        });
        assert_eq!(m.syncs_completed_total.get(), 1);
        assert_eq!(m.last_synced_sequence.get(), 7);
        assert_eq!(m.local_mode.get(), 1);

        m.observe(&WalletEvent::LocalModeExited);
        assert_eq!(m.local_mode.get(), 0);
        assert_eq!(m.local_mode_entries_total.get(), 1);
    }

    #[test]
    fn encoding_uses_the_namespace() {
        let m = DaemonMetrics::new().unwrap();
        m.transfers_received_total.inc();
        let text = m.encode().unwrap();
        assert!(text.contains("tessera_transfers_received_total 1"));
        assert!(text.contains("tessera_sync_duration_seconds_bucket"));
    }

    #[tokio::test]
    async fn tracker_stops_on_shutdown() {
        let m = Arc::new(DaemonMetrics::new().unwrap());
        let (tx, rx) = broadcast::channel(8);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(track_events(m.clone(), rx, shutdown));

        tx.send(WalletEvent::TransferSent {
            token_id: tessera_protocol::token::TokenId::random(),
            peer_id: "bob".into(),
        })
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(m.transfers_sent_total.get(), 1);
    }
}
