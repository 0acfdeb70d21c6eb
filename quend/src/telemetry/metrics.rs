//! Channelled metrics aggregation.

use once_cell::sync::OnceCell;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Events recorded from the packet path.
#[derive(Debug, Clone, Copy)]
pub enum MetricsEvent {
    DatagramReceived { bytes: usize },
    DatagramSent { bytes: usize },
    ConnectionOpened,
    ConnectionClosed,
    HandshakeCompleted,
}

static METRICS_TX: OnceCell<mpsc::UnboundedSender<MetricsEvent>> = OnceCell::new();

/// Record a metric event. Before the task starts (or in tests without
/// telemetry) this is a no-op.
pub fn record_metric(event: MetricsEvent) {
    if let Some(tx) = METRICS_TX.get() {
        let _ = tx.send(event);
    }
}

/// Aggregated counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_in: u64,
    pub bytes_in: u64,
    pub datagrams_out: u64,
    pub bytes_out: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub handshakes_completed: u64,
}

impl MetricsSnapshot {
    fn apply(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::DatagramReceived { bytes } => {
                self.datagrams_in += 1;
                self.bytes_in += bytes as u64;
            }
            MetricsEvent::DatagramSent { bytes } => {
                self.datagrams_out += 1;
                self.bytes_out += bytes as u64;
            }
            MetricsEvent::ConnectionOpened => self.connections_opened += 1,
            MetricsEvent::ConnectionClosed => self.connections_closed += 1,
            MetricsEvent::HandshakeCompleted => self.handshakes_completed += 1,
        }
    }
}

/// Handle for shutting the metrics task down.
pub struct MetricsHandle {
    shutdown: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// Stop the aggregation task, flushing a final summary.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.task.await;
    }
}

/// Start the aggregation task and install the global event sender.
pub fn start_metrics_task(interval_secs: u64) -> MetricsHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = METRICS_TX.set(tx);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut snapshot = MetricsSnapshot::default();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => snapshot.apply(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    log_summary(&snapshot);
                }
                _ = shutdown_rx.recv() => {
                    // Drain whatever is already queued before the summary.
                    while let Ok(event) = rx.try_recv() {
                        snapshot.apply(event);
                    }
                    log_summary(&snapshot);
                    break;
                }
            }
        }
    });

    MetricsHandle {
        shutdown: shutdown_tx,
        task,
    }
}

fn log_summary(snapshot: &MetricsSnapshot) {
    info!(
        datagrams_in = snapshot.datagrams_in,
        bytes_in = snapshot.bytes_in,
        datagrams_out = snapshot.datagrams_out,
        bytes_out = snapshot.bytes_out,
        connections_opened = snapshot.connections_opened,
        connections_closed = snapshot.connections_closed,
        handshakes_completed = snapshot.handshakes_completed,
        "metrics summary"
    );
}
