//! Per-worker endpoint task.
//!
//! A worker owns one UDP socket and one sans-IO endpoint and runs a single
//! loop: receive a datagram, hand it to the endpoint, transmit whatever the
//! endpoint produced, and sweep idle connections on a timer. No state is
//! shared between workers.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use quend_transport::events::{ConnEvent, EventSink};
use quend_transport::server::{Endpoint, EndpointConfig, Transmit};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::telemetry::{record_metric, MetricsEvent};
use crate::tls;

/// Forwards connection events into the metrics channel.
struct MetricsSink;

impl EventSink for MetricsSink {
    fn on_event(&mut self, event: &ConnEvent) {
        if matches!(event, ConnEvent::HandshakeComplete) {
            record_metric(MetricsEvent::HandshakeCompleted);
        }
    }
}

pub struct Worker {
    id: usize,
    socket: UdpSocket,
    endpoint: Endpoint,
    recv_buf: Vec<u8>,
    sweep_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: usize,
        socket: UdpSocket,
        config: &ServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let endpoint_config = EndpointConfig {
            local_cid_len: config.transport.local_cid_len,
            transport_params: config.transport.transport_params(),
            idle_timeout: config.transport.idle_timeout(),
        };
        let mut endpoint = Endpoint::new(endpoint_config, tls::engine_factory(&config.tls));
        endpoint.set_event_sink_factory(Box::new(|| Box::new(MetricsSink)));

        Self {
            id,
            socket,
            endpoint,
            recv_buf: vec![0u8; config.netio.max_datagram_size],
            sweep_interval: Duration::from_millis(config.netio.sweep_interval_ms),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!(worker = self.id, "worker started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut out: Vec<Transmit> = Vec::new();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut self.recv_buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.on_datagram(len, from, &mut out).await;
                        }
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "recv_from failed");
                        }
                    }
                }
                _ = sweep.tick() => {
                    let closed = self.endpoint.handle_timeouts(Instant::now());
                    for _ in 0..closed {
                        record_metric(MetricsEvent::ConnectionClosed);
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(worker = self.id, conns = self.endpoint.connection_count(), "worker stopped");
    }

    async fn on_datagram(&mut self, len: usize, from: SocketAddr, out: &mut Vec<Transmit>) {
        trace!(worker = self.id, %from, len, "datagram received");
        record_metric(MetricsEvent::DatagramReceived { bytes: len });

        let before = self.endpoint.connection_count();
        let data = &self.recv_buf[..len];
        self.endpoint
            .handle_datagram(data, from, Instant::now(), out);
        if self.endpoint.connection_count() > before {
            record_metric(MetricsEvent::ConnectionOpened);
        }

        for transmit in out.drain(..) {
            match self.socket.send_to(&transmit.datagram, transmit.dst).await {
                Ok(sent) => {
                    record_metric(MetricsEvent::DatagramSent { bytes: sent });
                }
                Err(e) => {
                    // Send failures stall this flight; retransmission
                    // recovers the CRYPTO data if the peer noticed the gap.
                    warn!(worker = self.id, dst = %transmit.dst, error = %e, "send_to failed");
                    break;
                }
            }
        }
    }
}
