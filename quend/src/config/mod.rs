//! Daemon configuration.
//!
//! Settings load with the precedence defaults < TOML file < environment
//! (`QUEND_` prefix) < command-line flags.

mod loader;


pub use loader::load_config;

use quend_transport::TransportParameters;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,

    /// UDP port to bind to.
    pub port: u16,

    /// QUIC transport settings advertised to clients.
    pub transport: TransportConfig,

    /// TLS backend selection.
    pub tls: TlsConfig,

    /// Network I/O settings.
    pub netio: NetIoConfig,

    /// Logging and metrics settings.
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4433,
            transport: TransportConfig::default(),
            tls: TlsConfig::default(),
            netio: NetIoConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the whole configuration, collecting every error.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(e) = self.transport.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.tls.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.netio.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.telemetry.validate() {
            errors.extend(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// QUIC transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Length of connection IDs issued by this endpoint (1..=20).
    pub local_cid_len: usize,

    /// Idle timeout in milliseconds, advertised as max_idle_timeout and
    /// applied locally.
    pub idle_timeout_ms: u64,

    /// initial_max_data advertised to clients.
    pub initial_max_data: u64,

    /// initial_max_stream_data_bidi_remote advertised to clients.
    pub initial_max_stream_data: u64,

    /// initial_max_streams_bidi advertised to clients.
    pub initial_max_streams_bidi: u64,

    /// active_connection_id_limit advertised to clients (>= 2).
    pub active_connection_id_limit: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_cid_len: 8,
            idle_timeout_ms: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 256 * 1024,
            initial_max_streams_bidi: 100,
            active_connection_id_limit: 4,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.local_cid_len == 0 || self.local_cid_len > 20 {
            errors.push(format!(
                "transport.local_cid_len must be in 1..=20, got {}",
                self.local_cid_len
            ));
        }
        if self.active_connection_id_limit < 2 {
            errors.push(format!(
                "transport.active_connection_id_limit must be >= 2, got {}",
                self.active_connection_id_limit
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Transport parameters advertised to every client.
    pub fn transport_params(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout: self.idle_timeout_ms,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            active_connection_id_limit: self.active_connection_id_limit,
            ..Default::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// TLS backend selection. The TLS 1.3 engine is an external collaborator;
/// `null` runs the transport plumbing without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Engine backend; only "null" is built in.
    pub backend: String,

    /// Certificate chain path handed to the engine backend.
    pub cert: Option<PathBuf>,

    /// Private key path handed to the engine backend.
    pub key: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            backend: "null".to_string(),
            cert: None,
            key: None,
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.backend != "null" {
            return Err(vec![format!(
                "tls.backend: unknown backend {:?} (built-in: \"null\")",
                self.backend
            )]);
        }
        Ok(())
    }
}

/// Network I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// Worker tasks, each with its own SO_REUSEPORT socket and endpoint.
    /// 0 selects the number of CPUs.
    pub workers: usize,

    /// Bind every worker socket with SO_REUSEPORT for kernel-level load
    /// distribution.
    pub reuse_port: bool,

    /// SO_RCVBUF size, if set.
    pub socket_recv_buffer_size: Option<usize>,

    /// SO_SNDBUF size, if set.
    pub socket_send_buffer_size: Option<usize>,

    /// Receive buffer size per datagram.
    pub max_datagram_size: usize,

    /// Interval between idle-timeout sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            reuse_port: true,
            socket_recv_buffer_size: Some(4 << 20),
            socket_send_buffer_size: Some(4 << 20),
            max_datagram_size: 65535,
            sweep_interval_ms: 1000,
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.max_datagram_size < 1200 {
            errors.push(format!(
                "netio.max_datagram_size must be >= 1200, got {}",
                self.max_datagram_size
            ));
        }
        if self.sweep_interval_ms == 0 {
            errors.push("netio.sweep_interval_ms must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Effective worker count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Logging and metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log filter (tracing EnvFilter syntax).
    pub log_level: String,

    /// "text" or "json".
    pub log_format: String,

    /// Interval between metric summary log lines, in seconds.
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_interval_secs: 60,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.log_format != "text" && self.log_format != "json" {
            return Err(vec![format!(
                "telemetry.log_format must be \"text\" or \"json\", got {:?}",
                self.log_format
            )]);
        }
        Ok(())
    }
}
