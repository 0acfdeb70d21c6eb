//! TLS engine selection.
//!
//! The TLS 1.3 terminator is an external collaborator reached through
//! `quend_transport::tls::TlsEngine`. The daemon ships only the `null`
//! backend, which accepts handshake bytes without ever completing a
//! handshake; deployments link a real engine and register it here.

use once_cell::sync::OnceCell;
use quend_transport::server::TlsEngineFactory;
use quend_transport::tls::NullTlsEngine;
use tracing::warn;

use crate::config::TlsConfig;

static NULL_BACKEND_WARNED: OnceCell<()> = OnceCell::new();

/// Build the per-connection engine factory for the configured backend.
pub fn engine_factory(config: &TlsConfig) -> TlsEngineFactory {
    // Config validation pins the backend to "null" for now.
    debug_assert_eq!(config.backend, "null");
    NULL_BACKEND_WARNED.get_or_init(|| {
        warn!(
            "tls.backend = \"null\": handshakes will not complete; link a TLS engine \
             for production use"
        );
    });
    Box::new(|| Box::new(NullTlsEngine::default()))
}
