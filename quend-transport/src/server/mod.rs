//! Datagram-level endpoint: demultiplexes UDP datagrams onto connections
//! by Connection ID and instantiates server connections for unknown
//! Initials.
//!
//! The endpoint performs no I/O. The embedding process feeds each received
//! datagram through [`Endpoint::handle_datagram`] and transmits whatever
//! lands in the output vector; timers go through
//! [`Endpoint::handle_timeouts`]. One endpoint is single-threaded; run one
//! per socket for parallelism.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::connection::Connection;
use crate::events::EventSink;
use crate::packet::header::{Header, PacketType, FIXED_BIT};
use crate::tls::TlsEngine;
use crate::transport::parameters::TransportParameters;
use crate::types::{ConnectionId, Version, DEFAULT_LOCAL_CID_LEN};

/// A datagram ready for transmission.
#[derive(Debug)]
pub struct Transmit {
    pub datagram: Vec<u8>,
    pub dst: SocketAddr,
}

/// Factory producing one TLS engine per accepted connection.
pub type TlsEngineFactory = Box<dyn Fn() -> Box<dyn TlsEngine> + Send>;

/// Factory producing one event sink per accepted connection.
pub type EventSinkFactory = Box<dyn Fn() -> Box<dyn EventSink> + Send>;

/// Endpoint-wide settings.
pub struct EndpointConfig {
    /// Length of connection IDs this endpoint issues.
    pub local_cid_len: usize,
    /// Transport parameters advertised to every client.
    pub transport_params: TransportParameters,
    /// Idle deadline applied when the peer does not advertise a tighter
    /// one.
    pub idle_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_cid_len: DEFAULT_LOCAL_CID_LEN,
            transport_params: TransportParameters::default(),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Internal connection handle.
type ConnHandle = u64;

/// Server endpoint demultiplexer.
///
/// Holds two lookup indexes over connections it owns: client-chosen
/// Initial DCIDs concatenated with the source address (Initial packets
/// only, to disambiguate identical client DCIDs from different peers), and
/// locally-issued CIDs (everything else). The indexes never own
/// connections; CIDs belong to the connection and are dropped from the
/// indexes when it dies.
pub struct Endpoint {
    config: EndpointConfig,
    tls_factory: TlsEngineFactory,
    event_sinks: Option<EventSinkFactory>,
    conns: HashMap<ConnHandle, Connection>,
    next_handle: ConnHandle,
    /// Initial-phase index: (client-chosen DCID, source address).
    icids: HashMap<(ConnectionId, SocketAddr), ConnHandle>,
    /// Local-CID index for non-Initial long headers and short headers.
    cids: HashMap<ConnectionId, ConnHandle>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, tls_factory: TlsEngineFactory) -> Self {
        Self {
            config,
            tls_factory,
            event_sinks: None,
            conns: HashMap::new(),
            next_handle: 0,
            icids: HashMap::new(),
            cids: HashMap::new(),
        }
    }

    /// Subscribe every future connection's event stream through `factory`.
    pub fn set_event_sink_factory(&mut self, factory: EventSinkFactory) {
        self.event_sinks = Some(factory);
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Process one received UDP datagram: iterate its coalesced packets in
    /// order, route them onto a connection (creating one for an unknown
    /// Initial), then run the connection task and collect its transmits.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) {
        if data.is_empty() || data[0] & FIXED_BIT == 0 {
            tracing::trace!(%from, "datagram without fixed bit discarded");
            return;
        }

        let mut offset = 0;
        let mut datagram_conn: Option<ConnHandle> = None;

        while offset < data.len() {
            let header = match Header::parse(&data[offset..], self.config.local_cid_len) {
                Ok(header) => header,
                Err(_) => {
                    tracing::trace!(%from, offset, "malformed packet header, rest of datagram dropped");
                    break;
                }
            };
            if header.long_header && Version(header.version) != Version::V1 {
                tracing::debug!(%from, version = header.version, "unsupported version, datagram dropped");
                break;
            }

            let pkt_len = header.packet_len(data.len() - offset);
            let packet = &data[offset..offset + pkt_len];
            offset += pkt_len;

            let handle = match self.route_packet(&header, from, now) {
                Some(handle) => handle,
                None => continue,
            };

            // Never mix connections within one datagram.
            match datagram_conn {
                None => datagram_conn = Some(handle),
                Some(first) if first != handle => {
                    tracing::trace!(%from, "datagram mixes connections, remainder dropped");
                    break;
                }
                Some(_) => {}
            }

            if let Some(conn) = self.conns.get_mut(&handle) {
                conn.accept_packet(header, BytesMut::from(packet), now);
            }
        }

        // Wake the connection task the datagram belongs to.
        if let Some(handle) = datagram_conn {
            self.drive_connection(handle, now, out);
        }
    }

    /// Look up the connection for a parsed packet, instantiating one for
    /// an Initial with an unknown DCID.
    fn route_packet(&mut self, header: &Header, from: SocketAddr, now: Instant) -> Option<ConnHandle> {
        if header.ty == PacketType::Initial {
            let key = (header.dcid.clone(), from);
            if let Some(&handle) = self.icids.get(&key) {
                return Some(handle);
            }
            return self.accept_connection(header, from, now);
        }

        match self.cids.get(&header.dcid) {
            Some(&handle) => Some(handle),
            None => {
                tracing::trace!(dcid = %header.dcid, "no connection for DCID, packet dropped");
                None
            }
        }
    }

    /// Instantiate a connection for a client's first Initial packet and
    /// index it under both lookup keys.
    fn accept_connection(
        &mut self,
        header: &Header,
        from: SocketAddr,
        now: Instant,
    ) -> Option<ConnHandle> {
        let scid = header.scid.clone()?;
        let conn = Connection::new_server(
            Version(header.version),
            header.dcid.clone(),
            scid,
            from,
            self.config.local_cid_len,
            self.config.transport_params.clone(),
            (self.tls_factory)(),
            self.config.idle_timeout,
            now,
        );
        let mut conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(%from, error = %e, "failed to set up connection");
                return None;
            }
        };
        if let Some(factory) = &self.event_sinks {
            conn.set_event_sink(factory());
        }

        let handle = self.next_handle;
        self.next_handle += 1;

        self.icids.insert((header.dcid.clone(), from), handle);
        self.cids.insert(conn.scid().clone(), handle);
        tracing::debug!(%from, odcid = %header.dcid, scid = %conn.scid(), "new connection");
        self.conns.insert(handle, conn);
        Some(handle)
    }

    /// Run one connection task iteration and collect its output.
    fn drive_connection(&mut self, handle: ConnHandle, now: Instant, out: &mut Vec<Transmit>) {
        let conn = match self.conns.get_mut(&handle) {
            Some(conn) => conn,
            None => return,
        };

        conn.drive(now);

        // Index CIDs issued during this iteration.
        let new_cids: Vec<ConnectionId> = conn
            .local_cids()
            .filter(|cid| !self.cids.contains_key(*cid))
            .cloned()
            .collect();
        for cid in new_cids {
            self.cids.insert(cid, handle);
        }

        while let Some((datagram, dst)) = conn.poll_transmit() {
            out.push(Transmit { datagram, dst });
        }

        if conn.is_closed() {
            self.remove_connection(handle);
        }
    }

    /// Expire idle connections and reap closed ones. Returns the number of
    /// connections removed.
    pub fn handle_timeouts(&mut self, now: Instant) -> usize {
        let expired: Vec<ConnHandle> = self
            .conns
            .iter_mut()
            .filter_map(|(&handle, conn)| {
                conn.handle_timeout(now);
                conn.is_closed().then_some(handle)
            })
            .collect();
        let count = expired.len();
        for handle in expired {
            self.remove_connection(handle);
        }
        count
    }

    fn remove_connection(&mut self, handle: ConnHandle) {
        let conn = match self.conns.remove(&handle) {
            Some(conn) => conn,
            None => return,
        };
        self.icids
            .retain(|_, &mut indexed| indexed != handle);
        for cid in conn.local_cids() {
            self.cids.remove(cid);
        }
        tracing::debug!(scid = %conn.scid(), "connection removed");
    }
}
