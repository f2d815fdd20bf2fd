//! Per-session tasks.
//!
//! Every connected client, gateway and relay is one task that owns its whole
//! state. Cross-session communication happens via the bounded mailboxes
//! registered in the presence registry; nothing else is shared.

pub mod broker;
pub mod client;
pub mod gateway;
pub mod relay;

use chrono::{DateTime, Utc};
use portal_model::{AccountId, ClientId, GatewayGroupId, GatewayId, RelayId};
use portal_pubsub::Presence;
use semver::Version;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::mpsc;

/// How many commands a session mailbox buffers before back-pressure kicks in.
pub const MAILBOX_CAPACITY: usize = 64;

/// The single presence registry, covering all session kinds; topics keep the
/// kinds apart.
pub type Registry = Presence<String, SessionMeta>;

#[derive(Clone)]
pub enum SessionMeta {
    Client(ClientMeta),
    Gateway(GatewayMeta),
    Relay(RelayMeta),
}

impl SessionMeta {
    pub fn as_gateway(&self) -> Option<&GatewayMeta> {
        match self {
            SessionMeta::Gateway(meta) => Some(meta),
            SessionMeta::Client(_) | SessionMeta::Relay(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientMeta> {
        match self {
            SessionMeta::Client(meta) => Some(meta),
            SessionMeta::Gateway(_) | SessionMeta::Relay(_) => None,
        }
    }

    pub fn as_relay(&self) -> Option<&RelayMeta> {
        match self {
            SessionMeta::Relay(meta) => Some(meta),
            SessionMeta::Client(_) | SessionMeta::Gateway(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct ClientMeta {
    pub client_id: ClientId,
    pub mailbox: mpsc::Sender<ClientCommand>,
}

#[derive(Clone)]
pub struct GatewayMeta {
    pub gateway_id: GatewayId,
    pub group_id: GatewayGroupId,
    pub version: Version,
    pub remote_ip: IpAddr,
    pub mailbox: mpsc::Sender<GatewayCommand>,
}

#[derive(Clone)]
pub struct RelayMeta {
    pub relay_id: RelayId,
    pub account_id: Option<AccountId>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub location: Option<(f64, f64)>,
    /// Rotated per connection; TURN credentials are derived from it.
    pub stamp_secret: String,
    pub connected_at: DateTime<Utc>,
}

/// Commands another session can drop into a client session's mailbox.
///
/// ICE candidate forwards are idempotent resends; they are sent with
/// `try_send` and dropped when the mailbox is full. Nothing else in here may
/// be dropped.
pub enum ClientCommand {
    IceCandidates {
        gateway_id: GatewayId,
        candidates: Vec<String>,
    },
    InvalidateIceCandidates {
        gateway_id: GatewayId,
        candidates: Vec<String>,
    },
}

/// Commands another session can drop into a gateway session's mailbox.
pub enum GatewayCommand {
    Broker(broker::BrokeredRequest),
    IceCandidates {
        client_id: ClientId,
        candidates: Vec<String>,
    },
    InvalidateIceCandidates {
        client_id: ClientId,
        candidates: Vec<String>,
    },
}

/// The transport half of a session: raw text frames in, raw text frames out.
///
/// The socket layer pumps a WebSocket into these channels; tests drive them
/// directly.
pub struct SessionIo {
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
}

impl SessionIo {
    /// A session pipe plus the test-side handles to drive it.
    pub fn pipe() -> (Self, mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(MAILBOX_CAPACITY);

        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            inbound_tx,
            outbound_rx,
        )
    }
}

/// Why a session ended; mirrored into the terminal `disconnect` frame where
/// one is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SocketClosed,
    LeftTopic,
    MalformedFrame,
    TokenExpired,
    ForceDisconnect,
    Shutdown,
}
