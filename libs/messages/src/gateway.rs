//! Messages exchanged with gateways on the `/gateway` socket.

use crate::{Relay, RelaysPresence};
use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use portal_model::{ClientId, Key, ResourceId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct InitGateway {
    #[serde(default)]
    pub account_slug: Option<String>,
    #[serde(default)]
    pub relays: Vec<Relay>,
}

/// A brokered request to establish a new connection for a client.
///
/// `ref` correlates the gateway's eventual [`ConnectionReady`] answer back to
/// the awaiting client RPC.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RequestConnection {
    #[serde(rename = "ref")]
    pub reference: String,
    pub resource_id: ResourceId,
    pub client_id: ClientId,
    /// When the brokered authorization lapses; the gateway enforces this
    /// independently of the portal.
    #[serde(with = "ts_seconds")]
    pub authorization_expires_at: DateTime<Utc>,
    pub client_payload: String,
    pub client_preshared_key: String,
}

/// A brokered request to allow a client on an existing connection.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AllowAccess {
    #[serde(rename = "ref")]
    pub reference: String,
    pub resource_id: ResourceId,
    pub client_id: ClientId,
    #[serde(with = "ts_seconds")]
    pub authorization_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub client_payload: Option<String>,
}

/// Revokes an earlier authorization after its policy went away.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RejectAccess {
    pub client_id: ClientId,
    pub resource_id: ResourceId,
}

/// ICE candidates exchanged with one client.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ClientIceCandidates {
    pub client_id: ClientId,
    pub candidates: Vec<String>,
}

/// ICE candidates a gateway wants forwarded to several clients.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct BroadcastClientIceCandidates {
    pub client_ids: Vec<ClientId>,
    pub candidates: Vec<String>,
}

/// The gateway's answer to a brokered connection request.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConnectionReady {
    #[serde(rename = "ref")]
    pub reference: String,
    pub resource_id: ResourceId,
    pub gateway_public_key: Key,
    /// The gateway's session description, forwarded verbatim to the client.
    pub gateway_payload: String,
}

/// Messages received from gateways.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum IngressMessages {
    Connect(ConnectionReady),
    BroadcastIceCandidates(BroadcastClientIceCandidates),
    BroadcastInvalidatedIceCandidates(BroadcastClientIceCandidates),
}

/// Messages pushed to gateways.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum EgressMessages {
    Init(InitGateway),
    RequestConnection(RequestConnection),
    AllowAccess(AllowAccess),
    RejectAccess(RejectAccess),
    IceCandidates(ClientIceCandidates),
    InvalidateIceCandidates(ClientIceCandidates),
    RelaysPresence(RelaysPresence),
}
