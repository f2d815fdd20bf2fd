//! Messages exchanged with clients on the `/client` socket.

use crate::{Filters, Interface, Relay, RelaysPresence};
use ip_network::IpNetwork;
use portal_model::{GatewayId, Key, ResourceId, Site};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Description of a resource that maps to a DNS record.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ResourceDescriptionDns {
    pub id: ResourceId,
    /// The (possibly wildcarded) domain name, rendered for the client's
    /// address-syntax version.
    pub address: String,
    /// Name of the resource.
    ///
    /// Used only for display.
    pub name: String,
    pub address_description: Option<String>,
    pub gateway_groups: Vec<Site>,
    pub filters: Filters,
}

/// Description of a resource that maps to a CIDR.
///
/// Single-IP resources are rendered as `/32` respectively `/128` networks.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ResourceDescriptionCidr {
    pub id: ResourceId,
    pub address: IpNetwork,
    /// Name of the resource.
    ///
    /// Used only for display.
    pub name: String,
    pub address_description: Option<String>,
    pub gateway_groups: Vec<Site>,
    pub filters: Filters,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceDescription {
    Dns(ResourceDescriptionDns),
    Cidr(ResourceDescriptionCidr),
}

impl ResourceDescription {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceDescription::Dns(r) => r.id,
            ResourceDescription::Cidr(r) => r.id,
        }
    }

    pub fn address(&self) -> String {
        match self {
            ResourceDescription::Dns(r) => r.address.clone(),
            ResourceDescription::Cidr(r) => r.address.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct InitClient {
    pub interface: Interface,
    #[serde(default)]
    pub resources: Vec<ResourceDescription>,
    #[serde(default)]
    pub relays: Vec<Relay>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub interface: Interface,
}

/// ICE candidates exchanged with one gateway.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GatewayIceCandidates {
    pub gateway_id: GatewayId,
    pub candidates: Vec<String>,
}

/// ICE candidates a client wants forwarded to several gateways.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct BroadcastIceCandidates {
    pub gateway_ids: Vec<GatewayId>,
    pub candidates: Vec<String>,
}

/// Request to reuse an already-established gateway connection.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ReuseConnection {
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    #[serde(default)]
    pub payload: Option<String>,
}

/// Request to establish a new connection through a gateway.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RequestConnection {
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    /// The preshared key the client generated for the connection it is
    /// trying to establish. Opaque to the portal.
    pub client_preshared_key: String,
    /// The client's local session description. Opaque to the portal.
    pub client_payload: String,
}

/// Messages received from clients.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum IngressMessages {
    PrepareConnection { resource_id: ResourceId },
    ReuseConnection(ReuseConnection),
    RequestConnection(RequestConnection),
    BroadcastIceCandidates(BroadcastIceCandidates),
    BroadcastInvalidatedIceCandidates(BroadcastIceCandidates),
}

/// Messages pushed to clients.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum EgressMessages {
    Init(InitClient),
    ResourceCreatedOrUpdated(ResourceDescription),
    ResourceDeleted(ResourceId),
    ConfigChanged(ConfigUpdate),
    IceCandidates(GatewayIceCandidates),
    InvalidateIceCandidates(GatewayIceCandidates),
    RelaysPresence(RelaysPresence),
}

/// Replies to client RPCs.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReplyMessages {
    ConnectionPrepared(ConnectionPrepared),
    Connect(Connect),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConnectionPrepared {
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    pub gateway_remote_ip: IpAddr,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Connect {
    pub resource_id: ResourceId,
    pub gateway_public_key: Key,
    /// The gateway's session description, forwarded verbatim.
    pub gateway_payload: String,
    pub persistent_keepalive: u16,
}
