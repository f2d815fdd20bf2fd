//! The persisted entities of the control plane.
//!
//! Soft deletion is the rule: nothing is ever removed from a table, entities
//! gain a `deleted_at` instead so that flows and audit records keep resolving.

use chrono::{DateTime, Utc};
use ip_network::{Ipv4Network, Ipv6Network};
use portal_auth::{ActorRole, ActorType};
use portal_model::{
    AccountId, ActorId, ClientId, Filters, FlowId, GatewayGroupId, GatewayId, GroupId, IdentityId,
    Key, PolicyId, ProviderId, RelayId, ResourceId, Site, TokenId,
};
use portal_policy::Condition;
use semver::Version;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A tenant. Owns every other entity; no cross-account reference is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub slug: String,
    pub config: AccountConfig,
    pub features: AccountFeatures,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountConfig {
    /// Raw `ip[:port]` entries; normalized when pushed to clients.
    pub upstream_dns: Vec<String>,
    /// The pool client tunnel IPv4 addresses are allocated from.
    pub ipv4_pool: Ipv4Network,
    /// The pool client tunnel IPv6 addresses are allocated from.
    pub ipv6_pool: Ipv6Network,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            upstream_dns: Vec::new(),
            ipv4_pool: Ipv4Network::new(Ipv4Addr::new(100, 64, 0, 0), 11)
                .expect("100.64.0.0/11 is a valid network"),
            ipv6_pool: Ipv6Network::new(
                "fd00:2021:1111::".parse().expect("valid IPv6 address"),
                107,
            )
            .expect("fd00:2021:1111::/107 is a valid network"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountFeatures {
    /// Whether policies on this plan may carry conditions.
    pub policy_conditions: bool,
    pub multi_site_resources: bool,
}

impl Default for AccountFeatures {
    fn default() -> Self {
        Self {
            policy_conditions: true,
            multi_site_resources: true,
        }
    }
}

/// A human user or a non-human principal.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: ActorId,
    pub account_id: AccountId,
    pub name: String,
    pub kind: ActorType,
    pub role: ActorRole,
    pub disabled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Actor {
    pub fn is_active(&self) -> bool {
        self.disabled_at.is_none() && self.deleted_at.is_none()
    }

    pub fn is_active_admin(&self) -> bool {
        self.is_active() && self.role == ActorRole::Admin
    }
}

/// Binds an actor to an external identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: IdentityId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub provider_id: ProviderId,
    /// Unique within (provider, identifier).
    pub provider_identifier: String,
    /// Opaque provider tokens / claims.
    pub provider_state: serde_json::Value,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A set of actors policies can refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub account_id: AccountId,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Dns,
    Cidr,
    Ip,
}

/// A target the policy engine can grant access to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub kind: ResourceKind,
    /// Domain name (wildcards permitted), CIDR or single IP, depending on
    /// `kind`.
    pub address: String,
    pub name: String,
    pub address_description: Option<String>,
    pub filters: Filters,
    /// The gateway groups able to serve this resource.
    pub gateway_groups: Vec<GatewayGroupId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Grants an actor group access to a resource, optionally gated by
/// conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub id: PolicyId,
    pub account_id: AccountId,
    pub actor_group_id: GroupId,
    pub resource_id: ResourceId,
    pub conditions: Vec<Condition>,
    pub description: Option<String>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_active(&self) -> bool {
        self.disabled_at.is_none() && self.deleted_at.is_none()
    }
}

/// A gateway group, the "Site" of the admin UI.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayGroup {
    pub id: GatewayGroupId,
    pub account_id: AccountId,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl GatewayGroup {
    pub fn to_site(&self) -> Site {
        Site {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    pub id: GatewayId,
    pub account_id: AccountId,
    pub group_id: GatewayGroupId,
    pub public_key: Key,
    pub last_seen_version: Version,
    pub last_seen_remote_ip: IpAddr,
    pub last_seen_at: DateTime<Utc>,
}

/// An endpoint an actor connects from. Tunnel addresses are allocated once
/// and survive reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: ClientId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    /// Device identifier reported by the client, used to recognize it across
    /// sessions.
    pub external_id: Option<String>,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub last_seen_version: Version,
    pub last_seen_remote_ip: IpAddr,
    pub last_seen_at: DateTime<Utc>,
    pub location: Option<(f64, f64)>,
    pub region: Option<String>,
}

/// A STUN/TURN endpoint, account-scoped or global.
#[derive(Debug, Clone, PartialEq)]
pub struct Relay {
    pub id: RelayId,
    pub account_id: Option<AccountId>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub location: Option<(f64, f64)>,
    pub last_seen_at: DateTime<Utc>,
}

/// A persisted bearer credential. Only the hash is stored; the plain secret
/// is shown exactly once at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: TokenId,
    /// `None` for global relay tokens.
    pub account_id: Option<AccountId>,
    pub kind: TokenKind,
    /// Nulled on revocation; a token without a hash can never authenticate
    /// again.
    pub secret_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Client {
        actor_id: ActorId,
        identity_id: IdentityId,
    },
    Api {
        actor_id: ActorId,
    },
    GatewayGroup {
        group_id: GatewayGroupId,
    },
    Relay,
}

/// The audit record of an authorized client → gateway connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub id: FlowId,
    pub account_id: AccountId,
    pub client_id: ClientId,
    pub gateway_id: GatewayId,
    pub policy_id: PolicyId,
    pub resource_id: ResourceId,
    pub authorized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_remote_ip: IpAddr,
    pub gateway_remote_ip: IpAddr,
}
