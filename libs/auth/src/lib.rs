//! Subjects, capability tokens and the checks every mutating operation runs.
//!
//! A [`Subject`] is derived per authenticated session, never persisted. It
//! carries the set of capabilities its actor's role grants; authorization is
//! a membership test against that set.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use chrono::{DateTime, Utc};
use portal_model::{AccountId, ActorId, IdentityId, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// What kind of principal an actor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    ServiceAccount,
    ApiClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Admin,
    Unprivileged,
}

/// A capability an operation can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewAvailableResources,
    CreateFlows,
    ManageOwnClients,
    ManageActors,
    ManageGroups,
    ManageResources,
    ManagePolicies,
    ManageGateways,
    ManageRelays,
    ManageTokens,
    ManageAccount,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::ViewAvailableResources => "view_available_resources",
            Permission::CreateFlows => "create_flows",
            Permission::ManageOwnClients => "manage_own_clients",
            Permission::ManageActors => "manage_actors",
            Permission::ManageGroups => "manage_groups",
            Permission::ManageResources => "manage_resources",
            Permission::ManagePolicies => "manage_policies",
            Permission::ManageGateways => "manage_gateways",
            Permission::ManageRelays => "manage_relays",
            Permission::ManageTokens => "manage_tokens",
            Permission::ManageAccount => "manage_account",
        };

        write!(f, "{name}")
    }
}

/// The static role → capability table.
pub fn permissions_for_role(role: ActorRole) -> BTreeSet<Permission> {
    match role {
        ActorRole::Admin => BTreeSet::from([
            Permission::ViewAvailableResources,
            Permission::CreateFlows,
            Permission::ManageOwnClients,
            Permission::ManageActors,
            Permission::ManageGroups,
            Permission::ManageResources,
            Permission::ManagePolicies,
            Permission::ManageGateways,
            Permission::ManageRelays,
            Permission::ManageTokens,
            Permission::ManageAccount,
        ]),
        ActorRole::Unprivileged => BTreeSet::from([
            Permission::ViewAvailableResources,
            Permission::CreateFlows,
            Permission::ManageOwnClients,
        ]),
    }
}

/// Where a session connected from; lifted from transport headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub remote_ip: IpAddr,
    pub user_agent: Option<String>,
    /// ISO region code resolved by the ingress layer.
    pub region: Option<String>,
    /// (latitude, longitude) resolved by the ingress layer.
    pub location: Option<(f64, f64)>,
}

/// The per-session authentication result.
///
/// Lives exactly as long as the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub actor_type: ActorType,
    pub actor_role: ActorRole,
    pub identity: Option<SubjectIdentity>,
    pub context: Context,
    pub permissions: BTreeSet<Permission>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectIdentity {
    pub id: IdentityId,
    pub provider_id: ProviderId,
}

impl Subject {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Authentication failures; deliberately coarse so that a caller cannot probe
/// which part of the chain rejected it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("actor or account is disabled")]
    Disabled,
    #[error("not found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("unauthorized: missing {missing_permissions:?}")]
    Unauthorized { missing_permissions: Vec<Permission> },
    #[error("privilege escalation: missing {missing_permissions:?}")]
    PrivilegeEscalation { missing_permissions: Vec<Permission> },
}

/// Requires `subject` to hold all of the given capabilities.
pub fn authorize(subject: &Subject, required: &[Permission]) -> Result<(), AuthzError> {
    let missing = required
        .iter()
        .copied()
        .filter(|p| !subject.has_permission(*p))
        .collect::<Vec<_>>();

    if missing.is_empty() {
        return Ok(());
    }

    Err(AuthzError::Unauthorized {
        missing_permissions: missing,
    })
}

/// Requires `subject` to hold at least one of the given capabilities.
pub fn authorize_any(subject: &Subject, one_of: &[Permission]) -> Result<(), AuthzError> {
    if one_of.iter().any(|p| subject.has_permission(*p)) {
        return Ok(());
    }

    Err(AuthzError::Unauthorized {
        missing_permissions: one_of.to_vec(),
    })
}

/// Granting a role requires holding everything that role implies; otherwise
/// an unprivileged admin-of-sorts could mint accounts more powerful than
/// itself.
pub fn check_privilege_escalation(
    subject: &Subject,
    target_role: ActorRole,
) -> Result<(), AuthzError> {
    let missing = permissions_for_role(target_role)
        .into_iter()
        .filter(|p| !subject.has_permission(*p))
        .collect::<Vec<_>>();

    if missing.is_empty() {
        return Ok(());
    }

    Err(AuthzError::PrivilegeEscalation {
        missing_permissions: missing,
    })
}
