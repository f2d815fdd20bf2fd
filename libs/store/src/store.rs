//! The in-process database, the single linearization point for mutations.
//!
//! Every operation takes the store mutex for its whole duration, which makes
//! each one a serializable check-and-act: the last-admin invariant and the
//! address allocator rely on that. Change events are collected under the lock
//! and published to the bus after it is released.

use crate::addresses;
use crate::entities::*;
use crate::events::{Event, topics};
use crate::tokens;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use portal_auth::{
    ActorRole, ActorType, AuthError, AuthzError, Context, Permission, Subject, SubjectIdentity,
    authorize, check_privilege_escalation, permissions_for_role,
};
use portal_model::{
    AccountId, ActorId, ClientId, Filters, FlowId, GatewayGroupId, GatewayId, GroupId, IdentityId,
    Key, PolicyId, ProviderId, RelayId, ResourceId, Site, TokenId,
};
use portal_policy::Condition;
use portal_pubsub::Bus;
use secrecy::SecretString;
use semver::Version;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Sessions authenticated with a non-expiring token still need an absolute
/// expiry instant; anything this far out is never scheduled as a timer.
fn unbounded_session() -> Duration {
    Duration::days(365 * 100)
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist or is not visible to the caller. The two
    /// cases are deliberately indistinguishable.
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Unauthorized(#[from] AuthzError),
    #[error("cant_disable_the_last_admin")]
    CantDisableTheLastAdmin,
    #[error("cant_delete_the_last_admin")]
    CantDeleteTheLastAdmin,
    #[error("a policy for this group and resource already exists")]
    PolicyConflict,
    #[error("feature is not available on this account's plan")]
    FeatureDisabled,
    #[error(transparent)]
    InvalidCondition(#[from] portal_policy::ConditionError),
    #[error("invalid resource address: {0}")]
    InvalidAddress(String),
    #[error("address pool exhausted")]
    PoolExhausted,
}

/// The result of authenticating a gateway-group token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayAuth {
    pub account_id: AccountId,
    pub group_id: GatewayGroupId,
    pub token_id: TokenId,
}

/// The result of authenticating a relay token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAuth {
    /// `None` for relays of the global pool.
    pub account_id: Option<AccountId>,
    pub token_id: TokenId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub kind: ResourceKind,
    pub address: String,
    pub name: String,
    pub address_description: Option<String>,
    pub filters: Filters,
    pub gateway_groups: Vec<GatewayGroupId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientParams {
    pub external_id: Option<String>,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayParams {
    pub public_key: Key,
    pub version: Version,
    pub remote_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayParams {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub location: Option<(f64, f64)>,
}

pub struct Store {
    inner: Mutex<Inner>,
    bus: Arc<Bus<Event>>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    actors: HashMap<ActorId, Actor>,
    identities: HashMap<IdentityId, Identity>,
    groups: HashMap<GroupId, Group>,
    memberships: HashSet<(ActorId, GroupId)>,
    resources: HashMap<ResourceId, Resource>,
    policies: HashMap<PolicyId, Policy>,
    gateway_groups: HashMap<GatewayGroupId, GatewayGroup>,
    gateways: HashMap<GatewayId, Gateway>,
    clients: HashMap<ClientId, Client>,
    relays: HashMap<RelayId, Relay>,
    tokens: HashMap<TokenId, Token>,
    tokens_by_hash: HashMap<String, TokenId>,
    flows: Vec<Flow>,
    assigned_v4: HashMap<AccountId, HashSet<Ipv4Addr>>,
    assigned_v6: HashMap<AccountId, HashSet<Ipv6Addr>>,
}

impl Store {
    pub fn new(bus: Arc<Bus<Event>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<Bus<Event>> {
        &self.bus
    }

    // ----- Provisioning ---------------------------------------------------
    //
    // Accounts, the first admin and identities are created by systems outside
    // the signaling core (sign-up, billing, directory sync). These entry
    // points are their interface and therefore take no `Subject`.

    pub fn create_account(&self, slug: &str) -> Account {
        let account = Account {
            id: AccountId::random(),
            slug: slug.to_owned(),
            config: AccountConfig::default(),
            features: AccountFeatures::default(),
            deleted_at: None,
        };

        self.inner
            .lock()
            .accounts
            .insert(account.id, account.clone());

        account
    }

    pub fn create_seed_admin(&self, account_id: AccountId, name: &str) -> Result<Actor, StoreError> {
        let mut inner = self.inner.lock();

        if !inner.accounts.contains_key(&account_id) {
            return Err(StoreError::NotFound);
        }

        let actor = Actor {
            id: ActorId::random(),
            account_id,
            name: name.to_owned(),
            kind: ActorType::User,
            role: ActorRole::Admin,
            disabled_at: None,
            deleted_at: None,
        };

        inner.actors.insert(actor.id, actor.clone());

        Ok(actor)
    }

    pub fn create_identity(
        &self,
        actor_id: ActorId,
        provider_id: ProviderId,
        provider_identifier: &str,
    ) -> Result<Identity, StoreError> {
        let mut inner = self.inner.lock();

        let actor = inner.actors.get(&actor_id).ok_or(StoreError::NotFound)?;

        let identity = Identity {
            id: IdentityId::random(),
            account_id: actor.account_id,
            actor_id,
            provider_id,
            provider_identifier: provider_identifier.to_owned(),
            provider_state: serde_json::Value::Null,
            last_seen_at: None,
            deleted_at: None,
        };

        inner.identities.insert(identity.id, identity.clone());

        Ok(identity)
    }

    /// Billing flips plan features; the core only reads them.
    pub fn set_account_features(
        &self,
        account_id: AccountId,
        features: AccountFeatures,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::NotFound)?;

        account.features = features;

        Ok(())
    }

    /// Builds a [`Subject`] for a known actor, bypassing token authentication.
    ///
    /// This is the provisioning/test entry point; socket sessions always go
    /// through [`Store::authenticate`].
    pub fn subject_for_actor(
        &self,
        actor_id: ActorId,
        context: Context,
        expires_at: DateTime<Utc>,
    ) -> Result<Subject, AuthError> {
        let inner = self.inner.lock();

        let actor = inner.actors.get(&actor_id).ok_or(AuthError::NotFound)?;

        inner.subject_for(actor, None, context, expires_at)
    }

    // ----- Authentication -------------------------------------------------

    /// Resolves a bearer token to a [`Subject`] for the `/client` endpoint.
    pub fn authenticate(
        &self,
        secret: &SecretString,
        context: Context,
    ) -> Result<Subject, AuthError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let token = inner.resolve_token(secret, now)?;
        let expires_at = token.expires_at.unwrap_or_else(|| now + unbounded_session());

        let (actor_id, identity_id) = match token.kind {
            TokenKind::Client {
                actor_id,
                identity_id,
            } => (actor_id, Some(identity_id)),
            TokenKind::Api { actor_id } => (actor_id, None),
            TokenKind::GatewayGroup { .. } | TokenKind::Relay => return Err(AuthError::Invalid),
        };

        let identity = match identity_id {
            Some(id) => {
                let identity = inner.identities.get(&id).ok_or(AuthError::NotFound)?;

                if !identity.is_active() {
                    return Err(AuthError::NotFound);
                }

                Some(SubjectIdentity {
                    id: identity.id,
                    provider_id: identity.provider_id,
                })
            }
            None => None,
        };

        let actor = inner.actors.get(&actor_id).ok_or(AuthError::NotFound)?;
        let subject = inner.subject_for(actor, identity, context, expires_at)?;

        if let Some(id) = identity_id
            && let Some(identity) = inner.identities.get_mut(&id)
        {
            identity.last_seen_at = Some(now);
        }

        Ok(subject)
    }

    /// Resolves a gateway-group token for the `/gateway` endpoint.
    pub fn authenticate_gateway(&self, secret: &SecretString) -> Result<GatewayAuth, AuthError> {
        let now = Utc::now();
        let inner = self.inner.lock();

        let token = inner.resolve_token(secret, now)?;

        let TokenKind::GatewayGroup { group_id } = token.kind else {
            return Err(AuthError::Invalid);
        };

        let group = inner
            .gateway_groups
            .get(&group_id)
            .ok_or(AuthError::NotFound)?;

        if group.deleted_at.is_some() {
            return Err(AuthError::NotFound);
        }

        inner.require_active_account(group.account_id)?;

        Ok(GatewayAuth {
            account_id: group.account_id,
            group_id,
            token_id: token.id,
        })
    }

    /// Resolves a relay token for the `/relay` endpoint.
    pub fn authenticate_relay(&self, secret: &SecretString) -> Result<RelayAuth, AuthError> {
        let now = Utc::now();
        let inner = self.inner.lock();

        let token = inner.resolve_token(secret, now)?;

        let TokenKind::Relay = token.kind else {
            return Err(AuthError::Invalid);
        };

        if let Some(account_id) = token.account_id {
            inner.require_active_account(account_id)?;
        }

        Ok(RelayAuth {
            account_id: token.account_id,
            token_id: token.id,
        })
    }

    // ----- Tokens ---------------------------------------------------------

    pub fn create_client_token(
        &self,
        subject: &Subject,
        identity_id: IdentityId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(TokenId, SecretString), StoreError> {
        authorize(subject, &[Permission::ManageTokens])?;

        let mut inner = self.inner.lock();

        let identity = inner
            .identities
            .get(&identity_id)
            .filter(|i| i.account_id == subject.account_id && i.is_active())
            .ok_or(StoreError::NotFound)?;

        let kind = TokenKind::Client {
            actor_id: identity.actor_id,
            identity_id,
        };

        Ok(inner.insert_token(Some(subject.account_id), kind, expires_at))
    }

    pub fn create_api_token(
        &self,
        subject: &Subject,
        actor_id: ActorId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(TokenId, SecretString), StoreError> {
        authorize(subject, &[Permission::ManageTokens])?;

        let mut inner = self.inner.lock();

        inner
            .actors
            .get(&actor_id)
            .filter(|a| a.account_id == subject.account_id && a.is_active())
            .ok_or(StoreError::NotFound)?;

        Ok(inner.insert_token(Some(subject.account_id), TokenKind::Api { actor_id }, expires_at))
    }

    pub fn create_gateway_token(
        &self,
        subject: &Subject,
        group_id: GatewayGroupId,
    ) -> Result<(TokenId, SecretString), StoreError> {
        authorize(subject, &[Permission::ManageGateways, Permission::ManageTokens])?;

        let mut inner = self.inner.lock();

        inner
            .gateway_groups
            .get(&group_id)
            .filter(|g| g.account_id == subject.account_id && g.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;

        Ok(inner.insert_token(
            Some(subject.account_id),
            TokenKind::GatewayGroup { group_id },
            None,
        ))
    }

    pub fn create_relay_token(
        &self,
        subject: &Subject,
    ) -> Result<(TokenId, SecretString), StoreError> {
        authorize(subject, &[Permission::ManageRelays, Permission::ManageTokens])?;

        let mut inner = self.inner.lock();

        Ok(inner.insert_token(Some(subject.account_id), TokenKind::Relay, None))
    }

    /// Mints a token for the global relay pool. Operator-only; there is no
    /// account to scope a `Subject` to.
    pub fn create_global_relay_token(&self) -> (TokenId, SecretString) {
        self.inner.lock().insert_token(None, TokenKind::Relay, None)
    }

    /// Revoking nulls the stored hash; the token can never authenticate
    /// again. Revoking twice is a no-op.
    pub fn revoke_token(&self, subject: &Subject, token_id: TokenId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageTokens])?;

        let mut inner = self.inner.lock();

        let token = inner
            .tokens
            .get_mut(&token_id)
            .filter(|t| t.account_id == Some(subject.account_id))
            .ok_or(StoreError::NotFound)?;

        if let Some(hash) = token.secret_hash.take() {
            inner.tokens_by_hash.remove(&hash);
        }

        Ok(())
    }

    // ----- Actors ---------------------------------------------------------

    pub fn create_actor(
        &self,
        subject: &Subject,
        name: &str,
        kind: ActorType,
        role: ActorRole,
    ) -> Result<Actor, StoreError> {
        authorize(subject, &[Permission::ManageActors])?;
        check_privilege_escalation(subject, role)?;

        let mut inner = self.inner.lock();

        let actor = Actor {
            id: ActorId::random(),
            account_id: subject.account_id,
            name: name.to_owned(),
            kind,
            role,
            disabled_at: None,
            deleted_at: None,
        };

        inner.actors.insert(actor.id, actor.clone());

        Ok(actor)
    }

    pub fn update_actor_role(
        &self,
        subject: &Subject,
        actor_id: ActorId,
        role: ActorRole,
    ) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageActors])?;
        check_privilege_escalation(subject, role)?;

        let mut inner = self.inner.lock();

        let actor = inner.visible_actor(subject, actor_id)?;

        if actor.role == role {
            return Ok(());
        }

        if actor.is_active_admin() && inner.count_active_admins(subject.account_id) <= 1 {
            return Err(StoreError::CantDisableTheLastAdmin);
        }

        if let Some(actor) = inner.actors.get_mut(&actor_id) {
            actor.role = role;
        }

        Ok(())
    }

    /// Disabling twice succeeds both times and leaves the state of the first
    /// call. Disabling the last active admin of an account fails.
    pub fn disable_actor(&self, subject: &Subject, actor_id: ActorId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageActors])?;

        let mut inner = self.inner.lock();

        let actor = inner.visible_actor(subject, actor_id)?;

        if actor.disabled_at.is_some() {
            return Ok(());
        }

        if actor.is_active_admin() && inner.count_active_admins(subject.account_id) <= 1 {
            return Err(StoreError::CantDisableTheLastAdmin);
        }

        if let Some(actor) = inner.actors.get_mut(&actor_id) {
            actor.disabled_at = Some(Utc::now());
        }

        Ok(())
    }

    pub fn enable_actor(&self, subject: &Subject, actor_id: ActorId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageActors])?;

        let mut inner = self.inner.lock();

        inner.visible_actor(subject, actor_id)?;

        if let Some(actor) = inner.actors.get_mut(&actor_id) {
            actor.disabled_at = None;
        }

        Ok(())
    }

    /// Deleting twice returns `NotFound` the second time. Deleting the last
    /// active admin of an account fails.
    pub fn delete_actor(&self, subject: &Subject, actor_id: ActorId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageActors])?;

        let mut inner = self.inner.lock();

        let actor = inner.visible_actor(subject, actor_id)?;

        if actor.is_active_admin() && inner.count_active_admins(subject.account_id) <= 1 {
            return Err(StoreError::CantDeleteTheLastAdmin);
        }

        if let Some(actor) = inner.actors.get_mut(&actor_id) {
            actor.deleted_at = Some(Utc::now());
        }

        Ok(())
    }

    // ----- Groups & memberships -------------------------------------------

    pub fn create_group(&self, subject: &Subject, name: &str) -> Result<Group, StoreError> {
        authorize(subject, &[Permission::ManageGroups])?;

        let mut inner = self.inner.lock();

        let group = Group {
            id: GroupId::random(),
            account_id: subject.account_id,
            name: name.to_owned(),
            deleted_at: None,
        };

        inner.groups.insert(group.id, group.clone());

        Ok(group)
    }

    pub fn add_membership(
        &self,
        subject: &Subject,
        actor_id: ActorId,
        group_id: GroupId,
    ) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageGroups])?;

        let mut inner = self.inner.lock();

        inner.visible_actor(subject, actor_id)?;
        inner.visible_group(subject, group_id)?;

        if !inner.memberships.insert((actor_id, group_id)) {
            return Ok(());
        }

        drop(inner);

        self.bus.publish(
            &topics::memberships(actor_id),
            Event::MembershipAdded { actor_id, group_id },
        );

        Ok(())
    }

    pub fn remove_membership(
        &self,
        subject: &Subject,
        actor_id: ActorId,
        group_id: GroupId,
    ) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageGroups])?;

        let mut inner = self.inner.lock();

        inner.visible_actor(subject, actor_id)?;
        inner.visible_group(subject, group_id)?;

        if !inner.memberships.remove(&(actor_id, group_id)) {
            return Ok(());
        }

        drop(inner);

        self.bus.publish(
            &topics::memberships(actor_id),
            Event::MembershipRemoved { actor_id, group_id },
        );

        Ok(())
    }

    // ----- Gateway groups -------------------------------------------------

    pub fn create_gateway_group(
        &self,
        subject: &Subject,
        name: &str,
    ) -> Result<GatewayGroup, StoreError> {
        authorize(subject, &[Permission::ManageGateways])?;

        let mut inner = self.inner.lock();

        let group = GatewayGroup {
            id: GatewayGroupId::random(),
            account_id: subject.account_id,
            name: name.to_owned(),
            deleted_at: None,
        };

        inner.gateway_groups.insert(group.id, group.clone());

        Ok(group)
    }

    // ----- Resources ------------------------------------------------------

    pub fn create_resource(
        &self,
        subject: &Subject,
        new: NewResource,
    ) -> Result<Resource, StoreError> {
        authorize(subject, &[Permission::ManageResources])?;

        validate_address(new.kind, &new.address)?;

        let mut inner = self.inner.lock();

        for group_id in &new.gateway_groups {
            inner
                .gateway_groups
                .get(group_id)
                .filter(|g| g.account_id == subject.account_id && g.deleted_at.is_none())
                .ok_or(StoreError::NotFound)?;
        }

        let resource = Resource {
            id: ResourceId::random(),
            account_id: subject.account_id,
            kind: new.kind,
            address: new.address,
            name: new.name,
            address_description: new.address_description,
            filters: new.filters,
            gateway_groups: new.gateway_groups,
            deleted_at: None,
        };

        inner.resources.insert(resource.id, resource.clone());

        drop(inner);

        self.bus.publish(
            &topics::resources(subject.account_id),
            Event::ResourceCreatedOrUpdated {
                resource_id: resource.id,
            },
        );

        Ok(resource)
    }

    pub fn update_resource(
        &self,
        subject: &Subject,
        resource_id: ResourceId,
        new: NewResource,
    ) -> Result<Resource, StoreError> {
        authorize(subject, &[Permission::ManageResources])?;

        validate_address(new.kind, &new.address)?;

        let mut inner = self.inner.lock();

        let existing = inner
            .resources
            .get(&resource_id)
            .filter(|r| r.account_id == subject.account_id && r.is_active())
            .ok_or(StoreError::NotFound)?
            .clone();

        for group_id in &new.gateway_groups {
            inner
                .gateway_groups
                .get(group_id)
                .filter(|g| g.account_id == subject.account_id && g.deleted_at.is_none())
                .ok_or(StoreError::NotFound)?;
        }

        let updated = Resource {
            kind: new.kind,
            address: new.address,
            name: new.name,
            address_description: new.address_description,
            filters: new.filters,
            gateway_groups: new.gateway_groups,
            ..existing
        };

        inner.resources.insert(resource_id, updated.clone());

        drop(inner);

        self.bus.publish(
            &topics::resources(subject.account_id),
            Event::ResourceCreatedOrUpdated { resource_id },
        );

        Ok(updated)
    }

    pub fn delete_resource(
        &self,
        subject: &Subject,
        resource_id: ResourceId,
    ) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageResources])?;

        let mut inner = self.inner.lock();

        let resource = inner
            .resources
            .get_mut(&resource_id)
            .filter(|r| r.account_id == subject.account_id && r.is_active())
            .ok_or(StoreError::NotFound)?;

        resource.deleted_at = Some(Utc::now());

        drop(inner);

        self.bus.publish(
            &topics::resources(subject.account_id),
            Event::ResourceDeleted { resource_id },
        );

        Ok(())
    }

    // ----- Policies -------------------------------------------------------

    pub fn create_policy(
        &self,
        subject: &Subject,
        actor_group_id: GroupId,
        resource_id: ResourceId,
        conditions: Vec<Condition>,
        description: Option<String>,
    ) -> Result<Policy, StoreError> {
        authorize(subject, &[Permission::ManagePolicies])?;

        for condition in &conditions {
            condition.validate()?;
        }

        let mut inner = self.inner.lock();

        if !conditions.is_empty() {
            let account = inner
                .accounts
                .get(&subject.account_id)
                .ok_or(StoreError::NotFound)?;

            if !account.features.policy_conditions {
                return Err(StoreError::FeatureDisabled);
            }
        }

        inner.visible_group(subject, actor_group_id)?;
        inner
            .resources
            .get(&resource_id)
            .filter(|r| r.account_id == subject.account_id && r.is_active())
            .ok_or(StoreError::NotFound)?;

        let conflict = inner.policies.values().any(|p| {
            p.account_id == subject.account_id
                && p.deleted_at.is_none()
                && p.actor_group_id == actor_group_id
                && p.resource_id == resource_id
        });

        if conflict {
            return Err(StoreError::PolicyConflict);
        }

        let policy = Policy {
            id: PolicyId::random(),
            account_id: subject.account_id,
            actor_group_id,
            resource_id,
            conditions,
            description,
            disabled_at: None,
            deleted_at: None,
        };

        inner.policies.insert(policy.id, policy.clone());

        drop(inner);

        self.bus.publish(
            &topics::policies(subject.account_id),
            Event::PolicyCreated {
                policy_id: policy.id,
                actor_group_id,
                resource_id,
            },
        );

        Ok(policy)
    }

    pub fn update_policy(
        &self,
        subject: &Subject,
        policy_id: PolicyId,
        conditions: Vec<Condition>,
        description: Option<String>,
    ) -> Result<Policy, StoreError> {
        authorize(subject, &[Permission::ManagePolicies])?;

        for condition in &conditions {
            condition.validate()?;
        }

        let mut inner = self.inner.lock();

        let policy = inner
            .policies
            .get_mut(&policy_id)
            .filter(|p| p.account_id == subject.account_id && p.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;

        policy.conditions = conditions;
        policy.description = description;

        let (actor_group_id, resource_id) = (policy.actor_group_id, policy.resource_id);
        let updated = policy.clone();

        drop(inner);

        self.bus.publish(
            &topics::policies(subject.account_id),
            Event::PolicyUpdated {
                policy_id,
                actor_group_id,
                resource_id,
            },
        );

        Ok(updated)
    }

    pub fn disable_policy(&self, subject: &Subject, policy_id: PolicyId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManagePolicies])?;

        let mut inner = self.inner.lock();

        let policy = inner
            .policies
            .get_mut(&policy_id)
            .filter(|p| p.account_id == subject.account_id && p.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;

        if policy.disabled_at.is_some() {
            return Ok(());
        }

        policy.disabled_at = Some(Utc::now());
        let (actor_group_id, resource_id) = (policy.actor_group_id, policy.resource_id);

        drop(inner);

        self.bus.publish(
            &topics::policies(subject.account_id),
            Event::PolicyDisabled {
                policy_id,
                actor_group_id,
                resource_id,
            },
        );

        Ok(())
    }

    pub fn enable_policy(&self, subject: &Subject, policy_id: PolicyId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManagePolicies])?;

        let mut inner = self.inner.lock();

        let policy = inner
            .policies
            .get_mut(&policy_id)
            .filter(|p| p.account_id == subject.account_id && p.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;

        if policy.disabled_at.is_none() {
            return Ok(());
        }

        policy.disabled_at = None;
        let (actor_group_id, resource_id) = (policy.actor_group_id, policy.resource_id);

        drop(inner);

        self.bus.publish(
            &topics::policies(subject.account_id),
            Event::PolicyEnabled {
                policy_id,
                actor_group_id,
                resource_id,
            },
        );

        Ok(())
    }

    pub fn delete_policy(&self, subject: &Subject, policy_id: PolicyId) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManagePolicies])?;

        let mut inner = self.inner.lock();

        let policy = inner
            .policies
            .get_mut(&policy_id)
            .filter(|p| p.account_id == subject.account_id && p.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;

        policy.deleted_at = Some(Utc::now());
        let (actor_group_id, resource_id) = (policy.actor_group_id, policy.resource_id);

        drop(inner);

        self.bus.publish(
            &topics::policies(subject.account_id),
            Event::PolicyDeleted {
                policy_id,
                actor_group_id,
                resource_id,
            },
        );

        Ok(())
    }

    // ----- Account config -------------------------------------------------

    pub fn update_account_config(
        &self,
        subject: &Subject,
        config: AccountConfig,
    ) -> Result<(), StoreError> {
        authorize(subject, &[Permission::ManageAccount])?;

        let mut inner = self.inner.lock();

        let account = inner
            .accounts
            .get_mut(&subject.account_id)
            .ok_or(StoreError::NotFound)?;

        account.config = config;

        drop(inner);

        self.bus
            .publish(&topics::account(subject.account_id), Event::ConfigChanged);

        Ok(())
    }

    /// Asks a connected client session to go away.
    pub fn force_disconnect_client(&self, client_id: ClientId) {
        self.bus
            .publish(&topics::session(client_id), Event::ForceDisconnect);
    }

    // ----- Sessions -------------------------------------------------------

    /// Registers (or recognizes) a connecting client and assigns its tunnel
    /// addresses. The scan-and-insert happens under the store lock, so two
    /// concurrent joins can never receive the same address.
    pub fn upsert_client(
        &self,
        subject: &Subject,
        params: ClientParams,
    ) -> Result<Client, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let existing = params.external_id.as_deref().and_then(|external_id| {
            inner
                .clients
                .values()
                .find(|c| {
                    c.actor_id == subject.actor_id && c.external_id.as_deref() == Some(external_id)
                })
                .map(|c| c.id)
        });

        if let Some(client_id) = existing {
            let location = subject.context.location;
            let region = subject.context.region.clone();
            let remote_ip = subject.context.remote_ip;

            let client = inner
                .clients
                .get_mut(&client_id)
                .expect("client id was just looked up");

            client.last_seen_version = params.version;
            client.last_seen_remote_ip = remote_ip;
            client.last_seen_at = now;
            client.location = location;
            client.region = region;

            return Ok(client.clone());
        }

        let account = inner
            .accounts
            .get(&subject.account_id)
            .ok_or(StoreError::NotFound)?;
        let (ipv4_pool, ipv6_pool) = (account.config.ipv4_pool, account.config.ipv6_pool);

        let id = ClientId::random();

        let taken_v4 = inner.assigned_v4.entry(subject.account_id).or_default();
        let v4_size = 1u128 << (32 - ipv4_pool.netmask());
        let ipv4 = addresses::allocate_ipv4(
            ipv4_pool,
            (id.as_u128() % v4_size) as u32,
            taken_v4,
        )
        .ok_or(StoreError::PoolExhausted)?;
        taken_v4.insert(ipv4);

        let taken_v6 = inner.assigned_v6.entry(subject.account_id).or_default();
        let v6_size = match ipv6_pool.netmask() {
            0 => u128::MAX,
            prefix => 1u128 << (128 - prefix),
        };
        let ipv6 = addresses::allocate_ipv6(ipv6_pool, id.as_u128() % v6_size, taken_v6)
            .ok_or(StoreError::PoolExhausted)?;
        taken_v6.insert(ipv6);

        let client = Client {
            id,
            account_id: subject.account_id,
            actor_id: subject.actor_id,
            external_id: params.external_id,
            ipv4,
            ipv6,
            last_seen_version: params.version,
            last_seen_remote_ip: subject.context.remote_ip,
            last_seen_at: now,
            location: subject.context.location,
            region: subject.context.region.clone(),
        };

        inner.clients.insert(client.id, client.clone());

        Ok(client)
    }

    pub fn upsert_gateway(
        &self,
        auth: &GatewayAuth,
        params: GatewayParams,
    ) -> Result<Gateway, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let existing = inner
            .gateways
            .values()
            .find(|g| g.group_id == auth.group_id && g.public_key == params.public_key)
            .map(|g| g.id);

        let gateway = match existing {
            Some(id) => {
                let gateway = inner
                    .gateways
                    .get_mut(&id)
                    .expect("gateway id was just looked up");

                gateway.last_seen_version = params.version;
                gateway.last_seen_remote_ip = params.remote_ip;
                gateway.last_seen_at = now;

                gateway.clone()
            }
            None => {
                let gateway = Gateway {
                    id: GatewayId::random(),
                    account_id: auth.account_id,
                    group_id: auth.group_id,
                    public_key: params.public_key,
                    last_seen_version: params.version,
                    last_seen_remote_ip: params.remote_ip,
                    last_seen_at: now,
                };

                inner.gateways.insert(gateway.id, gateway.clone());

                gateway
            }
        };

        Ok(gateway)
    }

    pub fn upsert_relay(&self, auth: &RelayAuth, params: RelayParams) -> Relay {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let existing = inner
            .relays
            .values()
            .find(|r| {
                r.account_id == auth.account_id
                    && r.ipv4 == params.ipv4
                    && r.ipv6 == params.ipv6
                    && r.port == params.port
            })
            .map(|r| r.id);

        match existing {
            Some(id) => {
                let relay = inner
                    .relays
                    .get_mut(&id)
                    .expect("relay id was just looked up");

                relay.location = params.location;
                relay.last_seen_at = now;

                relay.clone()
            }
            None => {
                let relay = Relay {
                    id: RelayId::random(),
                    account_id: auth.account_id,
                    ipv4: params.ipv4,
                    ipv6: params.ipv6,
                    port: params.port,
                    location: params.location,
                    last_seen_at: now,
                };

                inner.relays.insert(relay.id, relay.clone());

                relay
            }
        }
    }

    /// Refreshes a relay's liveness; called on every relay heartbeat. The
    /// relay selection staleness window keys off this.
    pub fn touch_relay(&self, relay_id: RelayId) {
        if let Some(relay) = self.inner.lock().relays.get_mut(&relay_id) {
            relay.last_seen_at = Utc::now();
        }
    }

    // ----- Flows ----------------------------------------------------------

    pub fn create_flow(
        &self,
        client: &Client,
        gateway: &Gateway,
        policy_id: PolicyId,
        resource_id: ResourceId,
        expires_at: DateTime<Utc>,
    ) -> Flow {
        let flow = Flow {
            id: FlowId::random(),
            account_id: client.account_id,
            client_id: client.id,
            gateway_id: gateway.id,
            policy_id,
            resource_id,
            authorized_at: Utc::now(),
            expires_at,
            client_remote_ip: client.last_seen_remote_ip,
            gateway_remote_ip: gateway.last_seen_remote_ip,
        };

        self.inner.lock().flows.push(flow.clone());

        flow
    }

    // ----- Queries --------------------------------------------------------

    pub fn account(&self, account_id: AccountId) -> Option<Account> {
        self.inner
            .lock()
            .accounts
            .get(&account_id)
            .filter(|a| a.is_active())
            .cloned()
    }

    pub fn actor(&self, actor_id: ActorId) -> Option<Actor> {
        self.inner.lock().actors.get(&actor_id).cloned()
    }

    pub fn client(&self, client_id: ClientId) -> Option<Client> {
        self.inner.lock().clients.get(&client_id).cloned()
    }

    pub fn gateway(&self, gateway_id: GatewayId) -> Option<Gateway> {
        self.inner.lock().gateways.get(&gateway_id).cloned()
    }

    pub fn relay(&self, relay_id: RelayId) -> Option<Relay> {
        self.inner.lock().relays.get(&relay_id).cloned()
    }

    pub fn resource(&self, resource_id: ResourceId) -> Option<Resource> {
        self.inner
            .lock()
            .resources
            .get(&resource_id)
            .filter(|r| r.is_active())
            .cloned()
    }

    pub fn group_ids_of_actor(&self, actor_id: ActorId) -> Vec<GroupId> {
        let inner = self.inner.lock();

        inner
            .memberships
            .iter()
            .filter(|(a, _)| *a == actor_id)
            .map(|(_, g)| *g)
            .filter(|g| {
                inner
                    .groups
                    .get(g)
                    .is_some_and(|group| group.deleted_at.is_none())
            })
            .collect()
    }

    /// The deduplicated set of resources the actor's memberships grant,
    /// sorted by id for deterministic rendering.
    pub fn visible_resources(&self, actor_id: ActorId) -> Vec<Resource> {
        let inner = self.inner.lock();

        let groups = inner
            .memberships
            .iter()
            .filter(|(a, _)| *a == actor_id)
            .map(|(_, g)| *g)
            .collect::<HashSet<_>>();

        let mut resource_ids = inner
            .policies
            .values()
            .filter(|p| p.is_active() && groups.contains(&p.actor_group_id))
            .map(|p| p.resource_id)
            .collect::<Vec<_>>();

        resource_ids.sort();
        resource_ids.dedup();

        resource_ids
            .into_iter()
            .filter_map(|id| inner.resources.get(&id))
            .filter(|r| r.is_active())
            .cloned()
            .collect()
    }

    /// The active policies granting `actor_id` access to `resource_id`.
    pub fn granting_policies(&self, actor_id: ActorId, resource_id: ResourceId) -> Vec<Policy> {
        let inner = self.inner.lock();

        let groups = inner
            .memberships
            .iter()
            .filter(|(a, _)| *a == actor_id)
            .map(|(_, g)| *g)
            .collect::<HashSet<_>>();

        inner
            .policies
            .values()
            .filter(|p| {
                p.is_active() && p.resource_id == resource_id && groups.contains(&p.actor_group_id)
            })
            .cloned()
            .collect()
    }

    /// Renders the gateway groups of a resource as client-facing sites.
    pub fn sites_for_resource(&self, resource: &Resource) -> Vec<Site> {
        let inner = self.inner.lock();

        resource
            .gateway_groups
            .iter()
            .filter_map(|id| inner.gateway_groups.get(id))
            .filter(|g| g.deleted_at.is_none())
            .map(GatewayGroup::to_site)
            .collect()
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.inner.lock().flows.clone()
    }

    pub fn token(&self, token_id: TokenId) -> Option<Token> {
        self.inner.lock().tokens.get(&token_id).cloned()
    }
}

impl Inner {
    fn resolve_token(&self, secret: &SecretString, now: DateTime<Utc>) -> Result<Token, AuthError> {
        let hash = tokens::hash_secret(secret);

        let token_id = self.tokens_by_hash.get(&hash).ok_or(AuthError::NotFound)?;
        let token = self.tokens.get(token_id).ok_or(AuthError::NotFound)?;

        if token.secret_hash.is_none() {
            return Err(AuthError::NotFound);
        }

        if token.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(AuthError::Expired);
        }

        Ok(token.clone())
    }

    fn subject_for(
        &self,
        actor: &Actor,
        identity: Option<SubjectIdentity>,
        context: Context,
        expires_at: DateTime<Utc>,
    ) -> Result<Subject, AuthError> {
        if actor.deleted_at.is_some() {
            return Err(AuthError::NotFound);
        }

        if actor.disabled_at.is_some() {
            return Err(AuthError::Disabled);
        }

        self.require_active_account(actor.account_id)?;

        Ok(Subject {
            account_id: actor.account_id,
            actor_id: actor.id,
            actor_type: actor.kind,
            actor_role: actor.role,
            identity,
            context,
            permissions: permissions_for_role(actor.role),
            expires_at,
        })
    }

    fn require_active_account(&self, account_id: AccountId) -> Result<(), AuthError> {
        let account = self.accounts.get(&account_id).ok_or(AuthError::NotFound)?;

        if !account.is_active() {
            return Err(AuthError::NotFound);
        }

        Ok(())
    }

    fn insert_token(
        &mut self,
        account_id: Option<AccountId>,
        kind: TokenKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> (TokenId, SecretString) {
        let secret = tokens::generate_secret();
        let hash = tokens::hash_secret(&secret);

        let token = Token {
            id: TokenId::random(),
            account_id,
            kind,
            secret_hash: Some(hash.clone()),
            expires_at,
            created_at: Utc::now(),
        };

        self.tokens_by_hash.insert(hash, token.id);
        let id = token.id;
        self.tokens.insert(id, token);

        (id, secret)
    }

    fn visible_actor(&self, subject: &Subject, actor_id: ActorId) -> Result<Actor, StoreError> {
        self.actors
            .get(&actor_id)
            .filter(|a| a.account_id == subject.account_id && a.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn visible_group(&self, subject: &Subject, group_id: GroupId) -> Result<Group, StoreError> {
        self.groups
            .get(&group_id)
            .filter(|g| g.account_id == subject.account_id && g.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn count_active_admins(&self, account_id: AccountId) -> usize {
        self.actors
            .values()
            .filter(|a| a.account_id == account_id && a.is_active_admin())
            .count()
    }
}

fn validate_address(kind: ResourceKind, address: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidAddress(address.to_owned());

    match kind {
        ResourceKind::Dns => {
            if address.is_empty() {
                return Err(invalid());
            }
        }
        ResourceKind::Cidr => {
            address
                .parse::<ip_network::IpNetwork>()
                .map_err(|_| invalid())?;
        }
        ResourceKind::Ip => {
            address.parse::<IpAddr>().map_err(|_| invalid())?;
        }
    }

    Ok(())
}
