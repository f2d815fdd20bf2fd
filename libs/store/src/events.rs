//! Change events published by the store and the topic scheme they travel on.

use portal_model::{AccountId, ActorId, ClientId, GroupId, PolicyId, ResourceId};

/// Everything that can happen to control-plane data while sessions are
/// connected. Sessions subscribe per topic (see [`topics`]) and re-derive
/// their client-facing state from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ResourceCreatedOrUpdated {
        resource_id: ResourceId,
    },
    ResourceDeleted {
        resource_id: ResourceId,
    },
    PolicyCreated {
        policy_id: PolicyId,
        actor_group_id: GroupId,
        resource_id: ResourceId,
    },
    PolicyUpdated {
        policy_id: PolicyId,
        actor_group_id: GroupId,
        resource_id: ResourceId,
    },
    PolicyDisabled {
        policy_id: PolicyId,
        actor_group_id: GroupId,
        resource_id: ResourceId,
    },
    PolicyEnabled {
        policy_id: PolicyId,
        actor_group_id: GroupId,
        resource_id: ResourceId,
    },
    PolicyDeleted {
        policy_id: PolicyId,
        actor_group_id: GroupId,
        resource_id: ResourceId,
    },
    MembershipAdded {
        actor_id: ActorId,
        group_id: GroupId,
    },
    MembershipRemoved {
        actor_id: ActorId,
        group_id: GroupId,
    },
    /// The account configuration changed; connected clients re-learn their
    /// interface.
    ConfigChanged,
    /// An operator (or token revocation) wants this session gone.
    ForceDisconnect,
}

/// The topic scheme shared by the store, the sessions and the presence
/// registry.
pub mod topics {
    use super::*;

    pub fn resources(account_id: AccountId) -> String {
        format!("resources:{account_id}")
    }

    pub fn policies(account_id: AccountId) -> String {
        format!("policies:{account_id}")
    }

    pub fn memberships(actor_id: ActorId) -> String {
        format!("actor_memberships:{actor_id}")
    }

    pub fn account(account_id: AccountId) -> String {
        format!("accounts:{account_id}")
    }

    /// The client-direct topic, used for force-disconnects.
    pub fn session(client_id: ClientId) -> String {
        format!("sessions:{client_id}")
    }

    pub fn clients(account_id: AccountId) -> String {
        format!("clients:{account_id}")
    }

    pub fn gateways(account_id: AccountId) -> String {
        format!("gateways:{account_id}")
    }

    pub fn account_relays(account_id: AccountId) -> String {
        format!("relays:{account_id}")
    }

    /// The global relay pool.
    pub fn relays() -> String {
        "relays".to_owned()
    }
}
