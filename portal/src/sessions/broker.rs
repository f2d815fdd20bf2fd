//! Request/response correlation between client and gateway sessions.
//!
//! A client RPC that needs a gateway answer carries a oneshot sender into the
//! gateway session's mailbox. The gateway session stamps the outgoing frame
//! with a `ref`, remembers the pending sender under it and resolves it when
//! the gateway echoes the `ref` back in its `connect` message. Dropping
//! either end cancels the correlation: the client's await fails, the
//! gateway's late reply is discarded.

use chrono::{DateTime, Utc};
use portal_messages::gateway;
use portal_model::{ClientId, GatewayId, ResourceId};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// What the portal forwards to the gateway, sans `ref`; the gateway session
/// assigns one when it serializes the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokeredPayload {
    RequestConnection {
        resource_id: ResourceId,
        client_id: ClientId,
        authorization_expires_at: DateTime<Utc>,
        client_payload: String,
        client_preshared_key: String,
    },
    AllowAccess {
        resource_id: ResourceId,
        client_id: ClientId,
        authorization_expires_at: DateTime<Utc>,
        client_payload: Option<String>,
    },
}

pub struct BrokeredRequest {
    pub payload: BrokeredPayload,
    pub reply: oneshot::Sender<gateway::ConnectionReady>,
}

/// The gateway session's table of in-flight brokered requests.
#[derive(Default)]
pub struct PendingReplies {
    next_ref: u64,
    pending: HashMap<String, oneshot::Sender<gateway::ConnectionReady>>,
}

impl PendingReplies {
    /// Registers a brokered request and returns the wire message to send.
    pub fn register(
        &mut self,
        gateway_id: GatewayId,
        request: BrokeredRequest,
    ) -> gateway::EgressMessages {
        let reference = format!("{gateway_id}:{}", self.next_ref);
        self.next_ref += 1;

        let message = match request.payload {
            BrokeredPayload::RequestConnection {
                resource_id,
                client_id,
                authorization_expires_at,
                client_payload,
                client_preshared_key,
            } => gateway::EgressMessages::RequestConnection(gateway::RequestConnection {
                reference: reference.clone(),
                resource_id,
                client_id,
                authorization_expires_at,
                client_payload,
                client_preshared_key,
            }),
            BrokeredPayload::AllowAccess {
                resource_id,
                client_id,
                authorization_expires_at,
                client_payload,
            } => gateway::EgressMessages::AllowAccess(gateway::AllowAccess {
                reference: reference.clone(),
                resource_id,
                client_id,
                authorization_expires_at,
                client_payload,
            }),
        };

        self.pending.insert(reference, request.reply);

        message
    }

    /// Resolves a gateway `connect` answer back to the awaiting client.
    ///
    /// Unknown or already-cancelled refs are dropped; the client has timed
    /// out or gone away and must not receive a stale reply.
    pub fn resolve(&mut self, ready: gateway::ConnectionReady) {
        let Some(reply) = self.pending.remove(&ready.reference) else {
            tracing::debug!(reference = %ready.reference, "Dropping reply for unknown ref");
            return;
        };

        if reply.send(ready).is_err() {
            tracing::debug!("Awaiting client session is gone; dropping reply");
        }
    }

    /// Drops senders whose receiving client has given up.
    pub fn sweep(&mut self) {
        self.pending.retain(|_, reply| !reply.is_closed());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The deadline for a cross-session reply.
pub const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use portal_model::Key;

    fn request(reply: oneshot::Sender<gateway::ConnectionReady>) -> BrokeredRequest {
        BrokeredRequest {
            payload: BrokeredPayload::AllowAccess {
                resource_id: ResourceId::from_u128(1),
                client_id: ClientId::from_u128(2),
                authorization_expires_at: Utc::now(),
                client_payload: None,
            },
            reply,
        }
    }

    fn ready(reference: &str) -> gateway::ConnectionReady {
        gateway::ConnectionReady {
            reference: reference.to_owned(),
            resource_id: ResourceId::from_u128(1),
            gateway_public_key: Key([1u8; 32]),
            gateway_payload: "SDP".to_owned(),
        }
    }

    #[tokio::test]
    async fn refs_are_unique_per_gateway_session() {
        let mut pending = PendingReplies::default();
        let gateway_id = GatewayId::from_u128(9);

        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();

        let a = pending.register(gateway_id, request(tx_a));
        let b = pending.register(gateway_id, request(tx_b));

        let reference = |m: &gateway::EgressMessages| match m {
            gateway::EgressMessages::AllowAccess(a) => a.reference.clone(),
            _ => panic!("expected allow_access"),
        };

        assert_ne!(reference(&a), reference(&b));
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn resolve_routes_to_the_matching_waiter() {
        let mut pending = PendingReplies::default();
        let gateway_id = GatewayId::from_u128(9);

        let (tx, rx) = oneshot::channel();
        let message = pending.register(gateway_id, request(tx));

        let gateway::EgressMessages::AllowAccess(allow) = message else {
            panic!("expected allow_access")
        };

        pending.resolve(ready(&allow.reference));

        let received = rx.await.unwrap();
        assert_eq!(received.gateway_payload, "SDP");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_refs_are_dropped() {
        let mut pending = PendingReplies::default();

        pending.resolve(ready("gateway:unknown"));
    }

    #[tokio::test]
    async fn sweep_discards_cancelled_waiters() {
        let mut pending = PendingReplies::default();
        let gateway_id = GatewayId::from_u128(9);

        let (tx, rx) = oneshot::channel();
        pending.register(gateway_id, request(tx));

        drop(rx);
        pending.sweep();

        assert!(pending.is_empty());
    }
}
