//! The per-gateway session task.
//!
//! A simpler mirror of the client session: gateways receive no resource
//! pushes. Their job is to answer brokered connection requests (correlated by
//! `ref`) and to exchange ICE candidates with clients.

use crate::sessions::broker::PendingReplies;
use crate::sessions::client::{reply_err, reply_ok, send, shutdown_requested};
use crate::sessions::{
    ClientCommand, CloseReason, GatewayCommand, GatewayMeta, MAILBOX_CAPACITY, SessionIo,
    SessionMeta,
};
use crate::{App, relays};
use chrono::Utc;
use futures::StreamExt as _;
use futures::stream::SelectAll;
use portal_messages::gateway::{
    BroadcastClientIceCandidates, ClientIceCandidates, EgressMessages, IngressMessages,
    InitGateway, RejectAccess,
};
use portal_messages::{
    DisconnectReason, Empty, ErrorReply, Payload, PhoenixMessage, RelaysPresence, RequestId,
};
use portal_model::ClientId;
use portal_pubsub::{PresenceEvent, Subscription};
use portal_store::{Gateway, GatewayAuth, topics};
use std::sync::Arc;
use tokio::sync::mpsc;

const TOPIC: &str = "gateway";

type Frame = PhoenixMessage<IngressMessages, Empty>;

pub async fn run(app: Arc<App>, auth: GatewayAuth, gateway: Gateway, io: SessionIo) {
    let Some(mut session) = join(app, auth, gateway, io).await else {
        return;
    };

    let reason = session.ready_loop().await;

    session.close(reason).await;
}

struct Session {
    app: Arc<App>,
    auth: GatewayAuth,
    gateway: Gateway,
    io: SessionIo,
    mailbox: mpsc::Receiver<GatewayCommand>,
    store_events: Subscription<portal_store::Event>,
    relay_events: SelectAll<Subscription<PresenceEvent<String, SessionMeta>>>,
    pending: PendingReplies,
}

async fn join(
    app: Arc<App>,
    auth: GatewayAuth,
    gateway: Gateway,
    mut io: SessionIo,
) -> Option<Session> {
    loop {
        let raw = io.inbound.recv().await?;

        tracing::trace!(target: "wire::gateway::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing gateway session on malformed frame: {e}");
                return None;
            }
        };

        let (topic, reference, payload) = frame.into_parts();

        match payload {
            Payload::Heartbeat(_) => {
                send(&io.outbound, &reply_ok(&topic, reference)).await;
            }
            Payload::Join(_) if topic != TOPIC => {
                send(
                    &io.outbound,
                    &reply_err(&topic, ErrorReply::UnmatchedTopic, reference),
                )
                .await;
            }
            Payload::Join(_) => {
                return Some(Session::start(app, auth, gateway, io, reference).await);
            }
            Payload::Leave(_) => {
                send(&io.outbound, &reply_ok(&topic, reference)).await;
                return None;
            }
            Payload::Message(_) | Payload::Reply(_) | Payload::Disconnect { .. } => {
                tracing::debug!("Ignoring frame before join");
            }
        }
    }
}

impl Session {
    async fn start(
        app: Arc<App>,
        auth: GatewayAuth,
        gateway: Gateway,
        io: SessionIo,
        join_ref: Option<RequestId>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let account_relay_topic = topics::account_relays(auth.account_id);
        let has_dedicated_relays = app
            .presence
            .list(&account_relay_topic)
            .iter()
            .any(|(_, _, meta)| meta.as_relay().is_some());

        let mut relay_events = SelectAll::new();
        relay_events.push(app.presence.subscribe(&account_relay_topic));
        if !has_dedicated_relays {
            relay_events.push(app.presence.subscribe(&topics::relays()));
        }

        app.presence.track(
            &topics::gateways(auth.account_id),
            gateway.id.to_string(),
            SessionMeta::Gateway(GatewayMeta {
                gateway_id: gateway.id,
                group_id: auth.group_id,
                version: gateway.last_seen_version.clone(),
                remote_ip: gateway.last_seen_remote_ip,
                mailbox: mailbox_tx,
            }),
        );

        let account_slug = app.store.account(auth.account_id).map(|a| a.slug);
        let store_events = app.bus.subscribe(&topics::policies(auth.account_id));

        let session = Self {
            app,
            auth,
            gateway,
            io,
            mailbox: mailbox_rx,
            store_events,
            relay_events,
            pending: PendingReplies::default(),
        };

        session.push(&reply_ok(TOPIC, join_ref)).await;
        session
            .push(&message(EgressMessages::Init(InitGateway {
                account_slug,
                relays: session.selected_relays(),
            })))
            .await;

        session
    }

    async fn ready_loop(&mut self) -> CloseReason {
        let shutdown = shutdown_requested(self.app.shutdown_signal());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                frame = self.io.inbound.recv() => {
                    let Some(raw) = frame else {
                        return CloseReason::SocketClosed;
                    };

                    if let Some(reason) = self.handle_frame(raw).await {
                        return reason;
                    }
                }
                command = self.mailbox.recv() => {
                    let Some(command) = command else {
                        return CloseReason::SocketClosed;
                    };

                    self.handle_command(command).await;
                }
                event = self.store_events.next() => {
                    let Some(event) = event else {
                        continue;
                    };

                    self.handle_store_event(event).await;
                }
                event = self.relay_events.next() => {
                    let Some(event) = event else {
                        continue;
                    };

                    self.handle_relay_event(event).await;
                }
                () = &mut shutdown => {
                    return CloseReason::Shutdown;
                }
            }
        }
    }

    async fn close(self, reason: CloseReason) {
        tracing::info!(gateway_id = %self.gateway.id, ?reason, "Closing gateway session");

        if reason == CloseReason::Shutdown {
            self.push(&PhoenixMessage::<(), Empty>::new_disconnect(
                TOPIC,
                DisconnectReason::Shutdown,
            ))
            .await;
        }

        // Dropping `pending` cancels every in-flight brokered request; the
        // awaiting clients observe `offline`.
        self.app.presence.untrack(
            &topics::gateways(self.auth.account_id),
            &self.gateway.id.to_string(),
        );
    }

    async fn handle_frame(&mut self, raw: String) -> Option<CloseReason> {
        tracing::trace!(target: "wire::gateway::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing gateway session on malformed frame: {e}");
                return Some(CloseReason::MalformedFrame);
            }
        };

        let (topic, reference, payload) = frame.into_parts();

        match payload {
            Payload::Heartbeat(_) => {
                self.push(&reply_ok(&topic, reference)).await;
            }
            Payload::Leave(_) => {
                self.push(&reply_ok(&topic, reference)).await;
                return Some(CloseReason::LeftTopic);
            }
            Payload::Join(_) => {
                tracing::debug!("Ignoring duplicate join");
            }
            Payload::Message(message) => {
                self.handle_message(message);
            }
            Payload::Reply(_) | Payload::Disconnect { .. } => {
                tracing::debug!("Ignoring unexpected frame from gateway");
            }
        }

        None
    }

    fn handle_message(&mut self, message: IngressMessages) {
        match message {
            IngressMessages::Connect(ready) => {
                self.pending.resolve(ready);
            }
            IngressMessages::BroadcastIceCandidates(broadcast) => {
                self.forward_ice_candidates(broadcast, false);
            }
            IngressMessages::BroadcastInvalidatedIceCandidates(broadcast) => {
                self.forward_ice_candidates(broadcast, true);
            }
        }
    }

    fn forward_ice_candidates(&self, broadcast: BroadcastClientIceCandidates, invalidate: bool) {
        if broadcast.client_ids.is_empty() {
            return;
        }

        for client_id in broadcast.client_ids {
            let Some(meta) = self
                .app
                .presence
                .get(
                    &topics::clients(self.auth.account_id),
                    &client_id.to_string(),
                )
                .and_then(|meta| meta.as_client().cloned())
            else {
                continue;
            };

            let command = if invalidate {
                ClientCommand::InvalidateIceCandidates {
                    gateway_id: self.gateway.id,
                    candidates: broadcast.candidates.clone(),
                }
            } else {
                ClientCommand::IceCandidates {
                    gateway_id: self.gateway.id,
                    candidates: broadcast.candidates.clone(),
                }
            };

            if meta.mailbox.try_send(command).is_err() {
                tracing::debug!(%client_id, "Client mailbox full; dropping ICE candidates");
            }
        }
    }

    /// A revoked policy invalidates the flows it authorized; the gateway is
    /// told to stop serving them.
    async fn handle_store_event(&mut self, event: portal_store::Event) {
        let policy_id = match event {
            portal_store::Event::PolicyDisabled { policy_id, .. }
            | portal_store::Event::PolicyDeleted { policy_id, .. } => policy_id,
            _ => return,
        };

        let now = Utc::now();
        let revoked = self
            .app
            .store
            .flows()
            .into_iter()
            .filter(|flow| {
                flow.policy_id == policy_id
                    && flow.gateway_id == self.gateway.id
                    && flow.expires_at > now
            })
            .map(|flow| (flow.client_id, flow.resource_id))
            .collect::<std::collections::BTreeSet<_>>();

        for (client_id, resource_id) in revoked {
            self.push(&message(EgressMessages::RejectAccess(RejectAccess {
                client_id,
                resource_id,
            })))
            .await;
        }
    }

    async fn handle_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::Broker(request) => {
                // Drop correlations whose client has already given up before
                // registering new ones.
                self.pending.sweep();

                let brokered = self.pending.register(self.gateway.id, request);
                self.push(&message(brokered)).await;
            }
            GatewayCommand::IceCandidates {
                client_id,
                candidates,
            } => {
                self.push_candidates(client_id, candidates, false).await;
            }
            GatewayCommand::InvalidateIceCandidates {
                client_id,
                candidates,
            } => {
                self.push_candidates(client_id, candidates, true).await;
            }
        }
    }

    async fn push_candidates(&self, client_id: ClientId, candidates: Vec<String>, invalidate: bool) {
        let payload = ClientIceCandidates {
            client_id,
            candidates,
        };

        let event = if invalidate {
            EgressMessages::InvalidateIceCandidates(payload)
        } else {
            EgressMessages::IceCandidates(payload)
        };

        self.push(&message(event)).await;
    }

    async fn handle_relay_event(&mut self, event: PresenceEvent<String, SessionMeta>) {
        let (disconnected_ids, is_relay) = match &event {
            PresenceEvent::Leave { meta, .. } => match meta.as_relay() {
                Some(relay) => (vec![relay.relay_id], true),
                None => (Vec::new(), false),
            },
            PresenceEvent::Join { meta, .. } => (Vec::new(), meta.as_relay().is_some()),
        };

        if !is_relay {
            return;
        }

        self.push(&message(EgressMessages::RelaysPresence(RelaysPresence {
            disconnected_ids,
            connected: self.selected_relays(),
        })))
        .await;
    }

    fn selected_relays(&self) -> Vec<portal_messages::Relay> {
        let now = Utc::now();
        let mut candidates = Vec::new();

        for topic in [
            topics::account_relays(self.auth.account_id),
            topics::relays(),
        ] {
            for (_, _, meta) in self.app.presence.list(&topic) {
                if let Some(relay) = meta.as_relay() {
                    candidates.push(relay.clone());
                }
            }
        }

        // Gateways report no coordinates; ordering falls back to most
        // recently connected.
        let chosen = relays::select_relays(candidates, None, self.app.config.relays_to_offer);

        chosen
            .iter()
            .filter_map(|meta| relays::render_relay(meta, &self.gateway.id.to_string(), now))
            .collect()
    }

    async fn push<T: serde::Serialize>(&self, frame: &T) {
        send(&self.io.outbound, frame).await;
    }
}

fn message(event: EgressMessages) -> PhoenixMessage<EgressMessages, Empty> {
    PhoenixMessage::new_message(TOPIC, event, None)
}
