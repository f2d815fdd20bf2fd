//! The per-client session task.
//!
//! State machine: `joining → ready → closed`. While joining, only the
//! `phx_join` handshake (and heartbeats) are accepted; once ready, the task
//! multiplexes socket frames, mailbox commands, store events, relay presence
//! and the token-expiry timer. All pushes to the socket happen from this one
//! task, which is what preserves per-session ordering.

use crate::sessions::broker::{BrokeredPayload, BrokeredRequest};
use crate::sessions::{
    ClientCommand, ClientMeta, CloseReason, GatewayCommand, MAILBOX_CAPACITY, SessionIo,
    SessionMeta,
};
use crate::{App, MAX_TOKEN_TIMER, relay_freshness_window, relays, resolver};
use chrono::Utc;
use futures::StreamExt as _;
use futures::stream::SelectAll;
use portal_auth::Subject;
use portal_messages::client::{
    ConnectionPrepared, EgressMessages, GatewayIceCandidates, IngressMessages, InitClient,
    ReplyMessages, ReuseConnection,
};
use portal_messages::{
    DisconnectReason, DnsServer, Empty, ErrorReply, Interface, Payload, PhoenixMessage, Relay,
    RelaysPresence, RequestId, parse_upstream_dns,
};
use portal_model::{
    GatewayId, MIN_CLIENT_VERSION, ResourceId, gateway_requirement, gateway_supports_address,
    parse_version,
};
use portal_policy::{Evaluation, ViolatedProperty, conforms};
use portal_pubsub::{PresenceEvent, Subscription};
use portal_store::{Client, Event, Resource, ResourceKind, topics};
use semver::Version;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const TOPIC: &str = "client";

type Frame = PhoenixMessage<IngressMessages, Empty>;

/// Runs a client session to completion.
///
/// `subject` was authenticated at connect time; `version` is the raw version
/// string the client reported and is validated at join.
pub async fn run(
    app: Arc<App>,
    subject: Subject,
    version: String,
    external_id: Option<String>,
    io: SessionIo,
) {
    let Some(mut session) = join(app, subject, version, external_id, io).await else {
        return;
    };

    let reason = session.ready_loop().await;

    session.close(reason).await;
}

struct Session {
    app: Arc<App>,
    subject: Subject,
    version: Version,
    client: Client,
    io: SessionIo,
    mailbox: mpsc::Receiver<ClientCommand>,
    store_events: SelectAll<Subscription<Event>>,
    relay_events: SelectAll<Subscription<PresenceEvent<String, SessionMeta>>>,
    resolver: resolver::Resolver,
}

/// The joining phase: wait for `phx_join`, validate, register, push `init`.
async fn join(
    app: Arc<App>,
    subject: Subject,
    version: String,
    external_id: Option<String>,
    mut io: SessionIo,
) -> Option<Session> {
    loop {
        let raw = io.inbound.recv().await?;

        tracing::trace!(target: "wire::client::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing client session on malformed frame: {e}");
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
                let parsed = parse_version(&version)
                    .ok()
                    .filter(|v| *v >= MIN_CLIENT_VERSION);

                let Some(client_version) = parsed else {
                    tracing::info!(%version, "Rejecting client with unsupported version");
                    send(
                        &io.outbound,
                        &reply_err(&topic, ErrorReply::InvalidVersion, reference),
                    )
                    .await;
                    return None;
                };

                let client = match app.store.upsert_client(
                    &subject,
                    portal_store::ClientParams {
                        external_id,
                        version: client_version.clone(),
                    },
                ) {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!("Failed to register client: {e}");
                        send(
                            &io.outbound,
                            &reply_err(&topic, ErrorReply::RetryLater, reference),
                        )
                        .await;
                        return None;
                    }
                };

                let session =
                    Session::start(app, subject, client_version, client, io, reference).await;

                return Some(session);
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
        subject: Subject,
        version: Version,
        client: Client,
        io: SessionIo,
        join_ref: Option<RequestId>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);

        // Subscriptions are opened before presence registration so that no
        // event between the two can be missed.
        let mut store_events = SelectAll::new();
        store_events.push(app.bus.subscribe(&topics::resources(subject.account_id)));
        store_events.push(app.bus.subscribe(&topics::policies(subject.account_id)));
        store_events.push(app.bus.subscribe(&topics::memberships(subject.actor_id)));
        store_events.push(app.bus.subscribe(&topics::account(subject.account_id)));
        store_events.push(app.bus.subscribe(&topics::session(client.id)));

        let account_relay_topic = topics::account_relays(subject.account_id);
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
            &topics::clients(subject.account_id),
            client.id.to_string(),
            SessionMeta::Client(ClientMeta {
                client_id: client.id,
                mailbox: mailbox_tx,
            }),
        );

        let resolver = resolver::Resolver::new(resolver::derive_views(
            &app.store,
            subject.actor_id,
            &version,
        ));

        let session = Self {
            app,
            subject,
            version,
            client,
            io,
            mailbox: mailbox_rx,
            store_events,
            relay_events,
            resolver,
        };

        session.push(&reply_ok(TOPIC, join_ref)).await;
        session
            .push(&message(EgressMessages::Init(InitClient {
                interface: session.interface(),
                resources: session.resolver.views(),
                relays: session.selected_relays(),
            })))
            .await;

        session
    }

    async fn ready_loop(&mut self) -> CloseReason {
        let expiry = expiry_timer(self.subject.expires_at);
        tokio::pin!(expiry);

        let shutdown = shutdown_requested(self.app.shutdown_signal());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                frame = self.io.inbound.recv() => {
                    let Some(raw) = frame else {
                        return CloseReason::SocketClosed;
                    };

                    match self.handle_frame(raw).await {
                        Some(reason) => return reason,
                        None => {}
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

                    if let Some(reason) = self.handle_store_event(event).await {
                        return reason;
                    }
                }
                event = self.relay_events.next() => {
                    let Some(event) = event else {
                        continue;
                    };

                    self.handle_relay_event(event).await;
                }
                () = &mut expiry => {
                    return CloseReason::TokenExpired;
                }
                () = &mut shutdown => {
                    return CloseReason::Shutdown;
                }
            }
        }
    }

    async fn close(self, reason: CloseReason) {
        tracing::info!(client_id = %self.client.id, ?reason, "Closing client session");

        match reason {
            CloseReason::TokenExpired | CloseReason::ForceDisconnect => {
                self.push(&disconnect(DisconnectReason::TokenExpired)).await;
            }
            CloseReason::Shutdown => {
                self.push(&disconnect(DisconnectReason::Shutdown)).await;
            }
            CloseReason::SocketClosed | CloseReason::LeftTopic | CloseReason::MalformedFrame => {}
        }

        // Deregistering presence announces the leave to subscribers; pending
        // flow correlations die with the spawned tasks' reply senders.
        self.app.presence.untrack(
            &topics::clients(self.subject.account_id),
            &self.client.id.to_string(),
        );
    }

    // ----- Inbound frames -------------------------------------------------

    async fn handle_frame(&mut self, raw: String) -> Option<CloseReason> {
        tracing::trace!(target: "wire::client::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing client session on malformed frame: {e}");
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
                self.handle_rpc(message, reference).await;
            }
            Payload::Reply(_) | Payload::Disconnect { .. } => {
                tracing::debug!("Ignoring unexpected frame from client");
            }
        }

        None
    }

    async fn handle_rpc(&mut self, message: IngressMessages, reference: Option<RequestId>) {
        match message {
            IngressMessages::PrepareConnection { resource_id } => {
                let reply = self.prepare_connection(resource_id);
                self.reply(reply, reference).await;
            }
            IngressMessages::ReuseConnection(ReuseConnection {
                resource_id,
                gateway_id,
                payload,
            }) => {
                let brokered = self.authorize_connection(resource_id, gateway_id, |expires_at| {
                    BrokeredPayload::AllowAccess {
                        resource_id,
                        client_id: self.client.id,
                        authorization_expires_at: expires_at,
                        client_payload: payload.clone(),
                    }
                });

                self.broker(brokered, resource_id, gateway_id, reference).await;
            }
            IngressMessages::RequestConnection(request) => {
                let resource_id = request.resource_id;
                let gateway_id = request.gateway_id;

                let brokered = self.authorize_connection(resource_id, gateway_id, |expires_at| {
                    BrokeredPayload::RequestConnection {
                        resource_id,
                        client_id: self.client.id,
                        authorization_expires_at: expires_at,
                        client_payload: request.client_payload.clone(),
                        client_preshared_key: request.client_preshared_key.clone(),
                    }
                });

                self.broker(brokered, resource_id, gateway_id, reference).await;
            }
            IngressMessages::BroadcastIceCandidates(broadcast) => {
                self.forward_ice_candidates(broadcast, false);
            }
            IngressMessages::BroadcastInvalidatedIceCandidates(broadcast) => {
                self.forward_ice_candidates(broadcast, true);
            }
        }
    }

    /// RPC 1: pick an online, version-compatible gateway for a resource.
    fn prepare_connection(&self, resource_id: ResourceId) -> Result<ReplyMessages, ErrorReply> {
        let resource = self.visible_resource(resource_id)?;

        let mut gateways = self
            .online_gateways_for(&resource)
            .ok_or(ErrorReply::Offline)?;

        gateways.sort_by_key(|meta| meta.gateway_id);
        let chosen = &gateways[self.client.id.as_u128() as usize % gateways.len()];

        Ok(ReplyMessages::ConnectionPrepared(ConnectionPrepared {
            resource_id,
            gateway_id: chosen.gateway_id,
            gateway_remote_ip: chosen.remote_ip,
        }))
    }

    /// The shared authorization path of RPCs 2 and 3. On success the flow is
    /// recorded and the payload is ready to hand to the gateway session.
    fn authorize_connection(
        &self,
        resource_id: ResourceId,
        gateway_id: GatewayId,
        make_payload: impl Fn(chrono::DateTime<Utc>) -> BrokeredPayload,
    ) -> Result<(BrokeredPayload, mpsc::Sender<GatewayCommand>), ErrorReply> {
        let resource = self.visible_resource(resource_id)?;

        let gateway = self
            .app
            .store
            .gateway(gateway_id)
            .filter(|g| g.account_id == self.subject.account_id)
            .ok_or(ErrorReply::NotFound)?;

        let meta = self
            .app
            .presence
            .get(
                &topics::gateways(self.subject.account_id),
                &gateway_id.to_string(),
            )
            .and_then(|meta| meta.as_gateway().cloned())
            .ok_or(ErrorReply::Offline)?;

        if !resource.gateway_groups.contains(&meta.group_id) {
            return Err(ErrorReply::Offline);
        }

        let policies = self
            .app
            .store
            .granting_policies(self.subject.actor_id, resource_id);

        let evaluation = Evaluation {
            remote_ip: self.subject.context.remote_ip,
            region: self.subject.context.region.clone(),
            provider_id: self.subject.identity.map(|i| i.provider_id),
            now: Utc::now(),
        };

        let mut violated = BTreeSet::new();
        let mut authorized = None;

        for policy in &policies {
            match conforms(&policy.conditions, &evaluation) {
                Ok(()) => {
                    authorized = Some(policy);
                    break;
                }
                Err(properties) => violated.extend(properties),
            }
        }

        let Some(policy) = authorized else {
            return Err(ErrorReply::Forbidden {
                violated_properties: violated.into_iter().collect::<Vec<ViolatedProperty>>(),
            });
        };

        let flow = self.app.store.create_flow(
            &self.client,
            &gateway,
            policy.id,
            resource_id,
            self.subject.expires_at,
        );

        tracing::debug!(flow_id = %flow.id, %resource_id, %gateway_id, "Authorized flow");

        Ok((make_payload(self.subject.expires_at), meta.mailbox))
    }

    /// Hands the brokered payload to the gateway session and spawns the
    /// reply-correlation task so this loop keeps serving other events.
    async fn broker(
        &self,
        brokered: Result<(BrokeredPayload, mpsc::Sender<GatewayCommand>), ErrorReply>,
        resource_id: ResourceId,
        gateway_id: GatewayId,
        reference: Option<RequestId>,
    ) {
        let (payload, gateway_mailbox) = match brokered {
            Ok(parts) => parts,
            Err(error) => {
                self.reply(Err(error), reference).await;
                return;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BrokeredRequest {
            payload,
            reply: reply_tx,
        };

        let outbound = self.io.outbound.clone();
        let rpc_timeout = self.app.config.rpc_timeout;
        let persistent_keepalive = self.app.config.persistent_keepalive;

        tokio::spawn(async move {
            if gateway_mailbox
                .send(GatewayCommand::Broker(request))
                .await
                .is_err()
            {
                tracing::debug!(%gateway_id, "Gateway session went away before brokering");
                send(&outbound, &reply_to(TOPIC, Err(ErrorReply::Offline), reference)).await;
                return;
            }

            let reply = match tokio::time::timeout(rpc_timeout, reply_rx).await {
                Ok(Ok(ready)) => Ok(ReplyMessages::Connect(portal_messages::client::Connect {
                    resource_id: ready.resource_id,
                    gateway_public_key: ready.gateway_public_key,
                    gateway_payload: ready.gateway_payload,
                    persistent_keepalive,
                })),
                Ok(Err(_)) => {
                    tracing::debug!(%gateway_id, "Gateway session closed mid-request");
                    Err(ErrorReply::Offline)
                }
                Err(_) => {
                    tracing::debug!(%gateway_id, %resource_id, "Timed out waiting for gateway reply");
                    Err(ErrorReply::Offline)
                }
            };

            send(&outbound, &reply_to(TOPIC, reply, reference)).await;
        });
    }

    fn forward_ice_candidates(
        &self,
        broadcast: portal_messages::client::BroadcastIceCandidates,
        invalidate: bool,
    ) {
        if broadcast.gateway_ids.is_empty() {
            return;
        }

        for gateway_id in broadcast.gateway_ids {
            let Some(meta) = self
                .app
                .presence
                .get(
                    &topics::gateways(self.subject.account_id),
                    &gateway_id.to_string(),
                )
                .and_then(|meta| meta.as_gateway().cloned())
            else {
                continue;
            };

            let command = if invalidate {
                GatewayCommand::InvalidateIceCandidates {
                    client_id: self.client.id,
                    candidates: broadcast.candidates.clone(),
                }
            } else {
                GatewayCommand::IceCandidates {
                    client_id: self.client.id,
                    candidates: broadcast.candidates.clone(),
                }
            };

            // Candidates are idempotent resends; a full gateway mailbox just
            // drops them.
            if meta.mailbox.try_send(command).is_err() {
                tracing::debug!(%gateway_id, "Gateway mailbox full; dropping ICE candidates");
            }
        }
    }

    // ----- Mailbox --------------------------------------------------------

    async fn handle_command(&mut self, command: ClientCommand) {
        let event = match command {
            ClientCommand::IceCandidates {
                gateway_id,
                candidates,
            } => EgressMessages::IceCandidates(GatewayIceCandidates {
                gateway_id,
                candidates,
            }),
            ClientCommand::InvalidateIceCandidates {
                gateway_id,
                candidates,
            } => EgressMessages::InvalidateIceCandidates(GatewayIceCandidates {
                gateway_id,
                candidates,
            }),
        };

        self.push(&message(event)).await;
    }

    // ----- Store events ---------------------------------------------------

    async fn handle_store_event(&mut self, event: Event) -> Option<CloseReason> {
        match event {
            Event::ResourceCreatedOrUpdated { .. }
            | Event::PolicyCreated { .. }
            | Event::PolicyUpdated { .. }
            | Event::PolicyEnabled { .. }
            | Event::MembershipAdded { .. }
            | Event::MembershipRemoved { .. } => {
                self.push_resource_deltas(None).await;
            }
            Event::PolicyDisabled { resource_id, .. } | Event::PolicyDeleted { resource_id, .. } => {
                // A revoked grant whose resource another policy still covers
                // must be re-learned by the client.
                self.push_resource_deltas(Some(resource_id)).await;
            }
            Event::ResourceDeleted { .. } => {
                // Deliberately ignored: resource deletion reaches clients
                // only through the policy/membership path.
            }
            Event::ConfigChanged => {
                self.push(&message(EgressMessages::ConfigChanged(
                    portal_messages::client::ConfigUpdate {
                        interface: self.interface(),
                    },
                )))
                .await;
            }
            Event::ForceDisconnect => {
                return Some(CloseReason::ForceDisconnect);
            }
        }

        None
    }

    async fn push_resource_deltas(&mut self, refresh: Option<ResourceId>) {
        let target = resolver::derive_views(&self.app.store, self.subject.actor_id, &self.version);
        let refresh = refresh.filter(|id| target.contains_key(id));

        for delta in self.resolver.apply(target, refresh) {
            self.push(&message(delta)).await;
        }
    }

    // ----- Relay presence -------------------------------------------------

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

    fn selected_relays(&self) -> Vec<Relay> {
        let now = Utc::now();
        let mut candidates = Vec::new();

        for topic in [
            topics::account_relays(self.subject.account_id),
            topics::relays(),
        ] {
            for (_, _, meta) in self.app.presence.list(&topic) {
                let Some(relay) = meta.as_relay() else {
                    continue;
                };

                let fresh = self
                    .app
                    .store
                    .relay(relay.relay_id)
                    .is_none_or(|record| now - record.last_seen_at <= relay_freshness_window());

                if fresh {
                    candidates.push(relay.clone());
                }
            }
        }

        let chosen = relays::select_relays(
            candidates,
            self.client.location,
            self.app.config.relays_to_offer,
        );

        chosen
            .iter()
            .filter_map(|meta| relays::render_relay(meta, &self.client.id.to_string(), now))
            .collect()
    }

    // ----- Helpers --------------------------------------------------------

    fn visible_resource(&self, resource_id: ResourceId) -> Result<Resource, ErrorReply> {
        let resource = self
            .app
            .store
            .resource(resource_id)
            .filter(|r| r.account_id == self.subject.account_id)
            .ok_or(ErrorReply::NotFound)?;

        // Invisible and missing are indistinguishable on purpose.
        if self
            .app
            .store
            .granting_policies(self.subject.actor_id, resource_id)
            .is_empty()
        {
            return Err(ErrorReply::NotFound);
        }

        Ok(resource)
    }

    /// Online gateways able to serve `resource` for this client's version.
    fn online_gateways_for(&self, resource: &Resource) -> Option<Vec<crate::sessions::GatewayMeta>> {
        let requirement = gateway_requirement(&self.version);

        let gateways = self
            .app
            .presence
            .list(&topics::gateways(self.subject.account_id))
            .into_iter()
            .filter_map(|(_, _, meta)| meta.as_gateway().cloned())
            .filter(|meta| resource.gateway_groups.contains(&meta.group_id))
            .filter(|meta| requirement.matches(&meta.version))
            .filter(|meta| {
                resource.kind != ResourceKind::Dns
                    || gateway_supports_address(&meta.version, &resource.address)
            })
            .collect::<Vec<_>>();

        if gateways.is_empty() {
            return None;
        }

        Some(gateways)
    }

    fn interface(&self) -> Interface {
        let upstream_dns = self
            .app
            .store
            .account(self.subject.account_id)
            .map(|account| account.config.upstream_dns)
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| parse_upstream_dns(entry))
            .collect::<Vec<DnsServer>>();

        Interface {
            ipv4: self.client.ipv4,
            ipv6: self.client.ipv6,
            upstream_dns,
        }
    }

    async fn reply(&self, reply: Result<ReplyMessages, ErrorReply>, reference: Option<RequestId>) {
        self.push(&reply_to(TOPIC, reply, reference)).await;
    }

    async fn push<T: serde::Serialize>(&self, frame: &T) {
        send(&self.io.outbound, frame).await;
    }
}

/// Resolves when a graceful shutdown was requested; pends forever if the
/// shutdown sender is gone (nobody can request one anymore).
pub(crate) async fn shutdown_requested(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves when the subject expires; never resolves for far-future tokens.
async fn expiry_timer(expires_at: chrono::DateTime<Utc>) {
    let Ok(until_expiry) = (expires_at - Utc::now()).to_std() else {
        // Already expired; fire immediately.
        return;
    };

    if until_expiry > MAX_TOKEN_TIMER {
        std::future::pending::<()>().await;
    }

    tokio::time::sleep(until_expiry).await;
}

// ----- Frame constructors (shared with the other session kinds) -----------

pub(crate) fn reply_ok(topic: &str, reference: Option<RequestId>) -> PhoenixMessage<(), Empty> {
    PhoenixMessage::new_empty_reply(topic, reference)
}

pub(crate) fn reply_err(
    topic: &str,
    error: ErrorReply,
    reference: Option<RequestId>,
) -> PhoenixMessage<(), Empty> {
    PhoenixMessage::new_err_reply(topic, error, reference)
}

fn reply_to(
    topic: &str,
    reply: Result<ReplyMessages, ErrorReply>,
    reference: Option<RequestId>,
) -> PhoenixMessage<EgressMessages, ReplyMessages> {
    match reply {
        Ok(message) => PhoenixMessage::new_ok_reply(topic, message, reference),
        Err(error) => PhoenixMessage::new_err_reply(topic, error, reference),
    }
}

fn message(event: EgressMessages) -> PhoenixMessage<EgressMessages, ReplyMessages> {
    PhoenixMessage::new_message(TOPIC, event, None)
}

fn disconnect(reason: DisconnectReason) -> PhoenixMessage<(), Empty> {
    PhoenixMessage::new_disconnect(TOPIC, reason)
}

pub(crate) async fn send<T: serde::Serialize>(outbound: &mpsc::Sender<String>, frame: &T) {
    let raw = serde_json::to_string(frame).expect("wire messages always serialize");

    tracing::trace!(target: "wire::client::send", message = %raw);

    if outbound.send(raw).await.is_err() {
        tracing::debug!("Socket writer is gone; dropping frame");
    }
}
