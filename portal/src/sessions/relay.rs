//! The per-relay session task.
//!
//! Relays are the simplest peers: they join with their addresses, location
//! and per-connection `stamp_secret`, heartbeat to stay fresh, and receive
//! nothing but `init`. Their value is the presence entry other sessions read
//! when selecting relays and deriving TURN credentials.

use crate::sessions::client::{reply_err, reply_ok, send, shutdown_requested};
use crate::sessions::{CloseReason, RelayMeta, SessionIo, SessionMeta};
use crate::App;
use chrono::Utc;
use portal_messages::relay::{EgressMessages, JoinPayload};
use portal_messages::{DisconnectReason, Empty, ErrorReply, Payload, PhoenixMessage, RequestId};
use portal_store::{Relay, RelayAuth, RelayParams, topics};
use std::sync::Arc;

const TOPIC: &str = "relay";

type Frame = PhoenixMessage<serde_json::Value, Empty>;

pub async fn run(app: Arc<App>, auth: RelayAuth, io: SessionIo) {
    let Some(mut session) = join(app, auth, io).await else {
        return;
    };

    let reason = session.ready_loop().await;

    session.close(reason).await;
}

struct Session {
    app: Arc<App>,
    relay: Relay,
    topic: String,
    io: SessionIo,
}

async fn join(app: Arc<App>, auth: RelayAuth, mut io: SessionIo) -> Option<Session> {
    loop {
        let raw = io.inbound.recv().await?;

        tracing::trace!(target: "wire::relay::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing relay session on malformed frame: {e}");
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
            Payload::Join(value) => {
                let payload = match serde_json::from_value::<JoinPayload>(value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Rejecting relay with malformed join payload: {e}");
                        send(
                            &io.outbound,
                            &reply_err(&topic, ErrorReply::UnmatchedTopic, reference),
                        )
                        .await;
                        return None;
                    }
                };

                return Some(Session::start(app, auth, payload, io, reference).await);
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
        auth: RelayAuth,
        payload: JoinPayload,
        io: SessionIo,
        join_ref: Option<RequestId>,
    ) -> Self {
        let relay = app.store.upsert_relay(
            &auth,
            RelayParams {
                ipv4: payload.ipv4,
                ipv6: payload.ipv6,
                port: payload.port,
                location: payload.lat.zip(payload.lon),
            },
        );

        let topic = match auth.account_id {
            Some(account_id) => topics::account_relays(account_id),
            None => topics::relays(),
        };

        app.presence.track(
            &topic,
            relay.id.to_string(),
            SessionMeta::Relay(RelayMeta {
                relay_id: relay.id,
                account_id: auth.account_id,
                ipv4: payload.ipv4,
                ipv6: payload.ipv6,
                port: payload.port,
                location: payload.lat.zip(payload.lon),
                stamp_secret: payload.stamp_secret,
                connected_at: Utc::now(),
            }),
        );

        let session = Self {
            app,
            relay,
            topic,
            io,
        };

        session
            .push(&reply_ok(TOPIC, join_ref))
            .await;
        session
            .push(&PhoenixMessage::<EgressMessages, Empty>::new_message(
                TOPIC,
                EgressMessages::Init(Empty {}),
                None,
            ))
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
                () = &mut shutdown => {
                    return CloseReason::Shutdown;
                }
            }
        }
    }

    async fn close(self, reason: CloseReason) {
        tracing::info!(relay_id = %self.relay.id, ?reason, "Closing relay session");

        if reason == CloseReason::Shutdown {
            self.push(&PhoenixMessage::<(), Empty>::new_disconnect(
                TOPIC,
                DisconnectReason::Shutdown,
            ))
            .await;
        }

        // The leave fans out to every client and gateway session watching
        // this pool; they push `relays_presence` diffs in turn.
        self.app
            .presence
            .untrack(&self.topic, &self.relay.id.to_string());
    }

    async fn handle_frame(&mut self, raw: String) -> Option<CloseReason> {
        tracing::trace!(target: "wire::relay::recv", message = %raw);

        let frame = match serde_json::from_str::<Frame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Closing relay session on malformed frame: {e}");
                return Some(CloseReason::MalformedFrame);
            }
        };

        let (topic, reference, payload) = frame.into_parts();

        match payload {
            Payload::Heartbeat(_) => {
                // Heartbeats are the relay's liveness signal; selection
                // staleness keys off it.
                self.app.store.touch_relay(self.relay.id);
                self.push(&reply_ok(&topic, reference)).await;
            }
            Payload::Leave(_) => {
                self.push(&reply_ok(&topic, reference)).await;
                return Some(CloseReason::LeftTopic);
            }
            Payload::Join(_) => {
                tracing::debug!("Ignoring duplicate join");
            }
            Payload::Message(_) | Payload::Reply(_) | Payload::Disconnect { .. } => {
                tracing::debug!("Ignoring unexpected frame from relay");
            }
        }

        None
    }

    async fn push<T: serde::Serialize>(&self, frame: &T) {
        send(&self.io.outbound, frame).await;
    }
}
