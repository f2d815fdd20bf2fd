//! The three WebSocket endpoints and the pump between a socket and a
//! session's frame channels.
//!
//! Authentication happens before the upgrade: a bad token never becomes a
//! session, it is a plain 401. The session context (remote ip, user agent,
//! geo) is lifted from transport headers set by the ingress layer.

use crate::sessions::{SessionIo, client, gateway, relay};
use crate::App;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt as _, StreamExt as _};
use portal_auth::Context;
use secrecy::SecretString;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/client", get(client_ws))
        .route("/gateway", get(gateway_ws))
        .route("/relay", get(relay_ws))
        .with_state(app)
}

#[derive(Debug, Deserialize)]
struct ClientConnectParams {
    token: String,
    version: String,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayConnectParams {
    token: String,
    version: String,
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct RelayConnectParams {
    token: String,
}

async fn client_ws(
    State(app): State<Arc<App>>,
    Query(params): Query<ClientConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let context = context_from_headers(&headers);
    let secret = SecretString::from(params.token);

    let subject = match app.store.authenticate(&secret, context) {
        Ok(subject) => subject,
        Err(e) => {
            tracing::info!("Client failed to authenticate: {e}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| {
        pump(socket, move |io| {
            client::run(app, subject, params.version, params.external_id, io)
        })
    })
}

async fn gateway_ws(
    State(app): State<Arc<App>>,
    Query(params): Query<GatewayConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let context = context_from_headers(&headers);
    let secret = SecretString::from(params.token);

    let auth = match app.store.authenticate_gateway(&secret) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::info!("Gateway failed to authenticate: {e}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let Ok(version) = portal_model::parse_version(&params.version) else {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };
    let Ok(public_key) = params.public_key.parse::<portal_model::Key>() else {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };

    let gateway = match app.store.upsert_gateway(
        &auth,
        portal_store::GatewayParams {
            public_key,
            version,
            remote_ip: context.remote_ip,
        },
    ) {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::warn!("Failed to register gateway: {e}");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    ws.on_upgrade(move |socket| pump(socket, move |io| gateway::run(app, auth, gateway, io)))
}

async fn relay_ws(
    State(app): State<Arc<App>>,
    Query(params): Query<RelayConnectParams>,
    _headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let secret = SecretString::from(params.token);

    let auth = match app.store.authenticate_relay(&secret) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::info!("Relay failed to authenticate: {e}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| pump(socket, move |io| relay::run(app, auth, io)))
}

/// Pumps text frames between the socket and the session's channels, then
/// runs the session to completion.
async fn pump<F, Fut>(socket: WebSocket, session: F)
where
    F: FnOnce(SessionIo) -> Fut,
    Fut: Future<Output = ()> + Send,
{
    let (io, inbound_tx, mut outbound_rx) = SessionIo::pipe();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }

        let _ = sink.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Binary(_) => {
                    tracing::warn!("Ignoring binary frame");
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        // Dropping the sender tells the session its socket is gone.
    });

    session(io).await;

    // Give queued frames (e.g. a final `disconnect`) a moment to flush.
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
    reader.abort();
}

fn context_from_headers(headers: &HeaderMap) -> Context {
    let remote_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);

    let region = headers
        .get("x-geo-location-region")
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);

    let location = headers
        .get("x-geo-location-coordinates")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (lat, lon) = value.split_once(',')?;

            Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
        });

    Context {
        remote_ip,
        user_agent,
        region,
        location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("user-agent", "Linux/6.1 connlib/1.2.0".parse().unwrap());
        headers.insert("x-geo-location-region", "DE".parse().unwrap());
        headers.insert("x-geo-location-coordinates", "52.52,13.40".parse().unwrap());

        let context = context_from_headers(&headers);

        assert_eq!(context.remote_ip, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(context.user_agent.as_deref(), Some("Linux/6.1 connlib/1.2.0"));
        assert_eq!(context.region.as_deref(), Some("DE"));
        assert_eq!(context.location, Some((52.52, 13.40)));
    }

    #[test]
    fn context_defaults_to_loopback() {
        let context = context_from_headers(&HeaderMap::new());

        assert_eq!(context.remote_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(context.region, None);
    }
}
