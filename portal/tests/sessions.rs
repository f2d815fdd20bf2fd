//! End-to-end session tests, driven at the frame level.
//!
//! Sessions are spawned on in-memory pipes instead of real sockets; the JSON
//! exchanged is exactly what would cross a WebSocket.

#![allow(clippy::unwrap_used)]

use chrono::{Duration, Utc};
use firezone_portal::sessions::{SessionIo, client, gateway, relay};
use firezone_portal::{App, Config};
use portal_auth::{Context, Subject};
use portal_policy::{Condition, MembershipOperator};
use portal_store::{GatewayGroup, Group, NewResource, ResourceKind, Store};
use semver::Version;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct Env {
    app: Arc<App>,
    _shutdown: watch::Sender<bool>,
    admin: Subject,
    group: Group,
    site: GatewayGroup,
}

fn context(region: &str) -> Context {
    Context {
        remote_ip: "203.0.113.1".parse().unwrap(),
        user_agent: Some("Linux/6.1 connlib/1.2.0".to_owned()),
        region: Some(region.to_owned()),
        location: Some((52.52, 13.4)),
    }
}

fn env() -> Env {
    env_with(Config::default())
}

fn env_with(config: Config) -> Env {
    let (app, shutdown) = App::new(config);

    let account = app.store.create_account("acme");
    let admin_actor = app.store.create_seed_admin(account.id, "admin").unwrap();
    let admin = app
        .store
        .subject_for_actor(admin_actor.id, context("DE"), Utc::now() + Duration::hours(8))
        .unwrap();

    let group = app.store.create_group(&admin, "engineering").unwrap();
    app.store
        .add_membership(&admin, admin.actor_id, group.id)
        .unwrap();
    let site = app.store.create_gateway_group(&admin, "eu-west").unwrap();

    Env {
        app,
        _shutdown: shutdown,
        admin,
        group,
        site,
    }
}

impl Env {
    fn grant_resource(&self, kind: ResourceKind, address: &str) -> portal_store::Resource {
        let resource = self
            .app
            .store
            .create_resource(
                &self.admin,
                NewResource {
                    kind,
                    address: address.to_owned(),
                    name: address.to_owned(),
                    address_description: None,
                    filters: Vec::new(),
                    gateway_groups: vec![self.site.id],
                },
            )
            .unwrap();

        self.app
            .store
            .create_policy(&self.admin, self.group.id, resource.id, Vec::new(), None)
            .unwrap();

        resource
    }

    fn store(&self) -> &Arc<Store> {
        &self.app.store
    }
}

struct Peer {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    _task: JoinHandle<()>,
}

impl Peer {
    async fn send(&self, frame: Value) {
        self.tx.send(frame.to_string()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let raw = tokio::time::timeout(std::time::Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed the pipe");

        serde_json::from_str(&raw).unwrap()
    }

    /// Receives frames until one matches `event`.
    async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.recv().await;

            if frame["event"] == event {
                return frame;
            }
        }
    }
}

async fn spawn_client(env: &Env, subject: Subject, version: &str) -> Peer {
    let (io, tx, rx) = SessionIo::pipe();

    let task = tokio::spawn(client::run(
        env.app.clone(),
        subject,
        version.to_owned(),
        Some("test-device".to_owned()),
        io,
    ));

    Peer { tx, rx, _task: task }
}

/// Joins the client topic and returns the `init` payload.
async fn join_client(peer: &mut Peer) -> Value {
    peer.send(json!({"topic": "client", "event": "phx_join", "payload": {}, "ref": 0}))
        .await;

    let reply = peer.recv().await;
    assert_eq!(reply["event"], "phx_reply", "unexpected: {reply}");
    assert_eq!(reply["payload"]["status"], "ok");

    let init = peer.recv_event("init").await;
    init["payload"].clone()
}

const GATEWAY_PUBLIC_KEY: &str = "dvy0IwyxAi+txSbAdT7WKgf7K4TekhKzrnYwt5WfbSM=";

async fn spawn_gateway(env: &Env, version: &str) -> (Peer, portal_model::GatewayId) {
    let (_, secret) = env
        .store()
        .create_gateway_token(&env.admin, env.site.id)
        .unwrap();
    let auth = env.store().authenticate_gateway(&secret).unwrap();
    let gateway = env
        .store()
        .upsert_gateway(
            &auth,
            portal_store::GatewayParams {
                public_key: GATEWAY_PUBLIC_KEY.parse().unwrap(),
                version: Version::parse(version).unwrap(),
                remote_ip: "198.51.100.7".parse().unwrap(),
            },
        )
        .unwrap();
    let gateway_id = gateway.id;

    let (io, tx, rx) = SessionIo::pipe();
    let task = tokio::spawn(gateway::run(env.app.clone(), auth, gateway, io));

    let mut peer = Peer { tx, rx, _task: task };

    peer.send(json!({"topic": "gateway", "event": "phx_join", "payload": {}, "ref": 0}))
        .await;
    let reply = peer.recv().await;
    assert_eq!(reply["payload"]["status"], "ok");
    peer.recv_event("init").await;

    (peer, gateway_id)
}

async fn spawn_relay(env: &Env, stamp_secret: &str, lat: f64, lon: f64) -> Peer {
    let (_, secret) = env.store().create_global_relay_token();
    let auth = env.store().authenticate_relay(&secret).unwrap();

    let (io, tx, rx) = SessionIo::pipe();
    let task = tokio::spawn(relay::run(env.app.clone(), auth, io));

    let mut peer = Peer { tx, rx, _task: task };

    peer.send(json!({
        "topic": "relay",
        "event": "phx_join",
        "payload": {
            "stamp_secret": stamp_secret,
            "ipv4": "203.0.113.99",
            "lat": lat,
            "lon": lon
        },
        "ref": 0
    }))
    .await;
    let reply = peer.recv().await;
    assert_eq!(reply["payload"]["status"], "ok");
    peer.recv_event("init").await;

    peer
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn init_carries_all_three_resource_types_deduplicated() {
    let env = env();

    env.grant_resource(ResourceKind::Dns, "app.example.com");
    env.grant_resource(ResourceKind::Cidr, "192.168.1.0/28");
    env.grant_resource(ResourceKind::Ip, "192.168.100.1");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    let init = join_client(&mut peer).await;

    let resources = init["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 3);

    let ip_resource = resources
        .iter()
        .find(|r| r["address"] == "192.168.100.1/32")
        .expect("ip resource rendered as /32 cidr");
    assert_eq!(ip_resource["type"], "cidr");

    // Interface addresses come from the account pools.
    assert!(init["interface"]["ipv4"].as_str().unwrap().starts_with("100."));
}

#[tokio::test]
async fn legacy_clients_only_see_representable_globs() {
    let env = env();

    for address in [
        "**.glob.com",
        "*.q.com",
        "foo.*.ex.com",
        "foo.**.glob.com",
        "us-east?-d.glob.com",
    ] {
        env.grant_resource(ResourceKind::Dns, address);
    }

    let mut peer = spawn_client(&env, env.admin.clone(), "1.1.99").await;
    let init = join_client(&mut peer).await;

    let addresses = init["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["address"].as_str().unwrap().to_owned())
        .collect::<BTreeSet<_>>();

    assert_eq!(
        addresses,
        BTreeSet::from(["*.glob.com".to_owned(), "?.q.com".to_owned()])
    );
}

#[tokio::test]
async fn modern_clients_see_globs_verbatim() {
    let env = env();

    env.grant_resource(ResourceKind::Dns, "foo.*.ex.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    let init = join_client(&mut peer).await;

    assert_eq!(init["resources"][0]["address"], "foo.*.ex.com");
}

#[tokio::test]
async fn non_semver_versions_are_rejected_at_join() {
    let env = env();

    let mut peer = spawn_client(&env, env.admin.clone(), "development").await;

    peer.send(json!({"topic": "client", "event": "phx_join", "payload": {}, "ref": 0}))
        .await;

    let reply = peer.recv().await;
    assert_eq!(reply["payload"]["status"], "error");
    assert_eq!(reply["payload"]["response"]["reason"], "invalid_version");
}

#[tokio::test]
async fn prepare_connection_picks_an_online_gateway() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let (_gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "prepare_connection",
        "payload": {"resource_id": resource.id},
        "ref": 1
    }))
    .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["payload"]["status"], "ok");
    assert_eq!(
        reply["payload"]["response"]["gateway_id"],
        gateway_id.to_string()
    );
    assert_eq!(
        reply["payload"]["response"]["gateway_remote_ip"],
        "198.51.100.7"
    );
}

#[tokio::test]
async fn prepare_connection_does_not_leak_unknown_resources() {
    let env = env();
    let (_gateway_peer, _) = spawn_gateway(&env, "1.1.0").await;

    // A resource that exists but is granted to nobody.
    let hidden = env
        .store()
        .create_resource(
            &env.admin,
            NewResource {
                kind: ResourceKind::Dns,
                address: "secret.example.com".to_owned(),
                name: "secret".to_owned(),
                address_description: None,
                filters: Vec::new(),
                gateway_groups: vec![env.site.id],
            },
        )
        .unwrap();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    for resource_id in [hidden.id.to_string(), portal_model::ResourceId::random().to_string()] {
        peer.send(json!({
            "topic": "client",
            "event": "prepare_connection",
            "payload": {"resource_id": resource_id},
            "ref": 1
        }))
        .await;

        let reply = peer.recv_event("phx_reply").await;
        assert_eq!(reply["payload"]["status"], "error");
        assert_eq!(reply["payload"]["response"]["reason"], "not_found");
    }
}

#[tokio::test]
async fn prepare_connection_without_gateways_is_offline() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "prepare_connection",
        "payload": {"resource_id": resource.id},
        "ref": 1
    }))
    .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["payload"]["response"]["reason"], "offline");
}

#[tokio::test]
async fn old_gateways_are_not_offered_for_modern_globs() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "foo.*.ex.com");

    let (_gateway_peer, _) = spawn_gateway(&env, "1.0.9").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "prepare_connection",
        "payload": {"resource_id": resource.id},
        "ref": 1
    }))
    .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["payload"]["response"]["reason"], "offline");
}

#[tokio::test]
async fn request_connection_correlates_request_and_reply() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let (mut gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "request_connection",
        "payload": {
            "resource_id": resource.id,
            "gateway_id": gateway_id,
            "client_payload": "RTC_SD",
            "client_preshared_key": "PSK"
        },
        "ref": 7
    }))
    .await;

    // The gateway receives the brokered request with a correlation ref.
    let brokered = gateway_peer.recv_event("request_connection").await;
    let payload = &brokered["payload"];
    assert_eq!(payload["client_payload"], "RTC_SD");
    assert_eq!(payload["client_preshared_key"], "PSK");
    assert!(payload["authorization_expires_at"].is_number());
    let reference = payload["ref"].as_str().unwrap().to_owned();

    gateway_peer
        .send(json!({
            "topic": "gateway",
            "event": "connect",
            "payload": {
                "ref": reference,
                "resource_id": resource.id,
                "gateway_public_key": GATEWAY_PUBLIC_KEY,
                "gateway_payload": "FULL_RTC_SD"
            },
            "ref": null
        }))
        .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["ref"], 7);
    assert_eq!(reply["payload"]["status"], "ok");

    let response = &reply["payload"]["response"];
    assert_eq!(response["resource_id"], resource.id.to_string());
    assert_eq!(response["gateway_public_key"], GATEWAY_PUBLIC_KEY);
    assert_eq!(response["gateway_payload"], "FULL_RTC_SD");
    assert_eq!(response["persistent_keepalive"], 25);

    // The authorized flow was recorded.
    let flows = env.store().flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].resource_id, resource.id);
    assert_eq!(flows[0].gateway_id, gateway_id);
}

#[tokio::test]
async fn unanswered_brokered_requests_time_out_as_offline() {
    let env = env_with(Config {
        rpc_timeout: std::time::Duration::from_millis(200),
        ..Config::default()
    });
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let (mut gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "request_connection",
        "payload": {
            "resource_id": resource.id,
            "gateway_id": gateway_id,
            "client_payload": "RTC_SD",
            "client_preshared_key": "PSK"
        },
        "ref": 5
    }))
    .await;

    // The gateway receives the request but never answers.
    let brokered = gateway_peer.recv_event("request_connection").await;
    let reference = brokered["payload"]["ref"].as_str().unwrap().to_owned();

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["ref"], 5);
    assert_eq!(reply["payload"]["status"], "error");
    assert_eq!(reply["payload"]["response"]["reason"], "offline");

    // A reply after the deadline is dropped, not delivered.
    gateway_peer
        .send(json!({
            "topic": "gateway",
            "event": "connect",
            "payload": {
                "ref": reference,
                "resource_id": resource.id,
                "gateway_public_key": GATEWAY_PUBLIC_KEY,
                "gateway_payload": "TOO_LATE"
            },
            "ref": null
        }))
        .await;

    peer.send(json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": 6}))
        .await;

    let frame = peer.recv().await;
    assert_eq!(frame["event"], "phx_reply", "late reply leaked: {frame}");
    assert_eq!(frame["ref"], 6);
}

#[tokio::test]
async fn revoking_a_policy_rejects_in_flight_flows() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");
    let policy = env
        .store()
        .granting_policies(env.admin.actor_id, resource.id)
        .pop()
        .unwrap();

    let (mut gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "request_connection",
        "payload": {
            "resource_id": resource.id,
            "gateway_id": gateway_id,
            "client_payload": "RTC_SD",
            "client_preshared_key": "PSK"
        },
        "ref": 1
    }))
    .await;

    let brokered = gateway_peer.recv_event("request_connection").await;
    let reference = brokered["payload"]["ref"].as_str().unwrap().to_owned();

    gateway_peer
        .send(json!({
            "topic": "gateway",
            "event": "connect",
            "payload": {
                "ref": reference,
                "resource_id": resource.id,
                "gateway_public_key": GATEWAY_PUBLIC_KEY,
                "gateway_payload": "FULL_RTC_SD"
            },
            "ref": null
        }))
        .await;
    peer.recv_event("phx_reply").await;

    env.store().disable_policy(&env.admin, policy.id).unwrap();

    let reject = gateway_peer.recv_event("reject_access").await;
    assert_eq!(reject["payload"]["resource_id"], resource.id.to_string());
}

#[tokio::test]
async fn conditional_policy_denies_by_region() {
    let env = env();

    let resource = env
        .store()
        .create_resource(
            &env.admin,
            NewResource {
                kind: ResourceKind::Dns,
                address: "app.example.com".to_owned(),
                name: "App".to_owned(),
                address_description: None,
                filters: Vec::new(),
                gateway_groups: vec![env.site.id],
            },
        )
        .unwrap();
    env.store()
        .create_policy(
            &env.admin,
            env.group.id,
            resource.id,
            vec![Condition::RemoteIpLocationRegion {
                operator: MembershipOperator::IsNotIn,
                values: vec!["DE".to_owned()], // The client connects from DE.
            }],
            None,
        )
        .unwrap();

    let (_gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "reuse_connection",
        "payload": {
            "resource_id": resource.id,
            "gateway_id": gateway_id,
            "payload": null
        },
        "ref": 3
    }))
    .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["payload"]["status"], "error");
    assert_eq!(reply["payload"]["response"]["reason"], "forbidden");
    assert_eq!(
        reply["payload"]["response"]["violated_properties"],
        json!(["remote_ip_location_region"])
    );

    // Denied connections leave no flow record.
    assert!(env.store().flows().is_empty());
}

#[tokio::test]
async fn ice_candidates_flow_both_ways() {
    let env = env();
    env.grant_resource(ResourceKind::Dns, "app.example.com");

    let (mut gateway_peer, gateway_id) = spawn_gateway(&env, "1.1.0").await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    let client_id = env
        .store()
        .flows()
        .first()
        .map(|f| f.client_id)
        .unwrap_or_else(|| {
            // No flow yet; look the client up by presence instead.
            env.app
                .presence
                .list(&portal_store::topics::clients(env.admin.account_id))
                .first()
                .and_then(|(_, _, meta)| meta.as_client().map(|c| c.client_id))
                .unwrap()
        });

    peer.send(json!({
        "topic": "client",
        "event": "broadcast_ice_candidates",
        "payload": {
            "gateway_ids": [gateway_id],
            "candidates": ["candidate:1 1 udp 50331391 35.244.108.190 53909 typ relay"]
        },
        "ref": null
    }))
    .await;

    let forwarded = gateway_peer.recv_event("ice_candidates").await;
    assert_eq!(forwarded["payload"]["client_id"], client_id.to_string());

    gateway_peer
        .send(json!({
            "topic": "gateway",
            "event": "broadcast_invalidated_ice_candidates",
            "payload": {
                "client_ids": [client_id],
                "candidates": ["candidate:1 1 udp 50331391 35.244.108.190 53909 typ relay"]
            },
            "ref": null
        }))
        .await;

    let invalidated = peer.recv_event("invalidate_ice_candidates").await;
    assert_eq!(
        invalidated["payload"]["gateway_id"],
        gateway_id.to_string()
    );
}

#[tokio::test]
async fn relay_presence_diffs_track_the_online_set() {
    let env = env();
    env.grant_resource(ResourceKind::Dns, "app.example.com");

    let relay_a = spawn_relay(&env, "secret-a", 52.52, 13.4).await;
    let relay_b = spawn_relay(&env, "secret-b", 50.11, 8.68).await;

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    let init = join_client(&mut peer).await;

    let relays = init["relays"].as_array().unwrap();
    assert_eq!(relays.len(), 2);

    let ids = relays
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_owned())
        .collect::<BTreeSet<_>>();
    assert_eq!(ids.len(), 2, "relay ids must be distinct");

    for relay in relays {
        assert_eq!(relay["type"], "turn");
        assert!(relay["username"].as_str().unwrap().contains(':'));
        assert!(!relay["password"].as_str().unwrap().is_empty());
    }

    // One relay goes away: its socket closes.
    drop(relay_a);

    let diff = peer.recv_event("relays_presence").await;
    let disconnected = diff["payload"]["disconnected_ids"].as_array().unwrap();
    assert_eq!(disconnected.len(), 1);

    let connected = diff["payload"]["connected"].as_array().unwrap();
    assert_eq!(connected.len(), 1);
    assert_ne!(connected[0]["id"], disconnected[0]);

    drop(relay_b);
}

#[tokio::test]
async fn policy_revocation_revokes_and_relearns_resources() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    // A second group also grants the same resource.
    let oncall = env.store().create_group(&env.admin, "oncall").unwrap();
    env.store()
        .add_membership(&env.admin, env.admin.actor_id, oncall.id)
        .unwrap();
    let second_policy = env
        .store()
        .create_policy(&env.admin, oncall.id, resource.id, Vec::new(), None)
        .unwrap();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    let init = join_client(&mut peer).await;
    assert_eq!(init["resources"].as_array().unwrap().len(), 1);

    // Revoking one of two grants: the client re-learns the resource.
    env.store()
        .delete_policy(&env.admin, second_policy.id)
        .unwrap();

    let deleted = peer.recv_event("resource_deleted").await;
    assert_eq!(deleted["payload"], resource.id.to_string());

    let relearned = peer.recv_event("resource_created_or_updated").await;
    assert_eq!(relearned["payload"]["id"], resource.id.to_string());
}

#[tokio::test]
async fn policy_disable_and_reenable_round_trips_the_resource() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");
    let policy = env
        .store()
        .granting_policies(env.admin.actor_id, resource.id)
        .pop()
        .unwrap();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    env.store().disable_policy(&env.admin, policy.id).unwrap();

    let deleted = peer.recv_event("resource_deleted").await;
    assert_eq!(deleted["payload"], resource.id.to_string());

    env.store().enable_policy(&env.admin, policy.id).unwrap();

    let relearned = peer.recv_event("resource_created_or_updated").await;
    assert_eq!(relearned["payload"]["id"], resource.id.to_string());
}

#[tokio::test]
async fn losing_the_last_grant_deletes_the_resource() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    env.store()
        .remove_membership(&env.admin, env.admin.actor_id, env.group.id)
        .unwrap();

    let deleted = peer.recv_event("resource_deleted").await;
    assert_eq!(deleted["payload"], resource.id.to_string());
}

#[tokio::test]
async fn bare_resource_deletion_is_not_propagated() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    // Deleting the resource directly must not push anything by itself.
    env.store().delete_resource(&env.admin, resource.id).unwrap();

    // Give the session ample opportunity to (wrongly) react to the deletion
    // event, then prove the next frame on the wire is our heartbeat ack.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    peer.send(json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": 1}))
        .await;

    let frame = peer.recv().await;
    assert_eq!(frame["event"], "phx_reply", "unexpected push: {frame}");
    assert_eq!(frame["ref"], 1);

    // The disappearance only reaches the client through the policy path.
    env.store()
        .remove_membership(&env.admin, env.admin.actor_id, env.group.id)
        .unwrap();

    let deleted = peer.recv_event("resource_deleted").await;
    assert_eq!(deleted["payload"], resource.id.to_string());
}

#[tokio::test(start_paused = true)]
async fn sessions_expire_with_their_token() {
    let env = env();
    env.grant_resource(ResourceKind::Dns, "app.example.com");

    let account_id = env.admin.account_id;
    let actor_id = env.admin.actor_id;

    let short_lived = env
        .store()
        .subject_for_actor(actor_id, context("DE"), Utc::now() + Duration::seconds(2))
        .unwrap();

    let mut peer = spawn_client(&env, short_lived, "1.2.0").await;
    join_client(&mut peer).await;

    // Paused time auto-advances to the expiry timer.
    let disconnect = peer.recv_event("disconnect").await;
    assert_eq!(disconnect["payload"]["reason"], "token_expired");

    // The session deregisters its presence on close.
    for _ in 0..100 {
        if env
            .app
            .presence
            .list(&portal_store::topics::clients(account_id))
            .is_empty()
        {
            return;
        }

        tokio::task::yield_now().await;
    }

    panic!("presence lease survived session close");
}

#[tokio::test]
async fn force_disconnect_closes_the_session() {
    let env = env();
    env.grant_resource(ResourceKind::Dns, "app.example.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    let client_id = env
        .app
        .presence
        .list(&portal_store::topics::clients(env.admin.account_id))
        .first()
        .and_then(|(_, _, meta)| meta.as_client().map(|c| c.client_id))
        .unwrap();

    env.store().force_disconnect_client(client_id);

    let disconnect = peer.recv_event("disconnect").await;
    assert_eq!(disconnect["payload"]["reason"], "token_expired");
}

#[tokio::test]
async fn config_changes_push_normalized_upstream_dns() {
    let env = env();
    env.grant_resource(ResourceKind::Dns, "app.example.com");

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    let mut config = env.store().account(env.admin.account_id).unwrap().config;
    config.upstream_dns = vec!["1.1.1.1".to_owned(), "8.8.8.8:5353".to_owned()];
    env.store()
        .update_account_config(&env.admin, config)
        .unwrap();

    let changed = peer.recv_event("config_changed").await;
    let upstream = changed["payload"]["interface"]["upstream_dns"]
        .as_array()
        .unwrap();

    assert_eq!(upstream[0]["protocol"], "ip_port");
    assert_eq!(upstream[0]["address"], "1.1.1.1:53");
    assert_eq!(upstream[1]["address"], "8.8.8.8:5353");
}

#[tokio::test]
async fn heartbeats_are_acknowledged() {
    let env = env();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": 42}))
        .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["topic"], "phoenix");
    assert_eq!(reply["ref"], 42);
    assert_eq!(reply["payload"]["status"], "ok");
}

#[tokio::test]
async fn join_on_unknown_topic_is_rejected() {
    let env = env();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;

    peer.send(json!({"topic": "nonsense", "event": "phx_join", "payload": {}, "ref": 1}))
        .await;

    let reply = peer.recv().await;
    assert_eq!(reply["payload"]["status"], "error");
    assert_eq!(reply["payload"]["response"]["reason"], "unmatched topic");
}

#[tokio::test]
async fn request_to_offline_gateway_returns_offline() {
    let env = env();
    let resource = env.grant_resource(ResourceKind::Dns, "app.example.com");

    // Register a gateway record without a live session.
    let (_, secret) = env
        .store()
        .create_gateway_token(&env.admin, env.site.id)
        .unwrap();
    let auth = env.store().authenticate_gateway(&secret).unwrap();
    let gateway = env
        .store()
        .upsert_gateway(
            &auth,
            portal_store::GatewayParams {
                public_key: GATEWAY_PUBLIC_KEY.parse().unwrap(),
                version: Version::new(1, 1, 0),
                remote_ip: "198.51.100.7".parse().unwrap(),
            },
        )
        .unwrap();

    let mut peer = spawn_client(&env, env.admin.clone(), "1.2.0").await;
    join_client(&mut peer).await;

    peer.send(json!({
        "topic": "client",
        "event": "reuse_connection",
        "payload": {"resource_id": resource.id, "gateway_id": gateway.id, "payload": null},
        "ref": 9
    }))
    .await;

    let reply = peer.recv_event("phx_reply").await;
    assert_eq!(reply["payload"]["response"]["reason"], "offline");
}
