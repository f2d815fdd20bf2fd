//! Relay selection and TURN credential derivation.
//!
//! Clients get the closest relays by Haversine distance; every chosen relay
//! is rendered with per-session credentials derived from the relay's
//! `stamp_secret`, so the relay can verify them without any shared state
//! beyond that secret.

use crate::sessions::RelayMeta;
use base64::Engine;
use base64::prelude::{BASE64_STANDARD_NO_PAD, BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use portal_messages::{Relay, Stun, Turn};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};

/// How many relays a client is offered.
pub const DEFAULT_RELAYS_TO_OFFER: usize = 2;

/// How long a handed-out credential pair stays valid.
pub fn credential_lifetime() -> Duration {
    Duration::days(1)
}

/// Picks up to `n` relays for a peer at `location`.
///
/// Ordering: Haversine distance ascending (relays without coordinates sort
/// last), ties broken by most recently connected.
pub fn select_relays(
    mut candidates: Vec<RelayMeta>,
    location: Option<(f64, f64)>,
    n: usize,
) -> Vec<RelayMeta> {
    candidates.sort_by(|a, b| {
        let distance_a = distance_to(location, a);
        let distance_b = distance_to(location, b);

        distance_a
            .partial_cmp(&distance_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.connected_at.cmp(&a.connected_at))
    });

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|meta| seen.insert(meta.relay_id));
    candidates.truncate(n);

    candidates
}

fn distance_to(location: Option<(f64, f64)>, relay: &RelayMeta) -> f64 {
    match (location, relay.location) {
        (Some(a), Some(b)) => haversine_km(a, b),
        // Unknown coordinates sort after every known distance.
        _ => f64::MAX,
    }
}

/// Great-circle distance between two (latitude, longitude) pairs in
/// kilometers.
pub fn haversine_km((lat_a, lon_a): (f64, f64), (lat_b, lon_b): (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let d_lat = (lat_b - lat_a).to_radians();
    let d_lon = (lon_b - lon_a).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat_a.to_radians().cos() * lat_b.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Renders a relay for a peer, deriving that peer's credentials.
///
/// Relays without a `stamp_secret` can only serve STUN.
pub fn render_relay(relay: &RelayMeta, peer_id: &str, now: DateTime<Utc>) -> Option<Relay> {
    let ip = relay
        .ipv4
        .map(IpAddr::V4)
        .or(relay.ipv6.map(IpAddr::V6))?;
    let addr = SocketAddr::new(ip, relay.port);

    if relay.stamp_secret.is_empty() {
        return Some(Relay::Stun(Stun {
            id: relay.relay_id,
            addr,
        }));
    }

    let expires_at = now + credential_lifetime();
    let (username, password) = turn_credentials(&relay.stamp_secret, peer_id, expires_at);

    Some(Relay::Turn(Turn {
        id: relay.relay_id,
        expires_at,
        addr,
        username,
        password,
    }))
}

/// Derives the long-term-credential pair the relay will verify:
/// `username = {expiry}:{salt}`, `password =
/// base64(sha256("{expiry}:{stamp_secret}:{salt}"))`.
pub fn turn_credentials(
    stamp_secret: &str,
    peer_id: &str,
    expires_at: DateTime<Utc>,
) -> (String, String) {
    let expiry_secs = expires_at.timestamp();
    let salt = peer_salt(peer_id);

    let mut hasher = Sha256::default();
    hasher.update(format!("{expiry_secs}"));
    hasher.update(":");
    hasher.update(stamp_secret);
    hasher.update(":");
    hasher.update(&salt);

    let password = BASE64_STANDARD_NO_PAD.encode(hasher.finalize());

    (format!("{expiry_secs}:{salt}"), password)
}

/// A deterministic, non-reversible salt per peer so that credentials are
/// unique per session without the relay having to know peer ids.
fn peer_salt(peer_id: &str) -> String {
    let mut hasher = Sha256::default();
    hasher.update(peer_id.as_bytes());

    let digest = BASE64_URL_SAFE_NO_PAD.encode(hasher.finalize());

    digest.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_model::RelayId;

    fn meta(id: u128, location: Option<(f64, f64)>) -> RelayMeta {
        RelayMeta {
            relay_id: RelayId::from_u128(id),
            account_id: None,
            ipv4: Some("203.0.113.1".parse().unwrap()),
            ipv6: None,
            port: 3478,
            location,
            stamp_secret: "1cab293a-4032-46f4-862a-40e5d174b0d2".to_owned(),
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn haversine_berlin_to_frankfurt() {
        let distance = haversine_km((52.52, 13.405), (50.11, 8.68));

        assert!((distance - 424.0).abs() < 10.0, "got {distance}");
    }

    #[test]
    fn closest_relays_are_picked_first() {
        let berlin = meta(1, Some((52.52, 13.405)));
        let tokyo = meta(2, Some((35.68, 139.69)));
        let frankfurt = meta(3, Some((50.11, 8.68)));

        let chosen = select_relays(
            vec![tokyo.clone(), berlin.clone(), frankfurt.clone()],
            Some((52.5, 13.4)), // A client in Berlin.
            2,
        );

        let ids = chosen.iter().map(|m| m.relay_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![berlin.relay_id, frankfurt.relay_id]);
    }

    #[test]
    fn relays_without_coordinates_sort_last() {
        let near = meta(1, Some((52.52, 13.405)));
        let unknown = meta(2, None);

        let chosen = select_relays(vec![unknown, near.clone()], Some((52.5, 13.4)), 1);

        assert_eq!(chosen[0].relay_id, near.relay_id);
    }

    #[test]
    fn credentials_match_the_relay_scheme() {
        let expires_at = DateTime::from_timestamp(1685984278, 0).unwrap();

        let (username, password) = turn_credentials(
            "1cab293a-4032-46f4-862a-40e5d174b0d2",
            "2b1524e6-239e-4570-bc73-70a188e12101",
            expires_at,
        );

        let (expiry, salt) = username.split_once(':').unwrap();
        assert_eq!(expiry, "1685984278");
        assert_eq!(salt.len(), 16);
        assert!(!password.is_empty());

        // Deterministic for the same peer and expiry.
        let (username_again, password_again) = turn_credentials(
            "1cab293a-4032-46f4-862a-40e5d174b0d2",
            "2b1524e6-239e-4570-bc73-70a188e12101",
            expires_at,
        );
        assert_eq!(username, username_again);
        assert_eq!(password, password_again);

        // Different peers get different credentials.
        let (other_username, other_password) = turn_credentials(
            "1cab293a-4032-46f4-862a-40e5d174b0d2",
            "e95f9517-2152-4677-a16a-fbb2687050a3",
            expires_at,
        );
        assert_ne!(username, other_username);
        assert_ne!(password, other_password);
    }

    #[test]
    fn relay_without_secret_renders_as_stun() {
        let mut relay = meta(1, None);
        relay.stamp_secret = String::new();

        let rendered = render_relay(&relay, "peer", Utc::now()).unwrap();

        assert!(matches!(rendered, Relay::Stun(_)));
    }
}
