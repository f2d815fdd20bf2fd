//! Messages exchanged with relays on the `/relay` socket.
//!
//! Relays only ever join and heartbeat; the portal uses their join metadata
//! to hand out TURN credentials to clients and gateways.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// The metadata a relay reports in its `phx_join` payload.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct JoinPayload {
    /// Rotated on every connection; TURN credentials handed to peers are
    /// derived from it.
    pub stamp_secret: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

fn default_relay_port() -> u16 {
    3478
}

/// Messages pushed to relays.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum EgressMessages {
    Init(crate::Empty),
}
