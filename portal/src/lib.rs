//! The control-plane signaling server.
//!
//! Holds the three process singletons (store, bus, presence registry), the
//! WebSocket endpoints and the per-session tasks that do the actual work.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod health_check;
pub mod relays;
pub mod resolver;
pub mod sessions;
pub mod sockets;

use portal_pubsub::Bus;
use portal_store::{Event, Store};
use sessions::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Timers farther out than this are never scheduled; the session simply has
/// no expiry timer. Roughly three years.
pub const MAX_TOKEN_TIMER: Duration = Duration::from_secs(3 * 365 * 24 * 60 * 60);

/// Relays with no liveness signal for this long stop being offered.
pub fn relay_freshness_window() -> chrono::Duration {
    chrono::Duration::minutes(15)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How many relays a client is offered.
    pub relays_to_offer: usize,
    /// Deadline for a brokered gateway reply.
    pub rpc_timeout: Duration,
    /// Pushed to clients inside successful connection replies.
    pub persistent_keepalive: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays_to_offer: relays::DEFAULT_RELAYS_TO_OFFER,
            rpc_timeout: sessions::broker::RPC_TIMEOUT,
            persistent_keepalive: 25,
        }
    }
}

/// Everything a session needs a handle to.
pub struct App {
    pub store: Arc<Store>,
    pub bus: Arc<Bus<Event>>,
    pub presence: Arc<Registry>,
    pub config: Config,
    shutdown: watch::Receiver<bool>,
}

impl App {
    /// Wires up the singletons. The returned sender flips every session into
    /// a graceful `disconnect{reason: shutdown}`.
    pub fn new(config: Config) -> (Arc<Self>, watch::Sender<bool>) {
        let bus = Arc::new(Bus::new());
        let store = Arc::new(Store::new(bus.clone()));
        let presence = Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let app = Arc::new(Self {
            store,
            bus,
            presence,
            config,
            shutdown: shutdown_rx,
        });

        (app, shutdown_tx)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}
