//! Entity storage for the control plane.
//!
//! [`Store`] is one of the three process singletons (next to the pub/sub bus
//! and the presence registry) and the only linearization point for mutations.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod addresses;
mod entities;
mod events;
mod store;
mod tokens;

pub use entities::{
    Account, AccountConfig, AccountFeatures, Actor, Client, Flow, Gateway, GatewayGroup, Group,
    Identity, Policy, Relay, Resource, ResourceKind, Token, TokenKind,
};
pub use events::{Event, topics};
pub use store::{
    ClientParams, GatewayAuth, GatewayParams, NewResource, RelayAuth, RelayParams, Store,
    StoreError,
};
