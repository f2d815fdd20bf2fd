//! Shared identifier and key types for the control plane.
//!
//! Everything that crosses a crate boundary by id does so through one of the
//! newtypes in here so that an actor id can never be confused with a client id.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod filters;
mod key;
mod version;

pub use filters::{Filter, Filters, PortRange};
pub use key::{Key, KeyParseError};
pub use version::{
    InvalidVersion, MIN_CLIENT_VERSION, gateway_requirement, gateway_supports_address,
    legacy_dns_address, parse_version, requires_modern_gateway, supports_full_globs,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_u128(v: u128) -> Self {
                Self(Uuid::from_u128(v))
            }

            pub fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

uuid_newtype!(
    /// A tenant. Every other entity belongs to exactly one.
    AccountId
);
uuid_newtype!(ActorId);
uuid_newtype!(IdentityId);
uuid_newtype!(
    /// An external identity provider.
    ProviderId
);
uuid_newtype!(GroupId);
uuid_newtype!(ResourceId);
uuid_newtype!(PolicyId);
uuid_newtype!(ClientId);
uuid_newtype!(GatewayId);
uuid_newtype!(
    /// A gateway group, called "Site" in user-facing contexts.
    GatewayGroupId
);
uuid_newtype!(RelayId);
uuid_newtype!(TokenId);
uuid_newtype!(FlowId);

/// A gateway group as rendered towards clients.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialOrd, Ord)]
pub struct Site {
    pub id: GatewayGroupId,
    pub name: String,
}

impl std::hash::Hash for Site {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Site {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
