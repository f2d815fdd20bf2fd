use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{fmt, str::FromStr};

const KEY_SIZE: usize = 32;

/// A WireGuard public key as it transits the control plane.
///
/// Deserialized from a base64 encoded string and serialized back into one.
/// The portal never performs any cryptography with it; validating the length
/// here catches corrupted keys before they are brokered to a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

#[derive(Debug, thiserror::Error)]
#[error("invalid key: {0}")]
pub struct KeyParseError(#[from] base64::DecodeSliceError);

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key_bytes = [0u8; KEY_SIZE];
        let bytes_decoded = STANDARD.decode_slice(s, &mut key_bytes)?;

        if bytes_decoded != KEY_SIZE {
            return Err(KeyParseError(base64::DecodeError::InvalidLength(bytes_decoded).into()));
        }

        Ok(Self(key_bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base64::display::Base64Display::new(&self.0, &STANDARD))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self)
    }
}
