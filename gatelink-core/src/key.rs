//! User access keys.
//!
//! A key is 10 bytes of CSPRNG output, rendered as a 16-character uppercase
//! base32 string (standard alphabet; 10 bytes encode without padding). The
//! zero key means "unset": it serializes as the empty string so configs
//! without a key stay readable.

use data_encoding::BASE32;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of a user key in bytes
pub const USER_KEY_SIZE: usize = 10;

/// Key errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key")]
    InvalidKey,
}

/// Bearer credential for the relay's HTTP admission API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserKey([u8; USER_KEY_SIZE]);

impl UserKey {
    pub fn new(bytes: [u8; USER_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; USER_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The zero key is treated as "no key configured"
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; USER_KEY_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; USER_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32.encode(&self.0))
    }
}

impl FromStr for UserKey {
    type Err = KeyError;

    /// Parse a key as entered by a user: surrounding whitespace and
    /// lowercase letters are tolerated, everything else is `InvalidKey`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        let data = BASE32
            .decode(normalized.as_bytes())
            .map_err(|_| KeyError::InvalidKey)?;
        let bytes: [u8; USER_KEY_SIZE] = data.try_into().map_err(|_| KeyError::InvalidKey)?;
        Ok(Self(bytes))
    }
}

impl Serialize for UserKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.is_zero() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for UserKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Self::default()),
            Some(s) if s.is_empty() => Ok(Self::default()),
            Some(s) => s.parse().map_err(D::Error::custom),
        }
    }
}
