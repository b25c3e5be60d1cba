use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A credential carried through configuration.
///
/// Wraps [`SecretString`] so values ride through serde while staying redacted
/// in `Debug` output and log fields. The raw value is reachable only through
/// [`SecretValue::expose`]; call it at the single point the credential is
/// handed to a client library, not earlier.
#[derive(Clone)]
pub struct SecretValue(SecretString);

impl SecretValue {
    /// Returns the raw secret. Keep the exposure site small.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(REDACTED)")
    }
}

impl From<String> for SecretValue {
    fn from(raw: String) -> Self {
        Self(SecretString::from(raw))
    }
}

impl From<&str> for SecretValue {
    fn from(raw: &str) -> Self {
        Self(SecretString::from(raw))
    }
}

impl From<SecretString> for SecretValue {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

impl Serialize for SecretValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self.0.expose_secret())
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from)
    }
}
