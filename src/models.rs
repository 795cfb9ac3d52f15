use std::fmt;

use serde::{Deserialize, Serialize};

/// Session key captured from the `sessionKey` cookie.
///
/// The value is a secret: `Debug` is redacted so it can't leak through logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank values, which never count as a session.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value for the `Cookie` request header
    pub fn cookie_header(&self) -> String {
        format!("sessionKey={}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Most recent usage payload as returned by the provider.
///
/// The shape is not fixed, see [`crate::usage::extract_percentage`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageSnapshot {
    pub payload: serde_json::Value,
}

impl UsageSnapshot {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub fn percentage(&self) -> f64 {
        crate::usage::extract_percentage(&self.payload)
    }
}

/// Result of one fetch cycle
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    Snapshot(UsageSnapshot),
    /// The provider rejected the credential (HTTP 401)
    AuthInvalid,
    /// Transient failure; the next tick retries
    Unavailable,
}

/// Messages handed from background threads to the UI thread
#[derive(Clone, Debug, PartialEq)]
pub enum PollEvent {
    Updated(UsageSnapshot),
    AuthInvalid,
}
