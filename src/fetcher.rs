use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Credential, FetchOutcome, UsageSnapshot};

const API_BASE: &str = "https://claude.ai/api";
const ORIGIN: &str = "https://claude.ai";
const REFERER: &str = "https://claude.ai/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("session rejected (HTTP 401)")]
    Unauthorized,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("account has no organizations")]
    NoOrganization,
    #[error("transport: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Parse(String),
}

/// Raw reply from the provider API. `body` is only parsed for HTTP 200.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

/// HTTP boundary: authenticated GET of a path under the API base
pub trait Transport: Send + Sync {
    fn get(&self, path: &str, credential: &Credential) -> Result<Reply, FetchError>;
}

/// Anything the scheduler can poll
pub trait UsageSource: Send + Sync {
    fn fetch(&self, credential: &Credential) -> FetchOutcome;
}

pub struct UreqTransport {
    agent: ureq::Agent,
    base: String,
}

impl UreqTransport {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_base(API_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self, FetchError> {
        let tls = Arc::new(
            native_tls::TlsConnector::new().map_err(|e| FetchError::Transport(e.to_string()))?,
        );
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .tls_connector(tls)
            .build();
        Ok(Self {
            agent,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

impl Transport for UreqTransport {
    fn get(&self, path: &str, credential: &Credential) -> Result<Reply, FetchError> {
        let url = format!("{}{path}", self.base);
        let response = match self
            .agent
            .get(&url)
            .set("Accept", "application/json")
            .set("Content-Type", "application/json")
            .set("User-Agent", USER_AGENT)
            .set("Cookie", &credential.cookie_header())
            .set("Origin", ORIGIN)
            .set("Referer", REFERER)
            .call()
        {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                return Ok(Reply {
                    status: code,
                    body: Value::Null,
                })
            }
            Err(e) => return Err(FetchError::Transport(e.to_string())),
        };

        let status = response.status();
        if status != 200 {
            return Ok(Reply {
                status,
                body: Value::Null,
            });
        }
        let body = response
            .into_json::<Value>()
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(Reply { status, body })
    }
}

/// Two-step usage lookup: first organization, then its usage
pub struct UsageFetcher<T> {
    transport: T,
}

impl<T: Transport> UsageFetcher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn try_fetch(&self, credential: &Credential) -> Result<UsageSnapshot, FetchError> {
        let orgs = self.transport.get("/organizations", credential)?;
        match orgs.status {
            200 => {}
            401 => return Err(FetchError::Unauthorized),
            code => return Err(FetchError::Status(code)),
        }

        let org_id = first_organization_id(&orgs.body)?;
        debug!("Resolved organization {org_id}");

        let usage = self
            .transport
            .get(&format!("/organizations/{org_id}/usage"), credential)?;
        if usage.status != 200 {
            return Err(FetchError::Status(usage.status));
        }
        Ok(UsageSnapshot::new(usage.body))
    }
}

impl<T: Transport> UsageSource for UsageFetcher<T> {
    fn fetch(&self, credential: &Credential) -> FetchOutcome {
        match self.try_fetch(credential) {
            Ok(snapshot) => FetchOutcome::Snapshot(snapshot),
            Err(FetchError::Unauthorized) => {
                warn!("Usage fetch rejected: session is no longer valid");
                FetchOutcome::AuthInvalid
            }
            Err(e) => {
                debug!("Usage fetch failed: {e}");
                FetchOutcome::Unavailable
            }
        }
    }
}

fn first_organization_id(body: &Value) -> Result<String, FetchError> {
    let orgs = body
        .as_array()
        .ok_or_else(|| FetchError::Parse("organizations is not a list".to_string()))?;
    let first = orgs.first().ok_or(FetchError::NoOrganization)?;
    first
        .get("uuid")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| FetchError::Parse("organization has no uuid".to_string()))
}
