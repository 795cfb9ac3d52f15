//! Interactive session capture through a scriptable browser view.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::models::Credential;

pub const LOGIN_URL: &str = "https://claude.ai";

/// Time given to the login page before the first cookie check
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Returns the `sessionKey` cookie value, or null when absent
pub const SESSION_COOKIE_SCRIPT: &str = r#"(function() {
    var cookies = document.cookie.split(';');
    for (var i = 0; i < cookies.length; i++) {
        var cookie = cookies[i].trim();
        if (cookie.startsWith('sessionKey=')) {
            return cookie.substring(11);
        }
    }
    return null;
})();"#;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to open browser view: {0}")]
    Open(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
}

/// A navigable window whose document can be scripted.
pub trait BrowserView {
    fn open(&mut self, url: &str) -> Result<(), BrowserError>;
    /// Evaluate `script` in the current document; `None` for a null result
    fn evaluate(&mut self, script: &str) -> Result<Option<String>, BrowserError>;
    /// True once the user has closed the view
    fn is_closed(&self) -> bool;
    fn close(&mut self);
}

#[derive(Debug, PartialEq)]
pub enum Acquisition {
    Captured(Credential),
    /// The view was closed before a session cookie appeared
    Cancelled,
}

pub struct SessionAcquirer {
    config: Arc<ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl SessionAcquirer {
    pub fn new(config: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Drive `browser` to the login page and wait for a session cookie.
    ///
    /// Blocks the calling thread until a credential is captured or the view
    /// is closed; run it off the UI thread. There is no timeout besides the
    /// view's own lifetime.
    pub fn acquire<B: BrowserView>(&self, browser: &mut B) -> Result<Acquisition, BrowserError> {
        browser.open(LOGIN_URL)?;
        info!("Waiting for sign-in at {LOGIN_URL}");

        self.clock.sleep(SETTLE_DELAY);
        loop {
            if browser.is_closed() {
                info!("Sign-in window closed before a session was found");
                return Ok(Acquisition::Cancelled);
            }

            match browser.evaluate(SESSION_COOKIE_SCRIPT) {
                Ok(Some(value)) => {
                    if let Some(credential) = Credential::new(value) {
                        self.config.set_credential(credential.clone());
                        browser.close();
                        info!("Session captured");
                        return Ok(Acquisition::Captured(credential));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Cookie check failed, retrying: {e}"),
            }

            self.clock.sleep(CHECK_INTERVAL);
        }
    }
}
