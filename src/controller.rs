//! Sign-in and polling lifecycle shared by every frontend.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::fetcher::UsageSource;
use crate::models::{Credential, UsageSnapshot};
use crate::scheduler::{EventSink, Scheduler, SchedulerState};
use crate::session::{Acquisition, BrowserError, BrowserView, SessionAcquirer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No credential; acquisition is required
    SignedOut,
    Polling,
    AuthInvalid,
}

pub struct Controller {
    config: Arc<ConfigStore>,
    source: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Controller {
    pub fn new(
        config: Arc<ConfigStore>,
        source: Arc<dyn UsageSource>,
        clock: Arc<dyn Clock>,
        sink: EventSink,
    ) -> Self {
        Self {
            config,
            source,
            clock,
            sink,
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Start polling when a credential is stored; returns the resulting phase
    pub fn start(&self) -> Phase {
        if self.config.credential().is_none() {
            info!("No stored session; sign-in required");
            return Phase::SignedOut;
        }

        let mut slot = self.scheduler.lock();
        if slot.is_none() {
            *slot = Some(Scheduler::start(
                self.config.clone(),
                self.source.clone(),
                self.clock.clone(),
                self.sink.clone(),
            ));
        }
        drop(slot);
        self.phase()
    }

    /// Run browser acquisition and begin polling on success. Blocking.
    pub fn sign_in<B: BrowserView>(&self, browser: &mut B) -> Result<Acquisition, BrowserError> {
        let acquirer = SessionAcquirer::new(self.config.clone(), self.clock.clone());
        let outcome = acquirer.acquire(browser)?;
        if let Acquisition::Captured(_) = outcome {
            self.restart();
        }
        Ok(outcome)
    }

    /// Store a credential obtained outside the browser flow and begin polling
    pub fn accept_credential(&self, credential: Credential) -> Phase {
        self.config.set_credential(credential);
        self.restart();
        self.phase()
    }

    /// Re-read the stored session, e.g. after `login` ran in another process.
    /// Polling restarts when a credential is present.
    pub fn reload_session(&self) -> Phase {
        if self.config.reload().session_key.is_none() {
            return Phase::SignedOut;
        }
        self.restart();
        self.phase()
    }

    /// Out-of-band fetch; false when nothing is polling
    pub fn refresh(&self) -> bool {
        match self.scheduler.lock().as_ref() {
            Some(scheduler) => {
                scheduler.refresh();
                true
            }
            None => false,
        }
    }

    /// Answer to the session-expired prompt
    pub fn resolve_auth_invalid(&self, relogin: bool) -> Phase {
        if relogin {
            self.sign_out();
        }
        self.phase()
    }

    /// Stop polling and forget the credential
    pub fn sign_out(&self) {
        self.stop();
        self.config.clear_credential();
        info!("Signed out");
    }

    pub fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
    }

    pub fn phase(&self) -> Phase {
        match self.scheduler.lock().as_ref().map(|s| s.state()) {
            Some(SchedulerState::Polling) => Phase::Polling,
            Some(SchedulerState::AuthInvalid) => Phase::AuthInvalid,
            Some(SchedulerState::Idle) | None => Phase::SignedOut,
        }
    }

    pub fn latest(&self) -> Option<UsageSnapshot> {
        self.scheduler.lock().as_ref().and_then(|s| s.latest())
    }

    fn restart(&self) {
        self.stop();
        self.start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::sim::{wait_until, SimulatedClock};
    use crate::models::{FetchOutcome, PollEvent};
    use crate::session::SETTLE_DELAY;
    use serde_json::json;

    /// Login page that either already holds `cookie` or was closed by the user
    struct ScriptedBrowser {
        cookie: Option<&'static str>,
        closed: bool,
    }

    impl BrowserView for ScriptedBrowser {
        fn open(&mut self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        fn evaluate(&mut self, _script: &str) -> Result<Option<String>, BrowserError> {
            Ok(self.cookie.map(String::from))
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    /// Run `sign_in` on a worker and release it from the settle delay
    fn sign_in(f: &Fixture, browser: &mut ScriptedBrowser) -> Acquisition {
        std::thread::scope(|s| {
            let handle = s.spawn(|| f.controller.sign_in(browser));
            f.clock.wait_for_sleep_calls(1);
            f.clock.advance(SETTLE_DELAY);
            handle.join().unwrap()
        })
        .unwrap()
    }

    struct StaticSource(Mutex<FetchOutcome>);

    impl UsageSource for StaticSource {
        fn fetch(&self, credential: &Credential) -> FetchOutcome {
            assert_eq!(credential.expose(), "sk-ok");
            self.0.lock().clone()
        }
    }

    struct Fixture {
        controller: Controller,
        source: Arc<StaticSource>,
        clock: Arc<SimulatedClock>,
        events: Arc<Mutex<Vec<PollEvent>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(outcome: FetchOutcome) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")));
        let source = Arc::new(StaticSource(Mutex::new(outcome)));
        let clock = Arc::new(SimulatedClock::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: EventSink = {
            let events = events.clone();
            Arc::new(move |e| events.lock().push(e))
        };
        let controller = Controller::new(config, source.clone(), clock.clone(), sink);
        Fixture {
            controller,
            source,
            clock,
            events,
            _dir: dir,
        }
    }

    fn ok() -> FetchOutcome {
        FetchOutcome::Snapshot(UsageSnapshot::new(json!({"usage_percentage": 5})))
    }

    #[test]
    fn test_start_without_credential_requires_sign_in() {
        let f = fixture(ok());
        assert_eq!(f.controller.start(), Phase::SignedOut);
        assert!(!f.controller.refresh());
    }

    #[test]
    fn test_accepted_credential_starts_polling() {
        let f = fixture(ok());
        let phase = f
            .controller
            .accept_credential(Credential::new("sk-ok").unwrap());
        assert_eq!(phase, Phase::Polling);

        f.clock.wait_for_sleep_calls(1);
        assert_eq!(f.events.lock().len(), 1);
        assert!(f.controller.latest().is_some());
        assert!(f.controller.config().snapshot().session_key.is_some());
    }

    #[test]
    fn test_auth_invalid_relogin_clears_credential() {
        let f = fixture(FetchOutcome::AuthInvalid);
        f.controller
            .accept_credential(Credential::new("sk-ok").unwrap());
        f.clock.wait_for_sleep_calls(1);
        assert_eq!(f.controller.phase(), Phase::AuthInvalid);

        assert_eq!(f.controller.resolve_auth_invalid(false), Phase::AuthInvalid);
        assert!(f.controller.config().credential().is_some());

        assert_eq!(f.controller.resolve_auth_invalid(true), Phase::SignedOut);
        assert!(f.controller.config().credential().is_none());
        assert_eq!(f.controller.start(), Phase::SignedOut);
    }

    #[test]
    fn test_manual_refresh_recovers_from_auth_invalid() {
        let f = fixture(FetchOutcome::AuthInvalid);
        f.controller
            .accept_credential(Credential::new("sk-ok").unwrap());
        f.clock.wait_for_sleep_calls(1);

        *f.source.0.lock() = ok();
        assert!(f.controller.refresh());
        wait_until(|| f.controller.phase() == Phase::Polling);
        assert_eq!(f.events.lock().len(), 2);
    }

    #[test]
    fn test_sign_in_capture_starts_polling() {
        let f = fixture(ok());
        let mut browser = ScriptedBrowser {
            cookie: Some("sk-ok"),
            closed: false,
        };

        let outcome = sign_in(&f, &mut browser);

        assert_eq!(outcome, Acquisition::Captured(Credential::new("sk-ok").unwrap()));
        assert!(browser.closed);
        // acquisition slept once; the scheduler sleeps after its first fetch
        f.clock.wait_for_sleep_calls(2);
        assert_eq!(f.controller.phase(), Phase::Polling);
        assert_eq!(f.events.lock().len(), 1);
        assert_eq!(f.controller.config().credential(), Credential::new("sk-ok"));
    }

    #[test]
    fn test_cancelled_sign_in_stays_signed_out() {
        let f = fixture(ok());
        let mut browser = ScriptedBrowser {
            cookie: None,
            closed: true,
        };

        assert_eq!(sign_in(&f, &mut browser), Acquisition::Cancelled);
        assert_eq!(f.controller.phase(), Phase::SignedOut);
        assert!(!f.controller.refresh());
        assert_eq!(f.clock.sleep_calls(), 1);
        assert!(f.events.lock().is_empty());
        assert!(f.controller.config().credential().is_none());
    }

    #[test]
    fn test_reload_session_starts_polling_after_external_login() {
        let f = fixture(ok());
        assert_eq!(f.controller.start(), Phase::SignedOut);
        assert_eq!(f.controller.reload_session(), Phase::SignedOut);

        let path = f.controller.config().path().to_path_buf();
        ConfigStore::open(path).set_credential(Credential::new("sk-ok").unwrap());

        assert_eq!(f.controller.reload_session(), Phase::Polling);
        f.clock.wait_for_sleep_calls(1);
        assert_eq!(f.events.lock().len(), 1);
    }
}
