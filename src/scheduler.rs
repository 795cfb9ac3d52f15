//! Background polling loop with cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::fetcher::UsageSource;
use crate::models::{Credential, FetchOutcome, PollEvent, UsageSnapshot};

/// Hand-off from worker threads to whoever owns the UI
pub type EventSink = Arc<dyn Fn(PollEvent) + Send + Sync>;

/// What the loop reads fresh on every tick
pub trait PollSettings: Send + Sync {
    fn credential(&self) -> Option<Credential>;
    fn poll_interval(&self) -> Duration;
}

impl PollSettings for ConfigStore {
    fn credential(&self) -> Option<Credential> {
        ConfigStore::credential(self)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    /// Last fetch was rejected; scheduled ticks pause until a manual
    /// refresh succeeds or the scheduler is stopped
    AuthInvalid,
}

struct Shared {
    settings: Arc<dyn PollSettings>,
    source: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
    sink: EventSink,
    state: Mutex<SchedulerState>,
    latest: Mutex<Option<UsageSnapshot>>,
    stop_requested: AtomicBool,
}

impl Shared {
    fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    fn poll_once(&self) {
        let credential = match self.settings.credential() {
            Some(c) => c,
            None => {
                debug!("No session stored; skipping fetch");
                return;
            }
        };

        match self.source.fetch(&credential) {
            FetchOutcome::Snapshot(snapshot) => {
                {
                    let mut state = self.state.lock();
                    if *state == SchedulerState::Idle {
                        return;
                    }
                    *state = SchedulerState::Polling;
                }
                *self.latest.lock() = Some(snapshot.clone());
                (self.sink)(PollEvent::Updated(snapshot));
            }
            FetchOutcome::AuthInvalid => {
                let newly_invalid = {
                    let mut state = self.state.lock();
                    let was_polling = *state == SchedulerState::Polling;
                    if was_polling {
                        *state = SchedulerState::AuthInvalid;
                    }
                    was_polling
                };
                if newly_invalid {
                    (self.sink)(PollEvent::AuthInvalid);
                }
            }
            FetchOutcome::Unavailable => {}
        }
    }

    fn run(&self) {
        let mut deadline = self.clock.now();
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            if self.state() == SchedulerState::AuthInvalid {
                debug!("Session invalid; waiting for sign-in or manual refresh");
            } else {
                self.poll_once();
            }

            deadline = (deadline + self.settings.poll_interval()).max(self.clock.now());
            self.clock.sleep_until(deadline);
        }
        debug!("Polling loop stopped");
    }
}

/// Runs the fetcher immediately and then once per poll interval
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        settings: Arc<dyn PollSettings>,
        source: Arc<dyn UsageSource>,
        clock: Arc<dyn Clock>,
        sink: EventSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            settings,
            source,
            clock,
            sink,
            state: Mutex::new(SchedulerState::Polling),
            latest: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        });

        info!(
            "Polling usage every {}s",
            shared.settings.poll_interval().as_secs()
        );
        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.run())
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Last successfully fetched snapshot
    pub fn latest(&self) -> Option<UsageSnapshot> {
        self.shared.latest.lock().clone()
    }

    /// One out-of-band fetch on its own thread; the schedule is untouched
    pub fn refresh(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        std::thread::spawn(move || shared.poll_once())
    }

    /// Ask the loop to exit at its next iteration boundary
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        *self.shared.state.lock() = SchedulerState::Idle;
    }

    /// Wait for the loop thread to exit. Call [`Scheduler::stop`] first.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
