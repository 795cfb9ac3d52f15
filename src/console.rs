//! Headless frontend: prints one line per usage update.

use std::sync::mpsc::Receiver;

use tracing::warn;

use crate::models::PollEvent;
use crate::usage::Readout;

const BAR_WIDTH: usize = 20;

/// Why the console loop returned
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The provider rejected the stored session
    AuthInvalid,
    /// Every sender is gone
    Disconnected,
}

/// Drain events on the calling thread until the session is rejected
pub fn run(events: Receiver<PollEvent>) -> ConsoleExit {
    for event in events {
        match event {
            PollEvent::Updated(snapshot) => {
                println!("{}", render_line(&Readout::from_snapshot(&snapshot)));
            }
            PollEvent::AuthInvalid => {
                warn!("Session expired");
                return ConsoleExit::AuthInvalid;
            }
        }
    }
    ConsoleExit::Disconnected
}

/// `[#########...........] 45.0% of limit used`
pub fn render_line(readout: &Readout) -> String {
    let filled = ((readout.percentage / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    format!(
        "[{}{}] {}",
        "#".repeat(filled),
        ".".repeat(BAR_WIDTH - filled),
        readout.text
    )
}
