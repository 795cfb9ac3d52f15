//! Always-on-top overlay showing claude.ai plan usage.
//!
//! The core is UI independent: [`session`] captures a session cookie through a
//! browser view, [`fetcher`] resolves the organization and downloads its usage,
//! and [`scheduler`] polls on a background thread. [`controller`] ties them to
//! the persisted [`config`].

pub mod clock;
pub mod config;
pub mod console;
pub mod controller;
pub mod fetcher;
pub mod models;
pub mod scheduler;
pub mod session;
pub mod theme;
pub mod usage;

#[cfg(windows)]
pub mod native_interop;
#[cfg(windows)]
pub mod window;
