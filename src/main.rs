use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claude_usage_bar::clock::SystemClock;
use claude_usage_bar::config::{self, ConfigStore};
use claude_usage_bar::console::{self, ConsoleExit};
use claude_usage_bar::controller::{Controller, Phase};
use claude_usage_bar::fetcher::{FetchError, UreqTransport, UsageFetcher, UsageSource};
use claude_usage_bar::models::{Credential, PollEvent};
use claude_usage_bar::scheduler::EventSink;
use claude_usage_bar::usage::Readout;

/// Exit code when the stored session is rejected
const EXIT_AUTH_INVALID: i32 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Always-on-top claude.ai usage overlay")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Show the overlay and poll usage (default)
    Run {
        /// Print updates to stdout instead of opening a window
        #[arg(long)]
        headless: bool,

        /// Poll interval in seconds, 10 to 300 (saved to the config)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Fetch usage once and print it
    Once,
    /// Store a session key copied from the browser's `sessionKey` cookie
    Login {
        /// Session key; read from stdin when omitted
        #[arg(long)]
        session_key: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Print the config with the session key redacted
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let path = match cli.config {
        Some(p) => p,
        None => config::default_path()?,
    };
    let store = Arc::new(ConfigStore::open(path));

    match cli.command.unwrap_or(Command::Run {
        headless: false,
        interval: None,
    }) {
        Command::Run { headless, interval } => {
            if let Some(secs) = interval {
                let applied = store.set_poll_interval(secs);
                info!("Poll interval set to {applied}s");
            }
            run(store, headless)
        }
        Command::Once => once(&store),
        Command::Login { session_key } => login(&store, session_key),
        Command::Logout => {
            store.clear_credential();
            println!("Session cleared");
            Ok(())
        }
        Command::Show => show(&store),
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("claude_usage_bar=debug")
    } else {
        EnvFilter::new("claude_usage_bar=info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn usage_source() -> Result<Arc<dyn UsageSource>> {
    let transport = UreqTransport::new().context("Failed to set up HTTPS client")?;
    Ok(Arc::new(UsageFetcher::new(transport)))
}

#[cfg(windows)]
fn run(store: Arc<ConfigStore>, headless: bool) -> Result<()> {
    if headless {
        return run_headless(store);
    }
    claude_usage_bar::window::run(store, usage_source()?).context("Overlay window failed")
}

#[cfg(not(windows))]
fn run(store: Arc<ConfigStore>, _headless: bool) -> Result<()> {
    run_headless(store)
}

fn run_headless(store: Arc<ConfigStore>) -> Result<()> {
    let (tx, rx) = mpsc::channel::<PollEvent>();
    let sink: EventSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let controller = Controller::new(store, usage_source()?, Arc::new(SystemClock::new()), sink);

    if controller.start() == Phase::SignedOut {
        bail!("Not signed in. Run `claude-usage-bar login` with your claude.ai sessionKey cookie.");
    }

    match console::run(rx) {
        ConsoleExit::AuthInvalid => {
            controller.stop();
            eprintln!("Session expired. Run `claude-usage-bar login` to sign in again.");
            std::process::exit(EXIT_AUTH_INVALID);
        }
        ConsoleExit::Disconnected => Ok(()),
    }
}

fn once(store: &ConfigStore) -> Result<()> {
    let credential = store
        .credential()
        .context("Not signed in. Run `claude-usage-bar login` first.")?;
    let transport = UreqTransport::new().context("Failed to set up HTTPS client")?;

    match UsageFetcher::new(transport).try_fetch(&credential) {
        Ok(snapshot) => {
            println!("{}", console::render_line(&Readout::from_snapshot(&snapshot)));
            Ok(())
        }
        Err(FetchError::Unauthorized) => {
            eprintln!("Session expired. Run `claude-usage-bar login` to sign in again.");
            std::process::exit(EXIT_AUTH_INVALID);
        }
        Err(e) => Err(e).context("Failed to fetch usage"),
    }
}

fn login(store: &ConfigStore, session_key: Option<String>) -> Result<()> {
    let raw = match session_key {
        Some(k) => k,
        None => {
            eprintln!("Paste the value of the claude.ai `sessionKey` cookie:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read session key from stdin")?;
            line
        }
    };

    let credential = Credential::new(raw).context("Session key is empty")?;
    store.set_credential(credential);
    println!("Session saved to {}", store.path().display());
    Ok(())
}

fn show(store: &ConfigStore) -> Result<()> {
    let mut value = serde_json::to_value(store.snapshot())?;
    if let Some(key) = value.get_mut("session_key") {
        if !key.is_null() {
            *key = serde_json::Value::String("<redacted>".to_string());
        }
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    println!("# {}", store.path().display());
    Ok(())
}
