//! eventdesk - command-line front end for the venue console session.
//!
//! Signs in against the backend (with two-factor when the account requires
//! it), shows who is signed in, and checks protected views against the
//! route guard.

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eventdesk::app::App;
use eventdesk::auth::{GuardDecision, History, SessionPhase, StorageKind};
use eventdesk::config::Config;
use eventdesk::utils::{format_optional, mask_token};

#[derive(Parser)]
#[command(name = "eventdesk", version, about = "Venue console session tool")]
struct Cli {
    /// Backend base URL (overrides config and EVENTDESK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Where to keep the session: file, keyring or memory
    #[arg(long, global = true)]
    storage: Option<StorageKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Show the session state
    Status,
    /// Check whether a console view may be opened
    Open { path: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_file.then(|| config.log_dir()) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, "eventdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let (mut config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    config.apply_env_overrides();
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }

    let _log_guard = init_tracing(&config);
    if let Some(e) = config_error {
        warn!(error = %e, "Failed to load config, using defaults");
    }
    info!(api = %config.api_base_url, "eventdesk starting");

    let mut app = App::new(config)?;
    app.start().await;

    match cli.command {
        Command::Login { email } => app.login_interactive(email).await?,
        Command::Logout => {
            app.sessions.logout();
            println!("Signed out.");
        }
        Command::Whoami => match app.sessions.current_user() {
            Some(user) => {
                println!("{}", user.display_name());
                println!("  email: {}", format_optional(user.email.as_deref(), "-"));
                println!("  role:  {}", format_optional(user.role.as_deref(), "-"));
                println!(
                    "  2FA:   {}",
                    if user.has_two_factor() { "enabled" } else { "disabled" }
                );
                if let Some(token) = app.sessions.token() {
                    println!("  token: {}", mask_token(&token));
                }
            }
            None => println!("Not signed in."),
        },
        Command::Status => {
            let label = match app.sessions.phase() {
                SessionPhase::Authenticated => "signed in",
                SessionPhase::Unauthenticated => "signed out",
                SessionPhase::Hydrating | SessionPhase::Unhydrated => "undecided",
            };
            println!("Session: {}", label);
        }
        Command::Open { path } => {
            let mut history = History::new("/");
            history.push(&path);

            let decision = app.open(&path).await;
            let showing = app.guard.apply(&decision, &mut history).to_string();
            match decision {
                GuardDecision::Allow => println!("{}: allowed", path),
                GuardDecision::Redirect { from, .. } => {
                    println!("{}: sign in required, redirected to {}", from, showing)
                }
                GuardDecision::Pending => println!("{}: session still loading", path),
            }
        }
    }

    info!("eventdesk shutting down");
    Ok(())
}
