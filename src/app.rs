//! Application wiring for eventdesk.
//!
//! `App` owns the configuration and the services built from it: the API
//! client, the session manager and the route guard. The CLI drives
//! everything through it.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::api::{ApiClient, AuthBackend};
use crate::auth::{
    open_storage, GuardDecision, LoginError, LoginFlow, LoginOutcome, RouteGuard,
    SessionManager, SessionStorage,
};
use crate::config::Config;

/// Wrong codes accepted before the interactive login gives up
const MAX_CODE_ATTEMPTS: u32 = 3;

pub struct App {
    pub config: Config,
    pub sessions: SessionManager,
    pub guard: RouteGuard,
    backend: Arc<dyn AuthBackend>,
    /// Write config changes back to disk
    save_config: bool,
}

impl App {
    /// Build the app from a loaded config
    pub fn new(config: Config) -> Result<Self> {
        let session_dir = config.session_dir().unwrap_or_else(|e| {
            warn!(error = %e, "No data directory, keeping session in ./session");
            PathBuf::from("./session")
        });
        debug!(?session_dir, storage = ?config.storage, "Session storage configured");

        let storage = open_storage(config.storage, session_dir);
        let api = ApiClient::with_timeout(&config.api_base_url, config.request_timeout())?;
        debug!(base_url = api.base_url(), "API client configured");

        let mut app = Self::from_parts(config, storage, Arc::new(api));
        app.save_config = true;
        Ok(app)
    }

    /// Build the app around existing storage and backend
    pub fn from_parts(
        config: Config,
        storage: Arc<dyn SessionStorage>,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        let sessions = SessionManager::new(storage, backend.clone())
            .with_policy(config.hydration.clone());
        let guard = RouteGuard::new(&config.login_path)
            .with_public_paths(config.public_paths.iter().cloned());

        Self {
            config,
            sessions,
            guard,
            backend,
            save_config: false,
        }
    }

    /// Restore the stored session, if any
    pub async fn start(&self) {
        self.sessions.initialize().await;
    }

    pub fn is_authenticated(&self) -> bool {
        self.sessions.is_authenticated()
    }

    pub fn login_flow(&self) -> LoginFlow {
        LoginFlow::new(self.backend.clone())
    }

    /// Route guard decision for `path`, once the session is decided
    pub async fn open(&self, path: &str) -> GuardDecision {
        self.guard.resolve_for(&self.sessions, path).await
    }

    /// Remember the email for the next login prompt
    pub fn remember_email(&mut self, email: &str) {
        self.config.last_email = Some(email.to_string());
        if self.save_config {
            if let Err(e) = self.config.save() {
                warn!(error = %e, "Failed to save config");
            }
        }
    }

    // =========================================================================
    // Interactive login
    // =========================================================================

    /// Prompt for credentials (and a code when required) on the terminal
    pub async fn login_interactive(&mut self, email: Option<String>) -> Result<()> {
        println!("\n=== eventdesk login ===\n");

        let email = match email.or_else(|| self.config.last_email.clone()) {
            Some(last) => {
                let input = Self::prompt_line(&format!("Email [{}]: ", last))?;
                if input.is_empty() {
                    last
                } else {
                    input
                }
            }
            None => Self::prompt_line("Email: ")?,
        };
        let password = rpassword::prompt_password("Password: ")?;

        println!("\nAuthenticating...");

        let mut flow = self.login_flow();
        match flow
            .submit_credentials(&email, &password, &self.sessions)
            .await
        {
            Ok(LoginOutcome::SignedIn) => {}
            Ok(LoginOutcome::TwoFactorRequired) => self.complete_two_factor(&mut flow).await?,
            Err(e) => bail!(e.user_message()),
        }

        self.remember_email(&email);

        let name = self
            .sessions
            .current_user()
            .map(|u| u.display_name())
            .unwrap_or_default();
        println!("Login successful! Signed in as {}\n", name);
        Ok(())
    }

    async fn complete_two_factor(&self, flow: &mut LoginFlow) -> Result<()> {
        println!("Two-factor authentication is enabled for this account.");
        if let Some(challenge) = flow.challenge() {
            println!(
                "Enter the code within {} minutes.",
                challenge.minutes_until_expiry()
            );
        }

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = Self::prompt_line("Verification code (empty to cancel): ")?;
            if code.is_empty() {
                flow.cancel_two_factor();
                bail!("Verification cancelled");
            }

            match flow.submit_code(&code, &self.sessions).await {
                Ok(_) => return Ok(()),
                Err(e @ LoginError::ChallengeExpired) => bail!(e.user_message()),
                Err(e) => eprintln!("{}", e.user_message()),
            }
        }

        flow.cancel_two_factor();
        bail!("Too many failed verification attempts")
    }

    fn prompt_line(prompt: &str) -> Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }
}
