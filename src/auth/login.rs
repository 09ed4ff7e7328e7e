//! Two-step login: credentials, then an optional 6-digit second factor.
//!
//! The flow only talks to the backend. Its single effect on the session is
//! the final `SessionManager::login` commit; failures stay on the form as a
//! message and leave the session untouched.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::{ApiError, AuthBackend, LoginReply};

use super::guard::{GuardDecision, DEFAULT_HOME_PATH};
use super::session::SessionManager;

/// Length of the numeric second-factor code
const TWO_FACTOR_CODE_LENGTH: usize = 6;

/// Minutes a second-factor challenge stays usable before the user has to
/// sign in again.
const TWO_FACTOR_CHALLENGE_MINUTES: i64 = 5;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Email and password required")]
    MissingCredentials,

    #[error("Enter the 6-digit code from your authenticator app")]
    InvalidCode,

    #[error("No verification in progress")]
    NoChallenge,

    #[error("Verification expired. Please sign in again.")]
    ChallengeExpired,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl LoginError {
    /// Message shown on the submitting form
    pub fn user_message(&self) -> String {
        match self {
            LoginError::Api(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

/// Ephemeral state between a first-factor success and the code submission.
/// Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTwoFactorChallenge {
    temp_token: String,
    issued_at: DateTime<Utc>,
}

impl PendingTwoFactorChallenge {
    pub fn new(temp_token: String) -> Self {
        Self {
            temp_token,
            issued_at: Utc::now(),
        }
    }

    pub fn temp_token(&self) -> &str {
        &self.temp_token
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.issued_at + Duration::minutes(TWO_FACTOR_CHALLENGE_MINUTES)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        let expiry = self.issued_at + Duration::minutes(TWO_FACTOR_CHALLENGE_MINUTES);
        (expiry - Utc::now()).num_minutes().max(0)
    }
}

/// Which form the login screen should show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Credentials,
    TwoFactor,
    Complete,
}

/// What a successful submission led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    SignedIn,
    TwoFactorRequired,
}

pub struct LoginFlow {
    backend: Arc<dyn AuthBackend>,
    step: LoginStep,
    challenge: Option<PendingTwoFactorChallenge>,
    error: Option<String>,
    return_to: Option<String>,
}

impl LoginFlow {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            backend,
            step: LoginStep::Credentials,
            challenge: None,
            error: None,
            return_to: None,
        }
    }

    /// Start a login for a user the route guard turned away, so they can be
    /// sent back afterwards.
    pub fn for_redirect(backend: Arc<dyn AuthBackend>, decision: &GuardDecision) -> Self {
        let mut flow = Self::new(backend);
        if let GuardDecision::Redirect { from, .. } = decision {
            flow.return_to = Some(from.clone());
        }
        flow
    }

    pub fn step(&self) -> LoginStep {
        self.step
    }

    pub fn challenge(&self) -> Option<&PendingTwoFactorChallenge> {
        self.challenge.as_ref()
    }

    /// Last error, worded for the form
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Where to navigate once signed in
    pub fn next_path(&self) -> &str {
        self.return_to.as_deref().unwrap_or(DEFAULT_HOME_PATH)
    }

    /// Step 1: email and password.
    pub async fn submit_credentials(
        &mut self,
        email: &str,
        password: &str,
        sessions: &SessionManager,
    ) -> Result<LoginOutcome, LoginError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return self.fail(LoginError::MissingCredentials);
        }

        self.error = None;
        self.challenge = None;
        self.step = LoginStep::Credentials;

        match self.backend.login(email, password).await {
            Ok(LoginReply::Authenticated(grant)) => {
                sessions.login(grant.user, grant.token);
                self.step = LoginStep::Complete;
                info!("Login successful");
                Ok(LoginOutcome::SignedIn)
            }
            Ok(LoginReply::TwoFactorRequired { temp_token }) => {
                self.challenge = Some(PendingTwoFactorChallenge::new(temp_token));
                self.step = LoginStep::TwoFactor;
                info!("Second factor required");
                Ok(LoginOutcome::TwoFactorRequired)
            }
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Login failed");
                self.fail(e.into())
            }
        }
    }

    /// Step 2: the 6-digit code for the pending challenge.
    pub async fn submit_code(
        &mut self,
        code: &str,
        sessions: &SessionManager,
    ) -> Result<LoginOutcome, LoginError> {
        let Some(challenge) = self.challenge.clone() else {
            return self.fail(LoginError::NoChallenge);
        };

        if challenge.is_expired() {
            warn!("Two-factor challenge expired");
            self.cancel_two_factor();
            return self.fail(LoginError::ChallengeExpired);
        }

        let code = code.trim();
        if !is_valid_code(code) {
            return self.fail(LoginError::InvalidCode);
        }

        self.error = None;

        match self
            .backend
            .verify_two_factor(challenge.temp_token(), code)
            .await
        {
            Ok(grant) => {
                sessions.login(grant.user, grant.token);
                self.challenge = None;
                self.step = LoginStep::Complete;
                info!("Two-factor verification successful");
                Ok(LoginOutcome::SignedIn)
            }
            Err(e) => {
                // Challenge kept so the user can retype the code
                error!(error = %e, kind = ?e.kind(), "Two-factor verification failed");
                self.fail(e.into())
            }
        }
    }

    /// Abandon the second factor and go back to the credentials form
    pub fn cancel_two_factor(&mut self) {
        self.challenge = None;
        self.error = None;
        self.step = LoginStep::Credentials;
    }

    fn fail<T>(&mut self, err: LoginError) -> Result<T, LoginError> {
        self.error = Some(err.user_message());
        Err(err)
    }
}

fn is_valid_code(code: &str) -> bool {
    code.len() == TWO_FACTOR_CODE_LENGTH && code.chars().all(|c| c.is_ascii_digit())
}
