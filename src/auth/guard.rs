//! Route guard for protected console views.
//!
//! The guard is a pure function of the current `Session`: it never holds
//! state of its own. While hydration is in flight it answers `Pending` so
//! callers don't flash the login page for a user who is about to be
//! restored.

use tokio::sync::watch;
use tracing::debug;

use super::session::{Session, SessionManager};

/// Entry point unauthenticated users are sent to
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Landing page after login when there is nowhere to return to
pub const DEFAULT_HOME_PATH: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session not decided yet; render nothing
    Pending,
    Allow,
    /// Send the user to `to`. With `replace` the guarded entry is replaced
    /// in history so going back can't land on it again.
    Redirect {
        to: String,
        from: String,
        replace: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RouteGuard {
    login_path: String,
    public_paths: Vec<String>,
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_PATH)
    }
}

impl RouteGuard {
    pub fn new(login_path: &str) -> Self {
        Self {
            login_path: login_path.to_string(),
            public_paths: Vec::new(),
        }
    }

    /// Paths (and everything below them) reachable without signing in
    pub fn with_public_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn is_public(&self, path: &str) -> bool {
        std::iter::once(&self.login_path)
            .chain(self.public_paths.iter())
            .any(|public| is_same_or_below(path, public))
    }

    pub fn evaluate(&self, session: &Session, path: &str) -> GuardDecision {
        if self.is_public(path) || session.is_authenticated() {
            GuardDecision::Allow
        } else if session.is_loading {
            GuardDecision::Pending
        } else {
            self.redirect(path)
        }
    }

    /// Evaluate against the manager's current session
    pub fn check(&self, sessions: &SessionManager, path: &str) -> GuardDecision {
        self.evaluate(&sessions.session(), path)
    }

    /// Wait until the session is decided, then evaluate.
    pub async fn resolve(&self, rx: &mut watch::Receiver<Session>, path: &str) -> GuardDecision {
        loop {
            let decision = self.evaluate(&rx.borrow_and_update(), path);
            if decision != GuardDecision::Pending {
                return decision;
            }
            debug!(path = path, "Waiting for session hydration");
            if rx.changed().await.is_err() {
                // Manager is gone; nobody can sign in anymore
                return self.redirect(path);
            }
        }
    }

    /// `resolve` against a manager
    pub async fn resolve_for(&self, sessions: &SessionManager, path: &str) -> GuardDecision {
        let mut rx = sessions.subscribe();
        self.resolve(&mut rx, path).await
    }

    /// Carry a decision out on `history`. Returns the path now showing.
    pub fn apply<'a>(&self, decision: &GuardDecision, history: &'a mut History) -> &'a str {
        if let GuardDecision::Redirect { to, replace, .. } = decision {
            if *replace {
                history.replace(to);
            } else {
                history.push(to);
            }
        }
        history.current()
    }

    fn redirect(&self, path: &str) -> GuardDecision {
        GuardDecision::Redirect {
            to: self.login_path.clone(),
            from: path.to_string(),
            replace: true,
        }
    }
}

fn is_same_or_below(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path == "/";
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
}

/// Minimal navigation history: a stack of paths and a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    entries: Vec<String>,
    index: usize,
}

impl History {
    pub fn new(initial: &str) -> Self {
        Self {
            entries: vec![initial.to_string()],
            index: 0,
        }
    }

    pub fn current(&self) -> &str {
        &self.entries[self.index]
    }

    /// Navigate forward to `path`, dropping any forward entries
    pub fn push(&mut self, path: &str) {
        self.entries.truncate(self.index + 1);
        self.entries.push(path.to_string());
        self.index = self.entries.len() - 1;
    }

    /// Swap the current entry for `path`
    pub fn replace(&mut self, path: &str) {
        self.entries[self.index] = path.to_string();
    }

    /// Step back one entry. Returns the new current path, or None at the start.
    pub fn back(&mut self) -> Option<&str> {
        if self.index == 0 {
            return None;
        }
        self.index -= 1;
        Some(self.current())
    }
}
