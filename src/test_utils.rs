//! Shared test fixtures: a scripted `AuthBackend` and profile builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use crate::api::{ApiError, AuthBackend, AuthGrant, LoginReply};
use crate::auth::storage::{SessionStorage, USER_KEY};
use crate::models::UserProfile;

/// A scripted backend answer
#[derive(Debug, Clone)]
pub enum Canned<T> {
    Ok(T),
    Unauthorized,
    ServerDown,
    Malformed,
}

impl<T: Clone> Canned<T> {
    fn to_result(&self) -> Result<T, ApiError> {
        match self {
            Canned::Ok(value) => Ok(value.clone()),
            Canned::Unauthorized => Err(ApiError::Unauthorized("Token inválido".to_string())),
            Canned::ServerDown => Err(ApiError::ServerError("backend down".to_string())),
            Canned::Malformed => Err(ApiError::InvalidResponse("response has no user".to_string())),
        }
    }
}

/// Pops the next scripted answer; an empty script answers Unauthorized.
fn next<T: Clone>(queue: &Mutex<VecDeque<Canned<T>>>) -> Result<T, ApiError> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Canned::Unauthorized)
        .to_result()
}

#[derive(Default)]
pub struct FakeBackend {
    login_replies: Mutex<VecDeque<Canned<LoginReply>>>,
    verify_replies: Mutex<VecDeque<Canned<AuthGrant>>>,
    me_replies: Mutex<VecDeque<Canned<UserProfile>>>,
    gate: Option<Arc<Notify>>,
    login_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    me_calls: AtomicUsize,
    last_me_token: Mutex<Option<String>>,
    last_verify: Mutex<Option<(String, String)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_login(self, reply: Canned<LoginReply>) -> Self {
        self.login_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn with_verify(self, reply: Canned<AuthGrant>) -> Self {
        self.verify_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn with_me(self, reply: Canned<UserProfile>) -> Self {
        self.me_replies.lock().unwrap().push_back(reply);
        self
    }

    /// Park every profile fetch until the gate is notified
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn me_calls(&self) -> usize {
        self.me_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.login_calls() + self.verify_calls() + self.me_calls()
    }

    pub fn last_me_token(&self) -> Option<String> {
        self.last_me_token.lock().unwrap().clone()
    }

    pub fn last_verify(&self) -> Option<(String, String)> {
        self.last_verify.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn login(&self, _email: &str, _password: &str) -> Result<LoginReply, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.login_replies)
    }

    async fn verify_two_factor(
        &self,
        temp_token: &str,
        code: &str,
    ) -> Result<AuthGrant, ApiError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_verify.lock().unwrap() = Some((temp_token.to_string(), code.to_string()));
        next(&self.verify_replies)
    }

    async fn fetch_current_user(&self, token: &str) -> Result<UserProfile, ApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_me_token.lock().unwrap() = Some(token.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        next(&self.me_replies)
    }
}

pub fn profile(id: i64) -> UserProfile {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("User {}", id),
        "email": format!("user{}@venue.test", id),
        "role": "admin",
        "twoFactorEnabled": false
    }))
    .unwrap()
}

pub fn grant(id: i64, token: &str) -> AuthGrant {
    AuthGrant {
        user: profile(id),
        token: token.to_string(),
    }
}

/// The user entry currently in storage, parsed
pub fn stored_user(storage: &dyn SessionStorage) -> Option<UserProfile> {
    storage
        .get(USER_KEY)
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}
