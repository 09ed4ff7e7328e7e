//! Authentication module for the console session.
//!
//! This module provides:
//! - `SessionManager`: session lifecycle (hydration, login, logout, profile refresh)
//! - `RouteGuard`: gate in front of protected views
//! - `LoginFlow`: credentials and second-factor submission
//! - `SessionStorage`: durable token/user entries (file, OS keychain, memory)

pub mod guard;
pub mod login;
pub mod session;
pub mod storage;

pub use guard::{GuardDecision, History, RouteGuard};
pub use login::{LoginError, LoginFlow, LoginOutcome, LoginStep, PendingTwoFactorChallenge};
pub use session::{HydrationPolicy, Session, SessionManager, SessionPhase};
pub use storage::{open_storage, SessionStorage, StorageKind};
