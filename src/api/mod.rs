//! REST API client module for the eventdesk backend.
//!
//! This module provides the `ApiClient` for the authentication endpoints
//! (`/auth/login`, `/auth/login/verify-2fa`, `/auth/me`) and the
//! `AuthBackend` trait the session core consumes.
//!
//! Authenticated requests carry `Authorization: Bearer <token>`. Error
//! responses carry a `{message}` body which ends up in `ApiError`.

pub mod client;
pub mod error;

pub use client::{ApiClient, AuthBackend, AuthGrant, LoginReply};
pub use error::{ApiError, ErrorKind};
