//! eventdesk - session core for the venue administration console.
//!
//! Owns the signed-in identity: stored token and profile, startup
//! hydration, the credentials + 2FA login flow, and the route guard
//! protected views sit behind.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod models;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
