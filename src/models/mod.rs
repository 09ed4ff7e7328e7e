//! Data models for eventdesk entities.
//!
//! The session core only needs the signed-in user's profile. Its shape is
//! owned by the backend; see `UserProfile`.

pub mod user;

pub use user::UserProfile;
