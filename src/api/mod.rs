//! Typed client for the nugs.net service.
//!
//! The service is consumed read-only over HTTPS. This module keeps the
//! wire shapes (`dto`), the authentication/token plumbing (`auth`) and the
//! endpoint methods (`client`) separate; nothing outside `api` touches raw
//! responses.

pub mod auth;
pub mod client;
pub mod dto;

pub use auth::{LegacyClaims, StreamParams};
pub use client::NugsClient;
