//! REST API client and authentication.
//!
//! This module provides the [`RestClient`] used by the page fetcher, along
//! with the [`Auth`] credentials it sends.

mod auth;
mod rest;

pub use auth::Auth;
pub use rest::RestClient;
