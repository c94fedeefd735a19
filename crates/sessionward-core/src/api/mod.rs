//! Authenticated request pipeline for protected API endpoints.
//!
//! `AuthenticatedClient` attaches the session's bearer token to every
//! request and heals a single authorization failure by refreshing the
//! session through the shared refresh coordinator.

pub mod client;
pub mod error;

pub use client::AuthenticatedClient;
pub use error::ApiError;
