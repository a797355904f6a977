//! Meshgate HTTP gateway
//!
//! Login handoff, device registration, certificate issuance and the HTTP
//! and WebSocket signaling transports.

pub mod auth;
pub mod error;
pub mod oauth;
pub mod routes;
pub mod server;

pub use auth::{Claims, TokenIssuer, TokenKind, TokenResponse};
pub use error::ApiError;
pub use oauth::{OAuthClient, OAuthConfig};
pub use server::{AppState, WebServer};
