#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod bus;
pub mod error;
pub mod session;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable conventionally holding the socket endpoint, e.g.
/// `wss://example.com/socket`.
pub const SOCKET_URL_VAR: &str = "CHANNEL_SOCKET_URL";
