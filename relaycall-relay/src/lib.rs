//! HTTP client for the relay's session and track API

pub mod client;

pub use client::RelayClient;
