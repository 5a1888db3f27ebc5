//! Floodgate - HTTP request gate with per-client rate limiting
//!
//! This crate throttles clients by IP address with a fixed-window counter
//! kept in a shared key-value store (Redis), and forwards admitted requests
//! to the API routes. When the store is unavailable, requests are admitted.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
