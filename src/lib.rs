#![forbid(unsafe_code)]

// Huddle library - mediasoup-based meeting server

pub mod auth;
pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
