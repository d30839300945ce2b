pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod backoff;
pub mod buffer;
pub mod collector;
pub mod commands;
pub mod config;
pub mod health;
pub mod protocol;
pub mod uplink;
