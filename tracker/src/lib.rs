//! Real-time telemetry ingestion and broadcast hub.
//!
//! Producers submit position reports; each accepted report is persisted and
//! then fanned out to every live viewer connected over WebSocket.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod db;
pub mod errors;
pub mod hub;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pipeline;
pub mod registry;
pub mod rest;
pub mod store;
pub mod validate;

pub use errors::{Error, Result};
pub use hub::Hub;
