//! Livewire Server - Real-time sensor telemetry fan-out hub.
//!
//! This crate provides the server component of Livewire, responsible for:
//! - Ingesting sensor payloads from an MQTT broker
//! - Authenticating WebSocket subscribers with signed bearer tokens
//! - Broadcasting every payload to all live subscribers
//!
//! # Architecture
//!
//! The server is a hub between the broker (producer) and WebSocket clients
//! (consumers). Payloads flow through a single unbounded queue into one
//! dispatch loop, which writes each payload to every registered subscriber
//! in turn and prunes those whose writes fail. Nothing is persisted or
//! replayed; a subscriber only sees payloads dispatched after it joined.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod routes;
