//! flurry-proxy: volunteer relay proxy.
//!
//! Polls a rendezvous broker for client offers, answers them over WebRTC,
//! and relays each client's data channel to a WebSocket relay under a
//! shared bandwidth limit. [`orchestrator::Orchestrator`] drives everything;
//! the transports plug in through the traits in `flurry_core::transport`.

pub mod broker;
pub mod config;
pub mod context;
pub mod nat;
pub mod orchestrator;
pub mod peer;
pub mod relay;
pub mod report;
pub mod session;
pub mod stats;

#[cfg(test)]
mod mock;
