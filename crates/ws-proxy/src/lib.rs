//! WebSocket security proxy for the mcproxy project.
//!
//! This crate couples an untrusted client session to a trusted downstream
//! MCP server session, sanitizing every JSON-RPC message that crosses it in
//! either direction.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ClientLeg | ServerLeg  <--WS-->  MCP server
//!                        |          |
//!                   [Sanitizer] [resubstitute]
//!                        |
//!                  [Event Sink]
//! ```
//!
//! The [`coordinator`] accepts sessions and wires one [`client_leg`] to one
//! [`server_leg`] per connection. The client leg runs the per-frame
//! pipeline (parse, validate, rate-limit, sanitize); the server leg owns
//! reconnection, the bounded send queue, and placeholder re-substitution on
//! the egress edge.

pub mod client_leg;
pub mod coordinator;
pub mod jsonrpc;
pub mod server_leg;

// Re-export the primary public types at the crate root.
pub use client_leg::{ClientLeg, ClientLegConfig, ConnectionStats};
pub use coordinator::{ConnectionRecord, ProxyConfig, ProxyCoordinator};
pub use server_leg::{ServerEvent, ServerLeg, ServerLegConfig, ServerLegState};
