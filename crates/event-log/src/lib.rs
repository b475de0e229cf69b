//! Append-only structured JSON-lines security-event logging for the mcproxy
//! project.
//!
//! This crate provides the shared event channel used by every component in
//! the system. Each security event is serialised as a single
//! newline-terminated JSON object and appended to a size-capped, rotating
//! log file, producing a [JSON Lines](https://jsonlines.org/) stream that is
//! easy to ship, parse, and replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use event_log::{EventSink, SecurityEvent, SecurityEventKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = EventSink::start("/var/log/mcproxy/events.jsonl").await?;
//!
//! sink.log(SecurityEvent::new(
//!     SecurityEventKind::ProxyStarted,
//!     serde_json::json!({"version": "0.1.0"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

// Re-export primary public types at the crate root for convenience.
pub use entry::{SecurityEvent, SecurityEventKind};
pub use sink::EventSink;
pub use writer::{EventWriteError, EventWriter};
