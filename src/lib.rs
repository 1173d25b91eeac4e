//! # Modem Poller
//!
//! Background poller for cellular modems that speak Quectel-style AT
//! commands. It periodically asks the modem for its serving cell, decodes the
//! LTE and NR5G-NSA replies, and keeps a bounded, crash-safe history of the
//! readings on disk.
//!
//! ## Quick Start
//!
//! ```rust
//! use modem_poller::query::QueryEngine;
//! use modem_poller::parser::{ServingCellParser, SERVING_CELL_COMMAND};
//! use modem_poller::telemetry::TechnologyTag;
//! use modem_poller::transport::ScriptedTransport;
//! use std::time::Duration;
//!
//! let transport = ScriptedTransport::with_lines([
//!     "+QENG: \"NR5G-NSA\",302,720,0,-60,30,-11,638016,78,8,1",
//!     "OK",
//! ]);
//! let mut engine = QueryEngine::new(transport, Duration::from_secs(1));
//!
//! let lines = engine.query(SERVING_CELL_COMMAND).unwrap();
//! let readings = ServingCellParser::new().parse_serving_cell(&lines);
//! assert_eq!(readings[&TechnologyTag::Nr].get("band"), Some("78"));
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Line framing over the serial port
//! - [`query`] - AT command / `OK` sentinel state machine
//! - [`parser`] - Reply grammar classification and decoding
//! - [`telemetry`] - Samples and per-technology records
//! - [`store`] - Retention window and atomic snapshots
//! - [`scheduler`] - The poll loop
//! - [`export`] - Post-snapshot export hooks
//! - [`config`] - File and environment configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod export;
pub mod parser;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use parser::ServingCellParser;
pub use query::{ProtocolError, QueryEngine};
pub use scheduler::{PollScheduler, ScheduleSettings, SettingsError};
pub use store::TelemetryStore;
pub use telemetry::{Sample, TechnologyRecord, TechnologyTag};
pub use transport::{LineTransport, ScriptedTransport, SerialTransport};
