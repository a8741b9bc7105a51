//! # fleetlink-core
//!
//! Collection & inspection core for the fleetlink on-vehicle telemetry
//! agent.
//!
//! The agent ingests decoded vehicle signals (CAN, OBD, custom sources),
//! evaluates cloud-supplied data-collection campaigns against them in real
//! time, and forwards triggered snapshots to the cloud through a narrow
//! transport contract.
//!
//! ## Architecture
//!
//! ```text
//! decoders ──► signal pipeline ──► inspection engine ──► upload queue ──► transport
//!                                        ▲
//!                                        │ inspection matrix (watch)
//!  transport ──► campaign manager ───────┤
//!                      │                 │ decoder dictionary (watch)
//!                      ├──► checkin reporter
//!                      └──► persistency
//! ```
//!
//! Control documents (decoder manifests, collection schemes, state
//! templates) flow from the transport into the [`campaign::CampaignManager`],
//! which drives campaign lifecycles and republishes immutable snapshots to
//! the data path. The [`inspection`] engine is the single consumer of the
//! signal pipeline; all its ring-buffer state is task-local.

#![warn(clippy::all)]

pub mod campaign;
pub mod checkin;
pub mod clock;
pub mod config;
pub mod dictionary;
pub mod ingestion;
pub mod inspection;
pub mod persistency;
pub mod pipeline;
pub mod rawdata;
pub mod schemas;
pub mod transport;
pub mod types;
pub mod uploader;

pub use campaign::manager::CampaignManager;
pub use clock::{Clock, SystemClock};
pub use config::AgentConfig;
pub use types::{SignalId, SignalSample, SignalType, SignalValue, SyncId, Timestamp};
