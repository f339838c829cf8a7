//! # rivulet-id
//!
//! Typed identifiers for the rivulet stream-processing platform.
//!
//! ## Design Principles
//!
//! - IDs are opaque strings with strict parsing; the type prevents
//!   mixing different resource kinds
//! - Processor ids carry the active/standby relationship syntactically:
//!   an active is `"3"`, its k-th standby replica is `"3-k"`
//! - Resource ids and hosts are broker-assigned and never interpreted
//!   beyond non-emptiness
//! - All IDs support roundtrip serialization (parse → format → parse)
//!
//! ## ID Format
//!
//! Examples:
//! - `0`, `7` — active processors
//! - `0-0`, `7-2` — standby replicas of those actives
//! - `container_e0022_01` — a broker resource id
//! - `host-14.dc2.example.com` — a host

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::{Host, ProcessorId, ResourceId};
