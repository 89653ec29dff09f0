// ============================================================================
// incidentd Library
// ============================================================================

pub mod config;
pub mod core;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod incident;
pub mod listener;
pub mod object;
pub mod plugin;
pub mod recipient;
pub mod runtime;
pub mod source;

// Re-export main types for convenience
pub use config::{Config, ConfigError};
pub use core::{
    ContactRole, Event, EventType, MuteReason, ObjectId, ProcessError, Severity, SourceId,
};
pub use db::{Database, MemoryDatabase};
pub use incident::{Incident, IncidentEngine};
pub use object::{Object, ObjectRegistry};
pub use recipient::{Recipient, RecipientKey};
pub use runtime::{RuntimeCache, RuntimeConfig};
