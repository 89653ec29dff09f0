mod error;
mod event;
mod types;

pub use error::{DbError, ProcessError, ValidationError};
pub use event::Event;
pub use types::{
    ContactRole, EventId, EventType, HistoryId, IncidentId, MuteReason, ObjectId, RuleId,
    Severity, SourceId,
};
