//! Incident store trait and in-memory implementation.

mod memory;

pub use memory::InMemoryIncidentStore;
pub use tardis_types::{
    ActionStatus, Evidence, Incident, IncidentError, IncidentFilter, IncidentPatch,
    IncidentStatus, IncidentStore, IncidentSummary, NewAction, NewEvidence, NewIncident,
    ResponseAction, Severity,
};
