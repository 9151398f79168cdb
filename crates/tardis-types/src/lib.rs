//! Core types and traits for the TARDIS backend kernel.
//!
//! Every store in the workspace shares the record shape defined here: a UUID
//! id, creation/update timestamps, a small status enum, an owner, a free-form
//! metadata bag and an append-only audit trail.

mod analytics;
mod consent;
mod dto;
mod error;
mod incident;
mod keys;
mod llm;
mod quota;
mod record;
mod storage;
mod traits;

pub use analytics::*;
pub use consent::*;
pub use dto::*;
pub use error::*;
pub use incident::*;
pub use keys::*;
pub use llm::*;
pub use quota::*;
pub use record::*;
pub use storage::*;
pub use traits::*;
