//! Core types, errors, and wire protocol for the cabin agent.
//!
//! This crate provides the foundation the rest of the workspace builds on:
//!
//! - **Error types**: [`AgentError`] and [`Result`], with the mapping from
//!   error variants to wire error codes
//! - **Protocol types**: request/response/event envelopes and the tagged
//!   [`Operation`] union spoken over the control WebSocket
//! - **Tokens**: the short base36 identifiers handed out as `wsId` and
//!   `watcherId` values
//!
//! cabin-core carries no business logic and no async runtime dependency;
//! every other crate in the workspace depends on it.

pub mod error;
pub mod protocol;
pub mod token;

// Re-export commonly used types for convenience
pub use error::{AgentError, Result};
pub use protocol::{
    ErrorBody, EventEnvelope, Operation, OperationFamily, RequestEnvelope, ResponseEnvelope,
};
pub use token::new_token;
