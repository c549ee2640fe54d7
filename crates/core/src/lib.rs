//! `runlog-core`: identifiers, the domain error model and the aggregate contract.
//!
//! Shared by the pipeline domain and the history store; no storage or IO here.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, Seq};
pub use error::{DomainError, DomainResult};
pub use id::AggregateId;
