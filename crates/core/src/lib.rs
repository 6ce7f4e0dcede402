//! `meridian-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, entity identity, value objects, the domain error model and the
//! validation outcome model shared by every validator implementation.

pub mod entity;
pub mod error;
pub mod id;
pub mod validation;
pub mod value_object;

pub use entity::{Entity, EntityKey};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, EventId, ScopeId};
pub use validation::{Severity, ValidationError, ValidationFault, ValidationOutcome};
pub use value_object::ValueObject;
