//! Collection domain model.
//!
//! # Responsibility
//! - Define the collection entity and the factory that validates it.
//! - Keep filter syntax rules next to the entity that enforces them.
//!
//! # Invariants
//! - Every entity handed out by this module passed `Collection::create`.

pub mod collection;
pub mod filter;
