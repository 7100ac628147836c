//! Repository layer.
//!
//! # Responsibility
//! - Reconcile stored collection rows with validated `Collection` entities.
//! - Keep storage engines behind the `CollectionStore` contract.
//!
//! # Invariants
//! - Reads always go through the domain factory; a row that fails it is
//!   reported and treated as absent.
//! - Storage errors propagate unchanged.

pub mod collections_repo;
pub mod mapping;
