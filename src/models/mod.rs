//! Core data models for the object gateway.
//!
//! Requests on their way to the storage backend, object metadata on its way
//! back, and the row the local backend persists per object.

pub mod identity;
pub mod object;
