//! Path and search utilities shared by both sides of the wire.

pub mod path;
pub mod search;
