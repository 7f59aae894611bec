//! Persisted entities

pub mod command;
pub mod condition;
pub mod vehicle;
