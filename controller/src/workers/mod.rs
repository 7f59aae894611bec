//! Background workers

pub mod gc;
pub mod status;
