//! Command implementations for the main binary

pub mod report;
pub mod run;
pub mod scan;
