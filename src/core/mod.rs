//! Core types: errors, configuration, byte sizes.

pub mod config;
pub mod errors;
pub mod size;
