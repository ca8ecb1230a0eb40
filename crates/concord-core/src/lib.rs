//! Core Concord library (session registry, engine adapters, persistence).

pub mod config;
pub mod core;
pub mod engines;
pub mod logging;
