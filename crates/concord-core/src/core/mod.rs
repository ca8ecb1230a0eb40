//! Core module: engine-agnostic domain and runtime.
//!
//! This module contains:
//! - `error`: Engine error taxonomy
//! - `session`: Session identity, metadata and live state
//! - `timeline`: Canonical timeline entries
//! - `events`: Normalized engine events and the registry inbox
//! - `assembler`: Folds engine events into a timeline
//! - `permissions`: Tool approval queue and policies
//! - `background`: Snapshots of sessions that are not in the foreground
//! - `persistence`: Session files on disk
//! - `registry`: Session lifecycle and routing

pub mod assembler;
pub mod background;
pub mod error;
pub mod events;
pub mod permissions;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod timeline;
