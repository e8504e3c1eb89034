//! A3S Mirror CLI - container image mirroring for disconnected clusters.

pub mod commands;
pub mod executor;

pub use executor::{CollaboratorFactory, Collaborators, DefaultFactory, Executor, RunReport};
