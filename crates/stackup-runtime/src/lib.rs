//! Container runtime seam and host-side helpers for stackup.
//!
//! This crate implements the execution layer: the pluggable `StackRuntime` trait
//! with a `docker compose` backend and an in-memory mock, a subprocess helper
//! with deadlines, image reference parsing, host directory reconciliation, and
//! prerequisite checking.

pub mod backend;
pub mod command;
pub mod compose;
pub mod hostdir;
pub mod image;
pub mod mock;
pub mod prereq;

pub use backend::{select_backend, ContainerState, ImageQuery, StackRuntime, StackSpec};
pub use command::{run_with_timeout, CommandOutcome};
pub use hostdir::{
    current_gid, current_uid, is_hostdir_key, reconcile_dir, DirOutcome, DirReport, HostDirSpec,
};
pub use image::ImageRef;
pub use prereq::{check_compose_prereqs, format_missing, MissingPrereq};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("stack definition is invalid: {0}")]
    StackInvalid(String),
    #[error("host directory {}: {reason}", path.display())]
    HostDir { path: PathBuf, reason: String },
}
