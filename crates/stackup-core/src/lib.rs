//! Pipeline orchestration for stackup.
//!
//! This crate ties the manifest model and the runtime seam together into the
//! `Engine`: secret synthesis, expansion, reset, host directory reconciliation,
//! hooks, reference validation, image probing and launch, driven through a
//! validated state machine under a per-stack lock.

pub mod concurrency;
pub mod engine;
pub mod expand;
pub mod hooks;
pub mod launch;
pub mod lifecycle;
pub mod probe;
pub mod references;
pub mod reset;
pub mod secrets;
pub mod settings;

pub use concurrency::StackLock;
pub use engine::{Engine, Plan, RunReport, StageObserver};
pub use hooks::{HookReport, HookSlot, HookValue, Invocation, Persist};
pub use launch::{LaunchMode, LaunchOutcome};
pub use lifecycle::{validate_transition, PipelineState};
pub use probe::{Classification, ImageCheckResult, ProbeOptions, ProbeReport};
pub use references::ReconcileReport;
pub use reset::{ResetAction, ResetOutcome};
pub use secrets::{describe_secrets, generate_secret, NoPrompt, Prompter, SecretDescriptorEntry};
pub use settings::{Overrides, Settings};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] stackup_schema::ManifestError),
    #[error("runtime error: {0}")]
    Runtime(#[from] stackup_runtime::RuntimeError),
    #[error("secret provisioning failed for {key}: {reason}")]
    SecretProvisioning { key: String, reason: String },
    #[error("undefined variables referenced by the stack definition: {}", keys.join(", "))]
    UndefinedReference { keys: Vec<String> },
    #[error("stack definition rejected: {0}")]
    InvalidStack(String),
    #[error("images not available: {}", missing.join(", "))]
    ImageAvailability { missing: Vec<String> },
    #[error("directory {}: {reason}", path.display())]
    DirectoryReconciliation { path: PathBuf, reason: String },
    #[error("hook {}: {reason}", hook.display())]
    HookExecution { hook: PathBuf, reason: String },
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid pipeline transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("stack is locked by another run: {}", .0.display())]
    Locked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The error kinds operators see, each with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Manifest,
    SecretProvisioning,
    Reference,
    ImageAvailability,
    DirectoryReconciliation,
    HookExecution,
    Launch,
    Other,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Manifest => "ManifestError",
            Self::SecretProvisioning => "SecretProvisioningError",
            Self::Reference => "ReferenceError",
            Self::ImageAvailability => "ImageAvailabilityError",
            Self::DirectoryReconciliation => "DirectoryReconciliationError",
            Self::HookExecution => "HookExecutionError",
            Self::Launch => "LaunchError",
            Self::Other => "Error",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Other => 1,
            Self::Manifest => 2,
            Self::SecretProvisioning => 3,
            Self::Reference => 4,
            Self::ImageAvailability => 5,
            Self::DirectoryReconciliation => 6,
            Self::HookExecution => 7,
            Self::Launch => 8,
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::SecretProvisioning { .. } => ErrorKind::SecretProvisioning,
            Self::UndefinedReference { .. } | Self::InvalidStack(_) => ErrorKind::Reference,
            Self::ImageAvailability { .. } => ErrorKind::ImageAvailability,
            Self::DirectoryReconciliation { .. } => ErrorKind::DirectoryReconciliation,
            Self::HookExecution { .. } => ErrorKind::HookExecution,
            Self::Launch(_) => ErrorKind::Launch,
            Self::Runtime(_)
            | Self::Config(_)
            | Self::InvalidTransition { .. }
            | Self::Locked(_)
            | Self::Io(_) => ErrorKind::Other,
        }
    }
}
