//! Manifest parsing, secret descriptors, and the runtime environment model for stackup.
//!
//! This crate defines the schema layer: the line-oriented env manifest
//! (`ManifestLine`, `parse_manifest_str`, `render_env_file`), the secret naming
//! taxonomy encoded in key suffixes (`SecretDescriptor`), the ordered
//! `Environment` with per-key provenance, and the `ReferenceSet` of variables
//! used by a stack definition.

pub mod descriptor;
pub mod environment;
pub mod manifest;
pub mod references;

pub use descriptor::{Charset, Family, Provenance, SecretDescriptor, DEFAULT_SECRET_LENGTH};
pub use environment::{Entry, Environment, Origin};
pub use manifest::{
    is_valid_key, parse_manifest_file, parse_manifest_str, read_env_values, render_env_file,
    write_env_file, Assignment, ManifestError, ManifestLine,
};
pub use references::ReferenceSet;
