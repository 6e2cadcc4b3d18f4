//! Crate-wide error taxonomy.
//!
//! Callers are expected to branch on these variants: `DeploymentNotFound` and
//! `AdminNotFound` are ordinary first-deployment conditions, while
//! `ManifestCorrupted` and `LockTimeout` are operational failures that need
//! operator attention (or a retry, for the lock).

use alloy_primitives::Address;
use std::path::PathBuf;
use thiserror::Error;

use crate::compare::LayoutReport;

/// Convenience alias used throughout the crate.
pub type Result<T, E = UpgradesError> = core::result::Result<T, E>;

/// All errors surfaced by the upgrade-safety engine.
#[derive(Debug, Error)]
pub enum UpgradesError {
    /// Compiler build-info output could not be understood.
    #[error("Invalid build-info artifact: {reason}")]
    Import {
        /// What was malformed
        reason: String,
    },

    /// A storage item or type references a type id that the layout's type
    /// table does not define.
    #[error("Unresolved type reference `{type_ref}` (referenced from {context})")]
    DanglingTypeRef {
        /// The missing type identifier
        type_ref: String,
        /// Where the reference was found (variable or parent type)
        context: String,
    },

    /// On-disk manifest state is unreadable. Never auto-repaired.
    #[error("Manifest file {} is corrupted: {reason}", path.display())]
    ManifestCorrupted {
        /// Path of the offending file
        path: PathBuf,
        /// Parse or validation failure
        reason: String,
    },

    /// The manifest was written by a newer release of this tooling.
    #[error(
        "Manifest file {} has manifestVersion {found}, newer than the supported {supported}; refusing to modify it",
        path.display()
    )]
    ManifestVersionTooNew {
        /// Path of the offending file
        path: PathBuf,
        /// Version found on disk
        found: String,
        /// Highest version this build understands
        supported: String,
    },

    /// Could not obtain the exclusive manifest lock within the wait budget.
    /// The whole operation may be retried.
    #[error(
        "Timed out waiting for exclusive access to {}{}",
        path.display(),
        holder.as_deref().map(|h| format!(" (held by {h})")).unwrap_or_default()
    )]
    LockTimeout {
        /// The lock file that stayed contended
        path: PathBuf,
        /// Holder metadata read from the lock file, when available
        holder: Option<String>,
    },

    /// No implementation, proxy, or beacon recorded at this address.
    /// Expected on a network's first deployment.
    #[error("No deployment recorded at address {address}")]
    DeploymentNotFound {
        /// The address that was looked up
        address: Address,
    },

    /// No implementation recorded under this version id.
    #[error("No implementation recorded for version {version}")]
    UnknownVersion {
        /// The version id that was looked up
        version: String,
    },

    /// No ProxyAdmin recorded for this network. Expected before the first
    /// transparent-proxy deployment.
    #[error("No ProxyAdmin recorded for this network")]
    AdminNotFound,

    /// Resolving a proxy's current implementation needs a chain client.
    #[error("Resolving proxy {proxy} requires an implementation resolver")]
    ResolverRequired {
        /// The proxy whose implementation was requested
        proxy: Address,
    },

    /// The new storage layout is not backward-compatible. The report lists
    /// every offending variable, not just the first one found.
    #[error("New storage layout is incompatible with the previous implementation:\n{report}")]
    IncompatibleLayout {
        /// The full comparison report
        report: LayoutReport,
    },

    /// Filesystem failure while reading or writing manifest state.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl UpgradesError {
    /// Helper for wrapping I/O failures with a description of the attempt.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is an expected-and-recoverable missing-record
    /// condition (callers branch on this for first-time setup).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeploymentNotFound { .. } | Self::AdminNotFound | Self::UnknownVersion { .. }
        )
    }
}
