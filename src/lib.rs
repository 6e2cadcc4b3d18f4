//! # Upgrade Guard - Storage-Safety Engine for Upgradeable Proxy Contracts
//!
//! Checks that a new implementation contract is storage-compatible with the
//! one a proxy currently delegates to, and records every deployment in a
//! per-network manifest so future upgrades always have a baseline to compare
//! against.
//!
//! The pipeline: import storage layouts from solc build-info output
//! ([`layout::import`]), diff the new layout against the recorded baseline
//! ([`compare`]), and orchestrate the whole check against the on-disk
//! manifest ([`validate`]).

pub mod compare;
pub mod errors;
pub mod layout;
pub mod manifest;
pub mod validate;

pub use compare::{compare_layouts, CompareOptions, Finding, FindingKind, LayoutReport, Severity};
pub use errors::{Result, UpgradesError};
pub use layout::import::{import_build_info, BuildInfoArtifacts, ContractArtifact};
pub use layout::{StorageItem, StorageLayout, TypeItem, TypeKind, TypeRef};
pub use manifest::{Manifest, ManifestData, NetworkId, ProxyKind};
pub use validate::{
    erc7201_location, version_id, UpgradeReference, ValidationOptions, Validator,
};
