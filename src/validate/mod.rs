//! Upgrade validation: the orchestration layer tying artifacts, manifests,
//! and the layout comparator together.
//!
//! [`Validator::validate_upgrade`] resolves the baseline layout from an
//! [`UpgradeReference`] (a recorded version id, a recorded implementation
//! address, a proxy whose current implementation is read through an
//! [`ImplementationResolver`], or an explicit layout), compares the new
//! artifact's layout against it, and either returns the report or fails with
//! [`UpgradesError::IncompatibleLayout`] listing every violation.

use alloy_primitives::{keccak256, Address, TxHash, B256, U256};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::compare::{compare_layouts, CompareOptions, Finding, FindingKind, LayoutReport, Severity};
use crate::errors::{Result, UpgradesError};
use crate::layout::import::{BuildInfoArtifacts, ContractArtifact};
use crate::layout::StorageLayout;
use crate::manifest::{ImplementationDeployment, Manifest};

// ── Derived identifiers ──────────────────────────────────────────────────────

/// ERC-7201 namespace root: `keccak256(uint256(keccak256(id)) - 1) & ~0xff`.
///
/// The formula guarantees the root can never collide with keccak-derived
/// locations of dynamic arrays and mappings, and the cleared low byte leaves
/// room for Solidity's slot packing within the namespace.
pub fn erc7201_location(id: &str) -> B256 {
    let inner = U256::from_be_bytes(keccak256(id.as_bytes()).0).wrapping_sub(U256::from(1));
    let mut out = keccak256(inner.to_be_bytes::<32>()).0;
    out[31] = 0;
    B256::from(out)
}

/// Content-derived version id of an implementation build.
///
/// Hashes the normalized creation bytecode (lowercase hex, no `0x` prefix)
/// so re-deploying a byte-identical build maps to the same manifest entry.
pub fn version_id(bytecode: &str) -> B256 {
    let normalized = bytecode
        .strip_prefix("0x")
        .unwrap_or(bytecode)
        .to_ascii_lowercase();
    keccak256(normalized.as_bytes())
}

// ── Pluggable seams ──────────────────────────────────────────────────────────

/// Source-level upgrade-safety checks run on the new artifact before the
/// layout comparison (e.g. constructor usage, selfdestruct, delegatecall).
/// Findings are merged into the layout report.
pub trait SourceChecker {
    /// Inspect `artifact` and report any unsafe patterns.
    fn check(&self, artifact: &ContractArtifact) -> Vec<Finding>;
}

/// A checker that reports nothing; the default when no source analysis is
/// wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSourceChecks;

impl SourceChecker for NoSourceChecks {
    fn check(&self, _artifact: &ContractArtifact) -> Vec<Finding> {
        Vec::new()
    }
}

/// Resolves a proxy's current implementation address, typically by reading
/// the EIP-1967 implementation slot through a chain client.
pub trait ImplementationResolver {
    /// The implementation `proxy` currently delegates to.
    fn implementation_of(&self, proxy: Address) -> Result<Address>;
}

// ── Validation inputs ────────────────────────────────────────────────────────

/// What to compare the new implementation against.
#[derive(Debug, Clone)]
pub enum UpgradeReference {
    /// A proxy address; its current implementation is resolved on-chain and
    /// looked up in the manifest.
    ProxyAddress(Address),
    /// An implementation address recorded in the manifest.
    ImplementationAddress(Address),
    /// A version id recorded in the manifest.
    VersionId(B256),
    /// An explicit baseline layout, bypassing the manifest.
    Layout(StorageLayout),
}

/// Caller-facing escape hatches. Names are deliberately alarming; each one
/// weakens a safety guarantee.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Skip the storage layout comparison entirely.
    pub unsafe_skip_storage_check: bool,
    /// Suppress error findings of these kinds.
    pub unsafe_allow: BTreeSet<FindingKind>,
    /// Treat renames as errors instead of notes.
    pub strict_renames: bool,
}

// ── Validator ────────────────────────────────────────────────────────────────

/// Upgrade validator, generic over the source checker wired into it.
#[derive(Debug, Clone, Default)]
pub struct Validator<S = NoSourceChecks> {
    checker: S,
}

impl Validator {
    /// Validator with no source-level checks.
    pub fn new() -> Self {
        Validator {
            checker: NoSourceChecks,
        }
    }
}

impl<S: SourceChecker> Validator<S> {
    /// Validator with a custom source checker.
    pub fn with_checker(checker: S) -> Self {
        Validator { checker }
    }

    /// Validate that `new_artifact` can safely replace the implementation
    /// identified by `reference`.
    ///
    /// On success the returned report still carries notes (renames, consumed
    /// gaps). On failure the error's report lists every violation found, not
    /// just the first.
    pub fn validate_upgrade(
        &self,
        manifest: &Manifest,
        resolver: Option<&dyn ImplementationResolver>,
        reference: &UpgradeReference,
        new_artifact: &ContractArtifact,
        opts: &ValidationOptions,
    ) -> Result<LayoutReport> {
        info!(
            contract = %new_artifact.fully_qualified_name(),
            "validating upgrade"
        );

        let mut findings = self.checker.check(new_artifact);

        if opts.unsafe_skip_storage_check {
            debug!("storage layout comparison skipped by caller");
        } else {
            let baseline = self.resolve_baseline(manifest, resolver, reference)?;
            let compare_opts = CompareOptions {
                strict_renames: opts.strict_renames,
            };
            findings.extend(compare_layouts(&baseline, &new_artifact.layout, &compare_opts).findings);
        }

        findings.retain(|f| f.severity == Severity::Note || !opts.unsafe_allow.contains(&f.kind));

        let report = LayoutReport { findings };
        if report.ok() {
            Ok(report)
        } else {
            Err(UpgradesError::IncompatibleLayout { report })
        }
    }

    fn resolve_baseline(
        &self,
        manifest: &Manifest,
        resolver: Option<&dyn ImplementationResolver>,
        reference: &UpgradeReference,
    ) -> Result<StorageLayout> {
        match reference {
            UpgradeReference::Layout(layout) => Ok(layout.clone()),
            UpgradeReference::VersionId(version) => manifest.read()?.layout_of_version(*version),
            UpgradeReference::ImplementationAddress(address) => {
                Ok(manifest.read()?.implementation_at(*address)?.layout)
            }
            UpgradeReference::ProxyAddress(proxy) => {
                let Some(resolver) = resolver else {
                    return Err(UpgradesError::ResolverRequired { proxy: *proxy });
                };
                let implementation = resolver.implementation_of(*proxy)?;
                debug!(%proxy, %implementation, "resolved proxy implementation");
                Ok(manifest.read()?.implementation_at(implementation)?.layout)
            }
        }
    }
}

// ── Deployment helpers ───────────────────────────────────────────────────────

/// Merge artifacts from multiple build-info files; for duplicate
/// `(source, contract)` pairs the later batch wins, mirroring a rebuild.
pub fn merge_artifacts(batches: Vec<BuildInfoArtifacts>) -> Vec<ContractArtifact> {
    let mut merged: BTreeMap<(String, String), ContractArtifact> = BTreeMap::new();
    for batch in batches {
        for artifact in batch.artifacts {
            merged.insert(
                (artifact.source_name.clone(), artifact.contract_name.clone()),
                artifact,
            );
        }
    }
    merged.into_values().collect()
}

/// Record a freshly deployed implementation in the manifest, returning the
/// version id it was filed under.
///
/// The version id derives from the creation bytecode; artifacts compiled
/// without bytecode fall back to a hash of the layout itself.
pub fn register_deployment(
    manifest: &Manifest,
    artifact: &ContractArtifact,
    address: Address,
    tx_hash: Option<TxHash>,
) -> Result<B256> {
    let version = match artifact.bytecode.as_deref() {
        Some(bytecode) => version_id(bytecode),
        None => keccak256(serde_json::to_vec(&artifact.layout).unwrap_or_default()),
    };
    manifest.add_implementation(
        version,
        ImplementationDeployment {
            address,
            tx_hash,
            layout: artifact.layout.clone(),
            abi: artifact.abi.clone(),
            all_versions: BTreeMap::new(),
        },
    )?;
    info!(%address, %version, "implementation registered");
    Ok(version)
}
