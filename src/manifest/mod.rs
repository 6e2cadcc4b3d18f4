//! Per-network deployment manifests.
//!
//! A manifest is a single JSON file recording every proxy, implementation,
//! beacon, and ProxyAdmin this tooling has deployed on one network. All
//! mutations go through [`Manifest::locked_run`], which holds an exclusive
//! cross-process file lock for the whole read-mutate-write cycle and
//! persists via an atomic temp-file-then-rename, so a crashed writer never
//! leaves a half-written manifest behind.
//!
//! Older manifest schema versions are migrated in memory on read and
//! persisted in the current schema on the next write. Files written by a
//! *newer* release are refused outright.

pub mod lock;

use alloy_primitives::{Address, TxHash, B256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::{Result, UpgradesError};
use crate::layout::StorageLayout;
use lock::LockFileGuard;

/// Schema version written by this build.
pub const CURRENT_MANIFEST_VERSION: &str = "3.2";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(50);

// ── Network identity ─────────────────────────────────────────────────────────

/// Identity of the network a manifest belongs to. Well-known chain ids get
/// human-readable file names; development networks fall back to their
/// genesis hash so parallel local nodes never share a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkId {
    /// EIP-155 chain id.
    ChainId(u64),
    /// Genesis block hash, for networks without a stable chain id.
    GenesisHash(B256),
}

impl NetworkId {
    /// File stem used for this network's manifest.
    pub fn file_stem(&self) -> String {
        match self {
            NetworkId::ChainId(id) => match id {
                1 => "mainnet".into(),
                5 => "goerli".into(),
                11155111 => "sepolia".into(),
                17000 => "holesky".into(),
                other => format!("unknown-{other}"),
            },
            NetworkId::GenesisHash(hash) => {
                // 8 hex chars of the genesis hash is plenty to disambiguate
                // local networks.
                let hex = format!("{hash:x}");
                format!("dev-{}", &hex[..8])
            }
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

// ── Deployment records ───────────────────────────────────────────────────────

/// Proxy pattern used by a recorded proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Transparent proxy administered by a ProxyAdmin contract.
    Transparent,
    /// UUPS proxy whose upgrade logic lives in the implementation.
    Uups,
    /// Beacon proxy that reads its implementation from a beacon.
    Beacon,
}

/// A deployed proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDeployment {
    /// On-chain address of the proxy.
    pub address: Address,
    /// Which proxy pattern it follows.
    pub kind: ProxyKind,
    /// Deployment transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
}

/// The network's ProxyAdmin contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDeployment {
    /// On-chain address of the ProxyAdmin.
    pub address: Address,
    /// Deployment transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
}

/// A deployed upgradeable beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconDeployment {
    /// On-chain address of the beacon.
    pub address: Address,
    /// Deployment transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// Beacon ABI, carried opaquely for tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Value>,
}

/// A deployed implementation contract with its storage layout, keyed in the
/// manifest by its version id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationDeployment {
    /// On-chain address of the implementation.
    pub address: Address,
    /// Deployment transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// Storage layout of this implementation, the comparison baseline for
    /// future upgrades.
    pub layout: StorageLayout,
    /// Implementation ABI, carried opaquely for tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Value>,
    /// Layouts of earlier builds recorded under the same entry, keyed by
    /// their version id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub all_versions: BTreeMap<String, StorageLayout>,
}

/// Any record a by-address lookup can resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    /// A proxy record.
    Proxy(ProxyDeployment),
    /// An implementation record.
    Implementation(ImplementationDeployment),
    /// A beacon record.
    Beacon(BeaconDeployment),
    /// The ProxyAdmin record.
    Admin(AdminDeployment),
}

// ── Manifest contents ────────────────────────────────────────────────────────

/// In-memory manifest contents. Mutating methods are plain data operations
/// so a [`Manifest::locked_run`] closure can chain any number of them while
/// the lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestData {
    /// Schema version of this file.
    pub manifest_version: String,
    /// The network's ProxyAdmin, if one has been deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminDeployment>,
    /// All recorded proxies, in deployment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<ProxyDeployment>,
    /// Implementations keyed by version id (hex-encoded B256).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub impls: BTreeMap<String, ImplementationDeployment>,
    /// Beacons keyed by address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub beacons: BTreeMap<Address, BeaconDeployment>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestData {
    /// Empty manifest at the current schema version.
    pub fn new() -> Self {
        ManifestData {
            manifest_version: CURRENT_MANIFEST_VERSION.into(),
            admin: None,
            proxies: Vec::new(),
            impls: BTreeMap::new(),
            beacons: BTreeMap::new(),
        }
    }

    /// Record a proxy. Re-recording the same address updates it in place.
    pub fn add_proxy(&mut self, proxy: ProxyDeployment) {
        if let Some(existing) = self.proxies.iter_mut().find(|p| p.address == proxy.address) {
            *existing = proxy;
        } else {
            self.proxies.push(proxy);
        }
    }

    /// Record an implementation under `version`. If the entry already
    /// exists, its previous layout is preserved in `all_versions` instead of
    /// being overwritten.
    pub fn add_implementation(&mut self, version: B256, mut dep: ImplementationDeployment) {
        let key = version.to_string();
        if let Some(prev) = self.impls.remove(&key) {
            dep.all_versions.extend(prev.all_versions);
            dep.all_versions.entry(key.clone()).or_insert(prev.layout);
        }
        self.impls.insert(key, dep);
    }

    /// Record a beacon, replacing any prior record at the same address.
    pub fn add_beacon(&mut self, beacon: BeaconDeployment) {
        self.beacons.insert(beacon.address, beacon);
    }

    /// Record the network's ProxyAdmin.
    pub fn set_admin(&mut self, admin: AdminDeployment) {
        self.admin = Some(admin);
    }

    /// Look up any record by address.
    pub fn get_deployment_from_address(&self, address: Address) -> Result<Deployment> {
        if let Some(p) = self.proxies.iter().find(|p| p.address == address) {
            return Ok(Deployment::Proxy(p.clone()));
        }
        if let Some(i) = self.impls.values().find(|i| i.address == address) {
            return Ok(Deployment::Implementation(i.clone()));
        }
        if let Some(b) = self.beacons.get(&address) {
            return Ok(Deployment::Beacon(b.clone()));
        }
        if let Some(a) = self.admin.as_ref().filter(|a| a.address == address) {
            return Ok(Deployment::Admin(a.clone()));
        }
        Err(UpgradesError::DeploymentNotFound { address })
    }

    /// Look up a proxy by address.
    pub fn get_proxy_from_address(&self, address: Address) -> Result<ProxyDeployment> {
        self.proxies
            .iter()
            .find(|p| p.address == address)
            .cloned()
            .ok_or(UpgradesError::DeploymentNotFound { address })
    }

    /// Look up a beacon by address.
    pub fn get_beacon_from_address(&self, address: Address) -> Result<BeaconDeployment> {
        self.beacons
            .get(&address)
            .cloned()
            .ok_or(UpgradesError::DeploymentNotFound { address })
    }

    /// The network's ProxyAdmin, if recorded.
    pub fn get_admin(&self) -> Result<AdminDeployment> {
        self.admin.clone().ok_or(UpgradesError::AdminNotFound)
    }

    /// Look up an implementation by version id.
    pub fn get_implementation(&self, version: B256) -> Result<ImplementationDeployment> {
        let key = version.to_string();
        self.impls
            .get(&key)
            .cloned()
            .ok_or(UpgradesError::UnknownVersion { version: key })
    }

    /// The recorded storage layout for `version`, searching current entries
    /// and their archived `all_versions`.
    pub fn layout_of_version(&self, version: B256) -> Result<StorageLayout> {
        let key = version.to_string();
        if let Some(dep) = self.impls.get(&key) {
            return Ok(dep.layout.clone());
        }
        for dep in self.impls.values() {
            if let Some(layout) = dep.all_versions.get(&key) {
                return Ok(layout.clone());
            }
        }
        Err(UpgradesError::UnknownVersion { version: key })
    }

    /// The implementation record whose address matches, for resolving an
    /// on-chain implementation pointer back to a layout.
    pub fn implementation_at(&self, address: Address) -> Result<ImplementationDeployment> {
        self.impls
            .values()
            .find(|i| i.address == address)
            .cloned()
            .ok_or(UpgradesError::DeploymentNotFound { address })
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Handle to one network's on-disk manifest. Cheap to construct; does no
/// I/O until [`read`](Manifest::read) or [`locked_run`](Manifest::locked_run).
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
}

impl Manifest {
    /// Manifest at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Manifest {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retry: DEFAULT_LOCK_RETRY,
        }
    }

    /// Manifest for `network` under the conventional `root` directory.
    /// Pure path derivation, no I/O.
    pub fn for_network(root: impl AsRef<Path>, network: NetworkId) -> Self {
        Self::new(root.as_ref().join(format!("{}.json", network.file_stem())))
    }

    /// Override the lock wait budget.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The manifest file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Run `f` against the manifest under an exclusive cross-process lock,
    /// persisting the (possibly mutated) contents atomically afterwards.
    ///
    /// A missing file reads as an empty manifest; older schema versions are
    /// migrated in memory first. If `f` returns an error, nothing is
    /// persisted.
    pub fn locked_run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ManifestData) -> Result<T>,
    {
        let _guard = LockFileGuard::acquire(&self.lock_path(), self.lock_timeout, self.lock_retry)?;
        let mut data = self.load()?;
        let out = f(&mut data)?;
        self.store(&data)?;
        Ok(out)
    }

    /// Lock-free read snapshot. Fine for queries; mutations must go through
    /// [`locked_run`](Manifest::locked_run).
    pub fn read(&self) -> Result<ManifestData> {
        self.load()
    }

    fn load(&self) -> Result<ManifestData> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no manifest on disk, starting empty");
                return Ok(ManifestData::new());
            }
            Err(e) => {
                return Err(UpgradesError::io(
                    format!("reading manifest {}", self.path.display()),
                    e,
                ))
            }
        };
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| UpgradesError::ManifestCorrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        let value = migrate(value, &self.path)?;
        serde_json::from_value(value).map_err(|e| UpgradesError::ManifestCorrupted {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn store(&self, data: &ManifestData) -> Result<()> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| UpgradesError::ManifestCorrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        // Write-then-rename within the same directory so readers see either
        // the old file or the new one, never a partial write.
        let tmp = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let write = || -> io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            io::Write::write_all(&mut file, json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            UpgradesError::io(format!("writing manifest {}", self.path.display()), e)
        })?;
        debug!(path = %self.path.display(), "manifest persisted");
        Ok(())
    }

    // Convenience wrappers, one locked cycle each.

    /// Record a proxy.
    pub fn add_proxy(&self, proxy: ProxyDeployment) -> Result<()> {
        info!(address = %proxy.address, kind = ?proxy.kind, "recording proxy");
        self.locked_run(|data| {
            data.add_proxy(proxy);
            Ok(())
        })
    }

    /// Record an implementation under `version`.
    pub fn add_implementation(&self, version: B256, dep: ImplementationDeployment) -> Result<()> {
        info!(address = %dep.address, %version, "recording implementation");
        self.locked_run(|data| {
            data.add_implementation(version, dep);
            Ok(())
        })
    }

    /// Record a beacon.
    pub fn add_beacon(&self, beacon: BeaconDeployment) -> Result<()> {
        info!(address = %beacon.address, "recording beacon");
        self.locked_run(|data| {
            data.add_beacon(beacon);
            Ok(())
        })
    }

    /// Record the network's ProxyAdmin.
    pub fn set_admin(&self, admin: AdminDeployment) -> Result<()> {
        info!(address = %admin.address, "recording proxy admin");
        self.locked_run(|data| {
            data.set_admin(admin);
            Ok(())
        })
    }

    // Lookups hold the same exclusive lock as the mutations, so a caller
    // interleaving them with another process's deployment always observes a
    // committed state. Callers already inside `locked_run` use the
    // same-named methods on `ManifestData` instead.

    /// Look up any record by address.
    pub fn get_deployment_from_address(&self, address: Address) -> Result<Deployment> {
        self.locked_run(|data| data.get_deployment_from_address(address))
    }

    /// Look up a proxy by address.
    pub fn get_proxy_from_address(&self, address: Address) -> Result<ProxyDeployment> {
        self.locked_run(|data| data.get_proxy_from_address(address))
    }

    /// Look up a beacon by address.
    pub fn get_beacon_from_address(&self, address: Address) -> Result<BeaconDeployment> {
        self.locked_run(|data| data.get_beacon_from_address(address))
    }

    /// The network's ProxyAdmin, if recorded.
    pub fn get_admin(&self) -> Result<AdminDeployment> {
        self.locked_run(|data| data.get_admin())
    }
}

// ── Schema migration ─────────────────────────────────────────────────────────

fn parse_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Bring an on-disk manifest value up to [`CURRENT_MANIFEST_VERSION`].
///
/// 3.0 stored proxies as bare address strings; 3.1 stored proxy objects
/// without a `kind`. Both default to `transparent`, the only pattern those
/// schemas supported. Anything newer than the current version is refused,
/// never rewritten.
fn migrate(mut value: Value, path: &Path) -> Result<Value> {
    let found = value
        .get("manifestVersion")
        .and_then(Value::as_str)
        .unwrap_or(CURRENT_MANIFEST_VERSION)
        .to_string();

    let Some(found_pair) = parse_version(&found) else {
        return Err(UpgradesError::ManifestCorrupted {
            path: path.to_path_buf(),
            reason: format!("unparseable manifestVersion `{found}`"),
        });
    };
    let current_pair = parse_version(CURRENT_MANIFEST_VERSION)
        .unwrap_or((0, 0));

    if found_pair > current_pair {
        return Err(UpgradesError::ManifestVersionTooNew {
            path: path.to_path_buf(),
            found,
            supported: CURRENT_MANIFEST_VERSION.into(),
        });
    }
    if found_pair == current_pair {
        return Ok(value);
    }

    warn!(
        path = %path.display(),
        from = %found,
        to = CURRENT_MANIFEST_VERSION,
        "migrating manifest schema"
    );

    if let Some(proxies) = value.get_mut("proxies").and_then(Value::as_array_mut) {
        for proxy in proxies {
            // 3.0: bare address string
            if let Some(address) = proxy.as_str().map(str::to_string) {
                *proxy = serde_json::json!({ "address": address, "kind": "transparent" });
                continue;
            }
            // 3.1: object without kind
            if let Some(obj) = proxy.as_object_mut() {
                obj.entry("kind")
                    .or_insert_with(|| Value::String("transparent".into()));
            }
        }
    }

    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "manifestVersion".into(),
            Value::String(CURRENT_MANIFEST_VERSION.into()),
        );
    }
    Ok(value)
}
