//! Build-info importer.
//!
//! Transforms raw compiler build-info JSON (`{ input, output }`) into the
//! typed [`StorageLayout`] model. Validation is strict and happens entirely
//! at this boundary: downstream components never touch raw JSON. Malformed
//! input fails with [`UpgradesError::Import`]; a type reference that does not
//! resolve fails with [`UpgradesError::DanglingTypeRef`] naming the dangling
//! id.
//!
//! Storage items arrive from the compiler already inheritance-linearized
//! (base contracts first, C3 order); that ordering is preserved verbatim
//! because it is the comparison key. ERC-7201 namespace roots are kept as
//! separate roots keyed by namespace id, never merged into `storage`.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{ArrayLength, StorageItem, StorageLayout, TypeItem, TypeKind, TypeRef};
use crate::errors::{Result, UpgradesError};
use alloy_primitives::U256;

/// One contract's imported artifacts: its layout plus the pieces the
/// orchestrator needs for version hashing and manifest records.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractArtifact {
    /// Source file the contract was declared in.
    pub source_name: String,
    /// Contract name.
    pub contract_name: String,
    /// Imported storage layout.
    pub layout: StorageLayout,
    /// Contract ABI, verbatim.
    pub abi: Option<Value>,
    /// Creation bytecode as an unprefixed hex string.
    pub bytecode: Option<String>,
}

impl ContractArtifact {
    /// `Source.sol:Name` identifier used in reports.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }
}

/// Everything imported from one build-info file.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfoArtifacts {
    /// Compiler version string, when present.
    pub solc_version: Option<String>,
    /// One entry per contract that carries a storage layout.
    pub artifacts: Vec<ContractArtifact>,
}

// ── Raw solc shapes ──────────────────────────────────────────────────────────
//
// These mirror the compiler output exactly and never escape this module.

#[derive(Deserialize)]
struct RawBuildInfo {
    #[serde(rename = "solcVersion")]
    solc_version: Option<String>,
    output: RawOutput,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    contracts: BTreeMap<String, BTreeMap<String, RawContract>>,
}

#[derive(Deserialize)]
struct RawContract {
    #[serde(default)]
    abi: Option<Value>,
    #[serde(default)]
    evm: Option<RawEvm>,
    #[serde(rename = "storageLayout")]
    storage_layout: Option<RawStorageLayout>,
}

#[derive(Deserialize)]
struct RawEvm {
    #[serde(default)]
    bytecode: Option<RawBytecode>,
}

#[derive(Deserialize)]
struct RawBytecode {
    #[serde(default)]
    object: Option<String>,
}

#[derive(Deserialize)]
struct RawStorageLayout {
    #[serde(default)]
    storage: Vec<RawStorageEntry>,
    #[serde(default)]
    types: Option<BTreeMap<String, RawType>>,
    /// ERC-7201 namespace roots (`erc7201:<id>` → members), as emitted for
    /// contracts annotated with `@custom:storage-location`.
    #[serde(default)]
    namespaces: Option<BTreeMap<String, Vec<RawStorageEntry>>>,
}

#[derive(Deserialize)]
struct RawStorageEntry {
    label: String,
    #[serde(rename = "type")]
    type_id: String,
    slot: RawSlot,
    #[serde(default)]
    offset: u8,
    #[serde(default)]
    contract: Option<String>,
    #[serde(default)]
    src: Option<String>,
}

/// solc emits slots as decimal strings; tolerate plain numbers and hex too.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSlot {
    Text(String),
    Num(u64),
}

#[derive(Deserialize)]
struct RawType {
    #[serde(default)]
    encoding: Option<String>,
    label: String,
    #[serde(rename = "numberOfBytes")]
    number_of_bytes: RawBytes,
    #[serde(default)]
    members: Option<RawMembers>,
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytes {
    Text(String),
    Num(u64),
}

/// Struct members are storage entries; enum members are plain names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawMembers {
    Entries(Vec<RawStorageEntry>),
    Names(Vec<String>),
}

// ── Import ───────────────────────────────────────────────────────────────────

/// Import a complete build-info JSON document.
pub fn import_build_info(json: &str) -> Result<BuildInfoArtifacts> {
    let raw: RawBuildInfo = serde_json::from_str(json).map_err(|e| UpgradesError::Import {
        reason: e.to_string(),
    })?;

    let mut artifacts = Vec::new();
    for (source_name, contracts) in raw.output.contracts {
        for (contract_name, contract) in contracts {
            let Some(raw_layout) = contract.storage_layout else {
                continue;
            };
            let layout = convert_layout(raw_layout)?;
            let bytecode = contract
                .evm
                .and_then(|e| e.bytecode)
                .and_then(|b| b.object)
                .map(|o| o.trim_start_matches("0x").to_ascii_lowercase());
            artifacts.push(ContractArtifact {
                source_name: source_name.clone(),
                contract_name,
                layout,
                abi: contract.abi,
                bytecode,
            });
        }
    }

    Ok(BuildInfoArtifacts {
        solc_version: raw.solc_version,
        artifacts,
    })
}

/// Import a bare `storageLayout` object (as found per-contract in the
/// build-info output).
pub fn import_storage_layout(value: &Value) -> Result<StorageLayout> {
    let raw: RawStorageLayout =
        serde_json::from_value(value.clone()).map_err(|e| UpgradesError::Import {
            reason: e.to_string(),
        })?;
    convert_layout(raw)
}

fn convert_layout(raw: RawStorageLayout) -> Result<StorageLayout> {
    let mut layout = StorageLayout::default();

    for entry in raw.storage {
        layout.storage.push(convert_entry(entry)?);
    }
    if let Some(namespaces) = raw.namespaces {
        for (id, entries) in namespaces {
            let id = id.strip_prefix("erc7201:").unwrap_or(&id).to_string();
            let items = entries
                .into_iter()
                .map(convert_entry)
                .collect::<Result<Vec<_>>>()?;
            layout.namespaces.insert(id, items);
        }
    }
    if let Some(types) = raw.types {
        for (id, ty) in types {
            let item = convert_type(&id, ty)?;
            layout.types.insert(TypeRef::new(id), item);
        }
    }

    layout.check_type_refs()?;
    layout.check_no_overlap()?;
    Ok(layout)
}

fn convert_entry(entry: RawStorageEntry) -> Result<StorageItem> {
    let slot = match entry.slot {
        RawSlot::Num(n) => U256::from(n),
        RawSlot::Text(s) => parse_slot(&s, &entry.label)?,
    };
    if entry.offset as u64 >= super::SLOT_BYTES {
        return Err(UpgradesError::Import {
            reason: format!("offset {} of `{}` exceeds slot width", entry.offset, entry.label),
        });
    }
    Ok(StorageItem {
        label: entry.label,
        type_ref: TypeRef::new(entry.type_id),
        slot,
        offset: entry.offset,
        contract: entry.contract.unwrap_or_default(),
        src: entry.src.unwrap_or_default(),
    })
}

fn parse_slot(s: &str, label: &str) -> Result<U256> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s, 10),
    };
    parsed.map_err(|_| UpgradesError::Import {
        reason: format!("invalid storage slot `{s}` for `{label}`"),
    })
}

fn convert_type(id: &str, raw: RawType) -> Result<TypeItem> {
    let number_of_bytes = match raw.number_of_bytes {
        RawBytes::Num(n) => n,
        RawBytes::Text(s) => s.parse().map_err(|_| UpgradesError::Import {
            reason: format!("invalid numberOfBytes `{s}` for type `{id}`"),
        })?,
    };

    let kind = classify(id, raw.encoding.as_deref());
    let mut item = TypeItem {
        kind,
        label: raw.label,
        number_of_bytes,
        members: None,
        enum_members: None,
        base: raw.base.map(TypeRef::new),
        key: raw.key.map(TypeRef::new),
        value: raw.value.map(TypeRef::new),
        length: None,
    };

    if kind == TypeKind::Array {
        item.length = Some(parse_array_length(id, raw.encoding.as_deref()));
    }
    match raw.members {
        Some(RawMembers::Entries(entries)) => {
            item.members = Some(
                entries
                    .into_iter()
                    .map(convert_entry)
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Some(RawMembers::Names(names)) => item.enum_members = Some(names),
        None => {}
    }
    Ok(item)
}

/// Classify a type from its identifier prefix, with the `encoding` field as
/// a cross-check for arrays.
fn classify(id: &str, _encoding: Option<&str>) -> TypeKind {
    if id.starts_with("t_struct") {
        TypeKind::Struct
    } else if id.starts_with("t_enum") {
        TypeKind::Enum
    } else if id.starts_with("t_array") {
        TypeKind::Array
    } else if id.starts_with("t_mapping") {
        TypeKind::Mapping
    } else if id.starts_with("t_contract") {
        TypeKind::Contract
    } else if id.starts_with("t_userDefinedValueType") {
        TypeKind::UserDefinedValue
    } else {
        TypeKind::Elementary
    }
}

/// Extract an array type's length from its identifier:
/// `t_array(t_uint256)47_storage` is fixed, `t_array(t_uint256)dyn_storage`
/// is dynamic. Nested arrays are handled by taking the text after the last
/// closing parenthesis.
fn parse_array_length(id: &str, encoding: Option<&str>) -> ArrayLength {
    if encoding == Some("dynamic_array") {
        return ArrayLength::Dynamic;
    }
    let trimmed = id.strip_suffix("_storage").unwrap_or(id);
    let tail = trimmed.rsplit(')').next().unwrap_or("");
    if tail == "dyn" {
        ArrayLength::Dynamic
    } else {
        tail.parse().map(ArrayLength::Fixed).unwrap_or(ArrayLength::Dynamic)
    }
}
