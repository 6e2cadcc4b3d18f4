//! Typed storage-layout model.
//!
//! Value objects describing a contract version's persistent storage: which
//! variables exist ([`StorageItem`]), what their types look like structurally
//! ([`TypeItem`]), and how they assemble into one layout per contract
//! ([`StorageLayout`]). Instances are produced once by the build-info
//! importer (see [`import`]) and treated as immutable afterwards; the
//! comparator never mutates them.
//!
//! Slots are [`U256`]: ERC-7201 namespace roots are full 256-bit keccak
//! outputs and do not fit smaller integers.

pub mod import;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::{Result, UpgradesError};

/// Width of one EVM storage slot in bytes.
pub const SLOT_BYTES: u64 = 32;

/// Identifier of a type within a layout's type table.
///
/// Wraps the solc type identifier verbatim, e.g. `t_uint256`,
/// `t_struct(Vault)12_storage`, `t_array(t_uint256)47_storage`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRef(String);

impl TypeRef {
    /// Wrap a raw type identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Structural classification of a storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    /// Value types: integers, bool, address, fixed bytes, ...
    Elementary,
    /// User-declared struct with ordered members.
    Struct,
    /// User-declared enum; ordinal values are storage-significant.
    Enum,
    /// Fixed-length or dynamic array.
    Array,
    /// Mapping; always occupies exactly one slot.
    Mapping,
    /// Contract reference (an address under the hood).
    Contract,
    /// User-defined value type wrapping an elementary type.
    UserDefinedValue,
}

/// Length of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLength {
    /// Fixed number of elements.
    Fixed(u64),
    /// Dynamically sized; data lives at a keccak-derived location.
    Dynamic,
}

impl Serialize for ArrayLength {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(n) => serializer.serialize_u64(*n),
            Self::Dynamic => serializer.serialize_str("dynamic"),
        }
    }
}

impl<'de> Deserialize<'de> for ArrayLength {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Tag(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(Self::Fixed(n)),
            Repr::Tag(s) if s == "dynamic" => Ok(Self::Dynamic),
            Repr::Tag(s) => Err(serde::de::Error::custom(format!(
                "invalid array length `{s}`"
            ))),
        }
    }
}

/// One declared persistent variable (or struct member).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageItem {
    /// Variable name as declared in source.
    pub label: String,
    /// Reference into the layout's type table.
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    /// Storage slot the variable starts at. Struct members use slots
    /// relative to the struct start; namespace members relative to the
    /// namespace root.
    pub slot: U256,
    /// Byte offset within the slot (0-31) for packed variables.
    #[serde(default)]
    pub offset: u8,
    /// Fully qualified contract the variable was declared in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract: String,
    /// Source location string (`file:offset:length`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
}

/// Structural description of one storage type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeItem {
    /// Structural classification.
    pub kind: TypeKind,
    /// Human-readable type name (`uint256`, `struct Vault`, ...).
    pub label: String,
    /// Bytes this type occupies in storage (slot-rounded for multi-slot
    /// types, exact for packed value types).
    pub number_of_bytes: u64,
    /// Ordered members, for structs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<StorageItem>>,
    /// Ordered member names, for enums. Ordinal position is the stored value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_members: Option<Vec<String>>,
    /// Element type, for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<TypeRef>,
    /// Key type, for mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<TypeRef>,
    /// Value type, for mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TypeRef>,
    /// Element count, for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<ArrayLength>,
}

impl TypeItem {
    /// Number of whole storage slots this type spans (at least one).
    pub fn slot_span(&self) -> u64 {
        self.number_of_bytes.div_ceil(SLOT_BYTES).max(1)
    }
}

/// A contract version's complete storage layout.
///
/// `storage` is ordered by declaration, inheritance-linearized base-first by
/// the compiler; that order is the comparison key and is preserved verbatim.
/// ERC-7201 namespaces are separate roots keyed by namespace id and are never
/// merged into `storage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageLayout {
    /// Default storage root, declaration-ordered.
    #[serde(default)]
    pub storage: Vec<StorageItem>,
    /// ERC-7201 namespace roots, keyed by namespace id (`example.main`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespaces: BTreeMap<String, Vec<StorageItem>>,
    /// Type table shared by all roots.
    #[serde(default)]
    pub types: BTreeMap<TypeRef, TypeItem>,
}

impl StorageLayout {
    /// Look up a type by reference.
    pub fn type_of(&self, r: &TypeRef) -> Option<&TypeItem> {
        self.types.get(r)
    }

    /// Storage slots spanned by an item's type. Unknown types are assumed to
    /// occupy a single slot.
    pub fn slot_span_of(&self, item: &StorageItem) -> u64 {
        self.type_of(&item.type_ref).map_or(1, TypeItem::slot_span)
    }

    /// Verify that every type reference reachable from a storage root
    /// resolves in the type table.
    ///
    /// The traversal carries a visited set keyed by [`TypeRef`]: well-formed
    /// compiler output is acyclic, but the producer does not guarantee it.
    pub fn check_type_refs(&self) -> Result<()> {
        let mut visited: BTreeSet<&TypeRef> = BTreeSet::new();
        for item in self.roots() {
            self.check_ref(&item.type_ref, &item.label, &mut visited)?;
        }
        Ok(())
    }

    fn check_ref<'a>(
        &'a self,
        r: &'a TypeRef,
        context: &str,
        visited: &mut BTreeSet<&'a TypeRef>,
    ) -> Result<()> {
        if !visited.insert(r) {
            return Ok(());
        }
        let ty = self.types.get(r).ok_or_else(|| UpgradesError::DanglingTypeRef {
            type_ref: r.to_string(),
            context: context.to_string(),
        })?;
        for next in [&ty.base, &ty.key, &ty.value].into_iter().flatten() {
            self.check_ref(next, &ty.label, visited)?;
        }
        if let Some(members) = &ty.members {
            for member in members {
                self.check_ref(&member.type_ref, &member.label, visited)?;
            }
        }
        Ok(())
    }

    /// Verify that no two variables of the same root overlap, given each
    /// type's byte width.
    pub fn check_no_overlap(&self) -> Result<()> {
        self.check_root_no_overlap(&self.storage, "storage")?;
        for (id, items) in &self.namespaces {
            self.check_root_no_overlap(items, id)?;
        }
        Ok(())
    }

    fn check_root_no_overlap(&self, items: &[StorageItem], root: &str) -> Result<()> {
        // Positions are compared in (slot, offset) space rather than as flat
        // byte addresses: ERC-7201 roots sit near 2^252, where `slot * 32`
        // no longer fits a U256.
        // (start_slot, start_offset, end_slot, end_offset, label)
        let mut ranges = Vec::with_capacity(items.len());
        for item in items {
            let width = self
                .type_of(&item.type_ref)
                .map_or(SLOT_BYTES, |t| t.number_of_bytes);
            let end_units = u64::from(item.offset) + width;
            let end_slot = item
                .slot
                .checked_add(U256::from(end_units / SLOT_BYTES))
                .ok_or_else(|| UpgradesError::Import {
                    reason: format!(
                        "storage of `{}` extends past the addressable range",
                        item.label
                    ),
                })?;
            let end_offset = end_units % SLOT_BYTES;
            ranges.push((item.slot, u64::from(item.offset), end_slot, end_offset, item.label.as_str()));
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            let (_, _, prev_end_slot, prev_end_offset, prev_label) = &pair[0];
            let (next_slot, next_offset, _, _, next_label) = &pair[1];
            let overlaps = (next_slot, next_offset) < (prev_end_slot, prev_end_offset);
            if overlaps {
                return Err(UpgradesError::Import {
                    reason: format!(
                        "variables `{prev_label}` and `{next_label}` overlap in root `{root}`"
                    ),
                });
            }
        }
        Ok(())
    }

    fn roots(&self) -> impl Iterator<Item = &StorageItem> {
        self.storage
            .iter()
            .chain(self.namespaces.values().flatten())
    }
}
