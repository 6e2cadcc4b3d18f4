//! Storage layout comparator.
//!
//! Pure structural diff of two [`StorageLayout`]s deciding whether upgrading
//! from the old layout to the new one is storage-safe. Variables are paired
//! positionally by declaration index (the comparison key); the only
//! name-based matching is the explicit lenient-rename rule and a one-step
//! lookahead that attributes a mismatch to the removed or inserted variable
//! rather than to everything after it.
//!
//! Findings are collected, never short-circuited: the final report names
//! every offending variable in one pass. Gap arrays (`__gap`) may be
//! consumed by new variables as long as the reserved region's end slot stays
//! fixed.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::layout::{ArrayLength, StorageItem, StorageLayout, TypeItem, TypeKind, TypeRef, SLOT_BYTES};

/// Classification of a single incompatibility (or informational note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FindingKind {
    /// A variable present in the old layout has no counterpart in the new.
    VariableRemoved,
    /// Same position and type, different name.
    VariableRenamed,
    /// A new variable was inserted outside any gap budget, shifting later
    /// variables.
    VariableInserted,
    /// A variable's type changed structurally.
    TypeChanged,
    /// A variable's start position (slot, offset) moved.
    LayoutMoved,
    /// A gap array was resized inconsistently with the variables that
    /// replaced it.
    BadGapResize,
    /// Part of a gap budget was consumed by inserted variables (note only).
    GapConsumed,
    /// Enum members were reordered or removed, or the member lists could not
    /// be verified.
    EnumMembersChanged,
    /// A fixed-length array changed its element count.
    ArrayResized,
    /// Struct member information was missing or inconsistent.
    StructMembersChanged,
    /// An ERC-7201 namespace present in the old layout is gone.
    NamespaceRemoved,
    /// Source-level upgrade-safety violation (reported by an external
    /// source checker, not by the comparator).
    UnsafePattern,
}

/// Whether a finding blocks the upgrade or is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    /// Informational; never blocks an upgrade.
    Note,
    /// Blocks the upgrade unless explicitly suppressed by the caller.
    Error,
}

/// One incompatibility found between two layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// What changed.
    pub kind: FindingKind,
    /// Whether it blocks the upgrade.
    pub severity: Severity,
    /// Path to the offending variable: `Contract.variable`, struct member
    /// chain, or `erc7201:<id>` prefix for namespaced roots.
    pub path: Vec<String>,
    /// Human-readable description of the specific structural change.
    pub message: String,
}

impl Finding {
    /// Build an error-severity finding.
    pub fn error(kind: FindingKind, path: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            path,
            message: message.into(),
        }
    }

    /// Build a note-severity finding.
    pub fn note(kind: FindingKind, path: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Note,
            path,
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.join("."), self.message)
    }
}

/// Comparison result: `ok()` iff no error-severity finding was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutReport {
    /// All findings, errors and notes, in discovery order.
    pub findings: Vec<Finding>,
}

impl LayoutReport {
    /// Whether the upgrade is storage-safe.
    pub fn ok(&self) -> bool {
        !self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Error-severity findings only.
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    /// Note-severity findings only.
    pub fn notes(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Note)
    }
}

impl fmt::Display for LayoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for finding in self.errors() {
            if !first {
                writeln!(f)?;
            }
            write!(f, "- {finding}")?;
            first = false;
        }
        Ok(())
    }
}

/// Knobs for the comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Treat renames as errors instead of notes.
    pub strict_renames: bool,
}

/// Compare two layouts and report every incompatibility.
///
/// Pure function of two immutable layouts; never mutates its inputs and
/// never skips itself (`unsafeSkipStorageCheck` is a caller concern).
pub fn compare_layouts(
    old: &StorageLayout,
    new: &StorageLayout,
    opts: &CompareOptions,
) -> LayoutReport {
    let mut cx = Cx {
        old,
        new,
        opts,
        findings: Vec::new(),
        visited: HashSet::new(),
    };

    compare_items(&mut cx, &old.storage, &new.storage, &[]);

    // Namespace roots are matched by id, never by declaration order.
    for (id, old_items) in &old.namespaces {
        let prefix = vec![format!("erc7201:{id}")];
        match new.namespaces.get(id) {
            Some(new_items) => compare_items(&mut cx, old_items, new_items, &prefix),
            None => cx.findings.push(Finding::error(
                FindingKind::NamespaceRemoved,
                prefix,
                format!("Deleted namespace `{id}`"),
            )),
        }
    }
    // New namespaces occupy fresh keccak-derived roots and are always safe.

    LayoutReport {
        findings: cx.findings,
    }
}

struct Cx<'a> {
    old: &'a StorageLayout,
    new: &'a StorageLayout,
    opts: &'a CompareOptions,
    findings: Vec<Finding>,
    /// Cycle guard over `(old, new)` type-reference pairs.
    visited: HashSet<(TypeRef, TypeRef)>,
}

impl Cx<'_> {
    fn is_old_gap(&self, item: &StorageItem) -> bool {
        is_gap(self.old, item)
    }

    fn is_new_gap(&self, item: &StorageItem) -> bool {
        is_gap(self.new, item)
    }

    /// Same nominal type on both sides (used for the rename rule and the
    /// removal/insertion lookahead, not for structural compatibility).
    fn same_nominal_type(&self, o: &StorageItem, n: &StorageItem) -> bool {
        if o.type_ref == n.type_ref {
            return true;
        }
        match (self.old.type_of(&o.type_ref), self.new.type_of(&n.type_ref)) {
            (Some(a), Some(b)) => a.label == b.label,
            _ => false,
        }
    }
}

/// `__gap`-convention array: fixed length, reserved-slot naming.
fn is_gap(layout: &StorageLayout, item: &StorageItem) -> bool {
    let label = item.label.to_ascii_lowercase();
    if label != "__gap" && !(label.starts_with("__") && label.ends_with("gap")) {
        return false;
    }
    matches!(
        layout.type_of(&item.type_ref),
        Some(TypeItem {
            kind: TypeKind::Array,
            length: Some(ArrayLength::Fixed(_)),
            ..
        })
    )
}

fn item_path(prefix: &[String], item: &StorageItem) -> Vec<String> {
    let mut path = prefix.to_vec();
    if item.contract.is_empty() {
        path.push(item.label.clone());
    } else {
        let contract = item.contract.rsplit(':').next().unwrap_or(&item.contract);
        path.push(format!("{contract}.{}", item.label));
    }
    path
}

/// Pairwise index walk shared by the top-level roots and struct members
/// (member slots are relative to the struct start, which the arithmetic is
/// agnostic to).
fn compare_items(cx: &mut Cx<'_>, old_items: &[StorageItem], new_items: &[StorageItem], path: &[String]) {
    let mut i = 0;
    let mut j = 0;
    // Set when the final old item is a gap and the new layout dropped it:
    // the reservation then bounds any remaining new items.
    let mut dropped_trailing_gap: Option<(u64, Vec<String>)> = None;

    while i < old_items.len() {
        let o = &old_items[i];

        if cx.is_old_gap(o) {
            let next_old = old_items.get(i + 1);
            let (next_j, orig_len, new_keeps_gap) =
                consume_gap(cx, o, next_old, new_items, j, path);
            j = next_j;
            if next_old.is_none() && !new_keeps_gap {
                dropped_trailing_gap = Some((orig_len, item_path(path, o)));
            }
            i += 1;
            continue;
        }

        let Some(n) = new_items.get(j) else {
            cx.findings.push(Finding::error(
                FindingKind::VariableRemoved,
                item_path(path, o),
                format!("Deleted `{}`", o.label),
            ));
            i += 1;
            continue;
        };

        if o.label != n.label {
            // One-step lookahead: attribute the mismatch to a removed or
            // inserted variable when the neighbor lines up exactly.
            if old_items
                .get(i + 1)
                .is_some_and(|next| next.label == n.label && cx.same_nominal_type(next, n))
            {
                cx.findings.push(Finding::error(
                    FindingKind::VariableRemoved,
                    item_path(path, o),
                    format!("Deleted `{}`", o.label),
                ));
                i += 1;
                continue;
            }
            if new_items
                .get(j + 1)
                .is_some_and(|next| next.label == o.label && cx.same_nominal_type(o, next))
            {
                cx.findings.push(Finding::error(
                    FindingKind::VariableInserted,
                    item_path(path, n),
                    format!(
                        "Inserted `{}` without a storage gap, shifting subsequent variables",
                        n.label
                    ),
                ));
                j += 1;
                continue;
            }
        }

        if o.slot != n.slot || o.offset != n.offset {
            cx.findings.push(Finding::error(
                FindingKind::LayoutMoved,
                item_path(path, o),
                format!(
                    "Moved from slot {} offset {} to slot {} offset {}",
                    o.slot, o.offset, n.slot, n.offset
                ),
            ));
        }

        if o.label != n.label && cx.same_nominal_type(o, n) {
            let finding_path = item_path(path, o);
            let message = format!("Renamed `{}` to `{}`", o.label, n.label);
            cx.findings.push(if cx.opts.strict_renames {
                Finding::error(FindingKind::VariableRenamed, finding_path, message)
            } else {
                Finding::note(FindingKind::VariableRenamed, finding_path, message)
            });
        }

        if !allow_packed_widening(cx, o, n, &old_items[i + 1..], &new_items[j + 1..], path) {
            let finding_path = item_path(path, o);
            compare_types(cx, &o.type_ref, &n.type_ref, &finding_path);
        }

        i += 1;
        j += 1;
    }

    // Whatever remains in `new` is appended storage. A retained trailing
    // gap makes appends after it ordinary (the child-contract pattern); a
    // dropped trailing gap whose region was fully consumed means the extra
    // items overran the reservation.
    if j >= new_items.len() {
        return;
    }
    if let Some((orig_len, gap_path)) = dropped_trailing_gap {
        cx.findings.push(Finding::error(
            FindingKind::BadGapResize,
            gap_path,
            format!("Set __gap array to size {orig_len}"),
        ));
        return;
    }
    let old_end = old_items
        .last()
        .map(|o| o.slot + U256::from(cx.old.slot_span_of(o)));
    while let Some(n) = new_items.get(j) {
        if let Some(end) = old_end {
            if n.slot < end {
                cx.findings.push(Finding::error(
                    FindingKind::LayoutMoved,
                    item_path(path, n),
                    format!("`{}` overlaps storage reserved by the previous layout", n.label),
                ));
            }
        }
        j += 1;
    }
}

/// Consume the region reserved by an old gap array.
///
/// New items whose start slot falls inside `[gap_start, gap_end)` replace
/// part of the reservation. The consumed region must end exactly at
/// `gap_end` when further old items follow (their absolute positions depend
/// on it), and must never extend past `gap_end`. Returns the new cursor,
/// the gap's original element count, and whether the new layout retained a
/// gap of its own inside the region.
fn consume_gap(
    cx: &mut Cx<'_>,
    gap: &StorageItem,
    next_old: Option<&StorageItem>,
    new_items: &[StorageItem],
    mut j: usize,
    path: &[String],
) -> (usize, u64, bool) {
    let has_more_old = next_old.is_some();
    let gap_ty = cx.old.type_of(&gap.type_ref);
    let orig_len = match gap_ty.and_then(|t| t.length) {
        Some(ArrayLength::Fixed(n)) => n,
        _ => 0,
    };
    let elem_bytes = gap_ty
        .and_then(|t| t.base.as_ref())
        .and_then(|b| cx.old.type_of(b))
        .map_or(SLOT_BYTES, |t| t.number_of_bytes.max(1));
    let elems_per_slot = (SLOT_BYTES / elem_bytes).max(1);
    let gap_end = gap.slot + U256::from(gap_ty.map_or(1, TypeItem::slot_span));

    let mut consumed_end = gap.slot;
    let mut non_gap_slots: u64 = 0;
    let mut new_keeps_gap = false;
    let mut overflow = false;

    while let Some(n) = new_items.get(j) {
        if n.slot >= gap_end {
            break;
        }
        // A new item matching the variable that follows the gap belongs to
        // that variable's pairing, not to the gap region, even when a bad
        // resize pulled it inside the reservation.
        if next_old.is_some_and(|next| next.label == n.label && cx.same_nominal_type(next, n)) {
            break;
        }
        let n_end = n.slot + U256::from(cx.new.slot_span_of(n));
        let is_replacement_gap = cx.is_new_gap(n);
        if n_end > gap_end && (has_more_old || !is_replacement_gap) {
            overflow = true;
        }
        if is_replacement_gap {
            new_keeps_gap = true;
        } else {
            non_gap_slots += cx.new.slot_span_of(n);
        }
        if n_end > consumed_end {
            consumed_end = n_end;
        }
        j += 1;
    }

    if overflow || (has_more_old && consumed_end != gap_end) {
        let expected = if new_keeps_gap || non_gap_slots > 0 {
            orig_len.saturating_sub(non_gap_slots * elems_per_slot)
        } else {
            orig_len
        };
        cx.findings.push(Finding::error(
            FindingKind::BadGapResize,
            item_path(path, gap),
            format!("Set __gap array to size {expected}"),
        ));
    } else if non_gap_slots > 0 {
        cx.findings.push(Finding::note(
            FindingKind::GapConsumed,
            item_path(path, gap),
            format!("Consumed {non_gap_slots} reserved slot(s) of `{}`", gap.label),
        ));
    }

    (j, orig_len, new_keeps_gap)
}

/// The one positional exception to strict elementary equality: widening a
/// packed numeric variable in place is safe as long as it still fits its
/// slot and nothing later shares the slot at a higher offset.
fn allow_packed_widening(
    cx: &mut Cx<'_>,
    o: &StorageItem,
    n: &StorageItem,
    rest_old: &[StorageItem],
    rest_new: &[StorageItem],
    path: &[String],
) -> bool {
    let (Some(ot), Some(nt)) = (cx.old.type_of(&o.type_ref), cx.new.type_of(&n.type_ref)) else {
        return false;
    };
    if ot.kind != TypeKind::Elementary || nt.kind != TypeKind::Elementary {
        return false;
    }
    if ot.label == nt.label || !is_numeric(ot) || !is_numeric(nt) {
        return false;
    }
    if nt.number_of_bytes <= ot.number_of_bytes {
        return false;
    }
    if u64::from(o.offset) + nt.number_of_bytes > SLOT_BYTES {
        return false;
    }
    let blocked = rest_old
        .iter()
        .any(|it| it.slot == o.slot && it.offset > o.offset)
        || rest_new
            .iter()
            .any(|it| it.slot == n.slot && it.offset > n.offset);
    if blocked {
        return false;
    }
    cx.findings.push(Finding::note(
        FindingKind::TypeChanged,
        item_path(path, o),
        format!("Widened `{}` from {} to {} within its slot", o.label, ot.label, nt.label),
    ));
    true
}

fn is_numeric(t: &TypeItem) -> bool {
    t.label.starts_with("uint") || t.label.starts_with("int")
}

fn is_address(t: &TypeItem) -> bool {
    t.label == "address" || t.label == "address payable"
}

/// Recursive structural type comparison.
///
/// The visited set is keyed by the `(old, new)` reference pair; revisiting a
/// pair terminates the recursion (defensive against cyclic type graphs).
fn compare_types(cx: &mut Cx<'_>, oref: &TypeRef, nref: &TypeRef, path: &[String]) {
    if !cx.visited.insert((oref.clone(), nref.clone())) {
        return;
    }
    let (Some(ot), Some(nt)) = (
        cx.old.type_of(oref).cloned(),
        cx.new.type_of(nref).cloned(),
    ) else {
        // The importer guarantees resolution; an unknown ref can only mean
        // hand-built layouts. Different ids with no structure = change.
        if oref != nref {
            cx.findings.push(Finding::error(
                FindingKind::TypeChanged,
                path.to_vec(),
                format!("Changed type from `{oref}` to `{nref}`"),
            ));
        }
        return;
    };

    use TypeKind::*;
    match (ot.kind, nt.kind) {
        (Elementary, Elementary) => {
            if ot.label != nt.label {
                cx.findings.push(Finding::error(
                    FindingKind::TypeChanged,
                    path.to_vec(),
                    format!("Changed type from `{}` to `{}`", ot.label, nt.label),
                ));
            }
        }

        // Contract references are plain addresses in storage; swapping the
        // pointed-to contract type (or address itself) is safe.
        (Contract, Contract) => {}
        (Contract, Elementary) if is_address(&nt) => {}
        (Elementary, Contract) if is_address(&ot) => {}

        (UserDefinedValue, UserDefinedValue) => {
            if ot.number_of_bytes != nt.number_of_bytes {
                cx.findings.push(Finding::error(
                    FindingKind::TypeChanged,
                    path.to_vec(),
                    format!(
                        "Changed underlying width of `{}` from {} to {} bytes",
                        nt.label, ot.number_of_bytes, nt.number_of_bytes
                    ),
                ));
            }
        }

        (Struct, Struct) => match (&ot.members, &nt.members) {
            (Some(old_members), Some(new_members)) => {
                compare_items(cx, old_members, new_members, path);
            }
            _ => {
                if ot.label != nt.label || ot.number_of_bytes != nt.number_of_bytes {
                    cx.findings.push(Finding::error(
                        FindingKind::StructMembersChanged,
                        path.to_vec(),
                        format!(
                            "Changed `{}` to `{}` with member information unavailable",
                            ot.label, nt.label
                        ),
                    ));
                }
            }
        },

        (Enum, Enum) => compare_enums(cx, &ot, &nt, path),

        (Array, Array) => {
            match (ot.length, nt.length) {
                (Some(ArrayLength::Fixed(a)), Some(ArrayLength::Fixed(b))) if a != b => {
                    cx.findings.push(Finding::error(
                        FindingKind::ArrayResized,
                        path.to_vec(),
                        format!("Resized array from {a} to {b} entries"),
                    ));
                }
                (Some(ArrayLength::Fixed(_)), Some(ArrayLength::Dynamic))
                | (Some(ArrayLength::Dynamic), Some(ArrayLength::Fixed(_))) => {
                    cx.findings.push(Finding::error(
                        FindingKind::TypeChanged,
                        path.to_vec(),
                        format!("Changed between fixed and dynamic array (`{}` to `{}`)", ot.label, nt.label),
                    ));
                }
                _ => {}
            }
            if let (Some(ob), Some(nb)) = (&ot.base, &nt.base) {
                compare_types(cx, ob, nb, path);
            }
        }

        (Mapping, Mapping) => {
            // Mappings occupy one slot regardless of key type, so key
            // changes are always safe. Values must stay compatible.
            if let (Some(ov), Some(nv)) = (&ot.value, &nt.value) {
                let mut value_path = path.to_vec();
                value_path.push("(mapping value)".into());
                compare_types(cx, ov, nv, &value_path);
            }
        }

        _ => {
            cx.findings.push(Finding::error(
                FindingKind::TypeChanged,
                path.to_vec(),
                format!("Changed type from `{}` to `{}`", ot.label, nt.label),
            ));
        }
    }
}

/// Existing enum members must keep their ordinal: the old member list must
/// be a prefix of the new one. Appending is safe.
fn compare_enums(cx: &mut Cx<'_>, ot: &TypeItem, nt: &TypeItem, path: &[String]) {
    match (&ot.enum_members, &nt.enum_members) {
        (Some(old_members), Some(new_members)) => {
            let prefix_ok = new_members.len() >= old_members.len()
                && new_members[..old_members.len()] == old_members[..];
            if !prefix_ok {
                cx.findings.push(Finding::error(
                    FindingKind::EnumMembersChanged,
                    path.to_vec(),
                    format!(
                        "Reordered or removed members of `{}`; existing members must keep their ordinal",
                        ot.label
                    ),
                ));
            } else if ot.number_of_bytes != nt.number_of_bytes {
                cx.findings.push(Finding::error(
                    FindingKind::EnumMembersChanged,
                    path.to_vec(),
                    format!(
                        "Changed storage width of `{}` from {} to {} bytes",
                        ot.label, ot.number_of_bytes, nt.number_of_bytes
                    ),
                ));
            }
        }
        _ => {
            // Member lists unavailable: only exact label + width equality
            // can be accepted.
            if ot.label != nt.label || ot.number_of_bytes != nt.number_of_bytes {
                cx.findings.push(Finding::error(
                    FindingKind::EnumMembersChanged,
                    path.to_vec(),
                    format!(
                        "Changed `{}` to `{}` with member lists unavailable",
                        ot.label, nt.label
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    // ── Layout builder ────────────────────────────────────────────────────────

    struct Lb {
        layout: StorageLayout,
    }

    fn elementary(label: &str, bytes: u64) -> TypeItem {
        TypeItem {
            kind: TypeKind::Elementary,
            label: label.into(),
            number_of_bytes: bytes,
            members: None,
            enum_members: None,
            base: None,
            key: None,
            value: None,
            length: None,
        }
    }

    impl Lb {
        fn new() -> Self {
            let mut types = BTreeMap::new();
            for (id, label, bytes) in [
                ("t_uint256", "uint256", 32),
                ("t_uint128", "uint128", 16),
                ("t_uint64", "uint64", 8),
                ("t_uint8", "uint8", 1),
                ("t_bool", "bool", 1),
                ("t_address", "address", 20),
            ] {
                types.insert(TypeRef::from(id), elementary(label, bytes));
            }
            Lb {
                layout: StorageLayout {
                    storage: Vec::new(),
                    namespaces: BTreeMap::new(),
                    types,
                },
            }
        }

        fn item(label: &str, ty: &str, slot: u64, offset: u8) -> StorageItem {
            StorageItem {
                label: label.into(),
                type_ref: ty.into(),
                slot: U256::from(slot),
                offset,
                contract: "Box".into(),
                src: String::new(),
            }
        }

        fn var(mut self, label: &str, ty: &str, slot: u64) -> Self {
            self.layout.storage.push(Self::item(label, ty, slot, 0));
            self
        }

        fn var_at(mut self, label: &str, ty: &str, slot: u64, offset: u8) -> Self {
            self.layout.storage.push(Self::item(label, ty, slot, offset));
            self
        }

        /// Register a `uint256[len]` array type and add a gap variable.
        fn gap(mut self, label: &str, len: u64, slot: u64) -> Self {
            let id = format!("t_array(t_uint256){len}_storage");
            self.layout.types.insert(
                TypeRef::new(id.clone()),
                TypeItem {
                    kind: TypeKind::Array,
                    label: format!("uint256[{len}]"),
                    number_of_bytes: len * 32,
                    base: Some(TypeRef::from("t_uint256")),
                    length: Some(ArrayLength::Fixed(len)),
                    ..elementary("", 0)
                },
            );
            self.layout.storage.push(Self::item(label, &id, slot, 0));
            self
        }

        fn with_type(mut self, id: &str, ty: TypeItem) -> Self {
            self.layout.types.insert(TypeRef::from(id), ty);
            self
        }

        fn ns(mut self, id: &str, items: Vec<StorageItem>) -> Self {
            self.layout.namespaces.insert(id.into(), items);
            self
        }

        fn build(self) -> StorageLayout {
            self.layout
        }
    }

    fn compare(old: &StorageLayout, new: &StorageLayout) -> LayoutReport {
        compare_layouts(old, new, &CompareOptions::default())
    }

    fn struct_type(label: &str, bytes: u64, members: Vec<StorageItem>) -> TypeItem {
        TypeItem {
            kind: TypeKind::Struct,
            label: label.into(),
            number_of_bytes: bytes,
            members: Some(members),
            ..elementary("", 0)
        }
    }

    fn enum_type(label: &str, members: &[&str]) -> TypeItem {
        TypeItem {
            kind: TypeKind::Enum,
            label: label.into(),
            number_of_bytes: 1,
            enum_members: Some(members.iter().map(|s| s.to_string()).collect()),
            ..elementary("", 0)
        }
    }

    fn member(label: &str, ty: &str, slot: u64) -> StorageItem {
        StorageItem {
            label: label.into(),
            type_ref: ty.into(),
            slot: U256::from(slot),
            offset: 0,
            contract: String::new(),
            src: String::new(),
        }
    }

    // ── Idempotence and appends ──────────────────────────────────────────────

    #[test]
    fn test_self_compare_is_clean() {
        let layout = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_address", 1)
            .gap("__gap", 48, 2)
            .build();
        let report = compare(&layout, &layout);
        assert!(report.ok());
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[test]
    fn test_append_is_safe() {
        let old = Lb::new().var("a", "t_uint256", 0).build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .build();
        assert!(compare(&old, &new).ok());
    }

    // ── Removal and insertion ────────────────────────────────────────────────

    #[test]
    fn test_trailing_removal_detected() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .build();
        let new = Lb::new().var("a", "t_uint256", 0).build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        let finding = report.errors().next().unwrap();
        assert_eq!(finding.kind, FindingKind::VariableRemoved);
        assert!(finding.message.contains("`b`"));
    }

    #[test]
    fn test_middle_removal_names_removed_variable() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .var("c", "t_uint256", 2)
            .build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("c", "t_uint256", 1)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert!(
            report
                .errors()
                .any(|f| f.kind == FindingKind::VariableRemoved && f.message.contains("`b`")),
            "{report}"
        );
    }

    #[test]
    fn test_ungapped_insertion_is_violation() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .var("x", "t_uint256", 1)
            .build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .var("x", "t_uint256", 2)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert!(
            report
                .errors()
                .any(|f| f.kind == FindingKind::VariableInserted && f.message.contains("`b`")),
            "{report}"
        );
    }

    #[test]
    fn test_every_offender_reported_in_one_pass() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .var("c", "t_uint256", 2)
            .build();
        let new = Lb::new().var("a", "t_uint256", 0).build();
        let report = compare(&old, &new);
        assert_eq!(report.errors().count(), 2, "{report}");
    }

    // ── Renames ──────────────────────────────────────────────────────────────

    #[test]
    fn test_rename_is_note_by_default() {
        let old = Lb::new().var("a", "t_uint256", 0).build();
        let new = Lb::new().var("renamed", "t_uint256", 0).build();
        let report = compare(&old, &new);
        assert!(report.ok());
        let note = report.notes().next().unwrap();
        assert_eq!(note.kind, FindingKind::VariableRenamed);
    }

    #[test]
    fn test_rename_is_error_when_strict() {
        let old = Lb::new().var("a", "t_uint256", 0).build();
        let new = Lb::new().var("renamed", "t_uint256", 0).build();
        let report = compare_layouts(&old, &new, &CompareOptions { strict_renames: true });
        assert!(!report.ok());
    }

    // ── Elementary type changes ──────────────────────────────────────────────

    #[test]
    fn test_type_change_is_violation() {
        let old = Lb::new().var("a", "t_uint256", 0).build();
        let new = Lb::new().var("a", "t_bool", 0).build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert_eq!(report.errors().next().unwrap().kind, FindingKind::TypeChanged);
    }

    #[test]
    fn test_widening_allowed_when_slot_has_room() {
        let old = Lb::new()
            .var_at("a", "t_uint64", 0, 0)
            .var("b", "t_uint256", 1)
            .build();
        let new = Lb::new()
            .var_at("a", "t_uint128", 0, 0)
            .var("b", "t_uint256", 1)
            .build();
        let report = compare(&old, &new);
        assert!(report.ok(), "{report}");
    }

    #[test]
    fn test_widening_blocked_by_packed_neighbor() {
        let old = Lb::new()
            .var_at("a", "t_uint64", 0, 0)
            .var_at("b", "t_uint8", 0, 8)
            .build();
        let new = Lb::new()
            .var_at("a", "t_uint128", 0, 0)
            .var_at("b", "t_uint8", 0, 16)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
    }

    #[test]
    fn test_narrowing_is_violation() {
        let old = Lb::new().var("a", "t_uint256", 0).build();
        let new = Lb::new().var("a", "t_uint128", 0).build();
        assert!(!compare(&old, &new).ok());
    }

    // ── Gap accounting ───────────────────────────────────────────────────────

    #[test]
    fn test_trailing_gap_absorbs_inserted_variable() {
        // old: a at 0, __gap[47] at 1..48
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 47, 1).build();
        // new: a, b at 1, __gap[46] at 2..48
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .gap("__gap", 46, 2)
            .build();
        let report = compare(&old, &new);
        assert!(report.ok(), "{report}");
        assert!(report.notes().any(|f| f.kind == FindingKind::GapConsumed));
    }

    #[test]
    fn test_trailing_gap_overrun_names_original_size() {
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 47, 1).build();
        let mut new = Lb::new().var("a", "t_uint256", 0);
        for k in 0..48u64 {
            new = new.var(&format!("b{k}"), "t_uint256", 1 + k);
        }
        let report = compare(&old, &new.build());
        assert!(!report.ok());
        assert!(
            report.errors().any(|f| f.message.contains("Set __gap array to size 47")),
            "{report}"
        );
    }

    #[test]
    fn test_gap_fully_consumed_exactly() {
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 47, 1).build();
        let mut new = Lb::new().var("a", "t_uint256", 0);
        for k in 0..47u64 {
            new = new.var(&format!("b{k}"), "t_uint256", 1 + k);
        }
        assert!(compare(&old, &new.build()).ok());
    }

    #[test]
    fn test_mid_layout_gap_must_keep_end_fixed() {
        // gap is followed by `z`; shrinking the gap by 2 while inserting one
        // slot shifts `z`
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .gap("__gap", 10, 1)
            .var("z", "t_uint256", 11)
            .build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .gap("__gap", 8, 2)
            .var("z", "t_uint256", 10)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert!(
            report.errors().any(|f| f.kind == FindingKind::BadGapResize
                && f.message.contains("Set __gap array to size 9")),
            "{report}"
        );
    }

    #[test]
    fn test_mid_layout_gap_consumed_correctly() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .gap("__gap", 10, 1)
            .var("z", "t_uint256", 11)
            .build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .gap("__gap", 9, 2)
            .var("z", "t_uint256", 11)
            .build();
        assert!(compare(&old, &new).ok());
    }

    #[test]
    fn test_append_after_retained_trailing_gap_is_safe() {
        // child-contract pattern: new state declared after an inherited gap
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 47, 1).build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .gap("__gap", 47, 1)
            .var("b", "t_uint256", 48)
            .build();
        let report = compare(&old, &new);
        assert!(report.ok(), "{report}");
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[test]
    fn test_append_after_shrunk_trailing_gap_is_safe() {
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 47, 1).build();
        let new = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .gap("__gap", 46, 2)
            .var("c", "t_uint256", 48)
            .build();
        assert!(compare(&old, &new).ok());
    }

    #[test]
    fn test_trailing_gap_can_be_removed() {
        let old = Lb::new().var("a", "t_uint256", 0).gap("__gap", 48, 1).build();
        let new = Lb::new().var("a", "t_uint256", 0).build();
        assert!(compare(&old, &new).ok());
    }

    // ── Enums ────────────────────────────────────────────────────────────────

    #[test]
    fn test_enum_append_is_safe() {
        let old = Lb::new()
            .with_type("t_enum(Mode)1", enum_type("enum Mode", &["Idle", "Active"]))
            .var("mode", "t_enum(Mode)1", 0)
            .build();
        let new = Lb::new()
            .with_type("t_enum(Mode)2", enum_type("enum Mode", &["Idle", "Active", "Paused"]))
            .var("mode", "t_enum(Mode)2", 0)
            .build();
        assert!(compare(&old, &new).ok());
    }

    #[test]
    fn test_enum_reorder_is_violation() {
        let old = Lb::new()
            .with_type("t_enum(Mode)1", enum_type("enum Mode", &["Idle", "Active"]))
            .var("mode", "t_enum(Mode)1", 0)
            .build();
        let new = Lb::new()
            .with_type("t_enum(Mode)2", enum_type("enum Mode", &["Active", "Idle"]))
            .var("mode", "t_enum(Mode)2", 0)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert_eq!(report.errors().next().unwrap().kind, FindingKind::EnumMembersChanged);
    }

    #[test]
    fn test_enum_removal_is_violation() {
        let old = Lb::new()
            .with_type("t_enum(Mode)1", enum_type("enum Mode", &["Idle", "Active", "Paused"]))
            .var("mode", "t_enum(Mode)1", 0)
            .build();
        let new = Lb::new()
            .with_type("t_enum(Mode)2", enum_type("enum Mode", &["Idle", "Active"]))
            .var("mode", "t_enum(Mode)2", 0)
            .build();
        assert!(!compare(&old, &new).ok());
    }

    // ── Structs ──────────────────────────────────────────────────────────────

    #[test]
    fn test_struct_member_type_change_reported_with_path() {
        let old = Lb::new()
            .with_type(
                "t_struct(V)1_storage",
                struct_type(
                    "struct V",
                    64,
                    vec![member("total", "t_uint256", 0), member("cap", "t_uint256", 1)],
                ),
            )
            .var("v", "t_struct(V)1_storage", 0)
            .build();
        let new = Lb::new()
            .with_type(
                "t_struct(V)2_storage",
                struct_type(
                    "struct V",
                    64,
                    vec![member("total", "t_uint256", 0), member("cap", "t_bool", 1)],
                ),
            )
            .var("v", "t_struct(V)2_storage", 0)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        let finding = report.errors().next().unwrap();
        assert_eq!(finding.path, vec!["Box.v".to_string(), "cap".to_string()]);
    }

    #[test]
    fn test_struct_member_appended_within_size_is_reported_via_walk() {
        // removing a trailing struct member is a violation
        let old = Lb::new()
            .with_type(
                "t_struct(V)1_storage",
                struct_type(
                    "struct V",
                    64,
                    vec![member("total", "t_uint256", 0), member("cap", "t_uint256", 1)],
                ),
            )
            .var("v", "t_struct(V)1_storage", 0)
            .build();
        let new = Lb::new()
            .with_type(
                "t_struct(V)2_storage",
                struct_type("struct V", 32, vec![member("total", "t_uint256", 0)]),
            )
            .var("v", "t_struct(V)2_storage", 0)
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        assert!(report.errors().any(|f| f.message.contains("`cap`")));
    }

    // ── Arrays and mappings ──────────────────────────────────────────────────

    #[test]
    fn test_fixed_array_resize_is_violation() {
        // not a gap label: plain array resize must be caught by type compare
        let old2 = {
            let mut l = Lb::new();
            l = l.with_type(
                "t_array(t_uint256)4_storage",
                TypeItem {
                    kind: TypeKind::Array,
                    label: "uint256[4]".into(),
                    number_of_bytes: 128,
                    base: Some(TypeRef::from("t_uint256")),
                    length: Some(ArrayLength::Fixed(4)),
                    ..elementary("", 0)
                },
            );
            l.var("arr", "t_array(t_uint256)4_storage", 0).build()
        };
        let new2 = {
            let mut l = Lb::new();
            l = l.with_type(
                "t_array(t_uint256)3_storage",
                TypeItem {
                    kind: TypeKind::Array,
                    label: "uint256[3]".into(),
                    number_of_bytes: 96,
                    base: Some(TypeRef::from("t_uint256")),
                    length: Some(ArrayLength::Fixed(3)),
                    ..elementary("", 0)
                },
            );
            l.var("arr", "t_array(t_uint256)3_storage", 0).build()
        };
        let report = compare(&old2, &new2);
        assert!(!report.ok());
        assert!(report.errors().any(|f| f.kind == FindingKind::ArrayResized));
    }

    #[test]
    fn test_mapping_key_change_is_safe_value_change_is_not() {
        let mapping = |id: &str, value: &str, key: &str| TypeItem {
            kind: TypeKind::Mapping,
            label: format!("mapping({key} => {value})"),
            number_of_bytes: 32,
            key: Some(TypeRef::from(key)),
            value: Some(TypeRef::from(value)),
            ..elementary(id, 0)
        };
        let old = Lb::new()
            .with_type("t_map_a", mapping("m", "t_uint256", "t_address"))
            .var("m", "t_map_a", 0)
            .build();
        let key_changed = Lb::new()
            .with_type("t_map_b", mapping("m", "t_uint256", "t_uint256"))
            .var("m", "t_map_b", 0)
            .build();
        assert!(compare(&old, &key_changed).ok());

        let value_changed = Lb::new()
            .with_type("t_map_c", mapping("m", "t_address", "t_address"))
            .var("m", "t_map_c", 0)
            .build();
        let report = compare(&old, &value_changed);
        assert!(!report.ok());
        assert!(report.errors().next().unwrap().path.last().unwrap().contains("mapping value"));
    }

    // ── Namespaces ───────────────────────────────────────────────────────────

    #[test]
    fn test_namespaces_matched_by_id() {
        let old = Lb::new()
            .ns("example.main", vec![member("x", "t_uint256", 0)])
            .build();
        let new = Lb::new()
            .ns("example.other", vec![member("q", "t_uint256", 0)])
            .ns(
                "example.main",
                vec![member("x", "t_uint256", 0), member("y", "t_uint256", 1)],
            )
            .build();
        // appended within the namespace + a brand new namespace: safe
        assert!(compare(&old, &new).ok());
    }

    #[test]
    fn test_namespace_removal_is_violation() {
        let old = Lb::new()
            .ns("example.main", vec![member("x", "t_uint256", 0)])
            .build();
        let new = Lb::new().build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        let finding = report.errors().next().unwrap();
        assert_eq!(finding.kind, FindingKind::NamespaceRemoved);
        assert_eq!(finding.path, vec!["erc7201:example.main".to_string()]);
    }

    #[test]
    fn test_namespace_member_change_reports_prefixed_path() {
        let old = Lb::new()
            .ns("example.main", vec![member("x", "t_uint256", 0)])
            .build();
        let new = Lb::new()
            .ns("example.main", vec![member("x", "t_bool", 0)])
            .build();
        let report = compare(&old, &new);
        assert!(!report.ok());
        let finding = report.errors().next().unwrap();
        assert_eq!(finding.path[0], "erc7201:example.main");
    }

    // ── Cycle guard ──────────────────────────────────────────────────────────

    #[test]
    fn test_recursive_type_graph_terminates() {
        let node = |value_ref: &str| TypeItem {
            kind: TypeKind::Mapping,
            label: "mapping(uint256 => struct Node)".into(),
            number_of_bytes: 32,
            key: Some(TypeRef::from("t_uint256")),
            value: Some(TypeRef::from(value_ref)),
            ..elementary("", 0)
        };
        let old = Lb::new()
            .with_type("t_map_node", node("t_map_node"))
            .var("graph", "t_map_node", 0)
            .build();
        let new = old.clone();
        assert!(compare(&old, &new).ok());
    }

    // ── Report rendering ─────────────────────────────────────────────────────

    #[test]
    fn test_report_lists_every_error_line() {
        let old = Lb::new()
            .var("a", "t_uint256", 0)
            .var("b", "t_uint256", 1)
            .build();
        let new = Lb::new().build();
        let report = compare(&old, &new);
        let rendered = report.to_string();
        assert!(rendered.contains("`a`") && rendered.contains("`b`"), "{rendered}");
        assert_eq!(rendered.lines().count(), 2);
    }
}
