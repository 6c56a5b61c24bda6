//! Extraction of log and blob references from materialized logs.

use std::collections::BTreeMap;
use std::str::FromStr;

use blogmesh_types::{settings, Cid, LogAddress, LogKind, LogRecord, Op};
use serde_json::Value;
use tracing::warn;

/// Dependent logs named by a settings view, with their kinds.
///
/// Empty values are skipped; malformed addresses are logged and skipped.
pub fn settings_references(view: &BTreeMap<String, Value>) -> Vec<(LogAddress, LogKind)> {
    let mut out = Vec::new();
    for (key, kind) in LogKind::CROSS_REFERENCES {
        let Some(raw) = view.get(key).and_then(Value::as_str).map(str::trim) else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }
        match LogAddress::parse(raw) {
            Ok(address) => out.push((address, kind)),
            Err(e) => warn!(%key, value = %raw, error = %e, "ignoring malformed log reference"),
        }
    }
    out
}

/// Blobs referenced directly by a settings view (the profile picture).
pub fn settings_blobs(view: &BTreeMap<String, Value>) -> Vec<Cid> {
    view.get(settings::PROFILE_PICTURE)
        .and_then(cid_of_str)
        .into_iter()
        .collect()
}

/// Blobs referenced by every media record in a media view.
pub fn media_blobs(view: &BTreeMap<String, Value>) -> Vec<Cid> {
    let mut cids: Vec<Cid> = view.values().filter_map(media_cid).collect();
    cids.sort();
    cids.dedup();
    cids
}

/// Blobs referenced by newly appended media records.
pub fn record_blobs(entries: &[LogRecord]) -> Vec<Cid> {
    let mut cids: Vec<Cid> = entries
        .iter()
        .filter(|r| r.op == Op::Put)
        .filter_map(|r| media_cid(&r.value))
        .collect();
    cids.sort();
    cids.dedup();
    cids
}

fn media_cid(value: &Value) -> Option<Cid> {
    value.get("cid").and_then(cid_of_str)
}

fn cid_of_str(value: &Value) -> Option<Cid> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    match Cid::from_str(raw) {
        Ok(cid) => Some(cid),
        Err(e) => {
            warn!(value = %raw, error = %e, "ignoring malformed blob reference");
            None
        }
    }
}
