//! Bank consent response normalization
//!
//! Banks report consent state in several shapes: flat fields, fields wrapped
//! in a `data` object, snake_case or camelCase identifiers. Each canonical
//! field is read through an ordered list of JSON paths; the first path that
//! holds a non-empty value wins. Supporting a new bank shape means adding a
//! path to a table, nothing else.

use crate::types::ConsentStatus;
use serde_json::Value;

/// JSON path, outermost key first
type FieldPath = &'static [&'static str];

/// Where the consent status may live
pub const STATUS_PATHS: &[FieldPath] = &[&["status"], &["data", "status"]];

/// Where the final consent identifier may live
pub const FINAL_ID_PATHS: &[FieldPath] = &[
    &["consent_id"],
    &["consentId"],
    &["data", "consentId"],
    &["data", "consent_id"],
];

/// Where the provisional request identifier may live
pub const REQUEST_ID_PATHS: &[FieldPath] = &[
    &["request_id"],
    &["requestId"],
    &["data", "requestId"],
    &["data", "request_id"],
];

/// Status values meaning the consent was granted (compared case-insensitively)
pub const APPROVED_SYNONYMS: &[&str] = &["approved", "authorised", "authorized"];

/// Canonical view of one bank reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBankStatusResponse {
    pub final_identifier: Option<String>,
    pub request_identifier: Option<String>,
    /// `approved` for any approval synonym, the bank's own value otherwise
    pub status: Option<String>,
}

impl NormalizedBankStatusResponse {
    /// Nothing recognizable was found
    pub fn is_empty(&self) -> bool {
        self.final_identifier.is_none() && self.request_identifier.is_none() && self.status.is_none()
    }

    pub fn is_approved(&self) -> bool {
        self.status.as_deref() == Some(ConsentStatus::Approved.as_str())
    }

    /// Status mapped onto the canonical set, when it maps at all
    pub fn canonical_status(&self) -> Option<ConsentStatus> {
        self.status.as_deref().and_then(|s| s.parse().ok())
    }

    /// Final identifier that replaces `current_id`, if the bank handed out a new one
    pub fn transfer_target(&self, current_id: &str) -> Option<&str> {
        self.final_identifier
            .as_deref()
            .filter(|final_id| *final_id != current_id)
    }
}

/// Normalize a raw bank payload. Never fails: malformed input yields an empty result.
pub fn normalize(raw: &[u8]) -> NormalizedBankStatusResponse {
    match serde_json::from_slice::<Value>(raw) {
        Ok(tree) => normalize_value(&tree),
        Err(_) => NormalizedBankStatusResponse::default(),
    }
}

/// Normalize an already parsed JSON tree
pub fn normalize_value(tree: &Value) -> NormalizedBankStatusResponse {
    if !tree.is_object() {
        return NormalizedBankStatusResponse::default();
    }

    NormalizedBankStatusResponse {
        final_identifier: first_match(tree, FINAL_ID_PATHS),
        request_identifier: first_match(tree, REQUEST_ID_PATHS),
        status: first_match(tree, STATUS_PATHS).map(|s| canonicalize_status(&s)),
    }
}

/// Map approval synonyms to `approved`, pass anything else through unchanged
pub fn canonicalize_status(raw: &str) -> String {
    let trimmed = raw.trim();
    if APPROVED_SYNONYMS
        .iter()
        .any(|synonym| trimmed.eq_ignore_ascii_case(synonym))
    {
        ConsentStatus::Approved.as_str().to_string()
    } else {
        raw.to_string()
    }
}

fn first_match(tree: &Value, paths: &[FieldPath]) -> Option<String> {
    paths.iter().find_map(|path| lookup(tree, path))
}

fn lookup(tree: &Value, path: FieldPath) -> Option<String> {
    let mut node = tree;
    for key in path {
        node = node.as_object()?.get(*key)?;
    }

    let value = match node {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.trim().is_empty()).then_some(value)
}
