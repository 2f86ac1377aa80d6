//! Output-contract validation for raw review-model responses.
//!
//! Fail-closed at the payload level, lenient at the finding level: a payload
//! that violates the top-level schema or version gate is rejected outright,
//! while an individual finding that fails validation is dropped with a
//! diagnostic and the rest of the payload survives.
//!
//! The pass order is fixed: parse, top-level schema, version compatibility,
//! per-finding coercion and validation, path reconciliation. `validate` is
//! deterministic: the same input yields the same outcome and the same
//! diagnostics in the same order.

use crate::redact;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeSet, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" => Ok(Severity::Info),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Correctness,
    Security,
    Performance,
    Reliability,
    Maintainability,
    Style,
    Test,
}

impl FromStr for Category {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "correctness" => Ok(Category::Correctness),
            "security" => Ok(Category::Security),
            "performance" => Ok(Category::Performance),
            "reliability" => Ok(Category::Reliability),
            "maintainability" => Ok(Category::Maintainability),
            "style" => Ok(Category::Style),
            "test" => Ok(Category::Test),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl FromStr for Confidence {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            _ => Err(()),
        }
    }
}

/// A validated review finding. `file` is stored in canonical form (forward
/// slashes, no leading `./`, no duplicate separators).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub file: String,
    pub line: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// The validated shape of a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub schema_version: String,
    pub prompt_version: String,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Stable diagnostic codes; part of the operator-facing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    InvalidJson,
    SchemaMismatch,
    MissingRequiredField,
    InvalidEnumValue,
    InvalidLineRange,
    FileNotInChangedFiles,
    IncompatibleVersion,
    AllFindingsDropped,
    CoercionApplied,
    FindingDropped,
    ResponseRejected,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::InvalidJson => "invalid_json",
            DiagnosticCode::SchemaMismatch => "schema_mismatch",
            DiagnosticCode::MissingRequiredField => "missing_required_field",
            DiagnosticCode::InvalidEnumValue => "invalid_enum_value",
            DiagnosticCode::InvalidLineRange => "invalid_line_range",
            DiagnosticCode::FileNotInChangedFiles => "file_not_in_changed_files",
            DiagnosticCode::IncompatibleVersion => "incompatible_version",
            DiagnosticCode::AllFindingsDropped => "all_findings_dropped",
            DiagnosticCode::CoercionApplied => "coercion_applied",
            DiagnosticCode::FindingDropped => "finding_dropped",
            DiagnosticCode::ResponseRejected => "response_rejected",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One machine-readable validation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub detail: String,
}

impl Diagnostic {
    fn top(code: DiagnosticCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            finding_id: None,
            field: None,
            detail: detail.into(),
        }
    }

    fn coercion(
        finding_id: Option<String>,
        field: &str,
        old: &str,
        new: &str,
    ) -> Self {
        Self {
            code: DiagnosticCode::CoercionApplied,
            finding_id,
            field: Some(field.to_string()),
            detail: format!(
                "{} -> {}",
                redact::scrub(old),
                redact::scrub(new)
            ),
        }
    }

    fn dropped(
        finding_id: Option<String>,
        field: Option<&str>,
        reason: DiagnosticCode,
        location: &str,
        extra: &str,
    ) -> Self {
        let detail = if extra.is_empty() {
            format!("{reason}{location}")
        } else {
            format!("{reason}: {extra}{location}")
        };
        Self {
            code: DiagnosticCode::FindingDropped,
            finding_id,
            field: field.map(str::to_string),
            detail,
        }
    }
}

#[derive(Debug)]
pub enum ValidationOutcome {
    Accepted {
        result: ReviewResult,
        diagnostics: Vec<Diagnostic>,
    },
    Rejected {
        diagnostics: Vec<Diagnostic>,
    },
}

impl ValidationOutcome {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ValidationOutcome::Accepted { diagnostics, .. } => diagnostics,
            ValidationOutcome::Rejected { diagnostics } => diagnostics,
        }
    }
}

/// Version gate configuration.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub expected_schema_major: u32,

    /// Lowest accepted minor on the expected major line.
    pub schema_minor_floor: u32,

    pub expected_prompt_major: u32,
    pub expected_prompt_minor: u32,

    /// Accept a patch component on the expected `major.minor` prompt line.
    pub allow_prompt_patch_drift: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            expected_schema_major: 1,
            schema_minor_floor: 0,
            expected_prompt_major: 1,
            expected_prompt_minor: 0,
            allow_prompt_patch_drift: true,
        }
    }
}

/// Validate a raw model response against the output contract and reconcile
/// finding paths against the changelist's changed files.
pub fn validate(
    raw: &[u8],
    changed_files: &[String],
    cfg: &ValidatorConfig,
) -> ValidationOutcome {
    let mut diags = Vec::new();

    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(err) => {
            diags.push(Diagnostic::top(DiagnosticCode::InvalidJson, err.to_string()));
            return reject(diags, DiagnosticCode::InvalidJson);
        }
    };

    let Some(obj) = value.as_object() else {
        diags.push(Diagnostic::top(
            DiagnosticCode::SchemaMismatch,
            "payload is not a JSON object",
        ));
        return reject(diags, DiagnosticCode::SchemaMismatch);
    };

    let schema_version = match require_string(obj, "schema_version", &mut diags) {
        Ok(s) => s,
        Err(code) => return reject(diags, code),
    };
    let prompt_version = match require_string(obj, "prompt_version", &mut diags) {
        Ok(s) => s,
        Err(code) => return reject(diags, code),
    };
    let findings_raw = match obj.get("findings") {
        None => {
            diags.push(Diagnostic {
                code: DiagnosticCode::MissingRequiredField,
                finding_id: None,
                field: Some("findings".to_string()),
                detail: "missing required top-level field".to_string(),
            });
            return reject(diags, DiagnosticCode::MissingRequiredField);
        }
        Some(Value::Array(arr)) => arr,
        Some(other) => {
            diags.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: Some("findings".to_string()),
                detail: format!("expected array, got {}", type_name(other)),
            });
            return reject(diags, DiagnosticCode::SchemaMismatch);
        }
    };

    let summary = match obj.get("summary") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            diags.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: Some("summary".to_string()),
                detail: format!("expected string, got {}", type_name(other)),
            });
            return reject(diags, DiagnosticCode::SchemaMismatch);
        }
    };
    let meta = match obj.get("meta") {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(other) => {
            diags.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: Some("meta".to_string()),
                detail: format!("expected object, got {}", type_name(other)),
            });
            return reject(diags, DiagnosticCode::SchemaMismatch);
        }
    };

    if let Err(code) = check_versions(&schema_version, &prompt_version, cfg, &mut diags) {
        return reject(diags, code);
    }

    let changed: BTreeSet<String> = changed_files.iter().map(|f| canonicalize_path(f)).collect();

    let mut kept = Vec::new();
    for (idx, raw_finding) in findings_raw.iter().enumerate() {
        match validate_finding(idx, raw_finding, &changed, &mut diags) {
            Some(finding) => kept.push(finding),
            None => {}
        }
    }

    if kept.is_empty() {
        diags.push(Diagnostic::top(
            DiagnosticCode::AllFindingsDropped,
            format!("0 of {} findings survived validation", findings_raw.len()),
        ));
    }

    ValidationOutcome::Accepted {
        result: ReviewResult {
            schema_version,
            prompt_version,
            findings: kept,
            summary,
            meta,
        },
        diagnostics: diags,
    }
}

fn reject(mut diags: Vec<Diagnostic>, primary: DiagnosticCode) -> ValidationOutcome {
    diags.push(Diagnostic::top(
        DiagnosticCode::ResponseRejected,
        primary.as_str(),
    ));
    ValidationOutcome::Rejected { diagnostics: diags }
}

fn require_string(
    obj: &Map<String, Value>,
    field: &str,
    diags: &mut Vec<Diagnostic>,
) -> Result<String, DiagnosticCode> {
    match obj.get(field) {
        None => {
            diags.push(Diagnostic {
                code: DiagnosticCode::MissingRequiredField,
                finding_id: None,
                field: Some(field.to_string()),
                detail: "missing required top-level field".to_string(),
            });
            Err(DiagnosticCode::MissingRequiredField)
        }
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => {
            diags.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: Some(field.to_string()),
                detail: format!("expected string, got {}", type_name(other)),
            });
            Err(DiagnosticCode::SchemaMismatch)
        }
    }
}

fn check_versions(
    schema_version: &str,
    prompt_version: &str,
    cfg: &ValidatorConfig,
    diags: &mut Vec<Diagnostic>,
) -> Result<(), DiagnosticCode> {
    let Some((major, minor)) = parse_major_minor(schema_version) else {
        diags.push(Diagnostic {
            code: DiagnosticCode::SchemaMismatch,
            finding_id: None,
            field: Some("schema_version".to_string()),
            detail: format!("{schema_version:?} does not match MAJOR.MINOR"),
        });
        return Err(DiagnosticCode::SchemaMismatch);
    };
    if major != cfg.expected_schema_major || minor < cfg.schema_minor_floor {
        diags.push(Diagnostic {
            code: DiagnosticCode::IncompatibleVersion,
            finding_id: None,
            field: Some("schema_version".to_string()),
            detail: format!(
                "got {major}.{minor}, expected {}.{}+",
                cfg.expected_schema_major, cfg.schema_minor_floor
            ),
        });
        return Err(DiagnosticCode::IncompatibleVersion);
    }

    let Some((p_major, p_minor, patch)) = parse_major_minor_patch(prompt_version) else {
        diags.push(Diagnostic {
            code: DiagnosticCode::SchemaMismatch,
            finding_id: None,
            field: Some("prompt_version".to_string()),
            detail: format!("{prompt_version:?} does not match MAJOR.MINOR[.PATCH]"),
        });
        return Err(DiagnosticCode::SchemaMismatch);
    };
    let line_matches = p_major == cfg.expected_prompt_major && p_minor == cfg.expected_prompt_minor;
    let patch_ok = patch.is_none() || cfg.allow_prompt_patch_drift;
    if !line_matches || !patch_ok {
        diags.push(Diagnostic {
            code: DiagnosticCode::IncompatibleVersion,
            finding_id: None,
            field: Some("prompt_version".to_string()),
            detail: format!(
                "got {prompt_version}, expected {}.{}{}",
                cfg.expected_prompt_major,
                cfg.expected_prompt_minor,
                if cfg.allow_prompt_patch_drift { "[.x]" } else { "" }
            ),
        });
        return Err(DiagnosticCode::IncompatibleVersion);
    }
    Ok(())
}

/// Per-finding coercion and validation. Returns `None` when the finding is
/// dropped; a `finding_dropped` diagnostic has then been emitted.
fn validate_finding(
    idx: usize,
    raw: &Value,
    changed: &BTreeSet<String>,
    diags: &mut Vec<Diagnostic>,
) -> Option<Finding> {
    let Some(obj) = raw.as_object() else {
        diags.push(Diagnostic::dropped(
            None,
            None,
            DiagnosticCode::SchemaMismatch,
            "",
            &format!("findings[{idx}] is not an object"),
        ));
        return None;
    };
    let mut obj = obj.clone();

    // Safe coercions, in order: trim strings, normalize path separators,
    // parse integral numeric strings.
    const STRING_FIELDS: &[&str] = &[
        "id",
        "severity",
        "category",
        "title",
        "file",
        "message",
        "suggestion",
        "confidence",
        "rule_id",
    ];
    let finding_id_hint = |obj: &Map<String, Value>| -> Option<String> {
        obj.get("id")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    for field in STRING_FIELDS {
        if let Some(Value::String(s)) = obj.get(*field) {
            let trimmed = s.trim();
            if trimmed != s {
                let id = finding_id_hint(&obj);
                diags.push(Diagnostic::coercion(id, field, s, trimmed));
                let trimmed = trimmed.to_string();
                obj.insert((*field).to_string(), Value::String(trimmed));
            }
        }
    }
    if let Some(Value::String(file)) = obj.get("file") {
        if file.contains('\\') {
            let fixed = file.replace('\\', "/");
            let id = finding_id_hint(&obj);
            diags.push(Diagnostic::coercion(id, "file", file, &fixed));
            obj.insert("file".to_string(), Value::String(fixed));
        }
    }
    for field in ["line", "end_line"] {
        if let Some(Value::String(s)) = obj.get(field) {
            if let Ok(n) = s.trim().parse::<i64>() {
                let id = finding_id_hint(&obj);
                diags.push(Diagnostic::coercion(id, field, s, &n.to_string()));
                obj.insert(field.to_string(), Value::Number(n.into()));
            }
        }
    }

    let id = finding_id_hint(&obj);
    let file_hint = obj
        .get("file")
        .and_then(Value::as_str)
        .map(str::to_string);
    let line_hint = obj.get("line").and_then(Value::as_i64);
    let location = match (&file_hint, line_hint) {
        (Some(f), Some(l)) => format!(" (file={f}, line={l})"),
        (Some(f), None) => format!(" (file={f})"),
        _ => String::new(),
    };

    macro_rules! drop_finding {
        ($field:expr, $reason:expr, $extra:expr) => {{
            diags.push(Diagnostic::dropped(
                id.clone(),
                Some($field),
                $reason,
                &location,
                $extra,
            ));
            return None;
        }};
    }

    let require_str = |obj: &Map<String, Value>, field: &str| -> Result<String, ()> {
        match obj.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            _ => Err(()),
        }
    };

    let Ok(id_val) = require_str(&obj, "id") else {
        drop_finding!("id", DiagnosticCode::MissingRequiredField, "id is required");
    };
    let severity = match require_str(&obj, "severity") {
        Ok(s) => match s.parse::<Severity>() {
            Ok(sev) => sev,
            Err(()) => drop_finding!(
                "severity",
                DiagnosticCode::InvalidEnumValue,
                &format!("severity={s:?}")
            ),
        },
        Err(()) => drop_finding!(
            "severity",
            DiagnosticCode::MissingRequiredField,
            "severity is required"
        ),
    };
    let category = match require_str(&obj, "category") {
        Ok(s) => match s.parse::<Category>() {
            Ok(cat) => cat,
            Err(()) => drop_finding!(
                "category",
                DiagnosticCode::InvalidEnumValue,
                &format!("category={s:?}")
            ),
        },
        Err(()) => drop_finding!(
            "category",
            DiagnosticCode::MissingRequiredField,
            "category is required"
        ),
    };
    let Ok(title) = require_str(&obj, "title") else {
        drop_finding!(
            "title",
            DiagnosticCode::MissingRequiredField,
            "title is required"
        );
    };
    let Ok(file) = require_str(&obj, "file") else {
        drop_finding!(
            "file",
            DiagnosticCode::MissingRequiredField,
            "file is required"
        );
    };
    let Ok(message) = require_str(&obj, "message") else {
        drop_finding!(
            "message",
            DiagnosticCode::MissingRequiredField,
            "message is required"
        );
    };
    let line = match obj.get("line") {
        Some(Value::Number(n)) if n.is_i64() => {
            let line = n.as_i64().unwrap_or(0);
            if line < 1 {
                drop_finding!(
                    "line",
                    DiagnosticCode::InvalidLineRange,
                    &format!("line={line}")
                );
            }
            line
        }
        Some(_) => drop_finding!("line", DiagnosticCode::SchemaMismatch, "line must be an integer"),
        None => drop_finding!(
            "line",
            DiagnosticCode::MissingRequiredField,
            "line is required"
        ),
    };
    let end_line = match obj.get("end_line") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) if n.is_i64() => {
            let end = n.as_i64().unwrap_or(0);
            if end < 1 || end < line {
                drop_finding!(
                    "end_line",
                    DiagnosticCode::InvalidLineRange,
                    &format!("end_line={end} line={line}")
                );
            }
            Some(end)
        }
        Some(_) => drop_finding!(
            "end_line",
            DiagnosticCode::SchemaMismatch,
            "end_line must be an integer"
        ),
    };
    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match s.parse::<Confidence>() {
            Ok(c) => Some(c),
            Err(()) => drop_finding!(
                "confidence",
                DiagnosticCode::InvalidEnumValue,
                &format!("confidence={s:?}")
            ),
        },
        Some(_) => drop_finding!(
            "confidence",
            DiagnosticCode::SchemaMismatch,
            "confidence must be a string"
        ),
    };
    let suggestion = match obj.get("suggestion") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => drop_finding!(
            "suggestion",
            DiagnosticCode::SchemaMismatch,
            "suggestion must be a string"
        ),
    };
    let rule_id = match obj.get("rule_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => drop_finding!(
            "rule_id",
            DiagnosticCode::SchemaMismatch,
            "rule_id must be a string"
        ),
    };

    // Path reconciliation: canonical exact match against the changed set.
    let canonical = canonicalize_path(&file);
    if !changed.contains(&canonical) {
        drop_finding!(
            "file",
            DiagnosticCode::FileNotInChangedFiles,
            &format!("file={canonical}")
        );
    }

    Some(Finding {
        id: id_val,
        severity,
        category,
        title,
        file: canonical,
        line,
        message,
        end_line,
        suggestion,
        confidence,
        rule_id,
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_major_minor(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.')?;
    if minor.contains('.') {
        return None;
    }
    Some((parse_component(major)?, parse_component(minor)?))
}

fn parse_major_minor_patch(s: &str) -> Option<(u32, u32, Option<u32>)> {
    let mut parts = s.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = match parts.next() {
        None => None,
        Some(p) => Some(parse_component(p)?),
    };
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn parse_component(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Canonical path form: forward slashes, no leading `./`, no duplicate
/// separators.
pub fn canonicalize_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let mut rest = replaced.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    let mut out = String::with_capacity(rest.len());
    let mut prev_slash = false;
    for ch in rest.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> ValidatorConfig {
        ValidatorConfig::default()
    }

    fn changed(files: &[&str]) -> Vec<String> {
        files.iter().map(|s| s.to_string()).collect()
    }

    fn good_finding() -> Value {
        json!({
            "id": "F1",
            "severity": "high",
            "category": "correctness",
            "title": "off-by-one",
            "file": "src/a.py",
            "line": 5,
            "message": "loop bound excludes the last element"
        })
    }

    fn payload(findings: Vec<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schema_version": "1.0",
            "prompt_version": "1.0",
            "findings": findings,
        }))
        .unwrap()
    }

    fn codes(outcome: &ValidationOutcome) -> Vec<DiagnosticCode> {
        outcome.diagnostics().iter().map(|d| d.code).collect()
    }

    #[test]
    fn accepts_a_well_formed_payload() {
        let outcome = validate(&payload(vec![good_finding()]), &changed(&["src/a.py"]), &cfg());
        let ValidationOutcome::Accepted { result, diagnostics } = outcome else {
            panic!("expected accept");
        };
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].file, "src/a.py");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn rejects_non_json() {
        let outcome = validate(b"not json {", &changed(&["src/a.py"]), &cfg());
        let ValidationOutcome::Rejected { diagnostics } = outcome else {
            panic!("expected reject");
        };
        assert_eq!(diagnostics[0].code, DiagnosticCode::InvalidJson);
        assert_eq!(
            diagnostics.last().unwrap().code,
            DiagnosticCode::ResponseRejected
        );
    }

    #[test]
    fn rejects_missing_top_level_fields() {
        let raw = serde_json::to_vec(&json!({ "findings": [] })).unwrap();
        let outcome = validate(&raw, &[], &cfg());
        let ValidationOutcome::Rejected { diagnostics } = outcome else {
            panic!("expected reject");
        };
        assert_eq!(diagnostics[0].code, DiagnosticCode::MissingRequiredField);
        assert_eq!(diagnostics[0].field.as_deref(), Some("schema_version"));
    }

    #[test]
    fn rejects_findings_of_wrong_type() {
        let raw = serde_json::to_vec(&json!({
            "schema_version": "1.0",
            "prompt_version": "1.0",
            "findings": "none",
        }))
        .unwrap();
        let outcome = validate(&raw, &[], &cfg());
        assert!(matches!(&outcome, ValidationOutcome::Rejected { .. }));
        assert!(codes(&outcome).contains(&DiagnosticCode::SchemaMismatch));
    }

    #[test]
    fn rejects_incompatible_schema_major() {
        let raw = serde_json::to_vec(&json!({
            "schema_version": "2.0",
            "prompt_version": "1.0",
            "findings": [],
        }))
        .unwrap();
        let outcome = validate(&raw, &[], &cfg());
        assert!(matches!(&outcome, ValidationOutcome::Rejected { .. }));
        assert!(codes(&outcome).contains(&DiagnosticCode::IncompatibleVersion));
    }

    #[test]
    fn rejects_schema_minor_below_floor() {
        let mut config = cfg();
        config.schema_minor_floor = 2;
        let raw = serde_json::to_vec(&json!({
            "schema_version": "1.1",
            "prompt_version": "1.0",
            "findings": [],
        }))
        .unwrap();
        let outcome = validate(&raw, &[], &config);
        assert!(matches!(outcome, ValidationOutcome::Rejected { .. }));
    }

    #[test]
    fn accepts_prompt_patch_drift_when_configured() {
        let raw = serde_json::to_vec(&json!({
            "schema_version": "1.0",
            "prompt_version": "1.0.3",
            "findings": [],
        }))
        .unwrap();
        assert!(matches!(
            validate(&raw, &[], &cfg()),
            ValidationOutcome::Accepted { .. }
        ));

        let mut strict = cfg();
        strict.allow_prompt_patch_drift = false;
        assert!(matches!(
            validate(&raw, &[], &strict),
            ValidationOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn rejects_malformed_version_strings() {
        for bad in ["1", "1.0.0", "v1.0", "1.a"] {
            let raw = serde_json::to_vec(&json!({
                "schema_version": bad,
                "prompt_version": "1.0",
                "findings": [],
            }))
            .unwrap();
            assert!(
                matches!(validate(&raw, &[], &cfg()), ValidationOutcome::Rejected { .. }),
                "schema_version {bad:?} should reject"
            );
        }
    }

    #[test]
    fn drops_invalid_findings_but_keeps_good_ones() {
        // One good, one invalid enum, one outside the changed set.
        let mut urgent = good_finding();
        urgent["id"] = json!("F2");
        urgent["severity"] = json!("urgent");
        let mut missing = good_finding();
        missing["id"] = json!("F3");
        missing["file"] = json!("src/missing.py");

        let outcome = validate(
            &payload(vec![good_finding(), urgent, missing]),
            &changed(&["src/a.py"]),
            &cfg(),
        );
        let ValidationOutcome::Accepted { result, diagnostics } = outcome else {
            panic!("expected accept");
        };
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].id, "F1");

        let dropped: Vec<&Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.code == DiagnosticCode::FindingDropped)
            .collect();
        assert_eq!(dropped.len(), 2);
        assert!(dropped[0].detail.starts_with("invalid_enum_value"));
        assert_eq!(dropped[0].finding_id.as_deref(), Some("F2"));
        assert!(dropped[1].detail.starts_with("file_not_in_changed_files"));
        assert_eq!(dropped[1].finding_id.as_deref(), Some("F3"));
    }

    #[test]
    fn all_findings_dropped_is_accept_not_reject() {
        let mut bad = good_finding();
        bad["severity"] = json!("urgent");
        let outcome = validate(&payload(vec![bad]), &changed(&["src/a.py"]), &cfg());
        let ValidationOutcome::Accepted { result, diagnostics } = outcome else {
            panic!("expected accept");
        };
        assert!(result.findings.is_empty());
        assert!(diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::AllFindingsDropped));
    }

    #[test]
    fn coercions_apply_in_order_and_are_recorded() {
        let raw = payload(vec![json!({
            "id": "  F1  ",
            "severity": " high ",
            "category": "correctness",
            "title": "bad path",
            "file": ".\\src\\a.py",
            "line": "5",
            "message": "m"
        })]);
        let outcome = validate(&raw, &changed(&["src/a.py"]), &cfg());
        let ValidationOutcome::Accepted { result, diagnostics } = outcome else {
            panic!("expected accept");
        };
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].file, "src/a.py");
        assert_eq!(result.findings[0].line, 5);

        let coercions: Vec<&Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.code == DiagnosticCode::CoercionApplied)
            .collect();
        let fields: Vec<&str> = coercions.iter().filter_map(|d| d.field.as_deref()).collect();
        assert!(fields.contains(&"id"));
        assert!(fields.contains(&"severity"));
        assert!(fields.contains(&"file"));
        assert!(fields.contains(&"line"));
    }

    #[test]
    fn line_range_constraints_enforced() {
        let mut zero_line = good_finding();
        zero_line["line"] = json!(0);
        let mut inverted = good_finding();
        inverted["id"] = json!("F2");
        inverted["end_line"] = json!(3);

        let outcome = validate(
            &payload(vec![zero_line, inverted]),
            &changed(&["src/a.py"]),
            &cfg(),
        );
        let ValidationOutcome::Accepted { result, diagnostics } = outcome else {
            panic!("expected accept");
        };
        assert!(result.findings.is_empty());
        let dropped_reasons: Vec<&str> = diagnostics
            .iter()
            .filter(|d| d.code == DiagnosticCode::FindingDropped)
            .map(|d| d.detail.as_str())
            .collect();
        assert!(dropped_reasons.iter().all(|d| d.starts_with("invalid_line_range")));
    }

    #[test]
    fn path_canonicalization_matches_equivalent_spellings() {
        assert_eq!(canonicalize_path("./src//a.py"), "src/a.py");
        assert_eq!(canonicalize_path(".\\src\\a.py"), "src/a.py");
        assert_eq!(canonicalize_path("src/a.py"), "src/a.py");

        let mut finding = good_finding();
        finding["file"] = json!("./src//a.py");
        let outcome = validate(&payload(vec![finding]), &changed(&["src/a.py"]), &cfg());
        let ValidationOutcome::Accepted { result, .. } = outcome else {
            panic!("expected accept");
        };
        assert_eq!(result.findings.len(), 1);
    }

    #[test]
    fn validation_is_deterministic() {
        let mut bad = good_finding();
        bad["id"] = json!("F2");
        bad["severity"] = json!("urgent");
        let raw = payload(vec![good_finding(), bad]);
        let changed = changed(&["src/a.py"]);

        let render = |outcome: &ValidationOutcome| -> String {
            outcome
                .diagnostics()
                .iter()
                .map(|d| format!("{:?}|{:?}|{:?}|{}", d.code, d.finding_id, d.field, d.detail))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let first = validate(&raw, &changed, &cfg());
        for _ in 0..10 {
            let again = validate(&raw, &changed, &cfg());
            assert_eq!(render(&first), render(&again));
        }
    }
}
