//! Frontmatter analysis and validation.
//!
//! An artifact's frontmatter is a YAML block delimited by `---` lines at
//! the very top of the markdown. Validity is purely declarative:
//!
//! - **core**: `pages` is a finite number > 0 and `chapters` is present as
//!   an array (possibly empty);
//! - **facets**: every declared facet that is set holds a primitive
//!   (string, number, boolean) or an array of strings.
//!
//! `frontmatter_valid = has_core && type_errors == 0`.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::facets::{FacetDef, FacetSchemaCache};

/// Result of splitting a markdown document into frontmatter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontmatterAnalysis {
    pub has_frontmatter: bool,
    pub meta: Map<String, Value>,
    pub body: String,
    /// Set when a delimited block exists but is not a YAML mapping.
    pub parse_error: Option<String>,
}

/// Parse the leading frontmatter block of `text`.
pub fn analyze(text: &str) -> FrontmatterAnalysis {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let not_found = |parse_error: Option<String>| FrontmatterAnalysis {
        has_frontmatter: false,
        meta: Map::new(),
        body: text.to_string(),
        parse_error,
    };

    let Some(after_open) = strip_delimiter_line(text) else {
        return not_found(None);
    };

    // Find the closing `---` line.
    let mut offset = 0;
    let mut close: Option<(usize, usize)> = None;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            close = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }
    let Some((yaml_end, body_start)) = close else {
        return not_found(None);
    };

    let yaml = &after_open[..yaml_end];
    let body = after_open[body_start..]
        .trim_start_matches(['\r', '\n'])
        .to_string();

    if yaml.trim().is_empty() {
        return FrontmatterAnalysis {
            has_frontmatter: true,
            meta: Map::new(),
            body,
            parse_error: None,
        };
    }

    let parsed = serde_yaml::from_str::<serde_yaml::Value>(yaml)
        .map_err(|e| e.to_string())
        .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string()));

    match parsed {
        Ok(Value::Object(meta)) => FrontmatterAnalysis {
            has_frontmatter: true,
            meta,
            body,
            parse_error: None,
        },
        Ok(other) => not_found(Some(format!(
            "frontmatter is not a mapping (found {})",
            json_type_name(&other)
        ))),
        Err(e) => not_found(Some(e)),
    }
}

fn strip_delimiter_line(text: &str) -> Option<&str> {
    text.strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
}

/// Render `meta` as a frontmatter block followed by `body`.
pub fn compose(meta: &Map<String, Value>, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(meta)?;
    Ok(format!("---\n{}---\n\n{}", yaml, body.trim_start_matches('\n')))
}

/// Machine-readable validation causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    FrontmatterCoreIncomplete,
    FrontmatterTypeErrors,
    LibraryNotFound,
    FacetValidationError,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::FrontmatterCoreIncomplete => "frontmatter_core_incomplete",
            ValidationReason::FrontmatterTypeErrors => "frontmatter_type_errors",
            ValidationReason::LibraryNotFound => "library_not_found",
            ValidationReason::FacetValidationError => "facet_validation_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub has_core: bool,
    pub type_errors: usize,
    pub type_error_fields: Vec<String>,
    pub frontmatter_valid: bool,
    pub reasons: Vec<ValidationReason>,
}

/// `pages` is a finite number > 0 and `chapters` is an array.
///
/// `chapters` may also arrive as a JSON-encoded string holding an array.
pub fn has_core(meta: &Map<String, Value>) -> bool {
    let pages_ok = meta
        .get("pages")
        .and_then(Value::as_f64)
        .map(|p| p.is_finite() && p > 0.0)
        .unwrap_or(false);

    let chapters_ok = match meta.get("chapters") {
        Some(Value::Array(_)) => true,
        Some(Value::String(s)) => matches!(serde_json::from_str::<Value>(s), Ok(Value::Array(_))),
        _ => false,
    };

    pages_ok && chapters_ok
}

fn is_allowed_facet_value(value: &Value) -> bool {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
        Value::Array(items) => items.iter().all(Value::is_string),
        _ => false,
    }
}

/// Names of declared facets whose value is set but has a disallowed shape.
pub fn facet_type_errors(meta: &Map<String, Value>, facets: &[FacetDef]) -> Vec<String> {
    facets
        .iter()
        .filter(|def| match meta.get(&def.name) {
            None | Some(Value::Null) => false,
            Some(v) => !is_allowed_facet_value(v),
        })
        .map(|def| def.name.clone())
        .collect()
}

/// Validate against an already-fetched facet list.
///
/// `facets = None` means no schema applies; facet checks are skipped.
pub fn validate_with_facets(meta: &Map<String, Value>, facets: Option<&[FacetDef]>) -> ValidationReport {
    let core = has_core(meta);
    let type_error_fields = facets
        .map(|defs| facet_type_errors(meta, defs))
        .unwrap_or_default();
    let type_errors = type_error_fields.len();

    let mut reasons = Vec::new();
    if !core {
        reasons.push(ValidationReason::FrontmatterCoreIncomplete);
    }
    if type_errors > 0 {
        reasons.push(ValidationReason::FrontmatterTypeErrors);
    }

    ValidationReport {
        has_core: core,
        type_errors,
        type_error_fields,
        frontmatter_valid: core && type_errors == 0,
        reasons,
    }
}

/// Validate `meta` against the core rules and the library's facet schema.
///
/// Schema lookups never fail the validation: an unknown library or a
/// provider error is reported in `reasons` and facet checks are skipped.
pub async fn validate(
    meta: &Map<String, Value>,
    user_email: Option<&str>,
    library_id: Option<&str>,
    schemas: &FacetSchemaCache,
) -> ValidationReport {
    let (Some(user), Some(library)) = (user_email, library_id) else {
        return validate_with_facets(meta, None);
    };

    match schemas.get(user, library).await {
        Ok(Some(facets)) => validate_with_facets(meta, Some(&facets)),
        Ok(None) => {
            let mut report = validate_with_facets(meta, None);
            report.reasons.push(ValidationReason::LibraryNotFound);
            report
        }
        Err(e) => {
            tracing::warn!(library, error = %e, "facet schema lookup failed");
            let mut report = validate_with_facets(meta, None);
            report.reasons.push(ValidationReason::FacetValidationError);
            report
        }
    }
}

/// Which phases still have work to do for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseNeeds {
    pub need_extract: bool,
    pub need_template: bool,
    /// `true` while no markdown exists: ingestion is needed eventually,
    /// once the upstream phases have produced something.
    pub need_ingest: bool,
}

impl PhaseNeeds {
    pub fn derive(has_markdown: bool, has_frontmatter: bool, frontmatter_valid: bool) -> Self {
        Self {
            need_extract: !has_markdown,
            need_template: !has_frontmatter || !frontmatter_valid,
            need_ingest: if has_markdown { frontmatter_valid } else { true },
        }
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::FacetType;
    use serde_json::json;

    fn facets() -> Vec<FacetDef> {
        vec![
            FacetDef {
                name: "authors".to_string(),
                facet_type: FacetType::StringArray,
            },
            FacetDef {
                name: "year".to_string(),
                facet_type: FacetType::Number,
            },
        ]
    }

    fn meta(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn analyze_splits_block_and_body() {
        let a = analyze("---\npages: 12\nchapters: []\ntitle: Report\n---\n\n# Body\n");
        assert!(a.has_frontmatter);
        assert_eq!(a.meta["pages"], json!(12));
        assert_eq!(a.meta["title"], json!("Report"));
        assert_eq!(a.body, "# Body\n");
    }

    #[test]
    fn analyze_handles_crlf() {
        let a = analyze("---\r\npages: 3\r\n---\r\nbody");
        assert!(a.has_frontmatter);
        assert_eq!(a.meta["pages"], json!(3));
        assert_eq!(a.body, "body");
    }

    #[test]
    fn analyze_without_block() {
        let a = analyze("# Just markdown\n");
        assert!(!a.has_frontmatter);
        assert!(a.meta.is_empty());
        assert_eq!(a.body, "# Just markdown\n");
    }

    #[test]
    fn unterminated_block_is_not_frontmatter() {
        let a = analyze("---\npages: 3\nno closing line");
        assert!(!a.has_frontmatter);
    }

    #[test]
    fn non_mapping_block_reports_parse_error() {
        let a = analyze("---\n- a\n- b\n---\nbody");
        assert!(!a.has_frontmatter);
        assert!(a.parse_error.is_some());
    }

    #[test]
    fn compose_round_trips_through_analyze() {
        let m = meta(json!({"pages": 4, "chapters": [{"title": "Intro"}]}));
        let text = compose(&m, "Body text").unwrap();
        let a = analyze(&text);
        assert!(a.has_frontmatter);
        assert_eq!(a.meta, m);
        assert_eq!(a.body, "Body text");
    }

    #[test]
    fn core_requires_positive_pages_and_chapters() {
        assert!(has_core(&meta(json!({"pages": 12, "chapters": []}))));
        assert!(!has_core(&meta(json!({"pages": 0, "chapters": []}))));
        assert!(!has_core(&meta(json!({"pages": 12}))));
        assert!(!has_core(&meta(json!({"pages": "12", "chapters": []}))));
        assert!(!has_core(&meta(json!({"chapters": []}))));
        assert!(has_core(&meta(json!({"pages": 1.5, "chapters": "[]"}))));
    }

    #[test]
    fn type_errors_count_set_non_primitive_facets() {
        let m = meta(json!({
            "pages": 2,
            "chapters": [],
            "authors": ["Ada", 3],
            "year": {"value": 2020},
        }));
        let report = validate_with_facets(&m, Some(&facets()));
        assert!(report.has_core);
        assert_eq!(report.type_errors, 2);
        assert!(!report.frontmatter_valid);
        assert_eq!(report.reasons, vec![ValidationReason::FrontmatterTypeErrors]);
    }

    #[test]
    fn unset_and_null_facets_are_fine() {
        let m = meta(json!({"pages": 2, "chapters": [], "year": null}));
        let report = validate_with_facets(&m, Some(&facets()));
        assert_eq!(report.type_errors, 0);
        assert!(report.frontmatter_valid);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn scenario_a_no_markdown() {
        let needs = PhaseNeeds::derive(false, false, false);
        assert!(needs.need_extract);
        assert!(needs.need_template);
        assert!(needs.need_ingest);
    }

    #[test]
    fn scenario_b_complete_frontmatter() {
        let m = meta(json!({
            "pages": 12,
            "chapters": [{"t": 1}, {"t": 2}, {"t": 3}],
            "authors": ["Ada"],
            "year": 2021,
        }));
        let report = validate_with_facets(&m, Some(&facets()));
        let needs = PhaseNeeds::derive(true, true, report.frontmatter_valid);
        assert!(!needs.need_extract);
        assert!(!needs.need_template);
        assert!(needs.need_ingest);
    }

    #[test]
    fn scenario_c_zero_pages_withholds_ingest() {
        let m = meta(json!({"pages": 0, "chapters": []}));
        let report = validate_with_facets(&m, Some(&facets()));
        assert!(!report.has_core);
        assert!(!report.frontmatter_valid);
        let needs = PhaseNeeds::derive(true, true, report.frontmatter_valid);
        assert!(needs.need_template);
        assert!(!needs.need_ingest);
    }
}
