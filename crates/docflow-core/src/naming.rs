//! Shadow-twin naming.
//!
//! Every source document owns a hidden sibling folder (its *shadow twin*)
//! holding the artifacts derived from it. Names are deterministic so any
//! worker can find an artifact from the source reference alone:
//!
//! ```text
//! library/
//! ├── report.pdf
//! ├── .report.pdf/                      shadow folder
//! │   ├── report.de.md                  transcript
//! │   └── report.summary.de.md          transformation (template "summary")
//! └── report.de.md                      legacy sibling (pre-migration)
//! ```
//!
//! Lengths are counted in characters. Only the shadow folder name is
//! truncated to [`MAX_NAME_LEN`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest name the storage backends accept.
pub const MAX_NAME_LEN: usize = 255;

/// Kind of derived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Plain markdown extracted from the source.
    Transcript,
    /// Template output with structured frontmatter. Implies a transcript.
    Transformation,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Transcript => "transcript",
            ArtifactKind::Transformation => "transformation",
        }
    }

    pub fn other(&self) -> ArtifactKind {
        match self {
            ArtifactKind::Transcript => ArtifactKind::Transformation,
            ArtifactKind::Transformation => ArtifactKind::Transcript,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a file name into `(base, extension)`; the extension keeps its dot.
///
/// A leading dot does not start an extension, so `.env` has none.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Source file name without its extension.
pub fn base_name(source_name: &str) -> &str {
    split_extension(source_name).0
}

/// Name of the shadow folder for a source file: `.` + file name.
///
/// Names longer than [`MAX_NAME_LEN`] have their base truncated while the
/// leading dot and the extension survive.
pub fn shadow_folder_name(source_name: &str) -> String {
    let full = format!(".{}", source_name);
    if full.chars().count() <= MAX_NAME_LEN {
        return full;
    }

    let (base, ext) = split_extension(source_name);
    let ext_len = ext.chars().count();
    if ext_len + 1 >= MAX_NAME_LEN {
        return full.chars().take(MAX_NAME_LEN).collect();
    }

    let keep = MAX_NAME_LEN - 1 - ext_len;
    let truncated: String = base.chars().take(keep).collect();
    format!(".{}{}", truncated, ext)
}

/// `{base}.{lang}.md`
pub fn transcript_file_name(base: &str, language: &str) -> String {
    format!("{}.{}.md", base, language)
}

/// `{base}.{template}.{lang}.md`
pub fn transformation_file_name(base: &str, template: &str, language: &str) -> String {
    format!("{}.{}.{}.md", base, template, language)
}

/// Name of a pre-migration artifact stored directly next to its source.
pub fn legacy_file_name(base: &str, language: &str) -> String {
    transcript_file_name(base, language)
}

/// An artifact file name decoded against a known base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArtifactName {
    pub kind: ArtifactKind,
    pub template: Option<String>,
    pub language: String,
}

/// Decode `file_name` as an artifact of the source with base name `base`.
///
/// Returns `None` for files that do not follow the convention.
pub fn parse_artifact_name(base: &str, file_name: &str) -> Option<ParsedArtifactName> {
    let rest = file_name.strip_prefix(base)?.strip_prefix('.')?;
    let middle = rest.strip_suffix(".md")?;
    if middle.is_empty() {
        return None;
    }

    match middle.rsplit_once('.') {
        None => Some(ParsedArtifactName {
            kind: ArtifactKind::Transcript,
            template: None,
            language: middle.to_string(),
        }),
        Some((template, language)) if !template.is_empty() && !language.is_empty() => {
            Some(ParsedArtifactName {
                kind: ArtifactKind::Transformation,
                template: Some(template.to_string()),
                language: language.to_string(),
            })
        }
        _ => None,
    }
}
