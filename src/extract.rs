//! In-process text extraction for the local provider.
//!
//! Turns source bytes into a markdown transcript plus a page count:
//!
//! | Format | Pages | Structure kept |
//! |--------|-------|----------------|
//! | PDF | form-feed separated pages | page breaks as `---` rules |
//! | DOCX | 1 | `Heading1..6` paragraphs become `#` headings |
//! | PPTX | one per slide | `## Slide N` heading per slide |
//! | XLSX | one per sheet | `## Sheet N` heading, one line per row |
//! | text / markdown | 1 | verbatim |
//!
//! OOXML parts are read through a size-bounded ZIP reader.

use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_ROWS_PER_SHEET: usize = 10_000;
/// Decompressed size cap per ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Markdown transcript of a source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub markdown: String,
    pub pages: u32,
}

pub fn extract(bytes: &[u8], content_type: &str) -> Result<Extracted, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_MARKDOWN | MIME_TEXT => Ok(Extracted {
            markdown: String::from_utf8_lossy(bytes).trim().to_string(),
            pages: 1,
        }),
        _ => Err(ExtractError::UnsupportedContentType(content_type.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages: Vec<&str> = text
        .split('\u{c}')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    Ok(Extracted {
        markdown: pages.join("\n\n---\n\n"),
        pages: pages.len().max(1) as u32,
    })
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

/// Entries `{prefix}N.xml`, ordered by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|n| {
            let number = n.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
            Some((number, n.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, n)| n).collect()
}

/// Paragraph of OOXML text and its heading level, if styled as one.
struct Paragraph {
    text: String,
    heading: Option<usize>,
}

fn heading_level(e: &BytesStart<'_>) -> Option<usize> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() != b"val" {
            return None;
        }
        let value = String::from_utf8_lossy(&a.value).to_string();
        let level: usize = value.strip_prefix("Heading")?.parse().ok()?;
        (1..=6).contains(&level).then_some(level)
    })
}

/// Collect `<*:p>` paragraphs made of `<*:t>` runs.
fn paragraphs(xml: &[u8]) -> Result<Vec<Paragraph>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<Paragraph> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    current = Some(Paragraph {
                        text: String::new(),
                        heading: None,
                    })
                }
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"pStyle" => {
                if let Some(p) = current.as_mut() {
                    p.heading = heading_level(&e);
                }
            }
            Ok(Event::Text(t)) if in_text => {
                if let Some(p) = current.as_mut() {
                    p.text.push_str(t.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(p) = current.take() {
                        if !p.text.trim().is_empty() {
                            out.push(p);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn render(paragraphs: &[Paragraph]) -> String {
    paragraphs
        .iter()
        .map(|p| match p.heading {
            Some(level) => format!("{} {}", "#".repeat(level), p.text.trim()),
            None => p.text.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    Ok(Extracted {
        markdown: render(&paragraphs(&xml)?),
        pages: 1,
    })
}

fn extract_pptx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut sections = Vec::new();
    for (i, name) in slides.iter().enumerate() {
        let xml = read_entry(&mut archive, name)?;
        let body = render(&paragraphs(&xml)?);
        sections.push(format!("## Slide {}\n\n{}", i + 1, body).trim_end().to_string());
    }
    Ok(Extracted {
        markdown: sections.join("\n\n"),
        pages: slides.len().max(1) as u32,
    })
}

fn extract_xlsx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared = match archive.index_for_name("xl/sharedStrings.xml") {
        Some(_) => shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?,
        None => Vec::new(),
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut sections = Vec::new();
    for (i, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_entry(&mut archive, name)?;
        let rows = sheet_rows(&xml, &shared)?;
        sections.push(format!("## Sheet {}\n\n{}", i + 1, rows.join("\n")).trim_end().to_string());
    }
    Ok(Extracted {
        markdown: sections.join("\n\n"),
        pages: sheets.len().clamp(1, XLSX_MAX_SHEETS) as u32,
    })
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(t.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One ` | `-joined line per non-empty row.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;

    loop {
        if rows.len() >= XLSX_MAX_ROWS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    })
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                let raw = t.unescape().unwrap_or_default();
                let value = raw.trim();
                if shared_cell {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        row.push(s.clone());
                    }
                } else if !value.is_empty() {
                    row.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut out);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn markdown_passes_through() {
        let out = extract(b"# Title\n\nBody\n", MIME_MARKDOWN).unwrap();
        assert_eq!(out.markdown, "# Title\n\nBody");
        assert_eq!(out.pages, 1);
    }

    #[test]
    fn docx_headings_become_markdown() {
        let xml = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Intro</w:t></w:r></w:p>
            <w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let out = extract(&bytes, MIME_DOCX).unwrap();
        assert_eq!(out.markdown, "# Intro\n\nHello world");
    }

    #[test]
    fn pptx_slides_are_pages_in_order() {
        let slide = |t: &str| format!(r#"<p:sld xmlns:a="a" xmlns:p="p"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#, t);
        let s1 = slide("first");
        let s2 = slide("second");
        let s10 = slide("tenth");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let out = extract(&bytes, MIME_PPTX).unwrap();
        assert_eq!(out.pages, 3);
        let first = out.markdown.find("first").unwrap();
        let second = out.markdown.find("second").unwrap();
        let tenth = out.markdown.find("tenth").unwrap();
        assert!(first < second && second < tenth);
    }

    #[test]
    fn xlsx_rows_use_shared_strings() {
        let shared = r#"<sst><si><t>Name</t></si><si><t>Ada</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>42</v></c></row>
            <row><c t="s"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let out = extract(&bytes, MIME_XLSX).unwrap();
        assert_eq!(out.markdown, "## Sheet 1\n\nName | 42\nAda");
    }
}
