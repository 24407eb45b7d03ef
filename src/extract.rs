//! Plain-text extraction for downloaded files and attachments.
//!
//! Connectors hand over bytes plus a content type; this module returns UTF-8
//! text or an [`ExtractError`], in which case the item is skipped and logged.

use std::io::Read;

use crate::text::html_to_text;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLS: &str = "application/vnd.ms-excel";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_PPT: &str = "application/vnd.ms-powerpoint";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_HTML: &str = "text/html";
pub const MIME_EML: &str = "message/rfc822";
pub const MIME_JSON: &str = "application/json";
pub const MIME_OCTET: &str = "application/octet-stream";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Cap on decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Whether `err` is an [`ExtractError::UnsupportedContentType`]. Connectors
/// skip such files instead of failing them, since no retry can succeed.
pub fn is_unsupported(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::UnsupportedContentType(_))
    )
}

/// MIME type for a filename, by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    match crate::record::file_extension(filename).as_str() {
        ".pdf" => MIME_PDF,
        ".doc" => MIME_DOC,
        ".docx" => MIME_DOCX,
        ".xls" => MIME_XLS,
        ".xlsx" => MIME_XLSX,
        ".ppt" => MIME_PPT,
        ".pptx" => MIME_PPTX,
        ".txt" | ".md" => MIME_TEXT,
        ".csv" => MIME_CSV,
        ".eml" => MIME_EML,
        ".json" => MIME_JSON,
        ".html" | ".htm" => MIME_HTML,
        _ => MIME_OCTET,
    }
}

/// Reject payloads over `limit` bytes before any parsing.
pub fn check_size(size: u64, limit: u64) -> Result<(), ExtractError> {
    if size > limit {
        return Err(ExtractError::TooLarge { size, limit });
    }
    Ok(())
}

/// Extract plain text from `bytes` interpreted as `content_type`.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    // Graph sometimes appends parameters ("text/plain; charset=utf-8").
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_TEXT | MIME_CSV | MIME_JSON | "text/markdown" => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        MIME_HTML => Ok(html_to_text(&String::from_utf8_lossy(bytes))),
        MIME_EML => Ok(eml_body(&String::from_utf8_lossy(bytes))),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Body of a saved `.eml`: everything after the first blank line. HTML bodies
/// are reduced to text.
fn eml_body(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n");
    let body = normalized
        .split_once("\n\n")
        .map(|(_, b)| b)
        .unwrap_or(&normalized);
    if body.contains("<html") || body.contains("<body") {
        html_to_text(body)
    } else {
        body.trim().to_string()
    }
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_text_runs(&xml, Some(b"p"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut parts = Vec::new();
    for name in slides {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = collect_text_runs(&xml, Some(b"p"))?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join("\n\n"))
}

/// Entries named `{prefix}{N}.xml`, ordered by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element. When `paragraph` is given,
/// the end of each such element starts a new line.
fn collect_text_runs(xml: &[u8], paragraph: Option<&[u8]>) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if paragraph == Some(name.as_ref()) && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut rows_out = Vec::new();
    for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        rows_out.extend(extract_sheet_rows(&sheet_xml, &shared_strings)?);
    }
    Ok(rows_out.join("\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
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

/// One line per spreadsheet row, cells separated by `" | "`. Shared strings
/// are resolved; numbers and inline strings are kept as written.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let v = raw.trim();
                if !v.is_empty() {
                    let value = if shared {
                        v.parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        v.to_string()
                    };
                    if !value.is_empty() {
                        row.push(value);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                        row.clear();
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
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}

// ============ Core properties ============

/// Title, author, and modified date from an OOXML `docProps/core.xml`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoreProperties {
    pub title: Option<String>,
    pub creator: Option<String>,
    pub modified: Option<String>,
}

/// Read OOXML core properties. Non-OOXML input yields empty properties.
pub fn extract_core_properties(bytes: &[u8]) -> CoreProperties {
    use quick_xml::events::Event;

    let mut props = CoreProperties::default();
    let Ok(mut archive) = open_archive(bytes) else {
        return props;
    };
    let Ok(xml) = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)
    else {
        return props;
    };

    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut field: Option<&'static str> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                field = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    b"modified" => Some("modified"),
                    _ => None,
                };
            }
            Ok(Event::Text(te)) => {
                let value = te.unescape().unwrap_or_default().trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match field {
                    Some("title") => props.title = Some(value),
                    Some("creator") => props.creator = Some(value),
                    Some("modified") => props.modified = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", MIME_OCTET).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let doc = zip_with(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="w"><w:body><w:p><w:r><w:t>Budget</w:t></w:r><w:r><w:t xml:space="preserve"> 2025</w:t></w:r></w:p><w:p><w:r><w:t>Approved</w:t></w:r></w:p></w:body></w:document>"#,
        )]);
        assert_eq!(extract_text(&doc, MIME_DOCX).unwrap(), "Budget 2025\nApproved");
    }

    #[test]
    fn xlsx_rows_resolve_shared_strings() {
        let book = zip_with(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>region</t></si><si><t>north</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c><v>42</v></c></row><row><c t="s"><v>1</v></c><c><v>7.5</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        assert_eq!(
            extract_text(&book, MIME_XLSX).unwrap(),
            "region | 42\nnorth | 7.5"
        );
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let text = extract_text(b"hello", "Text/Plain; charset=utf-8").unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn eml_body_follows_headers() {
        let raw = "Subject: hi\r\nFrom: a@b.com\r\n\r\nBody line\r\n";
        assert_eq!(extract_text(raw.as_bytes(), MIME_EML).unwrap(), "Body line");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("a.PDF"), MIME_PDF);
        assert_eq!(content_type_for("deck.pptx"), MIME_PPTX);
        assert_eq!(content_type_for("mail.eml"), MIME_EML);
        assert_eq!(content_type_for("blob.bin"), MIME_OCTET);
    }

    #[test]
    fn unsupported_formats_are_recognized_through_anyhow() {
        let legacy = extract_text(b"\xd0\xcf", MIME_DOC).map_err(anyhow::Error::from);
        assert!(is_unsupported(&legacy.unwrap_err()));
        let broken = extract_text(b"not a zip", MIME_DOCX).map_err(anyhow::Error::from);
        assert!(!is_unsupported(&broken.unwrap_err()));
    }

    #[test]
    fn size_limit() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(
            check_size(11, 10),
            Err(ExtractError::TooLarge { size: 11, limit: 10 })
        ));
    }

    #[test]
    fn core_properties_are_read() {
        let doc = zip_with(&[(
            "docProps/core.xml",
            r#"<cp:coreProperties xmlns:cp="cp" xmlns:dc="dc" xmlns:dcterms="dcterms"><dc:title>Plan</dc:title><dc:creator>Dana</dc:creator><dcterms:modified>2025-03-01T10:00:00Z</dcterms:modified></cp:coreProperties>"#,
        )]);
        let props = extract_core_properties(&doc);
        assert_eq!(props.title.as_deref(), Some("Plan"));
        assert_eq!(props.creator.as_deref(), Some("Dana"));
        assert_eq!(props.modified.as_deref(), Some("2025-03-01T10:00:00Z"));
        assert_eq!(extract_core_properties(b"plain"), CoreProperties::default());
    }
}
