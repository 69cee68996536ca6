//! Plain-text extraction for corpus files.
//!
//! The assistant's corpus is a folder of PDF, DOCX, TXT and Markdown files.
//! The format is chosen from the file extension; anything else is rejected
//! and the ingestion run skips the file.

use std::io::Read;
use std::path::Path;

/// Maximum decompressed bytes read from `word/document.xml` (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
}

impl DocumentFormat {
    /// Format for a path, by case-insensitive extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "md" => Some(Self::PlainText),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
}

/// Read `path` and return its text content.
pub fn extract_file(path: &Path) -> anyhow::Result<String> {
    let format = DocumentFormat::from_path(path)
        .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;
    let bytes = std::fs::read(path)?;
    Ok(extract_text(&bytes, format)?)
}

/// Extract text from in-memory bytes of a known format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::PlainText => String::from_utf8(bytes.to_vec())
            .map(|s| s.trim_start_matches('\u{feff}').to_string())
            .map_err(|e| ExtractError::Encoding(e.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&doc_xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = std::mem::take(&mut current);
                    if !para.trim().is_empty() {
                        paragraphs.push(para.trim().to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a/B.PDF")), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_path(Path::new("x.docx")), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_path(Path::new("x.md")), Some(DocumentFormat::PlainText));
        assert_eq!(DocumentFormat::from_path(Path::new("x.xlsx")), None);
        assert_eq!(DocumentFormat::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Severidade </w:t></w:r><w:r><w:t>do fogo</w:t></w:r></w:p>
    <w:p><w:r><w:t>dNBR &amp; RBR</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_text(&docx_bytes(xml), DocumentFormat::Docx).unwrap();
        assert_eq!(text, "Severidade do fogo\n\ndNBR & RBR");
    }

    #[test]
    fn test_docx_without_document_xml() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_text(&cursor.into_inner(), DocumentFormat::Docx).unwrap_err();
        assert!(err.to_string().contains("word/document.xml"));
    }

    #[test]
    fn test_invalid_inputs_return_errors() {
        assert!(extract_text(b"not a pdf", DocumentFormat::Pdf).is_err());
        assert!(extract_text(b"not a zip", DocumentFormat::Docx).is_err());
        assert!(extract_text(&[0xff, 0xfe, 0x00], DocumentFormat::PlainText).is_err());
    }

    #[test]
    fn test_plain_text_strips_bom() {
        let text = extract_text("\u{feff}Olá".as_bytes(), DocumentFormat::PlainText).unwrap();
        assert_eq!(text, "Olá");
    }

    #[test]
    fn test_extract_file_rejects_unknown_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tabela.xlsx");
        std::fs::write(&path, b"x").unwrap();
        assert!(extract_file(&path).is_err());
    }
}
