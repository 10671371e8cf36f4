//! File parsing for ingestion: plain text and markdown decode directly,
//! PDFs go through lopdf text extraction.

use engram_schema::{EngramError, Result};

pub fn is_pdf(file_name: &str, mime_type: Option<&str>) -> bool {
    mime_type == Some("application/pdf")
        || file_name.rsplit('.').next().map(|ext| ext.eq_ignore_ascii_case("pdf")) == Some(true)
}

fn is_plain_text(file_name: &str, mime_type: Option<&str>) -> bool {
    if let Some(mime) = mime_type {
        if mime.starts_with("text/") || mime == "application/json" {
            return true;
        }
    }
    matches!(
        file_name
            .rsplit('.')
            .next()
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("txt" | "md" | "markdown" | "json" | "csv" | "log")
    )
}

/// Extract the text content of an uploaded file. Unknown formats are an
/// `InvalidArgument`, not a crash.
pub fn extract_text(content: &[u8], file_name: &str, mime_type: Option<&str>) -> Result<String> {
    if is_pdf(file_name, mime_type) {
        return extract_pdf_text(content);
    }
    if is_plain_text(file_name, mime_type) || mime_type.is_none() {
        return Ok(String::from_utf8_lossy(content).into_owned());
    }
    Err(EngramError::invalid_argument(format!(
        "unsupported file type for {file_name:?} (mime {mime_type:?})"
    )))
}

fn extract_pdf_text(content: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(content)
        .map_err(|e| EngramError::invalid_argument(format!("unreadable pdf: {e}")))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    doc.extract_text(&pages)
        .map_err(|e| EngramError::invalid_argument(format!("pdf text extraction failed: {e}")))
}
