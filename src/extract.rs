//! Text extraction from uploaded PDFs.
//!
//! Extraction never panics on malformed input: it returns an [`ExtractError`]
//! and the upload is rejected.

/// Upper bound on accepted upload size.
pub const MAX_PDF_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug)]
pub enum ExtractError {
    NotAPdf,
    TooLarge(usize),
    Pdf(String),
    Empty,
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::NotAPdf => write!(f, "invalid upload: not a PDF document"),
            ExtractError::TooLarge(n) => write!(
                f,
                "invalid upload: {} bytes exceeds the {} byte limit",
                n, MAX_PDF_BYTES
            ),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Empty => write!(f, "invalid upload: PDF contains no extractable text"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extracts plain UTF-8 text from PDF bytes.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.len() > MAX_PDF_BYTES {
        return Err(ExtractError::TooLarge(bytes.len()));
    }
    if !bytes.starts_with(b"%PDF") {
        return Err(ExtractError::NotAPdf);
    }

    // pdf-extract can panic on malformed object streams
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Pdf("parser aborted on malformed input".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}
