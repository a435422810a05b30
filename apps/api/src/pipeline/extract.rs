use std::path::Path;

use tracing::warn;

/// Best-effort plain text of a profile document. Never fails: unreadable or
/// malformed input yields an empty string.
pub async fn extract_profile_text(filename: &str, bytes: Vec<u8>) -> String {
    let is_pdf = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        return String::from_utf8_lossy(&bytes).into_owned();
    }

    // The PDF parser can panic on hostile input; a panicked blocking task is just an Err here.
    match tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Could not extract text from {filename}: {e}");
            String::new()
        }
        Err(e) => {
            warn!("PDF extraction for {filename} aborted: {e}");
            String::new()
        }
    }
}
