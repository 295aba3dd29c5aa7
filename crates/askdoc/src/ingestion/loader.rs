//! Per-page text extraction for uploaded files
use anyhow::Context;
use std::path::Path;
use tracing::debug;

/// Extracts the text of every page. PDFs are parsed page by page; any other
/// file is read as UTF-8 text and treated as a single page.
pub async fn load_pages(path: &Path) -> anyhow::Result<Vec<String>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let pages = if is_pdf(path, &bytes) {
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
            .await
            .context("PDF extraction task panicked")?
            .map_err(|e| anyhow::anyhow!("Failed to extract text from {}: {}", path.display(), e))?
    } else {
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is neither a PDF nor UTF-8 text", path.display()))?;
        vec![text]
    };

    debug!("Loaded {} page(s) from {}", pages.len(), path.display());
    Ok(pages)
}

fn is_pdf(path: &Path, bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
        || path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false)
}
