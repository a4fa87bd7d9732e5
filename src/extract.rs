//! Document-level extraction entry points.
//!
//! Every entry point runs the same three stages in the same order:
//!
//! 1. load the model from the checkpoint
//! 2. rasterise the PDF
//! 3. run inference over the pages and join the texts with `"\n"`
//!
//! Loading comes first, so a bad checkpoint is reported before the PDF is
//! even opened. The first failure in any stage is returned as-is and no
//! partial text escapes.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::pipeline::model::{load_model_with, LoadOptions, PageModel};
use crate::pipeline::{driver, render};
use crate::progress::{NoopProgress, PageProgress};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Timing and size figures for one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    /// Pages rasterised and inferred.
    pub pages: usize,
    /// Characters in the joined text.
    pub chars: usize,
    pub load_duration_ms: u64,
    pub render_duration_ms: u64,
    pub inference_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Extract the text of every page of a PDF with default settings.
///
/// Uses [`ExtractionConfig::default`]: automatic device choice, 96 DPI, all
/// pages. With the `progress` feature a terminal progress bar is shown.
///
/// # Example
/// ```rust,no_run
/// let text = nougat_pdf2text::extract_text_from_pdf_file("paper.pdf", "Xenova/nougat-small")?;
/// println!("{text}");
/// # Ok::<(), nougat_pdf2text::ExtractError>(())
/// ```
pub fn extract_text_from_pdf_file(
    pdf_path: impl AsRef<Path>,
    checkpoint_path: &str,
) -> Result<String, ExtractError> {
    #[cfg(feature = "progress")]
    let config = ExtractionConfig {
        progress_callback: Some(std::sync::Arc::new(crate::progress::TerminalProgress::new())),
        ..ExtractionConfig::default()
    };
    #[cfg(not(feature = "progress"))]
    let config = ExtractionConfig::default();
    extract_text(pdf_path, checkpoint_path, &config)
}

/// Extract text with explicit settings.
pub fn extract_text(
    pdf_path: impl AsRef<Path>,
    checkpoint: &str,
    config: &ExtractionConfig,
) -> Result<String, ExtractError> {
    extract_with_stats(pdf_path.as_ref(), checkpoint, config).map(|(text, _)| text)
}

/// Extract text with an already-loaded model.
///
/// Lets one model serve many documents. Device and decoding options are
/// whatever the model was loaded with; only the raster settings and the
/// progress observer of `config` apply.
pub fn extract_text_with<M: PageModel + ?Sized>(
    model: &mut M,
    pdf_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<String, ExtractError> {
    let pages = render::rasterize(pdf_path.as_ref(), &config.raster())?;
    let text = driver::run(model, &pages, observer(config))?;
    Ok(text)
}

/// Run [`extract_text`] on tokio's blocking pool.
pub async fn extract_text_async(
    pdf_path: impl AsRef<Path>,
    checkpoint: impl Into<String>,
    config: &ExtractionConfig,
) -> Result<String, ExtractError> {
    let pdf_path = pdf_path.as_ref().to_path_buf();
    let checkpoint = checkpoint.into();
    let config = config.clone();
    tokio::task::spawn_blocking(move || extract_text(&pdf_path, &checkpoint, &config))
        .await
        .map_err(|e| ExtractError::Internal(format!("extraction task failed: {e}")))?
}

/// Extract text and write it to `output_path`.
///
/// The file is written to a sibling temp path and renamed into place, so a
/// failed run never leaves a partial file behind.
pub async fn extract_text_to_file(
    pdf_path: impl AsRef<Path>,
    checkpoint: impl Into<String>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, ExtractError> {
    let pdf_path = pdf_path.as_ref().to_path_buf();
    let checkpoint = checkpoint.into();
    let config = config.clone();
    let (text, stats) =
        tokio::task::spawn_blocking(move || extract_with_stats(&pdf_path, &checkpoint, &config))
            .await
            .map_err(|e| ExtractError::Internal(format!("extraction task failed: {e}")))??;

    let path = output_path.as_ref();
    write_atomically(path, &text).await?;
    info!("Wrote {} chars to {}", stats.chars, path.display());
    Ok(stats)
}

/// Extract text from PDF bytes held in memory.
///
/// The bytes go to a managed [`tempfile`] that is removed on return.
pub fn extract_text_from_bytes(
    bytes: &[u8],
    checkpoint: &str,
    config: &ExtractionConfig,
) -> Result<String, ExtractError> {
    let mut tmp = tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| ExtractError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|e| ExtractError::Internal(format!("tempfile write: {e}")))?;
    extract_text(tmp.path(), checkpoint, config)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn observer(config: &ExtractionConfig) -> &dyn PageProgress {
    match &config.progress_callback {
        Some(cb) => cb.as_ref(),
        None => &NoopProgress,
    }
}

/// Write `text` to a sibling temp file and rename it over `path`.
/// The temp file is removed again if either step fails.
async fn write_atomically(path: &Path, text: &str) -> Result<(), ExtractError> {
    let write_err = |e| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("txt.tmp");
    let written = match tokio::fs::write(&tmp_path, text).await {
        Ok(()) => tokio::fs::rename(&tmp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            debug!("could not remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(write_err(e));
    }
    Ok(())
}

fn extract_with_stats(
    pdf_path: &Path,
    checkpoint: &str,
    config: &ExtractionConfig,
) -> Result<(String, ExtractionStats), ExtractError> {
    let total_start = Instant::now();
    info!("Extracting text from {}", pdf_path.display());

    // ── Step 1: Load model ───────────────────────────────────────────────
    let load_start = Instant::now();
    let mut model = load_model_with(
        checkpoint,
        config.device,
        LoadOptions {
            max_new_tokens: config.max_new_tokens,
            markdown_fix: config.markdown_fix,
            early_stopping: config.early_stopping,
        },
    )?;
    let load_duration_ms = load_start.elapsed().as_millis() as u64;
    info!("Model loaded in {}ms", load_duration_ms);

    // ── Step 2: Rasterise pages ──────────────────────────────────────────
    let render_start = Instant::now();
    let pages = render::rasterize(pdf_path, &config.raster())?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!("Rendered {} pages in {}ms", pages.len(), render_duration_ms);

    // ── Step 3: Inference ────────────────────────────────────────────────
    let infer_start = Instant::now();
    let text = driver::run(&mut model, &pages, observer(config))?;
    let inference_duration_ms = infer_start.elapsed().as_millis() as u64;

    let stats = ExtractionStats {
        pages: pages.len(),
        chars: text.chars().count(),
        load_duration_ms,
        render_duration_ms,
        inference_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };
    info!(
        "Extraction complete: {} pages, {} chars, {}ms total",
        stats.pages, stats.chars, stats.total_duration_ms
    );
    Ok((text, stats))
}
