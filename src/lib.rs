//! # nougat-pdf2text
//!
//! Extract the text of a PDF with Nougat, a neural document-understanding
//! model that reads rendered pages and writes Markdown with LaTeX math.
//!
//! ## Why this crate?
//!
//! Text-layer extraction (pdftotext, pdf-extract) loses equations, mangles
//! multi-column layouts, and returns nothing at all for scanned papers.
//! Nougat looks at the page image instead, so what you get back is what a
//! reader sees, formulae included.
//!
//! ## Pipeline Overview
//!
//! ```text
//! checkpoint ─┐
//!             ├─ 1. Load       resolve files, build ONNX sessions + tokenizer
//! PDF ────────┤
//!             ├─ 2. Render     rasterise pages via pdfium, in document order
//!             ├─ 3. Infer      one page at a time, batch of one, greedy decode
//!             └─ 4. Join       page texts joined with "\n"
//! ```
//!
//! The pipeline is synchronous and atomic: the first failure in any stage is
//! returned, and no partial text is produced.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nougat_pdf2text::extract_text_from_pdf_file;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Local checkpoint directory or Hugging Face Hub id
//!     let text = extract_text_from_pdf_file("paper.pdf", "Xenova/nougat-small")?;
//!     println!("{text}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `progress` | on      | [`TerminalProgress`] bar (indicatif) used by [`extract_text_from_pdf_file`] |
//! | `cuda`     | off     | Link ONNX Runtime's CUDA execution provider |
//!
//! ## Checkpoints
//!
//! Any ONNX export of a Nougat model works, for example `Xenova/nougat-small`
//! from the Hub or a local directory with the same layout. Hub downloads are
//! cached by `hf-hub` under `HF_HOME`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ComputeDevice, ExtractionConfig, ExtractionConfigBuilder, PageSelection};
pub use error::{ExtractError, InferenceError, LoadError, RasterizeError};
pub use extract::{
    extract_text, extract_text_async, extract_text_from_bytes, extract_text_from_pdf_file,
    extract_text_to_file, extract_text_with, ExtractionStats,
};
pub use pipeline::driver::run as run_inference;
pub use pipeline::model::{load_model, load_model_with, LoadOptions, NougatModel, PageModel};
pub use pipeline::render::rasterize;
#[cfg(feature = "progress")]
pub use progress::TerminalProgress;
pub use progress::{NoopProgress, PageProgress, ProgressCallback};
