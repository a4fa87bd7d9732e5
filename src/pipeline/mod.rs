//! Pipeline stages for PDF-to-text extraction.
//!
//! Each submodule implements exactly one transformation step, so each can
//! be tested without the others.
//!
//! ## Data Flow
//!
//! ```text
//! checkpoint ──▶ model            (Loader)
//! input ──▶ render                (Rasterizer)
//! preprocess ──▶ model ──▶ driver (Inference Driver)
//!               └─▶ postprocess
//! ```
//!
//! 1. [`checkpoint`] — resolve a local directory or Hub id to model files
//! 2. [`model`]      — build ONNX sessions and the tokenizer; run the decoder
//!    - [`decode`]    — greedy loop, repetition stop and tail cutoff
//! 3. [`input`]      — validate the user-supplied PDF path
//! 4. [`render`]     — rasterise selected pages via pdfium
//! 5. [`preprocess`] — page image to normalised `[3, H, W]` tensor
//! 6. [`driver`]     — per-page batch-of-one inference, joined with `"\n"`
//! 7. [`postprocess`] — deterministic cleanup of Nougat output

pub mod checkpoint;
pub mod decode;
pub mod driver;
pub mod input;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod render;
