//! Error types for the nougat-pdf2text library.
//!
//! Each pipeline stage owns one error type:
//!
//! * [`LoadError`] — the checkpoint could not be resolved or turned into a
//!   running model (missing files, bad JSON, session/device failure).
//! * [`RasterizeError`] — the PDF could not be opened or rendered.
//! * [`InferenceError`] — a forward pass failed for some page.
//!
//! [`ExtractError`] wraps all three for the top-level `extract_*` functions.
//! Nothing is recovered inside the pipeline: the first failure aborts the
//! document and no partial text is returned.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the top-level extraction entry points.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Rasterize(#[from] RasterizeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not create or write the output text file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error (task join failure, temp file I/O).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure to turn a checkpoint reference into a ready model.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Neither an existing directory nor a Hugging Face Hub repository id.
    #[error("Checkpoint not found: '{reference}'\nPass a local checkpoint directory or a Hub id such as 'Xenova/nougat-small'.")]
    CheckpointNotFound { reference: String },

    /// A file the model needs is absent from the checkpoint.
    #[error("Checkpoint '{checkpoint}' is missing '{file}'")]
    MissingFile { checkpoint: String, file: String },

    /// Fetching a file from the Hub failed.
    #[error("Failed to download '{file}' from '{repo}': {reason}")]
    DownloadFailed {
        repo: String,
        file: String,
        reason: String,
    },

    /// A JSON configuration file exists but does not parse.
    #[error("Invalid config file '{path}': {source}")]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load tokenizer '{path}': {reason}")]
    Tokenizer { path: PathBuf, reason: String },

    /// ONNX Runtime refused the model file or the requested device.
    #[error("Failed to create inference session for '{path}' on {device}: {reason}")]
    Session {
        path: PathBuf,
        device: String,
        reason: String,
    },

    /// The ONNX graph does not have the inputs/outputs this pipeline drives.
    #[error("Model '{path}' is incompatible: {reason}")]
    IncompatibleModel { path: PathBuf, reason: String },
}

/// Failure to turn a PDF into page images.
#[derive(Debug, Error)]
pub enum RasterizeError {
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: Vec<u8> },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    #[error("PDF '{path}' is encrypted and requires a password.")]
    PasswordRequired { path: PathBuf },

    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The document parsed but has no pages.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    /// The page selection matches none of the document's pages.
    #[error("No selected page exists (document has {total} pages)")]
    NoPagesSelected { total: usize },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    PageFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumUnavailable(String),
}

/// Failure while running the model over one page.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Image → tensor conversion failed.
    #[error("Page {page}: input preparation failed: {detail}")]
    PrepareInput { page: usize, detail: String },

    /// ONNX Runtime returned an error (OOM, bad shape, …).
    #[error("Page {page}: {stage} forward pass failed: {detail}")]
    ForwardPass {
        page: usize,
        stage: &'static str,
        detail: String,
    },

    /// The model returned an output that does not have the expected shape.
    #[error("Page {page}: unexpected model output: {detail}")]
    InvalidOutput { page: usize, detail: String },

    /// Token ids could not be decoded to text.
    #[error("Page {page}: token decoding failed: {detail}")]
    Decode { page: usize, detail: String },

    /// The prediction batch was empty.
    #[error("Page {page}: model returned no prediction")]
    EmptyPrediction { page: usize },
}

impl InferenceError {
    /// The 1-indexed page the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            InferenceError::PrepareInput { page, .. }
            | InferenceError::ForwardPass { page, .. }
            | InferenceError::InvalidOutput { page, .. }
            | InferenceError::Decode { page, .. }
            | InferenceError::EmptyPrediction { page } => *page,
        }
    }

    /// Re-tag an error produced without page context.
    pub(crate) fn at_page(self, page: usize) -> Self {
        match self {
            InferenceError::PrepareInput { detail, .. } => {
                InferenceError::PrepareInput { page, detail }
            }
            InferenceError::ForwardPass { stage, detail, .. } => {
                InferenceError::ForwardPass { page, stage, detail }
            }
            InferenceError::InvalidOutput { detail, .. } => {
                InferenceError::InvalidOutput { page, detail }
            }
            InferenceError::Decode { detail, .. } => InferenceError::Decode { page, detail },
            InferenceError::EmptyPrediction { .. } => InferenceError::EmptyPrediction { page },
        }
    }
}
