//! Configuration types for PDF-to-text extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Every knob lives in one struct so a
//! config can be shared, logged, and compared between runs.

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration for one extraction run.
///
/// ```rust
/// use nougat_pdf2text::{ComputeDevice, ExtractionConfig, PageSelection};
///
/// let config = ExtractionConfig::builder()
///     .dpi(96)
///     .device(ComputeDevice::Cpu)
///     .pages(PageSelection::Range(1, 3))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI. Range: 72–400. Default: 96.
    ///
    /// Nougat is trained on 96 DPI renders resized to 896×672; higher DPI
    /// only costs render time since the image is downscaled anyway.
    pub dpi: u32,

    /// Cap on the longest rendered edge in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Device the model is loaded onto. Default: [`ComputeDevice::Auto`].
    pub device: ComputeDevice,

    /// Upper bound on generated tokens per page. `None` uses the
    /// checkpoint's `max_length`.
    pub max_new_tokens: Option<usize>,

    /// Apply Markdown-compatibility fixes to each page prediction. Default: false.
    pub markdown_fix: bool,

    /// Stop decoding a page once its token scores settle into a repetition
    /// loop, and cut the looping tail. Default: true.
    pub early_stopping: bool,

    /// Per-page progress observer. `None` runs silently.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 96,
            max_rendered_pixels: 4000,
            pages: PageSelection::default(),
            password: None,
            device: ComputeDevice::default(),
            max_new_tokens: None,
            markdown_fix: false,
            early_stopping: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pages", &self.pages)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("device", &self.device)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("markdown_fix", &self.markdown_fix)
            .field("early_stopping", &self.early_stopping)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PageProgress>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The rasteriser's view of this config.
    pub fn raster(&self) -> RasterConfig {
        RasterConfig {
            dpi: self.dpi,
            max_rendered_pixels: self.max_rendered_pixels,
            pages: self.pages.clone(),
            password: self.password.clone(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn device(mut self, device: ComputeDevice) -> Self {
        self.config.device = device;
        self
    }

    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.config.max_new_tokens = Some(n);
        self
    }

    pub fn markdown_fix(mut self, v: bool) -> Self {
        self.config.markdown_fix = v;
        self
    }

    pub fn early_stopping(mut self, v: bool) -> Self {
        self.config.early_stopping = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.max_new_tokens == Some(0) {
            return Err(ExtractError::InvalidConfig(
                "max_new_tokens must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Settings the page rasteriser needs.
#[derive(Debug, Clone)]
pub struct RasterConfig {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub pages: PageSelection,
    pub password: Option<String>,
}

impl Default for RasterConfig {
    fn default() -> Self {
        ExtractionConfig::default().raster()
    }
}

/// The compute device a model is placed on.
///
/// Passed explicitly to the loader; nothing in the crate picks a device
/// behind the caller's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComputeDevice {
    /// CUDA when the runtime can provide it, otherwise CPU. (default)
    #[default]
    Auto,
    /// CPU only.
    Cpu,
    /// A specific CUDA device; loading fails if it is unavailable.
    Cuda { device_id: i32 },
}

impl ComputeDevice {
    /// Parse `"auto"`, `"cpu"`, `"cuda"`/`"gpu"` or `"cuda:N"`.
    pub fn parse(s: &str) -> Result<Self, ExtractError> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "auto" => Ok(ComputeDevice::Auto),
            "cpu" => Ok(ComputeDevice::Cpu),
            "cuda" | "gpu" => Ok(ComputeDevice::Cuda { device_id: 0 }),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<i32>().ok())
                .filter(|n| *n >= 0)
                .map(|device_id| ComputeDevice::Cuda { device_id })
                .ok_or_else(|| {
                    ExtractError::InvalidConfig(format!(
                        "Unknown device '{s}'. Use 'auto', 'cpu', 'cuda' or 'cuda:N'"
                    ))
                }),
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Auto => write!(f, "auto"),
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Specifies which pages of the PDF to convert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}
