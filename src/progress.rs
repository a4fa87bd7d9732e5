//! Progress observer for per-page inference events.
//!
//! The inference driver reports what it is doing through [`PageProgress`].
//! Events are observational only: an observer cannot change the output, and
//! leaving it out (the default) changes nothing but visibility.
//!
//! ```rust
//! use nougat_pdf2text::{ExtractionConfig, PageProgress};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PageProgress for Counter {
//!     fn on_page_complete(&self, _page: usize, _total: usize, _chars: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Receives events from the inference driver.
///
/// All methods default to no-ops. Page numbers are 1-indexed positions in
/// the rasterised sequence.
pub trait PageProgress: Send + Sync {
    /// Called once before the first page.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called before a page's input is prepared.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called after a page produced its prediction.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
        let _ = (page_num, total_pages, text_len);
    }

    /// Called when a page fails; the run stops right after.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page succeeded.
    fn on_run_complete(&self, total_pages: usize) {
        let _ = total_pages;
    }
}

/// Observer that ignores every event.
pub struct NoopProgress;

impl PageProgress for NoopProgress {}

/// Type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn PageProgress>;

#[cfg(feature = "progress")]
pub use terminal::TerminalProgress;

#[cfg(feature = "progress")]
mod terminal {
    use super::PageProgress;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// A terminal progress bar on stderr, one tick per page.
    pub struct TerminalProgress {
        bar: ProgressBar,
    }

    impl TerminalProgress {
        /// The bar stays hidden until [`PageProgress::on_run_start`] sets its length.
        pub fn new() -> Self {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix("Loading");
            Self { bar }
        }
    }

    impl Default for TerminalProgress {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PageProgress for TerminalProgress {
        fn on_run_start(&self, total_pages: usize) {
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos:>3}/{len} pages  \
                 {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ");

            self.bar.set_length(total_pages as u64);
            self.bar.set_style(style);
            self.bar.set_prefix("Inferring");
            self.bar.enable_steady_tick(Duration::from_millis(100));
            self.bar.reset_eta();
        }

        fn on_page_start(&self, page_num: usize, _total_pages: usize) {
            self.bar.set_message(format!("page {page_num}"));
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _text_len: usize) {
            self.bar.inc(1);
        }

        fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
            self.bar
                .abandon_with_message(format!("page {page_num}/{total_pages} failed: {error}"));
        }

        fn on_run_complete(&self, _total_pages: usize) {
            self.bar.finish_and_clear();
        }
    }
}
