//! PDF rasterisation: render selected pages to `DynamicImage` via pdfium.
//!
//! Pages are rendered at `dpi / 72` scale (PDF user space is 72 units per
//! inch), with the longest edge capped at `max_rendered_pixels` so an A0
//! poster cannot exhaust memory. The call is all-or-nothing: one bad page
//! fails the whole document.

use crate::config::{PageSelection, RasterConfig};
use crate::error::RasterizeError;
use crate::pipeline::input;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Rasterise the selected pages of a PDF, in document order.
pub fn rasterize(pdf_path: &Path, config: &RasterConfig) -> Result<Vec<DynamicImage>, RasterizeError> {
    let pdf_path = input::resolve_local(pdf_path)?;

    let pdfium = pdfium_fetch::bind_pdfium(None)
        .map_err(|e| RasterizeError::PdfiumUnavailable(e.to_string()))?;

    let password = config.password.as_deref();
    let document = pdfium
        .load_pdf_from_file(&pdf_path, password)
        .map_err(|e| classify_load_error(&pdf_path, password.is_some(), e))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let indices = select_pages(&pdf_path, total_pages, &config.pages)?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(config.dpi as f32 / 72.0)
        .set_maximum_width(config.max_rendered_pixels as i32)
        .set_maximum_height(config.max_rendered_pixels as i32)
        .render_form_data(true);

    let mut images = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages
            .get(idx as u16)
            .map_err(|e| RasterizeError::PageFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RasterizeError::PageFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}

/// Resolve the page selection against the document, refusing to return
/// an empty list.
pub(crate) fn select_pages(
    pdf_path: &Path,
    total_pages: usize,
    selection: &PageSelection,
) -> Result<Vec<usize>, RasterizeError> {
    if total_pages == 0 {
        return Err(RasterizeError::EmptyDocument {
            path: pdf_path.to_path_buf(),
        });
    }

    let indices = selection.to_indices(total_pages);
    if indices.is_empty() {
        return Err(RasterizeError::NoPagesSelected { total: total_pages });
    }
    debug!("Selected {} of {} pages", indices.len(), total_pages);
    Ok(indices)
}

fn classify_load_error(pdf_path: &Path, had_password: bool, e: PdfiumError) -> RasterizeError {
    let detail = format!("{:?}", e);
    if detail.contains("Password") || detail.contains("password") {
        if had_password {
            RasterizeError::WrongPassword {
                path: pdf_path.to_path_buf(),
            }
        } else {
            RasterizeError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        }
    } else {
        RasterizeError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn zero_pages_is_an_error() {
        let err = select_pages(Path::new("empty.pdf"), 0, &PageSelection::All).unwrap_err();
        assert!(matches!(err, RasterizeError::EmptyDocument { .. }));
    }

    #[test]
    fn selection_outside_document_is_an_error() {
        let err = select_pages(Path::new("a.pdf"), 3, &PageSelection::Single(9)).unwrap_err();
        assert!(matches!(err, RasterizeError::NoPagesSelected { total: 3 }));
    }

    #[test]
    fn selection_keeps_document_order() {
        let idx = select_pages(Path::new("a.pdf"), 5, &PageSelection::Set(vec![5, 2, 4])).unwrap();
        assert_eq!(idx, vec![1, 3, 4]);
    }

    #[test]
    fn missing_file_fails_before_binding_pdfium() {
        let err = rasterize(
            Path::new("/definitely/not/a/real/file.pdf"),
            &RasterConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RasterizeError::FileNotFound { .. }));
    }

    #[test]
    fn non_pdf_fails_before_binding_pdfium() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let err = rasterize(f.path(), &RasterConfig::default()).unwrap_err();
        assert!(matches!(err, RasterizeError::NotAPdf { .. }));
    }
}
