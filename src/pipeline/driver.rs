//! Inference driver: run a [`PageModel`] over every page, in order.
//!
//! Each page is prepared, wrapped as a batch of one, and passed through the
//! model. The first element of each prediction batch is that page's text.
//! Page texts are joined with a single `"\n"`; nothing else is inserted,
//! trimmed, or reordered.
//!
//! A failure on any page aborts the run and discards every page already
//! processed.

use crate::error::InferenceError;
use crate::pipeline::model::PageModel;
use crate::progress::PageProgress;
use image::DynamicImage;
use ndarray::Axis;
use std::time::Instant;
use tracing::{debug, error, info};

/// Separator placed between consecutive page texts.
pub const PAGE_SEPARATOR: &str = "\n";

/// Run `model` over `pages` and return the joined text.
pub fn run<M: PageModel + ?Sized>(
    model: &mut M,
    pages: &[DynamicImage],
    progress: &dyn PageProgress,
) -> Result<String, InferenceError> {
    let total = pages.len();
    progress.on_run_start(total);

    let mut texts: Vec<String> = Vec::with_capacity(total);
    for (idx, page) in pages.iter().enumerate() {
        let page_num = idx + 1;
        progress.on_page_start(page_num, total);

        match infer_page(model, page) {
            Ok(text) => {
                progress.on_page_complete(page_num, total, text.len());
                texts.push(text);
            }
            Err(e) => {
                let e = e.at_page(page_num);
                error!("Page {}/{} failed: {}", page_num, total, e);
                progress.on_page_error(page_num, total, &e.to_string());
                return Err(e);
            }
        }
    }

    progress.on_run_complete(total);
    Ok(texts.join(PAGE_SEPARATOR))
}

fn infer_page<M: PageModel + ?Sized>(
    model: &mut M,
    page: &DynamicImage,
) -> Result<String, InferenceError> {
    let start = Instant::now();
    let tensor = model.prepare_input(page)?;
    let batch = tensor.insert_axis(Axis(0));
    debug!("Page tensor shape {:?}", batch.shape());

    let prediction = model
        .inference(batch)?
        .into_iter()
        .next()
        .ok_or(InferenceError::EmptyPrediction { page: 0 })?;

    info!(
        "Page inferred in {}ms ({} chars)",
        start.elapsed().as_millis(),
        prediction.len()
    );
    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use image::{Rgb, RgbImage};
    use ndarray::{Array3, Array4};
    use std::sync::Mutex;

    /// Reads the page id back from the red channel of pixel (0, 0).
    struct EchoModel {
        fail_on: Option<u8>,
        batch_sizes: Vec<usize>,
    }

    impl PageModel for EchoModel {
        fn prepare_input(&self, image: &DynamicImage) -> Result<Array3<f32>, InferenceError> {
            let id = image.to_rgb8().get_pixel(0, 0)[0];
            Ok(Array3::from_elem((3, 2, 2), f32::from(id)))
        }

        fn inference(&mut self, image_tensors: Array4<f32>) -> Result<Vec<String>, InferenceError> {
            self.batch_sizes.push(image_tensors.shape()[0]);
            let id = image_tensors[[0, 0, 0, 0]] as u8;
            if Some(id) == self.fail_on {
                return Err(InferenceError::ForwardPass {
                    page: 0,
                    stage: "decoder",
                    detail: "out of memory".into(),
                });
            }
            Ok(vec![format!("Page text {id}")])
        }
    }

    fn page(id: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([id, 0, 0])))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PageProgress for Recorder {
        fn on_run_start(&self, total: usize) {
            self.0.lock().unwrap().push(format!("start {total}"));
        }
        fn on_page_complete(&self, page: usize, _total: usize, _len: usize) {
            self.0.lock().unwrap().push(format!("done {page}"));
        }
        fn on_page_error(&self, page: usize, _total: usize, _error: &str) {
            self.0.lock().unwrap().push(format!("error {page}"));
        }
        fn on_run_complete(&self, total: usize) {
            self.0.lock().unwrap().push(format!("end {total}"));
        }
    }

    #[test]
    fn pages_join_in_order() {
        let mut model = EchoModel {
            fail_on: None,
            batch_sizes: vec![],
        };
        let text = run(&mut model, &[page(1), page(2), page(3)], &NoopProgress).unwrap();
        assert_eq!(text, "Page text 1\nPage text 2\nPage text 3");
        assert_eq!(model.batch_sizes, vec![1, 1, 1]);
    }

    #[test]
    fn single_page_has_no_separator() {
        let mut model = EchoModel {
            fail_on: None,
            batch_sizes: vec![],
        };
        assert_eq!(run(&mut model, &[page(7)], &NoopProgress).unwrap(), "Page text 7");
    }

    #[test]
    fn failure_is_tagged_with_page_and_aborts() {
        let mut model = EchoModel {
            fail_on: Some(2),
            batch_sizes: vec![],
        };
        let rec = Recorder::default();
        let err = run(&mut model, &[page(1), page(2), page(3)], &rec).unwrap_err();
        assert_eq!(err.page(), 2);
        assert!(matches!(err, InferenceError::ForwardPass { .. }));
        assert_eq!(model.batch_sizes.len(), 2);
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec!["start 3", "done 1", "error 2"]
        );
    }

    #[test]
    fn empty_prediction_is_an_error() {
        struct Silent;
        impl PageModel for Silent {
            fn prepare_input(&self, _: &DynamicImage) -> Result<Array3<f32>, InferenceError> {
                Ok(Array3::zeros((3, 1, 1)))
            }
            fn inference(&mut self, _: Array4<f32>) -> Result<Vec<String>, InferenceError> {
                Ok(vec![])
            }
        }
        let err = run(&mut Silent, &[page(1)], &NoopProgress).unwrap_err();
        assert!(matches!(err, InferenceError::EmptyPrediction { page: 1 }));
    }

    #[test]
    fn progress_sees_every_page() {
        let mut model = EchoModel {
            fail_on: None,
            batch_sizes: vec![],
        };
        let rec = Recorder::default();
        run(&mut model, &[page(1), page(2)], &rec).unwrap();
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec!["start 2", "done 1", "done 2", "end 2"]
        );
    }
}
