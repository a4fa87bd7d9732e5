//! Pipeline integration tests with a scripted model.
//!
//! No pdfium and no checkpoint are needed: pages are synthetic images and
//! the model is a `PageModel` that answers from a script, so these run
//! everywhere.

use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array3, Array4};
use nougat_pdf2text::{
    extract_text, extract_text_from_bytes, run_inference, ExtractError, ExtractionConfig,
    InferenceError, LoadError, NoopProgress, PageModel, PageProgress,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Answers page `i` (encoded in pixel (0, 0)) with `script[i]`.
struct ScriptedModel {
    script: Vec<Result<String, &'static str>>,
    calls: usize,
}

impl ScriptedModel {
    fn new(lines: &[&str]) -> Self {
        Self {
            script: lines.iter().map(|s| Ok(s.to_string())).collect(),
            calls: 0,
        }
    }
}

impl PageModel for ScriptedModel {
    fn prepare_input(&self, image: &DynamicImage) -> Result<Array3<f32>, InferenceError> {
        let id = image.to_rgb8().get_pixel(0, 0)[0];
        Ok(Array3::from_elem((3, 4, 3), f32::from(id)))
    }

    fn inference(&mut self, image_tensors: Array4<f32>) -> Result<Vec<String>, InferenceError> {
        self.calls += 1;
        assert_eq!(image_tensors.shape(), &[1, 3, 4, 3], "batch of one expected");
        let id = image_tensors[[0, 0, 0, 0]] as usize;
        match &self.script[id] {
            Ok(text) => Ok(vec![text.clone()]),
            Err(detail) => Err(InferenceError::ForwardPass {
                page: 0,
                stage: "decoder",
                detail: detail.to_string(),
            }),
        }
    }
}

fn pages(n: usize) -> Vec<DynamicImage> {
    (0..n)
        .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([i as u8, 255, 255]))))
        .collect()
}

#[test]
fn three_pages_join_with_newlines() {
    let mut model = ScriptedModel::new(&["Page text 1", "Page text 2", "Page text 3"]);
    let text = run_inference(&mut model, &pages(3), &NoopProgress).unwrap();
    assert_eq!(text, "Page text 1\nPage text 2\nPage text 3");
}

#[test]
fn n_pages_give_n_segments_in_order() {
    let lines: Vec<String> = (1..=12).map(|i| format!("segment {i}")).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let mut model = ScriptedModel::new(&refs);

    let text = run_inference(&mut model, &pages(12), &NoopProgress).unwrap();
    let segments: Vec<&str> = text.split('\n').collect();
    assert_eq!(segments, refs);
    assert_eq!(model.calls, 12);
}

#[test]
fn one_page_has_no_newline() {
    let mut model = ScriptedModel::new(&["Only page"]);
    let text = run_inference(&mut model, &pages(1), &NoopProgress).unwrap();
    assert!(!text.contains('\n'));
}

#[test]
fn page_text_is_not_trimmed_or_rewritten() {
    let mut model = ScriptedModel::new(&["  leading", "", "trailing  "]);
    let text = run_inference(&mut model, &pages(3), &NoopProgress).unwrap();
    assert_eq!(text, "  leading\n\ntrailing  ");
}

#[test]
fn repeated_runs_are_identical() {
    let mut model = ScriptedModel::new(&["a", "b"]);
    let imgs = pages(2);
    let first = run_inference(&mut model, &imgs, &NoopProgress).unwrap();
    let second = run_inference(&mut model, &imgs, &NoopProgress).unwrap();
    assert_eq!(first, second);
}

#[test]
fn failing_page_aborts_the_document() {
    let mut model = ScriptedModel {
        script: vec![Ok("ok".into()), Err("CUDA out of memory"), Ok("never".into())],
        calls: 0,
    };
    let err = run_inference(&mut model, &pages(3), &NoopProgress).unwrap_err();
    assert_eq!(err.page(), 2);
    assert!(err.to_string().contains("CUDA out of memory"));
    assert_eq!(model.calls, 2, "pages after the failure must not run");
}

#[test]
fn progress_counts_completed_pages() {
    struct Count(AtomicUsize);
    impl PageProgress for Count {
        fn on_page_complete(&self, _page: usize, _total: usize, _len: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = Count(AtomicUsize::new(0));
    let mut model = ScriptedModel::new(&["x", "y", "z", "w"]);
    run_inference(&mut model, &pages(4), &counter).unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 4);
}

#[test]
fn invalid_checkpoint_fails_before_pdf_is_touched() {
    // Both inputs are bad; the checkpoint error must win.
    let err = extract_text(
        "/definitely/not/a/real/file.pdf",
        "/definitely/not/a/checkpoint",
        &ExtractionConfig::default(),
    )
    .unwrap_err();
    assert!(
        matches!(err, ExtractError::Load(LoadError::CheckpointNotFound { .. })),
        "unexpected error: {err:?}"
    );
}

#[test]
fn local_checkpoint_missing_files_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = extract_from_bytes_with(dir.path().to_str().unwrap());
    match err {
        ExtractError::Load(LoadError::MissingFile { file, .. }) => assert_eq!(file, "config.json"),
        other => panic!("unexpected error: {other:?}"),
    }
}

fn extract_from_bytes_with(checkpoint: &str) -> ExtractError {
    extract_text_from_bytes(b"%PDF-1.4\n%%EOF\n", checkpoint, &ExtractionConfig::default())
        .unwrap_err()
}
