//! Model loading and page inference.
//!
//! [`PageModel`] is the seam between the driver and the network: one method
//! turns a page image into a `[3, H, W]` tensor, the other turns a
//! `[B, 3, H, W]` batch into `B` strings. [`NougatModel`] implements it on
//! top of an ONNX export of Nougat (a Swin encoder plus an mBART decoder)
//! run through ONNX Runtime.
//!
//! Decoding is greedy (see [`crate::pipeline::decode`]). A merged decoder
//! export (`decoder_model_merged.onnx`) is driven with its KV cache, one new
//! token per step; a plain `decoder_model.onnx` is fed the full prefix.

use crate::config::ComputeDevice;
use crate::error::{InferenceError, LoadError};
use crate::pipeline::checkpoint::{CheckpointFiles, CheckpointRef};
use crate::pipeline::decode::{greedy_decode, last_row, repeat_cutoff, DecodeParams};
use crate::pipeline::postprocess::postprocess_page;
use crate::pipeline::preprocess::{ImageProcessor, PreprocessorConfig};
use image::DynamicImage;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputValue, SessionInputs};
use ort::value::TensorRef;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::borrow::Cow;
use std::fmt::Display;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

const ENCODER_INPUT: &str = "pixel_values";
const ENCODER_OUTPUT: &str = "last_hidden_state";
const DECODER_IDS: &str = "input_ids";
const DECODER_STATES: &str = "encoder_hidden_states";
const DECODER_MASK: &str = "encoder_attention_mask";
const DECODER_OUTPUT: &str = "logits";
const DECODER_USE_CACHE: &str = "use_cache_branch";
const PAST_PREFIX: &str = "past_key_values.";

const DEFAULT_MAX_LENGTH: usize = 4096;

/// A model that turns page images into text.
///
/// The driver only ever calls these two methods, so tests can swap in a
/// scripted implementation without loading any weights.
pub trait PageModel {
    /// Convert one page image into the model's `[3, H, W]` input tensor.
    fn prepare_input(&self, image: &DynamicImage) -> Result<Array3<f32>, InferenceError>;

    /// Run the model over a `[B, 3, H, W]` batch and return `B` predictions.
    fn inference(&mut self, image_tensors: Array4<f32>) -> Result<Vec<String>, InferenceError>;
}

// ── Checkpoint configuration ─────────────────────────────────────────────────

/// Special token ids and length limits found in `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ModelConfig {
    decoder_start_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    decoder: DecoderConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DecoderConfig {
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    max_position_embeddings: Option<usize>,
    decoder_attention_heads: Option<usize>,
    d_model: Option<usize>,
}

/// `generation_config.json`; every key optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct GenerationConfig {
    decoder_start_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    max_length: Option<usize>,
}

impl DecodeParams {
    /// Merge the ids and limits of both config files.
    fn resolve(model: &ModelConfig, generation: &GenerationConfig, max_new_tokens: Option<usize>) -> Self {
        let decoder_start_token_id = generation
            .decoder_start_token_id
            .or(model.decoder_start_token_id)
            .or(generation.bos_token_id)
            .or(model.decoder.bos_token_id)
            .unwrap_or(0);
        let eos_token_id = generation
            .eos_token_id
            .or(model.eos_token_id)
            .or(model.decoder.eos_token_id)
            .unwrap_or(2);
        let pad_token_id = generation
            .pad_token_id
            .or(model.pad_token_id)
            .or(model.decoder.pad_token_id)
            .unwrap_or(1);
        let checkpoint_max = generation
            .max_length
            .or(model.decoder.max_position_embeddings)
            .unwrap_or(DEFAULT_MAX_LENGTH);

        Self {
            decoder_start_token_id,
            eos_token_id,
            pad_token_id,
            max_length: max_new_tokens.map_or(checkpoint_max, |n| n.min(checkpoint_max)),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LoadError::InvalidConfig {
        path: path.to_path_buf(),
        source,
    })
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Options that shape how a loaded model decodes.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub max_new_tokens: Option<usize>,
    pub markdown_fix: bool,
    pub early_stopping: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            markdown_fix: false,
            early_stopping: true,
        }
    }
}

/// How the decoder graph is fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderGraph {
    /// No cache inputs: the full prefix every step.
    Plain,
    /// Merged export with `past_key_values.*` inputs and a `use_cache_branch` switch.
    Cached {
        layers: usize,
        heads: usize,
        head_dim: usize,
    },
}

impl DecoderGraph {
    fn detect(path: &Path, inputs: &[String], config: &DecoderConfig) -> Result<Self, LoadError> {
        let layers = inputs
            .iter()
            .filter(|n| n.starts_with(PAST_PREFIX) && n.ends_with(".decoder.key"))
            .count();
        if layers == 0 {
            return Ok(Self::Plain);
        }
        require_names(path, "input", inputs, &[DECODER_USE_CACHE])?;
        match (config.decoder_attention_heads, config.d_model) {
            (Some(heads), Some(d_model)) if heads > 0 && d_model % heads == 0 => Ok(Self::Cached {
                layers,
                heads,
                head_dim: d_model / heads,
            }),
            _ => Err(LoadError::IncompatibleModel {
                path: path.to_path_buf(),
                reason: "cached decoder needs decoder.decoder_attention_heads and decoder.d_model in config.json"
                    .into(),
            }),
        }
    }
}

/// Past keys and values of a cached decoder, keyed by graph input name.
struct KvCache {
    past: Vec<(String, Array4<f32>)>,
    primed: bool,
}

impl KvCache {
    fn new(layers: usize, heads: usize, head_dim: usize) -> Self {
        let mut past = Vec::with_capacity(layers * 4);
        for layer in 0..layers {
            for part in ["decoder", "encoder"] {
                for kind in ["key", "value"] {
                    // ignored by the graph until `use_cache_branch` is set
                    past.push((
                        format!("{PAST_PREFIX}{layer}.{part}.{kind}"),
                        Array4::zeros((1, heads, 1, head_dim)),
                    ));
                }
            }
        }
        Self { past, primed: false }
    }
}

/// Nougat encoder/decoder pair, tokenizer, and preprocessor.
pub struct NougatModel {
    encoder: Session,
    decoder: Session,
    decoder_graph: DecoderGraph,
    decoder_takes_mask: bool,
    tokenizer: Tokenizer,
    processor: ImageProcessor,
    params: DecodeParams,
    unk_token_id: Option<u32>,
    markdown_fix: bool,
    early_stopping: bool,
    device: ComputeDevice,
}

impl std::fmt::Debug for NougatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NougatModel")
            .field("params", &self.params)
            .field("decoder_graph", &self.decoder_graph)
            .field("input_size", &self.processor.input_size())
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Load a checkpoint onto `device` with default decoding options.
///
/// `checkpoint` is a local directory or a Hub id (`org/name[@revision]`).
/// Fails before touching any PDF when the reference cannot be resolved.
pub fn load_model(checkpoint: &str, device: ComputeDevice) -> Result<NougatModel, LoadError> {
    load_model_with(checkpoint, device, LoadOptions::default())
}

/// Load a checkpoint onto `device`.
pub fn load_model_with(
    checkpoint: &str,
    device: ComputeDevice,
    options: LoadOptions,
) -> Result<NougatModel, LoadError> {
    let reference = CheckpointRef::parse(checkpoint)?;
    info!("Loading checkpoint {} on {}", reference, device);
    let files = reference.resolve()?;
    NougatModel::from_files(&files, device, options)
}

impl NougatModel {
    /// Build a model from already-resolved checkpoint files.
    pub fn from_files(
        files: &CheckpointFiles,
        device: ComputeDevice,
        options: LoadOptions,
    ) -> Result<Self, LoadError> {
        let model_config: ModelConfig = read_json(&files.config)?;
        let generation_config: GenerationConfig = match &files.generation_config {
            Some(p) => read_json(p)?,
            None => GenerationConfig::default(),
        };
        let preprocessor: PreprocessorConfig = read_json(&files.preprocessor_config)?;
        let params = DecodeParams::resolve(&model_config, &generation_config, options.max_new_tokens);
        debug!("Decode parameters: {:?}", params);

        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| LoadError::Tokenizer {
            path: files.tokenizer.clone(),
            reason: e.to_string(),
        })?;
        let unk_token_id = tokenizer.token_to_id("<unk>");

        let encoder = create_session(&files.encoder, device)?;
        let decoder = create_session(&files.decoder, device)?;

        require_names(&files.encoder, "input", &input_names(&encoder), &[ENCODER_INPUT])?;
        require_names(&files.encoder, "output", &output_names(&encoder), &[ENCODER_OUTPUT])?;
        let decoder_inputs = input_names(&decoder);
        require_names(&files.decoder, "input", &decoder_inputs, &[DECODER_IDS, DECODER_STATES])?;
        require_names(&files.decoder, "output", &output_names(&decoder), &[DECODER_OUTPUT])?;
        let decoder_takes_mask = decoder_inputs.iter().any(|n| n == DECODER_MASK);
        let decoder_graph = DecoderGraph::detect(&files.decoder, &decoder_inputs, &model_config.decoder)?;

        info!(
            "Model ready: input {:?}, max_length {}, decoder {:?}, device {}",
            preprocessor.size, params.max_length, decoder_graph, device
        );

        Ok(Self {
            encoder,
            decoder,
            decoder_graph,
            decoder_takes_mask,
            tokenizer,
            processor: ImageProcessor::new(preprocessor),
            params,
            unk_token_id,
            markdown_fix: options.markdown_fix,
            early_stopping: options.early_stopping,
            device,
        })
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    pub fn decode_params(&self) -> DecodeParams {
        self.params
    }

    /// Encoder forward pass for a single `[3, H, W]` image.
    fn encode(&mut self, image: ArrayView3<f32>) -> Result<Array3<f32>, InferenceError> {
        let batch = image.insert_axis(Axis(0));
        let input = TensorRef::from_array_view(batch).map_err(|e| forward_err("encoder", e))?;
        let outputs = self
            .encoder
            .run(ort::inputs![ENCODER_INPUT => input])
            .map_err(|e| forward_err("encoder", e))?;

        let (shape, data) = outputs[ENCODER_OUTPUT]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InvalidOutput {
                page: 0,
                detail: format!("encoder output: {e}"),
            })?;
        if shape.len() != 3 {
            return Err(InferenceError::InvalidOutput {
                page: 0,
                detail: format!("encoder output shape {:?}, expected 3 dims", &shape[..]),
            });
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        Array3::from_shape_vec(dims, data.to_vec()).map_err(|e| InferenceError::InvalidOutput {
            page: 0,
            detail: e.to_string(),
        })
    }

    /// Greedy decode conditioned on `encoder_states` (`[1, S, D]`).
    ///
    /// With early stopping on, a looping tail is cut after decoding.
    fn generate(&mut self, encoder_states: &Array3<f32>) -> Result<Vec<u32>, InferenceError> {
        let mask = self
            .decoder_takes_mask
            .then(|| Array2::<i64>::ones((1, encoder_states.shape()[1])));
        let decoder = &mut self.decoder;
        let mut cache = match self.decoder_graph {
            DecoderGraph::Plain => None,
            DecoderGraph::Cached {
                layers,
                heads,
                head_dim,
            } => Some(KvCache::new(layers, heads, head_dim)),
        };

        let decoded = greedy_decode(self.params, self.unk_token_id, self.early_stopping, |ids| {
            match cache.as_mut() {
                Some(cache) => forward_cached(decoder, cache, ids, encoder_states, mask.as_ref()),
                None => forward_plain(decoder, ids, encoder_states, mask.as_ref()),
            }
        })?;

        let mut tokens = decoded.tokens;
        if self.early_stopping {
            if let Some(cut) = repeat_cutoff(&decoded.steps, &self.params) {
                // `cut` counts the start token
                let keep = cut.saturating_sub(1).min(tokens.len());
                debug!("Repetition detected; keeping {} of {} tokens", keep, tokens.len());
                tokens.truncate(keep);
            }
        }
        debug!("Generated {} tokens", tokens.len());
        Ok(tokens)
    }
}

impl PageModel for NougatModel {
    fn prepare_input(&self, image: &DynamicImage) -> Result<Array3<f32>, InferenceError> {
        self.processor.prepare(image)
    }

    fn inference(&mut self, image_tensors: Array4<f32>) -> Result<Vec<String>, InferenceError> {
        let mut predictions = Vec::with_capacity(image_tensors.len_of(Axis(0)));
        for image in image_tensors.axis_iter(Axis(0)) {
            let states = self.encode(image)?;
            let tokens = self.generate(&states)?;
            let text = self
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| InferenceError::Decode {
                    page: 0,
                    detail: e.to_string(),
                })?;
            predictions.push(postprocess_page(&text, self.markdown_fix));
        }
        Ok(predictions)
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

fn execution_providers(device: ComputeDevice) -> Vec<ExecutionProviderDispatch> {
    match device {
        ComputeDevice::Cpu => vec![CPUExecutionProvider::default().build()],
        ComputeDevice::Cuda { device_id } => vec![CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure()],
        ComputeDevice::Auto => {
            let cuda = CUDAExecutionProvider::default();
            match cuda.is_available() {
                Ok(true) => {
                    debug!("CUDA execution provider available");
                    vec![cuda.build(), CPUExecutionProvider::default().build()]
                }
                _ => vec![CPUExecutionProvider::default().build()],
            }
        }
    }
}

fn create_session(path: &Path, device: ComputeDevice) -> Result<Session, LoadError> {
    let session_err = |e: ort::Error| LoadError::Session {
        path: path.to_path_buf(),
        device: device.to_string(),
        reason: e.to_string(),
    };

    debug!("Creating session for {} on {}", path.display(), device);
    Session::builder()
        .map_err(session_err)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(session_err)?
        .with_execution_providers(execution_providers(device))
        .map_err(session_err)?
        .commit_from_file(path)
        .map_err(session_err)
}

// ── Decoder steps ────────────────────────────────────────────────────────────

fn ids_array(ids: &[i64]) -> Result<Array2<i64>, InferenceError> {
    Array2::from_shape_vec((1, ids.len()), ids.to_vec()).map_err(|e| InferenceError::PrepareInput {
        page: 0,
        detail: e.to_string(),
    })
}

fn logits_err(e: impl Display) -> InferenceError {
    InferenceError::InvalidOutput {
        page: 0,
        detail: format!("decoder logits: {e}"),
    }
}

/// One step of a plain decoder: the whole prefix in, last logits row out.
fn forward_plain(
    decoder: &mut Session,
    ids: &[i64],
    states: &Array3<f32>,
    mask: Option<&Array2<i64>>,
) -> Result<Vec<f32>, InferenceError> {
    let input_ids = ids_array(ids)?;
    let ids_tensor = TensorRef::from_array_view(input_ids.view()).map_err(|e| forward_err("decoder", e))?;
    let states_tensor = TensorRef::from_array_view(states.view()).map_err(|e| forward_err("decoder", e))?;

    let outputs = match mask {
        Some(mask) => {
            let mask_tensor = TensorRef::from_array_view(mask.view()).map_err(|e| forward_err("decoder", e))?;
            decoder.run(ort::inputs![
                DECODER_IDS => ids_tensor,
                DECODER_STATES => states_tensor,
                DECODER_MASK => mask_tensor,
            ])
        }
        None => decoder.run(ort::inputs![
            DECODER_IDS => ids_tensor,
            DECODER_STATES => states_tensor,
        ]),
    }
    .map_err(|e| forward_err("decoder", e))?;
    let (shape, logits) = outputs[DECODER_OUTPUT].try_extract_tensor::<f32>().map_err(logits_err)?;
    Ok(last_row(&shape[..], logits)?.to_vec())
}

/// One step of a merged decoder. The first call runs the no-cache branch
/// on the whole prefix; later calls feed only the newest token. Decoder
/// keys/values are refreshed every step, encoder ones on the first only.
fn forward_cached(
    decoder: &mut Session,
    cache: &mut KvCache,
    ids: &[i64],
    states: &Array3<f32>,
    mask: Option<&Array2<i64>>,
) -> Result<Vec<f32>, InferenceError> {
    let step_ids = match (cache.primed, ids.last()) {
        (true, Some(last)) => std::slice::from_ref(last),
        _ => ids,
    };
    let input_ids = ids_array(step_ids)?;
    let use_cache = Array1::from_elem(1, cache.primed);

    let (row, presents) = {
        let tensor_err = |e: ort::Error| forward_err("decoder", e);
        let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = vec![
            (
                Cow::Borrowed(DECODER_IDS),
                TensorRef::from_array_view(input_ids.view()).map_err(tensor_err)?.into(),
            ),
            (
                Cow::Borrowed(DECODER_STATES),
                TensorRef::from_array_view(states.view()).map_err(tensor_err)?.into(),
            ),
            (
                Cow::Borrowed(DECODER_USE_CACHE),
                TensorRef::from_array_view(use_cache.view()).map_err(tensor_err)?.into(),
            ),
        ];
        if let Some(mask) = mask {
            inputs.push((
                Cow::Borrowed(DECODER_MASK),
                TensorRef::from_array_view(mask.view()).map_err(tensor_err)?.into(),
            ));
        }
        for (name, past) in &cache.past {
            inputs.push((
                Cow::Borrowed(name.as_str()),
                TensorRef::from_array_view(past.view()).map_err(tensor_err)?.into(),
            ));
        }

        let inputs: SessionInputs<'_, '_, 0> = SessionInputs::ValueMap(inputs);
        let outputs = decoder.run(inputs).map_err(|e| forward_err("decoder", e))?;
        let (shape, logits) = outputs[DECODER_OUTPUT].try_extract_tensor::<f32>().map_err(logits_err)?;
        let row = last_row(&shape[..], logits)?.to_vec();

        let mut presents = Vec::with_capacity(cache.past.len());
        for (i, (name, _)) in cache.past.iter().enumerate() {
            if cache.primed && name.contains(".encoder.") {
                continue;
            }
            let present = present_name(name);
            let (shape, data) = outputs[present.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::InvalidOutput {
                    page: 0,
                    detail: format!("{present}: {e}"),
                })?;
            presents.push((i, to_array4(&shape[..], data, &present)?));
        }
        (row, presents)
    };

    for (i, value) in presents {
        cache.past[i].1 = value;
    }
    cache.primed = true;
    Ok(row)
}

/// `past_key_values.3.decoder.key` → `present.3.decoder.key`.
fn present_name(past: &str) -> String {
    format!("present.{}", past.strip_prefix(PAST_PREFIX).unwrap_or(past))
}

fn to_array4(shape: &[i64], data: &[f32], name: &str) -> Result<Array4<f32>, InferenceError> {
    let invalid = |detail: String| InferenceError::InvalidOutput { page: 0, detail };
    if shape.len() != 4 {
        return Err(invalid(format!("{name} shape {shape:?}, expected 4 dims")));
    }
    let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize, shape[3] as usize);
    Array4::from_shape_vec(dims, data.to_vec()).map_err(|e| invalid(format!("{name}: {e}")))
}

fn input_names(session: &Session) -> Vec<String> {
    session.inputs.iter().map(|i| i.name.clone()).collect()
}

fn output_names(session: &Session) -> Vec<String> {
    session.outputs.iter().map(|o| o.name.clone()).collect()
}

fn require_names(path: &Path, kind: &str, present: &[String], required: &[&str]) -> Result<(), LoadError> {
    match required.iter().find(|r| !present.iter().any(|p| p == *r)) {
        None => Ok(()),
        Some(missing) => Err(LoadError::IncompatibleModel {
            path: path.to_path_buf(),
            reason: format!("graph has no {kind} '{missing}' (found {present:?})"),
        }),
    }
}

fn forward_err(stage: &'static str, e: impl Display) -> InferenceError {
    InferenceError::ForwardPass {
        page: 0,
        stage,
        detail: e.to_string(),
    }
}
