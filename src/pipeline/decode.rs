//! Greedy decoding, independent of any runtime.
//!
//! The decoder forward pass is a closure from the token prefix to the
//! logits of the last position, so the loop, the repetition stop and the
//! tail cutoff can all be exercised with scripted logits.
//!
//! Repetition handling follows Nougat's generation:
//!
//! - while decoding, [`RepetitionStop`] tracks the variance of the per-step
//!   max logit over a short window, and the variance of that variance over
//!   a long one. A long run of flat variance means the model is looping.
//! - after decoding, [`repeat_cutoff`] looks for the point where the score
//!   variance settles for good and cuts the sequence there.

use crate::error::InferenceError;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Token ids and limits the decode loop needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    pub decoder_start_token_id: u32,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    pub max_length: usize,
}

/// Output of [`greedy_decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Generated tokens, without the start token and without EOS.
    pub tokens: Vec<u32>,
    /// `(token, score)` for every step, EOS step included.
    pub steps: Vec<(u32, f32)>,
    /// Stopped by the running repetition check.
    pub stopped_early: bool,
}

/// Run the greedy loop until EOS, `max_length`, or a repetition stop.
///
/// `forward` receives every token so far (start token first) and returns
/// the logits row for the last position.
pub fn greedy_decode<F>(
    params: DecodeParams,
    unk_token_id: Option<u32>,
    early_stopping: bool,
    mut forward: F,
) -> Result<Decoded, InferenceError>
where
    F: FnMut(&[i64]) -> Result<Vec<f32>, InferenceError>,
{
    let mut ids: Vec<i64> = vec![i64::from(params.decoder_start_token_id)];
    let mut steps = Vec::new();
    let mut stop = early_stopping.then(RepetitionStop::default);
    let mut stopped_early = false;
    let mut hit_eos = false;

    while ids.len() < params.max_length {
        let logits = forward(&ids)?;
        let (next, score) = next_token(&logits, unk_token_id).ok_or_else(|| InferenceError::InvalidOutput {
            page: 0,
            detail: "empty vocabulary".into(),
        })?;
        steps.push((next, score));
        if next == params.eos_token_id {
            hit_eos = true;
            break;
        }
        ids.push(i64::from(next));
        if stop.as_mut().is_some_and(|s| s.push(score)) {
            debug!("Score variance flat after {} steps; stopping", steps.len());
            stopped_early = true;
            break;
        }
    }

    if !hit_eos && !stopped_early {
        warn!("Generation hit max_length {}; page text may be truncated", params.max_length);
    }
    Ok(Decoded {
        tokens: ids.iter().skip(1).map(|&id| id as u32).collect(),
        steps,
        stopped_early,
    })
}

/// Highest logit and its index, skipping `excluded`. Ties go to the lowest index.
pub fn next_token(logits: &[f32], excluded: Option<u32>) -> Option<(u32, f32)> {
    logits
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i as u32) != excluded)
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if v <= b || v.is_nan() => best,
            _ => Some((i, v)),
        })
        .map(|(i, v)| (i as u32, v))
}

/// The last position's row of a `[1, T, V]` logits tensor.
pub fn last_row<'a>(shape: &[i64], logits: &'a [f32]) -> Result<&'a [f32], InferenceError> {
    if shape.len() != 3 || shape[1] < 1 {
        return Err(InferenceError::InvalidOutput {
            page: 0,
            detail: format!("logits shape {shape:?}, expected [1, T, V]"),
        });
    }
    let vocab = shape[2] as usize;
    let offset = (shape[1] as usize - 1) * vocab;
    logits
        .get(offset..offset + vocab)
        .ok_or_else(|| InferenceError::InvalidOutput {
            page: 0,
            detail: format!("logits hold {} values, shape {shape:?}", logits.len()),
        })
}

// ── Running repetition stop ──────────────────────────────────────────────────

const SCORE_WINDOW: usize = 15;
const VARIANCE_WINDOW: usize = 200;
const STOP_THRESHOLD: f64 = 0.015;
const POSITION_LIMIT: f64 = 4095.0;

/// Sliding-window sample variance.
#[derive(Debug, Clone)]
struct RunningVar {
    values: VecDeque<f64>,
    window: usize,
    // divide by the number of values held
    norm: bool,
}

impl RunningVar {
    fn new(window: usize, norm: bool) -> Self {
        Self {
            values: VecDeque::with_capacity(window),
            window,
            norm,
        }
    }

    fn push(&mut self, x: f64) {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(x);
    }

    /// Unbiased variance; NaN with fewer than two values.
    fn variance(&self) -> f64 {
        let var = sample_variance(self.values.iter().copied(), self.values.len());
        if self.norm {
            var / self.values.len() as f64
        } else {
            var
        }
    }
}

fn sample_variance(values: impl Iterator<Item = f64> + Clone, n: usize) -> f64 {
    if n < 2 {
        return f64::NAN;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64
}

/// Stops generation once the score variance has stayed flat for a while.
#[derive(Debug, Clone)]
pub struct RepetitionStop {
    vars: RunningVar,
    varvars: RunningVar,
    size: usize,
    stop_at: usize,
    stopped: bool,
}

impl Default for RepetitionStop {
    fn default() -> Self {
        Self {
            vars: RunningVar::new(SCORE_WINDOW, true),
            varvars: RunningVar::new(VARIANCE_WINDOW, false),
            size: 0,
            stop_at: 0,
            stopped: false,
        }
    }
}

impl RepetitionStop {
    /// Record the max logit of one step; true when generation should stop.
    pub fn push(&mut self, score: f32) -> bool {
        self.vars.push(f64::from(score));
        self.varvars.push(self.vars.variance());
        self.size += 1;
        if self.size < VARIANCE_WINDOW {
            return false;
        }

        // NaN compares false and resets the countdown
        if self.varvars.variance() < STOP_THRESHOLD {
            if self.stop_at > 0 && !self.stopped {
                self.stopped = self.stop_at >= self.size;
            } else {
                let at = (self.size as f64 * 1.15 + 150.0 + VARIANCE_WINDOW as f64).min(POSITION_LIMIT);
                self.stop_at = at as usize;
            }
        } else {
            self.stop_at = 0;
            self.stopped = false;
        }
        self.stopped
    }
}

// ── Tail cutoff ──────────────────────────────────────────────────────────────

const CUTOFF_MIN_WINDOWS: usize = 10;
const CUTOFF_THRESHOLD: f64 = 0.045;

/// Where to cut a finished sequence that ends in a repetition loop.
///
/// Returns the cut position counted in sequence positions (start token at
/// 0), or `None` to keep everything. `steps` is [`Decoded::steps`].
pub fn repeat_cutoff(steps: &[(u32, f32)], params: &DecodeParams) -> Option<usize> {
    let values: Vec<f64> = steps
        .iter()
        .filter(|(t, _)| *t != params.pad_token_id)
        .map(|(_, s)| f64::from(*s))
        .collect();
    let n = values.len();

    let var: Vec<f64> = (0..n.saturating_sub(SCORE_WINDOW))
        .map(|i| population_variance(&values[i..i + SCORE_WINDOW]) / SCORE_WINDOW as f64)
        .collect();
    if var.len() < CUTOFF_MIN_WINDOWS {
        return None;
    }
    if steps.iter().any(|(t, _)| *t == params.eos_token_id) && n + 1 < steps.len() {
        return None;
    }

    // variance of every suffix of `var`, longest first
    let small: Vec<usize> = (0..var.len() - CUTOFF_MIN_WINDOWS)
        .filter(|&j| population_variance(&var[j + 1..]) < CUTOFF_THRESHOLD)
        .collect();
    if small.len() < 2 || small.windows(2).any(|w| w[1] - w[0] >= 2) {
        return None;
    }

    let first = small[0];
    let idx = (first.max(1) as f64 * 1.08 + 120.0).min(POSITION_LIMIT) as usize;
    if idx as f64 / n as f64 > 0.9 {
        None
    } else if first < 30 {
        Some(0)
    } else {
        Some(idx)
    }
}

fn population_variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: DecodeParams = DecodeParams {
        decoder_start_token_id: 0,
        eos_token_id: 2,
        pad_token_id: 1,
        max_length: 4096,
    };

    /// Logits that peak at `token` with `score`, everything else at 0.
    fn peak(vocab: usize, token: usize, score: f32) -> Vec<f32> {
        let mut row = vec![0.0; vocab];
        row[token] = score;
        row
    }

    #[test]
    fn next_token_skips_excluded() {
        let logits = [0.1, 5.0, 0.3, 2.0];
        assert_eq!(next_token(&logits, None), Some((1, 5.0)));
        assert_eq!(next_token(&logits, Some(1)), Some((3, 2.0)));
    }

    #[test]
    fn next_token_prefers_first_on_tie() {
        assert_eq!(next_token(&[1.0, 3.0, 3.0], None), Some((1, 3.0)));
        assert_eq!(next_token(&[], None), None);
    }

    #[test]
    fn last_row_follows_the_sequence_axis() {
        let logits = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        // full prefix of two positions
        assert_eq!(last_row(&[1, 2, 3], &logits).unwrap(), &[3.0, 4.0, 5.0]);
        // cached step: one position, whatever the prefix length was
        assert_eq!(last_row(&[1, 1, 3], &logits[..3]).unwrap(), &[0.0, 1.0, 2.0]);
        assert!(last_row(&[1, 3, 3], &logits).is_err());
        assert!(last_row(&[1, 3], &logits).is_err());
    }

    #[test]
    fn stops_at_eos_without_emitting_it() {
        let script = [(5, 1.0), (7, 2.0), (2, 3.0)];
        let mut calls = 0;
        let out = greedy_decode(PARAMS, None, true, |ids| {
            assert_eq!(ids.len(), calls + 1);
            assert_eq!(ids[0], 0);
            let (t, s) = script[calls];
            calls += 1;
            Ok(peak(10, t, s))
        })
        .unwrap();
        assert_eq!(out.tokens, vec![5, 7]);
        assert_eq!(out.steps.len(), 3);
        assert!(!out.stopped_early);
    }

    #[test]
    fn max_length_counts_the_start_token() {
        let params = DecodeParams { max_length: 4, ..PARAMS };
        let out = greedy_decode(params, None, false, |_| Ok(peak(10, 6, 1.0))).unwrap();
        assert_eq!(out.tokens, vec![6, 6, 6]);
    }

    #[test]
    fn unknown_token_is_never_chosen() {
        let out = greedy_decode(PARAMS, Some(3), false, |ids| {
            let mut row = peak(10, 3, 9.0);
            row[if ids.len() < 3 { 4 } else { 2 }] = 1.0;
            Ok(row)
        })
        .unwrap();
        assert_eq!(out.tokens, vec![4, 4]);
    }

    #[test]
    fn forward_errors_propagate() {
        let err = greedy_decode(PARAMS, None, false, |_| {
            Err(InferenceError::ForwardPass {
                page: 0,
                stage: "decoder",
                detail: "boom".into(),
            })
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn flat_scores_stop_two_steps_after_the_window_fills() {
        let mut stop = RepetitionStop::default();
        let fired: Vec<usize> = (1..=300).filter(|_| stop.push(1.0)).collect();
        // the first window still holds the undefined variance of a single value
        assert_eq!(fired.first(), Some(&202));
    }

    #[test]
    fn varied_scores_never_stop() {
        let mut stop = RepetitionStop::default();
        assert!((0..1000).all(|i| !stop.push(((i * 7919) % 101) as f32)));
    }

    #[test]
    fn looping_generation_is_cut_short() {
        let out = greedy_decode(PARAMS, None, true, |ids| Ok(peak(10, 4 + ids.len() % 3, 1.0))).unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.tokens.len(), 202);
    }

    #[test]
    fn early_stopping_off_runs_to_max_length() {
        let params = DecodeParams { max_length: 300, ..PARAMS };
        let out = greedy_decode(params, None, false, |_| Ok(peak(10, 4, 1.0))).unwrap();
        assert!(!out.stopped_early);
        assert_eq!(out.tokens.len(), 299);
    }

    fn scored(scores: &[f32]) -> Vec<(u32, f32)> {
        scores.iter().map(|&s| (5, s)).collect()
    }

    #[test]
    fn cutoff_lands_where_scores_flatten() {
        let mut scores: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 0.0 } else { 100.0 }).collect();
        scores.extend(std::iter::repeat(50.0).take(300));
        assert_eq!(repeat_cutoff(&scored(&scores), &PARAMS), Some(334));
    }

    #[test]
    fn cutoff_drops_a_page_that_loops_from_the_start() {
        assert_eq!(repeat_cutoff(&scored(&[3.0; 400]), &PARAMS), Some(0));
    }

    #[test]
    fn cutoff_ignores_short_or_varied_sequences() {
        assert_eq!(repeat_cutoff(&scored(&[3.0; 20]), &PARAMS), None);
        let varied: Vec<f32> = (0..600).map(|i| ((i * 7919) % 101) as f32).collect();
        assert_eq!(repeat_cutoff(&scored(&varied), &PARAMS), None);
    }

    #[test]
    fn cutoff_skips_finished_sequences_with_padding() {
        let mut steps = scored(&[3.0; 400]);
        steps[10].0 = PARAMS.pad_token_id;
        steps[11].0 = PARAMS.pad_token_id;
        steps.push((PARAMS.eos_token_id, 3.0));
        assert_eq!(repeat_cutoff(&steps, &PARAMS), None);
    }
}
