//! Checkpoint resolution: turn a reference into local file paths.
//!
//! A checkpoint is either a local directory or a Hugging Face Hub
//! repository holding an ONNX export of a Nougat model:
//!
//! ```text
//! config.json
//! preprocessor_config.json
//! generation_config.json      (optional)
//! tokenizer.json
//! onnx/encoder_model.onnx     (or encoder_model.onnx at the root)
//! onnx/decoder_model_merged.onnx
//!                             (KV-cache decoder; falls back to decoder_model.onnx,
//!                              in onnx/ or at the root)
//! ```
//!
//! Hub files are downloaded once and cached by `hf-hub` under `HF_HOME`.

use crate::error::LoadError;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";
const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const GENERATION_FILE: &str = "generation_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const ENCODER_CANDIDATES: [&str; 2] = ["onnx/encoder_model.onnx", "encoder_model.onnx"];
const DECODER_CANDIDATES: [&str; 4] = [
    "onnx/decoder_model_merged.onnx",
    "decoder_model_merged.onnx",
    "onnx/decoder_model.onnx",
    "decoder_model.onnx",
];

static RE_HUB_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][\w.-]*/[A-Za-z0-9][\w.-]*)(?:@([\w./-]+))?$").unwrap()
});

/// Where a checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    Local(PathBuf),
    Hub {
        repo: String,
        revision: Option<String>,
    },
}

impl CheckpointRef {
    /// Classify a reference without touching the network.
    ///
    /// An existing directory always wins; otherwise the reference must look
    /// like `org/name` or `org/name@revision`.
    pub fn parse(reference: &str) -> Result<Self, LoadError> {
        let path = Path::new(reference);
        if path.is_dir() {
            return Ok(CheckpointRef::Local(path.to_path_buf()));
        }

        match RE_HUB_ID.captures(reference.trim()) {
            Some(caps) if !path.is_absolute() => Ok(CheckpointRef::Hub {
                repo: caps[1].to_string(),
                revision: caps.get(2).map(|m| m.as_str().to_string()),
            }),
            _ => Err(LoadError::CheckpointNotFound {
                reference: reference.to_string(),
            }),
        }
    }

    /// Fetch (if remote) and locate every file the model needs.
    pub fn resolve(&self) -> Result<CheckpointFiles, LoadError> {
        match self {
            CheckpointRef::Local(dir) => resolve_local(dir),
            CheckpointRef::Hub { repo, revision } => resolve_hub(repo, revision.as_deref()),
        }
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointRef::Local(p) => write!(f, "{}", p.display()),
            CheckpointRef::Hub { repo, revision: None } => write!(f, "{repo}"),
            CheckpointRef::Hub {
                repo,
                revision: Some(rev),
            } => write!(f, "{repo}@{rev}"),
        }
    }
}

/// Local paths of every checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub preprocessor_config: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub tokenizer: PathBuf,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
}

fn resolve_local(dir: &Path) -> Result<CheckpointFiles, LoadError> {
    let checkpoint = dir.display().to_string();
    let required = |file: &str| -> Result<PathBuf, LoadError> {
        let p = dir.join(file);
        if p.is_file() {
            Ok(p)
        } else {
            Err(LoadError::MissingFile {
                checkpoint: checkpoint.clone(),
                file: file.to_string(),
            })
        }
    };
    let first_of = |candidates: &[&str]| -> Result<PathBuf, LoadError> {
        candidates
            .iter()
            .map(|c| dir.join(c))
            .find(|p| p.is_file())
            .ok_or_else(|| LoadError::MissingFile {
                checkpoint: checkpoint.clone(),
                file: candidates[0].to_string(),
            })
    };

    let generation = dir.join(GENERATION_FILE);
    let files = CheckpointFiles {
        config: required(CONFIG_FILE)?,
        preprocessor_config: required(PREPROCESSOR_FILE)?,
        generation_config: generation.is_file().then_some(generation),
        tokenizer: required(TOKENIZER_FILE)?,
        encoder: first_of(&ENCODER_CANDIDATES)?,
        decoder: first_of(&DECODER_CANDIDATES)?,
    };
    debug!("Resolved local checkpoint: {:?}", files);
    Ok(files)
}

fn resolve_hub(repo_id: &str, revision: Option<&str>) -> Result<CheckpointFiles, LoadError> {
    info!("Fetching checkpoint '{}' from the Hugging Face Hub", repo_id);

    let api = ApiBuilder::new()
        .with_progress(false)
        .build()
        .map_err(|e| LoadError::DownloadFailed {
            repo: repo_id.to_string(),
            file: String::new(),
            reason: e.to_string(),
        })?;
    let repo = match revision {
        Some(rev) => api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(repo_id.to_string()),
    };

    let get = |file: &str| -> Result<PathBuf, LoadError> {
        repo.get(file).map_err(|e| LoadError::DownloadFailed {
            repo: repo_id.to_string(),
            file: file.to_string(),
            reason: e.to_string(),
        })
    };

    Ok(CheckpointFiles {
        config: get(CONFIG_FILE)?,
        preprocessor_config: get(PREPROCESSOR_FILE)?,
        generation_config: repo.get(GENERATION_FILE).ok(),
        tokenizer: get(TOKENIZER_FILE)?,
        encoder: first_available(&repo, repo_id, &ENCODER_CANDIDATES)?,
        decoder: first_available(&repo, repo_id, &DECODER_CANDIDATES)?,
    })
}

fn first_available(repo: &ApiRepo, repo_id: &str, candidates: &[&str]) -> Result<PathBuf, LoadError> {
    let mut last_reason = String::new();
    for candidate in candidates {
        match repo.get(candidate) {
            Ok(path) => return Ok(path),
            Err(e) => {
                debug!("'{}' not available in {}: {}", candidate, repo_id, e);
                last_reason = e.to_string();
            }
        }
    }
    Err(LoadError::DownloadFailed {
        repo: repo_id.to_string(),
        file: candidates[0].to_string(),
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, file: &str) {
        let p = dir.join(file);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"{}").unwrap();
    }

    #[test]
    fn hub_ids_are_recognised() {
        assert_eq!(
            CheckpointRef::parse("Xenova/nougat-small").unwrap(),
            CheckpointRef::Hub {
                repo: "Xenova/nougat-small".into(),
                revision: None
            }
        );
        assert_eq!(
            CheckpointRef::parse("facebook/nougat-base@refs/pr/3").unwrap(),
            CheckpointRef::Hub {
                repo: "facebook/nougat-base".into(),
                revision: Some("refs/pr/3".into())
            }
        );
    }

    #[test]
    fn paths_that_do_not_exist_are_not_found() {
        for bad in ["/definitely/not/here", "a/b/c", "", "no-slash", "./x/y"] {
            let err = CheckpointRef::parse(bad).unwrap_err();
            assert!(
                matches!(err, LoadError::CheckpointNotFound { .. }),
                "{bad:?} → {err:?}"
            );
        }
    }

    #[test]
    fn existing_directory_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let r = CheckpointRef::parse(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(r, CheckpointRef::Local(dir.path().to_path_buf()));
        assert_eq!(r.to_string(), dir.path().display().to_string());
    }

    #[test]
    fn local_layout_prefers_onnx_subdir() {
        let dir = tempfile::tempdir().unwrap();
        for f in [
            CONFIG_FILE,
            PREPROCESSOR_FILE,
            TOKENIZER_FILE,
            "onnx/encoder_model.onnx",
            "encoder_model.onnx",
            "decoder_model.onnx",
        ] {
            touch(dir.path(), f);
        }

        let files = resolve_local(dir.path()).unwrap();
        assert!(files.encoder.ends_with("onnx/encoder_model.onnx"));
        assert!(files.decoder.ends_with("decoder_model.onnx"));
        assert!(files.generation_config.is_none());
    }

    #[test]
    fn local_layout_prefers_cached_decoder() {
        let dir = tempfile::tempdir().unwrap();
        for f in [
            CONFIG_FILE,
            PREPROCESSOR_FILE,
            TOKENIZER_FILE,
            "onnx/encoder_model.onnx",
            "onnx/decoder_model.onnx",
            "onnx/decoder_model_merged.onnx",
        ] {
            touch(dir.path(), f);
        }

        let files = resolve_local(dir.path()).unwrap();
        assert!(files.decoder.ends_with("onnx/decoder_model_merged.onnx"));
    }

    #[test]
    fn local_layout_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        match resolve_local(dir.path()).unwrap_err() {
            LoadError::MissingFile { file, .. } => assert_eq!(file, PREPROCESSOR_FILE),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hub_display_includes_revision() {
        let r = CheckpointRef::Hub {
            repo: "org/model".into(),
            revision: Some("main".into()),
        };
        assert_eq!(r.to_string(), "org/model@main");
    }
}
