//! Locating model, tokenizer and adapter files, on disk or on the Hub.
use hf_hub::{
    api::sync::{Api, ApiRepo},
    Repo, RepoType,
};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::family::SpecialTokens;
use crate::{Error, Result};

/// A model repository, either a local directory or a Hub repo.
pub enum FileSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl FileSource {
    pub fn new(model_id: &str, revision: &str) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        Ok(Self::Hub(api.repo(repo)))
    }

    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} not found", path.display()),
                    )))
                }
            }
            Self::Hub(repo) => Ok(repo.get(filename)?),
        }
    }
}

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Resolves the shards listed in a safetensors index file.
pub fn load_safetensors(source: &FileSource, json_file: &str) -> Result<Vec<PathBuf>> {
    let json_file = source.get(json_file)?;
    let json_file = std::fs::File::open(json_file)?;
    let json: serde_json::Value = serde_json::from_reader(&json_file)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => return Err(Error::Config("weight map is not a map".to_string())),
        None => return Err(Error::Config("no weight map in the index file".to_string())),
    };
    let mut safetensors_files = std::collections::BTreeSet::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            safetensors_files.insert(file.to_string());
        }
    }
    safetensors_files
        .iter()
        .map(|v| source.get(v))
        .collect::<Result<Vec<_>>>()
}

/// Files needed to instantiate a causal language model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn resolve(source: &FileSource) -> Result<Self> {
        let config = source.get("config.json")?;
        let tokenizer = source.get("tokenizer.json")?;
        let tokenizer_config = source.get("tokenizer_config.json").ok();
        // Only a missing index means single-file weights, shard errors propagate.
        let weights = match source.get(SAFETENSORS_INDEX) {
            Ok(_) => load_safetensors(source, SAFETENSORS_INDEX)?,
            Err(err) => {
                tracing::debug!("no sharded weights ({err}), trying model.safetensors");
                vec![source.get("model.safetensors")?]
            }
        };
        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

/// Files of a PEFT LoRA adapter.
#[derive(Debug, Clone)]
pub struct AdapterFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
}

impl AdapterFiles {
    pub fn resolve(source: &FileSource) -> Result<Self> {
        Ok(Self {
            config: source.get("adapter_config.json")?,
            weights: source.get("adapter_model.safetensors")?,
        })
    }
}

pub fn read_json(path: &Path) -> Result<serde_json::Value> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

// Special tokens are either plain strings or `{"content": ...}` objects.
fn token_content(value: Option<&serde_json::Value>) -> Option<&str> {
    match value? {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map.get("content").and_then(|c| c.as_str()),
        _ => None,
    }
}

fn first_id(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as u32),
        serde_json::Value::Array(ids) => ids.first().and_then(|n| n.as_u64()).map(|n| n as u32),
        _ => None,
    }
}

/// Finds the eos and pad ids, preferring `tokenizer_config.json` and falling
/// back on the model config for eos.
pub fn special_tokens(
    tokenizer: &Tokenizer,
    tokenizer_config: Option<&serde_json::Value>,
    config: &serde_json::Value,
) -> Result<SpecialTokens> {
    let lookup = |key: &str| {
        tokenizer_config
            .and_then(|c| token_content(c.get(key)))
            .and_then(|content| tokenizer.token_to_id(content))
    };
    let eos = lookup("eos_token")
        .or_else(|| first_id(config.get("eos_token_id")))
        .ok_or_else(|| Error::Config("cannot determine the eos token".to_string()))?;
    let pad = lookup("pad_token").or_else(|| first_id(config.get("pad_token_id")));
    Ok(SpecialTokens { eos, pad })
}
