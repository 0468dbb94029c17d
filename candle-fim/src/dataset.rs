//! Dataset rows, read from the Hub parquet conversion or from local files.
use hf_hub::{
    api::sync::{Api, ApiRepo},
    Repo, RepoType,
};
use parquet::file::reader::SerializedFileReader;
use parquet::record::{Field, Row};
use std::fs::File;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::family::ModelFamily;
use crate::{Error, Result};

/// One masked contract, optionally with earlier generations for it.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ContractRow {
    pub masked_contract: String,
    #[serde(default)]
    pub deepseek_output: Option<String>,
    // Published datasets spell this column `codellama_ouput`.
    #[serde(default, alias = "codellama_ouput")]
    pub codellama_output: Option<String>,
}

impl ContractRow {
    pub fn prior_output(&self, family: ModelFamily) -> Option<&str> {
        match family {
            ModelFamily::DeepSeek => self.deepseek_output.as_deref(),
            ModelFamily::CodeLlama => self.codellama_output.as_deref(),
        }
    }
}

/// Where rows come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSource {
    Hub { dataset_id: String, split: String },
    Local(PathBuf),
}

impl DatasetSource {
    /// An existing file path is read locally, anything else is a Hub dataset id.
    pub fn new(dataset_id: &str, split: &str) -> Self {
        let path = Path::new(dataset_id);
        if path.is_file() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub {
                dataset_id: dataset_id.to_string(),
                split: split.to_string(),
            }
        }
    }

    pub fn load(&self) -> Result<Vec<ContractRow>> {
        match self {
            Self::Hub { dataset_id, split } => from_hub(&Api::new()?, dataset_id, split),
            Self::Local(path) => from_file(path),
        }
    }
}

impl std::fmt::Display for DatasetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub { dataset_id, split } => write!(f, "{dataset_id} [{split}]"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Whether a file of the parquet conversion belongs to `split`.
///
/// Recognized layouts: `<config>/<split>/0000.parquet`,
/// `<config>/partial-<split>/0000.parquet` for truncated conversions of large
/// datasets, and the older `<config>/<name>-<split>[-00000-of-00001].parquet`.
pub fn is_split_file(rfilename: &str, split: &str) -> bool {
    let Some(stem) = rfilename.strip_suffix(".parquet") else {
        return false;
    };
    let (dir, file) = match stem.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", stem),
    };
    if let Some(last) = dir.rsplit('/').next() {
        if last == split || last.strip_prefix("partial-") == Some(split) {
            return true;
        }
    }
    if file == split || file.ends_with(&format!("-{split}")) {
        return true;
    }
    let needle = format!("-{split}-");
    match file.rfind(&needle) {
        Some(idx) => {
            let shard = &file[idx + needle.len()..];
            match shard.split_once("-of-") {
                Some((i, n)) => {
                    !i.is_empty()
                        && !n.is_empty()
                        && i.chars().all(|c| c.is_ascii_digit())
                        && n.chars().all(|c| c.is_ascii_digit())
                }
                None => false,
            }
        }
        None => false,
    }
}

fn sibling_to_parquet(rfilename: &str, repo: &ApiRepo) -> Result<SerializedFileReader<File>> {
    let local = repo.get(rfilename)?;
    let file = File::open(local)?;
    let reader = SerializedFileReader::new(file)?;
    Ok(reader)
}

pub fn from_hub(api: &Api, dataset_id: &str, split: &str) -> Result<Vec<ContractRow>> {
    let repo = Repo::with_revision(
        dataset_id.to_string(),
        RepoType::Dataset,
        "refs/convert/parquet".to_string(),
    );
    let repo = api.repo(repo);
    let info = repo.info()?;

    let mut filenames: Vec<String> = info
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .filter(|f| is_split_file(f, split))
        .collect();
    filenames.sort();
    if filenames.is_empty() {
        return Err(Error::Dataset(format!(
            "no parquet files for split `{split}` in {dataset_id}"
        )));
    }
    tracing::debug!(?filenames, "dataset shards");

    let mut rows = Vec::new();
    for filename in filenames.iter() {
        let reader = sibling_to_parquet(filename, &repo)?;
        read_parquet(reader, &mut rows)?;
    }
    Ok(rows)
}

fn read_parquet(reader: SerializedFileReader<File>, rows: &mut Vec<ContractRow>) -> Result<()> {
    for row in reader {
        let index = rows.len();
        rows.push(row_from_parquet(index, &row?)?);
    }
    Ok(())
}

fn field_to_string(field: &Field) -> Option<String> {
    match field {
        Field::Null => None,
        Field::Str(value) => Some(value.clone()),
        other => Some(other.to_string()),
    }
}

fn row_from_parquet(index: usize, row: &Row) -> Result<ContractRow> {
    let mut masked_contract = None;
    let mut out = ContractRow::default();
    for (name, field) in row.get_column_iter() {
        match name.as_str() {
            "masked_contract" => masked_contract = field_to_string(field),
            "deepseek_output" => out.deepseek_output = field_to_string(field),
            "codellama_output" | "codellama_ouput" => {
                out.codellama_output = field_to_string(field)
            }
            _ => {}
        }
    }
    out.masked_contract = masked_contract.ok_or(Error::MissingColumn {
        row: index,
        column: "masked_contract",
    })?;
    Ok(out)
}

/// Reads `.jsonl`, `.json` (an array of rows) or `.parquet` files.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vec<ContractRow>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => {
            let reader = std::io::BufReader::new(File::open(path)?);
            let mut rows = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                rows.push(serde_json::from_str(&line)?);
            }
            Ok(rows)
        }
        Some("json") => {
            let reader = std::io::BufReader::new(File::open(path)?);
            Ok(serde_json::from_reader(reader)?)
        }
        Some("parquet") => {
            let reader = SerializedFileReader::new(File::open(path)?)?;
            let mut rows = Vec::new();
            read_parquet(reader, &mut rows)?;
            Ok(rows)
        }
        _ => Err(Error::Dataset(format!(
            "unsupported dataset file {}, expected .jsonl, .json or .parquet",
            path.display()
        ))),
    }
}
