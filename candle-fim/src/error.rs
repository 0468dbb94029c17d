/// Errors raised while preparing or running a generation job.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error("IoError : {0}")]
    Io(#[from] std::io::Error),

    #[error("JsonError : {0}")]
    Json(#[from] serde_json::Error),

    #[error("ApiError : {0}")]
    Api(#[from] hf_hub::api::sync::ApiError),

    #[error("ParquetError : {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The masked snippet does not contain exactly one fill marker.
    #[error("expected exactly one fill marker in the masked snippet, found {found}")]
    FillMarker { found: usize },

    #[error("row {row} has no value for column `{column}`")]
    MissingColumn { row: usize, column: &'static str },

    #[error("generation error: {0}")]
    Generation(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("unsupported configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
