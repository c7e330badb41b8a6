use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum UnmarkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Transform error: {0}")]
    Transform(#[from] crate::transform::TransformError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Input rejected before a job is admitted.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("Batch contains no jobs")]
    EmptyBatch,

    #[error("Input file '{0}' does not exist")]
    MissingInput(PathBuf),

    #[error("Input '{path}' is not a video (detected {detected})")]
    NotAVideo { path: PathBuf, detected: String },

    #[error("Output path '{0}' must differ from the input path")]
    OutputIsInput(PathBuf),

    #[error("Job {0} does not exist")]
    UnknownJob(JobId),

    #[error("Job {id} is {status}, expected {expected}")]
    WrongStatus {
        id: JobId,
        status: String,
        expected: &'static str,
    },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Failed to prepare working directory '{path}': {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("No job ids provided")]
    Empty,

    #[error("At most {max} videos can be bundled, got {requested}")]
    TooMany { max: usize, requested: usize },

    #[error("Job {0} does not exist")]
    UnknownJob(JobId),

    #[error("Job {id} is not finished yet: {status}")]
    NotFinished { id: JobId, status: String },

    #[error("Output file for job {0} does not exist")]
    MissingOutput(JobId),

    #[error("Failed to write archive '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type Result<T> = std::result::Result<T, UnmarkError>;
