use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("train data request timed out")]
    Timeout,
    #[error("train data request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("train data endpoint answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed train data payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("train data request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum AdvisorError {
    #[error("no advisor configured")]
    Unavailable,
    #[error("advisor request timed out")]
    Timeout,
    #[error("advisor request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("advisor endpoint answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("could not build advisor prompt: {0}")]
    Prompt(#[from] std::fmt::Error),
    #[error("advisor response contained no JSON object")]
    NoJsonObject,
    #[error("advisor response is not a valid schedule: {0}")]
    InvalidSchedule(#[source] serde_json::Error),
    #[error("advisor request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for AdvisorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdvisorError::Timeout
        } else {
            AdvisorError::Http(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("results request timed out")]
    Timeout,
    #[error("results request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("results endpoint answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("I/O error accessing path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not serialize schedule: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PersistError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PersistError::Timeout
        } else {
            PersistError::Http(e)
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetworkError {
    #[error("section '{0}' is defined more than once")]
    DuplicateSection(String),
    #[error("section '{section}' lists unknown successor '{successor}'")]
    UnknownSuccessor { section: String, successor: String },
    #[error("section '{0}' has zero capacity")]
    ZeroCapacity(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("the engine must be created inside a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
