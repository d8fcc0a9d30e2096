pub mod config;

pub type Result<T> = core::result::Result<T, SimError>;

#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("model \"{0}\" does not exist")]
    UnknownModel(String),
    #[error("{message}")]
    Validation {
        message: String,
        param: Option<String>,
    },
    #[error("tool call generation failed: {0}")]
    ToolSynthesis(String),
    #[error("dataset: {0}")]
    Dataset(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

impl SimError {
    pub fn validation(message: impl Into<String>) -> Self {
        SimError::Validation {
            message: message.into(),
            param: None,
        }
    }

    pub fn validation_param(message: impl Into<String>, param: impl Into<String>) -> Self {
        SimError::Validation {
            message: message.into(),
            param: Some(param.into()),
        }
    }
}
