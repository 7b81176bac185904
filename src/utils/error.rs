use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed to process a message: {message}")]
    ProcessingError { stage: String, message: String },

    #[error("Pipeline faulted: {message}")]
    Faulted { message: String },

    #[error("Stage '{stage}' no longer accepts messages")]
    SendAfterCompletion { stage: String },

    #[error("Stage '{stage}' aborted: {message}")]
    StageAborted { stage: String, message: String },

    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },
}

/// 錯誤分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 呼叫端或實作錯誤，不應重試
    ProgrammerError,
    /// 由上游階段傳遞而來的失敗
    Propagated,
    Configuration,
    Io,
}

impl PipelineError {
    /// 建立一個由呼叫端主動觸發的故障
    pub fn faulted(message: impl Into<String>) -> Self {
        Self::Faulted {
            message: message.into(),
        }
    }

    pub fn processing(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ProcessingError {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SendAfterCompletion { .. } | Self::StageAborted { .. } => {
                ErrorCategory::ProgrammerError
            }
            Self::ProcessingError { .. } | Self::Faulted { .. } => ErrorCategory::Propagated,
            Self::ConfigError { .. } | Self::InvalidConfigValueError { .. } => {
                ErrorCategory::Configuration
            }
            Self::IoError(_) => ErrorCategory::Io,
        }
    }

    pub fn is_programmer_error(&self) -> bool {
        self.category() == ErrorCategory::ProgrammerError
    }

    /// 給使用者的修復建議
    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::ProgrammerError => {
                "Check that messages are not sent after complete() and that custom stages keep message identity intact"
            }
            ErrorCategory::Propagated => "Inspect the failing stage named in the error",
            ErrorCategory::Configuration => "Fix the configuration value and try again",
            ErrorCategory::Io => "Check that the file exists and is readable",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        Self::IoError(Arc::new(error))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = PipelineError::SendAfterCompletion {
            stage: "buffer-1".to_string(),
        };
        assert!(err.is_programmer_error());
        assert_eq!(err.to_string(), "Stage 'buffer-1' no longer accepts messages");

        let err = PipelineError::processing("transform-2", "bad input");
        assert_eq!(err.category(), ErrorCategory::Propagated);
        assert!(err.to_string().contains("bad input"));

        let err: PipelineError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.category(), ErrorCategory::Io);
    }
}
