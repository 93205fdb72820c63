use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream error (status {status}): {body}")]
    Upstream {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no provider registered for model {0:?}")]
    NoProvider(String),
    #[error("stage {stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ProxyError>,
    },
    #[error("pipeline completed without producing a response")]
    NoProducer,
    #[error("stream cancelled")]
    Cancelled,
    #[error("stream closed by client")]
    StreamClosed,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
}

impl ProxyError {
    /// Wraps an error with the name of the pipeline stage it came from.
    pub fn in_stage(self, stage: &'static str) -> Self {
        ProxyError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Walks the stage-wrapping chain down to the underlying error.
    pub fn root(&self) -> &ProxyError {
        match self {
            ProxyError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
