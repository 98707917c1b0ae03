use serde::{Deserialize, Serialize};

/// Failure classes reported back to the caller in `error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or unusable process configuration, e.g. no registry token.
    Configuration,
    /// The job input itself was rejected.
    Validation,
    /// A device or remote resource was unavailable.
    Resource,
    /// Anything raised while constructing the model or generating.
    Runtime,
}

serde_plain::derive_display_from_serialize!(ErrorKind);

impl ErrorKind {
    /// Classifies an arbitrary failure. Errors that did not originate in this
    /// crate come from the model library and count as runtime errors.
    pub fn of(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<Error>())
            .map(Error::kind)
            .unwrap_or(ErrorKind::Runtime)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} environment variable not set. Please add it to your endpoint configuration.")]
    MissingCredential(&'static str),

    #[error("No prompt provided")]
    EmptyPrompt,

    #[error("invalid job input: {0}")]
    MalformedInput(#[from] serde_json::Error),

    #[error("no compatible GPU device available (requested {0:?})")]
    NoGpu(crate::DeviceMap),

    #[error("failed to fetch `{file}` from `{repo}`")]
    Fetch {
        repo: String,
        file: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("local model at `{0}` is incomplete")]
    IncompleteModel(std::path::PathBuf),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingCredential(_) => ErrorKind::Configuration,
            Error::EmptyPrompt | Error::MalformedInput(_) => ErrorKind::Validation,
            Error::NoGpu(_) | Error::Fetch { .. } => ErrorKind::Resource,
            Error::IncompleteModel(_) => ErrorKind::Runtime,
        }
    }
}
