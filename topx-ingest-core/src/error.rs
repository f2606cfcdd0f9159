//! Error taxonomy for the ingest pipeline.
//!
//! Every variant is fatal for the current run: the synchroniser performs no
//! local recovery and relies on the remote identifier checks to skip
//! already-committed work on the next run.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed error returned by the remote collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// A container directory has no `<name>.metadata` file next to its contents.
    #[error("missing metadata file {}", path.display())]
    MissingMetadataFile { path: PathBuf },

    #[error("metadata document {} has no <{element}> element", path.display())]
    MetadataMissing {
        path: PathBuf,
        element: &'static str,
    },

    #[error("metadata document {} is not well-formed: {reason}", path.display())]
    MalformedMetadata { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to list directory {}", path.display())]
    Listing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build package {}", path.display())]
    Packaging {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("remote catalog call `{operation}` failed")]
    RemoteCatalog {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("upload of package {package} failed")]
    Transport {
        package: String,
        #[source]
        source: BoxError,
    },
}

impl IngestError {
    pub(crate) fn catalog(operation: &'static str) -> impl FnOnce(BoxError) -> Self {
        move |source| IngestError::RemoteCatalog { operation, source }
    }
}
