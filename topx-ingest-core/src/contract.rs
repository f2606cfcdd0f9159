//! # contract: interfaces to the preservation repository
//!
//! The synchroniser talks to the outside world through two traits:
//!
//! - [`RemoteCatalog`]: look up, create and annotate containers (folders) in the
//!   repository's entity model.
//! - [`Transport`]: move a zip package into the repository, either directly or
//!   through an object-storage staging bucket.
//!
//! Both are async and return boxed errors. An implementation that knows an error
//! will not go away on retry (bad credentials, a rejected request) should wrap it
//! in [`PermanentError`] so the [`crate::retry::Retrying`] decorator gives up at once.
//!
//! ## Mocking & Testing
//! - Both traits are annotated for `mockall`; `MockRemoteCatalog` and
//!   `MockTransport` are exported under the `test-export-mocks` feature.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::Serialize;

use crate::error::BoxError;

/// Opaque handle of a remote container, usable as the parent of a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContainerRef(pub String);

impl ContainerRef {
    pub fn new(reference: impl Into<String>) -> Self {
        ContainerRef(reference.into())
    }

    /// A fresh random (v4 UUID) reference for a folder about to be created.
    pub fn generate() -> Self {
        ContainerRef(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An object as the repository reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntity {
    pub reference: ContainerRef,
    pub title: String,
    /// Repository entity type code, e.g. `SO` for a structural object (folder).
    pub entity_type: String,
}

/// Request to create a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContainer {
    /// Reference the new folder will carry. Chosen once by the caller so a
    /// replayed request names the same folder and can be detected.
    pub reference: ContainerRef,
    pub title: String,
    pub description: String,
    pub security_tag: String,
    /// `None` creates the folder at the repository root.
    pub parent: Option<ContainerRef>,
}

/// Progress report for one package upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub package_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u64 {
        if self.total_bytes == 0 {
            return 100;
        }
        self.bytes_transferred.saturating_mul(100) / self.total_bytes
    }
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Marks an error that retrying will not fix.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PermanentError(pub String);

impl PermanentError {
    pub fn boxed(message: impl Into<String>) -> BoxError {
        Box::new(PermanentError(message.into()))
    }
}

/// Returns true when `error` is, or wraps at its top level, a [`PermanentError`].
pub fn is_permanent(error: &BoxError) -> bool {
    error.downcast_ref::<PermanentError>().is_some()
}

/// Entity-model operations the synchroniser needs from the repository.
///
/// Every call may block on the network; failures are fatal for the run.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// All entities carrying identifier `scheme` = `value`, in catalog order.
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<RemoteEntity>, BoxError>;

    /// Fetch a folder by reference; fails when it does not exist.
    async fn fetch_container(&self, reference: &ContainerRef) -> Result<RemoteEntity, BoxError>;

    /// Create a folder under `request.reference`. Fetching that reference
    /// afterwards must find it.
    async fn create_container(&self, request: NewContainer) -> Result<RemoteEntity, BoxError>;

    async fn attach_identifier(
        &self,
        entity: &RemoteEntity,
        scheme: &str,
        value: &str,
    ) -> Result<(), BoxError>;

    /// Attach `document` under `schema_uri`; returns the possibly-updated entity.
    async fn attach_metadata(
        &self,
        entity: &RemoteEntity,
        schema_uri: &str,
        document: Vec<u8>,
    ) -> Result<RemoteEntity, BoxError>;

    /// The handle to pass as `parent` when creating children of `entity`.
    fn reference(&self, entity: &RemoteEntity) -> ContainerRef;
}

/// Package upload paths into the repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload straight into the repository's ingest endpoint.
    async fn upload_direct(
        &self,
        package: &Path,
        destination: &ContainerRef,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError>;

    /// Upload through the object-storage bucket `bucket`, for large packages.
    async fn upload_via_staging(
        &self,
        package: &Path,
        destination: &ContainerRef,
        bucket: &str,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError>;
}
