use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::IngestError;

/// Schema URI under which ToPX documents are attached to containers.
pub const TOPX_SCHEMA_URI: &str = "http://www.nationaalarchief.nl/ToPX/v2.3";
/// Identifier scheme holding a container's business identifier.
pub const CONTAINER_IDENTIFIER_SCHEME: &str = "identificatiekenmerk";
/// Identifier scheme the repository assigns to ingested record folders.
pub const RECORD_IDENTIFIER_SCHEME: &str = "code";
pub const DEFAULT_STAGING_THRESHOLD_MIB: u64 = 256;
pub const METADATA_EXTENSION: &str = "metadata";

fn default_staging_threshold_mib() -> u64 {
    DEFAULT_STAGING_THRESHOLD_MIB
}

/// Everything the synchroniser needs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchroniseConfig {
    /// Reference of the repository folder to ingest beneath; `None` means the root.
    #[serde(default)]
    pub parent_folder: Option<String>,
    pub security_tag: String,
    /// Directory holding the archief folders.
    pub data_folder: PathBuf,
    pub group_size: usize,
    /// Object-storage bucket for staged uploads.
    pub bucket: String,
    /// Packages strictly larger than this (in whole MiB) go through the bucket.
    #[serde(default = "default_staging_threshold_mib")]
    pub staging_threshold_mib: u64,
    /// Where packages are written; defaults to the dossier directory.
    #[serde(default)]
    pub package_dir: Option<PathBuf>,
}

impl SynchroniseConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.group_size == 0 {
            return Err(IngestError::InvalidConfiguration(
                "group_size must be a positive integer".to_string(),
            ));
        }
        if self.staging_threshold_mib == 0 {
            return Err(IngestError::InvalidConfiguration(
                "staging_threshold_mib must be a positive integer".to_string(),
            ));
        }
        if self.security_tag.trim().is_empty() {
            return Err(IngestError::InvalidConfiguration(
                "security_tag must not be empty".to_string(),
            ));
        }
        if self.bucket.trim().is_empty() {
            return Err(IngestError::InvalidConfiguration(
                "bucket must not be empty".to_string(),
            ));
        }
        if matches!(&self.parent_folder, Some(p) if p.trim().is_empty()) {
            return Err(IngestError::InvalidConfiguration(
                "parent_folder must be omitted or a non-empty reference".to_string(),
            ));
        }
        if let Some(dir) = &self.package_dir {
            if !dir.is_dir() {
                return Err(IngestError::InvalidConfiguration(format!(
                    "package_dir {} must be an existing directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            data_folder = %self.data_folder.display(),
            parent_folder = self.parent_folder.as_deref().unwrap_or("<root>"),
            group_size = self.group_size,
            bucket = %self.bucket,
            staging_threshold_mib = self.staging_threshold_mib,
            "Loaded SynchroniseConfig"
        );
        debug!(?self, "SynchroniseConfig loaded (full debug)");
    }
}
