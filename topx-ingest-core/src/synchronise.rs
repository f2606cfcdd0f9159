//! High-level pipeline: mirrors an archief → serie → dossier tree into the repository
//! and uploads the record folders beneath each dossier as batched zip packages.
//!
//! # Responsibilities
//! - Walk the data folder three container levels deep; every container directory
//!   must carry a `<name>/<name>.metadata` ToPX document.
//! - Reuse a remote container when one already carries the directory's business
//!   identifier (`identificatiekenmerk`), otherwise create it, tag it and attach
//!   its metadata.
//! - Batch the record folders of each dossier, drop the ones the repository
//!   already knows (identifier `code` = folder name), package the rest and route
//!   each package by size.
//!
//! # Idempotency
//! There is no local checkpoint. A run that fails halfway leaves its completed
//! steps in the repository; the next run finds them through the identifier
//! lookups and skips them.
//!
//! # Error Handling
//! Fail-fast: the first error aborts the run and is returned with the directory
//! or call that caused it.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Supporting types: [`ContainerDescriptor`], [`SynchroniseReport`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::{batch_count, partition};
use crate::config::{
    SynchroniseConfig, CONTAINER_IDENTIFIER_SCHEME, METADATA_EXTENSION, RECORD_IDENTIFIER_SCHEME,
    TOPX_SCHEMA_URI,
};
use crate::contract::{
    ContainerRef, NewContainer, ProgressCallback, RemoteCatalog, RemoteEntity, Transport,
    UploadProgress,
};
use crate::error::IngestError;
use crate::metadata::extract_level;
use crate::package::{build_package, Package, MIB};

/// The three nested container kinds, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerLevel {
    Archief,
    Serie,
    Dossier,
}

impl ContainerLevel {
    /// Directory depth below the data folder.
    pub fn depth(self) -> usize {
        match self {
            ContainerLevel::Archief => 1,
            ContainerLevel::Serie => 2,
            ContainerLevel::Dossier => 3,
        }
    }
}

impl fmt::Display for ContainerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContainerLevel::Archief => "Archief",
            ContainerLevel::Serie => "Serie",
            ContainerLevel::Dossier => "Dossier",
        };
        f.write_str(label)
    }
}

/// A container directory resolved to a remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDescriptor {
    /// Directory basename.
    pub name: String,
    pub business_identifier: String,
    /// `aggregatieniveau` as written in the metadata; informational only.
    pub aggregation_level: String,
    pub level: ContainerLevel,
    pub reference: ContainerRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerOutcome {
    Created,
    Reused,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    #[serde(flatten)]
    pub descriptor: ContainerDescriptor,
    pub outcome: ContainerOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadRoute {
    Direct,
    Staged,
}

/// Picks the transport for a package of `size_bytes`.
///
/// The size is floored to whole MiB and compared strictly: a package of exactly
/// `threshold_mib` still goes direct.
pub fn select_route(size_bytes: u64, threshold_mib: u64) -> UploadRoute {
    if size_bytes / MIB > threshold_mib {
        UploadRoute::Staged
    } else {
        UploadRoute::Direct
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub file_name: String,
    pub members: Vec<String>,
    pub size_bytes: u64,
    pub route: UploadRoute,
    pub destination: ContainerRef,
}

/// What a run did, for the CLI summary and for tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SynchroniseReport {
    pub containers: Vec<ContainerReport>,
    pub packages: Vec<PackageReport>,
    /// Record folders skipped because the repository already holds them.
    pub skipped_folders: Vec<String>,
    /// Batches skipped entirely because every member was already present.
    pub skipped_batches: usize,
}

impl SynchroniseReport {
    pub fn containers_created(&self) -> usize {
        self.count_outcome(ContainerOutcome::Created)
    }

    pub fn containers_reused(&self) -> usize {
        self.count_outcome(ContainerOutcome::Reused)
    }

    fn count_outcome(&self, outcome: ContainerOutcome) -> usize {
        self.containers
            .iter()
            .filter(|c| c.outcome == outcome)
            .count()
    }
}

/// Runs one full synchronisation of `config.data_folder` into the repository.
pub async fn synchronise<C, T>(
    config: &SynchroniseConfig,
    catalog: &C,
    transport: &T,
) -> Result<SynchroniseReport, IngestError>
where
    C: RemoteCatalog,
    T: Transport,
{
    config.validate()?;
    HierarchySynchroniser {
        config,
        catalog,
        transport,
        report: SynchroniseReport::default(),
    }
    .run()
    .await
}

struct HierarchySynchroniser<'a, C, T> {
    config: &'a SynchroniseConfig,
    catalog: &'a C,
    transport: &'a T,
    report: SynchroniseReport,
}

impl<C, T> HierarchySynchroniser<'_, C, T>
where
    C: RemoteCatalog,
    T: Transport,
{
    async fn run(mut self) -> Result<SynchroniseReport, IngestError> {
        info!("[SYNC] Starting hierarchy synchronisation");
        let root = self.resolve_root().await?;
        match &root {
            Some(parent) => info!(parent = %parent, "[SYNC] Packages will be ingested into parent folder"),
            None => info!("[SYNC] Packages will be ingested into the repository root"),
        }
        info!(
            data_folder = %self.config.data_folder.display(),
            "[SYNC] Packages will be created from folders in data folder"
        );

        let data_folder = self.config.data_folder.clone();
        for archief_name in list_subdirectories(&data_folder)? {
            let archief = self
                .realise_container(ContainerLevel::Archief, &data_folder, &archief_name, root.as_ref())
                .await?;
            let archief_dir = data_folder.join(&archief_name);

            for serie_name in list_subdirectories(&archief_dir)? {
                let serie = self
                    .realise_container(
                        ContainerLevel::Serie,
                        &archief_dir,
                        &serie_name,
                        Some(&archief.reference),
                    )
                    .await?;
                let serie_dir = archief_dir.join(&serie_name);

                for dossier_name in list_subdirectories(&serie_dir)? {
                    let dossier = self
                        .realise_container(
                            ContainerLevel::Dossier,
                            &serie_dir,
                            &dossier_name,
                            Some(&serie.reference),
                        )
                        .await?;
                    self.ingest_dossier(&serie_dir.join(&dossier_name), &dossier)
                        .await?;
                }
            }
        }

        info!(
            containers_created = self.report.containers_created(),
            containers_reused = self.report.containers_reused(),
            packages = self.report.packages.len(),
            skipped_folders = self.report.skipped_folders.len(),
            "[SYNC] Synchronisation complete"
        );
        Ok(self.report)
    }

    async fn resolve_root(&self) -> Result<Option<ContainerRef>, IngestError> {
        let Some(parent) = &self.config.parent_folder else {
            return Ok(None);
        };
        let entity = self
            .catalog
            .fetch_container(&ContainerRef::new(parent.as_str()))
            .await
            .map_err(|e| {
                error!(parent = %parent, error = %e, "[SYNC][ERROR] Parent folder could not be fetched");
                IngestError::catalog("fetch_container")(e)
            })?;
        Ok(Some(self.catalog.reference(&entity)))
    }

    /// Finds or creates the remote folder for `parent_dir/name`.
    async fn realise_container(
        &mut self,
        level: ContainerLevel,
        parent_dir: &Path,
        name: &str,
        parent: Option<&ContainerRef>,
    ) -> Result<ContainerDescriptor, IngestError> {
        info!(level = %level, depth = level.depth(), folder = %name, "[SYNC] Found {level} folder");
        let metadata_path = metadata_path(parent_dir, name);
        if !metadata_path.is_file() {
            error!(level = %level, path = %metadata_path.display(), "[SYNC][ERROR] Metadata file missing");
            return Err(IngestError::MissingMetadataFile {
                path: metadata_path,
            });
        }
        let fields = extract_level(&metadata_path)?;

        let matches = self
            .catalog
            .find_by_identifier(CONTAINER_IDENTIFIER_SCHEME, &fields.identifier)
            .await
            .map_err(IngestError::catalog("find_by_identifier"))?;

        let (reference, outcome) = match matches.split_first() {
            Some((existing, rest)) => {
                if !rest.is_empty() {
                    warn!(
                        identifier = %fields.identifier,
                        matches = matches.len(),
                        chosen = %existing.reference,
                        "[SYNC] Several remote folders carry this identifier, using the first"
                    );
                }
                info!(
                    level = %level,
                    folder = %name,
                    reference = %existing.reference,
                    "[SYNC] Reusing existing folder"
                );
                (self.catalog.reference(existing), ContainerOutcome::Reused)
            }
            None => {
                let entity = self
                    .create_container(name, &fields.identifier, &metadata_path, parent)
                    .await?;
                info!(
                    level = %level,
                    folder = %name,
                    reference = %entity.reference,
                    "[SYNC] Created folder"
                );
                (self.catalog.reference(&entity), ContainerOutcome::Created)
            }
        };

        let descriptor = ContainerDescriptor {
            name: name.to_string(),
            business_identifier: fields.identifier,
            aggregation_level: fields.level,
            level,
            reference,
        };
        self.report.containers.push(ContainerReport {
            descriptor: descriptor.clone(),
            outcome,
        });
        Ok(descriptor)
    }

    async fn create_container(
        &self,
        name: &str,
        identifier: &str,
        metadata_path: &Path,
        parent: Option<&ContainerRef>,
    ) -> Result<RemoteEntity, IngestError> {
        let request = NewContainer {
            reference: ContainerRef::generate(),
            title: name.to_string(),
            description: name.to_string(),
            security_tag: self.config.security_tag.clone(),
            parent: parent.cloned(),
        };
        let entity = self
            .catalog
            .create_container(request)
            .await
            .map_err(IngestError::catalog("create_container"))?;
        self.catalog
            .attach_identifier(&entity, CONTAINER_IDENTIFIER_SCHEME, identifier)
            .await
            .map_err(IngestError::catalog("attach_identifier"))?;

        info!(metadata = %metadata_path.display(), folder = name, "[SYNC] Adding metadata to folder");
        let document = fs::read(metadata_path).map_err(|e| IngestError::MalformedMetadata {
            path: metadata_path.to_path_buf(),
            reason: format!("unreadable: {e}"),
        })?;
        self.catalog
            .attach_metadata(&entity, TOPX_SCHEMA_URI, document)
            .await
            .map_err(IngestError::catalog("attach_metadata"))
    }

    /// Batches, filters, packages and uploads the record folders of one dossier.
    async fn ingest_dossier(
        &mut self,
        dossier_dir: &Path,
        dossier: &ContainerDescriptor,
    ) -> Result<(), IngestError> {
        let record_folders = list_subdirectories(dossier_dir)?;
        let group_size = self.config.group_size;
        info!(
            dossier = %dossier.name,
            folders = record_folders.len(),
            "[SYNC] Found folders to ingest in dossier"
        );
        info!(
            group_size,
            submissions = batch_count(record_folders.len(), group_size),
            "[SYNC] Batching ingests"
        );

        let output_dir = self
            .config
            .package_dir
            .clone()
            .unwrap_or_else(|| dossier_dir.to_path_buf());

        for batch in partition(&record_folders, group_size)? {
            let survivors = self.surviving_members(batch).await?;
            if survivors.is_empty() {
                info!(dossier = %dossier.name, "[SYNC] All folders in batch exist, skipping upload");
                self.report.skipped_batches += 1;
                continue;
            }
            info!(members = ?survivors, "[SYNC] Packaging batch");

            let package = match build_package(dossier_dir, &survivors, &output_dir) {
                Ok(package) => package,
                Err(e) => {
                    error!(dossier = %dossier.name, error = %e, "[SYNC][ERROR] Packaging failed");
                    if let Some(name) = survivors.first() {
                        remove_partial_package(&output_dir.join(format!("{name}.zip")));
                    }
                    return Err(e);
                }
            };
            self.upload_package(package, &dossier.reference).await?;
        }
        Ok(())
    }

    /// Members of `batch` the repository does not hold yet, in batch order.
    async fn surviving_members(&mut self, batch: &[String]) -> Result<Vec<String>, IngestError> {
        let mut survivors = Vec::with_capacity(batch.len());
        for member in batch {
            let existing = self
                .catalog
                .find_by_identifier(RECORD_IDENTIFIER_SCHEME, member)
                .await
                .map_err(IngestError::catalog("find_by_identifier"))?;
            if existing.is_empty() {
                survivors.push(member.clone());
            } else {
                debug!(folder = %member, "[SYNC] Folder already ingested, skipping");
                self.report.skipped_folders.push(member.clone());
            }
        }
        Ok(survivors)
    }

    async fn upload_package(
        &mut self,
        package: Package,
        destination: &ContainerRef,
    ) -> Result<(), IngestError> {
        let route = select_route(package.size_bytes, self.config.staging_threshold_mib);
        info!(
            package = %package.file_name,
            folders = package.members.len(),
            size_mib = package.size_mib(),
            "[SYNC] Created submission"
        );

        let on_progress = progress_logger(&package.file_name);
        let result = match route {
            UploadRoute::Staged => {
                info!(bucket = %self.config.bucket, "[SYNC][UPLOAD] Uploading via staging bucket");
                self.transport
                    .upload_via_staging(
                        &package.path,
                        destination,
                        &self.config.bucket,
                        on_progress,
                        true,
                    )
                    .await
            }
            UploadRoute::Direct => {
                info!("[SYNC][UPLOAD] Uploading directly to repository");
                self.transport
                    .upload_direct(&package.path, destination, on_progress, true)
                    .await
            }
        };
        if let Err(source) = result {
            error!(package = %package.file_name, error = %source, "[SYNC][ERROR][UPLOAD] Upload failed");
            return Err(IngestError::Transport {
                package: package.file_name,
                source,
            });
        }

        info!(package = %package.file_name, route = ?route, "[SYNC][UPLOAD] Upload complete");
        self.report.packages.push(PackageReport {
            file_name: package.file_name,
            members: package.members,
            size_bytes: package.size_bytes,
            route,
            destination: destination.clone(),
        });
        Ok(())
    }
}

/// `<parent_dir>/<name>/<name>.metadata`
pub fn metadata_path(parent_dir: &Path, name: &str) -> PathBuf {
    parent_dir
        .join(name)
        .join(format!("{name}.{METADATA_EXTENSION}"))
}

/// Names of the immediate subdirectories of `dir`, sorted. Links to
/// directories count as subdirectories.
pub fn list_subdirectories(dir: &Path) -> Result<Vec<String>, IngestError> {
    let listing = |source| IngestError::Listing {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(listing)? {
        let entry = entry.map_err(listing)?;
        let file_type = entry.file_type().map_err(listing)?;
        let is_dir = file_type.is_dir()
            || (file_type.is_symlink()
                && fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false));
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn remove_partial_package(path: &Path) {
    if path.exists() {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed partial package"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial package"),
        }
    }
}

/// Logs upload progress for `package_name` in 10% steps.
fn progress_logger(package_name: &str) -> ProgressCallback {
    let package_name = package_name.to_string();
    let last_step = AtomicU64::new(u64::MAX);
    Arc::new(move |progress: UploadProgress| {
        let step = progress.percent() / 10;
        if last_step.swap(step, Ordering::Relaxed) != step {
            info!(
                package = %package_name,
                bytes = progress.bytes_transferred,
                total = progress.total_bytes,
                percent = progress.percent(),
                "[SYNC][UPLOAD] Progress"
            );
        }
    })
}
