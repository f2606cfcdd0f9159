use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use zip::ZipArchive;

use topx_ingest_core::config::{SynchroniseConfig, TOPX_SCHEMA_URI};
use topx_ingest_core::contract::{
    ContainerRef, MockRemoteCatalog, MockTransport, NewContainer, ProgressCallback,
    RemoteCatalog, RemoteEntity, Transport, UploadProgress,
};
use topx_ingest_core::retry::{RetryPolicy, Retrying};
use topx_ingest_core::synchronise::{synchronise, ContainerLevel, ContainerOutcome, UploadRoute};
use topx_ingest_core::{BoxError, IngestError};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn topx(level: &str, identifier: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ToPX xmlns="http://www.nationaalarchief.nl/ToPX/v2.3">
  <aggregatie>
    <identificatiekenmerk>{identifier}</identificatiekenmerk>
    <aggregatieniveau>{level}</aggregatieniveau>
    <naam>{identifier}</naam>
  </aggregatie>
</ToPX>"#
    )
}

/// Creates `dir/name/name.metadata` and returns `dir/name`.
fn container(dir: &Path, name: &str, level: &str, identifier: &str) -> PathBuf {
    let path = dir.join(name);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join(format!("{name}.metadata")), topx(level, identifier)).unwrap();
    path
}

fn record_folder(dossier: &Path, name: &str) {
    let path = dossier.join(name);
    fs::create_dir_all(path.join("bestanden")).unwrap();
    fs::write(path.join(format!("{name}.metadata")), topx("Record", name)).unwrap();
    fs::write(path.join("bestanden").join("scan.txt"), format!("scan of {name}")).unwrap();
}

/// data/A1/S1/D1 with `records` record folders named folder1..folderN.
fn single_dossier_tree(records: usize) -> (TempDir, PathBuf) {
    let root = tempdir().unwrap();
    let data = root.path().join("data");
    let archief = container(&data, "A1", "Archief", "ID-A1");
    let serie = container(&archief, "S1", "Serie", "ID-S1");
    let dossier = container(&serie, "D1", "Dossier", "ID-D1");
    for i in 1..=records {
        record_folder(&dossier, &format!("folder{i}"));
    }
    (root, data)
}

fn config(data_folder: PathBuf, group_size: usize) -> SynchroniseConfig {
    SynchroniseConfig {
        parent_folder: None,
        security_tag: "open".to_string(),
        data_folder,
        group_size,
        bucket: "staging-bucket".to_string(),
        staging_threshold_mib: 256,
        package_dir: None,
    }
}

fn entity(reference: &str, title: &str) -> RemoteEntity {
    RemoteEntity {
        reference: ContainerRef::new(reference),
        title: title.to_string(),
        entity_type: "SO".to_string(),
    }
}

// ---------------------------------------------------------------------------
// In-memory repository: a catalog plus a transport that registers the
// `code` identifiers of ingested folders, the way the repository does after
// processing a package.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CatalogState {
    entities: Vec<(RemoteEntity, Option<ContainerRef>)>,
    identifiers: Vec<(ContainerRef, String, String)>,
    metadata: Vec<(ContainerRef, String, Vec<u8>)>,
    lookups: Vec<(String, String)>,
    next_id: usize,
    created: usize,
}

#[derive(Default)]
struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    fn seed(&self, title: &str, scheme: &str, value: &str) -> ContainerRef {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let reference = ContainerRef::new(format!("seed-{}", state.next_id));
        state.entities.push((entity(reference.as_str(), title), None));
        state
            .identifiers
            .push((reference.clone(), scheme.to_string(), value.to_string()));
        reference
    }

    fn containers_created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    fn parent_of(&self, title: &str) -> Option<ContainerRef> {
        let state = self.state.lock().unwrap();
        state
            .entities
            .iter()
            .find(|(e, _)| e.title == title)
            .and_then(|(_, parent)| parent.clone())
    }

    fn lookups_for(&self, scheme: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .lookups
            .iter()
            .filter(|(s, _)| s == scheme)
            .count()
    }
}

#[async_trait]
impl RemoteCatalog for InMemoryCatalog {
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<RemoteEntity>, BoxError> {
        let mut state = self.state.lock().unwrap();
        state.lookups.push((scheme.to_string(), value.to_string()));
        let refs: Vec<ContainerRef> = state
            .identifiers
            .iter()
            .filter(|(_, s, v)| s == scheme && v == value)
            .map(|(r, _, _)| r.clone())
            .collect();
        Ok(state
            .entities
            .iter()
            .filter(|(e, _)| refs.contains(&e.reference))
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn fetch_container(&self, reference: &ContainerRef) -> Result<RemoteEntity, BoxError> {
        let state = self.state.lock().unwrap();
        state
            .entities
            .iter()
            .find(|(e, _)| &e.reference == reference)
            .map(|(e, _)| e.clone())
            .ok_or_else(|| format!("404 Not Found: {reference}").into())
    }

    async fn create_container(&self, request: NewContainer) -> Result<RemoteEntity, BoxError> {
        let mut state = self.state.lock().unwrap();
        if state.entities.iter().any(|(e, _)| e.reference == request.reference) {
            return Err(format!("409 Conflict: {} exists", request.reference).into());
        }
        state.created += 1;
        let created = entity(request.reference.as_str(), &request.title);
        state.entities.push((created.clone(), request.parent));
        Ok(created)
    }

    async fn attach_identifier(
        &self,
        entity: &RemoteEntity,
        scheme: &str,
        value: &str,
    ) -> Result<(), BoxError> {
        self.state.lock().unwrap().identifiers.push((
            entity.reference.clone(),
            scheme.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    async fn attach_metadata(
        &self,
        entity: &RemoteEntity,
        schema_uri: &str,
        document: Vec<u8>,
    ) -> Result<RemoteEntity, BoxError> {
        self.state.lock().unwrap().metadata.push((
            entity.reference.clone(),
            schema_uri.to_string(),
            document,
        ));
        Ok(entity.clone())
    }

    fn reference(&self, entity: &RemoteEntity) -> ContainerRef {
        entity.reference.clone()
    }
}

#[derive(Debug, Clone)]
struct Upload {
    file_name: String,
    route: UploadRoute,
    destination: ContainerRef,
    folders: BTreeSet<String>,
    delete_after_upload: bool,
}

struct RecordingTransport {
    catalog: Arc<InMemoryCatalog>,
    uploads: Mutex<Vec<Upload>>,
}

impl RecordingTransport {
    fn new(catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            catalog,
            uploads: Mutex::new(Vec::new()),
        }
    }

    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    fn ingest(
        &self,
        package: &Path,
        destination: &ContainerRef,
        route: UploadRoute,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError> {
        let mut archive = ZipArchive::new(File::open(package)?)?;
        let mut folders = BTreeSet::new();
        for i in 0..archive.len() {
            let name = archive.by_index(i)?.name().to_string();
            if let Some(top) = name.split('/').next() {
                folders.insert(top.to_string());
            }
        }
        for folder in &folders {
            self.catalog.seed(folder, "code", folder);
        }

        let file_name = package.file_name().unwrap().to_string_lossy().into_owned();
        let total = fs::metadata(package)?.len();
        on_progress(UploadProgress {
            package_name: file_name.clone(),
            bytes_transferred: total,
            total_bytes: total,
        });
        if delete_after_upload {
            fs::remove_file(package)?;
        }
        self.uploads.lock().unwrap().push(Upload {
            file_name,
            route,
            destination: destination.clone(),
            folders,
            delete_after_upload,
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn upload_direct(
        &self,
        package: &Path,
        destination: &ContainerRef,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError> {
        self.ingest(
            package,
            destination,
            UploadRoute::Direct,
            on_progress,
            delete_after_upload,
        )
    }

    async fn upload_via_staging(
        &self,
        package: &Path,
        destination: &ContainerRef,
        bucket: &str,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError> {
        assert_eq!(bucket, "staging-bucket");
        self.ingest(
            package,
            destination,
            UploadRoute::Staged,
            on_progress,
            delete_after_upload,
        )
    }
}

/// Failures injected around the in-memory catalog.
enum Fault {
    /// The first create is applied but the caller only sees a timeout.
    LostCreateResponse,
    /// Looking up the record folder's `code` deletes it from disk.
    RemoveOnLookup { folder: String, path: PathBuf },
}

struct FaultyCatalog {
    inner: Arc<InMemoryCatalog>,
    fault: Fault,
    tripped: AtomicBool,
}

impl FaultyCatalog {
    fn new(inner: Arc<InMemoryCatalog>, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteCatalog for FaultyCatalog {
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<RemoteEntity>, BoxError> {
        if let Fault::RemoveOnLookup { folder, path } = &self.fault {
            if scheme == "code" && value == folder {
                fs::remove_dir_all(path)?;
            }
        }
        self.inner.find_by_identifier(scheme, value).await
    }

    async fn fetch_container(&self, reference: &ContainerRef) -> Result<RemoteEntity, BoxError> {
        self.inner.fetch_container(reference).await
    }

    async fn create_container(&self, request: NewContainer) -> Result<RemoteEntity, BoxError> {
        let lose_response = matches!(self.fault, Fault::LostCreateResponse)
            && !self.tripped.swap(true, Ordering::SeqCst);
        if lose_response {
            self.inner.create_container(request).await?;
            return Err("operation timed out".into());
        }
        self.inner.create_container(request).await
    }

    async fn attach_identifier(
        &self,
        entity: &RemoteEntity,
        scheme: &str,
        value: &str,
    ) -> Result<(), BoxError> {
        self.inner.attach_identifier(entity, scheme, value).await
    }

    async fn attach_metadata(
        &self,
        entity: &RemoteEntity,
        schema_uri: &str,
        document: Vec<u8>,
    ) -> Result<RemoteEntity, BoxError> {
        self.inner.attach_metadata(entity, schema_uri, document).await
    }

    fn reference(&self, entity: &RemoteEntity) -> ContainerRef {
        self.inner.reference(entity)
    }
}

fn folders(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_run_creates_nothing_and_uploads_nothing() {
    let (_root, data) = single_dossier_tree(5);
    let config = config(data, 2);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let first = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect("first run should succeed");
    assert_eq!(first.containers_created(), 3);
    assert_eq!(first.containers_reused(), 0);
    assert_eq!(first.packages.len(), 3);
    assert_eq!(transport.uploads().len(), 3);
    assert_eq!(catalog.containers_created(), 3);

    let second = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect("second run should succeed");
    assert_eq!(second.containers_created(), 0);
    assert_eq!(second.containers_reused(), 3);
    assert!(second.packages.is_empty());
    assert_eq!(second.skipped_batches, 3);
    assert_eq!(second.skipped_folders.len(), 5);
    assert_eq!(transport.uploads().len(), 3, "no new uploads on rerun");
    assert_eq!(catalog.containers_created(), 3, "no new containers on rerun");
}

#[tokio::test]
async fn test_partially_ingested_batch_uploads_only_new_members() {
    let (_root, data) = single_dossier_tree(5);
    let config = config(data, 2);
    let catalog = Arc::new(InMemoryCatalog::default());
    catalog.seed("folder3", "code", "folder3");
    let transport = RecordingTransport::new(catalog.clone());

    let report = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect("run should succeed");

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 3);
    assert_eq!(uploads[0].file_name, "folder1.zip");
    assert_eq!(uploads[0].folders, folders(&["folder1", "folder2"]));
    assert_eq!(uploads[1].file_name, "folder4.zip");
    assert_eq!(uploads[1].folders, folders(&["folder4"]));
    assert_eq!(uploads[2].file_name, "folder5.zip");
    assert_eq!(uploads[2].folders, folders(&["folder5"]));

    assert_eq!(report.skipped_folders, vec!["folder3".to_string()]);
    assert_eq!(report.skipped_batches, 0);
    assert_eq!(report.packages[1].members, vec!["folder4".to_string()]);
}

#[tokio::test]
async fn test_fully_ingested_batch_builds_no_package() {
    let (_root, data) = single_dossier_tree(4);
    let dossier_dir = data.join("A1/S1/D1");
    let config = config(data, 2);
    let catalog = Arc::new(InMemoryCatalog::default());
    catalog.seed("folder1", "code", "folder1");
    catalog.seed("folder2", "code", "folder2");
    let transport = RecordingTransport::new(catalog.clone());

    let report = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect("run should succeed");

    assert_eq!(report.skipped_batches, 1);
    assert_eq!(report.packages.len(), 1);
    assert_eq!(report.packages[0].file_name, "folder3.zip");
    assert!(
        !dossier_dir.join("folder1.zip").exists(),
        "a skipped batch must not leave a package behind"
    );
}

#[tokio::test]
async fn test_packages_go_to_dossier_and_are_deleted_after_upload() {
    let (_root, data) = single_dossier_tree(2);
    let dossier_dir = data.join("A1/S1/D1");
    let config = config(data, 10);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let report = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .unwrap();

    let dossier_ref = report
        .containers
        .iter()
        .find(|c| c.descriptor.level == ContainerLevel::Dossier)
        .map(|c| c.descriptor.reference.clone())
        .unwrap();
    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].destination, dossier_ref);
    assert_eq!(uploads[0].route, UploadRoute::Direct);
    assert!(uploads[0].delete_after_upload);
    assert!(!dossier_dir.join("folder1.zip").exists());
}

#[tokio::test]
async fn test_containers_are_nested_tagged_and_annotated() {
    let (_root, data) = single_dossier_tree(0);
    let config = config(data.clone(), 3);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let report = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .unwrap();

    let levels: Vec<ContainerLevel> = report
        .containers
        .iter()
        .map(|c| c.descriptor.level)
        .collect();
    assert_eq!(
        levels,
        vec![
            ContainerLevel::Archief,
            ContainerLevel::Serie,
            ContainerLevel::Dossier
        ]
    );
    let archief = &report.containers[0].descriptor;
    let serie = &report.containers[1].descriptor;
    assert_eq!(archief.business_identifier, "ID-A1");
    assert_eq!(archief.aggregation_level, "Archief");

    assert_eq!(catalog.parent_of("A1"), None);
    assert_eq!(catalog.parent_of("S1"), Some(archief.reference.clone()));
    assert_eq!(catalog.parent_of("D1"), Some(serie.reference.clone()));

    let state = catalog.state.lock().unwrap();
    assert!(state
        .identifiers
        .iter()
        .any(|(r, s, v)| r == &archief.reference && s == "identificatiekenmerk" && v == "ID-A1"));
    let (_, schema, document) = state
        .metadata
        .iter()
        .find(|(r, _, _)| r == &archief.reference)
        .expect("archief metadata attached");
    assert_eq!(schema, TOPX_SCHEMA_URI);
    assert_eq!(
        document,
        &fs::read(data.join("A1/A1.metadata")).unwrap(),
        "metadata is attached verbatim"
    );
}

#[tokio::test]
async fn test_missing_dossier_metadata_aborts_before_records_are_touched() {
    let (_root, data) = single_dossier_tree(3);
    fs::remove_file(data.join("A1/S1/D1/D1.metadata")).unwrap();
    let config = config(data.clone(), 2);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let err = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect_err("run must abort");

    match err {
        IngestError::MissingMetadataFile { path } => {
            assert_eq!(path, data.join("A1/S1/D1/D1.metadata"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(catalog.lookups_for("code"), 0);
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn test_rerun_after_failure_resumes_where_it_stopped() {
    let (_root, data) = single_dossier_tree(2);
    // second dossier without metadata makes the first run fail after D1 is done
    let serie = data.join("A1/S1");
    fs::create_dir_all(serie.join("D2/folderX")).unwrap();
    let config = config(data, 5);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let first = synchronise(&config, catalog.as_ref(), &transport).await;
    assert!(matches!(first, Err(IngestError::MissingMetadataFile { .. })));
    assert_eq!(transport.uploads().len(), 1);

    fs::write(serie.join("D2/D2.metadata"), topx("Dossier", "ID-D2")).unwrap();
    let second = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .expect("rerun should succeed");
    assert_eq!(second.containers_created(), 1, "only D2 is new");
    assert_eq!(second.packages.len(), 1);
    assert_eq!(second.packages[0].members, vec!["folderX".to_string()]);
}

#[tokio::test]
async fn test_large_package_goes_through_staging_bucket() {
    let (_root, data) = single_dossier_tree(1);
    let dossier = data.join("A1/S1/D1");
    // ~3 MiB of incompressible bytes
    let mut seed: u32 = 0x2545_f491;
    let noise: Vec<u8> = (0..3 * 1024 * 1024)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed & 0xff) as u8
        })
        .collect();
    fs::create_dir_all(dossier.join("groot")).unwrap();
    fs::write(dossier.join("groot/scan.bin"), noise).unwrap();

    let mut config = config(data, 1);
    config.staging_threshold_mib = 1;
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());

    let report = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .unwrap();

    let routes: Vec<(String, UploadRoute)> = report
        .packages
        .iter()
        .map(|p| (p.file_name.clone(), p.route))
        .collect();
    assert_eq!(
        routes,
        vec![
            ("folder1.zip".to_string(), UploadRoute::Direct),
            ("groot.zip".to_string(), UploadRoute::Staged),
        ]
    );
}

#[tokio::test]
async fn test_configured_parent_folder_becomes_root() {
    let (_root, data) = single_dossier_tree(0);
    let catalog = Arc::new(InMemoryCatalog::default());
    let parent = catalog.seed("Bestaande map", "legacy", "x");
    let transport = RecordingTransport::new(catalog.clone());
    let mut config = config(data, 2);
    config.parent_folder = Some(parent.as_str().to_string());

    synchronise(&config, catalog.as_ref(), &transport)
        .await
        .unwrap();

    assert_eq!(catalog.parent_of("A1"), Some(parent));
}

#[tokio::test]
async fn test_unknown_parent_folder_fails_the_run() {
    let (_root, data) = single_dossier_tree(0);
    let catalog = Arc::new(InMemoryCatalog::default());
    let transport = RecordingTransport::new(catalog.clone());
    let mut config = config(data, 2);
    config.parent_folder = Some("does-not-exist".to_string());

    let err = synchronise(&config, catalog.as_ref(), &transport)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::RemoteCatalog {
            operation: "fetch_container",
            ..
        }
    ));
    assert_eq!(catalog.containers_created(), 0);
}

#[tokio::test]
async fn test_invalid_group_size_is_rejected_before_any_call() {
    let (_root, data) = single_dossier_tree(1);
    let catalog = MockRemoteCatalog::new();
    let transport = MockTransport::new();

    let err = synchronise(&config(data, 0), &catalog, &transport)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_existing_archief_is_reused_without_create() {
    let (_root, data) = single_dossier_tree(0);
    let mut catalog = MockRemoteCatalog::new();

    catalog
        .expect_find_by_identifier()
        .returning(|scheme, value| {
            assert_eq!(scheme, "identificatiekenmerk");
            if value == "ID-A1" {
                Ok(vec![entity("ref-A1", "A1")])
            } else {
                Ok(vec![])
            }
        });
    catalog.expect_reference().returning(|e| e.reference.clone());

    // Only S1 and D1 may be created; a create for A1 has no matching expectation.
    catalog
        .expect_create_container()
        .withf(|req: &NewContainer| req.title != "A1")
        .times(2)
        .returning(|req: NewContainer| {
            let expected_parent = match req.title.as_str() {
                "S1" => "ref-A1",
                "D1" => "ref-S1",
                other => panic!("unexpected container {other}"),
            };
            assert_eq!(req.parent, Some(ContainerRef::new(expected_parent)));
            assert_eq!(req.security_tag, "open");
            Ok(entity(&format!("ref-{}", req.title), &req.title))
        });
    catalog
        .expect_attach_identifier()
        .times(2)
        .returning(|_, _, _| Ok(()));
    catalog
        .expect_attach_metadata()
        .times(2)
        .returning(|e, schema, _| {
            assert_eq!(schema, TOPX_SCHEMA_URI);
            Ok(e.clone())
        });

    let transport = MockTransport::new();
    let report = synchronise(&config(data, 2), &catalog, &transport)
        .await
        .expect("run should succeed");

    assert_eq!(report.containers[0].outcome, ContainerOutcome::Reused);
    assert_eq!(
        report.containers[0].descriptor.reference,
        ContainerRef::new("ref-A1")
    );
    assert_eq!(report.containers_created(), 2);
}

#[tokio::test]
async fn test_upload_failure_aborts_with_transport_error() {
    let (_root, data) = single_dossier_tree(3);
    let catalog = Arc::new(InMemoryCatalog::default());
    let mut transport = MockTransport::new();
    transport
        .expect_upload_direct()
        .times(1)
        .returning(|_, _, _, delete| {
            assert!(delete);
            Err("502 Bad Gateway".into())
        });

    let err = synchronise(&config(data, 2), catalog.as_ref(), &transport)
        .await
        .unwrap_err();
    match err {
        IngestError::Transport { package, source } => {
            assert_eq!(package, "folder1.zip");
            assert_eq!(source.to_string(), "502 Bad Gateway");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_packaging_removes_partial_zip() {
    let (_root, data) = single_dossier_tree(3);
    let dossier_dir = data.join("A1/S1/D1");
    let inner = Arc::new(InMemoryCatalog::default());
    let catalog = FaultyCatalog::new(
        inner.clone(),
        Fault::RemoveOnLookup {
            folder: "folder2".to_string(),
            path: dossier_dir.join("folder2"),
        },
    );
    let transport = RecordingTransport::new(inner.clone());

    let result = synchronise(&config(data, 5), &catalog, &transport).await;

    assert!(
        matches!(result, Err(IngestError::Packaging { .. })),
        "unexpected result: {result:?}"
    );
    assert!(
        !dossier_dir.join("folder1.zip").exists(),
        "the partial package must be removed"
    );
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn test_create_applied_before_timeout_is_not_repeated() {
    let (_root, data) = single_dossier_tree(1);
    let inner = Arc::new(InMemoryCatalog::default());
    let catalog = Retrying::new(
        FaultyCatalog::new(inner.clone(), Fault::LostCreateResponse),
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        },
    );
    let transport = RecordingTransport::new(inner.clone());

    let report = synchronise(&config(data, 2), &catalog, &transport)
        .await
        .expect("run should recover from the lost response");

    assert_eq!(inner.containers_created(), 3, "A1 must exist exactly once");
    assert_eq!(report.containers_created(), 3);
    let archief = &report.containers[0].descriptor;
    assert_eq!(inner.parent_of("S1"), Some(archief.reference.clone()));
    assert_eq!(transport.uploads().len(), 1);
}
