//! [`Transport`] implementations: packages go to S3-compatible storage from
//! which Preservica picks them up.
//!
//! - Direct: the repository's own upload bucket behind `{server}/api/s3/buckets`,
//!   authenticated with the session token.
//! - Staged: a regular S3 bucket reached through the default AWS credential
//!   chain, written with multipart upload so large packages never sit in memory
//!   as a whole.
//!
//! Both attach the object metadata the repository's ingest workflow reads to
//! find the destination folder.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use topx_ingest_core::contract::{
    ContainerRef, PermanentError, ProgressCallback, Transport, UploadProgress,
};
use topx_ingest_core::BoxError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::PreservicaSession;

pub const PART_SIZE: usize = 64 * 1024 * 1024;
const UNUSED_SECRET: &str = "NOT_USED";

/// Bucket of the repository's own S3 endpoint for `tenant`.
pub fn direct_bucket(tenant: &str) -> String {
    format!("{}.package.upload", tenant.to_lowercase())
}

/// Object metadata the ingest workflow expects next to each package.
pub fn object_metadata(
    key: &str,
    package_name: &str,
    bucket: &str,
    destination: &ContainerRef,
    size_bytes: u64,
    created_by: &str,
) -> Vec<(&'static str, String)> {
    vec![
        ("key", key.to_string()),
        ("name", package_name.to_string()),
        ("bucket", bucket.to_string()),
        ("status", "ready".to_string()),
        ("collectionreference", destination.to_string()),
        ("structuralobjectreference", destination.to_string()),
        ("size", size_bytes.to_string()),
        ("numberfiles", "1".to_string()),
        ("createdby", created_by.to_string()),
    ]
}

fn s3_error<E>(operation: &str, error: SdkError<E, HttpResponse>) -> BoxError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = error.raw_response().map(|r| r.status().as_u16());
    let message = format!(
        "{operation}: {}",
        aws_sdk_s3::error::DisplayErrorContext(&error)
    );
    match status {
        Some(code) if (400..500).contains(&code) && code != 408 && code != 429 => {
            PermanentError::boxed(message)
        }
        _ => message.into(),
    }
}

fn package_name(package: &Path) -> String {
    package
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| package.display().to_string())
}

async fn remove_uploaded(package: &Path, delete_after_upload: bool) -> Result<(), BoxError> {
    if delete_after_upload {
        tokio::fs::remove_file(package).await?;
        debug!(path = %package.display(), "Removed uploaded package");
    }
    Ok(())
}

pub struct PreservicaTransport {
    session: Arc<PreservicaSession>,
    staging: OnceCell<Client>,
}

impl PreservicaTransport {
    pub fn new(session: Arc<PreservicaSession>) -> Self {
        Self {
            session,
            staging: OnceCell::new(),
        }
    }

    /// S3 client for the repository endpoint; built per upload so it carries a fresh token.
    async fn direct_client(&self) -> Result<Client, BoxError> {
        let token = self.session.token().await?;
        let credentials = Credentials::new(token, UNUSED_SECRET, None, None, "preservica-session");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .endpoint_url(self.session.url("/api/s3/buckets"))
            .force_path_style(true)
            .build();
        Ok(Client::from_conf(config))
    }

    async fn staging_client(&self) -> &Client {
        self.staging
            .get_or_init(|| async {
                let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
                Client::new(&shared)
            })
            .await
    }
}

#[async_trait]
impl Transport for PreservicaTransport {
    async fn upload_direct(
        &self,
        package: &Path,
        destination: &ContainerRef,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError> {
        let client = self.direct_client().await?;
        let bucket = direct_bucket(&self.session.settings().tenant);
        let name = package_name(package);
        let key = format!("{}.zip", Uuid::new_v4());
        let size = tokio::fs::metadata(package).await?.len();

        info!(package = %name, bucket = %bucket, key = %key, "Uploading package to repository bucket");
        on_progress(UploadProgress {
            package_name: name.clone(),
            bytes_transferred: 0,
            total_bytes: size,
        });

        let body = ByteStream::from_path(package).await?;
        let mut request = client.put_object().bucket(&bucket).key(&key).body(body);
        let metadata =
            object_metadata(&key, &name, &bucket, destination, size, self.session.username());
        for (field, value) in metadata {
            request = request.metadata(field, value);
        }
        request
            .send()
            .await
            .map_err(|e| s3_error("put_object", e))?;

        on_progress(UploadProgress {
            package_name: name.clone(),
            bytes_transferred: size,
            total_bytes: size,
        });
        remove_uploaded(package, delete_after_upload).await
    }

    async fn upload_via_staging(
        &self,
        package: &Path,
        destination: &ContainerRef,
        bucket: &str,
        on_progress: ProgressCallback,
        delete_after_upload: bool,
    ) -> Result<(), BoxError> {
        let client = self.staging_client().await;
        let name = package_name(package);
        let key = format!("{}.zip", Uuid::new_v4());
        let size = tokio::fs::metadata(package).await?.len();

        info!(package = %name, bucket, key = %key, size, "Starting multipart upload to staging bucket");
        let mut create = client.create_multipart_upload().bucket(bucket).key(&key);
        let metadata =
            object_metadata(&key, &name, bucket, destination, size, self.session.username());
        for (field, value) in metadata {
            create = create.metadata(field, value);
        }
        let upload_id = create
            .send()
            .await
            .map_err(|e| s3_error("create_multipart_upload", e))?
            .upload_id()
            .map(str::to_string)
            .ok_or("create_multipart_upload returned no upload id")?;

        let result = upload_parts(
            client,
            package,
            bucket,
            &key,
            &upload_id,
            &name,
            size,
            &on_progress,
        )
        .await;
        let parts = match result {
            Ok(parts) => parts,
            Err(e) => {
                warn!(package = %name, error = %e, "Aborting multipart upload");
                if let Err(abort) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(error = %aws_sdk_s3::error::DisplayErrorContext(&abort), "Abort failed");
                }
                return Err(e);
            }
        };

        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| s3_error("complete_multipart_upload", e))?;

        info!(package = %name, bucket, key = %key, "Multipart upload complete");
        remove_uploaded(package, delete_after_upload).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_parts(
    client: &Client,
    package: &Path,
    bucket: &str,
    key: &str,
    upload_id: &str,
    name: &str,
    size: u64,
    on_progress: &ProgressCallback,
) -> Result<Vec<CompletedPart>, BoxError> {
    let mut file = tokio::fs::File::open(package).await?;
    let mut parts = Vec::new();
    let mut transferred = 0u64;
    let mut part_number = 1;

    loop {
        let chunk = read_chunk(&mut file, PART_SIZE).await?;
        if chunk.is_empty() && part_number > 1 {
            break;
        }
        let length = chunk.len() as u64;
        let uploaded = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .map_err(|e| s3_error("upload_part", e))?;
        parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .build(),
        );

        transferred += length;
        on_progress(UploadProgress {
            package_name: name.to_string(),
            bytes_transferred: transferred,
            total_bytes: size,
        });
        if length < PART_SIZE as u64 {
            break;
        }
        part_number += 1;
    }
    Ok(parts)
}

/// Reads up to `limit` bytes, fewer only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, limit: usize) -> Result<Vec<u8>, BoxError> {
    let mut chunk = Vec::with_capacity(limit);
    let mut reader = (&mut *file).take(limit as u64);
    reader.read_to_end(&mut chunk).await?;
    Ok(chunk)
}
