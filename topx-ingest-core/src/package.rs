//! Builds the zip package for one filtered batch of record folders.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{BoxError, IngestError};

pub const MIB: u64 = 1024 * 1024;

/// A zip archive on disk, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Package {
    /// `<first member>.zip`
    pub file_name: String,
    pub path: PathBuf,
    pub members: Vec<String>,
    pub size_bytes: u64,
}

impl Package {
    /// Size in whole MiB, rounded down.
    pub fn size_mib(&self) -> u64 {
        self.size_bytes / MIB
    }
}

/// Archive name for a batch: the first surviving member plus `.zip`.
pub fn package_file_name(members: &[String]) -> Option<String> {
    members.first().map(|first| format!("{first}.zip"))
}

/// Zips every member folder of `working_dir` into `output_dir/<first member>.zip`.
///
/// Entry names are relative to `working_dir`, so extracting the archive
/// reproduces `member/...` exactly. A symlinked file is stored with its
/// target's content under the link's name; symlinked directories are not
/// descended into. A failure leaves whatever was written so
/// far on disk; removing it is up to the caller.
pub fn build_package(
    working_dir: &Path,
    members: &[String],
    output_dir: &Path,
) -> Result<Package, IngestError> {
    let file_name = package_file_name(members).ok_or_else(|| IngestError::Packaging {
        path: output_dir.to_path_buf(),
        source: "cannot build a package without members".into(),
    })?;
    let path = output_dir.join(&file_name);
    let packaging = |source: BoxError| IngestError::Packaging {
        path: path.clone(),
        source,
    };

    debug!(package = %path.display(), members = ?members, "Building package");

    let file = File::create(&path).map_err(|e| packaging(e.into()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut entries = 0usize;
    for member in members {
        let root = working_dir.join(member);
        if !root.is_dir() {
            return Err(packaging(
                format!("member folder {} does not exist", root.display()).into(),
            ));
        }
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| packaging(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(working_dir)
                .map_err(|e| packaging(e.into()))?;
            let name = entry_name(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                zip.add_directory(name, options)
                    .map_err(|e| packaging(e.into()))?;
            } else if file_type.is_file() || points_to_file(entry.path()) {
                zip.start_file(name, options)
                    .map_err(|e| packaging(e.into()))?;
                let mut source = File::open(entry.path()).map_err(|e| packaging(e.into()))?;
                io::copy(&mut source, &mut zip).map_err(|e| packaging(e.into()))?;
            } else {
                warn!(
                    path = %entry.path().display(),
                    "Skipping link to a directory or missing target while packaging"
                );
                continue;
            }
            entries += 1;
        }
    }

    let file = zip.finish().map_err(|e| packaging(e.into()))?;
    let size_bytes = file.metadata().map_err(|e| packaging(e.into()))?.len();

    info!(
        package = %file_name,
        members = members.len(),
        entries,
        size_bytes,
        "Package built"
    );

    Ok(Package {
        file_name,
        path,
        members: members.to_vec(),
        size_bytes,
    })
}

/// Whether `path` resolves, through any links, to a regular file.
fn points_to_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Zip entry name for a path relative to the working directory: `/`-separated,
/// independent of the host separator.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
