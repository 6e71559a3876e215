//! Records to be archived and their files
//!
//! The lifecycle only sees the narrow traits [`ArchivableRecord`],
//! [`RecordFiles`] and [`FileHandle`]. [`PublishedRecord`] is the concrete
//! implementation used by the binary (loaded from a JSON manifest) and by
//! tests.

use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::Deserialize;

use crate::error::DepositError;
use crate::metadata::DepositMetadata;

/// A single file attached to a record
pub trait FileHandle: Send + Sync {
    fn filename(&self) -> &str;

    /// Lowercased suffix after the last dot
    fn extension(&self) -> Option<String> {
        let name = self.filename();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    fn size(&self) -> u64;

    /// Algorithm-prefixed digest, e.g. `md5:<hex>`
    fn checksum(&self) -> &str;

    fn content_type(&self) -> &str;

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>>;
}

pub trait RecordFiles: Send + Sync {
    fn count(&self) -> usize;

    /// The file, if there is exactly one
    fn single(&self) -> Option<&dyn FileHandle>;
}

/// Who can see a record and its files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    pub record_public: bool,
    pub files_public: bool,
}

impl AccessPolicy {
    pub fn public() -> Self {
        Self {
            record_public: true,
            files_public: true,
        }
    }
}

/// An object that can be archived
pub trait ArchivableRecord: Send + Sync {
    /// Stable reference of the object, one deposit per owner
    fn owner_ref(&self) -> &str;

    fn declared_type(&self) -> Option<&str>;

    fn files(&self) -> &dyn RecordFiles;

    fn access(&self) -> AccessPolicy;

    fn metadata(&self) -> Result<DepositMetadata, DepositError>;
}

// =============================================================================
// Concrete records
// =============================================================================

#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file whose size and checksum are known up front
#[derive(Debug, Clone)]
pub struct StoredFile {
    filename: String,
    content_type: String,
    size: u64,
    checksum: String,
    source: FileSource,
}

impl StoredFile {
    pub fn from_bytes(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data: Bytes = data.into();
        let checksum = format!("md5:{}", hex::encode(Md5::digest(&data)));
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            checksum,
            source: FileSource::Memory(data),
        }
    }

    /// Stat and hash a file on disk
    pub fn from_path(path: &Path, content_type: Option<&str>) -> Result<Self, DepositError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DepositError::InvalidRecord(format!("{} has no usable file name", path.display()))
            })?
            .to_string();

        let mut file = std::fs::File::open(path)?;
        let mut hasher = Md5::new();
        let size = std::io::copy(&mut file, &mut hasher)?;

        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_content_type(&filename).to_string());

        Ok(Self {
            filename,
            content_type,
            size,
            checksum: format!("md5:{}", hex::encode(hasher.finalize())),
            source: FileSource::Path(path.to_path_buf()),
        })
    }
}

impl FileHandle for StoredFile {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        match &self.source {
            FileSource::Path(path) => Ok(Box::new(std::fs::File::open(path)?)),
            FileSource::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

fn guess_content_type(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        "application/zip"
    } else if lower.ends_with(".tar") {
        "application/x-tar"
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}

/// Files of a record; a metadata-only record has files disabled
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    pub enabled: bool,
    pub entries: Vec<StoredFile>,
}

impl RecordFiles for FileSet {
    fn count(&self) -> usize {
        if self.enabled {
            self.entries.len()
        } else {
            0
        }
    }

    fn single(&self) -> Option<&dyn FileHandle> {
        if self.count() == 1 {
            self.entries.first().map(|f| f as &dyn FileHandle)
        } else {
            None
        }
    }
}

/// A published record with its files and metadata
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub id: String,
    pub resource_type: Option<String>,
    pub access: AccessPolicy,
    pub files: FileSet,
    pub metadata: DepositMetadata,
}

impl PublishedRecord {
    pub fn new(id: impl Into<String>, resource_type: &str, metadata: DepositMetadata) -> Self {
        Self {
            id: id.into(),
            resource_type: Some(resource_type.to_string()),
            access: AccessPolicy::public(),
            files: FileSet {
                enabled: true,
                entries: Vec::new(),
            },
            metadata,
        }
    }

    pub fn with_file(mut self, file: StoredFile) -> Self {
        self.files.entries.push(file);
        self
    }

    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn without_files(mut self) -> Self {
        self.files.enabled = false;
        self.files.entries.clear();
        self
    }

    /// Load a record from a JSON manifest; file paths are relative to it
    pub fn from_manifest(path: &Path) -> Result<Self, DepositError> {
        let content = std::fs::read_to_string(path)?;
        let manifest: RecordManifest = serde_json::from_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let entries = if manifest.files.enabled {
            manifest
                .files
                .entries
                .iter()
                .map(|f| StoredFile::from_path(&base.join(&f.path), f.content_type.as_deref()))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            id: manifest.id,
            resource_type: manifest.resource_type,
            access: AccessPolicy {
                record_public: manifest.access.record == "public",
                files_public: manifest.access.files == "public",
            },
            files: FileSet {
                enabled: manifest.files.enabled,
                entries,
            },
            metadata: manifest.metadata,
        })
    }
}

impl ArchivableRecord for PublishedRecord {
    fn owner_ref(&self) -> &str {
        &self.id
    }

    fn declared_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    fn files(&self) -> &dyn RecordFiles {
        &self.files
    }

    fn access(&self) -> AccessPolicy {
        self.access
    }

    fn metadata(&self) -> Result<DepositMetadata, DepositError> {
        self.metadata.validate()?;
        Ok(self.metadata.clone())
    }
}

/// On-disk description of a record, as read by `swh-deposit archive`
#[derive(Debug, Clone, Deserialize)]
pub struct RecordManifest {
    pub id: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub access: ManifestAccess,
    #[serde(default)]
    pub files: ManifestFiles,
    pub metadata: DepositMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestAccess {
    #[serde(default = "default_access")]
    pub record: String,
    #[serde(default = "default_access")]
    pub files: String,
}

impl Default for ManifestAccess {
    fn default() -> Self {
        Self {
            record: default_access(),
            files: default_access(),
        }
    }
}

fn default_access() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFiles {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub entries: Vec<ManifestFile>,
}

impl Default for ManifestFiles {
    fn default() -> Self {
        Self {
            enabled: true,
            entries: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub path: PathBuf,
    #[serde(default)]
    pub content_type: Option<String>,
}
