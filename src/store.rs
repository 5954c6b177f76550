use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PathIdentity;
use crate::domain::{BoundingBox, DatasetQuery, RequestId, format_timestamp};
use crate::error::RdaError;

pub const STAGING_SUFFIX: &str = "_tmp";
pub const REQUEST_RECORD: &str = ".rda-request.json";

#[derive(Debug, Clone)]
pub struct Store {
    base_dir: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, RdaError> {
        let base_dir = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("rda-met").join("met")).ok()
            })
            .ok_or_else(|| RdaError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self { base_dir })
    }

    pub fn new_with_base(base_dir: Utf8PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    /// Depends on dataset, product and time range only. Bounding box and
    /// parameters do not take part.
    pub fn dataset_path(&self, query: &DatasetQuery) -> Utf8PathBuf {
        self.base_dir
            .join(query.dataset())
            .join(query.product())
            .join(query.time_range())
    }

    pub fn is_downloaded(
        &self,
        query: &DatasetQuery,
        identity: PathIdentity,
    ) -> Result<bool, RdaError> {
        let path = self.dataset_path(query);
        if !path.as_std_path().is_dir() {
            return Ok(false);
        }
        match identity {
            PathIdentity::TimeRange => Ok(true),
            PathIdentity::Request => {
                let record = read_request_record(&path)?;
                Ok(record.is_some_and(|record| record.matches(query)))
            }
        }
    }

    pub fn remove_dataset(&self, path: &Utf8Path) -> Result<(), RdaError> {
        remove_dir_if_exists(path)
    }
}

pub fn staging_path(final_path: &Utf8Path) -> Utf8PathBuf {
    let name = final_path.file_name().unwrap_or_default();
    final_path.with_file_name(format!("{name}{STAGING_SUFFIX}"))
}

fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), RdaError> {
    if path.as_std_path().exists() {
        info!(path = %path, "removing directory");
        fs::remove_dir_all(path.as_std_path())
            .map_err(|err| RdaError::Filesystem(format!("remove {path}: {err}")))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct StagingArea {
    path: Utf8PathBuf,
    final_path: Utf8PathBuf,
}

impl StagingArea {
    pub fn create(final_path: &Utf8Path) -> Result<Self, RdaError> {
        let path = staging_path(final_path);
        remove_dir_if_exists(&path)?;
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| RdaError::Filesystem(format!("create {path}: {err}")))?;
        debug!(staging = %path, "staging area created");
        Ok(Self {
            path,
            final_path: final_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn final_path(&self) -> &Utf8Path {
        &self.final_path
    }

    /// Renames the staging directory onto the final path. Refuses to replace an
    /// existing dataset; the caller removes it first when re-downloading.
    pub fn finalize(self) -> Result<Utf8PathBuf, RdaError> {
        if self.final_path.as_std_path().exists() {
            return Err(RdaError::Filesystem(format!(
                "refusing to overwrite existing dataset at {}",
                self.final_path
            )));
        }
        fs::rename(self.path.as_std_path(), self.final_path.as_std_path()).map_err(|err| {
            RdaError::Filesystem(format!(
                "rename {} -> {}: {err}",
                self.path, self.final_path
            ))
        })?;
        info!(path = %self.final_path, "dataset promoted");
        Ok(self.final_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub dataset: String,
    pub product: String,
    pub params: Vec<String>,
    pub start: String,
    pub end: String,
    pub bbox: BoundingBox,
    pub request_id: String,
    pub downloaded_at: String,
    pub tool: String,
}

impl RequestRecord {
    pub fn new(query: &DatasetQuery, request_id: &RequestId) -> Self {
        Self {
            dataset: query.dataset().to_string(),
            product: query.product().to_string(),
            params: query.params().to_vec(),
            start: format_timestamp(&query.start()),
            end: format_timestamp(&query.end()),
            bbox: query.bbox(),
            request_id: request_id.to_string(),
            downloaded_at: chrono::Utc::now().to_rfc3339(),
            tool: format!("rda-met/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn matches(&self, query: &DatasetQuery) -> bool {
        let mut stored = self.params.clone();
        stored.sort();
        let mut wanted = query.params().to_vec();
        wanted.sort();
        self.dataset == query.dataset()
            && self.product == query.product()
            && self.bbox == query.bbox()
            && stored == wanted
    }
}

pub fn write_request_record(dir: &Utf8Path, record: &RequestRecord) -> Result<(), RdaError> {
    let path = dir.join(REQUEST_RECORD);
    let tmp_path = dir.join(format!("{REQUEST_RECORD}.tmp"));
    let content =
        serde_json::to_vec_pretty(record).map_err(|err| RdaError::Filesystem(err.to_string()))?;
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| RdaError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| RdaError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn read_request_record(dir: &Utf8Path) -> Result<Option<RequestRecord>, RdaError> {
    let path = dir.join(REQUEST_RECORD);
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| RdaError::Filesystem(err.to_string()))?;
    Ok(serde_json::from_str(&content).ok())
}

pub fn list_files(dir: &Utf8Path) -> Result<Vec<String>, RdaError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = current
            .read_dir_utf8()
            .map_err(|err| RdaError::Filesystem(format!("read {current}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| RdaError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| RdaError::Filesystem(format!("stat {path}: {err}")))?;
            if file_type.is_dir() {
                stack.push(path.to_path_buf());
                continue;
            }
            // Links are listed only when they resolve to a regular file and are never descended.
            if file_type.is_symlink() && !path.is_file() {
                continue;
            }
            if path.file_name() == Some(REQUEST_RECORD) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}
