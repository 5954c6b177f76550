use std::cell::Cell;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::expand_archives;
use crate::config::PipelineConfig;
use crate::domain::{Credentials, DatasetQuery, RequestId};
use crate::download::{Downloader, download_files};
use crate::error::RdaError;
use crate::poll::{CancelToken, JobStatus, StatusPoller};
use crate::rda::{RdaClient, RequestPayload, resolve_file_list};
use crate::store::{RequestRecord, StagingArea, Store, list_files, write_request_record};

const DOWNLOAD_START: f64 = 0.2;
const DOWNLOAD_END: f64 = 0.9;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchAction {
    Download,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub dataset: String,
    pub product: String,
    pub path: String,
    pub action: FetchAction,
    pub request_id: Option<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathResult {
    pub path: String,
    pub downloaded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub fraction: f64,
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

struct Progress<'a> {
    sink: &'a dyn ProgressSink,
    last: Cell<f64>,
}

impl<'a> Progress<'a> {
    fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            last: Cell::new(0.0),
        }
    }

    fn emit(&self, fraction: f64, message: impl Into<String>) {
        let fraction = fraction.clamp(0.0, 1.0).max(self.last.get());
        self.last.set(fraction);
        self.sink.event(ProgressEvent {
            fraction,
            message: message.into(),
        });
    }
}

pub struct App<C: RdaClient, D: Downloader> {
    store: Store,
    client: C,
    downloader: D,
    config: PipelineConfig,
}

impl<C: RdaClient, D: Downloader> App<C, D> {
    pub fn new(store: Store, client: C, downloader: D, config: PipelineConfig) -> Self {
        Self {
            store,
            client,
            downloader,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    pub fn path(&self, query: &DatasetQuery) -> Result<PathResult, RdaError> {
        Ok(PathResult {
            path: self.store.dataset_path(query).to_string(),
            downloaded: self
                .store
                .is_downloaded(query, self.config.path_identity)?,
        })
    }

    /// Runs submit, poll, download, expand and promote for one query. The
    /// remote request is purged on every exit once it has been created.
    pub fn fetch(
        &self,
        query: &DatasetQuery,
        credentials: &Credentials,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FetchResult, RdaError> {
        let progress = Progress::new(sink);
        let path = self.store.dataset_path(query);

        if !options.force && self.store.is_downloaded(query, self.config.path_identity)? {
            info!(path = %path, "dataset already downloaded");
            progress.emit(1.0, "already downloaded");
            return Ok(FetchResult {
                dataset: query.dataset().to_string(),
                product: query.product().to_string(),
                path: path.to_string(),
                action: FetchAction::Skipped,
                request_id: None,
                files: list_files(&path)?,
            });
        }
        self.store.remove_dataset(&path)?;
        cancel.check()?;

        progress.emit(0.05, "submitting");
        let payload = RequestPayload::from(query);
        let request_id = self.client.submit(&payload, credentials)?;
        progress.emit(0.1, "submitted");

        let files = self.with_remote_job(&request_id, credentials, &progress, || {
            self.wait_for_job(&request_id, credentials, &progress, cancel)?;
            progress.emit(DOWNLOAD_START, "ready");
            self.download_dataset(query, &request_id, credentials, &path, &progress, cancel)
        })?;

        progress.emit(1.0, "complete");
        Ok(FetchResult {
            dataset: query.dataset().to_string(),
            product: query.product().to_string(),
            path: path.to_string(),
            action: FetchAction::Download,
            request_id: Some(request_id.to_string()),
            files,
        })
    }

    /// Runs `work`, then purges the request whatever `work` returned.
    fn with_remote_job<T, F>(
        &self,
        request_id: &RequestId,
        credentials: &Credentials,
        progress: &Progress<'_>,
        work: F,
    ) -> Result<T, RdaError>
    where
        F: FnOnce() -> Result<T, RdaError>,
    {
        let outcome = work();
        if let Err(err) = &outcome {
            error!(request_id = %request_id, error = %err, "request failed");
        }
        progress.emit(0.95, "purging");
        let purged = self.client.purge(request_id, credentials);

        match (outcome, purged) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(purge)) => {
                warn!(request_id = %request_id, error = %purge, "purge failed");
                Err(purge)
            }
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(purge)) => Err(RdaError::PurgeAfterFailure {
                primary: Box::new(primary),
                purge: Box::new(purge),
            }),
        }
    }

    fn wait_for_job(
        &self,
        request_id: &RequestId,
        credentials: &Credentials,
        progress: &Progress<'_>,
        cancel: &CancelToken,
    ) -> Result<(), RdaError> {
        let poller = StatusPoller::new(self.config.status.clone(), self.config.poll_interval);
        poller.wait_until_ready(
            &self.client,
            request_id,
            credentials,
            cancel,
            |_: &JobStatus, raw: &str| progress.emit(0.1, format!("RDA: {raw}")),
            |interval| cancel.sleep(interval),
        )
    }

    fn download_dataset(
        &self,
        query: &DatasetQuery,
        request_id: &RequestId,
        credentials: &Credentials,
        path: &Utf8Path,
        progress: &Progress<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, RdaError> {
        let staging = StagingArea::create(path)?;
        let urls = resolve_file_list(
            &self.client,
            request_id,
            credentials,
            &self.config.ignore_suffixes,
        )?;
        info!(request_id = %request_id, files = urls.len(), "downloading dataset");

        if !urls.is_empty() {
            let session = self.downloader.login(credentials)?;
            download_files(
                &session,
                &urls,
                staging.path().as_std_path(),
                cancel,
                |step| {
                    progress.emit(
                        DOWNLOAD_START + (DOWNLOAD_END - DOWNLOAD_START) * step.dataset_fraction,
                        format!(
                            "downloading {} ({:.1}%)",
                            step.url,
                            step.file_fraction * 100.0
                        ),
                    )
                },
            )?;
        }

        progress.emit(DOWNLOAD_END, "expanding archives");
        expand_archives(staging.path().as_std_path(), &self.config.archive_extensions)?;
        write_request_record(staging.path(), &RequestRecord::new(query, request_id))?;
        let files = list_files(staging.path())?;

        progress.emit(0.92, "finalizing");
        staging.finalize()?;
        Ok(files)
    }
}
