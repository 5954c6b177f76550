use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use rda_met::app::{App, FetchAction, FetchOptions, ProgressEvent, ProgressSink};
use rda_met::config::{PathIdentity, PipelineConfig};
use rda_met::domain::{BoundingBox, Credentials, DatasetQuery, RequestId, parse_timestamp};
use rda_met::download::{DownloadSession, Downloader};
use rda_met::error::RdaError;
use rda_met::poll::CancelToken;
use rda_met::rda::{RdaClient, RequestPayload};
use rda_met::store::{REQUEST_RECORD, Store, read_request_record, staging_path};

const HOST: &str = "https://data.rda.ucar.edu/dsrqst/TEST_612345";

#[derive(Debug, Default)]
struct Calls {
    submits: Vec<RequestPayload>,
    checks: usize,
    file_lists: usize,
    purges: usize,
}

#[derive(Default)]
struct MockRda {
    statuses: Mutex<VecDeque<String>>,
    manifest: Vec<String>,
    reject_submit: bool,
    purge_fails: bool,
    cancel_on_check: Option<CancelToken>,
    calls: Mutex<Calls>,
}

impl MockRda {
    fn new(statuses: &[&str], manifest: &[&str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().map(|s| s.to_string()).collect()),
            manifest: manifest.iter().map(|name| format!("{HOST}/{name}")).collect(),
            ..Self::default()
        }
    }

    fn submits(&self) -> usize {
        self.calls.lock().unwrap().submits.len()
    }

    fn checks(&self) -> usize {
        self.calls.lock().unwrap().checks
    }

    fn purges(&self) -> usize {
        self.calls.lock().unwrap().purges
    }

    fn file_lists(&self) -> usize {
        self.calls.lock().unwrap().file_lists
    }
}

impl RdaClient for MockRda {
    fn submit(
        &self,
        payload: &RequestPayload,
        _credentials: &Credentials,
    ) -> Result<RequestId, RdaError> {
        self.calls.lock().unwrap().submits.push(payload.clone());
        if self.reject_submit {
            return Err(RdaError::Provider("Invalid dataset ds999.9".to_string()));
        }
        Ok(RequestId::new("612345"))
    }

    fn check_status(&self, _id: &RequestId, _credentials: &Credentials) -> Result<String, RdaError> {
        self.calls.lock().unwrap().checks += 1;
        if let Some(token) = &self.cancel_on_check {
            token.cancel();
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Completed".to_string()))
    }

    fn file_list(
        &self,
        _id: &RequestId,
        _credentials: &Credentials,
    ) -> Result<Vec<String>, RdaError> {
        self.calls.lock().unwrap().file_lists += 1;
        Ok(self.manifest.clone())
    }

    fn purge(&self, _id: &RequestId, _credentials: &Credentials) -> Result<(), RdaError> {
        self.calls.lock().unwrap().purges += 1;
        if self.purge_fails {
            return Err(RdaError::Http("connection reset".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockDownloader {
    payloads: HashMap<String, Vec<u8>>,
    fail_on: Option<usize>,
    logins: Mutex<usize>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MockDownloader {
    fn with_payloads(payloads: &[(&str, Vec<u8>)]) -> Self {
        Self {
            payloads: payloads
                .iter()
                .map(|(name, data)| (format!("{HOST}/{name}"), data.clone()))
                .collect(),
            ..Self::default()
        }
    }

    fn logins(&self) -> usize {
        *self.logins.lock().unwrap()
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

struct MockSession {
    payloads: HashMap<String, Vec<u8>>,
    fail_on: Option<usize>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl Downloader for MockDownloader {
    type Session = MockSession;

    fn login(&self, _credentials: &Credentials) -> Result<MockSession, RdaError> {
        *self.logins.lock().unwrap() += 1;
        Ok(MockSession {
            payloads: self.payloads.clone(),
            fail_on: self.fail_on,
            fetched: Arc::clone(&self.fetched),
        })
    }
}

impl DownloadSession for MockSession {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), RdaError> {
        let index = {
            let mut fetched = self.fetched.lock().unwrap();
            fetched.push(url.to_string());
            fetched.len() - 1
        };
        let data = self
            .payloads
            .get(url)
            .cloned()
            .unwrap_or_else(|| format!("GRIB {url}").into_bytes());

        let half = data.len() / 2;
        fs::write(destination, &data[..half]).unwrap();
        progress(0.5);
        if self.fail_on == Some(index) {
            return Err(RdaError::Http("connection reset by peer".to_string()));
        }
        fs::write(destination, &data).unwrap();
        progress(1.0);
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for Recorder {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn query_with_bbox(bbox: BoundingBox) -> DatasetQuery {
    DatasetQuery::new(
        "ds084.1",
        "gfs.0p25",
        vec!["TMP".to_string(), "U GRD".to_string()],
        parse_timestamp("202401010000").unwrap(),
        parse_timestamp("202401010600").unwrap(),
        bbox,
    )
    .unwrap()
}

fn query() -> DatasetQuery {
    query_with_bbox(BoundingBox::new(30.0, 50.0, -10.0, 20.0).unwrap())
}

fn credentials() -> Credentials {
    Credentials::new("someone@example.org", "secret").unwrap()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::ZERO,
        ..PipelineConfig::default()
    }
}

fn store(dir: &tempfile::TempDir) -> Store {
    Store::new_with_base(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap())
}

fn tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, *name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn fetch_with(
    app: &App<MockRda, MockDownloader>,
    query: &DatasetQuery,
    force: bool,
) -> (Result<rda_met::app::FetchResult, RdaError>, Vec<ProgressEvent>) {
    let recorder = Recorder::default();
    let result = app.fetch(
        query,
        &credentials(),
        &FetchOptions { force },
        &recorder,
        &CancelToken::new(),
    );
    (result, recorder.events())
}

#[test]
fn fetch_downloads_expands_and_purges_once() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(
        &["Queued for Processing", "Processing", "Completed"],
        &["a.grib2", "b.csh", "c.tar"],
    );
    let archive = tar_bytes(&[
        ("c1.grib2", &b"first member"[..]),
        ("c2.grib2", &b"second member"[..]),
    ]);
    let downloader = MockDownloader::with_payloads(&[("c.tar", archive)]);
    let app = App::new(store(&temp), client, downloader, config());

    let (result, events) = fetch_with(&app, &query(), false);
    let result = result.unwrap();

    assert_eq!(result.action, FetchAction::Download);
    assert_eq!(result.request_id.as_deref(), Some("612345"));
    assert_eq!(result.files, vec!["a.grib2", "c1.grib2", "c2.grib2"]);

    let path = app.store().dataset_path(&query());
    assert_eq!(result.path, path.to_string());
    assert!(path.join("a.grib2").is_file());
    assert!(!path.join("b.csh").exists());
    assert!(!path.join("c.tar").exists());
    assert_eq!(
        fs::read(path.join("c2.grib2").as_std_path()).unwrap(),
        b"second member"
    );
    assert!(path.join(REQUEST_RECORD).is_file());
    assert!(!staging_path(&path).exists());

    assert_eq!(
        app.downloader().fetched(),
        vec![format!("{HOST}/a.grib2"), format!("{HOST}/c.tar")]
    );

    let fractions = events.iter().map(|event| event.fraction).collect::<Vec<_>>();
    assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(fractions.first().copied(), Some(0.05));
    assert_eq!(fractions.last().copied(), Some(1.0));
    assert!(events.iter().any(|event| event.message == "RDA: Processing"));
    assert!(events.iter().any(|event| event.message == "purging"));
}

#[test]
fn fetch_polls_until_completed() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&["Processing", "Processing", "Completed"], &["a.grib2"]);
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, _) = fetch_with(&app, &query(), false);
    result.unwrap();

    assert_eq!(app.client().checks(), 3);
    assert_eq!(app.client().file_lists(), 1);
    assert_eq!(app.client().purges(), 1);
}

#[test]
fn error_status_fails_without_downloading() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&["Processing", "Error"], &["a.grib2"]);
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, events) = fetch_with(&app, &query(), false);

    assert_matches!(result, Err(RdaError::JobFailed(ref status)) if status == "Error");
    assert_eq!(app.client().checks(), 2);
    assert_eq!(app.client().file_lists(), 0);
    assert_eq!(app.client().purges(), 1);
    assert_eq!(app.downloader().logins(), 0);
    assert!(!app.store().dataset_path(&query()).exists());
    assert!(events.iter().all(|event| event.fraction < 1.0));
}

#[test]
fn failed_file_leaves_earlier_files_in_staging() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&["Completed"], &["a.grib2", "b.grib2", "c.grib2"]);
    let downloader = MockDownloader {
        fail_on: Some(1),
        ..MockDownloader::default()
    };
    let app = App::new(store(&temp), client, downloader, config());

    let (result, _) = fetch_with(&app, &query(), false);

    assert_matches!(result, Err(RdaError::Http(_)));
    let path = app.store().dataset_path(&query());
    let staging = staging_path(&path);
    assert!(!path.exists());
    assert!(staging.join("a.grib2").is_file());
    assert!(!staging.join("b.grib2").exists());
    assert!(!staging.join("c.grib2").exists());
    assert_eq!(app.downloader().fetched().len(), 2);
    assert_eq!(app.client().purges(), 1);
}

#[test]
fn stale_staging_directory_is_replaced() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let staging = staging_path(&store.dataset_path(&query()));
    fs::create_dir_all(staging.as_std_path()).unwrap();
    fs::write(staging.join("leftover.grib2").as_std_path(), b"old").unwrap();

    let client = MockRda::new(&["Completed"], &["a.grib2"]);
    let app = App::new(store, client, MockDownloader::default(), config());
    let (result, _) = fetch_with(&app, &query(), false);

    assert_eq!(result.unwrap().files, vec!["a.grib2"]);
    let path = app.store().dataset_path(&query());
    assert!(!path.join("leftover.grib2").exists());
    assert!(!staging.exists());
}

#[test]
fn existing_dataset_is_skipped_unless_forced() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let path = store.dataset_path(&query());
    fs::create_dir_all(path.as_std_path()).unwrap();
    fs::write(path.join("old.grib2").as_std_path(), b"old").unwrap();

    let client = MockRda::new(&["Completed"], &["a.grib2"]);
    let app = App::new(store, client, MockDownloader::default(), config());

    let (skipped, events) = fetch_with(&app, &query(), false);
    let skipped = skipped.unwrap();
    assert_eq!(skipped.action, FetchAction::Skipped);
    assert_eq!(skipped.files, vec!["old.grib2"]);
    assert_eq!(app.client().submits(), 0);
    assert_eq!(events.last().map(|event| event.fraction), Some(1.0));

    let (forced, _) = fetch_with(&app, &query(), true);
    let forced = forced.unwrap();
    assert_eq!(forced.action, FetchAction::Download);
    assert_eq!(forced.files, vec!["a.grib2"]);
    assert!(!path.join("old.grib2").exists());
    assert_eq!(app.client().submits(), 1);
}

#[test]
fn request_identity_redownloads_on_different_area() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&[], &["a.grib2"]);
    let config = PipelineConfig {
        path_identity: PathIdentity::Request,
        ..config()
    };
    let app = App::new(store(&temp), client, MockDownloader::default(), config);

    let (first, _) = fetch_with(&app, &query(), false);
    assert_eq!(first.unwrap().action, FetchAction::Download);

    let (again, _) = fetch_with(&app, &query(), false);
    assert_eq!(again.unwrap().action, FetchAction::Skipped);

    let other = query_with_bbox(BoundingBox::new(0.0, 10.0, 0.0, 10.0).unwrap());
    assert_eq!(
        app.store().dataset_path(&other),
        app.store().dataset_path(&query())
    );
    let (moved, _) = fetch_with(&app, &other, false);
    assert_eq!(moved.unwrap().action, FetchAction::Download);
    assert_eq!(app.client().submits(), 2);

    let record = read_request_record(&app.store().dataset_path(&other))
        .unwrap()
        .unwrap();
    assert_eq!(record.bbox, other.bbox());
    assert_eq!(record.request_id, "612345");
}

#[test]
fn time_range_identity_ignores_area() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&[], &["a.grib2"]);
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    fetch_with(&app, &query(), false).0.unwrap();
    let other = query_with_bbox(BoundingBox::new(0.0, 10.0, 0.0, 10.0).unwrap());
    let (result, _) = fetch_with(&app, &other, false);

    assert_eq!(result.unwrap().action, FetchAction::Skipped);
    assert_eq!(app.client().submits(), 1);
}

#[test]
fn rejected_submission_is_not_purged() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda {
        reject_submit: true,
        ..MockRda::new(&[], &["a.grib2"])
    };
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, _) = fetch_with(&app, &query(), false);

    let err = result.unwrap_err();
    assert_matches!(err, RdaError::Provider(ref message) if message == "Invalid dataset ds999.9");
    assert!(err.is_user_error());
    assert_eq!(app.client().checks(), 0);
    assert_eq!(app.client().purges(), 0);
}

#[test]
fn purge_failure_is_reported_with_the_job_failure() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda {
        purge_fails: true,
        ..MockRda::new(&["Error"], &[])
    };
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, _) = fetch_with(&app, &query(), false);

    assert_matches!(
        result,
        Err(RdaError::PurgeAfterFailure { ref primary, ref purge })
            if matches!(**primary, RdaError::JobFailed(_)) && matches!(**purge, RdaError::Http(_))
    );
    assert_eq!(app.client().purges(), 1);
}

#[test]
fn purge_failure_after_success_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda {
        purge_fails: true,
        ..MockRda::new(&[], &["a.grib2"])
    };
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, _) = fetch_with(&app, &query(), false);

    assert_matches!(result, Err(RdaError::Http(_)));
    assert!(app.store().dataset_path(&query()).join("a.grib2").is_file());
}

#[test]
fn cancellation_during_polling_still_purges() {
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let client = MockRda {
        cancel_on_check: Some(cancel.clone()),
        ..MockRda::new(&["Processing", "Processing"], &["a.grib2"])
    };
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let result = app.fetch(
        &query(),
        &credentials(),
        &FetchOptions::default(),
        &Recorder::default(),
        &cancel,
    );

    assert_matches!(result, Err(RdaError::Cancelled));
    assert_eq!(app.client().checks(), 1);
    assert_eq!(app.client().purges(), 1);
    assert_eq!(app.downloader().logins(), 0);
}

#[test]
fn empty_manifest_skips_login() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&["Completed"], &["job.csh"]);
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let (result, _) = fetch_with(&app, &query(), false);
    let result = result.unwrap();

    assert!(result.files.is_empty());
    assert_eq!(app.downloader().logins(), 0);
    assert!(app.store().dataset_path(&query()).is_dir());
}

#[test]
fn path_reports_download_state() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockRda::new(&[], &["a.grib2"]);
    let app = App::new(store(&temp), client, MockDownloader::default(), config());

    let before = app.path(&query()).unwrap();
    assert!(!before.downloaded);
    assert!(before.path.ends_with("ds084.1/gfs.0p25/202401010000-202401010600"));

    fetch_with(&app, &query(), false).0.unwrap();
    assert!(app.path(&query()).unwrap().downloaded);
}
