use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, RetryPolicy};
use crate::domain::Credentials;
use crate::error::RdaError;
use crate::poll::CancelToken;
use crate::rda::default_headers;
use crate::retry::RetryingClient;

const CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_STEP: f64 = 0.001;

pub trait DownloadSession {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), RdaError>;
}

pub trait Downloader: Send + Sync {
    type Session: DownloadSession;

    fn login(&self, credentials: &Credentials) -> Result<Self::Session, RdaError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    login_url: String,
    connect_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpDownloader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            login_url: config.login_url.clone(),
            connect_timeout: config.timeout,
            retry: config.retry.clone(),
        }
    }
}

impl Downloader for HttpDownloader {
    type Session = HttpSession;

    fn login(&self, credentials: &Credentials) -> Result<HttpSession, RdaError> {
        let client = Client::builder()
            .default_headers(default_headers()?)
            .cookie_store(true)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|err| RdaError::Http(err.to_string()))?;
        let http = RetryingClient::new(client, self.retry.clone());

        let form = [
            ("email", credentials.identifier()),
            ("passwd", credentials.secret()),
            ("action", "login"),
        ];
        let response = http.send_with_retries(|client| client.post(&self.login_url).form(&form))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(RdaError::Login(format!("status {status}: {body}")));
        }
        info!(user = credentials.identifier(), "download session established");
        Ok(HttpSession { http })
    }
}

pub struct HttpSession {
    http: RetryingClient,
}

impl DownloadSession for HttpSession {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), RdaError> {
        let mut response = self.http.send_with_retries(|client| client.get(url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| format!("download of {url} failed"));
            return Err(RdaError::Status { status, message });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = File::create(destination)
            .map_err(|err| RdaError::Filesystem(format!("create {}: {err}", destination.display())))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        let mut reported = 0.0f64;
        progress(0.0);
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| RdaError::Http(format!("reading {url}: {err}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| RdaError::Filesystem(err.to_string()))?;
            received += read as u64;
            if let Some(total) = total {
                let fraction = (received as f64 / total as f64).min(1.0);
                if fraction - reported >= PROGRESS_STEP {
                    reported = fraction;
                    progress(fraction);
                }
            }
        }
        file.flush()
            .map_err(|err| RdaError::Filesystem(err.to_string()))?;
        progress(1.0);
        debug!(url, bytes = received, "file downloaded");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress<'a> {
    pub dataset_fraction: f64,
    pub file_fraction: f64,
    pub url: &'a str,
}

pub fn file_name_from_url(url: &str) -> Result<&str, RdaError> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(name),
        _ => Err(RdaError::Provider(format!(
            "cannot derive a file name from {url}"
        ))),
    }
}

/// Downloads `urls` in manifest order into `dir`. A failed file is removed and
/// the error returned; files fetched before it stay in place.
pub fn download_files<S, F>(
    session: &S,
    urls: &[String],
    dir: &Path,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<Vec<PathBuf>, RdaError>
where
    S: DownloadSession + ?Sized,
    F: FnMut(DownloadProgress<'_>),
{
    let total = urls.len();
    let mut written = Vec::with_capacity(total);
    for (index, url) in urls.iter().enumerate() {
        cancel.check()?;
        let destination = dir.join(file_name_from_url(url)?);
        info!(url = %url, index, total, "downloading file");

        let mut report = |file_fraction: f64| {
            let file_fraction = file_fraction.clamp(0.0, 1.0);
            on_progress(DownloadProgress {
                dataset_fraction: (index as f64 + file_fraction) / total as f64,
                file_fraction,
                url: url.as_str(),
            });
        };
        if let Err(err) = session.fetch(url, &destination, &mut report) {
            if destination.exists() {
                if let Err(remove_err) = fs::remove_file(&destination) {
                    warn!(path = %destination.display(), error = %remove_err, "could not remove partial file");
                }
            }
            return Err(err);
        }
        written.push(destination);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(
            file_name_from_url("https://data.rda.ucar.edu/dsrqst/X_123/gdas1.fnl0p25.2024010100.f00.grib2")
                .unwrap(),
            "gdas1.fnl0p25.2024010100.f00.grib2"
        );
        assert_eq!(
            file_name_from_url("https://host/a/b.tar?token=1").unwrap(),
            "b.tar"
        );
        assert!(file_name_from_url("https://host/a/").is_err());
        assert!(file_name_from_url("https://host/a/..").is_err());
    }
}
