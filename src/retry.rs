use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::RdaError;

const MAX_BACKOFF: Duration = Duration::from_secs(120);

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_factor
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.status_forcelist.contains(&status)
    }
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Clone)]
pub struct RetryingClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn send_once(&self, request: RequestBuilder) -> Result<Response, RdaError> {
        request
            .send()
            .map_err(|err| RdaError::Http(err.to_string()))
    }

    pub fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, RdaError>
    where
        F: FnMut(&Client) -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let response = make_req(&self.client).send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.policy.max_retries && self.policy.is_retryable_status(status)
                    {
                        let delay = self.policy.delay_for(attempt);
                        debug!(status, attempt, ?delay, "retrying after server error");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.policy.max_retries && is_retryable_error(&err) {
                        let delay = self.policy.delay_for(attempt);
                        debug!(error = %err, attempt, ?delay, "retrying after transport error");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    warn!(error = %err, attempts = attempt + 1, "giving up on request");
                    return Err(RdaError::Http(err.to_string()));
                }
            }
        }
    }
}
