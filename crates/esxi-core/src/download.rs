//! Authenticated file downloads from a host's datastore browser.
//!
//! Files are served at `https://<host>/folder/<path>?dcPath=<dc>&dsName=<ds>`.
//! The first request authenticates with basic credentials; the cookie the
//! host returns is reused for every later request.

use std::sync::Mutex;

use reqwest::Url;

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::http::{fold_set_cookies, Auth, ByteRange, HttpBackend, HttpRequest, HttpResponse};

/// Range-capable downloader with bounded retry.
pub struct DownloadClient<B> {
    backend: B,
    host: String,
    user: String,
    password: String,
    retry: RetryPolicy,
    cookie: Mutex<Option<String>>,
}

impl<B: HttpBackend> DownloadClient<B> {
    /// Create a client for `host`.
    pub fn new(
        backend: B,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            host: host.into(),
            user: user.into(),
            password: password.into(),
            retry,
            cookie: Mutex::new(None),
        }
    }

    /// The cookie currently presented with requests.
    pub fn cookie(&self) -> Option<String> {
        self.cookie.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// URL of `path` on `datastore`.
    pub fn file_url(&self, dc_path: &str, datastore: &str, path: &str) -> Result<String> {
        let mut url = Url::parse(&format!("https://{}/", self.host)).map_err(|e| Error::Transport {
            url: self.host.clone(),
            message: e.to_string(),
        })?;
        url.set_path(&format!("/folder/{}", path.trim_start_matches('/')));
        url.query_pairs_mut()
            .append_pair("dcPath", dc_path)
            .append_pair("dsName", datastore);
        Ok(url.into())
    }

    /// Download `path` from `datastore`, optionally limited to `range`.
    pub fn download(
        &self,
        dc_path: &str,
        datastore: &str,
        path: &str,
        range: Option<ByteRange>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        let url = self.file_url(dc_path, datastore, path)?;
        self.with_retry(&url, range, None, false, cancel)
    }

    /// Like [`download`](Self::download) for a file that may not exist.
    ///
    /// A 404 ends the retry loop at once and yields `None`; other failures are
    /// retried as usual.
    pub fn download_optional(
        &self,
        dc_path: &str,
        datastore: &str,
        path: &str,
        cancel: &CancelToken,
    ) -> Result<Option<HttpResponse>> {
        let url = self.file_url(dc_path, datastore, path)?;
        match self.with_retry(&url, None, None, true, cancel) {
            Ok(response) => Ok(Some(response)),
            Err(error) if error.is_http_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Download an absolute URL, presenting `cookie` if given.
    pub fn download_url(
        &self,
        url: &str,
        cookie: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        self.with_retry(url, None, cookie, false, cancel)
    }

    fn with_retry(
        &self,
        url: &str,
        range: Option<ByteRange>,
        cookie: Option<&str>,
        missing_is_final: bool,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    url: url.to_string(),
                });
            }

            match self.attempt(url, range, cookie) {
                Ok(response) => return Ok(response),
                Err(error) if missing_is_final && error.is_http_not_found() => {
                    tracing::debug!(%url, "file not present");
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(%url, attempt, attempts, %error, "download failed");
                    if attempt >= attempts {
                        return Err(error);
                    }
                }
            }

            if cancel.wait(self.retry.delay) {
                return Err(Error::Cancelled {
                    url: url.to_string(),
                });
            }
            attempt += 1;
        }
    }

    fn attempt(&self, url: &str, range: Option<ByteRange>, cookie: Option<&str>) -> Result<HttpResponse> {
        let auth = match cookie.map(str::to_string).or_else(|| self.cookie()) {
            Some(cookie) => Auth::Cookie(cookie),
            None => Auth::Basic {
                user: self.user.clone(),
                password: self.password.clone(),
            },
        };
        let request = HttpRequest {
            url: url.to_string(),
            auth,
            range,
        };

        tracing::debug!(%url, ?range, "download attempt");
        let response = self.backend.get(&request)?;
        if !response.is_success() {
            return Err(Error::Http {
                status: response.status,
                reason: response.reason.clone(),
                url: url.to_string(),
            });
        }

        if let Some(cookie) = fold_set_cookies(&response.set_cookies) {
            *self.cookie.lock().unwrap_or_else(|e| e.into_inner()) = Some(cookie);
        }
        Ok(response)
    }
}
