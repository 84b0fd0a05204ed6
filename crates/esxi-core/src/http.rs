//! Plain HTTP GET plumbing shared by file downloads and export streaming.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, COOKIE, RANGE, SET_COOKIE};

use crate::error::{Error, Result};

/// How a request authenticates against the host.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// A previously issued session cookie.
    Cookie(String),
    /// HTTP basic credentials.
    Basic { user: String, password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Cookie(_) => f.write_str("Cookie(<redacted>)"),
            Auth::Basic { user, .. } => write!(f, "Basic({})", user),
        }
    }
}

/// An inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Range of `len` bytes starting at `start`. `len` must be non-zero.
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.max(1) - 1,
        }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A GET request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Authentication to present.
    pub auth: Auth,
    /// Optional byte range.
    pub range: Option<ByteRange>,
}

/// A response with a streaming body.
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Status reason phrase.
    pub reason: String,
    /// Raw `Set-Cookie` header values.
    pub set_cookies: Vec<String>,
    /// Raw `Content-Range` header value.
    pub content_range: Option<String>,
    /// Declared body length.
    pub content_length: Option<u64>,
    /// Response body.
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// Build a response around an in-memory body.
    pub fn from_bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            reason: String::new(),
            set_cookies: Vec::new(),
            content_range: None,
            content_length: Some(body.len() as u64),
            body: Box::new(std::io::Cursor::new(body)),
        }
    }

    /// Add a `Set-Cookie` value.
    pub fn with_set_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.set_cookies.push(cookie.into());
        self
    }

    /// Set the `Content-Range` value.
    pub fn with_content_range(mut self, value: impl Into<String>) -> Self {
        self.content_range = Some(value.into());
        self
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Total resource size announced by `Content-Range: bytes a-b/total`.
    pub fn total_size(&self) -> Option<u64> {
        let value = self.content_range.as_deref()?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    /// Read the whole body.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.content_length.unwrap_or(0).min(1 << 24) as usize);
        self.body.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Read the whole body as UTF-8 text.
    pub fn into_text(self) -> Result<String> {
        let data = self.into_bytes()?;
        String::from_utf8(data).map_err(|e| {
            Error::io_simple(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Something that can perform a GET.
pub trait HttpBackend: Send + Sync {
    /// Perform one request. Non-2xx statuses are returned, not raised.
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpBackend`] over a blocking `reqwest` client.
pub struct ReqwestBackend {
    client: reqwest::blocking::Client,
}

impl ReqwestBackend {
    /// Build a backend; `ssl_verify = false` accepts self-signed host certificates.
    pub fn new(ssl_verify: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!ssl_verify)
            .connect_timeout(Duration::from_secs(30))
            // disk streams can run for hours
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl HttpBackend for ReqwestBackend {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.get(&request.url);
        builder = match &request.auth {
            Auth::Cookie(cookie) => builder.header(COOKIE, cookie),
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
        };
        if let Some(range) = request.range {
            builder = builder
                .header(CONTENT_TYPE, "multipart/byteranges")
                .header(RANGE, range.header_value());
        }

        let response = builder.send().map_err(|e| Error::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let headers = response.headers();
        let set_cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let content_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            set_cookies,
            content_range,
            content_length,
            body: Box::new(response),
        })
    }
}

/// Reduce `Set-Cookie` values to their `name=value` parts joined for reuse.
///
/// Returns `None` when there is nothing to store.
pub fn fold_set_cookies<S: AsRef<str>>(set_cookies: &[S]) -> Option<String> {
    let parts: Vec<&str> = set_cookies
        .iter()
        .filter_map(|c| c.as_ref().split(';').next())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
