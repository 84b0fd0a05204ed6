//! One connection to an ESXi host.
//!
//! [`Esxi`] owns the API session and the datastore download client, and is
//! the entry point for enumeration, downloads, exports and power operations.

use std::sync::OnceLock;

use crate::cancel::CancelToken;
use crate::collector::PropertySet;
use crate::config::EsxiConfig;
use crate::download::DownloadClient;
use crate::error::{Error, Result};
use crate::export::ExportLease;
use crate::http::{ByteRange, HttpBackend, HttpResponse, ReqwestBackend};
use crate::moref::ManagedObjectRef;
use crate::session::Session;
use crate::soap::{SoapTransport, Transport};
use crate::vmdk::{RangeReader, StreamOptimizedDisk};

/// A connection to one host.
///
/// ```no_run
/// use esxi_core::{Esxi, EsxiConfig};
///
/// let esxi = Esxi::new(EsxiConfig::new("esxi.local", "root", "secret", true)).unwrap();
/// esxi.connect().unwrap();
/// for vm in esxi.get_all_vm_metadata().unwrap() {
///     println!("{} {}", vm.id, vm.name_label);
/// }
/// ```
pub struct Esxi<T = SoapTransport, B = ReqwestBackend> {
    config: EsxiConfig,
    session: Session<T>,
    downloads: DownloadClient<B>,
}

impl Esxi {
    /// Build the HTTP clients for `config`; nothing is sent until [`Esxi::connect`].
    pub fn new(config: EsxiConfig) -> Result<Self> {
        let transport = SoapTransport::new(&config.host, config.ssl_verify)?;
        let backend = ReqwestBackend::new(config.ssl_verify)?;
        Ok(Self::with_parts(config, transport, backend))
    }
}

impl<T: Transport, B: HttpBackend> Esxi<T, B> {
    /// Assemble a connection from explicit transport and HTTP backends.
    pub fn with_parts(config: EsxiConfig, transport: T, backend: B) -> Self {
        let session = Session::new(transport, &config.user, &config.password, config.collector);
        let downloads = DownloadClient::new(
            backend,
            &config.host,
            &config.user,
            &config.password,
            config.retry,
        );
        Self {
            config,
            session,
            downloads,
        }
    }

    pub fn config(&self) -> &EsxiConfig {
        &self.config
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn downloads(&self) -> &DownloadClient<B> {
        &self.downloads
    }

    /// Log in and resolve the datacenter.
    pub fn connect(&self) -> Result<()> {
        self.session.connect()
    }

    /// Enumerate every object of `object_type`.
    pub fn search(&self, object_type: &str, properties: &[&str]) -> Result<PropertySet> {
        self.session.search(object_type, properties)
    }

    /// Download a datastore file, optionally a byte range of it.
    pub fn download(
        &self,
        datastore: &str,
        path: &str,
        range: Option<ByteRange>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        let dc_path = self.session.datacenter_path()?;
        self.downloads.download(&dc_path, datastore, path, range, cancel)
    }

    /// Download a whole datastore text file.
    pub fn download_text(&self, datastore: &str, path: &str) -> Result<String> {
        self.download(datastore, path, None, &CancelToken::never())?
            .into_text()
    }

    /// Download a text file that may be absent; a 404 yields `None` without retrying.
    pub fn download_optional_text(&self, datastore: &str, path: &str) -> Result<Option<String>> {
        let dc_path = self.session.datacenter_path()?;
        self.downloads
            .download_optional(&dc_path, datastore, path, &CancelToken::never())?
            .map(HttpResponse::into_text)
            .transpose()
    }

    /// Stream an export lease URL with the API session cookie.
    pub fn download_url(&self, url: &str, cancel: &CancelToken) -> Result<HttpResponse> {
        if !self.session.is_ready() {
            return Err(Error::not_ready(format!("download {}", url)));
        }
        let cookie = self.session.session_cookie();
        self.downloads.download_url(url, cookie.as_deref(), cancel)
    }

    /// Export a VM and wait for its disk URLs.
    pub fn export_vm(&self, vm_id: &str) -> Result<ExportLease> {
        let vm = ManagedObjectRef::new("VirtualMachine", vm_id);
        self.session.export_vm(&vm, &self.config.host, self.config.poll)
    }

    pub fn complete_export(&self, lease: &ExportLease) -> Result<()> {
        self.session.complete_export(&lease.lease)
    }

    pub fn abort_export(&self, lease: &ExportLease) -> Result<()> {
        self.session.abort_export(&lease.lease)
    }

    /// Start powering on a VM; returns the task.
    pub fn power_on(&self, vm_id: &str) -> Result<ManagedObjectRef> {
        self.power("PowerOnVM_Task", vm_id)
    }

    /// Start powering off a VM; returns the task.
    pub fn power_off(&self, vm_id: &str) -> Result<ManagedObjectRef> {
        self.power("PowerOffVM_Task", vm_id)
    }

    fn power(&self, command: &str, vm_id: &str) -> Result<ManagedObjectRef> {
        let vm = ManagedObjectRef::new("VirtualMachine", vm_id);
        let response = self.session.execute(command, &[vm.to_node("_this")])?;
        let task = response
            .child("returnval")
            .and_then(ManagedObjectRef::from_node)
            .ok_or_else(|| Error::not_found(format!("task of {} for {}", command, vm)))?;
        tracing::info!(%vm, %task, command, "power task started");
        Ok(task)
    }

    /// Open a stream-optimized VMDK on a datastore as a block device.
    pub fn open_disk(&self, datastore: &str, path: &str) -> Result<StreamOptimizedDisk<RemoteRangeReader<'_, B>>> {
        let reader = RemoteRangeReader {
            downloads: &self.downloads,
            dc_path: self.session.datacenter_path()?,
            datastore: datastore.to_string(),
            path: path.to_string(),
            size: OnceLock::new(),
        };
        StreamOptimizedDisk::open(reader, format!("[{}] {}", datastore, path))
    }
}

/// Byte ranges of a datastore file, fetched with HTTP range requests.
pub struct RemoteRangeReader<'a, B> {
    downloads: &'a DownloadClient<B>,
    dc_path: String,
    datastore: String,
    path: String,
    size: OnceLock<u64>,
}

impl<B: HttpBackend> RemoteRangeReader<'_, B> {
    fn fetch(&self, range: ByteRange) -> Result<HttpResponse> {
        self.downloads.download(
            &self.dc_path,
            &self.datastore,
            &self.path,
            Some(range),
            &CancelToken::never(),
        )
    }
}

impl<B: HttpBackend> RangeReader for RemoteRangeReader<'_, B> {
    fn size(&self) -> Result<u64> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let response = self.fetch(ByteRange::new(0, 1))?;
        let size = match (response.status, response.total_size()) {
            (206, Some(total)) => total,
            (200, _) => response.content_length.ok_or_else(|| {
                Error::vmdk(format!("no length for [{}] {}", self.datastore, self.path))
            })?,
            _ => {
                return Err(Error::vmdk(format!(
                    "no Content-Range total for [{}] {}",
                    self.datastore, self.path
                )))
            }
        };
        Ok(*self.size.get_or_init(|| size))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size()?;
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset);

        let response = self.fetch(ByteRange::new(offset, len))?;
        if response.status != 206 {
            return Err(Error::Http {
                status: response.status,
                reason: "range request not honoured".to_string(),
                url: format!("[{}] {}", self.datastore, self.path),
            });
        }
        let data = response.into_bytes()?;
        let read = data.len().min(len as usize);
        buf[..read].copy_from_slice(&data[..read]);
        Ok(read)
    }
}
