//! VM export through an `HttpNfcLease`.
//!
//! `ExportVm` hands back a lease that starts out `initializing`. The lease is
//! polled until it reports `ready`, then its info lists one URL per disk.
//! Those URLs use `*` as host and must be rewritten to the real host before
//! they can be streamed.

use std::thread;

use crate::config::PollPolicy;
use crate::error::{Error, Result};
use crate::moref::ManagedObjectRef;
use crate::session::Session;
use crate::soap::{Transport, XmlNode};

/// State of an export lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Initializing,
    Ready,
    Done,
    Error,
}

impl LeaseState {
    fn parse(state: &str) -> Result<Self> {
        match state {
            "initializing" => Ok(LeaseState::Initializing),
            "ready" => Ok(LeaseState::Ready),
            "done" => Ok(LeaseState::Done),
            "error" => Ok(LeaseState::Error),
            other => Err(Error::xml(format!("unknown lease state '{}'", other))),
        }
    }
}

/// A ready export lease and the disk URLs it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLease {
    /// The `HttpNfcLease` object.
    pub lease: ManagedObjectRef,
    /// Streamable disk URLs, host already substituted.
    pub disk_urls: Vec<String>,
}

impl<T: Transport> Session<T> {
    /// Read one property of one object with the `Fetch` call.
    pub fn fetch_property(&self, object: &ManagedObjectRef, property: &str) -> Result<XmlNode> {
        let response = self.execute(
            "Fetch",
            &[object.to_node("_this"), XmlNode::leaf("prop", property)],
        )?;
        response
            .child("returnval")
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{} of {}", property, object)))
    }

    /// Start an export of `vm` and wait until its lease is ready.
    ///
    /// A failed poll is fatal; only an `initializing` state is polled again.
    pub fn export_vm(&self, vm: &ManagedObjectRef, host: &str, poll: PollPolicy) -> Result<ExportLease> {
        let exported = self.execute("ExportVm", &[vm.to_node("_this")])?;
        let lease = exported
            .child("returnval")
            .and_then(ManagedObjectRef::from_node)
            .ok_or_else(|| Error::not_found(format!("export lease for {}", vm)))?;
        tracing::info!(%vm, %lease, "export started");

        self.wait_for_lease(&lease, poll)?;

        let info = self.fetch_property(&lease, "info")?;
        let disk_urls = disk_urls(&info, host);
        tracing::info!(%lease, disks = disk_urls.len(), "export lease ready");

        Ok(ExportLease { lease, disk_urls })
    }

    fn wait_for_lease(&self, lease: &ManagedObjectRef, poll: PollPolicy) -> Result<()> {
        for attempt in 1..=poll.attempts {
            let state = self.fetch_property(lease, "state")?;
            match LeaseState::parse(state.text.trim())? {
                LeaseState::Ready => return Ok(()),
                LeaseState::Error => {
                    let message = self
                        .fetch_property(lease, "error")
                        .ok()
                        .and_then(|e| e.text_at(&["localizedMessage"]).map(str::to_string))
                        .unwrap_or_else(|| "lease entered error state".to_string());
                    return Err(Error::LeaseFailed {
                        lease: lease.to_string(),
                        message,
                    });
                }
                LeaseState::Done => {
                    return Err(Error::LeaseFailed {
                        lease: lease.to_string(),
                        message: "lease already completed".to_string(),
                    })
                }
                LeaseState::Initializing => {
                    tracing::debug!(%lease, attempt, "export lease not ready yet");
                }
            }
            if attempt < poll.attempts {
                thread::sleep(poll.interval);
            }
        }

        Err(Error::LeaseNotReady {
            lease: lease.to_string(),
            attempts: poll.attempts,
        })
    }

    /// Release a lease after every disk was transferred.
    pub fn complete_export(&self, lease: &ManagedObjectRef) -> Result<()> {
        self.execute("HttpNfcLeaseComplete", &[lease.to_node("_this")])?;
        Ok(())
    }

    /// Release a lease without finishing the transfer.
    pub fn abort_export(&self, lease: &ManagedObjectRef) -> Result<()> {
        self.execute("HttpNfcLeaseAbort", &[lease.to_node("_this")])?;
        Ok(())
    }
}

/// Collect the `.vmdk` URLs of a lease info structure, resolving the host wildcard.
pub fn disk_urls(info: &XmlNode, host: &str) -> Vec<String> {
    info.children_named("deviceUrl")
        .filter_map(|device| device.text_at(&["url"]))
        .filter(|url| url.ends_with(".vmdk"))
        .map(|url| resolve_host(url, host))
        .collect()
}

fn resolve_host(url: &str, host: &str) -> String {
    match url.strip_prefix("https://*") {
        Some(rest) => format!("https://{}{}", host, rest),
        None => url.to_string(),
    }
}
