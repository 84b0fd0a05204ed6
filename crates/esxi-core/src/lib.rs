//! ESXi Extraction Core Library
//!
//! This crate extracts virtual machines, disk contents and metadata, from a
//! live ESXi host without any tooling installed on the host.
//!
//! # Overview
//!
//! An [`Esxi`] connection logs in over the vSphere SOAP API, enumerates
//! objects through the property collector, downloads datastore files with
//! bounded retry and runs the export lease handshake. Stream-optimized disks
//! are decoded by [`vmdk::StreamOptimizedDisk`] into fixed-size VHD-style
//! blocks from any random-access byte source.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Connection settings and retry/poll policies
//! - [`soap`] - SOAP envelopes and the [`soap::Transport`] seam
//! - [`session`] - Session handshake and readiness
//! - [`collector`] - Paginated property retrieval
//! - [`http`] / [`download`] - Datastore downloads with retry
//! - [`export`] - Export lease handshake
//! - [`vmdk`] - Descriptor parsing and the stream-optimized block adapter
//! - [`vmx`] / [`vmsd`] - VM configuration and snapshot database parsing
//! - [`metadata`] - VM descriptor assembly
//!
//! # Quick Start
//!
//! ```no_run
//! use esxi_core::{Esxi, EsxiConfig};
//!
//! let esxi = Esxi::new(EsxiConfig::new("esxi.local", "root", "secret", false)).unwrap();
//! esxi.connect().unwrap();
//! let vm = esxi.get_transferable_vm_metadata("12").unwrap();
//! println!("{} has {} disks", vm.name_label, vm.disks.len());
//! ```

pub mod cancel;
pub mod client;
pub mod collector;
pub mod config;
pub mod download;
pub mod error;
pub mod export;
pub mod http;
pub mod kv;
pub mod metadata;
pub mod moref;
pub mod session;
pub mod soap;
pub mod vmdk;
pub mod vmsd;
pub mod vmx;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use client::{Esxi, RemoteRangeReader};
pub use collector::{PropertyMap, PropertySet, PropertyValue};
pub use config::{CollectorOptions, EsxiConfig, PollPolicy, RetryPolicy};
pub use error::{Error, Result};
pub use export::ExportLease;
pub use metadata::{VmDescriptor, VmSummary};
pub use moref::ManagedObjectRef;
