//! Edge service manager core.
//!
//! Takes a desired deployment — services, filesystem layers and service
//! instances with their network and resource requirements — and reconciles
//! the host to run exactly that set: the [`launcher`] drives install, start
//! and stop; the [`layermanager`] keeps a content-addressed layer cache with
//! TTL-bound eviction; the [`network`] module builds per-instance CNI
//! pipelines with firewall, bandwidth and DNS rules; the [`monitoring`]
//! module samples resource usage and raises quota alerts; and the
//! [`spaceallocator`] arbitrates disk use between the caches sharing a
//! partition.
//!
//! The CLI, IPC transport, OCI runtime invocation and netlink/iptables
//! plumbing live outside this crate and are reached through the traits each
//! module exposes.

pub mod config;
pub mod error;
pub mod launcher;
pub mod layermanager;
pub mod monitoring;
pub mod network;
pub mod oci;
pub mod resourcemanager;
pub mod spaceallocator;
pub mod storage;
pub mod tools;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
