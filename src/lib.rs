//! UPnP reconnaissance, profiling, and control toolkit for IPv4 LANs.
//!
//! The crate is organized around three engines that share a common data model:
//!
//! - [`discovery::DiscoveryEngine`] finds every UPnP/DLNA/DIAL device on the
//!   network via SSDP multicast plus an optional TCP port sweep, and returns a
//!   deduplicated [`device::Device`] list.
//! - [`profiling::ProfilingEngine`] fetches and parses each device's service
//!   control protocol descriptions into an [`profiling::ActionInventory`] of
//!   every invokable action, with argument typing and categorization.
//! - [`control::ControlEngine`] executes a named action on a device, selecting
//!   a protocol adapter (SOAP/UPnP, Roku ECP, Samsung WAM, vendor HTTP APIs)
//!   from the device's matched [`profile::DeviceProfile`].
//!
//! [`orchestrate::MassOrchestrator`] chains discovery, matching, and profiling
//! over a whole LAN and produces a prioritized target report. [`cache::DeviceCache`]
//! persists discovered devices between runs.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod control;
pub mod device;
pub mod discovery;
pub mod error;
pub mod http;
pub mod orchestrate;
pub mod profile;
pub mod profiling;
pub mod scpd;
pub mod xml;

pub use cancel::CancelToken;
pub use device::{Device, DeviceIdentity, Service};
pub use error::Error;
