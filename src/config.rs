//! Crate-wide defaults: scan ports, timeouts, concurrency caps, and the
//! stealth user-agent pool.

use std::time::Duration;

/// Ports commonly exposing UPnP description or vendor control endpoints
pub const DEFAULT_SCAN_PORTS: &[u16] = &[
    80,    // HTTP
    443,   // HTTPS
    1400,  // Sonos
    7000,  // AirPlay/RTSP
    8008,  // Chromecast
    8060,  // Roku ECP
    8443,  // HTTPS Alt
    9080,  // HTTP admin
    49200, // UPnP IGD
];

/// HTTP ports that expose an administrative surface when open
pub const ADMIN_HTTP_PORTS: &[u16] = &[80, 443, 8080, 8443, 9080];

/// Device description paths probed during the port sweep, in order.
/// Only the first 200 response per endpoint is used.
pub const DESCRIPTION_PATHS: &[&str] = &["/xml/device_description.xml", "/description.xml"];

pub const DEFAULT_SSDP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-engine concurrency caps, all overridable in the engine configs
pub const SWEEP_CONCURRENCY: usize = 256;
pub const DESCRIPTION_FETCH_CONCURRENCY: usize = 32;
pub const SCPD_FETCH_CONCURRENCY: usize = 8;
pub const MASS_PROFILE_CONCURRENCY: usize = 16;

/// Stealth request pacing bounds
pub const STEALTH_MIN_DELAY: Duration = Duration::from_millis(50);
pub const STEALTH_MAX_DELAY: Duration = Duration::from_millis(400);

/// Error snippet truncation (bytes); the larger bound applies in verbose mode
pub const SNIPPET_LEN: usize = 300;
pub const SNIPPET_LEN_VERBOSE: usize = 1000;

/// Rotating user-agent pool for stealth mode
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
];
