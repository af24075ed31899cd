//! Device and service records shared by every engine, plus the identity and
//! merge rules that keep discovery output free of duplicates.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a device entered the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Ssdp,
    PortScan,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::Ssdp => write!(f, "ssdp"),
            DiscoveryMethod::PortScan => write!(f, "port_scan"),
        }
    }
}

/// A UPnP service advertised in a device description. URLs are absolute
/// after normalization (resolved against the description base).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub scpd_url: String,
}

/// A discovered device. Created by discovery; control never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ip: IpAddr,
    pub port: u16,
    pub udn: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_number: String,
    pub device_type: String,
    pub description_url: String,
    pub server_header: String,
    pub discovery_method: DiscoveryMethod,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub services: Vec<Service>,
}

/// Identity key for deduplication and the persisted cache.
/// UDN wins when present, then the network endpoint; the descriptive tuple
/// is a last resort since identical speakers in different rooms collide on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceIdentity {
    Udn(String),
    Endpoint(IpAddr, u16),
    Description {
        manufacturer: String,
        model_name: String,
        friendly_name: String,
    },
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Udn(udn) => write!(f, "udn:{}", udn),
            DeviceIdentity::Endpoint(ip, port) => write!(f, "endpoint:{}:{}", ip, port),
            DeviceIdentity::Description {
                manufacturer,
                model_name,
                friendly_name,
            } => write!(
                f,
                "device:{}:{}:{}",
                friendly_name.to_lowercase().replace(' ', "_"),
                manufacturer.to_lowercase().replace(' ', "_"),
                model_name.to_lowercase().replace(' ', "_"),
            ),
        }
    }
}

/// Service URN fragments that indicate media capability
const MEDIA_SERVICE_MARKERS: &[&str] = &["avtransport", "renderingcontrol", "connectionmanager"];

impl Device {
    pub fn new(ip: IpAddr, port: u16, method: DiscoveryMethod) -> Self {
        let now = Utc::now();
        Self {
            ip,
            port,
            udn: String::new(),
            friendly_name: String::new(),
            manufacturer: String::new(),
            model_name: String::new(),
            model_number: String::new(),
            device_type: String::new(),
            description_url: String::new(),
            server_header: String::new(),
            discovery_method: method,
            first_seen: now,
            last_seen: now,
            services: Vec::new(),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        if !self.udn.trim().is_empty() {
            return DeviceIdentity::Udn(self.udn.trim().to_string());
        }
        if self.port != 0 {
            return DeviceIdentity::Endpoint(self.ip, self.port);
        }
        DeviceIdentity::Description {
            manufacturer: self.manufacturer.clone(),
            model_name: self.model_name.clone(),
            friendly_name: self.friendly_name.clone(),
        }
    }

    /// Merge a later record for the same identity into this one.
    /// Later data wins per field, except `discovery_method` where SSDP
    /// takes precedence over port-scan regardless of arrival order.
    pub fn merge_from(&mut self, later: Device) {
        fn take(dst: &mut String, src: String) {
            if !src.trim().is_empty() {
                *dst = src;
            }
        }
        take(&mut self.udn, later.udn);
        take(&mut self.friendly_name, later.friendly_name);
        take(&mut self.manufacturer, later.manufacturer);
        take(&mut self.model_name, later.model_name);
        take(&mut self.model_number, later.model_number);
        take(&mut self.device_type, later.device_type);
        take(&mut self.description_url, later.description_url);
        take(&mut self.server_header, later.server_header);
        if !later.services.is_empty() {
            self.services = later.services;
        }
        if later.discovery_method == DiscoveryMethod::Ssdp {
            self.discovery_method = DiscoveryMethod::Ssdp;
        }
        self.first_seen = self.first_seen.min(later.first_seen);
        self.last_seen = self.last_seen.max(later.last_seen);
    }

    /// Number of advertised services carrying a media-control URN
    pub fn media_service_count(&self) -> usize {
        self.services
            .iter()
            .filter(|s| {
                let lower = s.service_type.to_lowercase();
                MEDIA_SERVICE_MARKERS.iter().any(|m| lower.contains(m))
            })
            .count()
    }

    /// Whether the device looks media-capable: a renderer/server device type,
    /// a media vendor in its identity strings, or a media-control service
    pub fn is_media_device(&self) -> bool {
        const VENDOR_KEYWORDS: &[&str] = &[
            "sonos",
            "roku",
            "chromecast",
            "soundbar",
            "speaker",
            "dlna",
        ];
        let device_type = self.device_type.to_lowercase();
        if device_type.contains("mediarenderer") || device_type.contains("mediaserver") {
            return true;
        }
        let haystack = format!(
            "{} {} {}",
            self.manufacturer.to_lowercase(),
            self.model_name.to_lowercase(),
            self.friendly_name.to_lowercase()
        );
        if VENDOR_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            return true;
        }
        self.media_service_count() > 0
    }
}
