//! Vendor device profiles: declarative records matching a device family and
//! describing the non-UPnP sibling protocols it speaks. The store is
//! immutable after load and safe to share across engines.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::Error;

const BUILTIN_PROFILES: &str = include_str!("builtin.json");

/// Protocol families a profile can declare, in control priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Cast,
    Wam,
    Ecp,
    Heos,
    MusicCast,
    JsonRpc,
    SoundTouch,
    Upnp,
    Generic,
}

impl Protocol {
    /// Fixed selection rank; lower wins
    pub fn rank(self) -> u8 {
        match self {
            Protocol::Cast => 0,
            Protocol::Wam => 1,
            Protocol::Ecp => 2,
            Protocol::Heos => 3,
            Protocol::MusicCast => 4,
            Protocol::JsonRpc => 5,
            Protocol::SoundTouch => 6,
            Protocol::Upnp => 7,
            Protocol::Generic => 8,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Cast => write!(f, "cast"),
            Protocol::Wam => write!(f, "wam"),
            Protocol::Ecp => write!(f, "ecp"),
            Protocol::Heos => write!(f, "heos"),
            Protocol::MusicCast => write!(f, "musiccast"),
            Protocol::JsonRpc => write!(f, "jsonrpc"),
            Protocol::SoundTouch => write!(f, "soundtouch"),
            Protocol::Upnp => write!(f, "upnp"),
            Protocol::Generic => write!(f, "generic"),
        }
    }
}

/// Substring match lists, all case-insensitive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchCriteria {
    #[serde(default)]
    pub manufacturer: Vec<String>,
    #[serde(default, rename = "modelName")]
    pub model_name: Vec<String>,
    #[serde(default, rename = "deviceType")]
    pub device_type: Vec<String>,
    #[serde(default)]
    pub server_header: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpnpServiceRef {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "controlURL")]
    pub control_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcpBlock {
    pub port: u16,
    #[serde(rename = "launchURL", default = "default_ecp_launch")]
    pub launch_url: String,
    #[serde(rename = "inputURL", default = "default_ecp_input")]
    pub input_url: String,
    #[serde(rename = "deviceInfoURL", default = "default_ecp_device_info")]
    pub device_info_url: String,
}

fn default_ecp_launch() -> String {
    "/launch/2213".into()
}
fn default_ecp_input() -> String {
    "/input".into()
}
fn default_ecp_device_info() -> String {
    "/query/device-info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WamCommand {
    pub cmd: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WamBlock {
    pub port: u16,
    #[serde(rename = "setUrlPlayback", default)]
    pub set_url_playback: Option<WamCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastBlock {
    pub port: u16,
    #[serde(rename = "deviceDescURL", default)]
    pub device_desc_url: String,
    #[serde(rename = "mediaNamespace", default)]
    pub media_namespace: String,
    #[serde(rename = "launchURL", default)]
    pub launch_url: String,
}

/// Shared shape for vendor HTTP APIs driven purely by endpoint templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorHttpBlock {
    pub port: u16,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub commands: HashMap<String, String>,
}

/// One device-family profile loaded from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(rename = "match", default)]
    pub criteria: MatchCriteria,
    #[serde(default)]
    pub upnp: Option<HashMap<String, UpnpServiceRef>>,
    #[serde(default)]
    pub ecp: Option<EcpBlock>,
    #[serde(default)]
    pub wam: Option<WamBlock>,
    #[serde(default)]
    pub cast: Option<CastBlock>,
    #[serde(default)]
    pub heos: Option<VendorHttpBlock>,
    #[serde(default)]
    pub musiccast: Option<VendorHttpBlock>,
    #[serde(default)]
    pub jsonrpc: Option<VendorHttpBlock>,
    #[serde(default)]
    pub soundtouch: Option<VendorHttpBlock>,
    #[serde(default)]
    pub generic_fallback: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Category weights for match scoring
const WEIGHT_MANUFACTURER: u32 = 4;
const WEIGHT_MODEL: u32 = 3;
const WEIGHT_DEVICE_TYPE: u32 = 2;
const WEIGHT_SERVER: u32 = 1;

impl DeviceProfile {
    /// Highest-priority protocol this profile declares
    pub fn primary_protocol(&self) -> Protocol {
        if self.cast.is_some() {
            Protocol::Cast
        } else if self.wam.is_some() {
            Protocol::Wam
        } else if self.ecp.is_some() {
            Protocol::Ecp
        } else if self.heos.is_some() {
            Protocol::Heos
        } else if self.musiccast.is_some() {
            Protocol::MusicCast
        } else if self.jsonrpc.is_some() {
            Protocol::JsonRpc
        } else if self.soundtouch.is_some() {
            Protocol::SoundTouch
        } else if self.upnp.is_some() && !self.generic_fallback {
            Protocol::Upnp
        } else {
            Protocol::Generic
        }
    }

    /// Weighted match score plus the longest matched token, used to break
    /// ties in favor of the more specific profile
    pub fn match_score(&self, device: &Device) -> (u32, usize) {
        let mut score = 0;
        let mut longest = 0;

        let mut check = |tokens: &[String], field: &str, weight: u32| {
            let field = field.to_lowercase();
            let matched: Vec<&String> = tokens
                .iter()
                .filter(|t| !t.is_empty() && field.contains(&t.to_lowercase()))
                .collect();
            if !matched.is_empty() {
                score += weight;
                longest = longest.max(matched.iter().map(|t| t.len()).max().unwrap_or(0));
            }
        };

        check(
            &self.criteria.manufacturer,
            &device.manufacturer,
            WEIGHT_MANUFACTURER,
        );
        check(&self.criteria.model_name, &device.model_name, WEIGHT_MODEL);
        check(
            &self.criteria.device_type,
            &device.device_type,
            WEIGHT_DEVICE_TYPE,
        );
        check(
            &self.criteria.server_header,
            &device.server_header,
            WEIGHT_SERVER,
        );

        (score, longest)
    }
}

/// Best profile for a device along with its score and selected protocol
#[derive(Debug, Clone)]
pub struct ProfileMatch {
    pub profile: Arc<DeviceProfile>,
    pub score: u32,
    pub primary_protocol: Protocol,
}

/// JSON bundle layout: either a bare list or `{"device_profiles": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileFile {
    Bundle { device_profiles: Vec<DeviceProfile> },
    List(Vec<DeviceProfile>),
}

impl ProfileFile {
    fn into_profiles(self) -> Vec<DeviceProfile> {
        match self {
            ProfileFile::Bundle { device_profiles } => device_profiles,
            ProfileFile::List(profiles) => profiles,
        }
    }
}

/// Immutable catalog of profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Vec<Arc<DeviceProfile>>,
}

impl ProfileStore {
    /// Store seeded with the compiled-in catalog
    pub fn with_builtin() -> Self {
        let profiles: ProfileFile =
            serde_json::from_str(BUILTIN_PROFILES).expect("builtin profile catalog is valid");
        Self::from_profiles(profiles.into_profiles())
    }

    pub fn from_profiles(profiles: Vec<DeviceProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
        }
    }

    /// Load every profile JSON in a directory: a `profiles.json` bundle
    /// and/or individual per-family files. Unreadable files are skipped.
    pub fn extend_from_dir(&mut self, dir: &Path) -> Result<usize, Error> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "profile file unreadable");
                    continue;
                }
            };
            match serde_json::from_str::<ProfileFile>(&content) {
                Ok(file) => {
                    for profile in file.into_profiles() {
                        debug!(profile = %profile.name, "loaded profile");
                        self.profiles.push(Arc::new(profile));
                        loaded += 1;
                    }
                }
                Err(e) => {
                    // A single profile object is also accepted
                    match serde_json::from_str::<DeviceProfile>(&content) {
                        Ok(profile) => {
                            self.profiles.push(Arc::new(profile));
                            loaded += 1;
                        }
                        Err(_) => {
                            warn!(path = %path.display(), error = %e, "invalid profile file")
                        }
                    }
                }
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All eligible profiles for a device, highest score first. A profile
    /// needs a positive score; the generic fallback is eligible at score 1
    /// for any device exposing a MediaRenderer surface.
    pub fn ranked_matches(&self, device: &Device) -> Vec<(Arc<DeviceProfile>, u32)> {
        let mut ranked: Vec<(Arc<DeviceProfile>, u32, usize)> = Vec::new();
        for profile in &self.profiles {
            let (score, longest) = profile.match_score(device);
            if score > 0 {
                ranked.push((profile.clone(), score, longest));
            } else if profile.generic_fallback && is_media_renderer(device) {
                ranked.push((profile.clone(), 1, 0));
            }
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        ranked
            .into_iter()
            .map(|(profile, score, _)| (profile, score))
            .collect()
    }

    pub fn best_match(&self, device: &Device) -> Option<ProfileMatch> {
        let (profile, score) = self.ranked_matches(device).into_iter().next()?;
        let primary_protocol = profile.primary_protocol();
        Some(ProfileMatch {
            profile,
            score,
            primary_protocol,
        })
    }
}

fn is_media_renderer(device: &Device) -> bool {
    device
        .device_type
        .to_lowercase()
        .contains("mediarenderer")
        || device.services.iter().any(|s| {
            let lower = s.service_type.to_lowercase();
            lower.contains("avtransport") || lower.contains("renderingcontrol")
        })
}
