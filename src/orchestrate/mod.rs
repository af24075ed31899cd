//! Mass orchestrator. Runs discovery over a LAN, matches every device
//! against the profile catalog, optionally profiles each one in depth, and
//! emits a prioritized target report.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::ADMIN_HTTP_PORTS;
use crate::device::{Device, DeviceIdentity};
use crate::discovery::{DiscoveryConfig, DiscoveryEngine};
use crate::error::Error;
use crate::profile::{ProfileMatch, ProfileStore, Protocol};
use crate::profiling::{CapabilityCounts, ProfilingEngine, ProfilingResult};

/// Score components for one device
#[derive(Debug, Clone, Default)]
pub struct ScoreInputs {
    pub protocol: Option<Protocol>,
    pub media_service_count: usize,
    pub security_action_count: usize,
    pub has_admin_interface: bool,
    pub exposed_http_admin: bool,
    pub media_capable: bool,
}

/// Weighted priority in [0, 100]: directly controllable vendor protocols
/// first, then UPnP media surface, security-relevant actions, and exposed
/// admin interfaces.
pub fn priority_score(inputs: &ScoreInputs) -> u8 {
    let mut score: usize = match inputs.protocol {
        Some(Protocol::Cast) => 15,
        Some(Protocol::Wam) => 12,
        Some(Protocol::Ecp) => 10,
        _ => 0,
    };
    score += 2 * inputs.media_service_count;
    score += 10 * inputs.security_action_count;
    if inputs.has_admin_interface {
        score += 8;
    }
    if inputs.exposed_http_admin {
        score += 15;
    }
    if inputs.media_capable {
        score += 5;
    }
    score.min(100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBucket {
    High,
    Medium,
    Low,
    Unknown,
}

impl PriorityBucket {
    pub fn from_score(score: u8) -> Self {
        match score {
            20.. => PriorityBucket::High,
            10..=19 => PriorityBucket::Medium,
            1..=9 => PriorityBucket::Low,
            0 => PriorityBucket::Unknown,
        }
    }
}

/// One device's assessment in the target report
#[derive(Debug, Clone, Serialize)]
pub struct TargetAssessment {
    pub device: Device,
    pub profile_name: Option<String>,
    pub match_score: u32,
    pub primary_protocol: Protocol,
    pub priority_score: u8,
    pub categories: CapabilityCounts,
    pub security_findings: Vec<String>,
}

impl TargetAssessment {
    pub fn bucket(&self) -> PriorityBucket {
        PriorityBucket::from_score(self.priority_score)
    }
}

/// Report over a whole LAN, ordered by priority descending
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssessmentReport {
    pub targets: Vec<TargetAssessment>,
}

impl AssessmentReport {
    pub fn in_bucket(&self, bucket: PriorityBucket) -> Vec<&TargetAssessment> {
        self.targets
            .iter()
            .filter(|t| t.bucket() == bucket)
            .collect()
    }
}

/// Service URNs that mark an administrative surface
const ADMIN_SERVICE_MARKERS: &[&str] = &[
    "deviceproperties",
    "systemproperties",
    "configurationmanagement",
    "manageabledevice",
];

/// Assess one device from its match and (optional) profiling result
pub fn assess_device(
    device: Device,
    matched: Option<&ProfileMatch>,
    profiled: Option<&ProfilingResult>,
) -> TargetAssessment {
    let device_type = device.device_type.to_lowercase();
    let has_admin_interface = device_type.contains("internetgatewaydevice")
        || device.services.iter().any(|s| {
            let lower = s.service_type.to_lowercase();
            ADMIN_SERVICE_MARKERS.iter().any(|m| lower.contains(m))
        });

    let mut security_findings: Vec<String> = profiled
        .map(|p| p.inventory.security_actions())
        .unwrap_or_default();
    let exposed_http_admin = ADMIN_HTTP_PORTS.contains(&device.port);
    if exposed_http_admin {
        security_findings.push(format!("http admin surface on port {}", device.port));
    }

    let inputs = ScoreInputs {
        protocol: matched.map(|m| m.primary_protocol),
        media_service_count: device.media_service_count(),
        security_action_count: profiled
            .map(|p| p.inventory.category_counts().security)
            .unwrap_or(0),
        has_admin_interface,
        exposed_http_admin,
        media_capable: device.media_service_count() > 0
            || device_type.contains("mediarenderer"),
    };

    TargetAssessment {
        profile_name: matched.map(|m| m.profile.name.clone()),
        match_score: matched.map(|m| m.score).unwrap_or(0),
        primary_protocol: matched
            .map(|m| m.primary_protocol)
            .unwrap_or(Protocol::Generic),
        priority_score: priority_score(&inputs),
        categories: profiled
            .map(|p| p.inventory.category_counts())
            .unwrap_or_default(),
        security_findings,
        device,
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub discovery: DiscoveryConfig,
    /// Full SCPD profiling per device instead of the shallow URN scan
    pub deep_profile: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // Mass assessment stays passive unless asked otherwise
            discovery: DiscoveryConfig {
                aggressive: false,
                ..Default::default()
            },
            deep_profile: false,
        }
    }
}

/// Discovery → matching → profiling → prioritized report
pub struct MassOrchestrator {
    discovery: DiscoveryEngine,
    profiling: ProfilingEngine,
    store: Arc<ProfileStore>,
    deep_profile: bool,
}

impl MassOrchestrator {
    pub fn new(config: OrchestratorConfig, store: Arc<ProfileStore>) -> Result<Self, Error> {
        Ok(Self {
            discovery: DiscoveryEngine::new(config.discovery)?,
            profiling: ProfilingEngine::new()?,
            store,
            deep_profile: config.deep_profile,
        })
    }

    pub async fn assess_network(&self, cancel: &CancelToken) -> Result<AssessmentReport, Error> {
        let devices = self.discovery.discover(cancel).await?;
        debug!(count = devices.len(), "assessing discovered devices");
        Ok(self.assess_devices(devices, cancel).await)
    }

    /// Assess an already-discovered device list
    pub async fn assess_devices(
        &self,
        devices: Vec<Device>,
        cancel: &CancelToken,
    ) -> AssessmentReport {
        let profiled: Vec<(DeviceIdentity, ProfilingResult)> = if self.deep_profile {
            self.profiling.profile_all(&devices, cancel).await
        } else {
            Vec::new()
        };

        let mut targets: Vec<TargetAssessment> = devices
            .into_iter()
            .map(|device| {
                let matched = self.store.best_match(&device);
                let result = profiled
                    .iter()
                    .find(|(identity, _)| *identity == device.identity())
                    .map(|(_, result)| result);
                assess_device(device, matched.as_ref(), result)
            })
            .collect();

        sort_targets(&mut targets);
        AssessmentReport { targets }
    }
}

/// Priority descending, ties broken by address ascending
pub fn sort_targets(targets: &mut [TargetAssessment]) {
    targets.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then_with(|| a.device.ip.cmp(&b.device.ip))
    });
}
