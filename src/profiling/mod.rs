//! Profiling engine. Fans out one SCPD fetch per service, parses each
//! independently, and assembles the device's full action inventory with
//! aggregate capability counts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{DEFAULT_HTTP_TIMEOUT, MASS_PROFILE_CONCURRENCY, SCPD_FETCH_CONCURRENCY};
use crate::device::{Device, DeviceIdentity};
use crate::error::Error;
use crate::http::HttpClient;
use crate::scpd::{self, ActionCategory, ScpdDocument, SoapAction};

/// Derive a short service name from a service-type URN: the last
/// non-numeric URN token, lowercased, digits stripped.
/// `urn:schemas-upnp-org:service:AVTransport:1` becomes `avtransport`.
pub fn service_name_from_urn(service_type: &str) -> String {
    for token in service_type.rsplit(':') {
        let name: String = token
            .chars()
            .filter(|c| !c.is_ascii_digit())
            .collect::<String>()
            .to_lowercase();
        if !name.is_empty() {
            return name;
        }
    }
    service_type.to_lowercase()
}

/// One service's slice of the inventory, actions in SCPD declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInventory {
    pub service_name: String,
    pub service_type: String,
    pub control_url: String,
    pub scpd_url: String,
    pub actions: Vec<SoapAction>,
}

/// Per-category action counts for a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCounts {
    pub media_control: usize,
    pub volume_control: usize,
    pub information: usize,
    pub configuration: usize,
    pub security: usize,
    pub other: usize,
}

impl CapabilityCounts {
    pub fn total(&self) -> usize {
        self.media_control
            + self.volume_control
            + self.information
            + self.configuration
            + self.security
            + self.other
    }
}

/// Every invokable action across all services of one device, in service
/// declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionInventory {
    pub services: Vec<ServiceInventory>,
}

impl ActionInventory {
    pub fn total_actions(&self) -> usize {
        self.services.iter().map(|s| s.actions.len()).sum()
    }

    /// Look up an action by service name (as derived from the URN) and
    /// action name
    pub fn find_action(
        &self,
        service_name: &str,
        action_name: &str,
    ) -> Option<(&ServiceInventory, &SoapAction)> {
        let service = self
            .services
            .iter()
            .find(|s| s.service_name == service_name)?;
        let action = service.actions.iter().find(|a| a.name == action_name)?;
        Some((service, action))
    }

    pub fn category_counts(&self) -> CapabilityCounts {
        let mut counts = CapabilityCounts::default();
        for action in self.services.iter().flat_map(|s| &s.actions) {
            match action.category {
                ActionCategory::MediaControl => counts.media_control += 1,
                ActionCategory::VolumeControl => counts.volume_control += 1,
                ActionCategory::Information => counts.information += 1,
                ActionCategory::Configuration => counts.configuration += 1,
                ActionCategory::Security => counts.security += 1,
                ActionCategory::Other => counts.other += 1,
            }
        }
        counts
    }

    /// Names of security-categorized actions, qualified by service
    pub fn security_actions(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|s| {
                s.actions
                    .iter()
                    .filter(|a| a.category == ActionCategory::Security)
                    .map(move |a| format!("{}#{}", s.service_name, a.name))
            })
            .collect()
    }
}

/// Summary of an SCPD pass over one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScpdAnalysis {
    pub services_analyzed: usize,
    pub successful_parses: usize,
    pub total_actions: usize,
    pub parsing_errors: Vec<String>,
}

/// Inventory plus analysis for one device
#[derive(Debug, Clone, Default)]
pub struct ProfilingResult {
    pub inventory: ActionInventory,
    pub analysis: ScpdAnalysis,
}

/// SCPD profiling engine
pub struct ProfilingEngine {
    http: HttpClient,
    timeout: Duration,
    /// Certificate verification for SCPD fetches; off by default since
    /// HTTPS SCPD URLs are nearly always behind self-signed certs
    verify_tls: bool,
    per_device_limit: usize,
    mass_limit: usize,
}

impl ProfilingEngine {
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_http(HttpClient::new()?))
    }

    pub fn with_http(http: HttpClient) -> Self {
        Self {
            http,
            timeout: DEFAULT_HTTP_TIMEOUT,
            verify_tls: false,
            per_device_limit: SCPD_FETCH_CONCURRENCY,
            mass_limit: MASS_PROFILE_CONCURRENCY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    /// Build the full action inventory for one device. Per-service fetch and
    /// parse failures land in the analysis without failing the call, and
    /// cancellation returns whatever was collected so far.
    pub async fn profile_device(
        &self,
        device: &Device,
        cancel: &CancelToken,
    ) -> ProfilingResult {
        let semaphore = Arc::new(Semaphore::new(self.per_device_limit));
        let mut handles = Vec::with_capacity(device.services.len());

        for (index, service) in device.services.iter().cloned().enumerate() {
            let http = self.http.clone();
            let cancel = cancel.clone();
            let sem = semaphore.clone();
            let timeout = self.timeout;
            let verify_tls = self.verify_tls;
            handles.push(tokio::spawn(async move {
                let Ok(Ok(_permit)) = cancel.guard(sem.acquire_owned()).await else {
                    return (index, service, Err(Error::Canceled));
                };
                let document =
                    fetch_scpd(&http, &service.scpd_url, timeout, verify_tls, &cancel).await;
                (index, service, document)
            }));
        }

        let mut slots: Vec<Option<(crate::device::Service, Result<ScpdDocument, Error>)>> =
            (0..device.services.len()).map(|_| None).collect();
        for handle in handles {
            if let Ok((index, service, document)) = handle.await {
                slots[index] = Some((service, document));
            }
        }

        let mut result = ProfilingResult::default();
        for slot in slots.into_iter().flatten() {
            let (service, document) = slot;
            result.analysis.services_analyzed += 1;
            match document {
                Ok(document) => {
                    result.analysis.successful_parses += 1;
                    result.analysis.total_actions += document.actions.len();
                    result
                        .analysis
                        .parsing_errors
                        .extend(document.parse_errors.clone());
                    result.inventory.services.push(ServiceInventory {
                        service_name: service_name_from_urn(&service.service_type),
                        service_type: service.service_type,
                        control_url: service.control_url,
                        scpd_url: service.scpd_url,
                        actions: document.actions,
                    });
                }
                // Canceled fetches are neither analyzed nor counted as errors
                Err(Error::Canceled) => {
                    result.analysis.services_analyzed -= 1;
                }
                Err(e) => {
                    warn!(service = %service.service_type, error = %e, "SCPD fetch failed");
                    result
                        .analysis
                        .parsing_errors
                        .push(format!("{}: {}", service.service_type, e));
                }
            }
        }

        debug!(
            services = result.analysis.services_analyzed,
            actions = result.analysis.total_actions,
            "profiled device"
        );
        result
    }

    /// Profile a device list with a global concurrency cap, keyed by
    /// device identity
    pub async fn profile_all(
        &self,
        devices: &[Device],
        cancel: &CancelToken,
    ) -> Vec<(DeviceIdentity, ProfilingResult)> {
        let semaphore = Arc::new(Semaphore::new(self.mass_limit));
        let mut results = Vec::with_capacity(devices.len());

        let futures = devices.iter().map(|device| {
            let sem = semaphore.clone();
            let cancel = cancel.clone();
            async move {
                let Ok(Ok(_permit)) = cancel.guard(sem.acquire_owned()).await else {
                    return None;
                };
                Some((device.identity(), self.profile_device(device, &cancel).await))
            }
        });

        for outcome in futures::future::join_all(futures).await {
            if let Some(entry) = outcome {
                results.push(entry);
            }
        }
        results
    }
}

async fn fetch_scpd(
    http: &HttpClient,
    scpd_url: &str,
    timeout: Duration,
    verify_tls: bool,
    cancel: &CancelToken,
) -> Result<ScpdDocument, Error> {
    if scpd_url.is_empty() {
        return Err(Error::UnknownService("service has no SCPD URL".into()));
    }
    let response = http.get_text(scpd_url, timeout, verify_tls, cancel).await?;
    if response.status != 200 {
        return Err(Error::HttpStatus(response.status));
    }
    scpd::parse_scpd(&response.body)
}
