//! Discovery engine. Orchestrates SSDP multicast, the optional ARP-hinted
//! TCP port sweep, and description fetches, then collapses everything into a
//! deduplicated device list ordered by address.

pub mod arp;
pub mod ssdp;
pub mod sweep;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_SCAN_PORTS, DEFAULT_SSDP_TIMEOUT,
    DESCRIPTION_FETCH_CONCURRENCY, DESCRIPTION_PATHS, SWEEP_CONCURRENCY,
};
use crate::device::{Device, DeviceIdentity, DiscoveryMethod};
use crate::error::Error;
use crate::http::HttpClient;
use crate::xml;

use self::ssdp::{SsdpResponse, SsdpScanner};
use self::sweep::PortSweeper;

/// Discovery parameters. `network = None` falls back to the host's default
/// interface; `aggressive` enables the port sweep.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub network: Option<Ipv4Network>,
    pub timeout: Duration,
    pub aggressive: bool,
    pub ports: Vec<u16>,
    pub search_targets: Vec<String>,
    /// Verify TLS certificates on description fetches. Off by default;
    /// devices answering on HTTPS almost always present self-signed certs.
    pub verify_tls: bool,
    pub sweep_concurrency: usize,
    pub fetch_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: None,
            timeout: DEFAULT_SSDP_TIMEOUT,
            aggressive: false,
            ports: DEFAULT_SCAN_PORTS.to_vec(),
            search_targets: ssdp::SEARCH_TARGETS.iter().map(|s| s.to_string()).collect(),
            verify_tls: false,
            sweep_concurrency: SWEEP_CONCURRENCY,
            fetch_concurrency: DESCRIPTION_FETCH_CONCURRENCY,
        }
    }
}

/// LAN discovery engine
pub struct DiscoveryEngine {
    http: HttpClient,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig) -> Result<Self, Error> {
        Ok(Self {
            http: HttpClient::new()?,
            config,
        })
    }

    pub fn with_http(config: DiscoveryConfig, http: HttpClient) -> Self {
        Self { http, config }
    }

    /// Run a full discovery pass. Per-endpoint failures are logged and
    /// skipped; the call fails only when no local interface can be found.
    pub async fn discover(&self, cancel: &CancelToken) -> Result<Vec<Device>, Error> {
        let local_ip = local_interface_ip()?;
        debug!(%local_ip, "starting discovery");

        // SSDP phase
        let scanner = SsdpScanner::new(self.config.timeout)
            .with_search_targets(self.config.search_targets.clone());
        let responses = scanner.discover(local_ip, cancel).await?;
        let unique = dedup_by_location(responses);
        debug!(unique = unique.len(), "unique SSDP locations");

        let mut devices = self.fetch_ssdp_descriptions(unique, cancel).await;

        // Port-sweep phase
        if self.config.aggressive && !cancel.is_canceled() {
            let targets = self.sweep_targets(local_ip, &devices);
            let sweeper = PortSweeper::new().with_concurrency(self.config.sweep_concurrency);
            let open = sweeper.sweep(&targets, &self.config.ports, cancel).await;

            let known: Vec<(IpAddr, u16)> = devices.iter().map(|d| (d.ip, d.port)).collect();
            let fresh: Vec<(Ipv4Addr, u16)> = open
                .into_iter()
                .filter(|(ip, port)| !known.contains(&(IpAddr::V4(*ip), *port)))
                .collect();
            devices.extend(self.probe_descriptions(fresh, cancel).await);
        }

        Ok(merge_devices(devices))
    }

    /// Fetch and parse the description behind every unique SSDP location
    async fn fetch_ssdp_descriptions(
        &self,
        responses: Vec<SsdpResponse>,
        cancel: &CancelToken,
    ) -> Vec<Device> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_concurrency));
        let verify_tls = self.config.verify_tls;
        let mut handles = Vec::with_capacity(responses.len());

        for response in responses {
            let http = self.http.clone();
            let cancel = cancel.clone();
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let Ok(Ok(_permit)) = cancel.guard(sem.acquire_owned()).await else {
                    return None;
                };
                match fetch_device(
                    &http,
                    &response.location,
                    DiscoveryMethod::Ssdp,
                    verify_tls,
                    &cancel,
                )
                .await
                {
                    Ok(mut device) => {
                        device.server_header = response.server.clone();
                        Some(device)
                    }
                    Err(e) => {
                        warn!(location = %response.location, error = %e, "description fetch failed");
                        None
                    }
                }
            }));
        }

        collect_devices(handles).await
    }

    /// Try the well-known description paths on open endpoints from the sweep.
    /// One endpoint yields at most one device; the first 200 wins.
    async fn probe_descriptions(
        &self,
        endpoints: Vec<(Ipv4Addr, u16)>,
        cancel: &CancelToken,
    ) -> Vec<Device> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_concurrency));
        let verify_tls = self.config.verify_tls;
        let mut handles = Vec::with_capacity(endpoints.len());

        for (ip, port) in endpoints {
            let http = self.http.clone();
            let cancel = cancel.clone();
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let Ok(Ok(_permit)) = cancel.guard(sem.acquire_owned()).await else {
                    return None;
                };
                for path in DESCRIPTION_PATHS {
                    let url = format!("http://{}:{}{}", ip, port, path);
                    match fetch_device(&http, &url, DiscoveryMethod::PortScan, verify_tls, &cancel)
                        .await
                    {
                        Ok(device) => return Some(device),
                        Err(Error::Canceled) => return None,
                        Err(e) => {
                            debug!(url, error = %e, "description probe miss");
                        }
                    }
                }
                None
            }));
        }

        collect_devices(handles).await
    }

    /// Hosts to sweep: the whole CIDR when one was given, otherwise hosts
    /// already known from SSDP plus the kernel ARP table.
    fn sweep_targets(&self, local_ip: Ipv4Addr, devices: &[Device]) -> Vec<Ipv4Addr> {
        let mut targets: Vec<Ipv4Addr> = match self.config.network {
            Some(network) => network
                .iter()
                .filter(|ip| {
                    *ip != network.network() && *ip != network.broadcast() && *ip != local_ip
                })
                .collect(),
            None => {
                let mut hosts: Vec<Ipv4Addr> = devices
                    .iter()
                    .filter_map(|d| match d.ip {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                hosts.extend(arp::arp_hosts());
                hosts
            }
        };
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

async fn collect_devices(
    handles: Vec<tokio::task::JoinHandle<Option<Device>>>,
) -> Vec<Device> {
    let mut devices = Vec::new();
    for handle in handles {
        if let Ok(Some(device)) = handle.await {
            devices.push(device);
        }
    }
    devices
}

/// Fetch one description URL and build a device record from it
async fn fetch_device(
    http: &HttpClient,
    location: &str,
    method: DiscoveryMethod,
    verify_tls: bool,
    cancel: &CancelToken,
) -> Result<Device, Error> {
    let url = Url::parse(location).map_err(|e| Error::MalformedXml(e.to_string()))?;
    let response = http
        .get_text(location, DEFAULT_HTTP_TIMEOUT, verify_tls, cancel)
        .await?;
    if response.status != 200 {
        return Err(Error::HttpStatus(response.status));
    }
    let description = xml::parse_device_description(&response.body, &url)?;

    let ip: IpAddr = url
        .host_str()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| Error::MalformedXml(format!("non-address host in {}", location)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut device = Device::new(ip, port, method);
    device.udn = description.udn;
    device.friendly_name = description.friendly_name;
    device.manufacturer = description.manufacturer;
    device.model_name = description.model_name;
    device.model_number = description.model_number;
    device.device_type = description.device_type;
    device.description_url = location.to_string();
    device.services = description.services;
    Ok(device)
}

/// First response per LOCATION, in arrival order. A device answers once per
/// search target and root device type, so raw response counts run an order
/// of magnitude above the device count.
pub fn dedup_by_location(responses: Vec<SsdpResponse>) -> Vec<SsdpResponse> {
    let mut seen = std::collections::HashSet::new();
    responses
        .into_iter()
        .filter(|r| seen.insert(r.location.clone()))
        .collect()
}

/// Collapse device records by identity, merging duplicates under the
/// later-wins/SSDP-precedence rules, then order by address.
pub fn merge_devices(devices: Vec<Device>) -> Vec<Device> {
    let mut merged: Vec<Device> = Vec::new();
    let mut index: HashMap<DeviceIdentity, usize> = HashMap::new();

    for device in devices {
        match index.get(&device.identity()) {
            Some(&i) => merged[i].merge_from(device),
            None => {
                index.insert(device.identity(), merged.len());
                merged.push(device);
            }
        }
    }

    merged.sort_by_key(|d| (d.ip, d.port));
    merged
}

/// Address of the interface holding the default route. The connect call
/// sends no packets; it only asks the kernel for a source address.
pub fn local_interface_ip() -> Result<Ipv4Addr, Error> {
    let probe = || -> Option<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()? {
            std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
            std::net::SocketAddr::V6(_) => None,
        }
    };
    probe().ok_or_else(|| {
        Error::NetworkUnreachable("cannot determine local interface address".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Service;

    fn ssdp_response(location: &str, st: &str) -> SsdpResponse {
        SsdpResponse {
            addr: "192.168.1.50".parse().unwrap(),
            location: location.to_string(),
            st: st.to_string(),
            usn: String::new(),
            server: "Linux UPnP/1.0 Sonos/70.3-35220".to_string(),
        }
    }

    fn device(ip: &str, port: u16, udn: &str, method: DiscoveryMethod) -> Device {
        let mut d = Device::new(ip.parse().unwrap(), port, method);
        d.udn = udn.to_string();
        // Fixed timestamps keep repeated runs byte-comparable
        let epoch = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        d.first_seen = epoch;
        d.last_seen = epoch;
        d
    }

    #[test]
    fn test_location_dedup_collapses_st_variants() {
        // One device answering three search targets produces one location
        let responses = vec![
            ssdp_response("http://192.168.1.50:1400/xml/device_description.xml", "upnp:rootdevice"),
            ssdp_response("http://192.168.1.50:1400/xml/device_description.xml", "ssdp:all"),
            ssdp_response(
                "http://192.168.1.50:1400/xml/device_description.xml",
                "urn:schemas-upnp-org:device:MediaRenderer:1",
            ),
            ssdp_response("http://192.168.1.60:8060/", "upnp:rootdevice"),
        ];
        let unique = dedup_by_location(responses);
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let corpus = || {
            vec![
                device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::Ssdp),
                device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::PortScan),
                device("192.168.1.60", 8060, "", DiscoveryMethod::Ssdp),
                device("192.168.1.60", 8060, "", DiscoveryMethod::PortScan),
                device("192.168.1.40", 8008, "uuid:cast-1", DiscoveryMethod::Ssdp),
            ]
        };
        let first = merge_devices(corpus());
        let second = merge_devices(corpus());
        assert_eq!(first.len(), 3);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        let identities: Vec<String> = first.iter().map(|d| d.identity().to_string()).collect();
        let mut deduped = identities.clone();
        deduped.dedup();
        assert_eq!(identities, deduped);
    }

    #[test]
    fn test_merged_record_keeps_ssdp_method() {
        let merged = merge_devices(vec![
            device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::Ssdp),
            device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::PortScan),
        ]);
        assert_eq!(merged[0].discovery_method, DiscoveryMethod::Ssdp);

        let merged = merge_devices(vec![
            device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::PortScan),
            device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::Ssdp),
        ]);
        assert_eq!(merged[0].discovery_method, DiscoveryMethod::Ssdp);
    }

    #[test]
    fn test_output_sorted_by_ip_then_port() {
        let merged = merge_devices(vec![
            device("192.168.1.60", 8060, "", DiscoveryMethod::Ssdp),
            device("192.168.1.50", 1400, "", DiscoveryMethod::Ssdp),
            device("192.168.1.50", 80, "", DiscoveryMethod::Ssdp),
        ]);
        let keys: Vec<(IpAddr, u16)> = merged.iter().map(|d| (d.ip, d.port)).collect();
        assert_eq!(
            keys,
            vec![
                ("192.168.1.50".parse().unwrap(), 80),
                ("192.168.1.50".parse().unwrap(), 1400),
                ("192.168.1.60".parse().unwrap(), 8060),
            ]
        );
    }

    #[test]
    fn test_ssdp_only_home_lan_corpus() {
        // Eight devices, three search targets each, plus embedded-device
        // re-announcements: ~100 raw responses collapse to 8 records
        let mut responses = Vec::new();
        for host in 0..8u8 {
            let location = format!("http://192.168.1.{}:1400/xml/device_description.xml", 50 + host);
            for st in ["upnp:rootdevice", "ssdp:all", "urn:schemas-upnp-org:device:MediaRenderer:1"] {
                for _ in 0..4 {
                    responses.push(ssdp_response(&location, st));
                }
            }
        }
        for _ in 0..5 {
            responses.push(ssdp_response(
                "http://192.168.1.50:1400/xml/device_description.xml",
                "upnp:rootdevice",
            ));
        }
        assert_eq!(responses.len(), 101);

        let unique = dedup_by_location(responses);
        assert_eq!(unique.len(), 8);

        let devices: Vec<Device> = unique
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let url = Url::parse(&r.location).unwrap();
                let mut d = Device::new(
                    url.host_str().unwrap().parse().unwrap(),
                    url.port().unwrap(),
                    DiscoveryMethod::Ssdp,
                );
                d.udn = format!("uuid:RINCON_00000000000{}01400", i);
                d
            })
            .collect();
        let merged = merge_devices(devices);
        assert_eq!(merged.len(), 8);
        assert!(merged[0].udn.starts_with("uuid:RINCON_"));
        assert!(merged.windows(2).all(|w| w[0].ip <= w[1].ip));
    }

    #[tokio::test]
    async fn test_fetch_device_from_local_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let body = "<root><device>\
                        <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>\
                        <friendlyName>Shelf Speaker</friendlyName>\
                        <manufacturer>ACME</manufacturer>\
                        <UDN>uuid:acme-1</UDN>\
                        <serviceList><service>\
                        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>\
                        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>\
                        <controlURL>/AVTransport/Control</controlURL>\
                        <SCPDURL>/AVTransport.xml</SCPDURL>\
                        </service></serviceList></device></root>";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let http = HttpClient::new().unwrap();
        let location = format!("http://127.0.0.1:{}/description.xml", port);
        let device = fetch_device(
            &http,
            &location,
            DiscoveryMethod::PortScan,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(device.friendly_name, "Shelf Speaker");
        assert_eq!(device.udn, "uuid:acme-1");
        assert_eq!(device.port, port);
        // Relative URLs resolved against the fetch origin
        assert_eq!(
            device.services[0].control_url,
            format!("http://127.0.0.1:{}/AVTransport/Control", port)
        );
    }

    #[test]
    fn test_sweep_targets_from_cidr_skip_edges() {
        let config = DiscoveryConfig {
            network: Some("192.168.1.0/29".parse().unwrap()),
            aggressive: true,
            ..Default::default()
        };
        let engine = DiscoveryEngine::with_http(config, HttpClient::new().unwrap());
        let targets = engine.sweep_targets("192.168.1.2".parse().unwrap(), &[]);
        // /29 holds 8 addresses; network, broadcast, and self are skipped
        assert_eq!(targets.len(), 5);
        assert!(!targets.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!targets.contains(&"192.168.1.7".parse().unwrap()));
        assert!(!targets.contains(&"192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn test_identity_merge_prefers_udn_over_endpoint() {
        // Same device found at two ports still collapses via UDN
        let merged = merge_devices(vec![
            device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::Ssdp),
            device("192.168.1.50", 1443, "uuid:RINCON_1", DiscoveryMethod::PortScan),
        ]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_service_order_survives_merge() {
        let mut first = device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::Ssdp);
        first.services = ["AVTransport", "RenderingControl", "Queue"]
            .iter()
            .map(|n| Service {
                service_type: format!("urn:schemas-upnp-org:service:{}:1", n),
                ..Default::default()
            })
            .collect();
        let merged = merge_devices(vec![first, device("192.168.1.50", 1400, "uuid:RINCON_1", DiscoveryMethod::PortScan)]);
        let names: Vec<&str> = merged[0]
            .services
            .iter()
            .map(|s| s.service_type.as_str())
            .collect();
        assert_eq!(names[0], "urn:schemas-upnp-org:service:AVTransport:1");
        assert_eq!(names[2], "urn:schemas-upnp-org:service:Queue:1");
    }
}
