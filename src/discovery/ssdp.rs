//! SSDP multicast discovery. Sends M-SEARCH requests for several search
//! targets from a socket bound to the chosen interface address and collects
//! unicast responses until the listen window closes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::Error;

pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;
const SSDP_MX: u8 = 3;

/// Search targets covering root devices, media endpoints, and DIAL/Cast
pub const SEARCH_TARGETS: &[&str] = &[
    "upnp:rootdevice",
    "ssdp:all",
    "urn:schemas-upnp-org:device:MediaRenderer:1",
    "urn:schemas-upnp-org:device:MediaServer:1",
    "urn:dial-multiscreen-org:service:dial:1",
];

/// One parsed SSDP response datagram
#[derive(Debug, Clone)]
pub struct SsdpResponse {
    pub addr: IpAddr,
    pub location: String,
    pub st: String,
    pub usn: String,
    pub server: String,
}

/// SSDP M-SEARCH scanner
pub struct SsdpScanner {
    timeout: Duration,
    search_targets: Vec<String>,
}

impl SsdpScanner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            search_targets: SEARCH_TARGETS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_search_targets(mut self, targets: Vec<String>) -> Self {
        self.search_targets = targets;
        self
    }

    /// Send M-SEARCH for every target and collect replies until the timeout
    /// elapses or the token cancels. Binding to `bind_ip` keeps the datagrams
    /// on the intended interface on multi-homed hosts.
    pub async fn discover(
        &self,
        bind_ip: Ipv4Addr,
        cancel: &CancelToken,
    ) -> Result<Vec<SsdpResponse>, Error> {
        let socket = create_search_socket(bind_ip)?;
        let destination = SocketAddr::V4(SocketAddrV4::new(SSDP_MULTICAST_ADDR, SSDP_PORT));

        for target in &self.search_targets {
            let message = build_msearch(target);
            if let Err(e) = cancel.guard(socket.send_to(message.as_bytes(), destination)).await? {
                warn!(target, error = %e, "failed to send M-SEARCH");
            } else {
                debug!(target, "sent M-SEARCH");
            }
        }

        let mut responses = Vec::new();
        let mut buf = [0u8; 8192];
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || cancel.is_canceled() {
                break;
            }
            let received = tokio::select! {
                _ = cancel.canceled() => break,
                r = tokio::time::timeout(remaining, socket.recv_from(&mut buf)) => r,
            };
            match received {
                Ok(Ok((len, addr))) => {
                    if let Some(response) = parse_ssdp_response(&buf[..len], addr.ip()) {
                        debug!(from = %addr, st = %response.st, "SSDP response");
                        responses.push(response);
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "SSDP receive error");
                }
                Err(_) => break, // listen window closed
            }
        }

        debug!(count = responses.len(), "SSDP discovery complete");
        Ok(responses)
    }
}

fn create_search_socket(bind_ip: Ipv4Addr) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(bind_ip, 0).into())?;
    socket.set_multicast_if_v4(&bind_ip)?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn build_msearch(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, SSDP_MX, search_target
    )
}

/// Parse an SSDP reply as HTTP header lines. Replies without a LOCATION
/// header cannot lead to a device description and are dropped.
fn parse_ssdp_response(data: &[u8], addr: IpAddr) -> Option<SsdpResponse> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/") {
        return None;
    }

    let headers = parse_header_lines(lines);
    let location = headers.get("LOCATION")?.clone();
    Some(SsdpResponse {
        addr,
        location,
        st: headers.get("ST").cloned().unwrap_or_default(),
        usn: headers.get("USN").cloned().unwrap_or_default(),
        server: headers.get("SERVER").cloned().unwrap_or_default(),
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if let Some(pos) = line.find(':') {
            let key = line[..pos].trim().to_uppercase();
            let value = line[pos + 1..].trim().to_string();
            headers.insert(key, value);
        }
    }
    headers
}
