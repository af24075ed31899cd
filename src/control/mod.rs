//! Control engine. Executes a named action against a device through the
//! adapter its profile selects, with retry, stealth pacing, dry-run, and
//! uniform error reporting.
//!
//! Each invocation walks BUILD → SEND → WAIT → PARSE and ends in DONE or
//! FAIL; failures carry a classified error plus a response snippet.

pub mod adapters;
pub mod soap;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{DEFAULT_HTTP_TIMEOUT, DEFAULT_INVOKE_TIMEOUT};
use crate::device::Device;
use crate::error::Error;
use crate::http::{self, HttpClient};
use crate::profile::ProfileMatch;
use crate::profiling::ActionInventory;

pub use self::adapters::PreparedRequest;

/// Exponential backoff settings for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Per-invocation transport options
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Overall deadline for the invocation including retries
    pub timeout: Duration,
    /// Deadline for a single request; the earlier of the two wins
    pub request_timeout: Duration,
    pub use_ssl: bool,
    pub verify_tls: bool,
    pub stealth: bool,
    pub retry: RetryPolicy,
    pub dry_run: bool,
    pub verbose: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_INVOKE_TIMEOUT,
            request_timeout: DEFAULT_HTTP_TIMEOUT,
            use_ssl: false,
            verify_tls: true,
            stealth: false,
            retry: RetryPolicy::default(),
            dry_run: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeStatus {
    Ok,
    Partial,
    Failed,
}

/// Machine-readable error attachment for failed invocations
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub detail: String,
    pub upnp_code: Option<u32>,
    pub snippet: Option<String>,
}

impl ErrorReport {
    fn new(error: &Error, snippet: Option<String>) -> Self {
        let upnp_code = match error {
            Error::SoapFault { upnp_code, .. } => *upnp_code,
            _ => None,
        };
        Self {
            kind: error.kind().to_string(),
            detail: error.to_string(),
            upnp_code,
            snippet,
        }
    }
}

/// Result of one invocation
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: InvokeStatus,
    pub outputs: Vec<(String, String)>,
    pub error: Option<ErrorReport>,
    pub attempts: u32,
    /// The built request, populated on dry runs
    pub request: Option<PreparedRequest>,
}

impl ActionResult {
    fn ok(outputs: Vec<(String, String)>, attempts: u32) -> Self {
        Self {
            status: InvokeStatus::Ok,
            outputs,
            error: None,
            attempts,
            request: None,
        }
    }

    fn failed(error: &Error, snippet: Option<String>, attempts: u32) -> Self {
        Self {
            status: InvokeStatus::Failed,
            outputs: Vec::new(),
            error: Some(ErrorReport::new(error, snippet)),
            attempts,
            request: None,
        }
    }

    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw transport reply
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Seam between the engine and the network, mockable in tests
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
        verify_tls: bool,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<TransportResponse, Error>> + Send;
}

/// Default transport backed by the shared HTTP client
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            http: HttpClient::new()?,
        })
    }
}

impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
        verify_tls: bool,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, Error> {
        let response = self
            .http
            .send(
                request.method.clone(),
                &request.url,
                &request.headers,
                request.body.clone(),
                timeout,
                verify_tls,
                cancel,
            )
            .await?;
        Ok(TransportResponse {
            status: response.status,
            body: response.body,
        })
    }
}

/// Action invocation engine
pub struct ControlEngine<T: Transport = HttpTransport> {
    transport: T,
}

impl ControlEngine<HttpTransport> {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            transport: HttpTransport::new()?,
        })
    }
}

impl<T: Transport> ControlEngine<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    /// Invoke `qualified` (`service#action`, or a bare action name for
    /// vendor protocols) on a device. Never panics or returns Err; every
    /// outcome is an [`ActionResult`].
    pub async fn invoke(
        &self,
        device: &Device,
        profile_match: Option<&ProfileMatch>,
        inventory: Option<&ActionInventory>,
        qualified: &str,
        args: &[(String, String)],
        options: &InvokeOptions,
        cancel: &CancelToken,
    ) -> ActionResult {
        debug!(action = qualified, device = %device.ip, "invoke: build");
        let mut request = match adapters::prepare(
            device,
            profile_match,
            inventory,
            qualified,
            args,
            options.use_ssl,
        ) {
            Ok(request) => request,
            Err(e) => return ActionResult::failed(&e, None, 0),
        };

        if options.dry_run {
            let mut result = ActionResult::ok(Vec::new(), 0);
            result.request = Some(request);
            return result;
        }

        let deadline = Instant::now() + options.timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ActionResult::failed(&Error::Timeout, None, attempt - 1);
            }
            let request_timeout = remaining.min(options.request_timeout);

            if options.stealth {
                // Jittered pacing plus a fresh identity per attempt;
                // stealth requests to one host are effectively serialized
                if cancel.guard(HttpClient::stealth_delay()).await.is_err() {
                    return ActionResult::failed(&Error::Canceled, None, attempt - 1);
                }
                set_header(&mut request, "User-Agent", HttpClient::pick_user_agent());
            }

            debug!(url = %request.url, attempt, "invoke: send");
            let outcome = self
                .transport
                .execute(&request, request_timeout, options.verify_tls, cancel)
                .await;

            let error = match outcome {
                Ok(response) => match parse_response(&request, &response) {
                    Ok(outputs) => {
                        debug!(attempt, "invoke: done");
                        return ActionResult::ok(outputs, attempt);
                    }
                    Err(e) => {
                        let snippet = Some(http::snippet(&response.body, options.verbose));
                        if !should_retry(&e, attempt, &options.retry, cancel) {
                            return ActionResult::failed(&e, snippet, attempt);
                        }
                        e
                    }
                },
                Err(e) => {
                    if !should_retry(&e, attempt, &options.retry, cancel) {
                        let snippet = request.body.as_deref().map(|b| http::snippet(b, options.verbose));
                        return ActionResult::failed(&e, snippet, attempt);
                    }
                    e
                }
            };

            warn!(error = %error, attempt, "invoke: transient failure, retrying");
            let backoff = backoff_delay(&options.retry, attempt);
            if cancel.guard(tokio::time::sleep(backoff)).await.is_err() {
                return ActionResult::failed(&Error::Canceled, None, attempt);
            }
        }
    }
}

fn should_retry(error: &Error, attempt: u32, retry: &RetryPolicy, cancel: &CancelToken) -> bool {
    error.is_transient() && attempt < retry.max_attempts && !cancel.is_canceled()
}

/// Exponential backoff with jitter, doubling per attempt
fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let base = retry.base_delay.as_millis() as u64;
    let delay = base.saturating_mul(1 << (attempt - 1).min(6));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(delay + jitter)
}

fn set_header(request: &mut PreparedRequest, name: &str, value: &str) {
    if let Some(header) = request
        .headers
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        header.1 = value.to_string();
    } else {
        request
            .headers
            .push((name.to_string(), value.to_string()));
    }
}

/// Classify a transport reply into outputs or an error. UPnP devices answer
/// faults with HTTP 500, so SOAP bodies are inspected before the status.
fn parse_response(
    request: &PreparedRequest,
    response: &TransportResponse,
) -> Result<Vec<(String, String)>, Error> {
    if request.expects_soap {
        if response.status == 200 || response.status == 500 {
            return match soap::parse_action_response(&response.body, &request.action) {
                Ok(outputs) => Ok(outputs),
                Err(fault @ Error::SoapFault { .. }) => Err(fault),
                Err(parse_error) => {
                    if response.status == 200 {
                        Err(parse_error)
                    } else {
                        Err(Error::HttpStatus(response.status))
                    }
                }
            };
        }
        return Err(Error::HttpStatus(response.status));
    }

    if !(200..300).contains(&response.status) {
        return Err(Error::HttpStatus(response.status));
    }
    let body = response.body.trim();
    if body.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![("response".to_string(), body.to_string())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DiscoveryMethod, Service};
    use std::sync::Mutex;

    struct MockTransport {
        script: Mutex<Vec<Result<TransportResponse, Error>>>,
        calls: Mutex<Vec<(std::time::Instant, PreparedRequest)>>,
    }

    impl MockTransport {
        fn new(script: Vec<Result<TransportResponse, Error>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Transport for MockTransport {
        async fn execute(
            &self,
            request: &PreparedRequest,
            _timeout: Duration,
            _verify_tls: bool,
            _cancel: &CancelToken,
        ) -> Result<TransportResponse, Error> {
            self.calls
                .lock()
                .unwrap()
                .push((std::time::Instant::now(), request.clone()));
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(TransportResponse {
                    status: 200,
                    body: String::new(),
                })
            } else {
                script.remove(0)
            }
        }
    }

    fn renderer() -> Device {
        let mut device = Device::new("192.0.2.10".parse().unwrap(), 1400, DiscoveryMethod::Ssdp);
        device.services.push(Service {
            service_type: "urn:schemas-upnp-org:service:RenderingControl:1".into(),
            service_id: "urn:upnp-org:serviceId:RenderingControl".into(),
            control_url: "http://192.0.2.10:1400/MediaRenderer/RenderingControl/Control".into(),
            event_sub_url: String::new(),
            scpd_url: String::new(),
        });
        device.services.push(Service {
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".into(),
            service_id: "urn:upnp-org:serviceId:AVTransport".into(),
            control_url: "http://192.0.2.10:1400/MediaRenderer/AVTransport/Control".into(),
            event_sub_url: String::new(),
            scpd_url: String::new(),
        });
        device
    }

    fn soap_200(body: &str) -> Result<TransportResponse, Error> {
        Ok(TransportResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    const SET_VOLUME_OK: &str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
<s:Body><u:SetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"/></s:Body></s:Envelope>"#;

    const PLAY_FAULT_701: &str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
<s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
<detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>701</errorCode></UPnPError></detail>
</s:Fault></s:Body></s:Envelope>"#;

    fn volume_args() -> Vec<(String, String)> {
        vec![
            ("InstanceID".to_string(), "0".to_string()),
            ("Channel".to_string(), "Master".to_string()),
            ("DesiredVolume".to_string(), "25".to_string()),
        ]
    }

    #[tokio::test]
    async fn test_set_volume_ok_with_empty_outputs() {
        let transport = MockTransport::new(vec![soap_200(SET_VOLUME_OK)]);
        let engine = ControlEngine::with_transport(transport);
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "renderingcontrol#SetVolume",
                &volume_args(),
                &InvokeOptions::default(),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Ok);
        assert!(result.outputs.is_empty());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_on_503_then_success() {
        let transport = MockTransport::new(vec![
            Ok(TransportResponse {
                status: 503,
                body: String::new(),
            }),
            Ok(TransportResponse {
                status: 503,
                body: String::new(),
            }),
            soap_200(SET_VOLUME_OK),
        ]);
        let engine = ControlEngine::with_transport(transport);
        let options = InvokeOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
            },
            ..Default::default()
        };
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "renderingcontrol#SetVolume",
                &volume_args(),
                &options,
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Ok);
        assert_eq!(result.attempts, 3);
        assert_eq!(engine.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_400() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 400,
            body: "Bad Request".to_string(),
        })]);
        let engine = ControlEngine::with_transport(transport);
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "renderingcontrol#SetVolume",
                &volume_args(),
                &InvokeOptions::default(),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(engine.transport.call_count(), 1);
        assert_eq!(result.error.as_ref().unwrap().kind, "HttpStatus");
    }

    #[tokio::test]
    async fn test_soap_fault_701_fails_without_retry() {
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 500,
            body: PLAY_FAULT_701.to_string(),
        })]);
        let engine = ControlEngine::with_transport(transport);
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "avtransport#Play",
                &[],
                &InvokeOptions::default(),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Failed);
        assert_eq!(result.attempts, 1);
        let error = result.error.unwrap();
        assert_eq!(error.kind, "SoapFault");
        assert_eq!(error.upnp_code, Some(701));
        assert!(error.snippet.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_returns_request_without_sending() {
        let transport = MockTransport::new(Vec::new());
        let engine = ControlEngine::with_transport(transport);
        let options = InvokeOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "renderingcontrol#SetVolume",
                &volume_args(),
                &options,
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Ok);
        assert_eq!(engine.transport.call_count(), 0);
        let request = result.request.unwrap();
        assert!(request.body.unwrap().contains("<u:SetVolume"));
    }

    #[tokio::test]
    async fn test_stealth_gaps_and_rotating_identity() {
        let transport = MockTransport::new(vec![
            soap_200(SET_VOLUME_OK),
            soap_200(SET_VOLUME_OK),
            soap_200(SET_VOLUME_OK),
            soap_200(SET_VOLUME_OK),
        ]);
        let engine = ControlEngine::with_transport(transport);
        let options = InvokeOptions {
            stealth: true,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let device = renderer();

        let mut sent_at = Vec::new();
        for _ in 0..4 {
            sent_at.push(std::time::Instant::now());
            let result = engine
                .invoke(
                    &device,
                    None,
                    None,
                    "renderingcontrol#SetVolume",
                    &volume_args(),
                    &options,
                    &cancel,
                )
                .await;
            assert_eq!(result.status, InvokeStatus::Ok);
        }

        let calls = engine.transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        // Every request waited the stealth jitter window before sending
        for (started, (executed, _)) in sent_at.iter().zip(calls.iter()) {
            let gap = executed.duration_since(*started);
            assert!(gap >= Duration::from_millis(50), "gap was {:?}", gap);
            assert!(gap <= Duration::from_millis(450), "gap was {:?}", gap);
        }
        // The user agent rotates across requests
        let agents: std::collections::HashSet<String> = calls
            .iter()
            .filter_map(|(_, request)| {
                request
                    .headers
                    .iter()
                    .find(|(name, _)| name == "User-Agent")
                    .map(|(_, value)| value.clone())
            })
            .collect();
        assert!(agents.len() > 1);
    }

    #[tokio::test]
    async fn test_cancellation_reported_as_canceled() {
        let transport = MockTransport::new((0..3).map(|_| Err(Error::Timeout)).collect());
        let engine = ControlEngine::with_transport(transport);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = engine
            .invoke(
                &renderer(),
                None,
                None,
                "renderingcontrol#SetVolume",
                &volume_args(),
                &InvokeOptions {
                    stealth: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Failed);
        assert_eq!(result.error.unwrap().kind, "Canceled");
    }

    #[tokio::test]
    async fn test_vendor_response_body_captured() {
        let mut device = Device::new("192.0.2.30".parse().unwrap(), 55001, DiscoveryMethod::Ssdp);
        device.manufacturer = "Samsung Electronics".into();
        device.model_name = "WAM1500".into();
        let store = crate::profile::ProfileStore::with_builtin();
        let matched = store.best_match(&device).unwrap();

        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 200,
            body: "<UIC><method>SetVolume</method></UIC>".to_string(),
        })]);
        let engine = ControlEngine::with_transport(transport);
        let result = engine
            .invoke(
                &device,
                Some(&matched),
                None,
                "SetVolume",
                &[("volume".to_string(), "10".to_string())],
                &InvokeOptions::default(),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, InvokeStatus::Ok);
        assert!(result.output("response").unwrap().contains("SetVolume"));
    }
}
