//! Protocol adapters. Each adapter turns (device, action, arguments) into a
//! concrete HTTP request for its protocol family; profiles carry the data,
//! the adapters carry the behavior.

use reqwest::Method;
use url::Url;
use url::form_urlencoded;

use crate::device::Device;
use crate::error::Error;
use crate::profile::{DeviceProfile, ProfileMatch, Protocol, VendorHttpBlock};
use crate::profiling::ActionInventory;
use crate::scpd::Direction;

/// A fully built request, ready for transport or dry-run inspection
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub protocol: Protocol,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Bare action name, used to locate `<{Action}Response>` in SOAP replies
    pub action: String,
    pub expects_soap: bool,
}

/// `service#action` with the service part optional for vendor protocols
pub fn split_qualified(qualified: &str) -> (Option<&str>, &str) {
    match qualified.split_once('#') {
        Some((service, action)) => (Some(service), action),
        None => (None, qualified),
    }
}

/// Replace `{PLACEHOLDER}` tokens with argument values, matching argument
/// names case-insensitively against the uppercased token
pub fn substitute_placeholders(template: &str, args: &[(String, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in args {
        let token = format!("{{{}}}", name.to_uppercase());
        out = out.replace(&token, value);
    }
    out
}

/// Build the request for an action using the adapter selected by the
/// profile match; no match falls through to generic UPnP.
pub fn prepare(
    device: &Device,
    profile_match: Option<&ProfileMatch>,
    inventory: Option<&ActionInventory>,
    qualified: &str,
    args: &[(String, String)],
    use_ssl: bool,
) -> Result<PreparedRequest, Error> {
    let protocol = profile_match
        .map(|m| m.primary_protocol)
        .unwrap_or(Protocol::Generic);
    let profile = profile_match.map(|m| m.profile.as_ref());

    match protocol {
        Protocol::Cast => prepare_cast(device, profile),
        Protocol::Wam => prepare_wam(device, profile, qualified, args),
        Protocol::Ecp => prepare_ecp(device, profile, qualified, args),
        Protocol::Heos | Protocol::MusicCast | Protocol::SoundTouch => {
            let block = vendor_block(profile, protocol)
                .ok_or_else(|| Error::UnknownService(protocol.to_string()))?;
            prepare_vendor_http(device, block, protocol, qualified, args)
        }
        Protocol::JsonRpc => prepare_jsonrpc(device, profile, qualified, args),
        Protocol::Upnp | Protocol::Generic => {
            prepare_upnp(device, profile, inventory, qualified, args, use_ssl, protocol)
        }
    }
}

fn vendor_block(profile: Option<&DeviceProfile>, protocol: Protocol) -> Option<&VendorHttpBlock> {
    let profile = profile?;
    match protocol {
        Protocol::Heos => profile.heos.as_ref(),
        Protocol::MusicCast => profile.musiccast.as_ref(),
        Protocol::SoundTouch => profile.soundtouch.as_ref(),
        _ => None,
    }
}

/// SOAP over the device's own control URLs, optionally steered by the
/// profile's UPnP service table
fn prepare_upnp(
    device: &Device,
    profile: Option<&DeviceProfile>,
    inventory: Option<&ActionInventory>,
    qualified: &str,
    args: &[(String, String)],
    use_ssl: bool,
    protocol: Protocol,
) -> Result<PreparedRequest, Error> {
    let (service_name, action) = split_qualified(qualified);
    let service_name = service_name
        .ok_or_else(|| Error::InvalidArgument("UPnP actions need a service#action name".into()))?
        .to_lowercase();

    let (service_type, control_url) = resolve_service(device, profile, &service_name)?;

    let ordered = match inventory.and_then(|inv| inv.find_action(&service_name, action)) {
        Some((_, soap_action)) => order_arguments(soap_action, args)?,
        None => {
            if let Some(inventory) = inventory
                && inventory
                    .services
                    .iter()
                    .any(|s| s.service_name == service_name)
            {
                return Err(Error::UnknownAction(format!(
                    "{}#{}",
                    service_name, action
                )));
            }
            args.to_vec()
        }
    };

    let control_url = if use_ssl {
        force_https(&control_url)
    } else {
        control_url
    };

    let envelope = super::soap::build_envelope(&service_type, action, &ordered)?;
    Ok(PreparedRequest {
        protocol,
        method: Method::POST,
        url: control_url,
        headers: vec![
            (
                "Content-Type".to_string(),
                "text/xml; charset=\"utf-8\"".to_string(),
            ),
            (
                "SOAPAction".to_string(),
                super::soap::soap_action_header(&service_type, action),
            ),
        ],
        body: Some(envelope),
        action: action.to_string(),
        expects_soap: true,
    })
}

/// Map a short service name onto a (serviceType, controlURL) pair. The
/// device description wins; the profile's table fills gaps for devices
/// that under-advertise.
fn resolve_service(
    device: &Device,
    profile: Option<&DeviceProfile>,
    service_name: &str,
) -> Result<(String, String), Error> {
    for service in &device.services {
        if crate::profiling::service_name_from_urn(&service.service_type) == service_name
            && !service.control_url.is_empty()
        {
            return Ok((service.service_type.clone(), service.control_url.clone()));
        }
    }
    if let Some(table) = profile.and_then(|p| p.upnp.as_ref())
        && let Some(entry) = table.get(service_name)
    {
        let control_url = format!("http://{}:{}{}", device.ip, device.port, entry.control_url);
        return Ok((entry.service_type.clone(), control_url));
    }
    Err(Error::UnknownService(service_name.to_string()))
}

/// Reorder caller arguments into SCPD declaration order, rejecting unknown
/// names and missing inputs
fn order_arguments(
    action: &crate::scpd::SoapAction,
    args: &[(String, String)],
) -> Result<Vec<(String, String)>, Error> {
    for (name, _) in args {
        let known = action
            .arguments_in
            .iter()
            .any(|a| a.direction == Direction::In && a.name == *name);
        if !known {
            return Err(Error::InvalidArgument(format!(
                "unknown argument {} for {}",
                name, action.name
            )));
        }
    }
    let mut ordered = Vec::with_capacity(action.arguments_in.len());
    for declared in &action.arguments_in {
        match args.iter().find(|(name, _)| *name == declared.name) {
            Some((name, value)) => ordered.push((name.clone(), value.clone())),
            None => {
                return Err(Error::InvalidArgument(format!(
                    "missing argument {} for {}",
                    declared.name, action.name
                )));
            }
        }
    }
    Ok(ordered)
}

fn force_https(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_scheme("https");
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Roku External Control Protocol: keypresses, app launch, and text input
/// over plain HTTP POST
fn prepare_ecp(
    device: &Device,
    profile: Option<&DeviceProfile>,
    qualified: &str,
    args: &[(String, String)],
) -> Result<PreparedRequest, Error> {
    let (_, action) = split_qualified(qualified);
    let block = profile.and_then(|p| p.ecp.as_ref());
    let port = block.map(|b| b.port).unwrap_or(8060);

    let (path, body) = match action {
        "launch" => {
            let path = match args.iter().find(|(name, _)| name == "app_id") {
                Some((_, app_id)) => format!("/launch/{}", app_id),
                None => block
                    .map(|b| b.launch_url.clone())
                    .unwrap_or_else(|| "/launch/2213".to_string()),
            };
            (path, None)
        }
        "input" => {
            let path = block
                .map(|b| b.input_url.clone())
                .unwrap_or_else(|| "/input".to_string());
            let form: String = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(args.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            (path, Some(form))
        }
        key => (format!("/keypress/{}", key), None),
    };

    Ok(PreparedRequest {
        protocol: Protocol::Ecp,
        method: Method::POST,
        url: format!("http://{}:{}{}", device.ip, port, path),
        headers: body
            .is_some()
            .then(|| {
                vec![(
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                )]
            })
            .unwrap_or_default(),
        body,
        action: action.to_string(),
        expects_soap: false,
    })
}

/// Samsung WAM: URL-encoded `<n>Command</n>` payloads on port 55001
fn prepare_wam(
    device: &Device,
    profile: Option<&DeviceProfile>,
    qualified: &str,
    args: &[(String, String)],
) -> Result<PreparedRequest, Error> {
    let (_, action) = split_qualified(qualified);
    let block = profile.and_then(|p| p.wam.as_ref());
    let port = block.map(|b| b.port).unwrap_or(55001);

    let cmd = match block.and_then(|b| b.set_url_playback.as_ref()) {
        Some(template) if action.eq_ignore_ascii_case("SetUrlPlayback") => {
            substitute_placeholders(&template.cmd, args)
        }
        _ => {
            let mut cmd = format!("<n>{}</n>", action);
            for (name, value) in args {
                let kind = if value.parse::<i64>().is_ok() { "dec" } else { "str" };
                cmd.push_str(&format!(
                    "<p type=\"{}\" name=\"{}\" val=\"{}\"/>",
                    kind, name, value
                ));
            }
            cmd
        }
    };

    let encoded: String = form_urlencoded::byte_serialize(cmd.as_bytes()).collect();
    let endpoint = block
        .and_then(|b| b.set_url_playback.as_ref())
        .map(|c| c.endpoint.clone())
        .unwrap_or_else(|| "/UIC?cmd={CMD}".to_string());
    let path = endpoint.replace("{CMD}", &encoded);

    Ok(PreparedRequest {
        protocol: Protocol::Wam,
        method: Method::GET,
        url: format!("http://{}:{}{}", device.ip, port, path),
        headers: Vec::new(),
        body: None,
        action: action.to_string(),
        expects_soap: false,
    })
}

/// Template-driven vendor HTTP APIs (HEOS, MusicCast, SoundTouch)
fn prepare_vendor_http(
    device: &Device,
    block: &VendorHttpBlock,
    protocol: Protocol,
    qualified: &str,
    args: &[(String, String)],
) -> Result<PreparedRequest, Error> {
    let (_, action) = split_qualified(qualified);
    let template = block
        .endpoints
        .get(action)
        .or_else(|| block.commands.get(action))
        .ok_or_else(|| Error::UnknownAction(format!("{}:{}", protocol, action)))?;

    let path = substitute_placeholders(template, args);
    Ok(PreparedRequest {
        protocol,
        method: Method::GET,
        url: format!("http://{}:{}{}", device.ip, block.port, path),
        headers: Vec::new(),
        body: None,
        action: action.to_string(),
        expects_soap: false,
    })
}

/// JSON-RPC endpoints such as Kodi: one POST per action with the arguments
/// as the params object
fn prepare_jsonrpc(
    device: &Device,
    profile: Option<&DeviceProfile>,
    qualified: &str,
    args: &[(String, String)],
) -> Result<PreparedRequest, Error> {
    let (_, action) = split_qualified(qualified);
    let block = profile.and_then(|p| p.jsonrpc.as_ref());
    let port = block.map(|b| b.port).unwrap_or(8080);
    let endpoint = block
        .and_then(|b| b.endpoint.clone())
        .unwrap_or_else(|| "/jsonrpc".to_string());

    let params: serde_json::Map<String, serde_json::Value> = args
        .iter()
        .map(|(name, value)| (name.clone(), coerce_json_value(value)))
        .collect();
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": action,
        "params": params,
    });

    Ok(PreparedRequest {
        protocol: Protocol::JsonRpc,
        method: Method::POST,
        url: format!("http://{}:{}{}", device.ip, port, endpoint),
        headers: vec![(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )],
        body: Some(body.to_string()),
        action: action.to_string(),
        expects_soap: false,
    })
}

fn coerce_json_value(value: &str) -> serde_json::Value {
    if let Ok(n) = value.parse::<i64>() {
        return serde_json::Value::from(n);
    }
    if let Ok(b) = value.parse::<bool>() {
        return serde_json::Value::from(b);
    }
    serde_json::Value::from(value)
}

/// Cast devices are identified, not driven: report the endpoint a Cast
/// client would need
fn prepare_cast(
    device: &Device,
    profile: Option<&DeviceProfile>,
) -> Result<PreparedRequest, Error> {
    let block = profile.and_then(|p| p.cast.as_ref());
    let port = block.map(|b| b.port).unwrap_or(8008);
    let path = block
        .map(|b| b.device_desc_url.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/ssdp/device-desc.xml".to_string());
    Err(Error::NotImplemented(format!(
        "cast endpoint http://{}:{}{}",
        device.ip, port, path
    )))
}
