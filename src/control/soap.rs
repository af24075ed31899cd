//! SOAP 1.1 envelope construction and response parsing for UPnP action
//! invocation, including fault and UPnPError extraction.

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::Error;
use crate::xml;

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING_NS: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Build the SOAPAction header value: `"{serviceType}#{action}"`, quoted
pub fn soap_action_header(service_type: &str, action: &str) -> String {
    format!("\"{}#{}\"", service_type, action)
}

/// Build a SOAP request envelope. Arguments become direct children of the
/// action element in the order given, which callers take from the SCPD
/// declaration order.
pub fn build_envelope(
    service_type: &str,
    action: &str,
    arguments: &[(String, String)],
) -> Result<String, Error> {
    let mut action_el = Element::new(&format!("u:{}", action));
    action_el
        .attributes
        .insert("xmlns:u".to_string(), service_type.to_string());
    for (name, value) in arguments {
        let mut arg = Element::new(name);
        arg.children.push(XMLNode::Text(value.clone()));
        action_el.children.push(XMLNode::Element(arg));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(action_el));

    let mut envelope = Element::new("s:Envelope");
    envelope
        .attributes
        .insert("xmlns:s".to_string(), SOAP_ENVELOPE_NS.to_string());
    envelope
        .attributes
        .insert("s:encodingStyle".to_string(), SOAP_ENCODING_NS.to_string());
    envelope.children.push(XMLNode::Element(body));

    let mut buf = Vec::new();
    let config = EmitterConfig::new().perform_indent(true).indent_string("  ");
    envelope
        .write_with_config(&mut buf, config)
        .map_err(|e| Error::MalformedXml(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| Error::MalformedXml(e.to_string()))
}

/// Parse a SOAP response body for an action. Returns the named output
/// arguments of `<u:{Action}Response>`, or the fault as an error.
pub fn parse_action_response(
    body: &str,
    action: &str,
) -> Result<Vec<(String, String)>, Error> {
    let root = xml::parse(body)?;
    let soap_body = xml::find_descendant(&root, "Body")
        .ok_or_else(|| Error::MalformedXml("no SOAP Body".into()))?;

    if let Some(fault) = find_by_suffix(soap_body, "Fault") {
        return Err(parse_fault(fault));
    }

    let response_name = format!("{}Response", action);
    let response = find_by_suffix(soap_body, &response_name)
        .ok_or_else(|| Error::MalformedXml(format!("no {} element", response_name)))?;

    Ok(response
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .map(|el| {
            let value = el
                .get_text()
                .map(|t| t.trim().to_string())
                .unwrap_or_default();
            (local_name(&el.name).to_string(), value)
        })
        .collect())
}

/// Extract fault code, fault string, and the UPnP error code when present
fn parse_fault(fault: &Element) -> Error {
    let code = descendant_text(fault, "faultcode").unwrap_or_else(|| "s:Fault".into());
    let mut desc = descendant_text(fault, "faultstring").unwrap_or_default();
    let mut upnp_code = None;

    if let Some(detail) = find_by_suffix(fault, "detail")
        && let Some(upnp_error) = find_by_suffix(detail, "UPnPError")
    {
        upnp_code = descendant_text(upnp_error, "errorCode").and_then(|c| c.parse().ok());
        // The faultstring is usually the literal "UPnPError"; the error code
        // carries the actual diagnosis
        if let Some(description) = descendant_text(upnp_error, "errorDescription") {
            desc = description;
        } else if let Some(code) = upnp_code {
            desc = describe_upnp_error(code).to_string();
        }
    }

    Error::SoapFault {
        code,
        desc,
        upnp_code,
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn find_by_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    for node in &parent.children {
        if let Some(el) = node.as_element() {
            if local_name(&el.name).eq_ignore_ascii_case(suffix) {
                return Some(el);
            }
            if let Some(found) = find_by_suffix(el, suffix) {
                return Some(found);
            }
        }
    }
    None
}

fn descendant_text(parent: &Element, name: &str) -> Option<String> {
    let text = find_by_suffix(parent, name)?.get_text()?.trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// Standard UPnP error code descriptions
pub fn describe_upnp_error(code: u32) -> &'static str {
    match code {
        401 => "Invalid Action",
        402 => "Invalid Args",
        501 => "Action Failed",
        600 => "Argument Value Invalid",
        601 => "Argument Value Out of Range",
        602 => "Optional Action Not Implemented",
        603 => "Out of Memory",
        604 => "Human Intervention Required",
        605 => "String Argument Too Long",
        701 => "Transition not available",
        702 => "No contents",
        703 => "Read error",
        704 => "Format not supported for recording",
        705 => "Transport is locked",
        706 => "Write error",
        707 => "Media is protected or not writeable",
        708 => "Format not supported",
        709 => "Transport must be stopped",
        710 => "Seek mode not supported",
        711 => "Illegal seek target",
        712 => "Play mode not supported",
        713 => "Record quality not supported",
        714 => "Illegal MIME-Type",
        715 => "Content BUSY",
        716 => "Resource Not found",
        717 => "Play speed not supported",
        718 => "Invalid InstanceID",
        _ => "Unknown error",
    }
}

/// Minimal escaped DIDL-Lite wrapper for a media URL, used when setting
/// transport URIs on renderers that require metadata
pub fn didl_metadata(uri: &str, title: &str) -> String {
    format!(
        "&lt;DIDL-Lite xmlns=\"urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/\" \
         xmlns:dc=\"http://purl.org/dc/elements/1.1/\" \
         xmlns:upnp=\"urn:schemas-upnp-org:metadata-1-0/upnp/\"&gt;\
         &lt;item id=\"1\" parentID=\"0\" restricted=\"1\"&gt;\
         &lt;dc:title&gt;{}&lt;/dc:title&gt;\
         &lt;upnp:class&gt;object.item.audioItem.musicTrack&lt;/upnp:class&gt;\
         &lt;res protocolInfo=\"http-get:*:audio/mpeg:*\"&gt;{}&lt;/res&gt;\
         &lt;/item&gt;&lt;/DIDL-Lite&gt;",
        title, uri
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_has_ordered_children() {
        let args = vec![
            ("InstanceID".to_string(), "0".to_string()),
            ("Channel".to_string(), "Master".to_string()),
        ];
        let xml = build_envelope(
            "urn:schemas-upnp-org:service:RenderingControl:1",
            "GetVolume",
            &args,
        )
        .unwrap();

        assert_eq!(xml.matches("<u:GetVolume").count(), 1);
        assert!(xml.contains("xmlns:u=\"urn:schemas-upnp-org:service:RenderingControl:1\""));
        let instance = xml.find("<InstanceID>0</InstanceID>").unwrap();
        let channel = xml.find("<Channel>Master</Channel>").unwrap();
        assert!(instance < channel);
        assert!(xml.contains("xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\""));
    }

    #[test]
    fn test_soap_action_header_quoted() {
        assert_eq!(
            soap_action_header("urn:schemas-upnp-org:service:RenderingControl:1", "GetVolume"),
            "\"urn:schemas-upnp-org:service:RenderingControl:1#GetVolume\""
        );
    }

    #[test]
    fn test_parse_response_outputs() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
      <CurrentVolume>25</CurrentVolume>
    </u:GetVolumeResponse>
  </s:Body>
</s:Envelope>"#;
        let outputs = parse_action_response(body, "GetVolume").unwrap();
        assert_eq!(outputs, vec![("CurrentVolume".to_string(), "25".to_string())]);
    }

    #[test]
    fn test_parse_empty_response() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body><u:SetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"/></s:Body>
</s:Envelope>"#;
        let outputs = parse_action_response(body, "SetVolume").unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_parse_fault_with_upnp_code() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>701</errorCode>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let err = parse_action_response(body, "Play").unwrap_err();
        match err {
            Error::SoapFault {
                code,
                desc,
                upnp_code,
            } => {
                assert_eq!(code, "s:Client");
                assert_eq!(upnp_code, Some(701));
                assert_eq!(desc, "Transition not available");
            }
            other => panic!("expected SoapFault, got {:?}", other),
        }
    }

    #[test]
    fn test_error_table() {
        assert_eq!(describe_upnp_error(401), "Invalid Action");
        assert_eq!(describe_upnp_error(718), "Invalid InstanceID");
        assert_eq!(describe_upnp_error(999), "Unknown error");
    }

    #[test]
    fn test_didl_metadata_escaped() {
        let didl = didl_metadata("http://192.0.2.5/stream.mp3", "Stream");
        assert!(didl.starts_with("&lt;DIDL-Lite"));
        assert!(didl.contains("http://192.0.2.5/stream.mp3"));
        assert!(!didl.contains('<'));
    }
}
