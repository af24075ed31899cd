//! Tolerant XML normalizer. Real-world device descriptions arrive with BOMs,
//! control characters, undeclared namespace prefixes, and bare ampersands;
//! this module cleans them up, strips namespaces, and extracts typed records.

use url::Url;
use xmltree::Element;

use crate::device::Service;
use crate::error::Error;

/// Remove BOM and control characters that break strict XML parsers
pub fn sanitize(content: &str) -> String {
    content
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Escape `&` characters that do not begin a valid entity reference
fn escape_bare_ampersands(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for (i, c) in content.char_indices() {
        if c == '&' {
            let rest = &content[i + 1..];
            let entity_end = rest.find(';').unwrap_or(usize::MAX);
            let looks_like_entity = entity_end != usize::MAX
                && entity_end <= 10
                && rest[..entity_end]
                    .chars()
                    .all(|e| e.is_ascii_alphanumeric() || e == '#');
            if looks_like_entity {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Drop `prefix:` from tag names so undeclared namespaces cannot break parsing
fn strip_tag_prefixes(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '<' {
            // Copy optional '/' then buffer the tag name up to a delimiter
            if chars.peek() == Some(&'/') {
                out.push(chars.next().unwrap());
            }
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_whitespace() || n == '>' || n == '/' {
                    break;
                }
                name.push(chars.next().unwrap());
            }
            match name.split_once(':') {
                Some((prefix, local))
                    if !prefix.is_empty() && prefix.chars().all(|p| p.is_ascii_alphanumeric()) =>
                {
                    out.push_str(local)
                }
                _ => out.push_str(&name),
            }
        }
    }
    out
}

/// Parse an XML document, falling back to progressively heavier cleanup.
/// Fails with [`Error::MalformedXml`] only when no strategy yields a root.
pub fn parse(content: &str) -> Result<Element, Error> {
    let cleaned = sanitize(content);
    if let Ok(root) = Element::parse(cleaned.as_bytes()) {
        return Ok(root);
    }
    let escaped = escape_bare_ampersands(&cleaned);
    if let Ok(root) = Element::parse(escaped.as_bytes()) {
        return Ok(root);
    }
    let stripped = strip_tag_prefixes(&escaped);
    Element::parse(stripped.as_bytes()).map_err(|e| Error::MalformedXml(e.to_string()))
}

/// First direct child with the given local name, case-insensitive
pub fn find_child<'a>(parent: &'a Element, name: &str) -> Option<&'a Element> {
    parent
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .find(|el| el.name.eq_ignore_ascii_case(name))
}

/// All direct children with the given local name, case-insensitive
pub fn find_children<'a>(parent: &'a Element, name: &str) -> Vec<&'a Element> {
    parent
        .children
        .iter()
        .filter_map(|node| node.as_element())
        .filter(|el| el.name.eq_ignore_ascii_case(name))
        .collect()
}

/// Depth-first search for the first descendant with the given local name
pub fn find_descendant<'a>(parent: &'a Element, name: &str) -> Option<&'a Element> {
    for node in &parent.children {
        if let Some(el) = node.as_element() {
            if el.name.eq_ignore_ascii_case(name) {
                return Some(el);
            }
            if let Some(found) = find_descendant(el, name) {
                return Some(found);
            }
        }
    }
    None
}

/// Trimmed text of a named direct child, empty-filtered
pub fn child_text(parent: &Element, name: &str) -> Option<String> {
    let text = find_child(parent, name)?.get_text()?.trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// Identity fields extracted from a device description document
#[derive(Debug, Clone, Default)]
pub struct DeviceDescription {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_number: String,
    pub udn: String,
    pub services: Vec<Service>,
}

/// Parse a UPnP device description. Missing fields become empty strings;
/// service URLs are resolved to absolute form against `<URLBase>` when
/// present, otherwise against the fetch URL's origin.
pub fn parse_device_description(
    xml: &str,
    fetch_url: &Url,
) -> Result<DeviceDescription, Error> {
    let root = parse(xml)?;

    let base = child_text(&root, "URLBase")
        .and_then(|b| Url::parse(b.trim()).ok())
        .unwrap_or_else(|| fetch_url.clone());

    let device = if root.name.eq_ignore_ascii_case("device") {
        &root
    } else {
        find_descendant(&root, "device")
            .ok_or_else(|| Error::MalformedXml("no device element".into()))?
    };

    let mut description = DeviceDescription {
        device_type: child_text(device, "deviceType").unwrap_or_default(),
        friendly_name: child_text(device, "friendlyName").unwrap_or_default(),
        manufacturer: child_text(device, "manufacturer").unwrap_or_default(),
        model_name: child_text(device, "modelName").unwrap_or_default(),
        model_number: child_text(device, "modelNumber").unwrap_or_default(),
        udn: child_text(device, "UDN").unwrap_or_default(),
        services: Vec::new(),
    };

    collect_services(device, &base, &mut description.services);
    Ok(description)
}

/// Gather services of a device and of its embedded sub-devices, in
/// declaration order. Sonos-style descriptions nest MediaRenderer and
/// MediaServer devices inside `<deviceList>`.
fn collect_services(device: &Element, base: &Url, out: &mut Vec<Service>) {
    if let Some(service_list) = find_child(device, "serviceList") {
        for service in find_children(service_list, "service") {
            out.push(Service {
                service_type: child_text(service, "serviceType").unwrap_or_default(),
                service_id: child_text(service, "serviceId").unwrap_or_default(),
                control_url: resolve_url(base, child_text(service, "controlURL")),
                event_sub_url: resolve_url(base, child_text(service, "eventSubURL")),
                scpd_url: resolve_url(base, child_text(service, "SCPDURL")),
            });
        }
    }
    if let Some(device_list) = find_child(device, "deviceList") {
        for embedded in find_children(device_list, "device") {
            collect_services(embedded, base, out);
        }
    }
}

fn resolve_url(base: &Url, path: Option<String>) -> String {
    match path {
        Some(path) => base
            .join(path.trim())
            .map(|u| u.to_string())
            .unwrap_or(path),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERER_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room</friendlyName>
    <manufacturer>Sonos, Inc.</manufacturer>
    <modelName>Sonos Port</modelName>
    <modelNumber>S23</modelNumber>
    <UDN>uuid:RINCON_000E5812345601400</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/MediaRenderer/AVTransport/Control</controlURL>
        <eventSubURL>/MediaRenderer/AVTransport/Event</eventSubURL>
        <SCPDURL>/xml/AVTransport1.xml</SCPDURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_device_description() {
        let fetch = Url::parse("http://192.168.1.50:1400/xml/device_description.xml").unwrap();
        let desc = parse_device_description(RENDERER_XML, &fetch).unwrap();
        assert_eq!(desc.friendly_name, "Living Room");
        assert_eq!(desc.manufacturer, "Sonos, Inc.");
        assert_eq!(desc.udn, "uuid:RINCON_000E5812345601400");
        assert_eq!(desc.services.len(), 1);
        assert_eq!(
            desc.services[0].control_url,
            "http://192.168.1.50:1400/MediaRenderer/AVTransport/Control"
        );
        assert_eq!(
            desc.services[0].scpd_url,
            "http://192.168.1.50:1400/xml/AVTransport1.xml"
        );
    }

    #[test]
    fn test_urlbase_overrides_fetch_origin() {
        let xml = RENDERER_XML.replace(
            "<specVersion>",
            "<URLBase>http://10.0.0.9:49152/</URLBase><specVersion>",
        );
        let fetch = Url::parse("http://192.168.1.50:1400/desc.xml").unwrap();
        let desc = parse_device_description(&xml, &fetch).unwrap();
        assert!(
            desc.services[0]
                .control_url
                .starts_with("http://10.0.0.9:49152/")
        );
    }

    #[test]
    fn test_embedded_device_services_folded() {
        let xml = r#"<root>
  <device>
    <deviceType>urn:schemas-upnp-org:device:ZonePlayer:1</deviceType>
    <friendlyName>Sonos</friendlyName>
    <UDN>uuid:RINCON_1</UDN>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
            <controlURL>/MediaRenderer/RenderingControl/Control</controlURL>
            <SCPDURL>/xml/RenderingControl1.xml</SCPDURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;
        let fetch = Url::parse("http://192.168.1.50:1400/desc.xml").unwrap();
        let desc = parse_device_description(xml, &fetch).unwrap();
        assert_eq!(desc.services.len(), 1);
        assert!(desc.services[0].service_type.contains("RenderingControl"));
    }

    #[test]
    fn test_tolerates_bom_and_bare_ampersand() {
        let xml = "\u{feff}<root><device><friendlyName>Bed & Bath</friendlyName></device></root>";
        let fetch = Url::parse("http://192.168.1.2:8080/desc.xml").unwrap();
        let desc = parse_device_description(xml, &fetch).unwrap();
        assert_eq!(desc.friendly_name, "Bed & Bath");
    }

    #[test]
    fn test_undeclared_prefix_stripped() {
        let xml = "<root><ns:device><friendlyName>TV</friendlyName></ns:device></root>";
        let fetch = Url::parse("http://192.168.1.2:8080/desc.xml").unwrap();
        let desc = parse_device_description(xml, &fetch).unwrap();
        assert_eq!(desc.friendly_name, "TV");
    }

    #[test]
    fn test_malformed_root_is_an_error() {
        let fetch = Url::parse("http://192.168.1.2:8080/desc.xml").unwrap();
        assert!(matches!(
            parse_device_description("not xml at all", &fetch),
            Err(Error::MalformedXml(_))
        ));
    }

    #[test]
    fn test_missing_fields_become_empty() {
        let xml = "<root><device><friendlyName>Bare</friendlyName></device></root>";
        let fetch = Url::parse("http://192.168.1.2:8080/desc.xml").unwrap();
        let desc = parse_device_description(xml, &fetch).unwrap();
        assert_eq!(desc.manufacturer, "");
        assert_eq!(desc.udn, "");
        assert!(desc.services.is_empty());
    }
}
