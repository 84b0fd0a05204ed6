//! SOAP envelope encoding and decoding for the vSphere `urn:vim25` API.
//!
//! Requests and responses are represented as a small owned element tree
//! ([`XmlNode`]). Element names are stored without their namespace prefix;
//! attribute names keep it, so `xsi:type` and `type` stay distinct.

use std::sync::Mutex;
use std::time::Duration;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};

use crate::error::{Error, Result};
use crate::http::fold_set_cookies;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
const VIM_NS: &str = "urn:vim25";

/// API version announced in the `SOAPAction` header.
pub const SOAP_ACTION: &str = "urn:vim25/6.7";

/// An element of a SOAP document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    /// Local element name.
    pub name: String,
    /// Attributes in document order, with qualified names.
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Set the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Append a child element.
    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    /// Element with a single text child, the common scalar argument shape.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).with_text(text)
    }

    /// Look up an attribute by qualified name.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a path of child names.
    pub fn path(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Text of the element at `path`, if present.
    pub fn text_at(&self, path: &[&str]) -> Option<&str> {
        self.path(path).map(|n| n.text.as_str())
    }

    /// True when the element has no child elements.
    pub fn is_scalar(&self) -> bool {
        self.children.is_empty()
    }
}

/// Serialize a method call into a complete SOAP envelope.
pub fn encode_request(method: &str, args: &[XmlNode]) -> Result<String> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut envelope = BytesStart::new("soapenv:Envelope");
    envelope.push_attribute(("xmlns:soapenv", SOAP_ENV_NS));
    envelope.push_attribute(("xmlns:xsi", XSI_NS));
    envelope.push_attribute(("xmlns:xsd", XSD_NS));
    writer.write_event(Event::Start(envelope)).map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("soapenv:Body")))
        .map_err(xml_err)?;

    let call = XmlNode {
        name: method.to_string(),
        attributes: vec![("xmlns".to_string(), VIM_NS.to_string())],
        text: String::new(),
        children: args.to_vec(),
    };
    write_node(&mut writer, &call)?;

    writer
        .write_event(Event::End(BytesEnd::new("soapenv:Body")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("soapenv:Envelope")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) -> Result<()> {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if node.children.is_empty() && node.text.is_empty() {
        return writer.write_event(Event::Empty(start)).map_err(xml_err);
    }

    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    if !node.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&node.text)))
            .map_err(xml_err)?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(xml_err)
}

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::xml(e.to_string())
}

/// Parse an XML document and return its root element.
pub fn parse_element(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = vec![XmlNode::new("#document")];

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => stack.push(start_node(&e)?),
            Event::Empty(e) => {
                let node = start_node(&e)?;
                append_child(&mut stack, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::xml("unbalanced end tag"))?;
                append_child(&mut stack, node)?;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(xml_err)?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                let bytes = c.into_inner();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(Error::xml("document ended inside an element"));
    }
    stack
        .pop()
        .and_then(|doc| doc.children.into_iter().next())
        .ok_or_else(|| Error::xml("document has no root element"))
}

fn start_node(e: &BytesStart<'_>) -> Result<XmlNode> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn append_child(stack: &mut [XmlNode], node: XmlNode) -> Result<()> {
    stack
        .last_mut()
        .ok_or_else(|| Error::xml("element outside of document"))?
        .children
        .push(node);
    Ok(())
}

/// Decode a SOAP response envelope.
///
/// Returns the body's payload element (e.g. `RetrievePropertiesExResponse`),
/// or [`Error::Rpc`] when the body carries a fault.
pub fn decode_response(method: &str, xml: &str) -> Result<XmlNode> {
    let envelope = parse_element(xml)?;
    let body = envelope
        .child("Body")
        .ok_or_else(|| Error::xml(format!("{} response has no SOAP body", method)))?;
    let payload = body
        .children
        .first()
        .ok_or_else(|| Error::xml(format!("{} response body is empty", method)))?;

    if payload.name == "Fault" {
        let fault = payload
            .text_at(&["faultstring"])
            .filter(|s| !s.is_empty())
            .or_else(|| payload.path(&["detail"]).and_then(|d| d.children.first()).map(|d| d.name.as_str()))
            .unwrap_or("unknown fault");
        return Err(Error::Rpc {
            method: method.to_string(),
            fault: fault.to_string(),
        });
    }

    Ok(payload.clone())
}

/// A request/response channel to the hypervisor's object API.
///
/// Each call is independent; implementations must allow concurrent calls.
pub trait Transport: Send + Sync {
    /// Invoke `method` with the given argument elements.
    fn call(&self, method: &str, args: &[XmlNode]) -> Result<XmlNode>;

    /// The API session cookie, once the channel has logged in.
    fn session_cookie(&self) -> Option<String> {
        None
    }
}

/// SOAP over HTTPS to `https://<host>/sdk`.
pub struct SoapTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    cookie: Mutex<Option<String>>,
}

impl SoapTransport {
    /// Build a transport for `host`.
    pub fn new(host: &str, ssl_verify: bool) -> Result<Self> {
        let endpoint = format!("https://{}/sdk", host);
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!ssl_verify)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Transport {
                url: endpoint.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint,
            cookie: Mutex::new(None),
        })
    }
}

impl Transport for SoapTransport {
    fn call(&self, method: &str, args: &[XmlNode]) -> Result<XmlNode> {
        let body = encode_request(method, args)?;
        tracing::debug!(method, endpoint = %self.endpoint, "SOAP call");

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(body);
        if let Some(cookie) = self.session_cookie() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().map_err(|e| Error::Transport {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();

        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if let Some(cookie) = fold_set_cookies(&set_cookies) {
            *self.cookie.lock().unwrap_or_else(|e| e.into_inner()) = Some(cookie);
        }

        let text = response.text().map_err(|e| Error::Transport {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })?;

        match decode_response(method, &text) {
            Err(fault @ Error::Rpc { .. }) => Err(fault),
            _ if !status.is_success() => Err(Error::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                url: self.endpoint.clone(),
            }),
            decoded => decoded,
        }
    }

    fn session_cookie(&self) -> Option<String> {
        self.cookie.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_wraps_method_in_vim_namespace() {
        let args = [
            XmlNode::leaf("_this", "ServiceInstance").with_attr("type", "ServiceInstance"),
        ];
        let xml = encode_request("RetrieveServiceContent", &args).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<RetrieveServiceContent xmlns=\"urn:vim25\">"));
        assert!(xml.contains("<_this type=\"ServiceInstance\">ServiceInstance</_this>"));
    }

    #[test]
    fn test_encode_request_escapes_text() {
        let args = [XmlNode::leaf("password", "a<b&c")];
        let xml = encode_request("Login", &args).unwrap();
        assert!(xml.contains("a&lt;b&amp;c"));
    }

    #[test]
    fn test_empty_argument_is_self_closing() {
        let xml = encode_request("RetrievePropertiesEx", &[XmlNode::new("options")]).unwrap();
        assert!(xml.contains("<options/>"));
    }

    #[test]
    fn test_parse_element_strips_element_prefix_keeps_attribute_prefix() {
        let node = parse_element(
            r#"<soapenv:Envelope xmlns:soapenv="x"><val xsi:type="ManagedObjectReference" type="VirtualMachine">7</val></soapenv:Envelope>"#,
        )
        .unwrap();
        assert_eq!(node.name, "Envelope");
        let val = node.child("val").unwrap();
        assert_eq!(val.attr("xsi:type"), Some("ManagedObjectReference"));
        assert_eq!(val.attr("type"), Some("VirtualMachine"));
        assert_eq!(val.text, "7");
    }

    #[test]
    fn test_decode_response_returns_payload() {
        let xml = r#"<?xml version="1.0"?>
            <soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
              <soapenv:Body>
                <FetchResponse xmlns="urn:vim25"><returnval>ready</returnval></FetchResponse>
              </soapenv:Body>
            </soapenv:Envelope>"#;
        let payload = decode_response("Fetch", xml).unwrap();
        assert_eq!(payload.name, "FetchResponse");
        assert_eq!(payload.text_at(&["returnval"]), Some("ready"));
    }

    #[test]
    fn test_decode_response_fault() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
              <soapenv:Body>
                <soapenv:Fault>
                  <faultcode>ServerFaultCode</faultcode>
                  <faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
                </soapenv:Fault>
              </soapenv:Body>
            </soapenv:Envelope>"#;
        let err = decode_response("Login", xml).unwrap_err();
        match err {
            Error::Rpc { method, fault } => {
                assert_eq!(method, "Login");
                assert!(fault.contains("incorrect user name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_element_rejects_truncated_document() {
        assert!(parse_element("<a><b>text</b>").is_err());
    }

    #[test]
    fn test_node_path_helpers() {
        let node = XmlNode::new("val").with_child(
            XmlNode::new("hardware")
                .with_child(XmlNode::leaf("memoryMB", "2048"))
                .with_child(XmlNode::leaf("numCPU", "2")),
        );
        assert_eq!(node.text_at(&["hardware", "memoryMB"]), Some("2048"));
        assert_eq!(node.text_at(&["hardware", "missing"]), None);
        assert!(!node.is_scalar());
    }
}
