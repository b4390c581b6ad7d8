//! XML building and reading for libvirt definitions
//!
//! Domain and network definitions are produced by [`XmlDocument`], a
//! small builder shaped around how the definition modules write XML: the
//! root element is owned by the document, nesting goes through closure
//! scoped sections so open/close pairs cannot drift apart, and a single
//! [`XmlDocument::element`] call covers leaf elements with or without
//! text. The DOM reader below pulls facts (MAC addresses, disk sources,
//! cyris metadata) back out of `virsh dumpxml` output.

use color_eyre::{eyre::eyre, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

/// Namespace prefix used for cyris metadata embedded in domain XML.
pub const METADATA_NS: &str = "cyris";

/// Streaming builder for one libvirt definition document.
///
/// The root element is opened at construction and closed by
/// [`XmlDocument::finish`]; nested elements close when their section
/// closure returns, so an unbalanced document is impossible by
/// construction.
pub struct XmlDocument {
    writer: Writer<Cursor<Vec<u8>>>,
    root: String,
}

impl fmt::Debug for XmlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlDocument")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn tag(name: &str, attributes: &[(&str, &str)]) -> BytesStart<'static> {
    let mut elem = BytesStart::new(name.to_string());
    for (key, value) in attributes {
        elem.push_attribute((*key, *value));
    }
    elem
}

impl XmlDocument {
    /// Open a document with the given root element.
    pub fn root(name: &str, attributes: &[(&str, &str)]) -> Result<Self> {
        let mut doc = Self {
            writer: Writer::new(Cursor::new(Vec::new())),
            root: name.to_string(),
        };
        doc.open(name, attributes)?;
        Ok(doc)
    }

    fn open(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        self.writer
            .write_event(Event::Start(tag(name, attributes)))
            .map_err(|e| eyre!("XML write failed at <{}>: {}", name, e))
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name.to_string())))
            .map_err(|e| eyre!("XML write failed at </{}>: {}", name, e))
    }

    /// Write a nested element whose children are produced by `body`.
    pub fn section<F>(&mut self, name: &str, attributes: &[(&str, &str)], body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.open(name, attributes)?;
        body(self)?;
        self.close(name)
    }

    /// Write one leaf element. An empty `text` renders self-closing
    /// (`<boot dev="hd"/>`), otherwise the text becomes the element body
    /// (`<vcpu>2</vcpu>`).
    pub fn element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<()> {
        if text.is_empty() {
            return self
                .writer
                .write_event(Event::Empty(tag(name, attributes)))
                .map_err(|e| eyre!("XML write failed at <{}/>: {}", name, e));
        }
        self.open(name, attributes)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| eyre!("XML write failed inside <{}>: {}", name, e))?;
        self.close(name)
    }

    /// Close the root element and return the document as a string.
    pub fn finish(mut self) -> Result<String> {
        let root = std::mem::take(&mut self.root);
        self.close(&root)?;
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| eyre!("Generated XML is not UTF-8: {}", e))
    }
}

/// Minimal DOM node for reading libvirt XML.
#[derive(Debug, Clone)]
pub struct XmlNode {
    /// Element name, namespace prefix included
    pub name: String,
    /// Attribute map
    pub attributes: HashMap<String, String>,
    /// Concatenated text content
    pub text: String,
    /// Child elements in document order
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Depth-first search for the first element with the given name.
    pub fn find(&self, element_name: &str) -> Option<&XmlNode> {
        if self.name == element_name {
            return Some(self);
        }
        for child in &self.children {
            if let Some(found) = child.find(element_name) {
                return Some(found);
            }
        }
        None
    }

    /// Like [`XmlNode::find`], preferring the `cyris:`-namespaced element.
    pub fn find_metadata(&self, element_name: &str) -> Option<&XmlNode> {
        self.find(&format!("{}:{}", METADATA_NS, element_name))
            .or_else(|| self.find(element_name))
    }

    /// Collect every element with the given name, in document order.
    pub fn find_all<'a>(&'a self, element_name: &str, out: &mut Vec<&'a XmlNode>) {
        if self.name == element_name {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(element_name, out);
        }
    }

    /// The node's text content.
    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// One attribute by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }
}

fn node_from_start(e: &BytesStart<'_>) -> XmlNode {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = HashMap::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        attributes.insert(key, value);
    }
    XmlNode {
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    }
}

/// Parse an XML string into a DOM tree rooted at the first element.
pub fn parse_xml_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(node_from_start(&e));
            }
            Ok(Event::Empty(e)) => {
                let node = node_from_start(&e);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                } else if root.is_none() {
                    root = Some(node);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(completed) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(completed);
                    } else {
                        root = Some(completed);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(eyre!("Failed to parse XML: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| eyre!("No root element found in XML"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_roundtrip() {
        let mut doc = XmlDocument::root("network", &[]).unwrap();
        doc.element("name", &[], "cr-br-test-office").unwrap();
        doc.element(
            "bridge",
            &[("name", "cr-br-test-office"), ("stp", "on")],
            "",
        )
        .unwrap();
        doc.element("ip", &[("address", "192.168.10.1")], "").unwrap();

        let xml = doc.finish().unwrap();
        assert!(xml.starts_with("<network>"));
        assert!(xml.contains("<name>cr-br-test-office</name>"));
        assert!(xml.contains("<bridge name=\"cr-br-test-office\" stp=\"on\"/>"));
        assert!(xml.contains("<ip address=\"192.168.10.1\"/>"));
        assert!(xml.ends_with("</network>"));
    }

    #[test]
    fn test_sections_nest_and_balance() {
        let mut doc = XmlDocument::root("domain", &[("type", "kvm")]).unwrap();
        doc.section("devices", &[], |d| {
            d.section("disk", &[("type", "file"), ("device", "disk")], |d| {
                d.element("source", &[("file", "/disks/a.qcow2")], "")
            })?;
            d.section("interface", &[("type", "network")], |d| {
                d.element("source", &[("network", "cr-br-r1-office")], "")
            })
        })
        .unwrap();

        let xml = doc.finish().unwrap();
        assert!(xml.contains("<domain type=\"kvm\">"));
        assert!(xml.contains("<devices><disk type=\"file\" device=\"disk\">"));
        assert!(xml.contains("</disk><interface type=\"network\">"));
        assert!(xml.contains("</interface></devices></domain>"));
    }

    #[test]
    fn test_element_text_vs_empty() {
        let mut doc = XmlDocument::root("os", &[]).unwrap();
        doc.element("type", &[("arch", "x86_64")], "hvm").unwrap();
        doc.element("boot", &[("dev", "hd")], "").unwrap();
        let xml = doc.finish().unwrap();
        assert!(xml.contains("<type arch=\"x86_64\">hvm</type>"));
        assert!(xml.contains("<boot dev=\"hd\"/>"));
    }

    #[test]
    fn test_dom_find_and_attrs() {
        let xml = r#"
        <domain type="kvm">
            <name>cyris-desktop-0123456789ab</name>
            <devices>
                <interface type="network">
                    <mac address="52:54:00:aa:bb:cc"/>
                    <source network="cr-br-test-office"/>
                </interface>
                <interface type="network">
                    <mac address="52:54:00:dd:ee:ff"/>
                    <source network="cr-br-test-dmz"/>
                </interface>
            </devices>
        </domain>
        "#;

        let dom = parse_xml_dom(xml).unwrap();
        assert_eq!(
            dom.find("name").map(|n| n.text_content()),
            Some("cyris-desktop-0123456789ab")
        );

        let mut macs = Vec::new();
        dom.find_all("mac", &mut macs);
        assert_eq!(macs.len(), 2);
        assert_eq!(macs[0].attr("address"), Some("52:54:00:aa:bb:cc"));
        assert_eq!(macs[1].attr("address"), Some("52:54:00:dd:ee:ff"));
    }

    #[test]
    fn test_find_metadata_prefers_namespace() {
        let xml = r#"
            <domain>
                <metadata>
                    <cyris:range xmlns:cyris="https://github.com/cyb3rlab/cyris">
                        <cyris:range-id>train01</cyris:range-id>
                        <range-id>bare</range-id>
                    </cyris:range>
                </metadata>
            </domain>
        "#;

        let dom = parse_xml_dom(xml).unwrap();
        assert_eq!(
            dom.find_metadata("range-id").map(|n| n.text_content()),
            Some("train01")
        );
        assert!(dom.find_metadata("missing").is_none());
    }
}
