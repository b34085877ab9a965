//! Proprietary scan container: XML document with base64-encoded mesh blobs.
//!
//! # Schema (fields consumed)
//!
//! ```text
//! <Root version="…">                         format / version string
//!   <SignatureHash>hex</SignatureHash>        file fingerprint (optional)
//!   <Properties>
//!     <Property name="…" value="…"/>          repeated
//!   </Properties>
//!   <Packed_geometry>
//!     <Schema>…</Schema>                      optional
//!     <Binary_data>
//!       <CE version="…">
//!         <Facets facet_count="…" color="…" base64_encoded_bytes="…">base64</Facets>
//!         <Vertices base64_encoded_bytes="…">base64</Vertices>
//!       </CE>
//!     </Binary_data>
//!   </Packed_geometry>
//! </Root>
//! ```
//!
//! Element paths are matched relative to the root element, whatever the root
//! is called.  `base64_encoded_bytes` is the decoded payload length; a
//! disagreement with the decoded length is a hard parse error for the record.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROPERTY_EKID:        &str = "EKID";
pub const PROPERTY_SCAN_SOURCE: &str = "ScanSource";
pub const PROPERTY_SOURCE_APP:  &str = "SourceApp";

const PATH_SIGNATURE: &[&str] = &["SignatureHash"];
const PATH_PROPERTY:  &[&str] = &["Properties", "Property"];
const PATH_SCHEMA:    &[&str] = &["Packed_geometry", "Schema"];
const PATH_CE:        &[&str] = &["Packed_geometry", "Binary_data", "CE"];
const PATH_FACETS:    &[&str] = &["Packed_geometry", "Binary_data", "CE", "Facets"];
const PATH_VERTICES:  &[&str] = &["Packed_geometry", "Binary_data", "CE", "Vertices"];

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Malformed container: {0}")]
    MalformedContainer(String),
    #[error("{element} payload length mismatch: declared {declared} bytes, decoded {actual}")]
    PayloadLengthMismatch {
        element:  &'static str,
        declared: usize,
        actual:   usize,
    },
    #[error("Invalid base64 in {element}: {source}")]
    Base64 {
        element: &'static str,
        #[source]
        source:  base64::DecodeError,
    },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<quick_xml::Error> for ContainerError {
    fn from(e: quick_xml::Error) -> Self {
        ContainerError::Xml(e.to_string())
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

/// One decoded container file.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub source:         PathBuf,
    pub format_version: String,
    pub signature_hash: String,
    pub properties:     BTreeMap<String, String>,
    pub schema:         Option<String>,
    pub ce_version:     String,
    pub facet_count:    u32,
    pub facet_color:    Option<i64>,
    pub facet_payload:  Vec<u8>,
    pub vertex_payload: Vec<u8>,
}

impl ContainerRecord {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn scan_source(&self) -> &str {
        self.property(PROPERTY_SCAN_SOURCE).unwrap_or("")
    }

    pub fn source_app(&self) -> &str {
        self.property(PROPERTY_SOURCE_APP).unwrap_or("")
    }

    pub fn ekid(&self) -> &str {
        self.property(PROPERTY_EKID).unwrap_or("")
    }

    /// Fingerprint decoded to bytes; `None` when empty or not valid hex.
    pub fn fingerprint_bytes(&self) -> Option<Vec<u8>> {
        if self.signature_hash.is_empty() {
            return None;
        }
        hex::decode(&self.signature_hash).ok()
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            format_version: self.format_version.clone(),
            ce_version:     self.ce_version.clone(),
            schema:         self.schema.clone(),
            signature_hash: self.signature_hash.clone(),
            properties:     self.properties.clone(),
            facet_count:    self.facet_count,
            facet_color:    self.facet_color,
            facet_bytes:    self.facet_payload.len(),
            vertex_bytes:   self.vertex_payload.len(),
        }
    }
}

/// Metadata-only view of a [`ContainerRecord`] (no payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub format_version: String,
    pub ce_version:     String,
    pub schema:         Option<String>,
    pub signature_hash: String,
    pub properties:     BTreeMap<String, String>,
    pub facet_count:    u32,
    pub facet_color:    Option<i64>,
    pub facet_bytes:    usize,
    pub vertex_bytes:   usize,
}

impl ContainerSummary {
    pub fn scan_source(&self) -> &str {
        self.properties.get(PROPERTY_SCAN_SOURCE).map_or("", String::as_str)
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Read and parse a container file.
pub fn read_container(path: &Path) -> Result<ContainerRecord, ContainerError> {
    let text = std::fs::read_to_string(path)?;
    parse_container(&text, path)
}

/// Element text gathered while the element is open.
#[derive(Default)]
struct PayloadElement {
    attrs: BTreeMap<String, String>,
    text:  String,
    seen:  bool,
}

/// Parse container XML.  `source` is only recorded, never opened.
pub fn parse_container(xml: &str, source: &Path) -> Result<ContainerRecord, ContainerError> {
    let xml = xml.trim_start_matches('\u{feff}');
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    // Element names below the root.
    let mut stack: Vec<String> = Vec::new();
    let mut root_seen = false;

    let mut format_version = None;
    let mut signature = String::new();
    let mut properties = BTreeMap::new();
    let mut schema: Option<String> = None;
    let mut ce_version: Option<String> = None;
    let mut facets = PayloadElement::default();
    let mut vertices = PayloadElement::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = element_name(&e);
                if !root_seen {
                    root_seen = true;
                    format_version = Some(attributes(&e)?.remove("version").unwrap_or_default());
                    continue;
                }
                stack.push(name);
                open_element(&stack, &e, &mut ce_version, &mut facets, &mut vertices, &mut properties)?;
            }
            Event::Empty(e) => {
                if !root_seen {
                    return Err(ContainerError::MalformedContainer("empty root element".into()));
                }
                stack.push(element_name(&e));
                open_element(&stack, &e, &mut ce_version, &mut facets, &mut vertices, &mut properties)?;
                stack.pop();
            }
            Event::End(_) => {
                if stack.pop().is_none() {
                    // Root closed.
                    break;
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                append_text(&stack, &text, &mut signature, &mut schema, &mut facets, &mut vertices);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                let text = String::from_utf8_lossy(&raw);
                append_text(&stack, &text, &mut signature, &mut schema, &mut facets, &mut vertices);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let format_version = format_version
        .ok_or_else(|| ContainerError::MalformedContainer("no root element".into()))?;
    let ce_version = ce_version
        .ok_or_else(|| ContainerError::MalformedContainer("missing Packed_geometry/Binary_data/CE".into()))?;
    if !facets.seen {
        return Err(ContainerError::MalformedContainer("missing CE/Facets".into()));
    }
    if !vertices.seen {
        return Err(ContainerError::MalformedContainer("missing CE/Vertices".into()));
    }

    let facet_count = required_attr(&facets, "Facets", "facet_count")?
        .trim()
        .parse::<u32>()
        .map_err(|e| ContainerError::MalformedContainer(format!("Facets/@facet_count: {e}")))?;
    let facet_color = facets.attrs.get("color").and_then(|c| c.trim().parse::<i64>().ok());

    let facet_payload = decode_payload("Facets", &facets)?;
    let vertex_payload = decode_payload("Vertices", &vertices)?;

    Ok(ContainerRecord {
        source: source.to_path_buf(),
        format_version,
        signature_hash: signature.trim().to_string(),
        properties,
        schema: schema.map(|s| s.trim().to_string()),
        ce_version,
        facet_count,
        facet_color,
        facet_payload,
        vertex_payload,
    })
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>, ContainerError> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ContainerError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn open_element(
    stack:      &[String],
    e:          &BytesStart<'_>,
    ce_version: &mut Option<String>,
    facets:     &mut PayloadElement,
    vertices:   &mut PayloadElement,
    properties: &mut BTreeMap<String, String>,
) -> Result<(), ContainerError> {
    if at(stack, PATH_PROPERTY) {
        let mut attrs = attributes(e)?;
        if let Some(name) = attrs.remove("name") {
            properties.insert(name, attrs.remove("value").unwrap_or_default());
        }
    } else if at(stack, PATH_CE) {
        *ce_version = Some(attributes(e)?.remove("version").unwrap_or_default());
    } else if at(stack, PATH_FACETS) {
        facets.attrs = attributes(e)?;
        facets.seen = true;
    } else if at(stack, PATH_VERTICES) {
        vertices.attrs = attributes(e)?;
        vertices.seen = true;
    }
    Ok(())
}

fn append_text(
    stack:     &[String],
    text:      &str,
    signature: &mut String,
    schema:    &mut Option<String>,
    facets:    &mut PayloadElement,
    vertices:  &mut PayloadElement,
) {
    if at(stack, PATH_SIGNATURE) {
        signature.push_str(text);
    } else if at(stack, PATH_SCHEMA) {
        schema.get_or_insert_with(String::new).push_str(text);
    } else if at(stack, PATH_FACETS) {
        facets.text.push_str(text);
    } else if at(stack, PATH_VERTICES) {
        vertices.text.push_str(text);
    }
}

fn at(stack: &[String], path: &[&str]) -> bool {
    stack.len() == path.len() && stack.iter().zip(path).all(|(a, b)| a == b)
}

fn required_attr<'a>(
    el:      &'a PayloadElement,
    element: &str,
    name:    &str,
) -> Result<&'a str, ContainerError> {
    el.attrs
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ContainerError::MalformedContainer(format!("{element} missing @{name}")))
}

fn decode_payload(element: &'static str, el: &PayloadElement) -> Result<Vec<u8>, ContainerError> {
    let declared = required_attr(el, element, "base64_encoded_bytes")?
        .trim()
        .parse::<usize>()
        .map_err(|e| {
            ContainerError::MalformedContainer(format!("{element}/@base64_encoded_bytes: {e}"))
        })?;
    let compact: String = el.text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let payload = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|source| ContainerError::Base64 { element, source })?;
    if payload.len() != declared {
        return Err(ContainerError::PayloadLengthMismatch {
            element,
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Serialise a record back to container XML.  Used to build fixtures and to
/// re-emit containers after inspection; payload lengths are always declared
/// truthfully.
pub fn write_container(record: &ContainerRecord) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!("<HPS version=\"{}\">\n", xml_escape(&record.format_version)));
    if !record.signature_hash.is_empty() {
        out.push_str(&format!("  <SignatureHash>{}</SignatureHash>\n", xml_escape(&record.signature_hash)));
    }
    out.push_str("  <Properties>\n");
    for (name, value) in &record.properties {
        out.push_str(&format!(
            "    <Property name=\"{}\" value=\"{}\"/>\n",
            xml_escape(name),
            xml_escape(value)
        ));
    }
    out.push_str("  </Properties>\n  <Packed_geometry>\n");
    if let Some(schema) = &record.schema {
        out.push_str(&format!("    <Schema>{}</Schema>\n", xml_escape(schema)));
    }
    out.push_str("    <Binary_data>\n");
    out.push_str(&format!("      <CE version=\"{}\">\n", xml_escape(&record.ce_version)));
    let color = record.facet_color.map(|c| format!(" color=\"{c}\"")).unwrap_or_default();
    out.push_str(&format!(
        "        <Facets facet_count=\"{}\"{} base64_encoded_bytes=\"{}\">{}</Facets>\n",
        record.facet_count,
        color,
        record.facet_payload.len(),
        b64.encode(&record.facet_payload)
    ));
    out.push_str(&format!(
        "        <Vertices base64_encoded_bytes=\"{}\">{}</Vertices>\n",
        record.vertex_payload.len(),
        b64.encode(&record.vertex_payload)
    ));
    out.push_str("      </CE>\n    </Binary_data>\n  </Packed_geometry>\n</HPS>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
