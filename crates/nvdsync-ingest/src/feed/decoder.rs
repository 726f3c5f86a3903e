//! NVD XML feed decoding
//!
//! The NVD 2.0 feeds are a single `<nvd>` root holding one `<entry>` per CVE.
//! Each entry subtree is converted to JSON without a schema:
//!
//! - attributes and child elements become object keys (local names, namespace
//!   prefixes dropped, `xmlns` declarations skipped)
//! - repeated children with the same name become arrays
//! - a text-only element becomes a string; text next to attributes is stored
//!   under `value`
//!
//! The record id is the entry's `id` attribute, falling back to its `cve-id`
//! child. Gzip-compressed feeds are detected by their magic bytes.

use flate2::read::GzDecoder;
use nvdsync_common::DecodeError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::io::Read;

use super::Record;

const ROOT_ELEMENT: &str = "nvd";
const ENTRY_ELEMENT: &str = "entry";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Turns raw feed bytes into records. Implementations hold no state.
pub trait FeedDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Vec<Record>, DecodeError>;
}

/// Decoder for the NVD CVE 2.0 XML feed format
#[derive(Debug, Clone, Copy, Default)]
pub struct NvdXmlDecoder;

impl FeedDecoder for NvdXmlDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Vec<Record>, DecodeError> {
        if raw.starts_with(&GZIP_MAGIC) {
            let mut inflated = Vec::with_capacity(raw.len() * 4);
            GzDecoder::new(raw).read_to_end(&mut inflated)?;
            return parse_entries(&inflated);
        }

        parse_entries(raw)
    }
}

/// An element inside an entry that is still open
struct Node {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(name: String, start: &BytesStart<'_>) -> Result<Self, DecodeError> {
        let mut fields = Map::new();

        for attr in start.attributes() {
            let attr = attr.map_err(xml_error)?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_error)?.into_owned();
            insert_field(&mut fields, key, Value::String(value));
        }

        Ok(Self {
            name,
            fields,
            text: String::new(),
        })
    }

    fn into_value(self) -> Value {
        let Node {
            mut fields, text, ..
        } = self;

        match (fields.is_empty(), text.is_empty()) {
            (true, true) => Value::Null,
            (true, false) => Value::String(text),
            (false, true) => Value::Object(fields),
            (false, false) => {
                fields.insert("value".to_string(), Value::String(text));
                Value::Object(fields)
            },
        }
    }

    fn into_record(self, position: usize) -> Result<Record, DecodeError> {
        let id = ["id", "cve-id"]
            .iter()
            .filter_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or(DecodeError::MissingId { position })?;

        Ok(Record {
            id,
            payload: self.into_value(),
        })
    }
}

fn parse_entries(xml: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut records = Vec::new();
    let mut open: Vec<Node> = Vec::new();
    let mut depth = 0usize;
    let mut root_seen = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(start) => {
                depth += 1;
                let name = local_name(&start);

                if depth == 1 {
                    expect_root(&name)?;
                    root_seen = true;
                } else if !open.is_empty() || (depth == 2 && name == ENTRY_ELEMENT) {
                    open.push(Node::open(name, &start)?);
                }
            },
            Event::Empty(start) => {
                let name = local_name(&start);

                if depth == 0 {
                    expect_root(&name)?;
                    root_seen = true;
                } else if !open.is_empty() {
                    let node = Node::open(name, &start)?;
                    attach(&mut open, node);
                } else if depth == 1 && name == ENTRY_ELEMENT {
                    let node = Node::open(name, &start)?;
                    records.push(node.into_record(records.len() + 1)?);
                }
            },
            Event::Text(text) => {
                if let Some(node) = open.last_mut() {
                    node.text.push_str(&text.unescape().map_err(xml_error)?);
                }
            },
            Event::CData(data) => {
                if let Some(node) = open.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data));
                }
            },
            Event::End(_) => {
                if let Some(node) = open.pop() {
                    if open.is_empty() {
                        records.push(node.into_record(records.len() + 1)?);
                    } else {
                        attach(&mut open, node);
                    }
                }
                depth = depth.saturating_sub(1);
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !root_seen || depth != 0 {
        return Err(DecodeError::Truncated);
    }

    Ok(records)
}

fn expect_root(name: &str) -> Result<(), DecodeError> {
    if name == ROOT_ELEMENT {
        Ok(())
    } else {
        Err(DecodeError::UnexpectedRoot(name.to_string()))
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn attach(open: &mut [Node], child: Node) {
    if let Some(parent) = open.last_mut() {
        let name = child.name.clone();
        insert_field(&mut parent.fields, name, child.into_value());
    }
}

fn insert_field(fields: &mut Map<String, Value>, key: String, value: Value) {
    match fields.get_mut(&key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
        None => {
            fields.insert(key, value);
        },
    }
}

fn xml_error(err: impl std::fmt::Display) -> DecodeError {
    DecodeError::Xml(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const SAMPLE: &[u8] = include_bytes!("../../tests/fixtures/nvdcve-2.0-sample.xml");

    #[test]
    fn test_decode_sample_feed() {
        let records = NvdXmlDecoder.decode(SAMPLE).unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-2003-0001", "CVE-2003-0002", "CVE-2003-0003"]);
    }

    #[test]
    fn test_entry_structure_is_mapped_to_json() {
        let records = NvdXmlDecoder.decode(SAMPLE).unwrap();
        let first = &records[0].payload;

        assert_eq!(first["id"], "CVE-2003-0001");
        assert_eq!(first["cve-id"], "CVE-2003-0001");
        assert_eq!(first["published-datetime"], "2003-01-17T00:00:00.000-05:00");
        assert_eq!(first["cvss"]["base_metrics"]["score"], "5.0");
        assert_eq!(first["cwe"]["id"], "CWE-200");

        // repeated <vuln:references> become an array
        let references = first["references"].as_array().unwrap();
        assert_eq!(references.len(), 2);
        assert_eq!(references[0]["reference_type"], "UNKNOWN");
        assert_eq!(references[0]["reference"]["href"], "http://www.securityfocus.com/bid/6535");
        assert_eq!(references[0]["reference"]["value"], "6535");
    }

    #[test]
    fn test_entities_and_empty_elements() {
        let records = NvdXmlDecoder.decode(SAMPLE).unwrap();
        let second = &records[1].payload;

        assert_eq!(
            second["summary"],
            "Buffer overflow in <foo> & bar allows remote attackers to cause a denial of service."
        );
        assert_eq!(second["security-protection"], Value::Null);
    }

    #[test]
    fn test_id_falls_back_to_cve_id_child() {
        let records = NvdXmlDecoder.decode(SAMPLE).unwrap();
        assert_eq!(records[2].id, "CVE-2003-0003");
        assert!(records[2].payload.get("id").is_none());
    }

    #[test]
    fn test_decode_gzip_feed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE).unwrap();
        let compressed = encoder.finish().unwrap();

        let records = NvdXmlDecoder.decode(&compressed).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_empty_feed_has_no_records() {
        let empty = br#"<?xml version="1.0"?><nvd xmlns="http://scap.nist.gov/schema/feed/vulnerability/2.0"/>"#;
        assert!(NvdXmlDecoder.decode(empty).unwrap().is_empty());

        let open_close = br#"<nvd nvd_xml_version="2.0"></nvd>"#;
        assert!(NvdXmlDecoder.decode(open_close).unwrap().is_empty());
    }

    #[test]
    fn test_unexpected_root_is_rejected() {
        let rss = br#"<rss version="2.0"><channel/></rss>"#;
        assert!(matches!(
            NvdXmlDecoder.decode(rss),
            Err(DecodeError::UnexpectedRoot(name)) if name == "rss"
        ));
    }

    #[test]
    fn test_truncated_feed_is_rejected() {
        let truncated = br#"<nvd><entry id="CVE-2003-0001"><summary>cut"#;
        assert!(NvdXmlDecoder.decode(truncated).is_err());
        assert!(matches!(NvdXmlDecoder.decode(b""), Err(DecodeError::Truncated)));
    }

    #[test]
    fn test_entry_without_identifier_is_rejected() {
        let feed = br#"<nvd><entry id="CVE-1"/><entry><summary>no id</summary></entry></nvd>"#;
        assert!(matches!(
            NvdXmlDecoder.decode(feed),
            Err(DecodeError::MissingId { position: 2 })
        ));
    }

    #[test]
    fn test_mismatched_tags_are_rejected() {
        let feed = br#"<nvd><entry id="CVE-1"><summary>x</cvss></entry></nvd>"#;
        assert!(matches!(NvdXmlDecoder.decode(feed), Err(DecodeError::Xml(_))));
    }
}
