//! LLSD structured-data interchange.
//!
//! LLSD is the structured-data format the capability HTTP surface speaks:
//! every capability call POSTs an LLSD-XML body and parses an LLSD-XML
//! reply. This crate provides the value tree ([`Value`]), the XML
//! serializer ([`to_xml`]) and the XML parser ([`from_xml`]).
//!
//! Only the XML serialization is implemented; the protocol's binary and
//! notation serializations are not used by the capability surface.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::{escape::escape, events::Event, Reader};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while parsing LLSD-XML.
#[derive(Error, Debug)]
pub enum LlsdError {
    /// The underlying XML was malformed.
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An element that is not part of the LLSD vocabulary.
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),

    /// Document structure violation (key outside map, missing root, ...).
    #[error("invalid llsd structure: {0}")]
    InvalidStructure(&'static str),

    /// A scalar's text payload failed to parse.
    #[error("invalid {kind} value {value:?}")]
    InvalidScalar {
        /// Scalar element name.
        kind: &'static str,
        /// Offending text.
        value: String,
    },

    /// A `<binary>` payload failed base64 decoding.
    #[error("invalid binary payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The document ended before the root element closed.
    #[error("unexpected end of document")]
    UnexpectedEof,
}

/// An LLSD value.
///
/// Maps are ordered for deterministic serialization; LLSD itself attaches
/// no meaning to key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The absent value, `<undef/>`.
    #[default]
    Undefined,
    /// `<boolean>`.
    Boolean(bool),
    /// `<integer>`, 32-bit signed.
    Integer(i32),
    /// `<real>`, 64-bit float.
    Real(f64),
    /// `<uuid>`.
    Uuid(Uuid),
    /// `<string>` (also used for `<uri>` payloads).
    String(String),
    /// `<binary>`, base64 in XML.
    Binary(Vec<u8>),
    /// `<array>`.
    Array(Vec<Value>),
    /// `<map>`.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Borrow as a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow as an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Read as an integer. `<boolean>` coerces the way the protocol's
    /// servers do.
    #[must_use]
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Boolean(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    /// Read as a float.
    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Integer(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Read as a boolean.
    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            Self::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Borrow as a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Read as a UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow as binary bytes.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    /// Map member lookup; `None` for non-maps and absent keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Serialize a value to an LLSD-XML document.
#[must_use]
pub fn to_xml(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><llsd>");
    write_value(&mut out, value);
    out.push_str("</llsd>");
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Undefined => out.push_str("<undef/>"),
        Value::Boolean(v) => {
            out.push_str(if *v { "<boolean>true</boolean>" } else { "<boolean>false</boolean>" });
        }
        Value::Integer(v) => {
            out.push_str("<integer>");
            out.push_str(&v.to_string());
            out.push_str("</integer>");
        }
        Value::Real(v) => {
            out.push_str("<real>");
            out.push_str(&v.to_string());
            out.push_str("</real>");
        }
        Value::Uuid(v) => {
            out.push_str("<uuid>");
            out.push_str(&v.to_string());
            out.push_str("</uuid>");
        }
        Value::String(v) => {
            out.push_str("<string>");
            out.push_str(&escape(v.as_str()));
            out.push_str("</string>");
        }
        Value::Binary(v) => {
            out.push_str("<binary>");
            out.push_str(&BASE64.encode(v));
            out.push_str("</binary>");
        }
        Value::Array(items) => {
            out.push_str("<array>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</array>");
        }
        Value::Map(map) => {
            out.push_str("<map>");
            for (key, item) in map {
                out.push_str("<key>");
                out.push_str(&escape(key.as_str()));
                out.push_str("</key>");
                write_value(out, item);
            }
            out.push_str("</map>");
        }
    }
}

/// Parse an LLSD-XML document into a value tree.
pub fn from_xml(input: &str) -> Result<Value, LlsdError> {
    let mut reader = Reader::from_str(input);
    let mut parser = Parser::default();

    loop {
        match reader.read_event()? {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Start(start) => {
                let name = element_name(start.name().as_ref())?;
                parser.open(name)?;
            }
            Event::Empty(start) => {
                let name = element_name(start.name().as_ref())?;
                parser.open(name)?;
                parser.close(name)?;
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                if !text.trim().is_empty() || parser.wants_text() {
                    parser.text(&text);
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                parser.text(&text);
            }
            Event::End(end) => {
                let name = element_name(end.name().as_ref())?;
                if let Some(root) = parser.close(name)? {
                    return Ok(root);
                }
            }
            Event::Eof => return Err(LlsdError::UnexpectedEof),
        }
    }
}

/// LLSD element vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Llsd,
    Map,
    Array,
    Key,
    Undef,
    Boolean,
    Integer,
    Real,
    Uuid,
    String,
    Uri,
    Binary,
}

fn element_name(raw: &[u8]) -> Result<Element, LlsdError> {
    Ok(match raw {
        b"llsd" => Element::Llsd,
        b"map" => Element::Map,
        b"array" => Element::Array,
        b"key" => Element::Key,
        b"undef" => Element::Undef,
        b"boolean" => Element::Boolean,
        b"integer" => Element::Integer,
        b"real" => Element::Real,
        b"uuid" => Element::Uuid,
        b"string" => Element::String,
        b"uri" => Element::Uri,
        b"binary" => Element::Binary,
        other => {
            return Err(LlsdError::UnexpectedElement(String::from_utf8_lossy(other).into_owned()));
        }
    })
}

/// Container being filled during the event walk.
enum Frame {
    Map {
        entries: BTreeMap<String, Value>,
        pending_key: Option<String>,
    },
    Array(Vec<Value>),
}

/// Event-driven LLSD builder.
#[derive(Default)]
struct Parser {
    stack: Vec<Frame>,
    /// Scalar element currently open, with its accumulated text.
    scalar: Option<(Element, String)>,
    /// `<key>` currently open, with its accumulated text.
    key: Option<String>,
    seen_root: bool,
    finished: Option<Value>,
}

impl Parser {
    fn wants_text(&self) -> bool {
        self.scalar.is_some() || self.key.is_some()
    }

    fn open(&mut self, element: Element) -> Result<(), LlsdError> {
        if self.scalar.is_some() || self.key.is_some() {
            return Err(LlsdError::InvalidStructure("element nested inside scalar"));
        }
        match element {
            Element::Llsd => {
                if self.seen_root {
                    return Err(LlsdError::InvalidStructure("multiple <llsd> roots"));
                }
                self.seen_root = true;
            }
            Element::Map => {
                self.expect_value_slot()?;
                self.stack.push(Frame::Map { entries: BTreeMap::new(), pending_key: None });
            }
            Element::Array => {
                self.expect_value_slot()?;
                self.stack.push(Frame::Array(Vec::new()));
            }
            Element::Key => match self.stack.last() {
                Some(Frame::Map { pending_key: None, .. }) => self.key = Some(String::new()),
                _ => return Err(LlsdError::InvalidStructure("<key> outside map")),
            },
            scalar => {
                self.expect_value_slot()?;
                self.scalar = Some((scalar, String::new()));
            }
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if let Some((_, buf)) = &mut self.scalar {
            buf.push_str(text);
        } else if let Some(buf) = &mut self.key {
            buf.push_str(text);
        }
    }

    fn close(&mut self, element: Element) -> Result<Option<Value>, LlsdError> {
        match element {
            Element::Llsd => {
                if self.stack.is_empty() && self.scalar.is_none() {
                    Ok(Some(self.finished.take().unwrap_or_default()))
                } else {
                    Err(LlsdError::InvalidStructure("<llsd> closed with open children"))
                }
            }
            Element::Key => {
                let text = self
                    .key
                    .take()
                    .ok_or(LlsdError::InvalidStructure("mismatched </key>"))?;
                match self.stack.last_mut() {
                    Some(Frame::Map { pending_key, .. }) => {
                        *pending_key = Some(text);
                        Ok(None)
                    }
                    _ => Err(LlsdError::InvalidStructure("<key> outside map")),
                }
            }
            Element::Map => match self.stack.pop() {
                Some(Frame::Map { entries, pending_key: None }) => {
                    self.attach(Value::Map(entries))?;
                    Ok(None)
                }
                Some(Frame::Map { .. }) => {
                    Err(LlsdError::InvalidStructure("map closed with dangling key"))
                }
                _ => Err(LlsdError::InvalidStructure("mismatched </map>")),
            },
            Element::Array => match self.stack.pop() {
                Some(Frame::Array(items)) => {
                    self.attach(Value::Array(items))?;
                    Ok(None)
                }
                _ => Err(LlsdError::InvalidStructure("mismatched </array>")),
            },
            scalar => {
                let (open, text) = self
                    .scalar
                    .take()
                    .ok_or(LlsdError::InvalidStructure("mismatched scalar close"))?;
                if open != scalar {
                    return Err(LlsdError::InvalidStructure("mismatched scalar close"));
                }
                let value = scalar_value(scalar, &text)?;
                self.attach(value)?;
                Ok(None)
            }
        }
    }

    fn expect_value_slot(&self) -> Result<(), LlsdError> {
        match self.stack.last() {
            None => {
                if !self.seen_root {
                    return Err(LlsdError::InvalidStructure("value outside <llsd>"));
                }
                if self.finished.is_some() {
                    return Err(LlsdError::InvalidStructure("multiple root values"));
                }
                Ok(())
            }
            Some(Frame::Map { pending_key, .. }) => {
                if pending_key.is_none() {
                    Err(LlsdError::InvalidStructure("map value without key"))
                } else {
                    Ok(())
                }
            }
            Some(Frame::Array(_)) => Ok(()),
        }
    }

    fn attach(&mut self, value: Value) -> Result<(), LlsdError> {
        match self.stack.last_mut() {
            None => {
                self.finished = Some(value);
                Ok(())
            }
            Some(Frame::Map { entries, pending_key }) => {
                let key = pending_key
                    .take()
                    .ok_or(LlsdError::InvalidStructure("map value without key"))?;
                entries.insert(key, value);
                Ok(())
            }
            Some(Frame::Array(items)) => {
                items.push(value);
                Ok(())
            }
        }
    }
}

fn scalar_value(element: Element, raw: &str) -> Result<Value, LlsdError> {
    // Strings keep their whitespace; every other scalar tolerates
    // pretty-printed padding.
    let text = raw.trim();
    Ok(match element {
        Element::Undef => Value::Undefined,
        Element::Boolean => match text {
            "true" | "1" => Value::Boolean(true),
            "false" | "0" | "" => Value::Boolean(false),
            other => {
                return Err(LlsdError::InvalidScalar { kind: "boolean", value: other.to_owned() });
            }
        },
        Element::Integer => {
            if text.is_empty() {
                Value::Integer(0)
            } else {
                Value::Integer(text.parse().map_err(|_| LlsdError::InvalidScalar {
                    kind: "integer",
                    value: text.to_owned(),
                })?)
            }
        }
        Element::Real => {
            if text.is_empty() {
                Value::Real(0.0)
            } else {
                Value::Real(text.parse().map_err(|_| LlsdError::InvalidScalar {
                    kind: "real",
                    value: text.to_owned(),
                })?)
            }
        }
        Element::Uuid => {
            if text.is_empty() {
                Value::Uuid(Uuid::nil())
            } else {
                Value::Uuid(text.parse().map_err(|_| LlsdError::InvalidScalar {
                    kind: "uuid",
                    value: text.to_owned(),
                })?)
            }
        }
        Element::String | Element::Uri => Value::String(raw.to_owned()),
        Element::Binary => Value::Binary(BASE64.decode(text.as_bytes())?),
        Element::Llsd | Element::Map | Element::Array | Element::Key => {
            return Err(LlsdError::InvalidStructure("container treated as scalar"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        from_xml(&to_xml(value)).expect("round trip parses")
    }

    #[test]
    fn event_queue_request_shape() {
        let request: Value = [("ack", Value::Integer(12)), ("done", Value::Boolean(false))]
            .into_iter()
            .collect();
        let xml = to_xml(&request);
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><llsd><map>\
             <key>ack</key><integer>12</integer>\
             <key>done</key><boolean>false</boolean>\
             </map></llsd>"
        );
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn nested_containers_round_trip() {
        let value: Value = [
            ("id", Value::Integer(5)),
            (
                "events",
                Value::Array(vec![
                    [
                        ("message", Value::from("TeleportFinish")),
                        ("body", Value::Map(BTreeMap::new())),
                    ]
                    .into_iter()
                    .collect(),
                ]),
            ),
        ]
        .into_iter()
        .collect();
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn scalars_round_trip() {
        for value in [
            Value::Undefined,
            Value::Boolean(true),
            Value::Integer(-41),
            Value::Real(2.5),
            Value::Uuid(Uuid::from_u128(7)),
            Value::String("with <angle> & amp".to_owned()),
            Value::Binary(vec![0, 1, 2, 254]),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn uri_parses_as_string() {
        let parsed =
            from_xml("<llsd><uri>http://sim.example/cap</uri></llsd>").expect("parses");
        assert_eq!(parsed.as_str(), Some("http://sim.example/cap"));
    }

    #[test]
    fn empty_scalars_default() {
        let parsed = from_xml(
            "<llsd><array><integer/><string/><boolean/><uuid/></array></llsd>",
        )
        .expect("parses");
        let items = parsed.as_array().expect("array");
        assert_eq!(items[0], Value::Integer(0));
        assert_eq!(items[1], Value::String(String::new()));
        assert_eq!(items[2], Value::Boolean(false));
        assert_eq!(items[3], Value::Uuid(Uuid::nil()));
    }

    #[test]
    fn rejects_key_outside_map() {
        assert!(from_xml("<llsd><key>oops</key></llsd>").is_err());
    }

    #[test]
    fn rejects_unknown_elements() {
        assert!(matches!(
            from_xml("<llsd><date>2024-01-01</date></llsd>"),
            Err(LlsdError::UnexpectedElement(name)) if name == "date"
        ));
    }

    #[test]
    fn rejects_truncated_document() {
        assert!(from_xml("<llsd><map>").is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_string_round_trip(s in "[ -~]*") {
            let value = Value::String(s);
            proptest::prop_assert_eq!(round_trip(&value), value);
        }

        #[test]
        fn prop_integer_round_trip(v in proptest::prelude::any::<i32>()) {
            let value = Value::Integer(v);
            proptest::prop_assert_eq!(round_trip(&value), value);
        }

        #[test]
        fn prop_binary_round_trip(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let value = Value::Binary(bytes);
            proptest::prop_assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn seed_reply_shape() {
        let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<llsd>\n  <map>\n    \
                   <key>EventQueueGet</key>\n    <string>https://sim.example/eq</string>\n  \
                   </map>\n</llsd>";
        let parsed = from_xml(xml).expect("parses");
        assert_eq!(
            parsed.get("EventQueueGet").and_then(Value::as_str),
            Some("https://sim.example/eq")
        );
    }
}
