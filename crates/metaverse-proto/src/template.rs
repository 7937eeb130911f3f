//! Message template schema.
//!
//! The template is a textual description of every message the protocol can
//! carry: name, frequency class, numeric id, trust and encoding attributes,
//! and the nested block/field layout. It is the single source of truth for
//! wire encoding. Parsed once at startup into an immutable structure and
//! shared read-only by every circuit.
//!
//! The grammar is the viewer's own `message_template.msg` format: a
//! `version` line, then one brace-delimited entry per message, with `//`
//! line comments:
//!
//! ```text
//! {
//!     UseCircuitCode Low 3 NotTrusted Unencoded
//!     {
//!         CircuitCode Single
//!         {   Code        U32    }
//!         {   SessionID   LLUUID }
//!         {   ID          LLUUID }
//!     }
//! }
//! ```

use std::{collections::HashMap, fmt, sync::Arc, sync::OnceLock};

use crate::{
    errors::{MessageError, TemplateError},
    message::Message,
};

/// The embedded default schema, a subset of the viewer template covering
/// the session-engine messages.
const DEFAULT_TEMPLATE: &str = include_str!("../data/message_template.msg");

/// Opcode encoding bucket. Determines the header form and id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// 1-byte opcode, ids 1..=254.
    High,
    /// `FF id`, ids 1..=254.
    Medium,
    /// `FF FF id_hi id_lo`, big-endian 16-bit id.
    Low,
    /// `FF FF FF xx`; the template stores the full 32-bit value.
    Fixed,
}

impl Frequency {
    /// Keyword used for this class in the schema and in diagnostics.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Fixed => "Fixed",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Whether the simulator accepts this message from untrusted circuits.
///
/// Carried through from the schema for completeness; the client never
/// sends trusted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Only trusted (sim-to-sim) circuits may send it.
    Trusted,
    /// Viewers may send it.
    NotTrusted,
}

/// Whether the body is eligible for zerocoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Body always sent verbatim.
    Unencoded,
    /// Body may be run-length coded (zero bytes collapsed).
    Zerocoded,
}

/// Block repetition class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// Exactly one row, no count on the wire.
    Single,
    /// Exactly `n` rows, no count on the wire.
    Multiple(u8),
    /// 1-byte row count then that many rows.
    Variable,
}

/// Primitive field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer, little-endian.
    U16,
    /// Unsigned 32-bit integer, little-endian.
    U32,
    /// Unsigned 64-bit integer, little-endian.
    U64,
    /// Signed 8-bit integer.
    S8,
    /// Signed 16-bit integer, little-endian.
    S16,
    /// Signed 32-bit integer, little-endian.
    S32,
    /// 32-bit float, little-endian.
    F32,
    /// 64-bit float, little-endian.
    F64,
    /// Three 32-bit floats.
    Vector3,
    /// Four 32-bit floats.
    Vector4,
    /// Four 32-bit floats (rotation).
    Quaternion,
    /// 16 raw bytes.
    Uuid,
    /// Byte string with 1-byte length prefix.
    Variable1,
    /// Byte string with 2-byte little-endian length prefix.
    Variable2,
    /// Exactly `n` raw bytes, no prefix.
    Fixed(usize),
}

impl FieldKind {
    /// Human-readable name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::U16 => "U16",
            Self::U32 => "U32",
            Self::U64 => "U64",
            Self::S8 => "S8",
            Self::S16 => "S16",
            Self::S32 => "S32",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::Vector3 => "LLVector3",
            Self::Vector4 => "LLVector4",
            Self::Quaternion => "LLQuaternion",
            Self::Uuid => "LLUUID",
            Self::Variable1 => "Variable 1",
            Self::Variable2 => "Variable 2",
            Self::Fixed(_) => "Fixed",
        }
    }
}

/// One field within a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name as declared in the schema.
    pub name: String,
    /// Primitive type.
    pub kind: FieldKind,
}

/// One block within a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    /// Block name as declared in the schema.
    pub name: String,
    /// Repetition class.
    pub quota: Quota,
    /// Ordered field layout.
    pub fields: Vec<FieldSpec>,
}

/// The full wire description of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSpec {
    /// Message name.
    pub name: String,
    /// Opcode encoding bucket.
    pub frequency: Frequency,
    /// Numeric id within the frequency class. For [`Frequency::Fixed`]
    /// this is the full 32-bit wire value (`0xFFFFFFxx`).
    pub id: u32,
    /// Trust attribute.
    pub trust: Trust,
    /// Zerocoding eligibility.
    pub encoding: Encoding,
    /// Ordered block layout.
    pub blocks: Vec<BlockSpec>,
}

impl MessageSpec {
    /// Index of a block by name.
    #[must_use]
    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }
}

/// Immutable, frozen mapping of every message the protocol knows.
#[derive(Debug, Default)]
pub struct MessageTemplate {
    by_name: HashMap<String, Arc<MessageSpec>>,
    by_id: HashMap<(Frequency, u32), Arc<MessageSpec>>,
}

impl MessageTemplate {
    /// Parse a schema text into a frozen template.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        Parser::new(text).parse()
    }

    /// The process-wide default template, parsed from the embedded schema
    /// on first use.
    #[must_use]
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<MessageTemplate> = OnceLock::new();
        SHARED.get_or_init(|| {
            // INVARIANT: the embedded schema is validated by unit test;
            // a parse failure here is a build defect, not a runtime input.
            #[allow(clippy::expect_used)]
            Self::parse(DEFAULT_TEMPLATE).expect("embedded message template parses")
        })
    }

    /// Spec lookup by message name.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&Arc<MessageSpec>> {
        self.by_name.get(name)
    }

    /// Spec lookup by decoded opcode.
    #[must_use]
    pub fn spec_by_id(&self, frequency: Frequency, id: u32) -> Option<&Arc<MessageSpec>> {
        self.by_id.get(&(frequency, id))
    }

    /// Construct an empty message instance for `name`, with `Single` and
    /// `Multiple` blocks pre-populated to their quota.
    pub fn message(&self, name: &str) -> Result<Message, MessageError> {
        self.spec(name)
            .cloned()
            .map(Message::new)
            .ok_or_else(|| MessageError::UnknownMessage(name.to_owned()))
    }

    /// Number of messages in the template.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True if the template holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Iterate all message names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    fn insert(&mut self, spec: MessageSpec) -> Result<(), TemplateError> {
        let spec = Arc::new(spec);
        let key = (spec.frequency, spec.id);
        if self.by_name.contains_key(&spec.name) || self.by_id.contains_key(&key) {
            return Err(TemplateError::DuplicateMessage(spec.name.clone()));
        }
        self.by_name.insert(spec.name.clone(), Arc::clone(&spec));
        self.by_id.insert(key, spec);
        Ok(())
    }
}

/// A schema token with the line it came from.
struct Token {
    text: String,
    line: usize,
}

/// Recursive-descent parser over whitespace-separated tokens.
///
/// `{` and `}` are tokens in their own right even when glued to a word.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        let mut tokens = Vec::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw_line.split("//").next().unwrap_or_default();
            for word in content.split_whitespace() {
                let mut rest = word;
                while let Some(brace) = rest.find(['{', '}']) {
                    if brace > 0 {
                        tokens.push(Token { text: rest[..brace].to_owned(), line });
                    }
                    tokens.push(Token { text: rest[brace..=brace].to_owned(), line });
                    rest = &rest[brace + 1..];
                }
                if !rest.is_empty() {
                    tokens.push(Token { text: rest.to_owned(), line });
                }
            }
        }
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token, TemplateError> {
        let token = self.tokens.get(self.pos).ok_or(TemplateError::UnexpectedEof)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, text: &str) -> Result<(), TemplateError> {
        let token = self.next()?;
        if token.text == text {
            Ok(())
        } else {
            Err(TemplateError::UnexpectedToken { line: token.line, token: token.text.clone() })
        }
    }

    fn number(&mut self) -> Result<u32, TemplateError> {
        let token = self.next()?;
        let (text, line) = (token.text.clone(), token.line);
        let parsed = text
            .strip_prefix("0x")
            .map_or_else(|| text.parse::<u32>().ok(), |hex| u32::from_str_radix(hex, 16).ok());
        parsed.ok_or(TemplateError::InvalidNumber { line, value: text })
    }

    fn parse(mut self) -> Result<MessageTemplate, TemplateError> {
        // Optional "version <n>" preamble.
        if self.peek().is_some_and(|t| t.text == "version") {
            self.pos += 1;
            self.next()?;
        }

        let mut template = MessageTemplate::default();
        while self.peek().is_some() {
            self.expect("{")?;
            template.insert(self.message_entry()?)?;
        }
        Ok(template)
    }

    fn message_entry(&mut self) -> Result<MessageSpec, TemplateError> {
        let name = self.next()?.text.clone();
        let freq_token = self.next()?;
        let (freq_text, freq_line) = (freq_token.text.clone(), freq_token.line);
        let frequency = match freq_text.as_str() {
            "High" => Frequency::High,
            "Medium" => Frequency::Medium,
            "Low" => Frequency::Low,
            "Fixed" => Frequency::Fixed,
            _ => {
                return Err(TemplateError::UnexpectedToken { line: freq_line, token: freq_text });
            }
        };

        let id = self.number()?;
        match frequency {
            Frequency::High | Frequency::Medium if !(1..=254).contains(&id) => {
                return Err(TemplateError::IdOutOfRange { frequency: frequency.keyword(), id });
            }
            Frequency::Low if !(1..=0xFFFF).contains(&id) => {
                return Err(TemplateError::IdOutOfRange { frequency: frequency.keyword(), id });
            }
            Frequency::Fixed if id < 0xFFFF_FF00 => {
                return Err(TemplateError::IdOutOfRange { frequency: frequency.keyword(), id });
            }
            _ => {}
        }

        let trust_token = self.next()?;
        let trust = match trust_token.text.as_str() {
            "Trusted" => Trust::Trusted,
            "NotTrusted" => Trust::NotTrusted,
            _ => {
                return Err(TemplateError::UnexpectedToken {
                    line: trust_token.line,
                    token: trust_token.text.clone(),
                });
            }
        };

        let encoding_token = self.next()?;
        let encoding = match encoding_token.text.as_str() {
            "Unencoded" => Encoding::Unencoded,
            "Zerocoded" => Encoding::Zerocoded,
            _ => {
                return Err(TemplateError::UnexpectedToken {
                    line: encoding_token.line,
                    token: encoding_token.text.clone(),
                });
            }
        };

        // Deprecation markers follow the encoding attribute in the
        // upstream template. Accepted and ignored.
        if self
            .peek()
            .is_some_and(|t| matches!(t.text.as_str(), "Deprecated" | "UDPDeprecated" | "UDPBlackListed"))
        {
            self.pos += 1;
        }

        let mut blocks = Vec::new();
        loop {
            let token = self.next()?;
            match token.text.as_str() {
                "}" => break,
                "{" => blocks.push(self.block_entry()?),
                _ => {
                    return Err(TemplateError::UnexpectedToken {
                        line: token.line,
                        token: token.text.clone(),
                    });
                }
            }
        }

        Ok(MessageSpec { name, frequency, id, trust, encoding, blocks })
    }

    fn block_entry(&mut self) -> Result<BlockSpec, TemplateError> {
        let name = self.next()?.text.clone();
        let quota_token = self.next()?;
        let (quota_text, quota_line) = (quota_token.text.clone(), quota_token.line);
        let quota = match quota_text.as_str() {
            "Single" => Quota::Single,
            "Variable" => Quota::Variable,
            "Multiple" => {
                let n = self.number()?;
                if !(1..=255).contains(&n) {
                    return Err(TemplateError::InvalidNumber {
                        line: quota_line,
                        value: n.to_string(),
                    });
                }
                Quota::Multiple(n as u8)
            }
            _ => {
                return Err(TemplateError::UnexpectedToken { line: quota_line, token: quota_text });
            }
        };

        let mut fields = Vec::new();
        loop {
            let token = self.next()?;
            match token.text.as_str() {
                "}" => break,
                "{" => fields.push(self.field_entry()?),
                _ => {
                    return Err(TemplateError::UnexpectedToken {
                        line: token.line,
                        token: token.text.clone(),
                    });
                }
            }
        }

        Ok(BlockSpec { name, quota, fields })
    }

    fn field_entry(&mut self) -> Result<FieldSpec, TemplateError> {
        let name = self.next()?.text.clone();
        let kind_token = self.next()?;
        let (kind_text, kind_line) = (kind_token.text.clone(), kind_token.line);
        let kind = match kind_text.as_str() {
            "U8" => FieldKind::U8,
            "U16" => FieldKind::U16,
            "U32" => FieldKind::U32,
            "U64" => FieldKind::U64,
            "S8" => FieldKind::S8,
            "S16" => FieldKind::S16,
            "S32" => FieldKind::S32,
            "F32" => FieldKind::F32,
            "F64" => FieldKind::F64,
            "LLVector3" => FieldKind::Vector3,
            "LLVector4" => FieldKind::Vector4,
            "LLQuaternion" => FieldKind::Quaternion,
            "LLUUID" => FieldKind::Uuid,
            "Variable" => match self.number()? {
                1 => FieldKind::Variable1,
                2 => FieldKind::Variable2,
                n => {
                    return Err(TemplateError::InvalidNumber {
                        line: kind_line,
                        value: n.to_string(),
                    });
                }
            },
            "Fixed" => FieldKind::Fixed(self.number()? as usize),
            _ => return Err(TemplateError::UnknownFieldType(kind_text)),
        };
        self.expect("}")?;
        Ok(FieldSpec { name, kind })
    }
}
