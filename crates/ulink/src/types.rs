//! Common types for message exchange: commands, attributes and status codes

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, UlError};

/// Bit set on the command field of every response
const RESPONSE_BIT: u16 = 0x8000;

/// Command field identifying the operation a command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandField(pub u16);

impl CommandField {
    /// Store a payload
    pub const STORE_RQ: CommandField = CommandField(0x0001);
    /// Verification echo
    pub const ECHO_RQ: CommandField = CommandField(0x0030);
    /// Event notification (e.g. availability update)
    pub const NOTIFY_RQ: CommandField = CommandField(0x0100);

    /// Whether this field denotes a response
    pub fn is_response(self) -> bool {
        self.0 & RESPONSE_BIT != 0
    }

    /// The response field paired with this request field
    pub fn response(self) -> CommandField {
        CommandField(self.0 | RESPONSE_BIT)
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Attribute tags used in command sets. Group in the upper 16 bits,
/// element in the lower 16.
pub mod tags {
    pub const OFFENDING_ELEMENT: u32 = 0x0000_0901;
    pub const ERROR_COMMENT: u32 = 0x0000_0902;
    pub const AFFECTED_INSTANCE_UID: u32 = 0x0000_1000;
    pub const RETRIEVE_LOCATION: u32 = 0x0008_0054;
    pub const INSTANCE_AVAILABILITY: u32 = 0x0008_0056;
    pub const STUDY_INSTANCE_UID: u32 = 0x0020_000D;
    pub const NUMBER_OF_INSTANCES: u32 = 0x0020_1208;
}

/// Status codes with fixed meaning
pub mod codes {
    pub const SUCCESS: u16 = 0x0000;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const MISSING_ATTRIBUTE: u16 = 0x0120;
    pub const NO_PROVIDER: u16 = 0x0122;
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    pub const PAYLOAD_MISMATCH: u16 = 0xA900;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
}

/// Operation status carried by responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16),
    /// Warning occurred during operation
    Warning(u16),
}

impl Status {
    /// Wire code of this status
    pub fn code(self) -> u16 {
        match self {
            Status::Success => codes::SUCCESS,
            Status::Pending => codes::PENDING,
            Status::Cancel => codes::CANCEL,
            Status::Failure(code) | Status::Warning(code) => code,
        }
    }

    /// Classify a wire code
    pub fn from_code(code: u16) -> Self {
        match code {
            codes::SUCCESS => Status::Success,
            codes::PENDING | 0xFF01 => Status::Pending,
            codes::CANCEL => Status::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Status::Warning(code),
            _ => Status::Failure(code),
        }
    }

    /// Check if the status indicates success (including warnings)
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::Warning(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Pending => write!(f, "pending"),
            Status::Cancel => write!(f, "cancel"),
            Status::Failure(code) => write!(f, "failure 0x{:04X}", code),
            Status::Warning(code) => write!(f, "warning 0x{:04X}", code),
        }
    }
}

/// Value of a single command attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    fn type_code(&self) -> u8 {
        match self {
            AttributeValue::Text(_) => 1,
            AttributeValue::U16(_) => 2,
            AttributeValue::U32(_) => 3,
            AttributeValue::Bytes(_) => 4,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AttributeValue::U16(v) => Some(u32::from(*v)),
            AttributeValue::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        AttributeValue::U16(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::U32(value)
    }
}

/// An application level request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Correlates a response with its request; assigned by the engine for requests
    pub exchange_id: u16,
    /// Capability this command pertains to; filled in by the engine on send
    pub capability: String,
    pub field: CommandField,
    /// Present on responses only
    pub status: Option<Status>,
    pub attributes: BTreeMap<u32, AttributeValue>,
    /// Declared length of the payload travelling with this command
    pub payload_length: Option<u64>,
}

impl Command {
    /// A request command with no attributes yet
    pub fn request(field: CommandField) -> Self {
        Self {
            exchange_id: 0,
            capability: String::new(),
            field,
            status: None,
            attributes: BTreeMap::new(),
            payload_length: None,
        }
    }

    /// A response command answering `request`
    pub fn response_to(request: &Command, status: Status) -> Self {
        Self {
            exchange_id: request.exchange_id,
            capability: request.capability.clone(),
            field: request.field.response(),
            status: Some(status),
            attributes: BTreeMap::new(),
            payload_length: None,
        }
    }

    pub fn with_attribute(mut self, tag: u32, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(tag, value.into());
        self
    }

    pub fn attribute(&self, tag: u32) -> Option<&AttributeValue> {
        self.attributes.get(&tag)
    }

    pub fn text(&self, tag: u32) -> Option<&str> {
        self.attribute(tag).and_then(AttributeValue::as_text)
    }

    pub fn is_response(&self) -> bool {
        self.field.is_response()
    }

    /// Serialize the command set
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_u16(self.exchange_id);
        dst.put_u16(self.field.0);
        match self.status {
            Some(status) => {
                dst.put_u8(1);
                dst.put_u16(status.code());
            }
            None => dst.put_u8(0),
        }
        let capability = u16::try_from(self.capability.len())
            .map_err(|_| UlError::protocol("capability identifier too long"))?;
        dst.put_u16(capability);
        dst.extend_from_slice(self.capability.as_bytes());
        match self.payload_length {
            Some(len) => {
                dst.put_u8(1);
                dst.put_u64(len);
            }
            None => dst.put_u8(0),
        }
        let count = u16::try_from(self.attributes.len())
            .map_err(|_| UlError::protocol("too many attributes"))?;
        dst.put_u16(count);
        for (tag, value) in &self.attributes {
            dst.put_u32(*tag);
            dst.put_u8(value.type_code());
            match value {
                AttributeValue::Text(s) => put_value(&mut dst, s.as_bytes())?,
                AttributeValue::U16(v) => put_value(&mut dst, &v.to_be_bytes())?,
                AttributeValue::U32(v) => put_value(&mut dst, &v.to_be_bytes())?,
                AttributeValue::Bytes(b) => put_value(&mut dst, b)?,
            }
        }
        Ok(dst.freeze())
    }

    /// Parse a reassembled command set
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let exchange_id = get_u16(&mut src)?;
        let field = CommandField(get_u16(&mut src)?);
        let status = match get_u8(&mut src)? {
            0 => None,
            1 => Some(Status::from_code(get_u16(&mut src)?)),
            other => return Err(malformed(format!("status marker {}", other))),
        };
        let capability_len = get_u16(&mut src)? as usize;
        let capability = String::from_utf8(take(&mut src, capability_len)?.to_vec())
            .map_err(|_| malformed("capability is not valid UTF-8"))?;
        let payload_length = match get_u8(&mut src)? {
            0 => None,
            1 => {
                need(&src, 8)?;
                Some(src.get_u64())
            }
            other => return Err(malformed(format!("payload marker {}", other))),
        };
        let count = get_u16(&mut src)?;
        let mut attributes = BTreeMap::new();
        for _ in 0..count {
            need(&src, 9)?;
            let tag = src.get_u32();
            let type_code = src.get_u8();
            let len = src.get_u32() as usize;
            let raw = take(&mut src, len)?;
            let value = match (type_code, len) {
                (1, _) => AttributeValue::Text(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| malformed(format!("attribute {:08X} is not UTF-8", tag)))?,
                ),
                (2, 2) => AttributeValue::U16(u16::from_be_bytes([raw[0], raw[1]])),
                (3, 4) => AttributeValue::U32(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
                (4, _) => AttributeValue::Bytes(raw.to_vec()),
                _ => {
                    return Err(malformed(format!(
                        "attribute {:08X} has type {} with length {}",
                        tag, type_code, len
                    )))
                }
            };
            if attributes.insert(tag, value).is_some() {
                return Err(malformed(format!("duplicate attribute {:08X}", tag)));
            }
        }
        if src.has_remaining() {
            return Err(malformed(format!("{} trailing bytes", src.remaining())));
        }
        Ok(Self {
            exchange_id,
            capability,
            field,
            status,
            attributes,
            payload_length,
        })
    }
}

/// A command together with its optional bulk payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub payload: Option<Bytes>,
}

impl Message {
    pub fn new(command: Command, payload: Option<Bytes>) -> Self {
        Self { command, payload }
    }

    pub fn status(&self) -> Option<Status> {
        self.command.status
    }
}

fn put_value(dst: &mut BytesMut, raw: &[u8]) -> Result<()> {
    let len =
        u32::try_from(raw.len()).map_err(|_| UlError::protocol("attribute value too long"))?;
    dst.put_u32(len);
    dst.extend_from_slice(raw);
    Ok(())
}

fn malformed(detail: impl Into<String>) -> UlError {
    UlError::protocol(format!("malformed command set: {}", detail.into()))
}

fn need(src: &Bytes, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(malformed("truncated"));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn take(src: &mut Bytes, n: usize) -> Result<Bytes> {
    need(src, n)?;
    Ok(src.split_to(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let mut command = Command::request(CommandField::NOTIFY_RQ)
            .with_attribute(tags::STUDY_INSTANCE_UID, "1.2.3.4")
            .with_attribute(tags::NUMBER_OF_INSTANCES, 12u32)
            .with_attribute(tags::ERROR_COMMENT, AttributeValue::Bytes(vec![0, 1, 2]));
        command.exchange_id = 41;
        command.capability = "NOTIFY".to_string();
        command.payload_length = Some(1024);

        let decoded = Command::decode(command.encode().unwrap()).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_response_pairing() {
        let mut request = Command::request(CommandField::ECHO_RQ);
        request.exchange_id = 9;
        request.capability = "VERIFY".to_string();

        let response = Command::response_to(&request, Status::Success);
        assert!(response.is_response());
        assert!(!request.is_response());
        assert_eq!(response.exchange_id, 9);
        assert_eq!(response.field, CommandField(0x8030));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from_code(0x0000), Status::Success);
        assert_eq!(Status::from_code(0xFF00), Status::Pending);
        assert_eq!(Status::from_code(0x0122), Status::Failure(0x0122));
        assert_eq!(Status::from_code(0xB000), Status::Warning(0xB000));
        assert!(Status::Warning(0xB000).is_success());
        assert!(!Status::Failure(codes::PROCESSING_FAILURE).is_success());
        assert_eq!(Status::Failure(0xA700).code(), 0xA700);
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        let command = Command::request(CommandField::STORE_RQ);
        let wire = command.encode().unwrap();

        assert!(Command::decode(wire.slice(..wire.len() - 1)).is_err());

        let mut extended = BytesMut::from(&wire[..]);
        extended.put_u8(0);
        assert!(Command::decode(extended.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_mistyped_numeric_attribute() {
        let mut raw = BytesMut::new();
        raw.put_u16(1);
        raw.put_u16(CommandField::ECHO_RQ.0);
        raw.put_u8(0);
        raw.put_u16(0);
        raw.put_u8(0);
        raw.put_u16(1);
        raw.put_u32(tags::NUMBER_OF_INSTANCES);
        raw.put_u8(3);
        raw.put_u32(2);
        raw.put_slice(&[0, 1]);
        assert!(Command::decode(raw.freeze()).is_err());
    }
}
