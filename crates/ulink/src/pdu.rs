//! Protocol data units and their wire codec
//!
//! Every PDU starts with a one byte type tag followed by a four byte
//! big-endian length of the remaining body:
//!
//! ```text
//! +------+----------------+---------------------------+
//! | tag  | body length    | body (length bytes)       |
//! | 1 B  | 4 B, BE        |                           |
//! +------+----------------+---------------------------+
//! ```
//!
//! Decoding is resumable: [`decode_next`] leaves the buffer untouched until
//! a whole PDU is available, so the caller simply appends more bytes and
//! calls again. [`PduCodec`] wraps the same logic for `FramedRead` and
//! `FramedWrite`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed header (type tag + body length)
pub const HEADER_LEN: usize = 5;

/// Size of the data PDU sub-header (exchange id, context id, control byte)
pub const DATA_HEADER_LEN: usize = 4;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u16 = 1;

/// Lower bound applied to the decode limit, so negotiation PDUs up to this
/// size fit even when the data fragment limit is smaller. Larger ones are
/// refused as oversized.
pub const MIN_BODY_LIMIT: usize = 64 * 1024;

const TAG_ASSOCIATE_RQ: u8 = 0x01;
const TAG_ASSOCIATE_AC: u8 = 0x02;
const TAG_ASSOCIATE_RJ: u8 = 0x03;
const TAG_DATA: u8 = 0x04;
const TAG_RELEASE_RQ: u8 = 0x05;
const TAG_RELEASE_RP: u8 = 0x06;
const TAG_ABORT: u8 = 0x07;

const CONTROL_COMMAND: u8 = 0x01;
const CONTROL_LAST: u8 = 0x02;

/// Errors raised while framing PDUs. Any of these means the stream is corrupt.
#[derive(Debug, Error)]
pub enum PduError {
    #[error("PDU body of {len} bytes exceeds the maximum of {max}")]
    Oversized { len: usize, max: usize },

    #[error("Unknown PDU type 0x{0:02X}")]
    UnknownType(u8),

    #[error("Malformed {pdu} PDU: {detail}")]
    Malformed { pdu: &'static str, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PduError {
    fn malformed(pdu: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            pdu,
            detail: detail.into(),
        }
    }

    /// The abort reason to report to the peer for this framing fault
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            PduError::UnknownType(_) => AbortReason::UnrecognizedPdu,
            PduError::Oversized { .. } | PduError::Malformed { .. } => {
                AbortReason::InvalidParameterValue
            }
            PduError::Io(_) => AbortReason::NotSpecified,
        }
    }
}

/// Declares a byte-coded enum with `code()` and `from_code()`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $text:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )*
        }

        impl $name {
            /// Wire value of this variant
            pub fn code(self) -> u8 {
                match self {
                    $( $name::$variant => $code, )*
                }
            }

            /// Parse a wire value
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )*
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( $name::$variant => write!(f, $text), )*
                }
            }
        }
    };
}

wire_enum! {
    /// Per-context negotiation result carried in the accept PDU
    pub enum ContextOutcome {
        Acceptance = 0 => "acceptance",
        UserRejection = 1 => "user rejection",
        NoReason = 2 => "no reason",
        CapabilityNotSupported = 3 => "capability not supported",
        EncodingsNotSupported = 4 => "transfer encodings not supported",
    }
}

wire_enum! {
    /// Whether a rejection may succeed if retried later
    pub enum RejectResult {
        Permanent = 1 => "permanent",
        Transient = 2 => "transient",
    }
}

wire_enum! {
    /// Which layer produced a rejection
    pub enum RejectSource {
        ServiceUser = 1 => "service user",
        ServiceProvider = 2 => "service provider",
    }
}

wire_enum! {
    /// Enumerable reasons for rejecting an association
    pub enum RejectReason {
        NoReasonGiven = 1 => "no reason given",
        ProtocolVersionNotSupported = 2 => "protocol version not supported",
        CallingEntityNotRecognized = 3 => "calling entity not recognized",
        CalledEntityNotRecognized = 7 => "called entity not recognized",
        NoAcceptableCapability = 8 => "no acceptable capability",
        MandatoryCapabilityUnmet = 9 => "mandatory capability unmet",
        TemporaryCongestion = 10 => "temporary congestion",
        LocalLimitExceeded = 11 => "local limit exceeded",
    }
}

impl RejectReason {
    /// Whether the rejection is expected to clear by itself
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            RejectReason::TemporaryCongestion | RejectReason::LocalLimitExceeded
        )
    }
}

wire_enum! {
    /// Who initiated an abort on the wire
    pub enum AbortSource {
        ServiceUser = 0 => "service user",
        ServiceProvider = 2 => "service provider",
    }
}

wire_enum! {
    /// Diagnostic carried in an abort PDU
    pub enum AbortReason {
        NotSpecified = 0 => "reason not specified",
        UnrecognizedPdu = 1 => "unrecognized PDU",
        UnexpectedPdu = 2 => "unexpected PDU",
        UnrecognizedParameter = 4 => "unrecognized PDU parameter",
        UnexpectedParameter = 5 => "unexpected PDU parameter",
        InvalidParameterValue = 6 => "invalid PDU parameter value",
    }
}

/// A capability proposed by the requesting side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
    /// Context identifier, unique within one proposal
    pub id: u8,
    /// Abstract capability identifier
    pub capability: String,
    /// Acceptable transfer encodings, most preferred first
    pub encodings: Vec<String>,
    /// Opaque extended negotiation blob
    pub extended: Option<Bytes>,
}

impl ProposedContext {
    pub fn new(id: u8, capability: impl Into<String>, encodings: Vec<String>) -> Self {
        Self {
            id,
            capability: capability.into(),
            encodings,
            extended: None,
        }
    }

    pub fn with_extended(mut self, blob: impl Into<Bytes>) -> Self {
        self.extended = Some(blob.into());
        self
    }
}

/// The acceptor's answer for one proposed context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextResult {
    pub id: u8,
    pub outcome: ContextOutcome,
    pub capability: String,
    /// Chosen encoding, present only on acceptance
    pub encoding: Option<String>,
    pub extended: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub protocol_version: u16,
    pub calling_entity: String,
    pub called_entity: String,
    /// Largest data fragment the requester is willing to receive
    pub max_pdu_length: u32,
    pub contexts: Vec<ProposedContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub protocol_version: u16,
    pub calling_entity: String,
    pub called_entity: String,
    /// Largest data fragment the acceptor is willing to receive
    pub max_pdu_length: u32,
    pub results: Vec<ContextResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    pub result: RejectResult,
    pub source: RejectSource,
    pub reason: RejectReason,
}

impl AssociateRj {
    /// Build a reject PDU with result and source derived from the reason
    pub fn for_reason(reason: RejectReason) -> Self {
        let result = if reason.is_transient() {
            RejectResult::Transient
        } else {
            RejectResult::Permanent
        };
        let source = match reason {
            RejectReason::ProtocolVersionNotSupported
            | RejectReason::TemporaryCongestion
            | RejectReason::LocalLimitExceeded => RejectSource::ServiceProvider,
            _ => RejectSource::ServiceUser,
        };
        Self {
            result,
            source,
            reason,
        }
    }
}

/// Which part of a message a data fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Command,
    Payload,
}

/// One fragment of a command or payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPdu {
    pub exchange_id: u16,
    pub context_id: u8,
    pub kind: FragmentKind,
    /// Marks the final fragment of this part of the message
    pub last: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
    pub source: AbortSource,
    pub reason: AbortReason,
}

/// The closed set of protocol data units
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    Data(DataPdu),
    ReleaseRq,
    ReleaseRp,
    Abort(AbortPdu),
}

impl Pdu {
    pub fn type_tag(&self) -> u8 {
        match self {
            Pdu::AssociateRq(_) => TAG_ASSOCIATE_RQ,
            Pdu::AssociateAc(_) => TAG_ASSOCIATE_AC,
            Pdu::AssociateRj(_) => TAG_ASSOCIATE_RJ,
            Pdu::Data(_) => TAG_DATA,
            Pdu::ReleaseRq => TAG_RELEASE_RQ,
            Pdu::ReleaseRp => TAG_RELEASE_RP,
            Pdu::Abort(_) => TAG_ABORT,
        }
    }

    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        tag_name(self.type_tag())
    }
}

fn tag_name(tag: u8) -> &'static str {
    match tag {
        TAG_ASSOCIATE_RQ => "A-ASSOCIATE-RQ",
        TAG_ASSOCIATE_AC => "A-ASSOCIATE-AC",
        TAG_ASSOCIATE_RJ => "A-ASSOCIATE-RJ",
        TAG_DATA => "P-DATA",
        TAG_RELEASE_RQ => "A-RELEASE-RQ",
        TAG_RELEASE_RP => "A-RELEASE-RP",
        TAG_ABORT => "A-ABORT",
        _ => "UNKNOWN",
    }
}

/// Try to decode one PDU from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(pdu))` once a
/// complete PDU was consumed, and `Err(_)` when the stream is corrupt. A
/// header announcing a body larger than `max_body_len` is rejected before
/// any buffer space is reserved for it.
pub fn decode_next(buf: &mut BytesMut, max_body_len: usize) -> Result<Option<Pdu>, PduError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let tag = buf[0];
    if tag_name(tag) == "UNKNOWN" {
        return Err(PduError::UnknownType(tag));
    }

    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > max_body_len {
        return Err(PduError::Oversized {
            len,
            max: max_body_len,
        });
    }

    let total = HEADER_LEN + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(len).freeze();
    parse_body(tag, body).map(Some)
}

/// Append the wire form of `pdu` to `dst`
pub fn encode(pdu: &Pdu, dst: &mut BytesMut) -> Result<(), PduError> {
    let start = dst.len();
    let name = pdu.name();
    dst.put_u8(pdu.type_tag());
    dst.put_u32(0);

    match pdu {
        Pdu::AssociateRq(rq) => {
            dst.put_u16(rq.protocol_version);
            put_str(dst, name, &rq.calling_entity)?;
            put_str(dst, name, &rq.called_entity)?;
            dst.put_u32(rq.max_pdu_length);
            put_count(dst, name, rq.contexts.len())?;
            for ctx in &rq.contexts {
                dst.put_u8(ctx.id);
                put_str(dst, name, &ctx.capability)?;
                put_count(dst, name, ctx.encodings.len())?;
                for encoding in &ctx.encodings {
                    put_str(dst, name, encoding)?;
                }
                put_blob(dst, name, ctx.extended.as_ref())?;
            }
        }
        Pdu::AssociateAc(ac) => {
            dst.put_u16(ac.protocol_version);
            put_str(dst, name, &ac.calling_entity)?;
            put_str(dst, name, &ac.called_entity)?;
            dst.put_u32(ac.max_pdu_length);
            put_count(dst, name, ac.results.len())?;
            for result in &ac.results {
                dst.put_u8(result.id);
                dst.put_u8(result.outcome.code());
                put_str(dst, name, &result.capability)?;
                put_opt_str(dst, name, result.encoding.as_deref())?;
                put_blob(dst, name, result.extended.as_ref())?;
            }
        }
        Pdu::AssociateRj(rj) => {
            dst.put_u8(rj.result.code());
            dst.put_u8(rj.source.code());
            dst.put_u8(rj.reason.code());
        }
        Pdu::Data(data) => {
            dst.put_u16(data.exchange_id);
            dst.put_u8(data.context_id);
            let mut control = 0u8;
            if data.kind == FragmentKind::Command {
                control |= CONTROL_COMMAND;
            }
            if data.last {
                control |= CONTROL_LAST;
            }
            dst.put_u8(control);
            dst.extend_from_slice(&data.data);
        }
        Pdu::ReleaseRq | Pdu::ReleaseRp => {
            dst.put_u32(0);
        }
        Pdu::Abort(abort) => {
            dst.put_u8(abort.source.code());
            dst.put_u8(abort.reason.code());
        }
    }

    let body_len = dst.len() - start - HEADER_LEN;
    let body_len = u32::try_from(body_len)
        .map_err(|_| PduError::malformed(name, format!("body of {} bytes", body_len)))?;
    dst[start + 1..start + HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

/// Encode a single PDU into a fresh buffer
pub fn to_bytes(pdu: &Pdu) -> Result<Bytes, PduError> {
    let mut dst = BytesMut::new();
    encode(pdu, &mut dst)?;
    Ok(dst.freeze())
}

fn put_str(dst: &mut BytesMut, pdu: &'static str, value: &str) -> Result<(), PduError> {
    let len = u16::try_from(value.len())
        .map_err(|_| PduError::malformed(pdu, "string longer than 65535 bytes"))?;
    dst.put_u16(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_opt_str(dst: &mut BytesMut, pdu: &'static str, value: Option<&str>) -> Result<(), PduError> {
    match value {
        None => dst.put_u8(0),
        Some(value) => {
            dst.put_u8(1);
            put_str(dst, pdu, value)?;
        }
    }
    Ok(())
}

fn put_count(dst: &mut BytesMut, pdu: &'static str, count: usize) -> Result<(), PduError> {
    let count =
        u16::try_from(count).map_err(|_| PduError::malformed(pdu, "more than 65535 items"))?;
    dst.put_u16(count);
    Ok(())
}

fn put_blob(dst: &mut BytesMut, pdu: &'static str, blob: Option<&Bytes>) -> Result<(), PduError> {
    match blob {
        None => dst.put_u8(0),
        Some(blob) => {
            let len = u16::try_from(blob.len())
                .map_err(|_| PduError::malformed(pdu, "extended blob longer than 65535 bytes"))?;
            dst.put_u8(1);
            dst.put_u16(len);
            dst.extend_from_slice(blob);
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a PDU body
struct BodyReader {
    pdu: &'static str,
    body: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize) -> Result<(), PduError> {
        if self.body.remaining() < n {
            return Err(PduError::malformed(
                self.pdu,
                format!("truncated: needed {} more bytes", n - self.body.remaining()),
            ));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, PduError> {
        self.need(1)?;
        Ok(self.body.get_u8())
    }

    fn u16(&mut self) -> Result<u16, PduError> {
        self.need(2)?;
        Ok(self.body.get_u16())
    }

    fn u32(&mut self) -> Result<u32, PduError> {
        self.need(4)?;
        Ok(self.body.get_u32())
    }

    fn take(&mut self, n: usize) -> Result<Bytes, PduError> {
        self.need(n)?;
        Ok(self.body.split_to(n))
    }

    fn string(&mut self) -> Result<String, PduError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| PduError::malformed(self.pdu, "string is not valid UTF-8"))
    }

    fn opt_string(&mut self) -> Result<Option<String>, PduError> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string().map(Some),
            other => Err(PduError::malformed(
                self.pdu,
                format!("invalid string presence marker {}", other),
            )),
        }
    }

    fn blob(&mut self) -> Result<Option<Bytes>, PduError> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let len = self.u16()? as usize;
                Ok(Some(self.take(len)?))
            }
            other => Err(PduError::malformed(
                self.pdu,
                format!("invalid blob presence marker {}", other),
            )),
        }
    }

    fn enumerated<T>(&mut self, what: &str, parse: fn(u8) -> Option<T>) -> Result<T, PduError> {
        let code = self.u8()?;
        parse(code).ok_or_else(|| PduError::malformed(self.pdu, format!("unknown {} {}", what, code)))
    }

    fn rest(&mut self) -> Bytes {
        self.body.split_off(0)
    }

    fn finish(self) -> Result<(), PduError> {
        if self.body.has_remaining() {
            return Err(PduError::malformed(
                self.pdu,
                format!("{} trailing bytes", self.body.remaining()),
            ));
        }
        Ok(())
    }
}

fn parse_body(tag: u8, body: Bytes) -> Result<Pdu, PduError> {
    let mut r = BodyReader {
        pdu: tag_name(tag),
        body,
    };

    let pdu = match tag {
        TAG_ASSOCIATE_RQ => {
            let protocol_version = r.u16()?;
            let calling_entity = r.string()?;
            let called_entity = r.string()?;
            let max_pdu_length = r.u32()?;
            let count = r.u16()? as usize;
            let mut contexts = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let id = r.u8()?;
                let capability = r.string()?;
                let n = r.u16()? as usize;
                let mut encodings = Vec::with_capacity(n.min(64));
                for _ in 0..n {
                    encodings.push(r.string()?);
                }
                let extended = r.blob()?;
                contexts.push(ProposedContext {
                    id,
                    capability,
                    encodings,
                    extended,
                });
            }
            Pdu::AssociateRq(AssociateRq {
                protocol_version,
                calling_entity,
                called_entity,
                max_pdu_length,
                contexts,
            })
        }
        TAG_ASSOCIATE_AC => {
            let protocol_version = r.u16()?;
            let calling_entity = r.string()?;
            let called_entity = r.string()?;
            let max_pdu_length = r.u32()?;
            let count = r.u16()? as usize;
            let mut results = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let id = r.u8()?;
                let outcome = r.enumerated("context outcome", ContextOutcome::from_code)?;
                let capability = r.string()?;
                let encoding = r.opt_string()?;
                let extended = r.blob()?;
                results.push(ContextResult {
                    id,
                    outcome,
                    capability,
                    encoding,
                    extended,
                });
            }
            Pdu::AssociateAc(AssociateAc {
                protocol_version,
                calling_entity,
                called_entity,
                max_pdu_length,
                results,
            })
        }
        TAG_ASSOCIATE_RJ => Pdu::AssociateRj(AssociateRj {
            result: r.enumerated("reject result", RejectResult::from_code)?,
            source: r.enumerated("reject source", RejectSource::from_code)?,
            reason: r.enumerated("reject reason", RejectReason::from_code)?,
        }),
        TAG_DATA => {
            let exchange_id = r.u16()?;
            let context_id = r.u8()?;
            let control = r.u8()?;
            if control & !(CONTROL_COMMAND | CONTROL_LAST) != 0 {
                return Err(PduError::malformed(
                    r.pdu,
                    format!("reserved control bits set: 0x{:02X}", control),
                ));
            }
            let kind = if control & CONTROL_COMMAND != 0 {
                FragmentKind::Command
            } else {
                FragmentKind::Payload
            };
            Pdu::Data(DataPdu {
                exchange_id,
                context_id,
                kind,
                last: control & CONTROL_LAST != 0,
                data: r.rest(),
            })
        }
        TAG_RELEASE_RQ | TAG_RELEASE_RP => {
            r.u32()?;
            if tag == TAG_RELEASE_RQ {
                Pdu::ReleaseRq
            } else {
                Pdu::ReleaseRp
            }
        }
        TAG_ABORT => Pdu::Abort(AbortPdu {
            source: r.enumerated("abort source", AbortSource::from_code)?,
            reason: r.enumerated("abort reason", AbortReason::from_code)?,
        }),
        other => return Err(PduError::UnknownType(other)),
    };

    r.finish()?;
    Ok(pdu)
}

/// `tokio_util` codec adapter around [`decode_next`] and [`encode`]
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_body_len: usize,
}

impl PduCodec {
    /// Codec refusing bodies larger than `max_body_len`
    pub fn new(max_body_len: usize) -> Self {
        Self { max_body_len }
    }

    /// Codec sized for data fragments of at most `max_pdu_length` bytes
    pub fn for_pdu_length(max_pdu_length: u32) -> Self {
        let data_limit = max_pdu_length as usize + DATA_HEADER_LEN;
        Self::new(data_limit.max(MIN_BODY_LIMIT))
    }

    pub fn max_body_len(&self) -> usize {
        self.max_body_len
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = PduError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>, PduError> {
        decode_next(src, self.max_body_len)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = PduError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<(), PduError> {
        encode(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rq() -> Pdu {
        Pdu::AssociateRq(AssociateRq {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: "MODALITY".to_string(),
            called_entity: "ARCHIVE".to_string(),
            max_pdu_length: 16384,
            contexts: vec![
                ProposedContext::new(1, "STORE", vec!["RAW".into(), "COMPRESSED".into()]),
                ProposedContext::new(3, "NOTIFY", vec!["RAW".into()]).with_extended(vec![1, 0]),
            ],
        })
    }

    fn all_variants() -> Vec<Pdu> {
        vec![
            sample_rq(),
            Pdu::AssociateAc(AssociateAc {
                protocol_version: PROTOCOL_VERSION,
                calling_entity: "MODALITY".to_string(),
                called_entity: "ARCHIVE".to_string(),
                max_pdu_length: 32768,
                results: vec![
                    ContextResult {
                        id: 1,
                        outcome: ContextOutcome::Acceptance,
                        capability: "STORE".to_string(),
                        encoding: Some("RAW".to_string()),
                        extended: None,
                    },
                    ContextResult {
                        id: 3,
                        outcome: ContextOutcome::CapabilityNotSupported,
                        capability: "NOTIFY".to_string(),
                        encoding: None,
                        extended: Some(Bytes::from_static(b"\x01")),
                    },
                ],
            }),
            Pdu::AssociateRj(AssociateRj::for_reason(RejectReason::NoAcceptableCapability)),
            Pdu::Data(DataPdu {
                exchange_id: 7,
                context_id: 1,
                kind: FragmentKind::Payload,
                last: true,
                data: Bytes::from_static(b"pixels"),
            }),
            Pdu::ReleaseRq,
            Pdu::ReleaseRp,
            Pdu::Abort(AbortPdu {
                source: AbortSource::ServiceProvider,
                reason: AbortReason::UnexpectedPdu,
            }),
        ]
    }

    #[test]
    fn test_every_variant_round_trips() {
        for pdu in all_variants() {
            let mut buf = BytesMut::from(&to_bytes(&pdu).unwrap()[..]);
            let decoded = decode_next(&mut buf, MIN_BODY_LIMIT).unwrap();
            assert_eq!(decoded, Some(pdu));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_empty_encoding_is_distinct_from_absent() {
        let results = [Some(String::new()), None, Some("RAW".to_string())]
            .into_iter()
            .enumerate()
            .map(|(i, encoding)| ContextResult {
                id: (i * 2 + 1) as u8,
                outcome: ContextOutcome::Acceptance,
                capability: "STORE".to_string(),
                encoding,
                extended: None,
            })
            .collect();
        let pdu = Pdu::AssociateAc(AssociateAc {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: "MODALITY".to_string(),
            called_entity: "ARCHIVE".to_string(),
            max_pdu_length: 16384,
            results,
        });
        let mut buf = BytesMut::from(&to_bytes(&pdu).unwrap()[..]);
        assert_eq!(decode_next(&mut buf, MIN_BODY_LIMIT).unwrap(), Some(pdu));
    }

    #[test]
    fn test_decode_resumes_across_partial_reads() {
        let wire = to_bytes(&sample_rq()).unwrap();
        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decode_next(&mut buf, MIN_BODY_LIMIT).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                assert_eq!(result, Some(sample_rq()));
            }
        }
    }

    #[test]
    fn test_two_pdus_in_one_read() {
        let mut buf = BytesMut::new();
        encode(&Pdu::ReleaseRq, &mut buf).unwrap();
        encode(&Pdu::ReleaseRp, &mut buf).unwrap();
        assert_eq!(decode_next(&mut buf, 1024).unwrap(), Some(Pdu::ReleaseRq));
        assert_eq!(decode_next(&mut buf, 1024).unwrap(), Some(Pdu::ReleaseRp));
        assert_eq!(decode_next(&mut buf, 1024).unwrap(), None);
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let mut buf = BytesMut::from(&[0x42u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_next(&mut buf, 1024),
            Err(PduError::UnknownType(0x42))
        ));

        // Detected from the first byte, before the length arrives
        let mut buf = BytesMut::from(&[0x09u8][..]);
        assert!(decode_next(&mut buf, 1024).is_err());
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut buf = BytesMut::from(&[TAG_DATA, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        let capacity_before = buf.capacity();
        match decode_next(&mut buf, 16 * 1024) {
            Err(PduError::Oversized { len, max }) => {
                assert_eq!(len, u32::MAX as usize);
                assert_eq!(max, 16 * 1024);
            }
            other => panic!("expected oversized error, got {:?}", other),
        }
        assert_eq!(buf.capacity(), capacity_before);
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ABORT);
        buf.put_u32(3);
        buf.put_slice(&[0, 0, 9]);
        assert!(matches!(
            decode_next(&mut buf, 1024),
            Err(PduError::Malformed { .. })
        ));
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ASSOCIATE_RJ);
        buf.put_u32(2);
        buf.put_slice(&[1, 1]);
        assert!(matches!(
            decode_next(&mut buf, 1024),
            Err(PduError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_enumerated_value_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ABORT);
        buf.put_u32(2);
        buf.put_slice(&[0, 3]);
        let err = decode_next(&mut buf, 1024).unwrap_err();
        assert_eq!(err.abort_reason(), AbortReason::InvalidParameterValue);
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ASSOCIATE_RQ);
        let body: &[u8] = &[0, 1, 0, 2, 0xC3, 0x28];
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        assert!(decode_next(&mut buf, 1024).is_err());
    }

    #[test]
    fn test_codec_limit_never_below_negotiation_floor() {
        assert_eq!(PduCodec::for_pdu_length(4096).max_body_len(), MIN_BODY_LIMIT);
        assert_eq!(
            PduCodec::for_pdu_length(1 << 20).max_body_len(),
            (1 << 20) + DATA_HEADER_LEN
        );
    }

    #[test]
    fn test_proposal_beyond_the_floor_is_oversized() {
        let encodings: Vec<String> = (0..4000).map(|i| format!("1.2.840.10008.1.2.{}", i)).collect();
        let pdu = Pdu::AssociateRq(AssociateRq {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: "MODALITY".to_string(),
            called_entity: "ARCHIVE".to_string(),
            max_pdu_length: 4096,
            contexts: vec![ProposedContext::new(1, "STORE", encodings)],
        });
        let wire = to_bytes(&pdu).unwrap();
        assert!(wire.len() > HEADER_LEN + MIN_BODY_LIMIT);

        let mut codec = PduCodec::for_pdu_length(4096);
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PduError::Oversized { max: MIN_BODY_LIMIT, .. })
        ));
    }

    #[test]
    fn test_reject_for_reason_derives_result() {
        let rj = AssociateRj::for_reason(RejectReason::LocalLimitExceeded);
        assert_eq!(rj.result, RejectResult::Transient);
        assert_eq!(rj.source, RejectSource::ServiceProvider);

        let rj = AssociateRj::for_reason(RejectReason::CalledEntityNotRecognized);
        assert_eq!(rj.result, RejectResult::Permanent);
        assert_eq!(rj.source, RejectSource::ServiceUser);
    }
}
