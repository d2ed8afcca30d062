//! Message exchange over an established association
//!
//! A message travels as one or more command fragments followed, when it
//! carries a payload, by payload fragments. Each part ends with a fragment
//! marked `last`. Fragments of different exchanges never interleave on the
//! wire because every message is written under the association's write lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::association::Association;
use crate::error::{Result, UlError};
use crate::pdu::{DataPdu, FragmentKind};
use crate::types::{codes, tags, Command, Message, Status};

/// Upper bound on buffer space reserved up front for a declared payload
const RESERVE_CAP: u64 = 8 * 1024 * 1024;

/// Bounds on a single message under reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Command plus payload bytes allowed for one message
    pub max_bytes: u64,
    /// Time allowed between the first and the last fragment
    pub timeout: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Split an encoded command set and optional payload into data PDUs of at
/// most `max_fragment` bytes each.
pub fn fragment(
    exchange_id: u16,
    context_id: u8,
    command: Bytes,
    payload: Option<Bytes>,
    max_fragment: usize,
) -> Vec<DataPdu> {
    let max_fragment = max_fragment.max(1);
    let mut pdus = Vec::new();
    split_part(&mut pdus, exchange_id, context_id, FragmentKind::Command, command, max_fragment);
    if let Some(payload) = payload {
        split_part(&mut pdus, exchange_id, context_id, FragmentKind::Payload, payload, max_fragment);
    }
    pdus
}

fn split_part(
    out: &mut Vec<DataPdu>,
    exchange_id: u16,
    context_id: u8,
    kind: FragmentKind,
    data: Bytes,
    max_fragment: usize,
) {
    if data.is_empty() {
        out.push(DataPdu {
            exchange_id,
            context_id,
            kind,
            last: true,
            data,
        });
        return;
    }
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + max_fragment).min(data.len());
        out.push(DataPdu {
            exchange_id,
            context_id,
            kind,
            last: end == data.len(),
            data: data.slice(offset..end),
        });
        offset = end;
    }
}

/// A message rebuilt from its fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub context_id: u8,
    pub message: Message,
}

#[derive(Debug)]
struct Partial {
    exchange_id: u16,
    context_id: u8,
    started: Instant,
    received: u64,
    command_bytes: BytesMut,
    command: Option<Command>,
    payload: BytesMut,
}

/// Rebuilds messages from inbound data PDUs, one exchange at a time
#[derive(Debug)]
pub struct Reassembler {
    limits: ReassemblyLimits,
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            partial: None,
        }
    }

    /// Whether a message is partially received
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Instant by which the message under reassembly must be complete
    pub fn deadline(&self) -> Option<Instant> {
        self.partial
            .as_ref()
            .map(|p| p.started + self.limits.timeout)
    }

    /// Feed one fragment. Returns the message once its final fragment arrived.
    pub fn push(&mut self, pdu: DataPdu) -> Result<Option<Assembled>> {
        let limits = self.limits;
        if self.partial.is_none() {
            self.partial = Some(Partial {
                exchange_id: pdu.exchange_id,
                context_id: pdu.context_id,
                started: Instant::now(),
                received: 0,
                command_bytes: BytesMut::new(),
                command: None,
                payload: BytesMut::new(),
            });
        }
        let Some(partial) = self.partial.as_mut() else {
            return Err(UlError::internal("reassembly state missing"));
        };
        if partial.exchange_id != pdu.exchange_id {
            return Err(UlError::protocol(format!(
                "fragment for exchange {} interleaved with exchange {}",
                pdu.exchange_id, partial.exchange_id
            )));
        }
        if partial.context_id != pdu.context_id {
            return Err(UlError::protocol(format!(
                "exchange {} switched from context {} to {}",
                pdu.exchange_id, partial.context_id, pdu.context_id
            )));
        }

        partial.received += pdu.data.len() as u64;
        if partial.received > limits.max_bytes {
            return Err(UlError::protocol(format!(
                "exchange {} exceeds the reassembly budget of {} bytes",
                pdu.exchange_id, limits.max_bytes
            )));
        }

        match pdu.kind {
            FragmentKind::Command => {
                if partial.command.is_some() {
                    return Err(UlError::protocol(format!(
                        "command fragment after the command of exchange {} completed",
                        pdu.exchange_id
                    )));
                }
                partial.command_bytes.extend_from_slice(&pdu.data);
                if !pdu.last {
                    return Ok(None);
                }
                let command = Command::decode(partial.command_bytes.split().freeze())?;
                if command.exchange_id != partial.exchange_id {
                    return Err(UlError::protocol(format!(
                        "command set names exchange {} but arrived as exchange {}",
                        command.exchange_id, partial.exchange_id
                    )));
                }
                match command.payload_length {
                    None => Ok(self.complete(command, None)),
                    Some(declared) => {
                        if declared > limits.max_bytes {
                            return Err(UlError::protocol(format!(
                                "declared payload of {} bytes exceeds the reassembly budget",
                                declared
                            )));
                        }
                        partial.payload.reserve(declared.min(RESERVE_CAP) as usize);
                        partial.command = Some(command);
                        Ok(None)
                    }
                }
            }
            FragmentKind::Payload => {
                let Some(declared) = partial.command.as_ref().and_then(|c| c.payload_length) else {
                    return Err(UlError::protocol(format!(
                        "payload fragment before the command of exchange {}",
                        pdu.exchange_id
                    )));
                };
                partial.payload.extend_from_slice(&pdu.data);
                if partial.payload.len() as u64 > declared {
                    return Err(UlError::protocol(format!(
                        "exchange {} payload exceeds its declared {} bytes",
                        pdu.exchange_id, declared
                    )));
                }
                if !pdu.last {
                    return Ok(None);
                }
                if partial.payload.len() as u64 != declared {
                    return Err(UlError::protocol(format!(
                        "exchange {} payload is {} bytes but declared {}",
                        pdu.exchange_id,
                        partial.payload.len(),
                        declared
                    )));
                }
                let payload = partial.payload.split().freeze();
                match partial.command.take() {
                    Some(command) => Ok(self.complete(command, Some(payload))),
                    None => Err(UlError::internal("payload completed without a command")),
                }
            }
        }
    }

    fn complete(&mut self, command: Command, payload: Option<Bytes>) -> Option<Assembled> {
        self.partial.take().map(|partial| Assembled {
            context_id: partial.context_id,
            message: Message::new(command, payload),
        })
    }
}

struct PendingEntry {
    generation: u64,
    tx: oneshot::Sender<Result<Message>>,
}

#[derive(Default)]
struct TableState {
    next_id: u16,
    generation: u64,
    pending: HashMap<u16, PendingEntry>,
    inbound: HashMap<u16, u8>,
    closed: bool,
}

/// Outstanding exchanges of one association: requests awaiting a response
/// and inbound requests awaiting ours.
#[derive(Default)]
pub(crate) struct ExchangeTable {
    state: Mutex<TableState>,
}

impl ExchangeTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a fresh exchange id and register a waiter for its response
    pub(crate) fn open_request(
        self: &Arc<Self>,
        closed: impl FnOnce() -> UlError,
    ) -> Result<PendingResponse> {
        let mut state = self.lock();
        if state.closed {
            return Err(closed());
        }
        let mut candidate = state.next_id;
        let mut chosen = None;
        for _ in 0..=u16::MAX as u32 {
            if !state.pending.contains_key(&candidate) {
                chosen = Some(candidate);
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        let exchange_id = chosen.ok_or(UlError::ExchangeIdsExhausted)?;
        state.next_id = exchange_id.wrapping_add(1);
        state.generation += 1;
        let generation = state.generation;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(exchange_id, PendingEntry { generation, tx });
        Ok(PendingResponse {
            exchange_id,
            generation,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hand a response to its waiter. Returns false for stale responses.
    pub(crate) fn resolve(&self, exchange_id: u16, message: Message) -> bool {
        let entry = self.lock().pending.remove(&exchange_id);
        match entry {
            Some(entry) => {
                // The waiter may have gone away; that is a cancellation too.
                let _ = entry.tx.send(Ok(message));
                true
            }
            None => false,
        }
    }

    fn cancel(&self, exchange_id: u16, generation: u64) -> bool {
        let mut state = self.lock();
        match state.pending.get(&exchange_id) {
            Some(entry) if entry.generation == generation => {
                state.pending.remove(&exchange_id);
                true
            }
            _ => false,
        }
    }

    /// Remember an inbound request. Returns false if the id is already open.
    pub(crate) fn open_inbound(&self, exchange_id: u16, context_id: u8) -> bool {
        let mut state = self.lock();
        if state.inbound.contains_key(&exchange_id) {
            return false;
        }
        state.inbound.insert(exchange_id, context_id);
        true
    }

    #[cfg(test)]
    pub(crate) fn inbound_context(&self, exchange_id: u16) -> Option<u8> {
        self.lock().inbound.get(&exchange_id).copied()
    }

    /// Claim an unanswered inbound request for answering. Once claimed the
    /// peer may reuse its id.
    pub(crate) fn take_inbound(&self, exchange_id: u16) -> Option<u8> {
        self.lock().inbound.remove(&exchange_id)
    }

    /// Put back a claim whose response never left
    pub(crate) fn restore_inbound(&self, exchange_id: u16, context_id: u8) {
        let mut state = self.lock();
        if !state.closed {
            state.inbound.entry(exchange_id).or_insert(context_id);
        }
    }

    /// Fail every waiter and refuse new requests
    pub(crate) fn close(&self, error: impl Fn() -> UlError) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            state.closed = true;
            state.inbound.clear();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error()));
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_ids(&self) -> Vec<u16> {
        self.lock().pending.keys().copied().collect()
    }
}

/// Handle on a request awaiting its response.
///
/// Dropping the handle without waiting cancels the exchange.
pub struct PendingResponse {
    exchange_id: u16,
    generation: u64,
    rx: oneshot::Receiver<Result<Message>>,
    table: Arc<ExchangeTable>,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("exchange_id", &self.exchange_id)
            .finish()
    }
}

impl PendingResponse {
    pub fn exchange_id(&self) -> u16 {
        self.exchange_id
    }

    /// Wait for the response, optionally bounded by `timeout`.
    ///
    /// On expiry the exchange is cancelled and a late response is discarded
    /// as stale. The association itself is unaffected.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Message> {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.table.cancel(self.exchange_id, self.generation);
                    return Err(UlError::timeout(format!(
                        "no response to exchange {} within {:?}",
                        self.exchange_id, limit
                    )));
                }
            },
            None => (&mut self.rx).await,
        };
        match received {
            Ok(outcome) => outcome,
            Err(_) => Err(UlError::Cancelled(self.exchange_id)),
        }
    }

    /// Stop waiting. Only local bookkeeping is removed; nothing is sent.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.table.cancel(self.exchange_id, self.generation) {
            debug!(exchange_id = self.exchange_id, "Cancelled pending exchange");
        }
    }
}

impl Association {
    /// Send a request on `capability` and return a handle for its response.
    ///
    /// The exchange id is allocated here and written into the command, as is
    /// the capability and the declared payload length.
    pub async fn send_request(
        &self,
        capability: &str,
        mut command: Command,
        payload: Option<Bytes>,
    ) -> Result<PendingResponse> {
        self.ensure_established()?;
        let context_id = self
            .capabilities()
            .and_then(|table| table.by_capability(capability).map(|a| a.context_id))
            .ok_or_else(|| UlError::CapabilityNotNegotiated(capability.to_string()))?;

        let shared = self.shared();
        let pending = shared
            .exchanges
            .open_request(|| shared.closed_error())?;

        command.exchange_id = pending.exchange_id();
        command.capability = capability.to_string();
        command.status = None;
        command.payload_length = payload.as_ref().map(|p| p.len() as u64);
        let encoded = command.encode()?;

        let fragments = fragment(
            command.exchange_id,
            context_id,
            encoded,
            payload,
            self.send_fragment_size(),
        );
        debug!(
            association = %self.id(),
            exchange_id = command.exchange_id,
            capability,
            fragments = fragments.len(),
            "Sending request"
        );
        // On failure the pending handle drops and cancels itself.
        self.write_fragments(fragments).await?;
        Ok(pending)
    }

    /// Answer an inbound request with `status`.
    ///
    /// `exchange_id` must name a request received on this association and
    /// not yet answered; anything else is a local usage error. A response
    /// that cannot be encoded is replaced by a processing failure so the
    /// peer still gets an answer, and the encoding error is returned.
    pub async fn send_response(
        &self,
        exchange_id: u16,
        status: Status,
        mut command: Command,
        payload: Option<Bytes>,
    ) -> Result<()> {
        self.ensure_established()?;
        let shared = self.shared();
        // Claimed before any byte is written: the peer may reuse the id as
        // soon as it sees the response.
        let context_id = shared
            .exchanges
            .take_inbound(exchange_id)
            .ok_or(UlError::UnknownExchange(exchange_id))?;
        let Some(capability) = self
            .capabilities()
            .and_then(|table| table.by_context(context_id).map(|a| a.capability.clone()))
        else {
            shared.exchanges.restore_inbound(exchange_id, context_id);
            return Err(UlError::internal(format!("context {} vanished", context_id)));
        };

        command.exchange_id = exchange_id;
        command.capability = capability;
        command.status = Some(status);
        if !command.field.is_response() {
            command.field = command.field.response();
        }
        command.payload_length = payload.as_ref().map(|p| p.len() as u64);

        let (encoded, payload, unencodable) = match command.encode() {
            Ok(encoded) => (encoded, payload, None),
            Err(e) => {
                warn!(
                    association = %self.id(),
                    exchange_id,
                    error = %e,
                    "Response not encodable, answering with a processing failure"
                );
                let fallback =
                    Command::response_to(&command, Status::Failure(codes::PROCESSING_FAILURE))
                        .with_attribute(
                            tags::ERROR_COMMENT,
                            format!("response could not be encoded: {}", e),
                        );
                match fallback.encode() {
                    Ok(encoded) => (encoded, None, Some(e)),
                    Err(fallback_error) => {
                        shared.exchanges.restore_inbound(exchange_id, context_id);
                        return Err(fallback_error);
                    }
                }
            }
        };

        let fragments = fragment(
            exchange_id,
            context_id,
            encoded,
            payload,
            self.send_fragment_size(),
        );
        if let Err(e) = self.write_fragments(fragments).await {
            shared.exchanges.restore_inbound(exchange_id, context_id);
            return Err(e);
        }
        match unencodable {
            Some(e) => Err(e),
            None => {
                debug!(association = %self.id(), exchange_id, %status, "Sent response");
                Ok(())
            }
        }
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        capability: &str,
        command: Command,
        payload: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.send_request(capability, command, payload)
            .await?
            .wait(timeout)
            .await
    }

    /// Number of requests sent on this association still awaiting a response
    pub fn pending_exchanges(&self) -> usize {
        self.shared().exchanges.pending_count()
    }
}
