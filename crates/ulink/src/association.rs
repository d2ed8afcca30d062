//! Association state machine
//!
//! An [`Association`] owns one transport connection and drives it through
//! negotiation, data transfer and release or abort:
//!
//! ```text
//! IDLE -> CONNECTING -> NEGOTIATING -> ESTABLISHED -> RELEASING -> CLOSED
//!                            |
//!                            +-> CLOSED (rejected)
//! any non-terminal state -> ABORTED
//! ```
//!
//! Once established, a reader task owns the inbound half of the transport.
//! It reassembles messages in arrival order, resolves pending exchanges and
//! hands requests to the service registry. Outbound PDUs are written under
//! a single per-association lock.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{UlConfig, DEFAULT_PDU_LENGTH};
use crate::error::{Result, UlError};
use crate::exchange::{Assembled, ExchangeTable, ReassemblyLimits, Reassembler};
use crate::negotiation::{negotiate, AcceptancePolicy, AcceptedCapability, CapabilityTable};
use crate::pdu::{
    AbortPdu, AbortReason, AbortSource, AssociateAc, AssociateRj, AssociateRq, ContextOutcome,
    DataPdu, Pdu, PduCodec, PduError, ProposedContext, RejectReason, PROTOCOL_VERSION,
};
use crate::registry::{no_provider_response, RequestContext, ServiceRegistry};
use crate::types::{codes, Message, Status};

/// Peers announcing a data limit below this are treated as malformed
pub const MIN_PEER_PDU_LENGTH: u32 = 256;

/// How long teardown waits for the write lock before giving up on a clean close
const ABORT_GRACE: Duration = Duration::from_secs(2);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = FramedRead<BoxedRead, PduCodec>;
type Writer = FramedWrite<BoxedWrite, PduCodec>;

/// Opaque identifier of one association, used in logs and handed to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociationId(Uuid);

impl AssociationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AssociationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    Idle,
    Connecting,
    Negotiating,
    Established,
    Releasing,
    Closed,
    Aborted,
}

/// Inputs driving [`AssociationState::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Transport connected (requester) or accepted (acceptor)
    TransportOpened,
    /// Proposal sent (requester) or received (acceptor)
    ProposalExchanged,
    /// At least one capability accepted
    Accepted,
    /// Proposal rejected
    Rejected,
    /// Release request sent or received
    ReleaseStarted,
    /// Release response observed
    ReleaseCompleted,
    /// Abort sent or received, transport lost, or protocol violation
    Abort,
}

impl Event {
    pub fn name(self) -> &'static str {
        match self {
            Event::TransportOpened => "transport-opened",
            Event::ProposalExchanged => "proposal-exchanged",
            Event::Accepted => "accepted",
            Event::Rejected => "rejected",
            Event::ReleaseStarted => "release-started",
            Event::ReleaseCompleted => "release-completed",
            Event::Abort => "abort",
        }
    }
}

impl AssociationState {
    /// `Closed` and `Aborted` admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, AssociationState::Closed | AssociationState::Aborted)
    }

    /// The state reached from `self` on `event`
    pub fn on(self, event: Event) -> Result<AssociationState> {
        use AssociationState::*;
        let next = match (self, event) {
            (Idle, Event::TransportOpened) => Connecting,
            (Connecting, Event::ProposalExchanged) => Negotiating,
            (Negotiating, Event::Accepted) => Established,
            (Negotiating, Event::Rejected) => Closed,
            (Established, Event::ReleaseStarted) => Releasing,
            (Releasing, Event::ReleaseCompleted) => Closed,
            (state, Event::Abort) if !state.is_terminal() => Aborted,
            (from, event) => {
                return Err(UlError::InvalidTransition {
                    from,
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Idle => "IDLE",
            AssociationState::Connecting => "CONNECTING",
            AssociationState::Negotiating => "NEGOTIATING",
            AssociationState::Established => "ESTABLISHED",
            AssociationState::Releasing => "RELEASING",
            AssociationState::Closed => "CLOSED",
            AssociationState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Who brought an association down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortOrigin {
    /// The local application called [`Association::abort`]
    Local,
    /// The peer sent an abort PDU
    Remote,
    /// Transport loss, framing or sequence violation, or an expired deadline
    Fault,
}

impl fmt::Display for AbortOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AbortOrigin::Local => "local",
            AbortOrigin::Remote => "remote",
            AbortOrigin::Fault => "fault",
        })
    }
}

/// Why an association ended, reported by [`Association::closed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Released,
    Rejected {
        reason: RejectReason,
    },
    Aborted {
        origin: AbortOrigin,
        reason: Option<AbortReason>,
        detail: String,
    },
}

impl CloseReason {
    /// Error reported to operations attempted after the close
    pub fn to_error(&self) -> UlError {
        match self {
            CloseReason::Released => UlError::Released,
            CloseReason::Rejected { reason } => UlError::Rejected { reason: *reason },
            CloseReason::Aborted {
                origin,
                reason,
                detail,
            } => UlError::Aborted {
                origin: *origin,
                reason: *reason,
                detail: detail.clone(),
            },
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Released => f.write_str("released"),
            CloseReason::Rejected { reason } => write!(f, "rejected: {}", reason),
            CloseReason::Aborted { origin, detail, .. } => {
                write!(f, "aborted ({}): {}", origin, detail)
            }
        }
    }
}

/// Per-association settings, usually derived from [`UlConfig`]
#[derive(Debug, Clone)]
pub struct AssociationOptions {
    pub local_entity: String,
    /// Largest data fragment we accept, announced to the peer
    pub max_pdu_length: u32,
    pub negotiation_timeout: Duration,
    pub release_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub reassembly: ReassemblyLimits,
    /// Calling entities an acceptor admits; empty admits any
    pub accepted_calling_entities: Vec<String>,
    pub require_called_entity: bool,
}

impl Default for AssociationOptions {
    fn default() -> Self {
        UlConfig::default().association_options()
    }
}

/// Facts fixed by negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
    pub calling_entity: String,
    pub called_entity: String,
    /// Largest data fragment the peer accepts; 0 means no limit was announced
    pub peer_max_pdu_length: u32,
}

enum Role {
    Requester,
    Acceptor { policy: Arc<AcceptancePolicy> },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Acceptor { .. } => "acceptor",
        }
    }
}

pub(crate) struct Shared {
    id: AssociationId,
    role: Role,
    options: AssociationOptions,
    registry: OnceLock<Arc<ServiceRegistry>>,
    state: watch::Sender<AssociationState>,
    reader: Mutex<Option<Reader>>,
    writer: tokio::sync::Mutex<Writer>,
    pub(crate) exchanges: Arc<ExchangeTable>,
    table: OnceLock<Arc<CapabilityTable>>,
    info: OnceLock<AssociationInfo>,
    close_reason: OnceLock<CloseReason>,
    release_done: Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
    span: Span,
}

impl Shared {
    /// Error for operations on an association that is not usable
    pub(crate) fn closed_error(&self) -> UlError {
        match self.close_reason.get() {
            Some(reason) => reason.to_error(),
            None => UlError::NotEstablished(*self.state.borrow()),
        }
    }
}

/// One negotiated session over one transport connection.
///
/// Cloning yields another handle on the same association.
#[derive(Clone)]
pub struct Association {
    shared: Arc<Shared>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Association {
    /// Wrap a connected transport for the requesting side
    pub fn requester<T>(io: T, options: AssociationOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(io, options, Role::Requester)
    }

    /// Wrap an accepted transport for the accepting side
    pub fn acceptor<T>(io: T, options: AssociationOptions, policy: Arc<AcceptancePolicy>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(io, options, Role::Acceptor { policy })
    }

    fn build<T>(io: T, options: AssociationOptions, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let codec = PduCodec::for_pdu_length(options.max_pdu_length);
        let reader: BoxedRead = Box::new(read_half);
        let writer: BoxedWrite = Box::new(write_half);
        let id = AssociationId::new();
        let span = info_span!("association", %id, role = role.name());
        let (state, _) = watch::channel(AssociationState::Idle);

        Self {
            shared: Arc::new(Shared {
                id,
                role,
                options,
                registry: OnceLock::new(),
                state,
                reader: Mutex::new(Some(FramedRead::new(reader, codec.clone()))),
                writer: tokio::sync::Mutex::new(FramedWrite::new(writer, codec)),
                exchanges: Arc::new(ExchangeTable::default()),
                table: OnceLock::new(),
                info: OnceLock::new(),
                close_reason: OnceLock::new(),
                release_done: Mutex::new(None),
                cancel: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Route inbound requests to `registry`. Without one, every inbound
    /// request is answered with a "no provider" status.
    pub fn with_registry(self, registry: Arc<ServiceRegistry>) -> Self {
        let _ = self.shared.registry.set(registry);
        self
    }

    /// Connect over TCP and negotiate as requester
    pub async fn connect(
        addr: impl ToSocketAddrs,
        called_entity: &str,
        contexts: Vec<ProposedContext>,
        options: AssociationOptions,
    ) -> Result<Association> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let association = Association::requester(stream, options);
        association.propose(called_entity, contexts).await?;
        Ok(association)
    }

    pub fn id(&self) -> AssociationId {
        self.shared.id
    }

    pub fn state(&self) -> AssociationState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state change
    pub fn watch_state(&self) -> watch::Receiver<AssociationState> {
        self.shared.state.subscribe()
    }

    /// The negotiated capability table, once established
    pub fn capabilities(&self) -> Option<Arc<CapabilityTable>> {
        self.shared.table.get().cloned()
    }

    pub fn info(&self) -> Option<&AssociationInfo> {
        self.shared.info.get()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.get().cloned()
    }

    /// Resolves once the association is closed or aborted
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.close_reason().unwrap_or(CloseReason::Released)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn ensure_established(&self) -> Result<()> {
        match self.state() {
            AssociationState::Established => Ok(()),
            _ => Err(self.shared.closed_error()),
        }
    }

    /// Bytes of data per outbound fragment, bounded by the peer's limit
    pub(crate) fn send_fragment_size(&self) -> usize {
        match self.info().map(|info| info.peer_max_pdu_length) {
            Some(0) | None => DEFAULT_PDU_LENGTH as usize,
            Some(limit) => limit as usize,
        }
    }

    fn transition(&self, event: Event, close: Option<CloseReason>) -> Result<AssociationState> {
        let mut outcome = Err(UlError::internal("state unchanged"));
        self.shared.state.send_if_modified(|state| match state.on(event) {
            Ok(next) => {
                if next.is_terminal() {
                    if let Some(reason) = close {
                        let _ = self.shared.close_reason.set(reason);
                    }
                }
                debug!(parent: &self.shared.span, from = %state, to = %next, "State transition");
                *state = next;
                outcome = Ok(next);
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    fn take_reader(&self) -> Result<Reader> {
        self.shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| UlError::internal("transport reader already taken"))
    }

    /// Propose `contexts` to `called_entity` and wait for the answer.
    ///
    /// A reject closes the association and returns [`UlError::Rejected`].
    pub async fn propose(
        &self,
        called_entity: &str,
        contexts: Vec<ProposedContext>,
    ) -> Result<Arc<CapabilityTable>> {
        if !matches!(self.shared.role, Role::Requester) {
            return Err(UlError::config("only the requesting side proposes"));
        }
        if contexts.is_empty() {
            return Err(UlError::config("a proposal needs at least one context"));
        }
        if let Some(id) = duplicate_context(&contexts) {
            return Err(UlError::config(format!("context id {} proposed twice", id)));
        }

        self.transition(Event::TransportOpened, None)?;
        let mut reader = self.take_reader()?;
        let options = &self.shared.options;
        let rq = AssociateRq {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: options.local_entity.clone(),
            called_entity: called_entity.to_string(),
            max_pdu_length: options.max_pdu_length,
            contexts: contexts.clone(),
        };
        if let Err(e) = self.write_control(Pdu::AssociateRq(rq)).await {
            return Err(self.transport_fault(e).await);
        }
        self.transition(Event::ProposalExchanged, None)?;
        debug!(parent: &self.shared.span, called_entity, contexts = contexts.len(), "Proposal sent");

        match self.read_negotiation_pdu(&mut reader).await? {
            Pdu::AssociateAc(ac) => {
                let table = match check_acceptance(&contexts, &ac) {
                    Ok(table) => table,
                    Err(detail) => {
                        return Err(self
                            .fault(AbortReason::InvalidParameterValue, detail)
                            .await)
                    }
                };
                if let Err(detail) = check_peer_pdu_length(ac.max_pdu_length) {
                    return Err(self.fault(AbortReason::InvalidParameterValue, detail).await);
                }
                let _ = self.shared.info.set(AssociationInfo {
                    calling_entity: options.local_entity.clone(),
                    called_entity: called_entity.to_string(),
                    peer_max_pdu_length: ac.max_pdu_length,
                });
                self.establish(table, reader)
            }
            Pdu::AssociateRj(rj) => {
                info!(parent: &self.shared.span, reason = %rj.reason, "Association rejected by peer");
                self.finish_reject(rj.reason).await;
                Err(UlError::Rejected { reason: rj.reason })
            }
            Pdu::Abort(abort) => Err(self.remote_abort(abort).await),
            other => {
                let detail = format!("unexpected {} during negotiation", other.name());
                Err(self.fault(AbortReason::UnexpectedPdu, detail).await)
            }
        }
    }

    /// Wait for a proposal and answer it from the acceptance policy
    pub async fn answer(&self) -> Result<Arc<CapabilityTable>> {
        self.respond(None).await
    }

    /// Wait for a proposal and reject it with `reason` without negotiating
    pub async fn refuse(&self, reason: RejectReason) -> Result<()> {
        match self.respond(Some(reason)).await {
            Err(UlError::Rejected { .. }) => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Err(UlError::internal("refused association was established")),
        }
    }

    async fn respond(&self, forced: Option<RejectReason>) -> Result<Arc<CapabilityTable>> {
        let policy = match &self.shared.role {
            Role::Acceptor { policy } => Arc::clone(policy),
            Role::Requester => return Err(UlError::config("only the accepting side answers")),
        };

        self.transition(Event::TransportOpened, None)?;
        let mut reader = self.take_reader()?;
        let rq = match self.read_negotiation_pdu(&mut reader).await? {
            Pdu::AssociateRq(rq) => rq,
            Pdu::Abort(abort) => return Err(self.remote_abort(abort).await),
            other => {
                let detail = format!("expected a proposal, got {}", other.name());
                return Err(self.fault(AbortReason::UnexpectedPdu, detail).await);
            }
        };
        self.transition(Event::ProposalExchanged, None)?;
        let _ = self.shared.info.set(AssociationInfo {
            calling_entity: rq.calling_entity.clone(),
            called_entity: rq.called_entity.clone(),
            peer_max_pdu_length: rq.max_pdu_length,
        });
        debug!(
            parent: &self.shared.span,
            calling = %rq.calling_entity,
            called = %rq.called_entity,
            contexts = rq.contexts.len(),
            "Proposal received"
        );

        if let Some(reason) = forced {
            return Err(self.reject(reason).await);
        }
        if rq.protocol_version != PROTOCOL_VERSION {
            return Err(self.reject(RejectReason::ProtocolVersionNotSupported).await);
        }
        if let Some(id) = duplicate_context(&rq.contexts) {
            let detail = format!("context id {} proposed twice", id);
            return Err(self.fault(AbortReason::InvalidParameterValue, detail).await);
        }
        if let Err(detail) = check_peer_pdu_length(rq.max_pdu_length) {
            return Err(self.fault(AbortReason::InvalidParameterValue, detail).await);
        }
        if let Some(reason) = self.screen_entities(&rq) {
            return Err(self.reject(reason).await);
        }

        let outcome = match negotiate(&rq.contexts, &policy) {
            Ok(outcome) => outcome,
            Err(reason) => return Err(self.reject(reason).await),
        };
        if outcome.accepted.is_empty() {
            return Err(self.reject(RejectReason::NoAcceptableCapability).await);
        }
        for rejected in &outcome.rejected {
            debug!(
                parent: &self.shared.span,
                context_id = rejected.context_id,
                capability = %rejected.capability,
                outcome = %rejected.outcome,
                "Capability not accepted"
            );
        }

        let ac = AssociateAc {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: rq.calling_entity.clone(),
            called_entity: rq.called_entity.clone(),
            max_pdu_length: self.shared.options.max_pdu_length,
            results: outcome.context_results(&rq.contexts),
        };
        if let Err(e) = self.write_control(Pdu::AssociateAc(ac)).await {
            return Err(self.transport_fault(e).await);
        }
        self.establish(CapabilityTable::new(outcome.accepted), reader)
    }

    fn screen_entities(&self, rq: &AssociateRq) -> Option<RejectReason> {
        let options = &self.shared.options;
        if options.require_called_entity && rq.called_entity != options.local_entity {
            return Some(RejectReason::CalledEntityNotRecognized);
        }
        if !options.accepted_calling_entities.is_empty()
            && !options
                .accepted_calling_entities
                .iter()
                .any(|entity| *entity == rq.calling_entity)
        {
            return Some(RejectReason::CallingEntityNotRecognized);
        }
        None
    }

    fn establish(&self, table: CapabilityTable, reader: Reader) -> Result<Arc<CapabilityTable>> {
        let table = Arc::new(table);
        let _ = self.shared.table.set(Arc::clone(&table));
        self.transition(Event::Accepted, None)
            .map_err(|_| self.shared.closed_error())?;

        info!(
            parent: &self.shared.span,
            capabilities = table.len(),
            peer_max_pdu = self.info().map(|i| i.peer_max_pdu_length).unwrap_or_default(),
            "Association established"
        );

        let worker = self.clone();
        let span = self.shared.span.clone();
        tokio::spawn(async move { worker.read_loop(reader).await }.instrument(span));
        Ok(table)
    }

    async fn reject(&self, reason: RejectReason) -> UlError {
        info!(parent: &self.shared.span, %reason, "Rejecting association");
        let pdu = Pdu::AssociateRj(AssociateRj::for_reason(reason));
        if let Err(e) = self.write_control(pdu).await {
            return self.transport_fault(e).await;
        }
        self.finish_reject(reason).await;
        UlError::Rejected { reason }
    }

    async fn read_negotiation_pdu(&self, reader: &mut Reader) -> Result<Pdu> {
        let limit = self.shared.options.negotiation_timeout;
        let next = tokio::select! {
            _ = self.shared.cancel.cancelled() => return Err(self.shared.closed_error()),
            next = tokio::time::timeout(limit, reader.next()) => next,
        };
        match next {
            Err(_) => {
                let detail = format!("no negotiation PDU within {:?}", limit);
                self.terminate(AbortOrigin::Fault, None, detail.clone(), true)
                    .await;
                Err(UlError::timeout(detail))
            }
            Ok(None) => {
                self.terminate(
                    AbortOrigin::Fault,
                    None,
                    "transport closed during negotiation".to_string(),
                    false,
                )
                .await;
                Err(self.shared.closed_error())
            }
            Ok(Some(Err(e))) => Err(self.framing_fault(e).await),
            Ok(Some(Ok(pdu))) => Ok(pdu),
        }
    }

    /// Write a negotiation or teardown PDU, bypassing the established check
    async fn write_control(&self, pdu: Pdu) -> std::result::Result<(), PduError> {
        let mut writer = self.shared.writer.lock().await;
        writer.send(pdu).await
    }

    /// Write the fragments of one message without interleaving
    pub(crate) async fn write_fragments(&self, fragments: Vec<DataPdu>) -> Result<()> {
        let outcome = {
            let mut writer = self.shared.writer.lock().await;
            // Checked under the lock so nothing is written once release or abort began.
            if self.state() != AssociationState::Established {
                return Err(self.shared.closed_error());
            }
            let send = async {
                for fragment in fragments {
                    writer.feed(Pdu::Data(fragment)).await?;
                }
                writer.flush().await
            };
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(self.shared.closed_error()),
                outcome = send => outcome,
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(self.transport_fault(e).await),
        }
    }

    /// Release the association gracefully.
    ///
    /// Requests still awaiting a response fail with [`UlError::Released`].
    pub async fn release(&self) -> Result<()> {
        self.transition(Event::ReleaseStarted, None)?;
        let (tx, rx) = oneshot::channel();
        *self
            .shared
            .release_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        if let Err(e) = self.write_control(Pdu::ReleaseRq).await {
            return Err(self.transport_fault(e).await);
        }
        debug!(parent: &self.shared.span, "Release requested");

        let limit = self.shared.options.release_timeout;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                let detail = format!("no release response within {:?}", limit);
                self.terminate(AbortOrigin::Fault, None, detail.clone(), true)
                    .await;
                Err(UlError::timeout(detail))
            }
        }
    }

    /// Abort the association, sending a single abort PDU to the peer
    pub async fn abort(&self) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(UlError::InvalidTransition {
                from: state,
                event: Event::Abort.name(),
            });
        }
        self.terminate(
            AbortOrigin::Local,
            None,
            "aborted by the local application".to_string(),
            true,
        )
        .await;
        Ok(())
    }

    async fn fault(&self, reason: AbortReason, detail: String) -> UlError {
        self.terminate(AbortOrigin::Fault, Some(reason), detail, true)
            .await;
        self.shared.closed_error()
    }

    async fn transport_fault(&self, e: PduError) -> UlError {
        self.terminate(
            AbortOrigin::Fault,
            None,
            format!("transport failure: {}", e),
            false,
        )
        .await;
        self.shared.closed_error()
    }

    async fn framing_fault(&self, e: PduError) -> UlError {
        let notify = !matches!(e, PduError::Io(_));
        self.terminate(AbortOrigin::Fault, Some(e.abort_reason()), e.to_string(), notify)
            .await;
        self.shared.closed_error()
    }

    async fn remote_abort(&self, abort: AbortPdu) -> UlError {
        let detail = format!("aborted by peer ({})", abort.source);
        self.terminate(AbortOrigin::Remote, Some(abort.reason), detail, false)
            .await;
        self.shared.closed_error()
    }

    /// Enter ABORTED: fail pending exchanges, optionally notify the peer,
    /// and close the transport. No-op once the association is terminal.
    pub(crate) async fn terminate(
        &self,
        origin: AbortOrigin,
        reason: Option<AbortReason>,
        detail: String,
        notify_peer: bool,
    ) {
        let close = CloseReason::Aborted {
            origin,
            reason,
            detail: detail.clone(),
        };
        if self.transition(Event::Abort, Some(close)).is_err() {
            return;
        }
        match origin {
            AbortOrigin::Local => info!(parent: &self.shared.span, %detail, "Association aborted"),
            _ => warn!(parent: &self.shared.span, %origin, %detail, "Association aborted"),
        }

        self.shared.cancel.cancel();
        let failed = self.shared.exchanges.close(|| UlError::Aborted {
            origin,
            reason,
            detail: detail.clone(),
        });
        if failed > 0 {
            debug!(parent: &self.shared.span, failed, "Failed pending exchanges");
        }
        self.shared
            .release_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let abort = notify_peer.then(|| {
            Pdu::Abort(AbortPdu {
                source: match origin {
                    AbortOrigin::Local => AbortSource::ServiceUser,
                    _ => AbortSource::ServiceProvider,
                },
                reason: reason.unwrap_or(AbortReason::NotSpecified),
            })
        });
        self.close_transport(abort).await;
        self.shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn finish_reject(&self, reason: RejectReason) {
        if self
            .transition(Event::Rejected, Some(CloseReason::Rejected { reason }))
            .is_err()
        {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.exchanges.close(|| UlError::Rejected { reason });
        self.close_transport(None).await;
    }

    async fn finish_release(&self) {
        if self
            .transition(Event::ReleaseCompleted, Some(CloseReason::Released))
            .is_err()
        {
            return;
        }
        self.shared.cancel.cancel();
        let failed = self.shared.exchanges.close(|| UlError::Released);
        if let Some(tx) = self
            .shared
            .release_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        self.close_transport(None).await;
        info!(parent: &self.shared.span, unanswered = failed, "Association released");
    }

    async fn close_transport(&self, last: Option<Pdu>) {
        let Ok(mut writer) = tokio::time::timeout(ABORT_GRACE, self.shared.writer.lock()).await
        else {
            warn!(parent: &self.shared.span, "Writer busy, leaving transport to be dropped");
            return;
        };
        if let Some(pdu) = last {
            if let Ok(Err(e)) = tokio::time::timeout(ABORT_GRACE, writer.send(pdu)).await {
                debug!(parent: &self.shared.span, error = %e, "Could not send abort");
            }
        }
        let _ = tokio::time::timeout(ABORT_GRACE, writer.get_mut().shutdown()).await;
    }

    async fn read_loop(self, mut reader: Reader) {
        let mut reassembler = Reassembler::new(self.shared.options.reassembly);
        loop {
            let idle = self.shared.options.idle_timeout.map(|t| Instant::now() + t);
            let deadline = match (idle, reassembler.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let next = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                next = read_until(&mut reader, deadline) => next,
            };
            let flow = match next {
                None => {
                    let detail = if reassembler.deadline().is_some_and(|d| Instant::now() >= d) {
                        "fragmented message did not complete in time"
                    } else {
                        "idle timeout, peer unresponsive"
                    };
                    self.terminate(AbortOrigin::Fault, None, detail.to_string(), true)
                        .await;
                    ControlFlow::Break(())
                }
                Some(None) => {
                    self.terminate(
                        AbortOrigin::Fault,
                        None,
                        "transport closed by peer".to_string(),
                        false,
                    )
                    .await;
                    ControlFlow::Break(())
                }
                Some(Some(Err(e))) => {
                    self.framing_fault(e).await;
                    ControlFlow::Break(())
                }
                Some(Some(Ok(pdu))) => self.on_pdu(pdu, &mut reassembler).await,
            };
            if flow.is_break() {
                break;
            }
        }
        debug!("Reader stopped");
    }

    async fn on_pdu(&self, pdu: Pdu, reassembler: &mut Reassembler) -> ControlFlow<()> {
        match pdu {
            Pdu::Data(data) => match reassembler.push(data) {
                Ok(None) => ControlFlow::Continue(()),
                Ok(Some(assembled)) => self.deliver(assembled).await,
                Err(e) => {
                    self.fault(AbortReason::InvalidParameterValue, e.to_string())
                        .await;
                    ControlFlow::Break(())
                }
            },
            Pdu::ReleaseRq => self.on_release_request().await,
            Pdu::ReleaseRp => {
                let awaited = self
                    .shared
                    .release_done
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some();
                if self.state() == AssociationState::Releasing && awaited {
                    self.finish_release().await;
                } else {
                    self.fault(
                        AbortReason::UnexpectedPdu,
                        "release response without a release request".to_string(),
                    )
                    .await;
                }
                ControlFlow::Break(())
            }
            Pdu::Abort(abort) => {
                self.remote_abort(abort).await;
                ControlFlow::Break(())
            }
            other => {
                let detail = format!("unexpected {} on an established association", other.name());
                self.fault(AbortReason::UnexpectedPdu, detail).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_release_request(&self) -> ControlFlow<()> {
        match self.state() {
            AssociationState::Established => {
                if self.transition(Event::ReleaseStarted, None).is_err() {
                    return ControlFlow::Break(());
                }
                debug!("Release requested by peer");
                if let Err(e) = self.write_control(Pdu::ReleaseRp).await {
                    self.transport_fault(e).await;
                    return ControlFlow::Break(());
                }
                self.finish_release().await;
                ControlFlow::Break(())
            }
            AssociationState::Releasing => {
                // Both sides asked to release; answer and keep waiting for ours.
                debug!("Release collision");
                if let Err(e) = self.write_control(Pdu::ReleaseRp).await {
                    self.transport_fault(e).await;
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            _ => ControlFlow::Break(()),
        }
    }

    async fn deliver(&self, assembled: Assembled) -> ControlFlow<()> {
        let Assembled {
            context_id,
            message,
        } = assembled;

        let accepted = self
            .capabilities()
            .and_then(|table| table.by_context(context_id).cloned())
            .filter(|accepted| accepted.capability == message.command.capability);
        let Some(accepted) = accepted else {
            let detail = format!(
                "capability '{}' on context {} was not negotiated",
                message.command.capability, context_id
            );
            self.fault(AbortReason::UnexpectedParameter, detail).await;
            return ControlFlow::Break(());
        };

        let exchange_id = message.command.exchange_id;
        if message.command.is_response() {
            if !self.shared.exchanges.resolve(exchange_id, message) {
                warn!(exchange_id, "Discarding response with no pending exchange");
            }
            return ControlFlow::Continue(());
        }

        if self.state() != AssociationState::Established {
            debug!(exchange_id, "Ignoring request received while releasing");
            return ControlFlow::Continue(());
        }
        if !self.shared.exchanges.open_inbound(exchange_id, context_id) {
            let detail = format!("exchange id {} reused while its request is open", exchange_id);
            self.fault(AbortReason::InvalidParameterValue, detail).await;
            return ControlFlow::Break(());
        }

        let reply = self.dispatch(accepted, exchange_id, message);
        let association = self.clone();
        tokio::spawn(
            async move {
                let response = reply.await;
                let status = response
                    .status()
                    .unwrap_or(Status::Failure(codes::PROCESSING_FAILURE));
                if let Err(e) = association
                    .send_response(exchange_id, status, response.command, response.payload)
                    .await
                {
                    debug!(exchange_id, error = %e, "Response not sent");
                }
            }
            .in_current_span(),
        );
        ControlFlow::Continue(())
    }

    /// Look up the handler now, in arrival order; the returned future runs it
    fn dispatch(
        &self,
        accepted: AcceptedCapability,
        exchange_id: u16,
        message: Message,
    ) -> BoxFuture<'static, Message> {
        let info = self.info().cloned().unwrap_or(AssociationInfo {
            calling_entity: String::new(),
            called_entity: String::new(),
            peer_max_pdu_length: 0,
        });
        let ctx = RequestContext {
            association_id: self.id(),
            calling_entity: info.calling_entity,
            called_entity: info.called_entity,
            capability: accepted.capability,
            encoding: accepted.encoding,
            context_id: accepted.context_id,
            exchange_id,
        };
        match self.shared.registry.get() {
            Some(registry) => registry.dispatch(ctx, message),
            None => future::ready(no_provider_response(&message)).boxed(),
        }
    }
}

async fn read_until(
    reader: &mut Reader,
    deadline: Option<Instant>,
) -> Option<Option<std::result::Result<Pdu, PduError>>> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, reader.next()).await.ok(),
        None => Some(reader.next().await),
    }
}

fn duplicate_context(contexts: &[ProposedContext]) -> Option<u8> {
    let mut seen = [false; 256];
    for ctx in contexts {
        let slot = &mut seen[ctx.id as usize];
        if *slot {
            return Some(ctx.id);
        }
        *slot = true;
    }
    None
}

fn check_peer_pdu_length(len: u32) -> std::result::Result<(), String> {
    if len != 0 && len < MIN_PEER_PDU_LENGTH {
        return Err(format!(
            "peer maximum PDU length {} is below {}",
            len, MIN_PEER_PDU_LENGTH
        ));
    }
    Ok(())
}

/// Build the capability table from an accept PDU, checking it answers our proposal
fn check_acceptance(
    proposal: &[ProposedContext],
    ac: &AssociateAc,
) -> std::result::Result<CapabilityTable, String> {
    let mut accepted = Vec::new();
    let mut answered = [false; 256];
    for result in &ac.results {
        let Some(proposed) = proposal.iter().find(|ctx| ctx.id == result.id) else {
            return Err(format!("result for context {} which was never proposed", result.id));
        };
        if std::mem::replace(&mut answered[result.id as usize], true) {
            return Err(format!("context {} answered twice", result.id));
        }
        if result.outcome != ContextOutcome::Acceptance {
            continue;
        }
        if result.capability != proposed.capability {
            return Err(format!(
                "context {} accepted as '{}' but proposed as '{}'",
                result.id, result.capability, proposed.capability
            ));
        }
        let encoding = match &result.encoding {
            Some(encoding) if proposed.encodings.contains(encoding) => encoding.clone(),
            Some(encoding) => {
                return Err(format!(
                    "context {} accepted with unproposed encoding '{}'",
                    result.id, encoding
                ))
            }
            None => return Err(format!("context {} accepted without an encoding", result.id)),
        };
        accepted.push(AcceptedCapability {
            context_id: result.id,
            capability: result.capability.clone(),
            encoding,
            extended: result.extended.clone(),
        });
    }
    if accepted.is_empty() {
        return Err("accept PDU accepted no capability".to_string());
    }
    Ok(CapabilityTable::new(accepted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::ContextResult;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = AssociationState::Idle;
        for event in [
            Event::TransportOpened,
            Event::ProposalExchanged,
            Event::Accepted,
            Event::ReleaseStarted,
            Event::ReleaseCompleted,
        ] {
            state = state.on(event).unwrap();
        }
        assert_eq!(state, AssociationState::Closed);
    }

    #[test]
    fn test_reject_closes_from_negotiating() {
        assert_eq!(
            AssociationState::Negotiating.on(Event::Rejected).unwrap(),
            AssociationState::Closed
        );
        assert!(AssociationState::Established.on(Event::Rejected).is_err());
    }

    #[test]
    fn test_abort_from_any_live_state() {
        use AssociationState::*;
        for state in [Idle, Connecting, Negotiating, Established, Releasing] {
            assert_eq!(state.on(Event::Abort).unwrap(), Aborted);
        }
        assert!(Closed.on(Event::Abort).is_err());
        assert!(Aborted.on(Event::Abort).is_err());
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let err = AssociationState::Idle.on(Event::Accepted).unwrap_err();
        assert!(matches!(
            err,
            UlError::InvalidTransition {
                from: AssociationState::Idle,
                event: "accepted"
            }
        ));
        assert!(AssociationState::Connecting.on(Event::ReleaseStarted).is_err());
    }

    #[test]
    fn test_duplicate_context_detection() {
        let contexts = vec![
            ProposedContext::new(1, "A", vec!["RAW".into()]),
            ProposedContext::new(3, "B", vec!["RAW".into()]),
            ProposedContext::new(1, "C", vec!["RAW".into()]),
        ];
        assert_eq!(duplicate_context(&contexts), Some(1));
        assert_eq!(duplicate_context(&contexts[..2]), None);
    }

    fn ac(results: Vec<ContextResult>) -> AssociateAc {
        AssociateAc {
            protocol_version: PROTOCOL_VERSION,
            calling_entity: "A".into(),
            called_entity: "B".into(),
            max_pdu_length: 16384,
            results,
        }
    }

    fn accepted(id: u8, capability: &str, encoding: &str) -> ContextResult {
        ContextResult {
            id,
            outcome: ContextOutcome::Acceptance,
            capability: capability.into(),
            encoding: Some(encoding.into()),
            extended: None,
        }
    }

    #[test]
    fn test_check_acceptance() {
        let proposal = vec![
            ProposedContext::new(1, "STORE", vec!["RAW".into()]),
            ProposedContext::new(3, "NOTIFY", vec!["RAW".into()]),
        ];
        let rejected = ContextResult {
            id: 3,
            outcome: ContextOutcome::CapabilityNotSupported,
            capability: "NOTIFY".into(),
            encoding: None,
            extended: None,
        };
        let table = check_acceptance(&proposal, &ac(vec![accepted(1, "STORE", "RAW"), rejected]))
            .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains("STORE"));

        assert!(check_acceptance(&proposal, &ac(vec![accepted(5, "STORE", "RAW")])).is_err());
        assert!(check_acceptance(&proposal, &ac(vec![accepted(1, "STORE", "JPEG")])).is_err());
        assert!(check_acceptance(&proposal, &ac(vec![accepted(1, "NOTIFY", "RAW")])).is_err());
        assert!(check_acceptance(&proposal, &ac(vec![])).is_err());
    }

    #[test]
    fn test_peer_pdu_length_bounds() {
        assert!(check_peer_pdu_length(0).is_ok());
        assert!(check_peer_pdu_length(MIN_PEER_PDU_LENGTH).is_ok());
        assert!(check_peer_pdu_length(16).is_err());
    }

    #[test]
    fn test_close_reason_maps_to_error() {
        assert!(matches!(CloseReason::Released.to_error(), UlError::Released));
        let reason = CloseReason::Aborted {
            origin: AbortOrigin::Fault,
            reason: None,
            detail: "gone".into(),
        };
        assert!(reason.to_error().is_connection_failure());
        assert_eq!(reason.to_string(), "aborted (fault): gone");
    }

    #[tokio::test]
    async fn test_new_association_is_idle() {
        let (io, _peer) = tokio::io::duplex(1024);
        let association = Association::requester(io, AssociationOptions::default());
        assert_eq!(association.state(), AssociationState::Idle);
        assert!(association.capabilities().is_none());
        assert!(association.send_fragment_size() > 0);
        assert!(matches!(
            association.ensure_established(),
            Err(UlError::NotEstablished(AssociationState::Idle))
        ));
    }

    #[tokio::test]
    async fn test_abort_before_negotiation() {
        let (io, _peer) = tokio::io::duplex(1024);
        let association = Association::requester(io, AssociationOptions::default());
        association.abort().await.unwrap();
        assert_eq!(association.state(), AssociationState::Aborted);
        assert!(matches!(
            association.closed().await,
            CloseReason::Aborted {
                origin: AbortOrigin::Local,
                ..
            }
        ));
        assert!(association.abort().await.is_err());
    }
}
