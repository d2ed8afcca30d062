//! Capability negotiation
//!
//! [`negotiate`] is a pure function of a proposal and the local
//! [`AcceptancePolicy`]. For each proposed capability the policy's
//! encodings are walked in preference order and the first one the peer
//! also offered wins. Results keep the proposal's order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::pdu::{ContextOutcome, ContextResult, ProposedContext, RejectReason};

/// What the extended negotiation callback made of a proposed blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedReply {
    /// The capability is not understood; the blob is echoed unmodified
    Unrecognized,
    /// Answer with this blob
    Reply(Bytes),
    /// Accept the capability but send no blob back
    Omit,
}

/// Hook for extended negotiation blobs such as role selection
pub trait ExtendedNegotiation: Send + Sync {
    fn negotiate(&self, capability: &str, proposed: &Bytes) -> ExtendedReply;
}

/// Local support for a single capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityPolicy {
    /// Supported encodings, most preferred first
    pub encodings: Vec<String>,
    /// When set, failing to accept this capability rejects the whole association
    pub mandatory: bool,
}

impl CapabilityPolicy {
    pub fn new<I, S>(encodings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            encodings: encodings.into_iter().map(Into::into).collect(),
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// What the local side is willing to accept. Read-only once associations exist.
#[derive(Clone, Default)]
pub struct AcceptancePolicy {
    capabilities: HashMap<String, CapabilityPolicy>,
    extended: Option<Arc<dyn ExtendedNegotiation>>,
}

impl fmt::Debug for AcceptancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptancePolicy")
            .field("capabilities", &self.capabilities)
            .field("extended", &self.extended.is_some())
            .finish()
    }
}

impl AcceptancePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace support for a capability
    pub fn with_capability(mut self, capability: impl Into<String>, policy: CapabilityPolicy) -> Self {
        self.capabilities.insert(capability.into(), policy);
        self
    }

    pub fn with_extended_negotiation(mut self, hook: Arc<dyn ExtendedNegotiation>) -> Self {
        self.extended = Some(hook);
        self
    }

    pub fn capability(&self, capability: &str) -> Option<&CapabilityPolicy> {
        self.capabilities.get(capability)
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    fn mandatory(&self) -> impl Iterator<Item = &str> {
        self.capabilities
            .iter()
            .filter(|(_, p)| p.mandatory)
            .map(|(name, _)| name.as_str())
    }
}

/// A capability that survived negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCapability {
    pub context_id: u8,
    pub capability: String,
    pub encoding: String,
    pub extended: Option<Bytes>,
}

/// A capability turned down individually
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCapability {
    pub context_id: u8,
    pub capability: String,
    pub outcome: ContextOutcome,
}

/// Accepted and rejected subsets of a proposal, both in proposal order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub accepted: Vec<AcceptedCapability>,
    pub rejected: Vec<RejectedCapability>,
}

impl NegotiationOutcome {
    /// One result per proposed context, as sent back in the accept PDU
    pub fn context_results(&self, proposal: &[ProposedContext]) -> Vec<ContextResult> {
        proposal
            .iter()
            .map(|ctx| {
                if let Some(accepted) = self.accepted.iter().find(|a| a.context_id == ctx.id) {
                    ContextResult {
                        id: ctx.id,
                        outcome: ContextOutcome::Acceptance,
                        capability: ctx.capability.clone(),
                        encoding: Some(accepted.encoding.clone()),
                        extended: accepted.extended.clone(),
                    }
                } else {
                    let outcome = self
                        .rejected
                        .iter()
                        .find(|r| r.context_id == ctx.id)
                        .map(|r| r.outcome)
                        .unwrap_or(ContextOutcome::NoReason);
                    ContextResult {
                        id: ctx.id,
                        outcome,
                        capability: ctx.capability.clone(),
                        encoding: None,
                        extended: None,
                    }
                }
            })
            .collect()
    }
}

/// Intersect `proposal` with `policy`.
///
/// Returns `Err(MandatoryCapabilityUnmet)` when a capability the policy
/// marks mandatory is absent or has no common encoding. An outcome with no
/// accepted capability is still `Ok`; the caller decides what that means.
pub fn negotiate(
    proposal: &[ProposedContext],
    policy: &AcceptancePolicy,
) -> Result<NegotiationOutcome, RejectReason> {
    let mut outcome = NegotiationOutcome::default();

    for ctx in proposal {
        let Some(supported) = policy.capability(&ctx.capability) else {
            outcome.rejected.push(RejectedCapability {
                context_id: ctx.id,
                capability: ctx.capability.clone(),
                outcome: ContextOutcome::CapabilityNotSupported,
            });
            continue;
        };

        let chosen = supported
            .encodings
            .iter()
            .find(|encoding| ctx.encodings.contains(encoding));

        match chosen {
            Some(encoding) => {
                let extended = match (&ctx.extended, &policy.extended) {
                    (None, _) => None,
                    (Some(blob), None) => Some(blob.clone()),
                    (Some(blob), Some(hook)) => match hook.negotiate(&ctx.capability, blob) {
                        ExtendedReply::Unrecognized => Some(blob.clone()),
                        ExtendedReply::Reply(reply) => Some(reply),
                        ExtendedReply::Omit => None,
                    },
                };
                outcome.accepted.push(AcceptedCapability {
                    context_id: ctx.id,
                    capability: ctx.capability.clone(),
                    encoding: encoding.clone(),
                    extended,
                });
            }
            None if supported.mandatory => return Err(RejectReason::MandatoryCapabilityUnmet),
            None => outcome.rejected.push(RejectedCapability {
                context_id: ctx.id,
                capability: ctx.capability.clone(),
                outcome: ContextOutcome::EncodingsNotSupported,
            }),
        }
    }

    for required in policy.mandatory() {
        if !outcome.accepted.iter().any(|a| a.capability == required) {
            return Err(RejectReason::MandatoryCapabilityUnmet);
        }
    }

    Ok(outcome)
}

/// Negotiated capabilities of one association, keyed by context id.
/// Published read-only once the association is established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    by_context: BTreeMap<u8, AcceptedCapability>,
}

impl CapabilityTable {
    pub fn new(accepted: impl IntoIterator<Item = AcceptedCapability>) -> Self {
        Self {
            by_context: accepted.into_iter().map(|a| (a.context_id, a)).collect(),
        }
    }

    pub fn by_context(&self, context_id: u8) -> Option<&AcceptedCapability> {
        self.by_context.get(&context_id)
    }

    /// First accepted context for the capability, lowest context id first
    pub fn by_capability(&self, capability: &str) -> Option<&AcceptedCapability> {
        self.by_context.values().find(|a| a.capability == capability)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.by_capability(capability).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AcceptedCapability> {
        self.by_context.values()
    }

    pub fn len(&self) -> usize {
        self.by_context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_context.is_empty()
    }
}
