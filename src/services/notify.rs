//! Availability update notifications
//!
//! A peer reports that the instances of a study changed availability, for
//! example after they were migrated to nearline storage. The update is
//! validated, the optional retrieve location is probed, and the update is
//! handed to an [`AvailabilityNotifier`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use ulink::types::tags;
use ulink::{HandlerError, Message, Reply, RequestContext, ServiceHandler};

use crate::probe::{Availability, CapacityProbe};

/// Availability of a study's instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAvailability {
    Online,
    Nearline,
    Offline,
    Unavailable,
}

impl InstanceAvailability {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceAvailability::Online => "ONLINE",
            InstanceAvailability::Nearline => "NEARLINE",
            InstanceAvailability::Offline => "OFFLINE",
            InstanceAvailability::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for InstanceAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceAvailability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ONLINE" => Ok(InstanceAvailability::Online),
            "NEARLINE" => Ok(InstanceAvailability::Nearline),
            "OFFLINE" => Ok(InstanceAvailability::Offline),
            "UNAVAILABLE" => Ok(InstanceAvailability::Unavailable),
            other => Err(format!(
                "'{}' is not one of ONLINE, NEARLINE, OFFLINE, UNAVAILABLE",
                other
            )),
        }
    }
}

/// One accepted availability update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityUpdate {
    pub study_instance_uid: String,
    pub availability: InstanceAvailability,
    pub retrieve_location: Option<String>,
    /// Calling entity of the association the update arrived on
    pub reported_by: String,
    pub received_at: DateTime<Utc>,
}

/// Receives validated availability updates
#[async_trait]
pub trait AvailabilityNotifier: Send + Sync {
    async fn record(&self, update: AvailabilityUpdate) -> Result<(), String>;
}

/// Keeps the latest update per study in memory
#[derive(Debug, Default)]
pub struct InMemoryAvailabilityLedger {
    latest: RwLock<HashMap<String, AvailabilityUpdate>>,
}

impl InMemoryAvailabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, study_instance_uid: &str) -> Option<AvailabilityUpdate> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(study_instance_uid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AvailabilityNotifier for InMemoryAvailabilityLedger {
    async fn record(&self, update: AvailabilityUpdate) -> Result<(), String> {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        // Out-of-order delivery must not roll a study back to an older state.
        if let Some(current) = latest.get(&update.study_instance_uid) {
            if current.received_at > update.received_at {
                return Ok(());
            }
        }
        latest.insert(update.study_instance_uid.clone(), update);
        Ok(())
    }
}

pub struct NotifyHandler {
    notifier: Arc<dyn AvailabilityNotifier>,
    probe: Arc<dyn CapacityProbe>,
}

impl NotifyHandler {
    pub fn new(notifier: Arc<dyn AvailabilityNotifier>, probe: Arc<dyn CapacityProbe>) -> Self {
        Self { notifier, probe }
    }
}

fn required_text(request: &Message, tag: u32) -> Result<&str, HandlerError> {
    match request.command.text(tag).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(HandlerError::MissingAttribute(tag)),
    }
}

#[async_trait]
impl ServiceHandler for NotifyHandler {
    async fn handle(&self, ctx: &RequestContext, request: &Message) -> Result<Reply, HandlerError> {
        let study = required_text(request, tags::STUDY_INSTANCE_UID)?;
        let availability: InstanceAvailability = required_text(request, tags::INSTANCE_AVAILABILITY)?
            .parse()
            .map_err(|e| HandlerError::invalid(tags::INSTANCE_AVAILABILITY, e))?;

        let location = request
            .command
            .text(tags::RETRIEVE_LOCATION)
            .map(str::trim)
            .filter(|l| !l.is_empty());
        if let Some(location) = location {
            match self.probe.probe(location).await {
                Availability::Available => {}
                Availability::Unavailable => {
                    return Err(HandlerError::Unavailable(format!(
                        "location '{}' cannot take data",
                        location
                    )))
                }
                Availability::Unknown => {
                    return Err(HandlerError::invalid(
                        tags::RETRIEVE_LOCATION,
                        format!("unknown location '{}'", location),
                    ))
                }
            }
        }

        let update = AvailabilityUpdate {
            study_instance_uid: study.to_string(),
            availability,
            retrieve_location: location.map(str::to_string),
            reported_by: ctx.calling_entity.clone(),
            received_at: Utc::now(),
        };
        self.notifier
            .record(update)
            .await
            .map_err(HandlerError::Processing)?;

        info!(
            association = %ctx.association_id,
            study,
            %availability,
            "Availability update from {}",
            ctx.calling_entity
        );
        Ok(Reply::success().attribute(tags::STUDY_INSTANCE_UID, study))
    }
}
