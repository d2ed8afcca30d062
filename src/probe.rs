//! Administrative probe answering whether a storage location can take data

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::config::LocationConfig;

/// Answer of [`CapacityProbe::probe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
    /// The location is not known to this node
    Unknown,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Availability::Available => "available",
            Availability::Unavailable => "unavailable",
            Availability::Unknown => "unknown",
        })
    }
}

#[async_trait]
pub trait CapacityProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, location: &str) -> Availability;
}

/// Probes named directories: a location is available when its directory
/// exists and is writable.
#[derive(Debug, Clone, Default)]
pub struct FilesystemProbe {
    locations: BTreeMap<String, PathBuf>,
}

impl FilesystemProbe {
    pub fn new(locations: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            locations: locations.into_iter().collect(),
        }
    }

    pub fn from_config(locations: &BTreeMap<String, LocationConfig>) -> Self {
        Self::new(
            locations
                .iter()
                .map(|(name, location)| (name.clone(), location.path.clone())),
        )
    }
}

#[async_trait]
impl CapacityProbe for FilesystemProbe {
    async fn probe(&self, location: &str) -> Availability {
        let Some(path) = self.locations.get(location) else {
            return Availability::Unknown;
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Availability::Available,
            Ok(_) => Availability::Unavailable,
            Err(e) => {
                debug!(location, path = %path.display(), error = %e, "Location probe failed");
                Availability::Unavailable
            }
        }
    }
}
