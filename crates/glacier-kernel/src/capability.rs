//! Capability markers
//!
//! A plugin type becomes visible to the host by declaring one or more marker
//! capabilities. Service markers put the type into the dependency container,
//! module markers hand it to the matching module subsystem.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

/// Identity of a capability marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(Cow<'static, str>);

impl CapabilityId {
    /// Service owned by a single plugin
    pub const CUSTOM_SERVICE: CapabilityId = CapabilityId(Cow::Borrowed("CustomService"));
    /// Service meant to be consumed by other plugins
    pub const SHARED_SERVICE: CapabilityId = CapabilityId(Cow::Borrowed("SharedService"));
    /// Text command module
    pub const COMMAND_MODULE: CapabilityId = CapabilityId(Cow::Borrowed("CommandModule"));
    /// Slash-command / component interaction module
    pub const INTERACTION_MODULE: CapabilityId = CapabilityId(Cow::Borrowed("InteractionModule"));

    /// Create a capability id from any string
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Marker name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CapabilityId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// The set of service markers the capability scanner recognizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    markers: BTreeSet<CapabilityId>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            markers: [CapabilityId::CUSTOM_SERVICE, CapabilityId::SHARED_SERVICE]
                .into_iter()
                .collect(),
        }
    }
}

impl CapabilitySet {
    /// Recognize the default service markers
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognize nothing
    pub fn empty() -> Self {
        Self {
            markers: BTreeSet::new(),
        }
    }

    /// Add a recognized marker
    pub fn with_marker(mut self, marker: impl Into<CapabilityId>) -> Self {
        self.markers.insert(marker.into());
        self
    }

    /// Check whether a single marker is recognized
    pub fn contains(&self, marker: &CapabilityId) -> bool {
        self.markers.contains(marker)
    }

    /// First recognized marker among the declared ones, in declaration order
    pub fn first_match<'a>(&self, declared: &'a [CapabilityId]) -> Option<&'a CapabilityId> {
        declared.iter().find(|c| self.markers.contains(*c))
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityId> {
        self.markers.iter()
    }
}

/// What the capability scanner does when two implementations claim one contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first implementation seen in enumeration order, drop later ones
    #[default]
    FirstWins,
    /// Treat a second implementation as an error for the whole rescan
    Reject,
}
