//! Normalized address-change events.

use std::collections::BTreeSet;
use std::fmt;

/// The kind of change an [`AddressEvent`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// An object appeared, or the initial snapshot of a namespace.
    Added,
    /// An object changed, or a resync replaced the namespace snapshot.
    Modified,
    /// An object disappeared.
    Deleted,
    /// Recovery keeps failing; `ips` is the last known (possibly stale) set.
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        })
    }
}

/// One observed change to the reachable address set of an application in a namespace.
///
/// `ips` always holds the complete address set after the change, sorted and
/// without duplicates. Identical consecutive sets are delivered as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressEvent {
    /// Namespace the change was observed in.
    pub namespace: String,
    /// Every routable address of the application in `namespace`.
    pub ips: Vec<String>,
    /// What kind of change produced this event.
    pub event_type: EventType,
}

impl AddressEvent {
    pub(crate) fn new(
        namespace: impl Into<String>,
        ips: impl IntoIterator<Item = String>,
        event_type: EventType,
    ) -> Self {
        let ips: BTreeSet<String> = ips.into_iter().collect();
        Self {
            namespace: namespace.into(),
            ips: ips.into_iter().collect(),
            event_type,
        }
    }

    /// Returns `true` if this event reports a recovery failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.event_type == EventType::Error
    }
}
