use serde::{Deserialize, Serialize};

use crate::domain::{Delivery, DeliveryId};

/// One element of a live-query event sequence.
///
/// A subscription always starts with a `Snapshot` of everything currently
/// matching its filter, then delivers deltas relative to that view. After a
/// gap in the change feed the store re-emits a fresh `Snapshot`; consumers
/// must treat it as a full replacement of their local view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Snapshot(Vec<Delivery>),
    /// A delivery newly entered the subscribed view.
    Added(Delivery),
    /// A delivery already in the view changed.
    Modified(Delivery),
    /// A delivery left the view (e.g. a pending delivery was claimed).
    Removed(DeliveryId),
}
