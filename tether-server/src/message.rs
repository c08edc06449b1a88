//! The application-level message envelope.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use tether_wire::Value;

use crate::session::Session;

/// A decoded inbound message.
#[derive(Clone)]
pub struct Message {
    /// The decoded value.
    pub contents: Value,
    /// The session that produced it.
    pub author: Arc<Session>,
    /// Peer-reported send time, taken from the frame.
    pub sent_at: DateTime<Utc>,
    /// Local time the frame arrived.
    pub received_at: DateTime<Utc>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("contents", &self.contents)
            .field("author", &self.author.id())
            .field("sent_at", &self.sent_at)
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// Convert the wire's IEEE-754 Unix seconds into a timestamp.
///
/// The value is peer-controlled; anything non-finite clamps to the epoch.
pub(crate) fn datetime_from_unix(seconds: f64) -> DateTime<Utc> {
    Utc.timestamp_nanos((seconds * 1e9) as i64)
}
