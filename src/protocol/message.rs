use crate::connection::Connection;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where a message entered the process. Not part of the wire envelope.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Peer address as reported by the transport
    pub source: String,
    /// Connection the message arrived on; handlers reply through it
    pub connection: Connection,
}

impl Origin {
    pub fn from_connection(connection: &Connection) -> Self {
        Self {
            source: connection.source().to_string(),
            connection: connection.clone(),
        }
    }
}

/// Application-level unit of work.
///
/// Routing uses `(scheme, tag, kind)`: one handler lookup per entry in `tags`.
/// `sync` messages are executed one at a time in arrival order; the rest run
/// concurrently under the dispatcher's budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub scheme: u32,
    pub tags: Vec<u32>,
    #[serde(rename = "type")]
    pub kind: u32,
    pub sync: bool,
    pub payload: Bytes,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl Message {
    pub fn new(scheme: u32, kind: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            scheme,
            tags: Vec::new(),
            kind,
            sync: false,
            payload: payload.into(),
            origin: None,
        }
    }

    /// Wrap an uninterpreted payload from a raw-protocol packet.
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self::new(0, 0, payload)
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = u32>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Connection the message arrived on, if it came from a pipeline.
    pub fn connection(&self) -> Option<&Connection> {
        self.origin.as_ref().map(|o| &o.connection)
    }
}

// Origin is delivery metadata and takes no part in equality.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.tags == other.tags
            && self.kind == other.kind
            && self.sync == other.sync
            && self.payload == other.payload
    }
}

impl Eq for Message {}
