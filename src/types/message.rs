use bytes::Bytes;

/// A message handed back by a successful reserve.
///
/// The daemon keeps ownership of the message until it is deleted, released or
/// buried; its metadata (ttr, priority, counters) lives daemon-side and is
/// read through `stats-job` when needed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawMessage {
    pub id: u64,
    pub body: Bytes,
}

impl RawMessage {
    pub fn new(id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }
}
