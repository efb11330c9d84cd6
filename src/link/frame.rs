use std::fmt::{Debug, Formatter};

use bytes::Bytes;

use crate::link::identity::{Endpoint, Target};

/// Numeric identifier that the bus dispatches on: each message type on the wire has a
///  well-known id, and receivers pick the frames they know how to decode.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u16);
impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Msg#{}", self.0)
    }
}

/// One decoded message as it travels over the bus: the addressed envelope plus the
///  message-type specific payload bytes.
///
/// The sender endpoint and the link-level sequence number are stamped by whoever sends the
///  frame; constructing a frame only fixes the parts the application decides.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub message_id: MessageId,
    pub sender: Endpoint,
    pub target: Target,
    /// Link-level sequence counter of the sender. Purely diagnostic on a lossy bus - no
    ///  ordering is reconstructed from it.
    pub sequence: u8,
    pub payload: Bytes,
}
impl Frame {
    pub fn new(message_id: MessageId, target: Target, payload: Bytes) -> Frame {
        Frame {
            message_id,
            sender: Endpoint::new(0, 0),
            target,
            sequence: 0,
            payload,
        }
    }
}
