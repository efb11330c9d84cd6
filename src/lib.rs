//! A request/response micro-protocol layer on top of an asynchronous, lossy, broadcast-style
//!  packet bus, plus a remote file-transfer subprotocol built on that layer.
//!
//! The bus itself (wire codec, framing, checksums) is an external collaborator behind the
//!  [link::LinkConnection] trait: it delivers decoded, addressed frames and accepts frames to
//!  send, with no guarantees beyond "most frames arrive". Everything in this crate is about
//!  reconstructing reliable semantics on top of that:
//!
//! * [microservice::CallEngine] correlates one outgoing frame with a predicate-matched incoming
//!   frame, with per-attempt timeout, a bounded retry budget and cooperative cancellation. It
//!   also exposes a filtered publish/subscribe view of the bus for unsolicited traffic.
//! * [microservice::CommandServer] accepts inbound command requests, serializes execution to a
//!   single in-flight command, de-duplicates retried requests and always answers with an
//!   acknowledgement.
//! * [ftp] implements both sides of the file-transfer subprotocol: session-based directory
//!   listing, chunked read/write, CRC verification, streaming "burst" reads with out-of-order
//!   completion, rename and truncate - all recovering from duplicated, lost or reordered frames
//!   using only a fixed 12-byte header per frame.

pub mod ftp;
pub mod link;
pub mod microservice;
pub mod test_util;
pub mod util;
