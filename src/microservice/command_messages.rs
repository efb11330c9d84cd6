use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::link::MessageId;

pub const COMMAND_REQUEST_MESSAGE_ID: MessageId = MessageId(76);
pub const COMMAND_ACK_MESSAGE_ID: MessageId = MessageId(77);

/// A request to execute a numbered command. `confirmation` starts at 0 and is incremented
///  on every resend of the same logical request, letting the server tell a retry from a
///  new invocation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommandRequest {
    pub command: u16,
    pub confirmation: u8,
    pub args: Bytes,
}
impl CommandRequest {
    pub fn new(command: u16, args: Bytes) -> CommandRequest {
        CommandRequest {
            command,
            confirmation: 0,
            args,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.command);
        buf.put_u8(self.confirmation);
        buf.put_slice(&self.args);
    }

    pub fn ser_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: impl Buf) -> anyhow::Result<CommandRequest> {
        let command = buf.try_get_u16_le()?;
        let confirmation = buf.try_get_u8()?;
        let args = buf.copy_to_bytes(buf.remaining());
        Ok(CommandRequest {
            command,
            confirmation,
            args,
        })
    }
}

/// The outcome a server reports for a command request.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandResult {
    Accepted = 0,
    TemporarilyRejected = 1,
    Unsupported = 3,
    Failed = 4,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandAck {
    pub command: u16,
    pub result: CommandResult,
}
impl CommandAck {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.command);
        buf.put_u8(self.result.into());
    }

    pub fn ser_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: impl Buf) -> anyhow::Result<CommandAck> {
        let command = buf.try_get_u16_le()?;
        let raw_result = buf.try_get_u8()?;
        let result = CommandResult::try_from(raw_result)
            .map_err(|_| anyhow!("invalid command result {}", raw_result))?;
        Ok(CommandAck { command, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_args(400, 0, b"")]
    #[case::with_args(17, 3, b"\x01\x02\x03\x04")]
    fn test_command_request_ser_deser(#[case] command: u16, #[case] confirmation: u8, #[case] args: &'static [u8]) {
        let request = CommandRequest {
            command,
            confirmation,
            args: Bytes::from_static(args),
        };
        let deserialized = CommandRequest::deser(request.ser_to_bytes()).unwrap();
        assert_eq!(deserialized, request);
    }

    #[rstest]
    #[case::accepted(CommandResult::Accepted)]
    #[case::temporarily_rejected(CommandResult::TemporarilyRejected)]
    #[case::unsupported(CommandResult::Unsupported)]
    #[case::failed(CommandResult::Failed)]
    fn test_command_ack_ser_deser(#[case] result: CommandResult) {
        let ack = CommandAck { command: 520, result };
        let deserialized = CommandAck::deser(ack.ser_to_bytes()).unwrap();
        assert_eq!(deserialized, ack);
    }

    #[test]
    fn test_command_ack_invalid_result() {
        assert!(CommandAck::deser(Bytes::from_static(b"\x08\x02\x02")).is_err());
    }

    #[test]
    fn test_deser_truncated() {
        assert!(CommandRequest::deser(Bytes::from_static(b"\x01\x00")).is_err());
        assert!(CommandAck::deser(Bytes::from_static(b"\x01\x00")).is_err());
    }
}
