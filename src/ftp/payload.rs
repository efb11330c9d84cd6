use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::link::{Frame, MessageId, Target};
use crate::util::safe_converter::PrecheckedCast;

pub const FTP_MESSAGE_ID: MessageId = MessageId(110);

/// Fixed length of the FTP payload on the wire: 12 bytes of header plus [MAX_DATA_SIZE]
///  bytes of data, always padded to full length.
pub const PAYLOAD_LEN: usize = 251;
/// Largest data block a single FTP payload can carry.
pub const MAX_DATA_SIZE: usize = 239;

/// Flag bit in the burst byte marking the last packet of a burst.
const BURST_COMPLETE_BIT: u8 = 0x80;

#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FtpOpcode {
    None = 0,
    TerminateSession = 1,
    ResetSessions = 2,
    ListDirectory = 3,
    OpenFileRo = 4,
    ReadFile = 5,
    CreateFile = 6,
    WriteFile = 7,
    RemoveFile = 8,
    CreateDirectory = 9,
    RemoveDirectory = 10,
    OpenFileWo = 11,
    TruncateFile = 12,
    Rename = 13,
    CalcFileCrc32 = 14,
    BurstReadFile = 15,
    Ack = 128,
    Nak = 129,
}

/// Error codes a server reports in the first data byte of a Nak reply.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NakError {
    None = 0,
    Fail = 1,
    /// Fail with an OS errno in the second data byte
    FailErrno = 2,
    InvalidDataSize = 3,
    InvalidSession = 4,
    NoSessionsAvailable = 5,
    Eof = 6,
    UnknownCommand = 7,
    FileExists = 8,
    FileProtected = 9,
    FileNotFound = 10,
}

/// One FTP packet, tunneled as opaque payload through a single bus message type.
///
/// `sequence_number` correlates replies with requests: a server answers with the request's
///  sequence number plus one (wrapping), and echoes the originating opcode in
///  `request_opcode` so clients can match replies without per-request state on the server.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FtpPayload {
    pub sequence_number: u16,
    pub session: u8,
    pub opcode: FtpOpcode,
    /// Size in bytes the operation refers to. NOT always `data.len()`: read requests carry
    ///  the requested size with empty data.
    pub size: u8,
    pub request_opcode: FtpOpcode,
    pub burst_complete: bool,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl FtpPayload {
    pub fn new(opcode: FtpOpcode, sequence_number: u16) -> FtpPayload {
        FtpPayload {
            sequence_number,
            session: 0,
            opcode,
            size: 0,
            request_opcode: FtpOpcode::None,
            burst_complete: false,
            offset: 0,
            data: Vec::new(),
        }
    }

    /// Sets both the data block and the size field from it.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.size = data.len().prechecked_cast();
        self.data = data;
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.sequence_number);
        buf.put_u8(self.session);
        buf.put_u8(self.opcode.into());
        buf.put_u8(self.size);
        buf.put_u8(self.request_opcode.into());
        buf.put_u8(if self.burst_complete { BURST_COMPLETE_BIT } else { 0 });
        buf.put_u8(0); // padding
        buf.put_u32_le(self.offset);
        buf.put_slice(&self.data);
        for _ in self.data.len()..MAX_DATA_SIZE {
            buf.put_u8(0);
        }
    }

    pub fn deser(mut buf: impl Buf) -> anyhow::Result<FtpPayload> {
        let sequence_number = buf.try_get_u16_le()?;
        let session = buf.try_get_u8()?;
        let raw_opcode = buf.try_get_u8()?;
        let opcode = FtpOpcode::try_from(raw_opcode)
            .map_err(|_| anyhow!("invalid ftp opcode {}", raw_opcode))?;
        let size = buf.try_get_u8()?;
        let raw_request_opcode = buf.try_get_u8()?;
        let request_opcode = FtpOpcode::try_from(raw_request_opcode)
            .map_err(|_| anyhow!("invalid ftp request opcode {}", raw_request_opcode))?;
        let burst = buf.try_get_u8()?;
        let _padding = buf.try_get_u8()?;
        let offset = buf.try_get_u32_le()?;
        // The size field is carried verbatim even when it exceeds the data block: requests
        //  with an out-of-range size are answered with a Nak, not dropped in the codec.
        let data_len = (size as usize).min(MAX_DATA_SIZE);
        if buf.remaining() < data_len {
            bail!("ftp payload truncated: size field {} but only {} data bytes", size, buf.remaining());
        }
        let mut data = vec![0u8; data_len];
        buf.copy_to_slice(&mut data);

        Ok(FtpPayload {
            sequence_number,
            session,
            opcode,
            size,
            request_opcode,
            burst_complete: burst & BURST_COMPLETE_BIT != 0,
            offset,
            data,
        })
    }

    pub fn is_nak(&self) -> bool {
        self.opcode == FtpOpcode::Nak
    }

    /// The error code (and errno, if reported) carried by a Nak payload.
    pub fn nak_error(&self) -> Option<(NakError, Option<u8>)> {
        if !self.is_nak() {
            return None;
        }
        let error = self.data.first()
            .and_then(|&raw| NakError::try_from(raw).ok())
            .unwrap_or(NakError::None);
        let errno = if error == NakError::FailErrno {
            self.data.get(1).copied()
        } else {
            None
        };
        Some((error, errno))
    }

    /// The u32 at the start of the data block, as replies to OpenFileRo and CalcFileCrc32
    ///  carry it.
    pub fn data_u32(&self) -> anyhow::Result<u32> {
        let mut buf = self.data.as_slice();
        Ok(buf.try_get_u32_le()?)
    }

    /// First offset past this packet's data block.
    pub fn data_end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }

    pub fn data_str(&self) -> anyhow::Result<&str> {
        Ok(std::str::from_utf8(&self.data)?)
    }
}

/// The FTP payload plus the network id, which is the part of the tunnel envelope that the
///  generic frame addressing does not cover.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FtpMessage {
    pub network: u8,
    pub payload: FtpPayload,
}

impl FtpMessage {
    pub fn into_frame(self, target: Target) -> Frame {
        let mut buf = BytesMut::with_capacity(1 + PAYLOAD_LEN);
        buf.put_u8(self.network);
        self.payload.ser(&mut buf);
        Frame::new(FTP_MESSAGE_ID, target, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> anyhow::Result<FtpMessage> {
        FtpMessage::deser(frame.payload.clone())
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<FtpMessage> {
        let network = buf.try_get_u8()?;
        let payload = FtpPayload::deser(buf)?;
        Ok(FtpMessage { network, payload })
    }
}
