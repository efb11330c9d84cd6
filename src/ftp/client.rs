use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ftp::payload::{FtpMessage, FtpOpcode, FtpPayload, FTP_MESSAGE_ID, MAX_DATA_SIZE};
use crate::ftp::FtpError;
use crate::link::{ClientIdentity, LinkConnection, Target};
use crate::microservice::{CallEngine, CallOptions, FrameSubscription};
use crate::util::safe_converter::PrecheckedCast;

#[derive(Clone, Copy, Debug)]
pub struct FtpClientConfig {
    pub target_network: u8,
    /// Per attempt reply timeout. FTP packets are small and answered synchronously, so this
    ///  is far below a generic command timeout.
    pub timeout_per_attempt: Duration,
    pub attempts: u8,
}
impl Default for FtpClientConfig {
    fn default() -> Self {
        FtpClientConfig {
            target_network: 0,
            timeout_per_attempt: Duration::from_millis(110),
            attempts: 6,
        }
    }
}

/// One-packet-per-call FTP client: every method sends a single request payload and returns
///  the acknowledging payload, retrying per [FtpClientConfig]. Whole-file semantics live in
///  [crate::ftp::FtpTransfer] on top of this.
///
/// Replies are correlated by the echoed request opcode (plus session where one exists),
///  because a server may answer a retried request late, with a sequence number the client
///  has already moved past.
pub struct FtpClient {
    engine: CallEngine,
    config: FtpClientConfig,
    sequence_number: AtomicU16,
    /// session id of the most recently started burst, shared with burst subscriptions
    burst_session: Arc<AtomicU8>,
}

impl FtpClient {
    pub fn new(connection: Arc<dyn LinkConnection>, identity: ClientIdentity, config: FtpClientConfig) -> FtpClient {
        FtpClient {
            engine: CallEngine::new(connection, identity),
            config,
            sequence_number: AtomicU16::new(0),
            burst_session: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn config(&self) -> FtpClientConfig {
        self.config
    }

    fn next_sequence_number(&self) -> u16 {
        self.sequence_number.fetch_add(1, Ordering::SeqCst)
    }

    fn path_payload(&self, opcode: FtpOpcode, path: &str) -> Result<FtpPayload, FtpError> {
        if path.len() > MAX_DATA_SIZE {
            return Err(FtpError::InvalidRequest(format!("path exceeds {} bytes: {}", MAX_DATA_SIZE, path)));
        }
        let mut payload = FtpPayload::new(opcode, self.next_sequence_number());
        payload.set_data(path.as_bytes().to_vec());
        Ok(payload)
    }

    /// Sends `payload` and returns the server's reply to it: the first Ack or Nak payload
    ///  from the configured network that echoes the request's opcode (and, if
    ///  `session_filter` is set, its session).
    ///
    /// A Nak reply is returned as is - callers decide which Naks are errors.
    async fn ftp_call(
        &self,
        name: &'static str,
        payload: FtpPayload,
        session_filter: Option<u8>,
        cancel: &CancellationToken,
    ) -> Result<FtpPayload, FtpError> {
        let sent_opcode = payload.opcode;
        let network = self.config.target_network;
        let request = FtpMessage {
            network,
            payload,
        }.into_frame(Target::to(self.engine.identity().target));

        let options = CallOptions {
            attempts: self.config.attempts,
            timeout_per_attempt: self.config.timeout_per_attempt,
        };

        let reply_frame = self.engine.call(
            name,
            request,
            options,
            move |frame| {
                if frame.message_id != FTP_MESSAGE_ID {
                    return false;
                }
                let Ok(message) = FtpMessage::from_frame(frame) else {
                    return false;
                };
                message.network == network
                    && message.payload.request_opcode == sent_opcode
                    && session_filter.map(|s| message.payload.session == s).unwrap_or(true)
            },
            |frame| frame,
            cancel,
        ).await?;

        let message = FtpMessage::from_frame(&reply_frame)
            .map_err(|e| FtpError::Malformed { opcode: sent_opcode, message: e.to_string() })?;
        debug!("{}: reply {:?} ({} data bytes)", name, message.payload.opcode, message.payload.data.len());
        Ok(message.payload)
    }

    pub async fn none(&self, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = FtpPayload::new(FtpOpcode::None, self.next_sequence_number());
        self.ftp_call("ftp:none", payload, None, cancel).await
    }

    pub async fn terminate_session(&self, session: u8, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let mut payload = FtpPayload::new(FtpOpcode::TerminateSession, self.next_sequence_number());
        payload.session = session;
        self.ftp_call("ftp:terminate-session", payload, Some(session), cancel).await
    }

    pub async fn reset_sessions(&self, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = FtpPayload::new(FtpOpcode::ResetSessions, self.next_sequence_number());
        self.ftp_call("ftp:reset-sessions", payload, None, cancel).await
    }

    pub async fn list_directory(&self, path: &str, offset: u32, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let mut payload = self.path_payload(FtpOpcode::ListDirectory, path)?;
        payload.offset = offset;
        self.ftp_call("ftp:list-directory", payload, None, cancel).await
    }

    pub async fn open_file_ro(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::OpenFileRo, path)?;
        self.ftp_call("ftp:open-file-ro", payload, None, cancel).await
    }

    pub async fn read_file(&self, size: u8, offset: u32, session: u8, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let mut payload = FtpPayload::new(FtpOpcode::ReadFile, self.next_sequence_number());
        payload.session = session;
        payload.size = size;
        payload.offset = offset;
        self.ftp_call("ftp:read-file", payload, Some(session), cancel).await
    }

    pub async fn create_file(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::CreateFile, path)?;
        self.ftp_call("ftp:create-file", payload, None, cancel).await
    }

    pub async fn write_file(&self, data: &[u8], offset: u32, session: u8, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(FtpError::InvalidRequest(format!("write block of {} bytes exceeds maximum {}", data.len(), MAX_DATA_SIZE)));
        }
        let mut payload = FtpPayload::new(FtpOpcode::WriteFile, self.next_sequence_number());
        payload.session = session;
        payload.offset = offset;
        payload.set_data(data.to_vec());
        self.ftp_call("ftp:write-file", payload, Some(session), cancel).await
    }

    pub async fn remove_file(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::RemoveFile, path)?;
        self.ftp_call("ftp:remove-file", payload, None, cancel).await
    }

    pub async fn create_directory(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::CreateDirectory, path)?;
        self.ftp_call("ftp:create-directory", payload, None, cancel).await
    }

    pub async fn remove_directory(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::RemoveDirectory, path)?;
        self.ftp_call("ftp:remove-directory", payload, None, cancel).await
    }

    pub async fn open_file_wo(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::OpenFileWo, path)?;
        self.ftp_call("ftp:open-file-wo", payload, None, cancel).await
    }

    pub async fn truncate_file(&self, path: &str, offset: u32, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let mut payload = self.path_payload(FtpOpcode::TruncateFile, path)?;
        payload.offset = offset;
        self.ftp_call("ftp:truncate-file", payload, None, cancel).await
    }

    /// Renames `from` to `to`. Both paths travel in one data block, NUL separated.
    pub async fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        if from.len() + 1 + to.len() > MAX_DATA_SIZE {
            return Err(FtpError::InvalidRequest(format!("rename paths exceed {} bytes: {} -> {}", MAX_DATA_SIZE, from, to)));
        }
        let mut data = Vec::with_capacity(from.len() + 1 + to.len());
        data.extend_from_slice(from.as_bytes());
        data.push(0);
        data.extend_from_slice(to.as_bytes());

        let mut payload = FtpPayload::new(FtpOpcode::Rename, self.next_sequence_number());
        payload.set_data(data);
        self.ftp_call("ftp:rename", payload, None, cancel).await
    }

    pub async fn calc_file_crc32(&self, path: &str, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let payload = self.path_payload(FtpOpcode::CalcFileCrc32, path)?;
        self.ftp_call("ftp:calc-file-crc32", payload, None, cancel).await
    }

    /// Kicks off burst streaming on an open read session, starting at `offset`. The reply is
    ///  the first burst packet; the rest arrive on [FtpClient::subscribe_burst_packets].
    pub async fn burst_read_file(&self, size: u8, offset: u32, session: u8, cancel: &CancellationToken) -> Result<FtpPayload, FtpError> {
        let mut payload = FtpPayload::new(FtpOpcode::BurstReadFile, self.next_sequence_number());
        payload.session = session;
        payload.size = size;
        payload.offset = offset;
        let reply = self.ftp_call("ftp:burst-read-file", payload, Some(session), cancel).await?;
        self.burst_session.store(reply.session, Ordering::SeqCst);
        Ok(reply)
    }

    /// All burst data packets for the current burst session. Subscribe BEFORE calling
    ///  [FtpClient::burst_read_file], or the packets racing the first reply are lost.
    pub fn subscribe_burst_packets(&self) -> FrameSubscription {
        let network = self.config.target_network;
        let burst_session = self.burst_session.clone();
        self.engine.subscribe(move |frame| {
            if frame.message_id != FTP_MESSAGE_ID {
                return false;
            }
            let Ok(message) = FtpMessage::from_frame(frame) else {
                return false;
            };
            message.network == network
                && message.payload.opcode == FtpOpcode::Ack
                && message.payload.request_opcode == FtpOpcode::BurstReadFile
                && message.payload.session == burst_session.load(Ordering::SeqCst)
        })
    }

    /// Splits a buffer into (offset, chunk) pairs no larger than the FTP data block.
    pub fn split_into_chunks(buf: &[u8], chunk_size: usize) -> impl Iterator<Item = (u32, &[u8])> {
        buf.chunks(chunk_size)
            .enumerate()
            .map(move |(i, chunk)| ((i * chunk_size).prechecked_cast(), chunk))
    }
}
