use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::ftp::listing::{format_entry, DirEntry};
use crate::ftp::payload::{FtpMessage, FtpOpcode, FtpPayload, NakError, FTP_MESSAGE_ID, MAX_DATA_SIZE};
use crate::link::{Endpoint, LinkConnection, ServerIdentity, Target};

#[derive(Clone, Copy, Debug)]
pub struct FtpServerConfig {
    pub network: u8,
    /// pause between burst packets, throttling the stream so slow links keep up
    pub burst_chunk_delay: Duration,
    /// packets per burst before the server stops and waits for the client to re-request
    pub burst_chunk_limit: Option<usize>,
}
impl Default for FtpServerConfig {
    fn default() -> Self {
        FtpServerConfig {
            network: 0,
            burst_chunk_delay: Duration::from_millis(5),
            burst_chunk_limit: None,
        }
    }
}

/// A backend level rejection, reported to the client as a Nak reply.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Error)]
#[error("{error:?}{}", errno.map(|e| format!(" (errno {})", e)).unwrap_or_default())]
pub struct FtpNak {
    pub error: NakError,
    pub errno: Option<u8>,
}
impl FtpNak {
    pub fn new(error: NakError) -> FtpNak {
        FtpNak { error, errno: None }
    }
}
impl From<std::io::Error> for FtpNak {
    fn from(e: std::io::Error) -> FtpNak {
        use std::io::ErrorKind::*;
        match e.kind() {
            NotFound => FtpNak::new(NakError::FileNotFound),
            AlreadyExists => FtpNak::new(NakError::FileExists),
            PermissionDenied => FtpNak::new(NakError::FileProtected),
            _ => match e.raw_os_error() {
                Some(errno) => FtpNak {
                    error: NakError::FailErrno,
                    errno: u8::try_from(errno).ok(),
                },
                None => FtpNak::new(NakError::Fail),
            },
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct OpenReadResult {
    pub session: u8,
    pub size: u32,
}

/// The storage behind an [FtpServer]. Every operation defaults to rejecting with
///  [NakError::UnknownCommand], so a backend implements exactly the subset it supports.
///
/// Reads past the end of a file answer [NakError::Eof].
#[async_trait]
pub trait FtpServerBackend: Send + Sync + 'static {
    async fn terminate_session(&self, _session: u8) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn reset_sessions(&self) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn list_directory(&self, _path: &str, _offset: u32) -> Result<Vec<DirEntry>, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn open_file_read(&self, _path: &str) -> Result<OpenReadResult, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn file_read(&self, _session: u8, _offset: u32, _size: usize) -> Result<Vec<u8>, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn create_file(&self, _path: &str) -> Result<u8, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn open_file_write(&self, _path: &str) -> Result<u8, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn file_write(&self, _session: u8, _offset: u32, _data: &[u8]) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn remove_file(&self, _path: &str) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn create_directory(&self, _path: &str) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn remove_directory(&self, _path: &str) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn rename(&self, _from: &str, _to: &str) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn truncate_file(&self, _path: &str, _offset: u32) -> Result<(), FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
    async fn calc_file_crc32(&self, _path: &str) -> Result<u32, FtpNak> {
        Err(FtpNak::new(NakError::UnknownCommand))
    }
}

/// Server side of the FTP subprotocol: decodes requests addressed to the local endpoint,
///  dispatches to the backend and sends the Ack / Nak reply. Burst reads stream their
///  packets from a spawned task.
pub struct FtpServer {
    connection: Arc<dyn LinkConnection>,
    identity: ServerIdentity,
    config: FtpServerConfig,
    backend: Arc<dyn FtpServerBackend>,
    /// sequence number and result of the last successful OpenFileRo, to answer a client's
    ///  retransmit of the same request without opening a second session
    last_ro_request: Mutex<Option<(u16, OpenReadResult)>>,
}

impl FtpServer {
    pub fn new(
        connection: Arc<dyn LinkConnection>,
        identity: ServerIdentity,
        config: FtpServerConfig,
        backend: Arc<dyn FtpServerBackend>,
    ) -> FtpServer {
        FtpServer {
            connection,
            identity,
            config,
            backend,
            last_ro_request: Mutex::new(None),
        }
    }

    /// The server's receive loop. Does not return as long as the link is up.
    pub async fn run(self: &Arc<Self>) {
        use tokio::sync::broadcast::error::RecvError;

        let mut rx = self.connection.subscribe_frames();
        loop {
            let frame = match rx.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(n)) => {
                    warn!("ftp server lagged, {} frames lost", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if frame.message_id != FTP_MESSAGE_ID || !frame.target.accepts(self.identity.local) {
                continue;
            }
            let message = match FtpMessage::from_frame(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("dropping malformed ftp frame from {:?}: {}", frame.sender, e);
                    continue;
                }
            };
            if message.network != self.config.network {
                continue;
            }

            let server = self.clone();
            tokio::spawn(async move {
                server.on_request(frame.sender, message.payload).await;
            });
        }
        debug!("link closed, ftp server terminating");
    }

    async fn on_request(self: Arc<Self>, from: Endpoint, request: FtpPayload) {
        if matches!(request.opcode, FtpOpcode::None | FtpOpcode::Ack | FtpOpcode::Nak) {
            return;
        }
        debug!("ftp request {:?} from {:?}", request.opcode, from);

        if request.opcode == FtpOpcode::BurstReadFile {
            self.run_burst(from, request).await;
            return;
        }

        let reply = match self.dispatch(&request).await {
            Ok(reply) => reply,
            Err(nak) => {
                error!("ftp request {:?} from {:?} failed: {}", request.opcode, from, nak);
                nak_reply(&request, nak)
            }
        };
        self.send_reply(from, reply).await;
    }

    async fn dispatch(&self, request: &FtpPayload) -> Result<FtpPayload, FtpNak> {
        let mut reply = ack_reply(request);
        match request.opcode {
            FtpOpcode::TerminateSession => {
                self.backend.terminate_session(request.session).await?;
            }
            FtpOpcode::ResetSessions => {
                self.backend.reset_sessions().await?;
            }
            FtpOpcode::ListDirectory => {
                let entries = self.backend.list_directory(request_path(request)?, request.offset).await?;
                if entries.is_empty() {
                    return Err(FtpNak::new(NakError::Eof));
                }
                reply.set_data(pack_listing_page(&entries));
                reply.offset = request.offset;
            }
            FtpOpcode::OpenFileRo => {
                let mut last = self.last_ro_request.lock().await;
                let opened = match *last {
                    Some((seq, cached)) if seq == request.sequence_number => {
                        warn!("retransmitted open request (sequence {}), answering from cache", seq);
                        cached
                    }
                    _ => {
                        let opened = self.backend.open_file_read(request_path(request)?).await?;
                        *last = Some((request.sequence_number, opened));
                        opened
                    }
                };
                reply.session = opened.session;
                reply.set_data(opened.size.to_le_bytes().to_vec());
            }
            FtpOpcode::ReadFile => {
                if request.size as usize > MAX_DATA_SIZE {
                    return Err(FtpNak::new(NakError::InvalidDataSize));
                }
                let data = self.backend.file_read(request.session, request.offset, request.size as usize).await?;
                reply.offset = request.offset;
                reply.set_data(data);
            }
            FtpOpcode::CreateFile => {
                reply.session = self.backend.create_file(request_path(request)?).await?;
            }
            FtpOpcode::WriteFile => {
                self.backend.file_write(request.session, request.offset, &request.data).await?;
                reply.offset = request.offset;
            }
            FtpOpcode::RemoveFile => {
                self.backend.remove_file(request_path(request)?).await?;
            }
            FtpOpcode::CreateDirectory => {
                self.backend.create_directory(request_path(request)?).await?;
            }
            FtpOpcode::RemoveDirectory => {
                self.backend.remove_directory(request_path(request)?).await?;
            }
            FtpOpcode::OpenFileWo => {
                reply.session = self.backend.open_file_write(request_path(request)?).await?;
            }
            FtpOpcode::TruncateFile => {
                self.backend.truncate_file(request_path(request)?, request.offset).await?;
            }
            FtpOpcode::Rename => {
                let (from, to) = rename_paths(request)?;
                self.backend.rename(from, to).await?;
            }
            FtpOpcode::CalcFileCrc32 => {
                let crc = self.backend.calc_file_crc32(request_path(request)?).await?;
                reply.set_data(crc.to_le_bytes().to_vec());
            }
            FtpOpcode::None | FtpOpcode::Ack | FtpOpcode::Nak | FtpOpcode::BurstReadFile => {
                // filtered out before dispatch
                return Err(FtpNak::new(NakError::UnknownCommand));
            }
        }
        Ok(reply)
    }

    /// Streams a burst: data packets paced by the configured delay, the last one flagged
    ///  `burst_complete`. The initiating request is acked implicitly by the first packet.
    async fn run_burst(&self, from: Endpoint, request: FtpPayload) {
        let chunk_size = if request.size == 0 || request.size as usize > MAX_DATA_SIZE {
            MAX_DATA_SIZE
        } else {
            request.size as usize
        };

        let mut offset = request.offset;
        let mut reply_seq = request.sequence_number;
        let mut num_sent = 0usize;
        loop {
            let mut packet = ack_reply(&request);
            match self.backend.file_read(request.session, offset, chunk_size).await {
                Ok(data) => {
                    let at_eof = data.len() < chunk_size;
                    let at_limit = self.config.burst_chunk_limit.map(|limit| num_sent + 1 >= limit).unwrap_or(false);
                    packet.offset = offset;
                    offset += data.len() as u32;
                    packet.set_data(data);
                    packet.burst_complete = at_eof || at_limit;
                    reply_seq = reply_seq.wrapping_add(1);
                    packet.sequence_number = reply_seq;

                    let done = packet.burst_complete;
                    self.send_reply(from, packet).await;
                    num_sent += 1;
                    if done {
                        return;
                    }
                }
                Err(nak) if nak.error == NakError::Eof => {
                    packet.offset = offset;
                    packet.burst_complete = true;
                    packet.sequence_number = reply_seq.wrapping_add(1);
                    self.send_reply(from, packet).await;
                    return;
                }
                Err(nak) => {
                    error!("burst read on session {} failed: {}", request.session, nak);
                    self.send_reply(from, nak_reply(&request, nak)).await;
                    return;
                }
            }
            sleep(self.config.burst_chunk_delay).await;
        }
    }

    async fn send_reply(&self, to: Endpoint, payload: FtpPayload) {
        let mut frame = FtpMessage {
            network: self.config.network,
            payload,
        }.into_frame(Target::to(to));
        frame.sender = self.identity.local;
        frame.sequence = self.connection.next_sequence();
        if let Err(e) = self.connection.send_frame(frame).await {
            error!("sending ftp reply to {:?} failed: {}", to, e);
        }
    }
}

fn ack_reply(request: &FtpPayload) -> FtpPayload {
    let mut reply = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1));
    reply.session = request.session;
    reply.request_opcode = request.opcode;
    reply
}

fn nak_reply(request: &FtpPayload, nak: FtpNak) -> FtpPayload {
    let mut reply = ack_reply(request);
    reply.opcode = FtpOpcode::Nak;
    let mut data = vec![nak.error.into()];
    if let Some(errno) = nak.errno {
        data.push(errno);
    }
    reply.set_data(data);
    reply
}

fn request_path(request: &FtpPayload) -> Result<&str, FtpNak> {
    request.data_str().map_err(|_| FtpNak::new(NakError::Fail))
}

fn rename_paths(request: &FtpPayload) -> Result<(&str, &str), FtpNak> {
    request.data_str().ok()
        .and_then(|s| s.split_once('\0'))
        .filter(|(from, to)| !from.is_empty() && !to.is_empty())
        .ok_or(FtpNak::new(NakError::Fail))
}

/// As many leading entries as fit into one data block.
fn pack_listing_page(entries: &[DirEntry]) -> Vec<u8> {
    let mut data = Vec::new();
    for entry in entries {
        let formatted = format_entry(entry);
        if data.len() + formatted.len() > MAX_DATA_SIZE {
            break;
        }
        data.extend_from_slice(formatted.as_bytes());
    }
    data
}
