use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use rustc_hash::FxHashSet;
use tokio::io::{AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ftp::client::FtpClient;
use crate::ftp::listing::{parse_listing, DirEntry};
use crate::ftp::payload::{FtpMessage, FtpOpcode, FtpPayload, NakError, MAX_DATA_SIZE};
use crate::ftp::FtpError;
use crate::microservice::CallError;
use crate::util::safe_converter::PrecheckedCast;

/// Whole-file and whole-directory operations on top of the packet-per-call [FtpClient]:
///  sequential and burst downloads, uploads, and exhaustive directory listings.
pub struct FtpTransfer {
    client: FtpClient,
}

impl FtpTransfer {
    pub fn new(client: FtpClient) -> FtpTransfer {
        FtpTransfer { client }
    }

    pub fn client(&self) -> &FtpClient {
        &self.client
    }

    /// Downloads `server_path` into `dest` by sequential reads. Returns the file size the
    ///  server announced.
    pub async fn download_file(
        &self,
        server_path: &str,
        dest: &mut (impl AsyncWrite + Unpin + Send),
        cancel: &CancellationToken,
    ) -> Result<u32, FtpError> {
        let opened = require_ack(FtpOpcode::OpenFileRo, self.client.open_file_ro(server_path, cancel).await?)?;
        let session = opened.session;
        let total = opened.data_u32()
            .map_err(|e| FtpError::Malformed { opcode: FtpOpcode::OpenFileRo, message: e.to_string() })?;
        debug!("downloading {} ({} bytes, session {})", server_path, total, session);

        let result = self.read_session(session, total, dest, cancel).await;
        self.terminate_best_effort(session).await;
        result?;
        Ok(total)
    }

    async fn read_session(
        &self,
        session: u8,
        total: u32,
        dest: &mut (impl AsyncWrite + Unpin + Send),
        cancel: &CancellationToken,
    ) -> Result<(), FtpError> {
        let mut offset = 0u32;
        while offset < total {
            let reply = self.client.read_file(MAX_DATA_SIZE.prechecked_cast(), offset, session, cancel).await?;
            match reply.nak_error() {
                Some((NakError::Eof, _)) => break,
                Some((error, errno)) => {
                    return Err(FtpError::Nak { opcode: FtpOpcode::ReadFile, error, errno });
                }
                None => {}
            }
            if reply.data.is_empty() {
                break;
            }
            dest.write_all(&reply.data).await?;
            offset += reply.data.len() as u32;
        }
        dest.flush().await?;
        Ok(())
    }

    /// Downloads `server_path` into `dest` via burst streaming: the server pushes packets
    ///  without per-packet requests, and the client re-requests from the first gap whenever
    ///  the stream pauses. `dest` must be seekable because packets may arrive out of order.
    pub async fn download_file_burst(
        &self,
        server_path: &str,
        dest: &mut (impl AsyncWrite + AsyncSeek + Unpin + Send),
        cancel: &CancellationToken,
    ) -> Result<u32, FtpError> {
        let opened = match require_ack(FtpOpcode::OpenFileRo, self.client.open_file_ro(server_path, cancel).await?) {
            Ok(opened) => opened,
            Err(e) if e.is_eof_nak() => return Ok(0),
            Err(e) => {
                // stale sessions on the server can make an open fail spuriously: reset
                //  them and try once more
                warn!("opening {} for burst failed ({}), resetting sessions and retrying", server_path, e);
                require_ack(FtpOpcode::ResetSessions, self.client.reset_sessions(cancel).await?)?;
                require_ack(FtpOpcode::OpenFileRo, self.client.open_file_ro(server_path, cancel).await?)?
            }
        };
        let session = opened.session;
        let total = opened.data_u32()
            .map_err(|e| FtpError::Malformed { opcode: FtpOpcode::OpenFileRo, message: e.to_string() })?;
        debug!("burst downloading {} ({} bytes, session {})", server_path, total, session);

        let result = self.burst_session(session, total, dest, cancel).await;
        self.terminate_best_effort(session).await;
        result?;
        Ok(total)
    }

    async fn burst_session(
        &self,
        session: u8,
        total: u32,
        dest: &mut (impl AsyncWrite + AsyncSeek + Unpin + Send),
        cancel: &CancellationToken,
    ) -> Result<(), FtpError> {
        if total == 0 {
            return Ok(());
        }

        // subscribe before kicking off the burst so no packet can race past
        let mut packets = self.client.subscribe_burst_packets();
        self.start_burst(session, 0, cancel).await?;

        let config = self.client.config();
        // if the stream stalls for as long as a full retried call would take, re-request
        let idle_timeout = config.timeout_per_attempt * config.attempts as u32;

        let mut coverage = ChunkCoverage::default();
        loop {
            select! {
                _ = cancel.cancelled() => {
                    return Err(CallError::Cancelled { name: "ftp:download-burst" }.into());
                }
                _ = sleep(idle_timeout) => {
                    warn!("burst stream on session {} stalled, resuming at offset {}", session, coverage.contiguous_end());
                    self.start_burst(session, coverage.contiguous_end(), cancel).await?;
                }
                received = packets.recv() => {
                    let Some(frame) = received else {
                        return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link closed during burst").into());
                    };
                    let Ok(message) = FtpMessage::from_frame(&frame) else {
                        continue; // the subscription already decoded it once, this cannot fail
                    };
                    let packet = message.payload;

                    if !packet.data.is_empty() {
                        dest.seek(SeekFrom::Start(packet.offset as u64)).await?;
                        dest.write_all(&packet.data).await?;
                        coverage.insert(packet.offset, packet.data_end());
                    }
                    if coverage.is_complete(total) {
                        break;
                    }
                    if packet.burst_complete {
                        // the server's burst ended before we have everything: re-request
                        //  starting at the first gap
                        self.start_burst(session, coverage.contiguous_end(), cancel).await?;
                    }
                }
            }
        }
        dest.flush().await?;
        Ok(())
    }

    async fn start_burst(&self, session: u8, offset: u32, cancel: &CancellationToken) -> Result<(), FtpError> {
        let reply = self.client.burst_read_file(MAX_DATA_SIZE.prechecked_cast(), offset, session, cancel).await?;
        match reply.nak_error() {
            // the first packet of the burst answers the request; its data arrives via the
            //  subscription, so it is not processed here
            None | Some((NakError::Eof, _)) => Ok(()),
            Some((error, errno)) => Err(FtpError::Nak { opcode: FtpOpcode::BurstReadFile, error, errno }),
        }
    }

    /// Creates `server_path` and uploads `data` into it in maximum size chunks.
    pub async fn upload_bytes(&self, data: &[u8], server_path: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        let created = require_ack(FtpOpcode::CreateFile, self.client.create_file(server_path, cancel).await?)?;
        let session = created.session;
        debug!("uploading {} bytes to {} (session {})", data.len(), server_path, session);

        let mut result = Ok(());
        for (offset, chunk) in FtpClient::split_into_chunks(data, MAX_DATA_SIZE) {
            result = self.client.write_file(chunk, offset, session, cancel).await
                .and_then(|reply| require_ack(FtpOpcode::WriteFile, reply))
                .map(|_| ());
            if result.is_err() {
                break;
            }
        }
        self.terminate_best_effort(session).await;
        result
    }

    /// Uploads the local file at `local_path` to `server_path`.
    pub async fn upload_file(&self, local_path: impl AsRef<Path>, server_path: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        self.upload_bytes(&data, server_path, cancel).await
    }

    /// The complete listing of `path`, assembled from as many pages as the server needs.
    pub async fn list_directory(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<DirEntry>, FtpError> {
        let mut entries: Vec<DirEntry> = Vec::new();
        let mut seen: FxHashSet<DirEntry> = FxHashSet::default();
        loop {
            let reply = self.client.list_directory(path, entries.len().prechecked_cast(), cancel).await?;
            match reply.nak_error() {
                Some((NakError::Eof, _)) => break,
                Some((error, errno)) => {
                    return Err(FtpError::Nak { opcode: FtpOpcode::ListDirectory, error, errno });
                }
                None => {}
            }

            let mut num_new = 0;
            for entry in parse_listing(&reply.data) {
                if seen.insert(entry.clone()) {
                    entries.push(entry);
                    num_new += 1;
                }
            }
            // a page without new entries means the server keeps resending the same data;
            //  stop rather than loop forever
            if num_new == 0 {
                break;
            }
        }
        Ok(entries)
    }

    pub async fn remove_file(&self, path: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        require_ack(FtpOpcode::RemoveFile, self.client.remove_file(path, cancel).await?)?;
        Ok(())
    }

    pub async fn create_directory(&self, path: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        require_ack(FtpOpcode::CreateDirectory, self.client.create_directory(path, cancel).await?)?;
        Ok(())
    }

    pub async fn remove_directory(&self, path: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        require_ack(FtpOpcode::RemoveDirectory, self.client.remove_directory(path, cancel).await?)?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<(), FtpError> {
        require_ack(FtpOpcode::Rename, self.client.rename(from, to, cancel).await?)?;
        Ok(())
    }

    pub async fn truncate_file(&self, path: &str, offset: u32, cancel: &CancellationToken) -> Result<(), FtpError> {
        require_ack(FtpOpcode::TruncateFile, self.client.truncate_file(path, offset, cancel).await?)?;
        Ok(())
    }

    pub async fn calc_file_crc32(&self, path: &str, cancel: &CancellationToken) -> Result<u32, FtpError> {
        let reply = require_ack(FtpOpcode::CalcFileCrc32, self.client.calc_file_crc32(path, cancel).await?)?;
        reply.data_u32()
            .map_err(|e| FtpError::Malformed { opcode: FtpOpcode::CalcFileCrc32, message: e.to_string() })
    }

    /// A session must be released even when the transfer using it failed or was cancelled,
    ///  so this ignores errors and uses a fresh cancellation token.
    async fn terminate_best_effort(&self, session: u8) {
        if let Err(e) = self.client.terminate_session(session, &CancellationToken::new()).await {
            warn!("terminating ftp session {} failed: {}", session, e);
        }
    }
}

fn require_ack(opcode: FtpOpcode, reply: FtpPayload) -> Result<FtpPayload, FtpError> {
    match reply.nak_error() {
        Some((error, errno)) => Err(FtpError::Nak { opcode, error, errno }),
        None => Ok(reply),
    }
}

/// Tracks which byte ranges of a download have arrived, merging overlapping and adjacent
///  ranges. Burst packets may arrive out of order, so completeness cannot be judged from
///  the highest offset alone.
#[derive(Default, Debug)]
struct ChunkCoverage {
    /// start offset -> end offset (exclusive), non-overlapping, non-adjacent
    ranges: BTreeMap<u32, u32>,
}

impl ChunkCoverage {
    fn insert(&mut self, start: u32, end: u32) {
        if end <= start {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
            }
        }
        let merged: Vec<u32> = self.ranges.range(new_start..=new_end).map(|(&s, _)| s).collect();
        for s in merged {
            let e = self.ranges.remove(&s).unwrap();
            new_end = new_end.max(e);
        }
        self.ranges.insert(new_start, new_end);
    }

    /// End of the range starting at 0, i.e. the first missing offset.
    fn contiguous_end(&self) -> u32 {
        match self.ranges.first_key_value() {
            Some((&0, &end)) => end,
            _ => 0,
        }
    }

    fn is_complete(&self, total: u32) -> bool {
        self.contiguous_end() >= total
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftp::client::FtpClientConfig;
    use crate::ftp::payload::FTP_MESSAGE_ID;
    use crate::ftp::server::{FtpServer, FtpServerConfig};
    use crate::link::{ClientIdentity, LinkConnection, LoopbackBus, ServerIdentity, Target};
    use crate::test_util::memory_backend::MemoryBackend;
    use crate::test_util::{CLIENT_ENDPOINT, SERVER_ENDPOINT};
    use rstest::rstest;
    use std::io::Cursor;
    use std::sync::Arc;

    fn transfer_over(bus: &LoopbackBus) -> FtpTransfer {
        let client = FtpClient::new(
            bus.connect(),
            ClientIdentity::new(CLIENT_ENDPOINT, SERVER_ENDPOINT),
            FtpClientConfig::default(),
        );
        FtpTransfer::new(client)
    }

    fn start_server(bus: &LoopbackBus, backend: Arc<MemoryBackend>) {
        let server = Arc::new(FtpServer::new(
            bus.connect(),
            ServerIdentity::new(SERVER_ENDPOINT),
            FtpServerConfig::default(),
            backend,
        ));
        tokio::spawn(async move { server.run().await });
    }

    #[tokio::test]
    async fn test_download_file() {
        let content: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let backend = Arc::new(MemoryBackend::default());
        backend.put_file("logs/a.bin", content.clone());

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend.clone());
        let transfer = transfer_over(&bus);

        let mut dest = Cursor::new(Vec::new());
        let total = transfer.download_file("logs/a.bin", &mut dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(total, 1000);
        assert_eq!(dest.into_inner(), content);
        assert_eq!(backend.num_open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let bus = LoopbackBus::new(256);
        start_server(&bus, Arc::new(MemoryBackend::default()));
        let transfer = transfer_over(&bus);

        let mut dest = Cursor::new(Vec::new());
        let result = transfer.download_file("nope.bin", &mut dest, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FtpError::Nak { error: NakError::FileNotFound, .. })));
    }

    #[tokio::test]
    async fn test_upload_then_download_roundtrip() {
        let content: Vec<u8> = (0..719u32).map(|i| (i * 7) as u8).collect();
        let backend = Arc::new(MemoryBackend::default());

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend.clone());
        let transfer = transfer_over(&bus);
        let cancel = CancellationToken::new();

        transfer.upload_bytes(&content, "up.bin", &cancel).await.unwrap();
        assert_eq!(backend.file_content("up.bin"), Some(content.clone()));

        let mut dest = Cursor::new(Vec::new());
        transfer.download_file("up.bin", &mut dest, &cancel).await.unwrap();
        assert_eq!(dest.into_inner(), content);
    }

    #[tokio::test]
    async fn test_download_burst() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let backend = Arc::new(MemoryBackend::default());
        backend.put_file("big.bin", content.clone());

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend.clone());
        let transfer = transfer_over(&bus);

        let mut dest = Cursor::new(Vec::new());
        let total = transfer.download_file_burst("big.bin", &mut dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(total, 10_000);
        assert_eq!(dest.into_inner(), content);
        assert_eq!(backend.num_open_sessions(), 0);
    }

    /// Burst packets delivered shuffled must still produce the complete file: out of order
    ///  writes land at their offsets and completeness is judged from coverage, not arrival
    ///  order.
    #[tokio::test]
    async fn test_download_burst_out_of_order() {
        let content: Vec<u8> = (0..10_240u32).map(|i| (i % 157) as u8).collect();
        let content_for_server = content.clone();

        let bus = LoopbackBus::new(256);
        let server_connection = bus.connect();
        tokio::spawn(async move {
            let mut rx = server_connection.subscribe_frames();
            let mut session_counter = 0u8;
            loop {
                let frame = match rx.recv().await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if frame.message_id != FTP_MESSAGE_ID || frame.sender == SERVER_ENDPOINT {
                    continue;
                }
                let request = FtpMessage::from_frame(&frame).unwrap().payload;

                let mut reply = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1));
                reply.session = request.session;
                reply.request_opcode = request.opcode;
                match request.opcode {
                    FtpOpcode::OpenFileRo => {
                        session_counter += 1;
                        reply.session = session_counter;
                        reply.set_data((content_for_server.len() as u32).to_le_bytes().to_vec());
                    }
                    FtpOpcode::TerminateSession => {}
                    FtpOpcode::BurstReadFile => {
                        // send all chunks from the requested offset, out of order:
                        //  odd-indexed chunks first, then even-indexed ones
                        let mut chunks: Vec<(u32, &[u8])> =
                            FtpClient::split_into_chunks(&content_for_server[request.offset as usize..], 200)
                                .map(|(off, chunk)| (off + request.offset, chunk))
                                .collect();
                        let reorder: Vec<(u32, &[u8])> = chunks.iter().skip(1).step_by(2)
                            .chain(chunks.iter().step_by(2))
                            .copied()
                            .collect();
                        chunks = reorder;

                        let num_chunks = chunks.len();
                        for (i, (offset, chunk)) in chunks.into_iter().enumerate() {
                            let mut packet = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1 + i as u16));
                            packet.session = request.session;
                            packet.request_opcode = FtpOpcode::BurstReadFile;
                            packet.offset = offset;
                            packet.set_data(chunk.to_vec());
                            packet.burst_complete = i + 1 == num_chunks;
                            let mut packet_frame = FtpMessage { network: 0, payload: packet }.into_frame(Target::to(frame.sender));
                            packet_frame.sender = SERVER_ENDPOINT;
                            server_connection.send_frame(packet_frame).await.unwrap();
                        }
                        continue;
                    }
                    _ => panic!("unexpected request {:?}", request.opcode),
                }
                let mut reply_frame = FtpMessage { network: 0, payload: reply }.into_frame(Target::to(frame.sender));
                reply_frame.sender = SERVER_ENDPOINT;
                server_connection.send_frame(reply_frame).await.unwrap();
            }
        });

        let transfer = transfer_over(&bus);
        let mut dest = Cursor::new(Vec::new());
        transfer.download_file_burst("big.bin", &mut dest, &CancellationToken::new()).await.unwrap();
        assert_eq!(dest.into_inner(), content);
    }

    /// A server that caps the packets per burst ends each burst with `burst_complete`
    ///  before the file is fully delivered; the client must re-request from the first
    ///  missing offset until coverage is complete.
    #[tokio::test]
    async fn test_download_burst_resume_after_early_end() {
        let content: Vec<u8> = (0..1200u32).map(|i| (i % 83) as u8).collect();
        let backend = Arc::new(MemoryBackend::default());
        backend.put_file("capped.bin", content.clone());

        let bus = LoopbackBus::new(256);
        let server = Arc::new(FtpServer::new(
            bus.connect(),
            ServerIdentity::new(SERVER_ENDPOINT),
            FtpServerConfig {
                burst_chunk_limit: Some(2),
                ..FtpServerConfig::default()
            },
            backend.clone(),
        ));
        tokio::spawn(async move { server.run().await });
        let transfer = transfer_over(&bus);

        let mut dest = Cursor::new(Vec::new());
        let total = transfer.download_file_burst("capped.bin", &mut dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(total, 1200);
        assert_eq!(dest.into_inner(), content);
        assert_eq!(backend.num_open_sessions(), 0);
    }

    /// A burst that goes quiet without `burst_complete` must be re-requested from the
    ///  first missing offset once the stream has stalled for a full call's worth of
    ///  retries.
    #[tokio::test]
    async fn test_download_burst_resume_after_stall() {
        let content: Vec<u8> = (0..600u32).map(|i| (i % 41) as u8).collect();
        let content_for_server = content.clone();

        let bus = LoopbackBus::new(256);
        let server_connection = bus.connect();
        tokio::spawn(async move {
            let mut rx = server_connection.subscribe_frames();
            let mut first_burst = true;
            loop {
                let frame = match rx.recv().await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if frame.message_id != FTP_MESSAGE_ID || frame.sender == SERVER_ENDPOINT {
                    continue;
                }
                let request = FtpMessage::from_frame(&frame).unwrap().payload;

                let mut replies = Vec::new();
                match request.opcode {
                    FtpOpcode::OpenFileRo => {
                        let mut reply = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1));
                        reply.session = 1;
                        reply.request_opcode = request.opcode;
                        reply.set_data((content_for_server.len() as u32).to_le_bytes().to_vec());
                        replies.push(reply);
                    }
                    FtpOpcode::TerminateSession => {
                        let mut reply = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1));
                        reply.session = request.session;
                        reply.request_opcode = request.opcode;
                        replies.push(reply);
                    }
                    FtpOpcode::BurstReadFile => {
                        // the first burst delivers a single packet and then goes silent;
                        //  resumed bursts deliver everything from the requested offset
                        let chunks: Vec<(u32, &[u8])> =
                            FtpClient::split_into_chunks(&content_for_server[request.offset as usize..], 200)
                                .map(|(off, chunk)| (off + request.offset, chunk))
                                .collect();
                        let taken = if first_burst { 1 } else { chunks.len() };
                        first_burst = false;
                        for (i, &(offset, chunk)) in chunks.iter().take(taken).enumerate() {
                            let mut packet = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1 + i as u16));
                            packet.session = request.session;
                            packet.request_opcode = FtpOpcode::BurstReadFile;
                            packet.offset = offset;
                            packet.set_data(chunk.to_vec());
                            packet.burst_complete = taken == chunks.len() && i + 1 == taken;
                            replies.push(packet);
                        }
                    }
                    _ => continue,
                }
                for payload in replies {
                    let mut reply_frame = FtpMessage { network: 0, payload }.into_frame(Target::to(frame.sender));
                    reply_frame.sender = SERVER_ENDPOINT;
                    server_connection.send_frame(reply_frame).await.unwrap();
                }
            }
        });

        tokio::time::pause();
        let transfer = transfer_over(&bus);
        let mut dest = Cursor::new(Vec::new());
        let total = transfer.download_file_burst("a.bin", &mut dest, &CancellationToken::new()).await.unwrap();

        assert_eq!(total, 600);
        assert_eq!(dest.into_inner(), content);
    }

    #[tokio::test]
    async fn test_list_directory_paginated() {
        let backend = Arc::new(MemoryBackend::default());
        backend.put_directory("dir/sub");
        backend.put_file("dir/a.txt", Vec::new());
        backend.put_file("dir/b.txt", vec![0; 100]);
        // enough entries that the listing cannot fit into a single page
        for i in 0..30 {
            backend.put_file(format!("dir/padding-file-{:02}.dat", i), vec![1; 10]);
        }

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend);
        let transfer = transfer_over(&bus);

        let entries = transfer.list_directory("dir", &CancellationToken::new()).await.unwrap();

        assert_eq!(entries.len(), 33);
        assert!(entries.contains(&DirEntry::directory("sub")));
        assert!(entries.contains(&DirEntry::file("a.txt", 0)));
        assert!(entries.contains(&DirEntry::file("b.txt", 100)));
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let bus = LoopbackBus::new(256);
        start_server(&bus, Arc::new(MemoryBackend::default()));
        let transfer = transfer_over(&bus);

        let result = transfer.list_directory("nope", &CancellationToken::new()).await;
        assert!(matches!(result, Err(FtpError::Nak { error: NakError::FileNotFound, .. })));
    }

    #[tokio::test]
    async fn test_crc_and_rename_and_remove() {
        let backend = Arc::new(MemoryBackend::default());
        backend.put_file("a.bin", b"hello world".to_vec());

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend.clone());
        let transfer = transfer_over(&bus);
        let cancel = CancellationToken::new();

        let crc = transfer.calc_file_crc32("a.bin", &cancel).await.unwrap();
        assert_eq!(crc, crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(b"hello world"));

        transfer.rename("a.bin", "b.bin", &cancel).await.unwrap();
        assert!(backend.file_content("a.bin").is_none());
        assert_eq!(backend.file_content("b.bin"), Some(b"hello world".to_vec()));

        transfer.remove_file("b.bin", &cancel).await.unwrap();
        assert!(backend.file_content("b.bin").is_none());
    }

    /// Cancelling mid download aborts with [CallError::Cancelled]; bytes already received
    ///  stay in the destination.
    #[tokio::test]
    async fn test_download_cancelled_mid_transfer() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(MemoryBackend::default());
        backend.put_file("a.bin", vec![5; 1000]);
        backend.cancel_after_reads(1, cancel.clone());

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend);
        let transfer = transfer_over(&bus);

        let mut dest = Cursor::new(Vec::new());
        let result = transfer.download_file("a.bin", &mut dest, &cancel).await;

        assert!(matches!(result, Err(FtpError::Call(CallError::Cancelled { .. }))));
        assert_eq!(dest.into_inner(), vec![5; 239]);
    }

    #[rstest]
    #[case::single(vec![(0, 100)], 100, true)]
    #[case::hole(vec![(0, 100), (200, 300)], 300, false)]
    #[case::hole_filled(vec![(0, 100), (200, 300), (100, 200)], 300, true)]
    #[case::overlap(vec![(0, 150), (100, 300)], 300, true)]
    #[case::adjacent(vec![(100, 200), (0, 100)], 200, true)]
    #[case::out_of_order_complete(vec![(200, 300), (100, 200), (0, 100)], 300, true)]
    #[case::missing_head(vec![(100, 300)], 300, false)]
    fn test_chunk_coverage(#[case] inserts: Vec<(u32, u32)>, #[case] total: u32, #[case] expected_complete: bool) {
        let mut coverage = ChunkCoverage::default();
        for (start, end) in inserts {
            coverage.insert(start, end);
        }
        assert_eq!(coverage.is_complete(total), expected_complete);
    }

    #[test]
    fn test_chunk_coverage_contiguous_end() {
        let mut coverage = ChunkCoverage::default();
        assert_eq!(coverage.contiguous_end(), 0);
        coverage.insert(100, 200);
        assert_eq!(coverage.contiguous_end(), 0);
        coverage.insert(0, 100);
        assert_eq!(coverage.contiguous_end(), 200);
        coverage.insert(300, 400);
        assert_eq!(coverage.contiguous_end(), 200);
        coverage.insert(150, 350);
        assert_eq!(coverage.contiguous_end(), 400);
    }

    #[tokio::test]
    async fn test_upload_write_failure_still_terminates_session() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_writes();

        let bus = LoopbackBus::new(256);
        start_server(&bus, backend.clone());
        let transfer = transfer_over(&bus);

        let result = transfer.upload_bytes(&[1, 2, 3], "up.bin", &CancellationToken::new()).await;
        assert!(matches!(result, Err(FtpError::Nak { .. })));
        assert_eq!(backend.num_open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_burst_idle_timeout_uses_retries() {
        // a server that opens the file but never answers burst requests: the transfer
        //  must give up with a timeout rather than hang
        let bus = LoopbackBus::new(256);
        let server_connection = bus.connect();
        tokio::spawn(async move {
            let mut rx = server_connection.subscribe_frames();
            while let Ok(frame) = rx.recv().await {
                if frame.message_id != FTP_MESSAGE_ID || frame.sender == SERVER_ENDPOINT {
                    continue;
                }
                let request = FtpMessage::from_frame(&frame).unwrap().payload;
                if request.opcode != FtpOpcode::OpenFileRo {
                    continue;
                }
                let mut reply = FtpPayload::new(FtpOpcode::Ack, request.sequence_number.wrapping_add(1));
                reply.session = 1;
                reply.request_opcode = request.opcode;
                reply.set_data(100u32.to_le_bytes().to_vec());
                let mut reply_frame = FtpMessage { network: 0, payload: reply }.into_frame(Target::to(frame.sender));
                reply_frame.sender = SERVER_ENDPOINT;
                server_connection.send_frame(reply_frame).await.unwrap();
            }
        });

        tokio::time::pause();
        let transfer = transfer_over(&bus);
        let mut dest = Cursor::new(Vec::new());
        let result = transfer.download_file_burst("a.bin", &mut dest, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FtpError::Call(CallError::Timeout { .. }))));
    }
}
