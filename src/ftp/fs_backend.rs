use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use rustc_hash::FxHashMap;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ftp::listing::DirEntry;
use crate::ftp::payload::NakError;
use crate::ftp::server::{FtpNak, FtpServerBackend, OpenReadResult};

enum SessionMode {
    Read,
    Write,
}

struct FsSession {
    file: File,
    mode: SessionMode,
}

/// An [FtpServerBackend] serving a directory of the local filesystem. All paths in requests
///  are interpreted relative to the root; escaping it is rejected.
pub struct FsBackend {
    root: PathBuf,
    sessions: Mutex<FxHashMap<u8, FsSession>>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> FsBackend {
        FsBackend {
            root: root.into(),
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FtpNak> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(FtpNak::new(NakError::FileProtected));
        }
        Ok(self.root.join(relative))
    }

    async fn add_session(&self, file: File, mode: SessionMode) -> Result<u8, FtpNak> {
        let mut sessions = self.sessions.lock().await;
        let session = (0..=u8::MAX)
            .find(|id| !sessions.contains_key(id))
            .ok_or(FtpNak::new(NakError::NoSessionsAvailable))?;
        sessions.insert(session, FsSession { file, mode });
        debug!("opened session {}", session);
        Ok(session)
    }
}

#[async_trait]
impl FtpServerBackend for FsBackend {
    async fn terminate_session(&self, session: u8) -> Result<(), FtpNak> {
        self.sessions.lock().await
            .remove(&session)
            .map(|_| debug!("terminated session {}", session))
            .ok_or(FtpNak::new(NakError::InvalidSession))
    }

    async fn reset_sessions(&self) -> Result<(), FtpNak> {
        self.sessions.lock().await.clear();
        Ok(())
    }

    async fn list_directory(&self, path: &str, offset: u32) -> Result<Vec<DirEntry>, FtpNak> {
        let mut read_dir = tokio::fs::read_dir(self.resolve(path)?).await?;
        let mut entries = Vec::new();
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let metadata = dir_entry.metadata().await?;
            if metadata.is_dir() {
                entries.push(DirEntry::directory(name));
            }
            else {
                let size = u32::try_from(metadata.len()).map_err(|_| FtpNak::new(NakError::Fail))?;
                entries.push(DirEntry::file(name, size));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries.into_iter().skip(offset as usize).collect())
    }

    async fn open_file_read(&self, path: &str) -> Result<OpenReadResult, FtpNak> {
        let file = File::open(self.resolve(path)?).await?;
        let size = u32::try_from(file.metadata().await?.len())
            .map_err(|_| FtpNak::new(NakError::Fail))?;
        let session = self.add_session(file, SessionMode::Read).await?;
        Ok(OpenReadResult { session, size })
    }

    async fn file_read(&self, session: u8, offset: u32, size: usize) -> Result<Vec<u8>, FtpNak> {
        let mut sessions = self.sessions.lock().await;
        let fs_session = sessions.get_mut(&session).ok_or(FtpNak::new(NakError::InvalidSession))?;
        if !matches!(fs_session.mode, SessionMode::Read) {
            return Err(FtpNak::new(NakError::InvalidSession));
        }

        fs_session.file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        let mut data = vec![0u8; size];
        let mut num_read = 0;
        while num_read < size {
            let n = fs_session.file.read(&mut data[num_read..]).await?;
            if n == 0 {
                break;
            }
            num_read += n;
        }
        if num_read == 0 {
            return Err(FtpNak::new(NakError::Eof));
        }
        data.truncate(num_read);
        Ok(data)
    }

    async fn create_file(&self, path: &str) -> Result<u8, FtpNak> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(path)?)
            .await?;
        self.add_session(file, SessionMode::Write).await
    }

    async fn open_file_write(&self, path: &str) -> Result<u8, FtpNak> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.resolve(path)?)
            .await?;
        self.add_session(file, SessionMode::Write).await
    }

    async fn file_write(&self, session: u8, offset: u32, data: &[u8]) -> Result<(), FtpNak> {
        let mut sessions = self.sessions.lock().await;
        let fs_session = sessions.get_mut(&session).ok_or(FtpNak::new(NakError::InvalidSession))?;
        if !matches!(fs_session.mode, SessionMode::Write) {
            return Err(FtpNak::new(NakError::InvalidSession));
        }

        fs_session.file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        fs_session.file.write_all(data).await?;
        fs_session.file.flush().await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FtpNak> {
        Ok(tokio::fs::remove_file(self.resolve(path)?).await?)
    }

    async fn create_directory(&self, path: &str) -> Result<(), FtpNak> {
        Ok(tokio::fs::create_dir(self.resolve(path)?).await?)
    }

    async fn remove_directory(&self, path: &str) -> Result<(), FtpNak> {
        Ok(tokio::fs::remove_dir(self.resolve(path)?).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FtpNak> {
        Ok(tokio::fs::rename(self.resolve(from)?, self.resolve(to)?).await?)
    }

    async fn truncate_file(&self, path: &str, offset: u32) -> Result<(), FtpNak> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.resolve(path)?)
            .await?;
        Ok(file.set_len(offset as u64).await?)
    }

    async fn calc_file_crc32(&self, path: &str) -> Result<u32, FtpNak> {
        let mut file = File::open(self.resolve(path)?).await?;
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let mut digest = crc.digest();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        Ok(digest.finalize())
    }
}
