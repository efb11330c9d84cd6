use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;

use crate::ftp::{DirEntry, FtpNak, FtpServerBackend, NakError, OpenReadResult};
use crate::util::safe_converter::PrecheckedCast;

/// An [FtpServerBackend] over an in-memory file tree, with knobs for provoking the failure
///  paths real storage makes hard to hit deterministically.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<FxHashMap<String, Vec<u8>>>,
    directories: Mutex<FxHashSet<String>>,
    /// session id -> path
    sessions: Mutex<FxHashMap<u8, String>>,
    num_reads: AtomicUsize,
    cancel_after_reads: Mutex<Option<(usize, CancellationToken)>>,
    fail_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn put_file(&self, path: impl Into<String>, content: Vec<u8>) {
        let path = path.into();
        self.register_parents(&path);
        self.files.lock().unwrap().insert(path, content);
    }

    pub fn put_directory(&self, path: impl Into<String>) {
        let path = path.into();
        self.register_parents(&path);
        self.directories.lock().unwrap().insert(path);
    }

    fn register_parents(&self, path: &str) {
        let mut directories = self.directories.lock().unwrap();
        let mut parent = path;
        while let Some((p, _)) = parent.rsplit_once('/') {
            directories.insert(p.to_string());
            parent = p;
        }
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn num_open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// After `num_reads` successful reads, cancel the token and stall instead of answering.
    pub fn cancel_after_reads(&self, num_reads: usize, cancel: CancellationToken) {
        *self.cancel_after_reads.lock().unwrap() = Some((num_reads, cancel));
    }

    /// Make all subsequent writes fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(1, Ordering::SeqCst);
    }

    fn allocate_session(&self, path: String) -> Result<u8, FtpNak> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = (0..=u8::MAX)
            .find(|id| !sessions.contains_key(id))
            .ok_or(FtpNak::new(NakError::NoSessionsAvailable))?;
        sessions.insert(session, path);
        Ok(session)
    }

    fn session_path(&self, session: u8) -> Result<String, FtpNak> {
        self.sessions.lock().unwrap()
            .get(&session)
            .cloned()
            .ok_or(FtpNak::new(NakError::InvalidSession))
    }
}

#[async_trait]
impl FtpServerBackend for MemoryBackend {
    async fn terminate_session(&self, session: u8) -> Result<(), FtpNak> {
        self.sessions.lock().unwrap()
            .remove(&session)
            .map(|_| ())
            .ok_or(FtpNak::new(NakError::InvalidSession))
    }

    async fn reset_sessions(&self) -> Result<(), FtpNak> {
        self.sessions.lock().unwrap().clear();
        Ok(())
    }

    async fn list_directory(&self, path: &str, offset: u32) -> Result<Vec<DirEntry>, FtpNak> {
        if !self.directories.lock().unwrap().contains(path) {
            return Err(FtpNak::new(NakError::FileNotFound));
        }
        let prefix = format!("{}/", path);
        let is_direct_child = |p: &str| {
            p.strip_prefix(&prefix).map(|rest| !rest.contains('/')).unwrap_or(false)
        };

        let mut subdirectories: Vec<DirEntry> = self.directories.lock().unwrap().iter()
            .filter(|p| is_direct_child(p.as_str()))
            .map(|p| DirEntry::directory(&p[prefix.len()..]))
            .collect();
        subdirectories.sort_by(|a, b| a.name.cmp(&b.name));

        let mut files: Vec<DirEntry> = self.files.lock().unwrap().iter()
            .filter(|(p, _)| is_direct_child(p.as_str()))
            .map(|(p, content)| DirEntry::file(&p[prefix.len()..], content.len().prechecked_cast()))
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(subdirectories.into_iter()
            .chain(files)
            .skip(offset as usize)
            .collect())
    }

    async fn open_file_read(&self, path: &str) -> Result<OpenReadResult, FtpNak> {
        let size: u32 = self.files.lock().unwrap()
            .get(path)
            .map(|content| content.len().prechecked_cast())
            .ok_or(FtpNak::new(NakError::FileNotFound))?;
        let session = self.allocate_session(path.to_string())?;
        Ok(OpenReadResult { session, size })
    }

    async fn file_read(&self, session: u8, offset: u32, size: usize) -> Result<Vec<u8>, FtpNak> {
        let stall = {
            let trigger = self.cancel_after_reads.lock().unwrap();
            match &*trigger {
                Some((after, cancel)) if self.num_reads.load(Ordering::SeqCst) >= *after => {
                    cancel.cancel();
                    true
                }
                _ => false,
            }
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Err(FtpNak::new(NakError::Fail));
        }

        let path = self.session_path(session)?;
        let files = self.files.lock().unwrap();
        let content = files.get(&path).ok_or(FtpNak::new(NakError::FileNotFound))?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Err(FtpNak::new(NakError::Eof));
        }
        self.num_reads.fetch_add(1, Ordering::SeqCst);
        Ok(content[offset..(offset + size).min(content.len())].to_vec())
    }

    async fn create_file(&self, path: &str) -> Result<u8, FtpNak> {
        self.put_file(path, Vec::new());
        self.allocate_session(path.to_string())
    }

    async fn open_file_write(&self, path: &str) -> Result<u8, FtpNak> {
        if !self.files.lock().unwrap().contains_key(path) {
            return Err(FtpNak::new(NakError::FileNotFound));
        }
        self.allocate_session(path.to_string())
    }

    async fn file_write(&self, session: u8, offset: u32, data: &[u8]) -> Result<(), FtpNak> {
        if self.fail_writes.load(Ordering::SeqCst) != 0 {
            return Err(FtpNak::new(NakError::Fail));
        }
        let path = self.session_path(session)?;
        let mut files = self.files.lock().unwrap();
        let content = files.get_mut(&path).ok_or(FtpNak::new(NakError::FileNotFound))?;
        let offset = offset as usize;
        if content.len() < offset + data.len() {
            content.resize(offset + data.len(), 0);
        }
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FtpNak> {
        self.files.lock().unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or(FtpNak::new(NakError::FileNotFound))
    }

    async fn create_directory(&self, path: &str) -> Result<(), FtpNak> {
        self.register_parents(path);
        if !self.directories.lock().unwrap().insert(path.to_string()) {
            return Err(FtpNak::new(NakError::FileExists));
        }
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<(), FtpNak> {
        self.directories.lock().unwrap()
            .remove(path)
            .then_some(())
            .ok_or(FtpNak::new(NakError::FileNotFound))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FtpNak> {
        let mut files = self.files.lock().unwrap();
        let content = files.remove(from).ok_or(FtpNak::new(NakError::FileNotFound))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn truncate_file(&self, path: &str, offset: u32) -> Result<(), FtpNak> {
        let mut files = self.files.lock().unwrap();
        let content = files.get_mut(path).ok_or(FtpNak::new(NakError::FileNotFound))?;
        content.truncate(offset as usize);
        Ok(())
    }

    async fn calc_file_crc32(&self, path: &str) -> Result<u32, FtpNak> {
        let files = self.files.lock().unwrap();
        let content = files.get(path).ok_or(FtpNak::new(NakError::FileNotFound))?;
        Ok(Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(content))
    }
}
