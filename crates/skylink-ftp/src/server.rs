//! Skylink file server - answers transfer requests from a jailed directory
//!
//! Requests are handled one frame at a time. Each handler returns the reply
//! frames; the [`InboundSink`] impl encodes and sends them. Files registered
//! with [`FtpServer::provide_file`] are served by name to read-only requests
//! even when no root directory is configured.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use skylink_core::path::{Jail, PathError};
use skylink_core::{
    pack_entries, Crc32, DecodeError, DirEntry, Frame, NakCode, Opcode, ProvideResult,
    ServerConfig, MAX_DATA_LEN,
};

use crate::transport::{InboundSink, Transport};

/// Open file held by a session
struct OpenFile {
    path: PathBuf,
    file: File,
    writable: bool,
}

/// Sessions keyed by their wire id (1..=max_sessions)
struct SessionTable {
    max_sessions: u8,
    open: BTreeMap<u8, OpenFile>,
}

impl SessionTable {
    fn new(max_sessions: u8) -> Self {
        Self {
            max_sessions,
            open: BTreeMap::new(),
        }
    }

    fn insert(&mut self, path: PathBuf, file: File, writable: bool) -> Result<u8, NakCode> {
        if self.open.values().any(|s| s.path == path) {
            return Err(NakCode::FileProtected);
        }
        let id = (1..=self.max_sessions)
            .find(|id| !self.open.contains_key(id))
            .ok_or(NakCode::NoSessionsAvailable)?;
        self.open.insert(
            id,
            OpenFile {
                path,
                file,
                writable,
            },
        );
        Ok(id)
    }

    /// Whether `path` may be opened (same checks as insert, without a file)
    fn check(&self, path: &Path) -> Result<(), NakCode> {
        if self.open.values().any(|s| s.path == path) {
            return Err(NakCode::FileProtected);
        }
        if self.open.len() >= self.max_sessions as usize {
            return Err(NakCode::NoSessionsAvailable);
        }
        Ok(())
    }
}

/// Nak code plus the errno carried by `FailErrno`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reject {
    code: NakCode,
    errno: Option<u8>,
}

impl Reject {
    fn io(e: io::Error) -> Self {
        let code = NakCode::from_io(&e);
        let errno = match code {
            NakCode::FailErrno => e.raw_os_error().map(|n| n.clamp(0, u8::MAX as i32) as u8),
            _ => None,
        };
        Self { code, errno }
    }
}

impl From<NakCode> for Reject {
    fn from(code: NakCode) -> Self {
        Self { code, errno: None }
    }
}

/// Last request and the replies it produced
struct Replay {
    request: Frame,
    replies: Vec<Frame>,
    at: Instant,
}

/// Skylink file server
pub struct FtpServer {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    root: RwLock<Option<Jail>>,
    provided: Mutex<Vec<PathBuf>>,
    sessions: Mutex<SessionTable>,
    replay: Mutex<Option<Replay>>,
}

impl FtpServer {
    /// Create a server replying through `transport`
    ///
    /// A configured `root_dir` that cannot be used is logged and left unset.
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        let root = config.root_dir.as_deref().and_then(|dir| match Jail::new(dir) {
            Ok(jail) => Some(jail),
            Err(e) => {
                warn!("Ignoring configured root: {}", e);
                None
            }
        });

        Self {
            transport,
            sessions: Mutex::new(SessionTable::new(config.max_sessions)),
            config,
            root: RwLock::new(root),
            provided: Mutex::new(Vec::new()),
            replay: Mutex::new(None),
        }
    }

    /// Set the jail root
    pub fn set_root_dir(&self, dir: &Path) -> Result<(), PathError> {
        let jail = Jail::new(dir)?;
        info!("Serving {:?}", jail.root());
        *self.root.write() = Some(jail);
        Ok(())
    }

    pub fn root_dir(&self) -> Option<PathBuf> {
        self.root.read().as_ref().map(|j| j.root().to_path_buf())
    }

    /// Register a file for download by name, without copying it
    pub fn provide_file(&self, path: impl AsRef<Path>) -> ProvideResult {
        let path = path.as_ref().to_path_buf();
        let mut provided = self.provided.lock();
        if provided.contains(&path) {
            debug!("{:?} already provided", path);
            return ProvideResult::Duplicate;
        }
        info!("Providing {:?}", path);
        provided.push(path);
        ProvideResult::Success
    }

    /// Registered files, in registration order
    pub fn provided_files(&self) -> Vec<PathBuf> {
        self.provided.lock().clone()
    }

    /// Number of open sessions
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().open.len()
    }

    /// Close every session and forget the replay cache
    pub fn reset(&self) {
        self.sessions.lock().open.clear();
        *self.replay.lock() = None;
    }

    /// Handle one decoded request and return the reply frames
    pub fn handle_request(&self, request: &Frame) -> Vec<Frame> {
        if let Some(replay) = self.replay.lock().as_ref() {
            if replay.request == *request && replay.at.elapsed() < self.config.replay_ttl() {
                debug!(seq = request.seq_number, opcode = ?request.opcode, "replaying reply");
                return replay.replies.clone();
            }
        }

        let replies = match self.dispatch(request) {
            Ok(replies) => replies,
            Err(reject) => {
                debug!(opcode = ?request.opcode, code = ?reject.code, "request rejected");
                vec![Frame::nak(request, reject.code, reject.errno)]
            }
        };

        *self.replay.lock() = Some(Replay {
            request: request.clone(),
            replies: replies.clone(),
            at: Instant::now(),
        });
        replies
    }

    fn dispatch(&self, req: &Frame) -> Result<Vec<Frame>, Reject> {
        trace!(seq = req.seq_number, opcode = ?req.opcode, session = req.session, "request");
        let reply = match req.opcode {
            Opcode::None => Frame::ack(req),
            Opcode::TerminateSession => self.handle_terminate(req)?,
            Opcode::ResetSessions => {
                self.sessions.lock().open.clear();
                Frame::ack(req)
            }
            Opcode::ListDirectory => self.handle_list(req)?,
            Opcode::OpenFileRO => self.handle_open_ro(req)?,
            Opcode::ReadFile => self.handle_read(req)?,
            Opcode::BurstReadFile => return self.handle_burst(req),
            Opcode::CreateFile => self.handle_open_wo(req, true)?,
            Opcode::OpenFileWO => self.handle_open_wo(req, false)?,
            Opcode::WriteFile => self.handle_write(req)?,
            Opcode::TruncateFile => self.handle_truncate(req)?,
            Opcode::RemoveFile => self.handle_remove(req, false)?,
            Opcode::RemoveDirectory => self.handle_remove(req, true)?,
            Opcode::CreateDirectory => self.handle_mkdir(req)?,
            Opcode::Rename => self.handle_rename(req)?,
            Opcode::CalcFileCRC32 => self.handle_crc(req)?,
            Opcode::Ack | Opcode::Nak => return Err(NakCode::UnknownCommand.into()),
        };
        Ok(vec![reply])
    }

    fn request_path(req: &Frame) -> Result<&str, NakCode> {
        req.path().map_err(|_| NakCode::InvalidDataSize)
    }

    fn with_jail<T>(&self, f: impl FnOnce(&Jail) -> Result<T, PathError>) -> Result<T, NakCode> {
        let root = self.root.read();
        let jail = root.as_ref().ok_or(NakCode::FileNotFound)?;
        f(jail).map_err(|e| {
            debug!("path rejected: {}", e);
            NakCode::FileNotFound
        })
    }

    /// Registered file matching a bare `/<name>` request
    fn provided_lookup(&self, path: &str) -> Option<PathBuf> {
        let name = path.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return None;
        }
        self.provided
            .lock()
            .iter()
            .find(|p| p.file_name().map_or(false, |n| n == name))
            .cloned()
    }

    /// Resolve a path that must exist, checking registered files first
    fn readable_path(&self, path: &str) -> Result<PathBuf, NakCode> {
        if let Some(provided) = self.provided_lookup(path) {
            return Ok(provided);
        }
        self.with_jail(|jail| jail.resolve_existing(path))
    }

    fn handle_terminate(&self, req: &Frame) -> Result<Frame, Reject> {
        match self.sessions.lock().open.remove(&req.session) {
            Some(session) => {
                debug!(session = req.session, "closed {:?}", session.path);
                Ok(Frame::ack(req))
            }
            None => Err(NakCode::InvalidSession.into()),
        }
    }

    fn handle_list(&self, req: &Frame) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let dir = self.with_jail(|jail| jail.resolve_existing(path))?;
        let entries = fs::read_dir(&dir).map_err(Reject::io)?;

        let mut listing: Vec<(String, DirEntry)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let item = match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => DirEntry::directory(name.clone()),
                Ok(meta) if meta.is_file() => DirEntry::file(name.clone(), meta.len()),
                _ => DirEntry::skip(),
            };
            listing.push((name, item));
        }
        listing.sort_by(|a, b| a.0.cmp(&b.0));

        let rest: Vec<DirEntry> = listing
            .into_iter()
            .skip(req.offset as usize)
            .map(|(_, entry)| entry)
            .collect();
        let (payload, count) = pack_entries(&rest);
        if count == 0 {
            return Err(NakCode::Eof.into());
        }
        Ok(Frame::ack(req).with_data(&payload))
    }

    fn handle_open_ro(&self, req: &Frame) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let real = self.readable_path(path)?;

        let mut sessions = self.sessions.lock();
        sessions.check(&real)?;
        let file = File::open(&real).map_err(Reject::io)?;
        let meta = file.metadata().map_err(Reject::io)?;
        if !meta.is_file() {
            return Err(NakCode::FileNotFound.into());
        }
        let size = u32::try_from(meta.len()).map_err(|_| NakCode::InvalidDataSize)?;
        let id = sessions.insert(real.clone(), file, false)?;
        debug!(session = id, size, "opened {:?} for reading", real);

        let mut reply = Frame::ack(req).with_data(&size.to_le_bytes());
        reply.session = id;
        Ok(reply)
    }

    fn handle_open_wo(&self, req: &Frame, truncate: bool) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let target = self.with_jail(|jail| jail.resolve_new(path))?;

        let mut sessions = self.sessions.lock();
        sessions.check(&target)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(create_error)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&target)
            .map_err(create_error)?;
        let id = sessions.insert(target.clone(), file, true)?;
        debug!(session = id, truncate, "opened {:?} for writing", target);

        let mut reply = Frame::ack(req);
        reply.session = id;
        Ok(reply)
    }

    fn handle_read(&self, req: &Frame) -> Result<Frame, Reject> {
        let want = req
            .data_u32()
            .map_or(MAX_DATA_LEN, |n| (n as usize).min(MAX_DATA_LEN));
        let mut sessions = self.sessions.lock();
        let session = sessions
            .open
            .get_mut(&req.session)
            .ok_or(NakCode::InvalidSession)?;
        if session.writable {
            return Err(NakCode::Fail.into());
        }
        let data = read_at(&mut session.file, req.offset, want).map_err(Reject::io)?;
        if data.is_empty() {
            return Err(NakCode::Eof.into());
        }
        Ok(Frame::ack(req).with_data(&data))
    }

    fn handle_burst(&self, req: &Frame) -> Result<Vec<Frame>, Reject> {
        let budget = req
            .data_u32()
            .unwrap_or(self.config.burst_max_bytes)
            .min(self.config.burst_max_bytes) as u64;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .open
            .get_mut(&req.session)
            .ok_or(NakCode::InvalidSession)?;
        if session.writable {
            return Err(NakCode::Fail.into());
        }

        let mut frames: Vec<Frame> = Vec::new();
        let mut offset = req.offset;
        let mut sent = 0u64;
        while sent < budget {
            let want = (budget - sent).min(MAX_DATA_LEN as u64) as usize;
            let data = read_at(&mut session.file, offset, want).map_err(Reject::io)?;
            if data.is_empty() {
                break;
            }
            let mut frame = Frame::ack(req).with_offset(offset).with_data(&data);
            frame.seq_number = req.seq_number.wrapping_add(1 + frames.len() as u16);
            offset = offset.saturating_add(data.len() as u32);
            sent += data.len() as u64;
            let short = data.len() < want;
            frames.push(frame);
            if short {
                break;
            }
        }

        match frames.last_mut() {
            Some(last) => last.burst_complete = true,
            None => return Err(NakCode::Eof.into()),
        }
        trace!(frames = frames.len(), bytes = sent, "burst");
        Ok(frames)
    }

    fn handle_write(&self, req: &Frame) -> Result<Frame, Reject> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .open
            .get_mut(&req.session)
            .ok_or(NakCode::InvalidSession)?;
        if !session.writable {
            return Err(NakCode::Fail.into());
        }
        session
            .file
            .seek(SeekFrom::Start(req.offset as u64))
            .and_then(|_| session.file.write_all(&req.data))
            .map_err(Reject::io)?;
        Ok(Frame::ack(req))
    }

    fn handle_truncate(&self, req: &Frame) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let real = self.with_jail(|jail| jail.resolve_existing(path))?;
        let file = OpenOptions::new()
            .write(true)
            .open(&real)
            .map_err(Reject::io)?;
        file.set_len(req.offset as u64)
            .map_err(Reject::io)?;
        Ok(Frame::ack(req))
    }

    fn handle_remove(&self, req: &Frame, directory: bool) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let (real, is_root) = self.with_jail(|jail| {
            let real = jail.resolve_existing(path)?;
            let is_root = real == jail.root();
            Ok((real, is_root))
        })?;
        if is_root {
            warn!("refusing to remove the served root");
            return Err(NakCode::Fail.into());
        }

        let meta = fs::metadata(&real).map_err(Reject::io)?;
        let result = match (directory, meta.is_dir()) {
            (false, false) => fs::remove_file(&real),
            (true, true) => fs::remove_dir(&real),
            _ => return Err(NakCode::Fail.into()),
        };
        result.map_err(Reject::io)?;
        debug!("removed {:?}", real);
        Ok(Frame::ack(req))
    }

    fn handle_mkdir(&self, req: &Frame) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let target = self.with_jail(|jail| jail.resolve_new(path))?;
        fs::create_dir(&target).map_err(Reject::io)?;
        debug!("created {:?}", target);
        Ok(Frame::ack(req))
    }

    fn handle_rename(&self, req: &Frame) -> Result<Frame, Reject> {
        let (from, to) = req.path_pair().map_err(|_| NakCode::InvalidDataSize)?;
        let (source, target) = self.with_jail(|jail| {
            let source = jail.resolve_existing(from)?;
            if source == jail.root() {
                return Err(PathError::Invalid("cannot rename the root".into()));
            }
            Ok((source, jail.resolve_new(to)?))
        })?;
        fs::rename(&source, &target).map_err(Reject::io)?;
        debug!("renamed {:?} -> {:?}", source, target);
        Ok(Frame::ack(req))
    }

    fn handle_crc(&self, req: &Frame) -> Result<Frame, Reject> {
        let path = Self::request_path(req)?;
        let real = self.readable_path(path)?;
        let mut file = File::open(&real).map_err(Reject::io)?;
        if !file.metadata().map_err(Reject::io)?.is_file() {
            return Err(NakCode::FileNotFound.into());
        }

        let mut crc = Crc32::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf).map_err(Reject::io)?;
            if n == 0 {
                break;
            }
            crc.update(&buf[..n]);
        }
        Ok(Frame::ack(req).with_data(&crc.value().to_le_bytes()))
    }

    fn send(&self, frame: &Frame) {
        if let Err(e) = self.transport.send(&frame.encode()) {
            warn!("Failed to send reply: {}", e);
        }
    }
}

impl InboundSink for FtpServer {
    fn handle_inbound(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) if frame.opcode.is_reply() => {
                trace!(seq = frame.seq_number, "ignoring reply frame");
            }
            Ok(frame) => {
                for reply in self.handle_request(&frame) {
                    self.send(&reply);
                }
            }
            Err(DecodeError::UnknownOpcode { opcode, seq }) => {
                debug!(opcode, seq, "unknown opcode");
                self.send(&Frame::nak_unknown(seq, opcode));
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
            }
        }
    }
}

/// Failures creating a file or its parents read as "does not exist"
fn create_error(e: io::Error) -> Reject {
    match Reject::io(e) {
        Reject {
            code: NakCode::FileProtected,
            ..
        } => NakCode::FileNotFound.into(),
        reject => reject,
    }
}

/// Read up to `len` bytes at `offset`
fn read_at(file: &mut File, offset: u32, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
