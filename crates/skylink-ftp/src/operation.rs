//! Operation driver
//!
//! One [`Operation`] runs in its own task per client operation. It owns the
//! session state machine and the single outstanding request, and is fed
//! inbound frames by the client through an unbounded channel. Timers are
//! per request: each wait races the inbound channel against the request's
//! deadline.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use skylink_core::path::{file_name, join};
use skylink_core::{
    file_crc32, parse_entries, Crc32, DirEntry, EntryKind, Frame, FtpResult, NakCode, Opcode,
    MAX_DATA_LEN, MAX_PATH_LEN,
};

use crate::burst::{BurstScheduler, ChunkOutcome};
use crate::client::ClientInner;
use crate::progress::TransferReporter;
use crate::retry::{Expiry, Match, Outstanding, RetryPolicy};
use crate::session::{Session, SessionState, TransitionError};
use crate::stats::ClientStats;

/// Input to a running operation
#[derive(Debug)]
pub(crate) enum DriverEvent {
    Frame(Frame),
    Cancel,
}

/// How a burst ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BurstEnd {
    /// Every frame up to the one flagged complete arrived in order
    Complete,
    /// A gap did not close in time; continue with a sequential read
    Broken,
}

/// Downloaded bytes on their way to disk
struct LocalSink {
    file: BufWriter<File>,
    crc: Crc32,
}

impl LocalSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.crc.update(data);
        Ok(())
    }
}

fn step(result: Result<(), TransitionError>) -> Result<(), FtpResult> {
    result.map_err(|e| {
        warn!("{}", e);
        FtpResult::ProtocolError
    })
}

/// Map a local filesystem error onto a result kind
fn local_error(e: io::Error) -> FtpResult {
    debug!("local I/O error: {}", e);
    match e.kind() {
        io::ErrorKind::NotFound => FtpResult::FileDoesNotExist,
        io::ErrorKind::AlreadyExists => FtpResult::FileExists,
        io::ErrorKind::PermissionDenied => FtpResult::FileProtected,
        _ => FtpResult::ProtocolError,
    }
}

fn path_request(opcode: Opcode, path: &str) -> Result<Frame, FtpResult> {
    if path.len() > MAX_PATH_LEN || path.contains('\0') {
        return Err(FtpResult::InvalidParameter);
    }
    Ok(Frame::request(opcode).with_path(path))
}

/// Fill `buf` from `file`, short only at end of file
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A running client operation
pub(crate) struct Operation {
    inner: Arc<ClientInner>,
    id: u64,
    session: Session,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    policy: RetryPolicy,
}

impl Operation {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        id: u64,
        session: Session,
        events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&inner.config);
        Self {
            inner,
            id,
            session,
            events,
            policy,
        }
    }

    fn send(&self, bytes: &[u8]) {
        ClientStats::add(&self.inner.stats.frames_sent, 1);
        if let Err(e) = self.inner.transport.send(bytes) {
            warn!("Failed to send frame: {}", e);
        }
    }

    /// Assign a sequence number, send, and start tracking
    fn start(&self, mut frame: Frame) -> Outstanding {
        frame.seq_number = self.inner.seq.next();
        trace!(seq = frame.seq_number, opcode = ?frame.opcode, offset = frame.offset, "request");
        let out = Outstanding::new(frame, self.policy, Instant::now());
        self.send(out.encoded());
        out
    }

    fn frame_of(event: Option<DriverEvent>) -> Result<Frame, FtpResult> {
        match event {
            Some(DriverEvent::Frame(frame)) => Ok(frame),
            Some(DriverEvent::Cancel) | None => Err(FtpResult::Cancelled),
        }
    }

    fn stale(&self, frame: &Frame) {
        ClientStats::add(&self.inner.stats.stale_frames, 1);
        trace!(seq = frame.seq_number, opcode = ?frame.opcode, "stale frame");
    }

    fn expire(&self, out: &mut Outstanding) -> Result<(), FtpResult> {
        match out.on_deadline(Instant::now()) {
            Expiry::Resend => {
                ClientStats::add(&self.inner.stats.retransmissions, 1);
                debug!(
                    seq = out.frame().seq_number,
                    opcode = ?out.frame().opcode,
                    attempt = out.resends(),
                    "resending"
                );
                self.send(out.encoded());
                Ok(())
            }
            Expiry::Exhausted => {
                warn!(
                    "No reply to {:?} after {} retries",
                    out.frame().opcode,
                    out.resends()
                );
                Err(FtpResult::Timeout)
            }
        }
    }

    /// Send `frame` and wait for its reply (Ack or Nak)
    async fn request(&mut self, frame: Frame) -> Result<Frame, FtpResult> {
        let mut out = self.start(frame);
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let frame = Self::frame_of(event)?;
                    match out.classify(&frame) {
                        Match::Reply => return Ok(frame),
                        Match::BurstChunk | Match::Stale => self.stale(&frame),
                    }
                }
                _ = sleep_until(out.deadline()) => self.expire(&mut out)?,
            }
        }
    }

    /// Like [`request`](Self::request), with a Nak turned into its result kind
    async fn request_ack(&mut self, frame: Frame) -> Result<Frame, FtpResult> {
        let reply = self.request(frame).await?;
        match reply.nak_code() {
            Some(code) => {
                debug!(?code, "request refused");
                Err(FtpResult::from_nak(code))
            }
            None => Ok(reply),
        }
    }

    /// Open-and-done operations: one request, no data phase
    async fn one_shot(&mut self, frame: Frame) -> Result<Frame, FtpResult> {
        step(self.session.begin())?;
        let reply = self.request_ack(frame).await?;
        step(self.session.opened(None, None))?;
        step(self.session.closed())?;
        Ok(reply)
    }

    pub(crate) async fn remove_file(&mut self, path: &str) -> Result<(), FtpResult> {
        self.one_shot(path_request(Opcode::RemoveFile, path)?)
            .await
            .map(|_| ())
    }

    pub(crate) async fn remove_directory(&mut self, path: &str) -> Result<(), FtpResult> {
        self.one_shot(path_request(Opcode::RemoveDirectory, path)?)
            .await
            .map(|_| ())
    }

    pub(crate) async fn create_directory(&mut self, path: &str) -> Result<(), FtpResult> {
        self.one_shot(path_request(Opcode::CreateDirectory, path)?)
            .await
            .map(|_| ())
    }

    pub(crate) async fn rename(&mut self, from: &str, to: &str) -> Result<(), FtpResult> {
        if from.len() + 1 + to.len() > MAX_DATA_LEN || from.contains('\0') || to.contains('\0') {
            return Err(FtpResult::InvalidParameter);
        }
        let mut data = Vec::with_capacity(from.len() + 1 + to.len());
        data.extend_from_slice(from.as_bytes());
        data.push(0);
        data.extend_from_slice(to.as_bytes());
        self.one_shot(Frame::request(Opcode::Rename).with_data(&data))
            .await
            .map(|_| ())
    }

    pub(crate) async fn reset_sessions(&mut self) -> Result<(), FtpResult> {
        self.one_shot(Frame::request(Opcode::ResetSessions))
            .await
            .map(|_| ())
    }

    pub(crate) async fn calc_file_crc32(&mut self, path: &str) -> Result<u32, FtpResult> {
        let reply = self
            .one_shot(path_request(Opcode::CalcFileCRC32, path)?)
            .await?;
        reply.crc32().ok_or_else(|| {
            warn!("CRC32 reply without checksum");
            FtpResult::ProtocolError
        })
    }

    pub(crate) async fn are_files_identical(
        &mut self,
        local: &Path,
        remote: &str,
    ) -> Result<bool, FtpResult> {
        let local_crc = file_crc32(local).map_err(local_error)?;
        let remote_crc = self.calc_file_crc32(remote).await?;
        debug!(local_crc, remote_crc, "compared checksums");
        Ok(local_crc == remote_crc)
    }

    pub(crate) async fn list_directory(&mut self, path: &str) -> Result<Vec<DirEntry>, FtpResult> {
        let request = path_request(Opcode::ListDirectory, path)?;
        step(self.session.begin())?;

        let mut entries = Vec::new();
        loop {
            let reply = self
                .request(request.clone().with_offset(self.session.offset()))
                .await?;
            match reply.nak_code() {
                Some(NakCode::Eof) => {
                    if self.session.state() == SessionState::Opening {
                        step(self.session.opened(None, None))?;
                    }
                    break;
                }
                Some(code) => return Err(FtpResult::from_nak(code)),
                None => {}
            }
            if self.session.state() == SessionState::Opening {
                step(self.session.opened(None, None))?;
            }

            let batch = parse_entries(&reply.data);
            if batch.is_empty() {
                warn!("Empty listing payload at entry {}", self.session.offset());
                return Err(FtpResult::ProtocolError);
            }
            step(self.session.advance(batch.len() as u32, 0))?;
            entries.extend(batch.into_iter().filter(|e| e.kind != EntryKind::Skip));
        }

        step(self.session.finish_transfer())?;
        step(self.session.closed())?;
        Ok(entries)
    }

    pub(crate) async fn download(
        &mut self,
        remote: &str,
        local_dir: &Path,
        reporter: &mut TransferReporter,
    ) -> Result<(), FtpResult> {
        let name = file_name(remote).ok_or(FtpResult::InvalidParameter)?;
        let open = path_request(Opcode::OpenFileRO, remote)?;

        step(self.session.begin())?;
        let reply = self.request_ack(open).await?;
        let size = reply.data_u32().ok_or_else(|| {
            warn!("Open reply without file size");
            FtpResult::ProtocolError
        })?;
        let session_id = reply.session;
        step(self.session.opened(Some(session_id), Some(size as u64)))?;
        info!(session = session_id, size, "downloading {}", remote);

        // Data lands in a sibling file; an existing target is only replaced
        // once the whole transfer succeeded.
        fs::create_dir_all(local_dir).map_err(local_error)?;
        let target = local_dir.join(name);
        let partial = local_dir.join(format!(".{}.part", name));
        let file = File::create(&partial).map_err(local_error)?;
        let mut sink = LocalSink {
            file: BufWriter::new(file),
            crc: Crc32::new(),
        };

        let result = self
            .receive(remote, session_id, size, &mut sink, reporter)
            .await;
        drop(sink);
        let result = result.and_then(|()| fs::rename(&partial, &target).map_err(local_error));
        if result.is_err() {
            if let Err(e) = fs::remove_file(&partial) {
                debug!("could not remove partial file {:?}: {}", partial, e);
            }
        }
        result
    }

    async fn receive(
        &mut self,
        remote: &str,
        session_id: u8,
        size: u32,
        sink: &mut LocalSink,
        reporter: &mut TransferReporter,
    ) -> Result<(), FtpResult> {
        let mut sched = BurstScheduler::new(0, Some(size), self.inner.config.burst_window_bytes);

        while !sched.is_complete() {
            if self.inner.config.use_burst {
                let before = sched.next_offset();
                let end = self
                    .burst_read(session_id, &mut sched, sink, reporter)
                    .await?;
                let stalled = sched.next_offset() == before;
                if !sched.is_complete() && (end == BurstEnd::Broken || stalled) {
                    self.sequential_read(session_id, &mut sched, sink, reporter)
                        .await?;
                }
            } else {
                self.sequential_read(session_id, &mut sched, sink, reporter)
                    .await?;
            }
        }

        sink.file.flush().map_err(local_error)?;
        step(self.session.finish_transfer())?;
        if self.inner.config.verify_crc32 {
            self.verify(remote, sink.crc.value()).await?;
        }
        self.terminate(session_id).await;
        step(self.session.closed())
    }

    /// Ask the server to stream from the contiguous offset
    async fn burst_read(
        &mut self,
        session_id: u8,
        sched: &mut BurstScheduler,
        sink: &mut LocalSink,
        reporter: &mut TransferReporter,
    ) -> Result<BurstEnd, FtpResult> {
        let budget = self.inner.config.burst_max_bytes;
        let gap = self.inner.config.burst_gap_timeout();
        let frame = Frame::request(Opcode::BurstReadFile)
            .with_session(session_id)
            .with_offset(sched.next_offset())
            .with_data(&budget.to_le_bytes());
        let mut out = self.start(frame);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let frame = Self::frame_of(event)?;
                    match out.classify(&frame) {
                        Match::Stale => self.stale(&frame),
                        Match::Reply | Match::BurstChunk => {
                            match frame.nak_code() {
                                Some(NakCode::Eof) => return Ok(BurstEnd::Broken),
                                Some(code) => return Err(FtpResult::from_nak(code)),
                                None => {}
                            }
                            self.absorb(sched, sink, reporter, frame.offset, &frame.data)?;
                            if sched.is_complete() || (frame.burst_complete && !sched.has_gap()) {
                                return Ok(BurstEnd::Complete);
                            }
                            if frame.burst_complete {
                                return Ok(BurstEnd::Broken);
                            }
                            out.extend(Instant::now(), gap);
                        }
                    }
                }
                _ = sleep_until(out.deadline()) => {
                    if out.is_settled() {
                        debug!(offset = sched.next_offset(), "burst stalled");
                        return Ok(BurstEnd::Broken);
                    }
                    self.expire(&mut out)?;
                }
            }
        }
    }

    /// Read one chunk at the contiguous offset
    async fn sequential_read(
        &mut self,
        session_id: u8,
        sched: &mut BurstScheduler,
        sink: &mut LocalSink,
        reporter: &mut TransferReporter,
    ) -> Result<(), FtpResult> {
        let offset = sched.next_offset();
        let len = sched.next_read_len(self.inner.config.effective_chunk_size()) as u32;
        let frame = Frame::request(Opcode::ReadFile)
            .with_session(session_id)
            .with_offset(offset)
            .with_data(&len.to_le_bytes());
        let reply = self.request(frame).await?;

        if let Some(code) = reply.nak_code() {
            warn!(offset, ?code, "read refused");
            return Err(match code {
                NakCode::Eof => FtpResult::ProtocolError,
                code => FtpResult::from_nak(code),
            });
        }
        if reply.data.is_empty() {
            warn!(offset, "empty read before end of file");
            return Err(FtpResult::ProtocolError);
        }
        self.absorb(sched, sink, reporter, offset, &reply.data)
    }

    fn absorb(
        &mut self,
        sched: &mut BurstScheduler,
        sink: &mut LocalSink,
        reporter: &mut TransferReporter,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FtpResult> {
        match sched.accept(offset, data) {
            ChunkOutcome::Ready(parts) => {
                for part in parts {
                    sink.write(&part).map_err(local_error)?;
                    step(self.session.advance(part.len() as u32, part.len() as u64))?;
                    ClientStats::add(&self.inner.stats.bytes_received, part.len() as u64);
                }
                reporter.next(
                    self.session.bytes_transferred(),
                    self.session.total_bytes().unwrap_or(0),
                );
            }
            ChunkOutcome::Buffered => trace!(offset, "chunk held behind gap"),
            ChunkOutcome::Duplicate => trace!(offset, "duplicate chunk"),
            ChunkOutcome::Overflow => debug!(offset, "burst window full, chunk dropped"),
        }
        Ok(())
    }

    pub(crate) async fn upload(
        &mut self,
        local: &Path,
        remote_dir: &str,
        reporter: &mut TransferReporter,
    ) -> Result<(), FtpResult> {
        let mut file = File::open(local).map_err(local_error)?;
        let meta = file.metadata().map_err(local_error)?;
        if !meta.is_file() {
            return Err(FtpResult::InvalidParameter);
        }
        let size = u32::try_from(meta.len()).map_err(|_| FtpResult::InvalidParameter)?;
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(FtpResult::InvalidParameter)?;
        let remote = join(remote_dir, name);
        let create = path_request(Opcode::CreateFile, &remote)?;

        step(self.session.begin())?;
        let reply = self.request_ack(create).await?;
        let session_id = reply.session;
        step(self.session.opened(Some(session_id), Some(size as u64)))?;
        info!(session = session_id, size, "uploading to {}", remote);

        let mut buf = vec![0u8; self.inner.config.effective_chunk_size()];
        let mut crc = Crc32::new();
        loop {
            let n = read_full(&mut file, &mut buf).map_err(local_error)?;
            if n == 0 {
                break;
            }
            let frame = Frame::request(Opcode::WriteFile)
                .with_session(session_id)
                .with_offset(self.session.offset())
                .with_data(&buf[..n]);
            self.request_ack(frame).await?;

            crc.update(&buf[..n]);
            step(self.session.advance(n as u32, n as u64))?;
            ClientStats::add(&self.inner.stats.bytes_sent, n as u64);
            reporter.next(self.session.bytes_transferred(), size as u64);
        }

        step(self.session.finish_transfer())?;
        if self.inner.config.verify_crc32 {
            self.verify(&remote, crc.value()).await?;
        }
        self.terminate(session_id).await;
        step(self.session.closed())
    }

    /// Compare a locally computed CRC32 with the peer's
    async fn verify(&mut self, remote: &str, local_crc: u32) -> Result<(), FtpResult> {
        let reply = self
            .request_ack(path_request(Opcode::CalcFileCRC32, remote)?)
            .await?;
        let remote_crc = reply.crc32().ok_or(FtpResult::ProtocolError)?;
        if remote_crc != local_crc {
            warn!(
                "CRC32 mismatch for {}: local {:08x}, remote {:08x}",
                remote, local_crc, remote_crc
            );
            return Err(FtpResult::ProtocolError);
        }
        Ok(())
    }

    /// Close the remote session; failure does not affect the result
    async fn terminate(&mut self, session_id: u8) {
        let frame = Frame::request(Opcode::TerminateSession).with_session(session_id);
        match self.request(frame).await {
            Ok(reply) => match reply.nak_code() {
                None => trace!(session = session_id, "session terminated"),
                Some(code) => debug!(session = session_id, ?code, "terminate refused"),
            },
            Err(kind) => warn!(session = session_id, "terminate failed: {}", kind),
        }
    }

    /// Record the outcome and release the client
    ///
    /// A failed operation holding a remote session sends one unacknowledged
    /// TerminateSession.
    pub(crate) fn finish<T>(mut self, result: Result<T, FtpResult>) -> Result<T, FtpResult> {
        match &result {
            Ok(_) => {
                ClientStats::add(&self.inner.stats.operations_completed, 1);
                debug!(kind = ?self.session.kind(), path = self.session.path(), "operation complete");
            }
            Err(kind) => {
                ClientStats::add(&self.inner.stats.operations_failed, 1);
                if let Err(e) = self.session.fail(*kind) {
                    trace!("{}", e);
                }
                if let Some(id) = self.session.session_id() {
                    let mut frame = Frame::request(Opcode::TerminateSession).with_session(id);
                    frame.seq_number = self.inner.seq.next();
                    self.send(&frame.encode());
                }
                info!(
                    kind = ?self.session.kind(),
                    path = self.session.path(),
                    "operation failed: {}",
                    kind
                );
            }
        }
        result
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.inner.release(self.id);
    }
}
