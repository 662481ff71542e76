//! Skylink transfer client - the public coordinator
//!
//! Every operation comes in two forms: a `*_async` method taking a callback,
//! and an `async fn` that resolves to the same terminal result. One operation
//! runs at a time; starting another while one is active fails immediately
//! with [`FtpResult::Busy`] and leaves the running one untouched.
//!
//! Must be used from within a Tokio runtime.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use skylink_core::{ClientConfig, DirEntry, Frame, FtpResult};

use crate::operation::{DriverEvent, Operation};
use crate::progress::{Completion, ProgressData, TransferReporter};
use crate::retry::SequenceCounter;
use crate::session::{OperationKind, Session};
use crate::stats::{ClientStats, ClientStatsSnapshot};
use crate::transport::{InboundSink, Transport};

/// The operation currently holding the client
struct ActiveOperation {
    id: u64,
    kind: OperationKind,
    events: mpsc::UnboundedSender<DriverEvent>,
}

/// State shared between the public handle, the inbound path and drivers
pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ClientConfig,
    pub(crate) seq: SequenceCounter,
    pub(crate) stats: ClientStats,
    active: Mutex<Option<ActiveOperation>>,
    next_id: AtomicU64,
}

impl ClientInner {
    /// Claim the client for a new operation
    fn begin(self: &Arc<Self>, kind: OperationKind, path: &str) -> Result<Operation, FtpResult> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            debug!(requested = ?kind, running = ?current.kind, "client busy");
            return Err(FtpResult::Busy);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *active = Some(ActiveOperation {
            id,
            kind,
            events: tx,
        });
        ClientStats::add(&self.stats.operations_started, 1);
        Ok(Operation::new(self.clone(), id, Session::new(kind, path), rx))
    }

    /// Free the slot held by operation `id`
    pub(crate) fn release(&self, id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map_or(false, |op| op.id == id) {
            *active = None;
        }
    }

    fn handle_inbound(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                ClientStats::add(&self.stats.decode_errors, 1);
                debug!("Dropping frame: {}", e);
                return;
            }
        };
        ClientStats::add(&self.stats.frames_received, 1);

        let delivered = match self.active.lock().as_ref() {
            Some(op) => op.events.send(DriverEvent::Frame(frame)).is_ok(),
            None => false,
        };
        if !delivered {
            ClientStats::add(&self.stats.stale_frames, 1);
            trace!("no operation waiting for frame");
        }
    }
}

/// Skylink transfer client
#[derive(Clone)]
pub struct FtpClient {
    inner: Arc<ClientInner>,
}

impl FtpClient {
    /// Create a client sending through `transport`
    ///
    /// Inbound frames must be handed to [`InboundSink::handle_inbound`].
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                seq: SequenceCounter::new(),
                stats: ClientStats::default(),
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// An operation is in flight
    pub fn is_busy(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Kind of the operation in flight
    pub fn active_operation(&self) -> Option<OperationKind> {
        self.inner.active.lock().as_ref().map(|op| op.kind)
    }

    /// Cancel the operation in flight
    ///
    /// The operation ends with `Cancelled` without waiting for the peer; an
    /// open remote session is terminated best effort. Returns false when
    /// nothing is running.
    pub fn cancel(&self) -> bool {
        match self.inner.active.lock().as_ref() {
            Some(op) => op.events.send(DriverEvent::Cancel).is_ok(),
            None => false,
        }
    }

    fn launch<T, F, Fut>(&self, kind: OperationKind, path: &str, completion: Completion<T>, run: F)
    where
        T: Send + 'static,
        F: FnOnce(Operation) -> Fut,
        Fut: Future<Output = Result<T, FtpResult>> + Send + 'static,
    {
        match self.inner.begin(kind, path) {
            Ok(op) => {
                let fut = run(op);
                tokio::spawn(async move { completion.complete(fut.await) });
            }
            Err(kind) => completion.complete(Err(kind)),
        }
    }

    /// Upload a local file into `remote_dir`
    ///
    /// `callback` sees `Next` per written chunk, then one terminal result.
    pub fn upload_async(
        &self,
        local_path: impl AsRef<Path>,
        remote_dir: &str,
        callback: impl FnMut(FtpResult, ProgressData) + Send + 'static,
    ) {
        let local = local_path.as_ref().to_path_buf();
        let mut reporter = TransferReporter::new(Box::new(callback));
        let mut op = match self
            .inner
            .begin(OperationKind::Upload, &local.to_string_lossy())
        {
            Ok(op) => op,
            Err(kind) => return reporter.finish(kind),
        };
        let remote_dir = remote_dir.to_string();
        tokio::spawn(async move {
            let result = op.upload(&local, &remote_dir, &mut reporter).await;
            let result = op.finish(result);
            reporter.finish(result.err().unwrap_or(FtpResult::Success));
        });
    }

    /// Download `remote_path` into `local_dir`, creating the directory
    pub fn download_async(
        &self,
        remote_path: &str,
        local_dir: impl AsRef<Path>,
        callback: impl FnMut(FtpResult, ProgressData) + Send + 'static,
    ) {
        let mut reporter = TransferReporter::new(Box::new(callback));
        let mut op = match self.inner.begin(OperationKind::Download, remote_path) {
            Ok(op) => op,
            Err(kind) => return reporter.finish(kind),
        };
        let remote = remote_path.to_string();
        let local = local_dir.as_ref().to_path_buf();
        tokio::spawn(async move {
            let result = op.download(&remote, &local, &mut reporter).await;
            let result = op.finish(result);
            reporter.finish(result.err().unwrap_or(FtpResult::Success));
        });
    }

    pub fn list_directory_async(
        &self,
        path: &str,
        callback: impl FnOnce(Result<Vec<DirEntry>, FtpResult>) + Send + 'static,
    ) {
        let target = path.to_string();
        self.launch(
            OperationKind::ListDirectory,
            path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.list_directory(&target).await;
                op.finish(result)
            },
        );
    }

    pub fn remove_file_async(
        &self,
        path: &str,
        callback: impl FnOnce(Result<(), FtpResult>) + Send + 'static,
    ) {
        let target = path.to_string();
        self.launch(
            OperationKind::RemoveFile,
            path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.remove_file(&target).await;
                op.finish(result)
            },
        );
    }

    pub fn remove_directory_async(
        &self,
        path: &str,
        callback: impl FnOnce(Result<(), FtpResult>) + Send + 'static,
    ) {
        let target = path.to_string();
        self.launch(
            OperationKind::RemoveDirectory,
            path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.remove_directory(&target).await;
                op.finish(result)
            },
        );
    }

    pub fn create_directory_async(
        &self,
        path: &str,
        callback: impl FnOnce(Result<(), FtpResult>) + Send + 'static,
    ) {
        let target = path.to_string();
        self.launch(
            OperationKind::CreateDirectory,
            path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.create_directory(&target).await;
                op.finish(result)
            },
        );
    }

    pub fn rename_async(
        &self,
        from: &str,
        to: &str,
        callback: impl FnOnce(Result<(), FtpResult>) + Send + 'static,
    ) {
        let (source, target) = (from.to_string(), to.to_string());
        self.launch(
            OperationKind::Rename,
            from,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.rename(&source, &target).await;
                op.finish(result)
            },
        );
    }

    pub fn calc_file_crc32_async(
        &self,
        path: &str,
        callback: impl FnOnce(Result<u32, FtpResult>) + Send + 'static,
    ) {
        let target = path.to_string();
        self.launch(
            OperationKind::CalcFileCrc32,
            path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.calc_file_crc32(&target).await;
                op.finish(result)
            },
        );
    }

    /// Compare a local file with a remote one by CRC32
    pub fn are_files_identical_async(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        callback: impl FnOnce(Result<bool, FtpResult>) + Send + 'static,
    ) {
        let local = local_path.as_ref().to_path_buf();
        let remote = remote_path.to_string();
        self.launch(
            OperationKind::CalcFileCrc32,
            remote_path,
            Completion::new(callback),
            move |mut op| async move {
                let result = op.are_files_identical(&local, &remote).await;
                op.finish(result)
            },
        );
    }

    /// Ask the server to drop every open session
    pub fn reset_sessions_async(
        &self,
        callback: impl FnOnce(Result<(), FtpResult>) + Send + 'static,
    ) {
        self.launch(
            OperationKind::ResetSessions,
            "",
            Completion::new(callback),
            move |mut op| async move {
                let result = op.reset_sessions().await;
                op.finish(result)
            },
        );
    }

    pub async fn upload(&self, local_path: impl AsRef<Path>, remote_dir: &str) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.upload_async(local_path, remote_dir, terminal_sender(tx));
        transfer_result(rx).await
    }

    pub async fn download(&self, remote_path: &str, local_dir: impl AsRef<Path>) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.download_async(remote_path, local_dir, terminal_sender(tx));
        transfer_result(rx).await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.list_directory_async(path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.remove_file_async(path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn remove_directory(&self, path: &str) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.remove_directory_async(path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.create_directory_async(path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.rename_async(from, to, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn calc_file_crc32(&self, path: &str) -> Result<u32, FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.calc_file_crc32_async(path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn are_files_identical(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<bool, FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.are_files_identical_async(local_path, remote_path, move |r| send_result(tx, r));
        value_result(rx).await
    }

    pub async fn reset_sessions(&self) -> Result<(), FtpResult> {
        let (tx, rx) = oneshot::channel();
        self.reset_sessions_async(move |r| send_result(tx, r));
        value_result(rx).await
    }
}

impl InboundSink for FtpClient {
    fn handle_inbound(&self, frame: &[u8]) {
        self.inner.handle_inbound(frame);
    }
}

fn send_result<T>(tx: oneshot::Sender<Result<T, FtpResult>>, result: Result<T, FtpResult>) {
    if tx.send(result).is_err() {
        trace!("result receiver dropped");
    }
}

/// Transfer callback forwarding only the terminal result
fn terminal_sender(tx: oneshot::Sender<FtpResult>) -> impl FnMut(FtpResult, ProgressData) + Send {
    let mut tx = Some(tx);
    move |result, _| {
        if result.is_terminal() {
            if let Some(tx) = tx.take() {
                if tx.send(result).is_err() {
                    trace!("result receiver dropped");
                }
            }
        }
    }
}

async fn transfer_result(rx: oneshot::Receiver<FtpResult>) -> Result<(), FtpResult> {
    match rx.await {
        Ok(FtpResult::Success) => Ok(()),
        Ok(kind) => Err(kind),
        Err(_) => Err(FtpResult::Cancelled),
    }
}

async fn value_result<T>(rx: oneshot::Receiver<Result<T, FtpResult>>) -> Result<T, FtpResult> {
    rx.await.unwrap_or(Err(FtpResult::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use skylink_core::{EntryKind, ServerConfig};
    use tempfile::{tempdir, TempDir};

    use crate::server::FtpServer;
    use crate::transport::{channel, ChannelTransport, LossPattern, LossyTransport};

    struct Link {
        client: FtpClient,
        server: Arc<FtpServer>,
        uplink: Arc<LossyTransport<ChannelTransport>>,
        downlink: Arc<LossyTransport<ChannelTransport>>,
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            request_timeout_ms: 40,
            max_retries: 3,
            burst_gap_timeout_ms: 40,
            ..ClientConfig::default()
        }
    }

    fn link_with(config: ClientConfig, up: LossPattern, down: LossPattern) -> Link {
        let (up_tx, up_rx) = channel();
        let (down_tx, down_rx) = channel();
        let uplink = Arc::new(LossyTransport::new(up_tx, up));
        let downlink = Arc::new(LossyTransport::new(down_tx, down));

        let client = FtpClient::new(uplink.clone(), config);
        let server = Arc::new(FtpServer::new(downlink.clone(), ServerConfig::default()));
        up_rx.pump(server.clone());
        down_rx.pump(Arc::new(client.clone()));

        Link {
            client,
            server,
            uplink,
            downlink,
        }
    }

    fn link() -> Link {
        link_with(fast_config(), LossPattern::None, LossPattern::None)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn local_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_before_and_after_root() {
        let link = link();
        let local = tempdir().unwrap();
        let root = tempdir().unwrap();
        let file = local_file(&local, "fifty.bin", &pattern(50));

        assert_eq!(
            link.client.upload(&file, "/").await,
            Err(FtpResult::FileDoesNotExist)
        );
        assert!(!link.client.is_busy());

        link.server.set_root_dir(root.path()).unwrap();
        assert_eq!(link.client.upload(&file, "/").await, Ok(()));
        assert_eq!(
            fs::read(root.path().join("fifty.bin")).unwrap(),
            fs::read(&file).unwrap()
        );
        assert_eq!(link.server.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for use_burst in [true, false] {
            let config = ClientConfig {
                use_burst,
                ..fast_config()
            };
            let link = link_with(config, LossPattern::None, LossPattern::None);
            let local = tempdir().unwrap();
            let root = tempdir().unwrap();
            let out = tempdir().unwrap();
            link.server.set_root_dir(root.path()).unwrap();

            for size in [0usize, 1, 238, 239, 240, 5_000, 70_000] {
                let name = format!("f{}.bin", size);
                let content = pattern(size);
                let file = local_file(&local, &name, &content);

                link.client.upload(&file, "/up").await.unwrap();
                let dest = out.path().join("nested/dir");
                link.client
                    .download(&format!("/up/{}", name), &dest)
                    .await
                    .unwrap();

                let got = fs::read(dest.join(&name)).unwrap();
                assert_eq!(got, content, "size {} burst {}", size, use_burst);
                assert_eq!(
                    link.client.calc_file_crc32(&format!("up/{}", name)).await,
                    Ok(crc32fast::hash(&content))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_busy_rejection() {
        let link = link();
        let local = tempdir().unwrap();
        let root = tempdir().unwrap();
        link.server.set_root_dir(root.path()).unwrap();
        let file = local_file(&local, "big.bin", &pattern(50_000));

        let (tx, rx) = oneshot::channel();
        link.client.upload_async(&file, "/", terminal_sender(tx));
        assert_eq!(link.client.active_operation(), Some(OperationKind::Upload));

        let second = Arc::new(Mutex::new(Vec::new()));
        let sink = second.clone();
        link.client
            .download_async("/big.bin", local.path(), move |r, _| sink.lock().push(r));
        // Rejected synchronously, before the first operation made progress.
        assert_eq!(*second.lock(), vec![FtpResult::Busy]);

        assert_eq!(rx.await.unwrap(), FtpResult::Success);
        assert_eq!(fs::read(root.path().join("big.bin")).unwrap(), pattern(50_000));
        assert!(!link.client.is_busy());
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let link = link_with(fast_config(), LossPattern::All, LossPattern::None);
        assert_eq!(
            link.client.remove_file("/gone.txt").await,
            Err(FtpResult::Timeout)
        );
        let stats = link.client.stats();
        assert_eq!(stats.retransmissions, 3);
        assert_eq!(link.uplink.sent(), 4);
        assert_eq!(stats.operations_failed, 1);
    }

    #[tokio::test]
    async fn test_lossy_link_completes() {
        let link = link_with(
            fast_config(),
            LossPattern::EveryNth(4),
            LossPattern::EveryNth(5),
        );
        let local = tempdir().unwrap();
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        link.server.set_root_dir(root.path()).unwrap();
        let content = pattern(6_000);
        let file = local_file(&local, "lossy.bin", &content);

        link.client.upload(&file, "/").await.unwrap();
        link.client.download("/lossy.bin", out.path()).await.unwrap();

        assert_eq!(fs::read(out.path().join("lossy.bin")).unwrap(), content);
        assert!(link.client.stats().retransmissions > 0);
        assert!(link.uplink.dropped() > 0);
        assert!(link.downlink.dropped() > 0);
    }

    #[tokio::test]
    async fn test_burst_survives_reply_loss() {
        let config = ClientConfig {
            burst_window_bytes: 1024,
            ..fast_config()
        };
        let link = link_with(config, LossPattern::None, LossPattern::EveryNth(3));
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let content = pattern(20_000);
        fs::write(root.path().join("burst.bin"), &content).unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        link.client.download("/burst.bin", out.path()).await.unwrap();
        assert_eq!(fs::read(out.path().join("burst.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_progress_reporting() {
        let link = link();
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(root.path().join("p.bin"), pattern(1_000)).unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let (tx, rx) = oneshot::channel();
        let mut done = terminal_sender(tx);
        link.client.download_async("/p.bin", out.path(), move |r, p| {
            sink.lock().push((r, p));
            done(r, p);
        });
        assert_eq!(rx.await.unwrap(), FtpResult::Success);

        let log = log.lock();
        let (last, rest) = log.split_last().unwrap();
        assert!(!rest.is_empty());
        assert!(rest.iter().all(|(r, _)| *r == FtpResult::Next));
        assert_eq!(last.0, FtpResult::Success);
        assert_eq!(last.1.bytes_transferred, 1_000);
        assert_eq!(last.1.total_bytes, 1_000);
    }

    #[tokio::test]
    async fn test_cancel() {
        let config = ClientConfig {
            request_timeout_ms: 1_000,
            ..fast_config()
        };
        let link = link_with(config, LossPattern::All, LossPattern::None);

        let (tx, rx) = oneshot::channel();
        link.client
            .remove_file_async("/x", move |r| send_result(tx, r));
        assert!(link.client.cancel());

        let result = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(FtpResult::Cancelled));
        assert!(!link.client.is_busy());
        assert!(!link.client.cancel());
    }

    #[tokio::test]
    async fn test_jail_containment() {
        let link = link();
        let outer = tempdir().unwrap();
        let root = outer.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), b"secret").unwrap();
        link.server.set_root_dir(&root).unwrap();
        let out = tempdir().unwrap();

        for path in ["../secret.txt", "/../secret.txt", "sub/../../secret.txt"] {
            assert_eq!(
                link.client.download(path, out.path()).await,
                Err(FtpResult::FileDoesNotExist),
                "{}",
                path
            );
            assert_eq!(
                link.client.remove_file(path).await,
                Err(FtpResult::FileDoesNotExist)
            );
        }
        assert!(outer.path().join("secret.txt").exists());
        assert!(!out.path().join("secret.txt").exists());
    }

    #[tokio::test]
    async fn test_list_directory() {
        let link = link();
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("logs")).unwrap();
        for i in 0..30 {
            fs::write(
                root.path().join(format!("flight_log_{:03}.ulg", i)),
                pattern(i),
            )
            .unwrap();
        }
        link.server.set_root_dir(root.path()).unwrap();

        let entries = link.client.list_directory("/").await.unwrap();
        assert_eq!(entries.len(), 31);
        assert_eq!(entries[0].name, "flight_log_000.ulg");
        assert_eq!(entries[29].size, 29);
        assert!(entries[30].is_dir());
        assert_eq!(
            entries.iter().filter(|e| e.kind == EntryKind::File).count(),
            30
        );

        let empty = link.client.list_directory("/logs").await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(
            link.client.list_directory("/missing").await,
            Err(FtpResult::FileDoesNotExist)
        );
    }

    #[tokio::test]
    async fn test_remote_file_management() {
        let link = link();
        let root = tempdir().unwrap();
        let local = tempdir().unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        link.client.create_directory("/data").await.unwrap();
        assert_eq!(
            link.client.create_directory("/data").await,
            Err(FtpResult::FileExists)
        );

        let file = local_file(&local, "a.bin", &pattern(700));
        link.client.upload(&file, "/data").await.unwrap();
        assert_eq!(link.client.are_files_identical(&file, "/data/a.bin").await, Ok(true));

        link.client.rename("/data/a.bin", "/data/b.bin").await.unwrap();
        assert_eq!(
            link.client.are_files_identical(&file, "/data/a.bin").await,
            Err(FtpResult::FileDoesNotExist)
        );
        let other = local_file(&local, "other.bin", &pattern(10));
        assert_eq!(link.client.are_files_identical(&other, "/data/b.bin").await, Ok(false));

        link.client.remove_file("/data/b.bin").await.unwrap();
        link.client.remove_directory("/data").await.unwrap();
        assert!(!root.path().join("data").exists());
        link.client.reset_sessions().await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let link = link();
        let root = tempdir().unwrap();
        link.server.set_root_dir(root.path()).unwrap();
        assert_eq!(
            link.client.upload("/nonexistent/file.bin", "/").await,
            Err(FtpResult::FileDoesNotExist)
        );
        // Nothing reached the wire.
        assert_eq!(link.uplink.sent(), 0);
    }

    #[tokio::test]
    async fn test_provided_file_download() {
        let link = link();
        let elsewhere = tempdir().unwrap();
        let out = tempdir().unwrap();
        let file = local_file(&elsewhere, "params.dat", &pattern(333));
        link.server.provide_file(&file);

        link.client.download("/params.dat", out.path()).await.unwrap();
        assert_eq!(fs::read(out.path().join("params.dat")).unwrap(), pattern(333));
    }

    #[tokio::test]
    async fn test_inbound_noise_is_absorbed() {
        let link = link();
        link.client.handle_inbound(&[1, 2, 3]);
        let stray = Frame::ack(&Frame::request(skylink_core::Opcode::ReadFile)).encode();
        link.client.handle_inbound(&stray);

        let stats = link.client.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.stale_frames, 1);
        assert!(!link.client.is_busy());
    }

    #[tokio::test]
    async fn test_multi_megabyte_round_trip() {
        let link = link();
        let local = tempdir().unwrap();
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        let size = 3 * 1024 * 1024 + 17;
        let content = pattern(size);
        let file = local_file(&local, "survey.bin", &content);

        link.client.upload(&file, "/").await.unwrap();
        link.client.download("/survey.bin", out.path()).await.unwrap();

        assert_eq!(fs::read(out.path().join("survey.bin")).unwrap(), content);
        let stats = link.client.stats();
        assert_eq!(stats.bytes_sent, size as u64);
        assert_eq!(stats.bytes_received, size as u64);
    }

    #[tokio::test]
    async fn test_cancel_releases_remote_session() {
        let config = ClientConfig {
            use_burst: false,
            ..fast_config()
        };
        let link = link_with(config, LossPattern::None, LossPattern::None);
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(root.path().join("big.bin"), pattern(200_000)).unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        let sessions_seen = Arc::new(Mutex::new(None));
        let seen = sessions_seen.clone();
        let server = link.server.clone();
        let client = link.client.clone();
        let (tx, rx) = oneshot::channel();
        let mut done = terminal_sender(tx);
        link.client.download_async("/big.bin", out.path(), move |r, p| {
            if r == FtpResult::Next {
                let mut seen = seen.lock();
                if seen.is_none() {
                    *seen = Some(server.open_sessions());
                    client.cancel();
                }
            }
            done(r, p);
        });

        assert_eq!(rx.await.unwrap(), FtpResult::Cancelled);
        assert_eq!(*sessions_seen.lock(), Some(1));
        assert!(!link.client.is_busy());

        // TerminateSession is fire and forget; wait for the server to see it.
        for _ in 0..50 {
            if link.server.open_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(link.server.open_sessions(), 0);
        assert!(!out.path().join("big.bin").exists());
        assert!(!out.path().join(".big.bin.part").exists());
    }

    #[tokio::test]
    async fn test_crc_mismatch_keeps_existing_local_file() {
        let config = ClientConfig {
            use_burst: false,
            ..fast_config()
        };
        let link = link_with(config, LossPattern::None, LossPattern::None);
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let remote = root.path().join("log.bin");
        fs::write(&remote, pattern(600)).unwrap();
        fs::write(out.path().join("log.bin"), b"previous download").unwrap();
        link.server.set_root_dir(root.path()).unwrap();

        let (tx, rx) = oneshot::channel();
        let mut done = terminal_sender(tx);
        let mut rewritten = false;
        link.client.download_async("/log.bin", out.path(), move |r, p| {
            if r == FtpResult::Next && !rewritten {
                // Same length, new bytes: later chunks and the remote CRC32 change.
                fs::write(&remote, vec![0xEE; 600]).unwrap();
                rewritten = true;
            }
            done(r, p);
        });

        assert_eq!(rx.await.unwrap(), FtpResult::ProtocolError);
        assert_eq!(
            fs::read(out.path().join("log.bin")).unwrap(),
            b"previous download"
        );
        assert!(!out.path().join(".log.bin.part").exists());
    }

    /// Delivers server replies to every client on a shared link
    struct Broadcast(Vec<FtpClient>);

    impl InboundSink for Broadcast {
        fn handle_inbound(&self, frame: &[u8]) {
            for client in &self.0 {
                client.handle_inbound(frame);
            }
        }
    }

    #[tokio::test]
    async fn test_second_client_gets_fresh_replies() {
        let (up_tx, up_rx) = channel();
        let (down_tx, down_rx) = channel();
        let server = Arc::new(FtpServer::new(Arc::new(down_tx), ServerConfig::default()));
        let root = tempdir().unwrap();
        server.set_root_dir(root.path()).unwrap();

        let first = FtpClient::new(Arc::new(up_tx.clone()), fast_config());
        let second = FtpClient::new(Arc::new(up_tx), fast_config());
        up_rx.pump(server.clone());
        down_rx.pump(Arc::new(Broadcast(vec![first.clone(), second.clone()])));

        let file = root.path().join("f.bin");
        fs::write(&file, b"first contents").unwrap();
        assert_eq!(
            first.calc_file_crc32("/f.bin").await,
            Ok(crc32fast::hash(b"first contents"))
        );
        fs::write(&file, b"second contents").unwrap();
        assert_eq!(
            second.calc_file_crc32("/f.bin").await,
            Ok(crc32fast::hash(b"second contents"))
        );

        first.create_directory("/d").await.unwrap();
        fs::remove_dir(root.path().join("d")).unwrap();
        second.create_directory("/d").await.unwrap();
        assert!(root.path().join("d").is_dir());
    }
}
