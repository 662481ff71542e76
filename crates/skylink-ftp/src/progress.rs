//! Progress reporting and single-assignment completion
//!
//! Every asynchronous operation ends in exactly one terminal callback.
//! Reporters are consumed by their terminal call, and a reporter dropped
//! without one (task aborted, runtime shut down) fires `Cancelled` so that no
//! caller is left waiting.

use skylink_core::FtpResult;
use tracing::warn;

/// Progress of an upload or download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressData {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl ProgressData {
    /// Completion percentage
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Callback for uploads and downloads
///
/// Called with `Next` for every chunk, then exactly once with a terminal
/// result.
pub type TransferCallback = Box<dyn FnMut(FtpResult, ProgressData) + Send>;

/// Drives a [`TransferCallback`]
pub struct TransferReporter {
    callback: Option<TransferCallback>,
    last: ProgressData,
}

impl TransferReporter {
    pub fn new(callback: TransferCallback) -> Self {
        Self {
            callback: Some(callback),
            last: ProgressData::default(),
        }
    }

    /// Report intermediate progress
    pub fn next(&mut self, bytes_transferred: u64, total_bytes: u64) {
        self.last = ProgressData {
            bytes_transferred,
            total_bytes,
        };
        if let Some(cb) = self.callback.as_mut() {
            cb(FtpResult::Next, self.last);
        }
    }

    /// Report the terminal result
    pub fn finish(mut self, result: FtpResult) {
        self.fire(result);
    }

    fn fire(&mut self, result: FtpResult) {
        let result = if result.is_terminal() {
            result
        } else {
            warn!("non-terminal result used to finish a transfer");
            FtpResult::ProtocolError
        };
        if let Some(mut cb) = self.callback.take() {
            cb(result, self.last);
        }
    }
}

impl Drop for TransferReporter {
    fn drop(&mut self) {
        if self.callback.is_some() {
            self.fire(FtpResult::Cancelled);
        }
    }
}

/// Single-assignment result slot for non-transfer operations
pub struct Completion<T> {
    callback: Option<Box<dyn FnOnce(Result<T, FtpResult>) + Send>>,
}

impl<T> Completion<T> {
    pub fn new(callback: impl FnOnce(Result<T, FtpResult>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: Result<T, FtpResult>) {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.take() {
            cb(Err(FtpResult::Cancelled));
        }
    }
}
