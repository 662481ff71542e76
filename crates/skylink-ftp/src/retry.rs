//! Retry/timeout engine
//!
//! Each outstanding request carries a deadline. On expiry the identical frame
//! (same sequence number) is resent until the retry budget is spent. A reply
//! is matched by sequence number and request opcode; once matched the request
//! is settled and any later duplicate is treated as stale.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use skylink_core::{ClientConfig, Frame, Opcode};

/// Largest sequence distance accepted for frames of one burst
const MAX_BURST_SPAN: u16 = u16::MAX / 2;

/// Timeout and resend budget for one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
        }
    }
}

/// Per-originator sequence numbers
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU16,
}

impl SequenceCounter {
    /// Counter starting at a random point
    ///
    /// A new client must not repeat the numbering of the client that talked
    /// to the same server before it.
    pub fn new() -> Self {
        let mut seed = [0u8; 2];
        if let Err(e) = getrandom::fill(&mut seed) {
            warn!("No random sequence seed: {}", e);
        }
        Self::starting_at(u16::from_le_bytes(seed))
    }

    pub fn starting_at(start: u16) -> Self {
        Self {
            next: AtomicU16::new(start),
        }
    }

    /// Take the next sequence number (wrapping)
    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of an inbound frame against the outstanding request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    /// The reply to this request
    Reply,
    /// A further data frame of the burst this request started
    BurstChunk,
    /// Unrelated, delayed or duplicate
    Stale,
}

/// What to do when the deadline passes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Resend,
    Exhausted,
}

/// One request awaiting its reply
#[derive(Debug)]
pub struct Outstanding {
    frame: Frame,
    encoded: Vec<u8>,
    policy: RetryPolicy,
    resends: u32,
    deadline: Instant,
    settled: bool,
}

impl Outstanding {
    /// Track `frame`, whose sequence number is already assigned
    pub fn new(frame: Frame, policy: RetryPolicy, now: Instant) -> Self {
        let encoded = frame.encode();
        Self {
            frame,
            encoded,
            policy,
            resends: 0,
            deadline: now + policy.timeout,
            settled: false,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resends performed so far
    pub fn resends(&self) -> u32 {
        self.resends
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Match an inbound frame; the first matching reply settles the request
    pub fn classify(&mut self, inbound: &Frame) -> Match {
        if !inbound.opcode.is_reply() || inbound.req_opcode != self.frame.opcode {
            return Match::Stale;
        }

        let distance = inbound.seq_number.wrapping_sub(self.frame.seq_number);

        if self.frame.opcode == Opcode::BurstReadFile
            && inbound.opcode == Opcode::Ack
            && inbound.session == self.frame.session
            && (1..=MAX_BURST_SPAN).contains(&distance)
        {
            if self.settled {
                return Match::BurstChunk;
            }
            self.settled = true;
            return Match::Reply;
        }

        if self.settled || distance != 1 {
            return Match::Stale;
        }
        self.settled = true;
        Match::Reply
    }

    /// Handle a passed deadline
    pub fn on_deadline(&mut self, now: Instant) -> Expiry {
        if self.resends >= self.policy.max_retries {
            return Expiry::Exhausted;
        }
        self.resends += 1;
        self.deadline = now + self.policy.timeout;
        Expiry::Resend
    }

    /// Push the deadline out after progress that is not a reply
    pub fn extend(&mut self, now: Instant, by: Duration) {
        self.deadline = now + by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 3,
        }
    }

    fn request(opcode: Opcode, seq: u16) -> Frame {
        let mut frame = Frame::request(opcode);
        frame.seq_number = seq;
        frame
    }

    #[test]
    fn test_matching_reply_settles() {
        let req = request(Opcode::OpenFileRO, 10);
        let mut out = Outstanding::new(req.clone(), policy(), Instant::now());

        let reply = Frame::ack(&req);
        assert_eq!(out.classify(&reply), Match::Reply);
        assert!(out.is_settled());
        // Duplicate of the same reply after settling.
        assert_eq!(out.classify(&reply), Match::Stale);
    }

    #[test]
    fn test_wrong_seq_or_opcode_is_stale() {
        let req = request(Opcode::ReadFile, 10);
        let mut out = Outstanding::new(req.clone(), policy(), Instant::now());

        let mut old = Frame::ack(&req);
        old.seq_number = 8;
        assert_eq!(out.classify(&old), Match::Stale);

        let mut other = Frame::ack(&req);
        other.req_opcode = Opcode::WriteFile;
        assert_eq!(out.classify(&other), Match::Stale);

        // A request echoed back is never a reply.
        let mut echo = req.clone();
        echo.seq_number = 11;
        assert_eq!(out.classify(&echo), Match::Stale);
        assert!(!out.is_settled());
    }

    #[test]
    fn test_nak_matches() {
        let req = request(Opcode::RemoveFile, u16::MAX);
        let mut out = Outstanding::new(req.clone(), policy(), Instant::now());
        let nak = Frame::nak(&req, skylink_core::NakCode::FileNotFound, None);
        assert_eq!(nak.seq_number, 0);
        assert_eq!(out.classify(&nak), Match::Reply);
    }

    #[test]
    fn test_retry_budget() {
        let start = Instant::now();
        let req = request(Opcode::ReadFile, 1);
        let mut out = Outstanding::new(req, policy(), start);
        assert_eq!(out.deadline(), start + Duration::from_millis(100));

        for i in 1..=3 {
            assert_eq!(out.on_deadline(start), Expiry::Resend);
            assert_eq!(out.resends(), i);
        }
        assert_eq!(out.on_deadline(start), Expiry::Exhausted);
        assert_eq!(out.resends(), 3);
    }

    #[test]
    fn test_reply_after_resend_still_matches() {
        let req = request(Opcode::WriteFile, 5);
        let mut out = Outstanding::new(req.clone(), policy(), Instant::now());
        assert_eq!(out.on_deadline(Instant::now()), Expiry::Resend);
        // The resent frame is byte-identical.
        assert_eq!(out.encoded(), req.encode().as_slice());
        assert_eq!(out.classify(&Frame::ack(&req)), Match::Reply);
    }

    #[test]
    fn test_burst_frames() {
        let req = request(Opcode::BurstReadFile, 100).with_session(3);
        let mut out = Outstanding::new(req.clone(), policy(), Instant::now());

        let first = Frame::ack(&req);
        let mut second = Frame::ack(&req);
        second.seq_number = 102;
        let mut foreign = Frame::ack(&req);
        foreign.seq_number = 103;
        foreign.session = 4;

        assert_eq!(out.classify(&second), Match::Reply);
        assert_eq!(out.classify(&first), Match::BurstChunk);
        assert_eq!(out.classify(&foreign), Match::Stale);

        let mut stale = Frame::ack(&req);
        stale.seq_number = 90;
        assert_eq!(out.classify(&stale), Match::Stale);
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let counter = SequenceCounter::starting_at(0);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        for _ in 0..(u16::MAX as u32 - 1) {
            counter.next();
        }
        assert_eq!(counter.next(), 0);
    }
}
