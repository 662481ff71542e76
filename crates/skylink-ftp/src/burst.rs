//! Chunk/burst scheduler
//!
//! A burst read lets the server stream consecutive chunks without a request
//! per chunk. Chunks may arrive out of order or twice. The scheduler keeps a
//! contiguous cursor, buffers chunks that land past a gap (bounded by a byte
//! window), and releases data strictly in file order.

use std::collections::BTreeMap;

/// Result of offering one chunk
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Contiguous data, in file order, ready to be written
    Ready(Vec<Vec<u8>>),
    /// Held until the gap before it closes
    Buffered,
    /// Already confirmed or already buffered
    Duplicate,
    /// Dropped because the window is full; it will be re-requested
    Overflow,
}

/// Reorder buffer for one download
#[derive(Debug)]
pub struct BurstScheduler {
    next: u32,
    end: Option<u32>,
    pending: BTreeMap<u32, Vec<u8>>,
    buffered: usize,
    window: usize,
}

impl BurstScheduler {
    /// Start at `start`; `end` is the file size when known
    pub fn new(start: u32, end: Option<u32>, window: usize) -> Self {
        Self {
            next: start,
            end,
            pending: BTreeMap::new(),
            buffered: 0,
            window,
        }
    }

    /// Highest confirmed contiguous offset
    pub fn next_offset(&self) -> u32 {
        self.next
    }

    /// Out-of-order chunks are waiting on a gap
    pub fn has_gap(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.end, Some(end) if self.next >= end)
    }

    /// Bytes to ask for in the next sequential read
    pub fn next_read_len(&self, chunk_size: usize) -> usize {
        match self.end {
            Some(end) => chunk_size.min(end.saturating_sub(self.next) as usize),
            None => chunk_size,
        }
    }

    /// Offer a chunk that starts at `offset`
    pub fn accept(&mut self, offset: u32, data: &[u8]) -> ChunkOutcome {
        if data.is_empty() {
            return ChunkOutcome::Duplicate;
        }
        let chunk_end = offset.saturating_add(data.len() as u32);
        if chunk_end <= self.next {
            return ChunkOutcome::Duplicate;
        }

        if offset > self.next {
            if self.pending.contains_key(&offset) {
                return ChunkOutcome::Duplicate;
            }
            if self.buffered + data.len() > self.window {
                return ChunkOutcome::Overflow;
            }
            self.buffered += data.len();
            self.pending.insert(offset, data.to_vec());
            return ChunkOutcome::Buffered;
        }

        // Overlaps the cursor: keep only the new tail.
        let skip = (self.next - offset) as usize;
        let mut ready = vec![data[skip..].to_vec()];
        self.next = chunk_end;
        self.drain(&mut ready);
        ChunkOutcome::Ready(ready)
    }

    fn drain(&mut self, ready: &mut Vec<Vec<u8>>) {
        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next {
                break;
            }
            let Some(data) = self.pending.remove(&start) else {
                break;
            };
            self.buffered -= data.len();
            let end = start.saturating_add(data.len() as u32);
            if end > self.next {
                let skip = (self.next - start) as usize;
                ready.push(data[skip..].to_vec());
                self.next = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    fn flatten(outcome: ChunkOutcome) -> Vec<u8> {
        match outcome {
            ChunkOutcome::Ready(parts) => parts.concat(),
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_in_order() {
        let mut s = BurstScheduler::new(0, Some(20), 100);
        assert_eq!(flatten(s.accept(0, &bytes(0, 10))), bytes(0, 10));
        assert_eq!(flatten(s.accept(10, &bytes(10, 10))), bytes(10, 10));
        assert!(s.is_complete());
    }

    #[test]
    fn test_out_of_order_reassembles() {
        let mut s = BurstScheduler::new(0, Some(30), 100);
        assert_eq!(s.accept(20, &bytes(20, 10)), ChunkOutcome::Buffered);
        assert_eq!(s.accept(10, &bytes(10, 10)), ChunkOutcome::Buffered);
        assert!(s.has_gap());
        assert_eq!(s.buffered_bytes(), 20);

        assert_eq!(flatten(s.accept(0, &bytes(0, 10))), bytes(0, 30));
        assert!(!s.has_gap());
        assert_eq!(s.buffered_bytes(), 0);
        assert!(s.is_complete());
    }

    #[test]
    fn test_duplicates() {
        let mut s = BurstScheduler::new(0, None, 100);
        flatten(s.accept(0, &bytes(0, 10)));
        assert_eq!(s.accept(0, &bytes(0, 10)), ChunkOutcome::Duplicate);
        assert_eq!(s.accept(20, &bytes(20, 5)), ChunkOutcome::Buffered);
        assert_eq!(s.accept(20, &bytes(20, 5)), ChunkOutcome::Duplicate);
        assert_eq!(s.accept(5, &[]), ChunkOutcome::Duplicate);
    }

    #[test]
    fn test_overlap_keeps_tail() {
        let mut s = BurstScheduler::new(0, None, 100);
        flatten(s.accept(0, &bytes(0, 10)));
        assert_eq!(flatten(s.accept(5, &bytes(5, 10))), bytes(10, 5));
        assert_eq!(s.next_offset(), 15);
    }

    #[test]
    fn test_window_overflow() {
        let mut s = BurstScheduler::new(0, None, 15);
        assert_eq!(s.accept(10, &bytes(10, 10)), ChunkOutcome::Buffered);
        assert_eq!(s.accept(20, &bytes(20, 10)), ChunkOutcome::Overflow);
        assert_eq!(s.buffered_bytes(), 10);
        // The gap fill releases what was kept; the dropped chunk stays missing.
        assert_eq!(flatten(s.accept(0, &bytes(0, 10))), bytes(0, 20));
        assert_eq!(s.next_offset(), 20);
    }

    #[test]
    fn test_next_read_len() {
        let s = BurstScheduler::new(230, Some(240), 100);
        assert_eq!(s.next_read_len(239), 10);
        let open = BurstScheduler::new(0, None, 100);
        assert_eq!(open.next_read_len(239), 239);
    }
}
