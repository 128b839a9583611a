//! Pollable bitmap stream (spec §4.8): `chunks_accessed`, `chunks_modified`,
//! `chunks_base`, `chunks_overlay`. Each consumer gets an independent read
//! cursor; a freshly registered consumer first replays a snapshot of bits
//! already set, then tails the live log.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use pk_types::ChunkIndex;

/// One `<timestamp>\t<chunk_index>\n` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapEvent {
    pub timestamp: u64,
    pub index: ChunkIndex,
}

impl BitmapEvent {
    pub fn to_line(self) -> String {
        format!("{}\t{}\n", self.timestamp, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(BitmapEvent),
    /// Nothing available right now; only returned to non-blocking readers.
    NonBlocking,
    /// Stream closed and fully drained for this cursor.
    Eof,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct Inner {
    set_at: Vec<Option<u64>>,
    log: VecDeque<BitmapEvent>,
    base_seq: u64,
    next_seq: u64,
    closed: bool,
}

/// A bitmap of `n` chunk indices plus the append-only log of set events
/// driving every consumer's stream.
pub struct BitmapStream {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl BitmapStream {
    pub fn new(n: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                set_at: vec![None; n as usize],
                log: VecDeque::new(),
                base_seq: 0,
                next_seq: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, inner: &mut Inner, index: ChunkIndex) {
        let event = BitmapEvent { timestamp: now_secs(), index };
        inner.log.push_back(event);
        inner.next_seq += 1;
    }

    /// Set-once: a no-op (no event emitted) if the bit is already set.
    pub fn set(&self, index: ChunkIndex) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.set_at[index as usize];
        if slot.is_some() {
            return;
        }
        *slot = Some(now_secs());
        self.push(&mut inner, index);
        drop(inner);
        self.cv.notify_all();
    }

    /// Emits an event on every call regardless of current bit state (spec:
    /// used for modified-writes, which must log every write even to an
    /// already-set chunk).
    pub fn set_force(&self, index: ChunkIndex) {
        let mut inner = self.inner.lock().unwrap();
        if inner.set_at[index as usize].is_none() {
            inner.set_at[index as usize] = Some(now_secs());
        }
        self.push(&mut inner, index);
        drop(inner);
        self.cv.notify_all();
    }

    pub fn is_set(&self, index: ChunkIndex) -> bool {
        self.inner.lock().unwrap().set_at[index as usize].is_some()
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    /// Registers a new consumer, populated from a snapshot of bits already
    /// set (spec: "new consumers are populated from a snapshot of current
    /// set bits").
    pub fn new_cursor(self: &std::sync::Arc<Self>) -> BitmapCursor {
        let inner = self.inner.lock().unwrap();
        let replay: VecDeque<BitmapEvent> = inner
            .set_at
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|ts| BitmapEvent { timestamp: ts, index: i as ChunkIndex }))
            .collect();
        BitmapCursor {
            stream: self.clone(),
            replay: Mutex::new(replay),
            pos: Mutex::new(inner.next_seq),
        }
    }
}

pub struct BitmapCursor {
    stream: std::sync::Arc<BitmapStream>,
    replay: Mutex<VecDeque<BitmapEvent>>,
    pos: Mutex<u64>,
}

impl BitmapCursor {
    /// Reads the next event. `blocking = false` returns `NonBlocking`
    /// instead of suspending when nothing is available yet.
    pub fn read(&self, blocking: bool) -> ReadOutcome {
        if let Some(event) = self.replay.lock().unwrap().pop_front() {
            return ReadOutcome::Line(event);
        }
        let mut pos = self.pos.lock().unwrap();
        let mut inner = self.stream.inner.lock().unwrap();
        loop {
            if *pos < inner.next_seq {
                let offset = (*pos - inner.base_seq) as usize;
                let event = inner.log[offset];
                *pos += 1;
                return ReadOutcome::Line(event);
            }
            if inner.closed {
                return ReadOutcome::Eof;
            }
            if !blocking {
                return ReadOutcome::NonBlocking;
            }
            inner = self.stream.cv.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_once_emits_a_single_event() {
        let stream = Arc::new(BitmapStream::new(4));
        let cursor = stream.new_cursor();
        stream.set(2);
        stream.set(2);
        match cursor.read(false) {
            ReadOutcome::Line(e) => assert_eq!(e.index, 2),
            other => panic!("expected a line, got {other:?}"),
        }
        assert_eq!(cursor.read(false), ReadOutcome::NonBlocking);
    }

    #[test]
    fn set_force_emits_every_call() {
        let stream = Arc::new(BitmapStream::new(4));
        let cursor = stream.new_cursor();
        stream.set_force(1);
        stream.set_force(1);
        assert!(matches!(cursor.read(false), ReadOutcome::Line(_)));
        assert!(matches!(cursor.read(false), ReadOutcome::Line(_)));
        assert_eq!(cursor.read(false), ReadOutcome::NonBlocking);
    }

    #[test]
    fn new_cursor_replays_snapshot_of_set_bits() {
        let stream = Arc::new(BitmapStream::new(8));
        stream.set(5);
        stream.set(1);
        let cursor = stream.new_cursor();
        let mut seen = Vec::new();
        loop {
            match cursor.read(false) {
                ReadOutcome::Line(e) => seen.push(e.index),
                ReadOutcome::NonBlocking => break,
                ReadOutcome::Eof => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec![1, 5]);
    }

    #[test]
    fn closed_stream_returns_eof_once_drained() {
        let stream = Arc::new(BitmapStream::new(2));
        let cursor = stream.new_cursor();
        stream.close();
        assert_eq!(cursor.read(true), ReadOutcome::Eof);
    }
}
