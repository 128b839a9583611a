//! Pollable counter stream (spec §4.8): a `<u64>\n` line that delivers a
//! poll notification whenever the value changes. Level-triggered, unlike
//! the bitmap streams' append-only log — a reader only ever cares about
//! the current value, not the history of changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterReadOutcome {
    Value(u64),
    /// Value unchanged since `last_seen`; only returned to non-blocking reads.
    NonBlocking,
    Eof,
}

pub struct CounterStream {
    value: AtomicU64,
    /// Bumped on every change so waiters can detect "did it move" without
    /// racing on the value itself.
    version: Mutex<u64>,
    cv: Condvar,
    closed: Mutex<bool>,
}

impl Default for CounterStream {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CounterStream {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            version: Mutex::new(0),
            cv: Condvar::new(),
            closed: Mutex::new(false),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u64 {
        *self.version.lock().unwrap()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::SeqCst);
        *self.version.lock().unwrap() += 1;
        self.cv.notify_all();
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::SeqCst);
        *self.version.lock().unwrap() += 1;
        self.cv.notify_all();
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Returns the current value if it has changed since `last_version`
    /// (or this is the caller's first read, `last_version = None`).
    /// Blocking reads suspend until it changes or the stream closes.
    pub fn read(&self, last_version: Option<u64>, blocking: bool) -> (CounterReadOutcome, u64) {
        let mut version = self.version.lock().unwrap();
        loop {
            if last_version != Some(*version) {
                return (CounterReadOutcome::Value(self.get()), *version);
            }
            if *self.closed.lock().unwrap() {
                return (CounterReadOutcome::Eof, *version);
            }
            if !blocking {
                return (CounterReadOutcome::NonBlocking, *version);
            }
            version = self.cv.wait(version).unwrap();
        }
    }
}

pub fn render_line(value: u64) -> String {
    format!("{value}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_read_returns_current_value() {
        let c = CounterStream::new(7);
        let (outcome, _) = c.read(None, false);
        assert_eq!(outcome, CounterReadOutcome::Value(7));
    }

    #[test]
    fn nonblocking_read_reports_no_change() {
        let c = CounterStream::new(7);
        let (_, version) = c.read(None, false);
        let (outcome, _) = c.read(Some(version), false);
        assert_eq!(outcome, CounterReadOutcome::NonBlocking);
    }

    #[test]
    fn add_bumps_version_and_value() {
        let c = CounterStream::new(0);
        let (_, version) = c.read(None, false);
        c.add(5);
        let (outcome, new_version) = c.read(Some(version), false);
        assert_eq!(outcome, CounterReadOutcome::Value(5));
        assert_ne!(version, new_version);
    }

    #[test]
    fn render_line_matches_spec_format() {
        assert_eq!(render_line(42), "42\n");
    }
}
