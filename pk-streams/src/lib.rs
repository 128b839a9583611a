//! Streams & Stats (spec §4.8): every externally observable counter or
//! bitmap the engine produces is exposed as a pollable byte stream, read
//! by the FUSE layer's `/streams/*` and `/stats/*` files.

pub mod bitmap;
pub mod counter;

use std::sync::Arc;

pub use bitmap::{BitmapCursor, BitmapEvent, BitmapStream, ReadOutcome as BitmapReadOutcome};
pub use counter::{CounterReadOutcome, CounterStream};

use pk_engine::ChunkEvents;
use pk_types::ChunkIndex;

/// The four bitmap streams named in spec §4.8.
pub struct BitmapGroup {
    pub chunks_accessed: Arc<BitmapStream>,
    pub chunks_modified: Arc<BitmapStream>,
    pub chunks_base: Arc<BitmapStream>,
    pub chunks_overlay: Arc<BitmapStream>,
}

impl BitmapGroup {
    pub fn new(n: u64) -> Self {
        Self {
            chunks_accessed: Arc::new(BitmapStream::new(n)),
            chunks_modified: Arc::new(BitmapStream::new(n)),
            chunks_base: Arc::new(BitmapStream::new(n)),
            chunks_overlay: Arc::new(BitmapStream::new(n)),
        }
    }

    pub fn close_all(&self) {
        self.chunks_accessed.close();
        self.chunks_modified.close();
        self.chunks_base.close();
        self.chunks_overlay.close();
    }
}

/// The counters `ChunkEngine` tracks (spec §4.5: `chunk_reads`,
/// `data_bytes_read`, and their write-side counterparts).
pub struct StatsGroup {
    pub chunk_reads: CounterStream,
    pub chunk_writes: CounterStream,
    pub data_bytes_read: CounterStream,
    pub data_bytes_written: CounterStream,
}

impl Default for StatsGroup {
    fn default() -> Self {
        Self {
            chunk_reads: CounterStream::new(0),
            chunk_writes: CounterStream::new(0),
            data_bytes_read: CounterStream::new(0),
            data_bytes_written: CounterStream::new(0),
        }
    }
}

/// Wires `ChunkEngine`'s read/write hooks to the bitmap and counter
/// streams, so every chunk access becomes an observable event without
/// `pk-engine` depending on this crate (spec's own layering: the engine
/// only knows about the `ChunkEvents` trait).
pub struct StreamEvents {
    pub bitmaps: Arc<BitmapGroup>,
    pub stats: Arc<StatsGroup>,
}

impl ChunkEvents for StreamEvents {
    fn on_read(&self, index: ChunkIndex, bytes: usize) {
        self.bitmaps.chunks_accessed.set(index);
        self.stats.chunk_reads.add(1);
        self.stats.data_bytes_read.add(bytes as u64);
    }

    fn on_write(&self, index: ChunkIndex, bytes: usize) {
        // A write always logs, even to an already-modified chunk (spec
        // §4.8: "used for modified-writes, which must produce a stream
        // entry each time even if the bit was already set").
        self.bitmaps.chunks_modified.set_force(index);
        self.stats.chunk_writes.add(1);
        self.stats.data_bytes_written.add(bytes as u64);
    }

    fn on_origin_fetch(&self, index: ChunkIndex) {
        self.bitmaps.chunks_base.set(index);
    }

    fn on_modified_overlay(&self, index: ChunkIndex) {
        self.bitmaps.chunks_overlay.set(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_events_drives_both_bitmaps_and_counters() {
        let bitmaps = Arc::new(BitmapGroup::new(4));
        let stats = Arc::new(StatsGroup::default());
        let events = StreamEvents { bitmaps: bitmaps.clone(), stats: stats.clone() };

        events.on_read(1, 64);
        events.on_write(2, 128);
        events.on_origin_fetch(3);
        events.on_modified_overlay(0);

        assert!(bitmaps.chunks_accessed.is_set(1));
        assert!(bitmaps.chunks_modified.is_set(2));
        assert!(bitmaps.chunks_base.is_set(3));
        assert!(bitmaps.chunks_overlay.is_set(0));
        assert_eq!(stats.chunk_reads.get(), 1);
        assert_eq!(stats.chunk_writes.get(), 1);
        assert_eq!(stats.data_bytes_read.get(), 64);
        assert_eq!(stats.data_bytes_written.get(), 128);
    }
}
