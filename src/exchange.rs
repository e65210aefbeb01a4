//! Double-buffer exchange between the audio callback and the consumer
//!
//! Exactly two fixed-capacity sample regions alternate between the real-time
//! producer and the encoding/transport consumer. Ownership of a region moves
//! through a pair of two-slot channels instead of a lock:
//!
//! ```text
//! Audio callback (sync)                 Consumer task (async)
//! ┌──────────────────┐  settled lane   ┌─────────────────────┐
//! │ BlockWriter::push │ ──try_send──▶  │ BlockReader::settled │
//! │  (fill + hand-off)│  ◀──release──  │  (encode + send)     │
//! └──────────────────┘  recycle lane   └─────────────────────┘
//! ```
//!
//! Between two hand-offs the producer writes one region while the consumer
//! holds the other; the type system makes a concurrent read/write of the same
//! region unrepresentable. The producer never blocks: if the recycle lane is
//! empty at a hand-off (the consumer is still busy with the other region) the
//! freshly filled block is dropped in place and counted as an overrun.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Block size used when no explicit size is configured, in samples.
pub const DEFAULT_BLOCK_SIZE: usize = 16384;

/// One fixed-length region of float samples. Immutable once handed off.
#[derive(Debug)]
pub struct SampleBlock {
    samples: Box<[f32]>,
    sequence: u64,
}

impl SampleBlock {
    fn zeroed(len: usize) -> Self {
        Self {
            samples: vec![0.0; len].into_boxed_slice(),
            sequence: 0,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Hand-off order, assigned when the block settles. Strictly increasing
    /// across one recording, with gaps where overruns dropped blocks.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Counters shared by both sides of the exchange.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    blocks_settled: AtomicU64,
    overruns: AtomicU64,
}

impl ExchangeStats {
    pub fn blocks_settled(&self) -> u64 {
        self.blocks_settled.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Remote kill switch for the producer side.
///
/// Flipping it makes every subsequent [`BlockWriter::push`] a no-op, so sample
/// intake stops immediately even while the audio engine keeps calling back.
#[derive(Debug, Clone)]
pub struct HaltSwitch(Arc<AtomicBool>);

impl HaltSwitch {
    pub fn halt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Create a double-buffer exchange with regions of `block_size` samples.
///
/// One region starts in the writer's hands, the other parked in the recycle
/// lane ready for the first hand-off.
pub fn block_exchange(block_size: usize) -> (BlockWriter, BlockReader) {
    assert!(block_size > 0, "block size must be non-zero");

    let (settled_tx, settled_rx) = mpsc::channel(2);
    let (recycle_tx, recycle_rx) = mpsc::channel(2);
    let stats = Arc::new(ExchangeStats::default());

    recycle_tx
        .try_send(SampleBlock::zeroed(block_size))
        .expect("recycle lane has capacity at startup");

    let writer = BlockWriter {
        active: SampleBlock::zeroed(block_size),
        offset: 0,
        next_sequence: 0,
        settled_tx,
        recycle_rx,
        stats: stats.clone(),
        halted: Arc::new(AtomicBool::new(false)),
    };

    let reader = BlockReader {
        settled_rx,
        recycle_tx,
        stats,
    };

    (writer, reader)
}

/// Producer half: fills the active region from the real-time callback.
///
/// All methods are callable from a real-time context: no allocation, no
/// blocking, no lock. Dropping the writer closes the settled lane, which the
/// consumer observes as end of input.
#[derive(Debug)]
pub struct BlockWriter {
    active: SampleBlock,
    offset: usize,
    next_sequence: u64,
    settled_tx: mpsc::Sender<SampleBlock>,
    recycle_rx: mpsc::Receiver<SampleBlock>,
    stats: Arc<ExchangeStats>,
    halted: Arc<AtomicBool>,
}

impl BlockWriter {
    /// Append a chunk of samples at the running write offset.
    ///
    /// Chunks are engine-determined and may span a block boundary; every full
    /// region triggers a hand-off and the remainder lands in the next region.
    /// An empty chunk, or any chunk after the halt switch fired, is a no-op.
    pub fn push(&mut self, mut samples: &[f32]) {
        if self.halted.load(Ordering::Relaxed) {
            return;
        }

        while !samples.is_empty() {
            let capacity = self.active.samples.len();
            let take = samples.len().min(capacity - self.offset);
            self.active.samples[self.offset..self.offset + take]
                .copy_from_slice(&samples[..take]);
            self.offset += take;
            samples = &samples[take..];

            if self.offset == capacity {
                self.hand_off();
            }
        }
    }

    /// Swap the filled region for a recycled one and notify the consumer.
    ///
    /// Drop-newest overrun policy: when the consumer still owns the other
    /// region, the block that just filled is discarded by rewinding the offset
    /// and the active region is reused. The settled block already in flight is
    /// never touched.
    fn hand_off(&mut self) {
        self.offset = 0;

        let fresh = match self.recycle_rx.try_recv() {
            Ok(fresh) => fresh,
            Err(_) => {
                // The dropped block still consumes a sequence number so the
                // gap is visible downstream.
                self.next_sequence += 1;
                let total = self.stats.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "block exchange overrun: consumer still holds the settled region, \
                     dropping newest block ({} total)",
                    total
                );
                return;
            }
        };

        let mut settled = std::mem::replace(&mut self.active, fresh);
        settled.sequence = self.next_sequence;
        self.next_sequence += 1;

        // With two regions and two slots this only fails once the reader is
        // gone, at which point the samples have nowhere to go anyway.
        if self.settled_tx.try_send(settled).is_ok() {
            self.stats.blocks_settled.fetch_add(1, Ordering::Relaxed);
        } else {
            log::debug!("block exchange: reader gone, discarding settled block");
        }
    }

    /// Samples written into the active region since the last hand-off.
    pub fn pending(&self) -> usize {
        self.offset
    }

    pub fn block_size(&self) -> usize {
        self.active.samples.len()
    }

    pub fn halt_switch(&self) -> HaltSwitch {
        HaltSwitch(self.halted.clone())
    }

    pub fn stats(&self) -> Arc<ExchangeStats> {
        self.stats.clone()
    }
}

/// Consumer half: receives settled regions and returns them after use.
#[derive(Debug)]
pub struct BlockReader {
    settled_rx: mpsc::Receiver<SampleBlock>,
    recycle_tx: mpsc::Sender<SampleBlock>,
    stats: Arc<ExchangeStats>,
}

impl BlockReader {
    /// Wait for the next settled block. Returns `None` once the writer is
    /// dropped and every settled block has been received.
    pub async fn settled(&mut self) -> Option<SampleBlock> {
        self.settled_rx.recv().await
    }

    /// Non-blocking variant used while draining after a stop.
    pub fn try_settled(&mut self) -> Option<SampleBlock> {
        self.settled_rx.try_recv().ok()
    }

    /// Return a drained region to the recycle lane, re-arming the writer's
    /// next hand-off.
    pub fn release(&mut self, block: SampleBlock) {
        // Never full: there are only two regions in existence.
        let _ = self.recycle_tx.try_send(block);
    }

    pub fn stats(&self) -> Arc<ExchangeStats> {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_accumulate_until_block_boundary() {
        let (mut writer, mut reader) = block_exchange(8);

        writer.push(&[0.1; 5]);
        assert_eq!(writer.pending(), 5);
        assert!(reader.try_settled().is_none());

        writer.push(&[0.1; 3]);
        assert_eq!(writer.pending(), 0);

        let block = reader.try_settled().expect("block settled at boundary");
        assert_eq!(block.len(), 8);
        assert_eq!(block.sequence(), 0);
    }

    #[tokio::test]
    async fn chunk_spanning_boundary_fills_next_region() {
        let (mut writer, mut reader) = block_exchange(4);

        // 6 samples: 4 complete a block, 2 land in the next region.
        writer.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let block = reader.try_settled().expect("first block settled");
        assert_eq!(block.samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(writer.pending(), 2);

        reader.release(block);
        writer.push(&[7.0, 8.0]);

        let block = reader.try_settled().expect("second block settled");
        assert_eq!(block.samples(), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(block.sequence(), 1);
    }

    #[tokio::test]
    async fn overrun_drops_newest_and_counts() {
        let (mut writer, mut reader) = block_exchange(4);
        let stats = writer.stats();

        // First block settles normally; the consumer never releases it.
        writer.push(&[1.0; 4]);
        assert_eq!(stats.blocks_settled(), 1);

        // Both further blocks hit an empty recycle lane.
        writer.push(&[2.0; 4]);
        writer.push(&[3.0; 4]);
        assert_eq!(stats.overruns(), 2);
        assert_eq!(stats.blocks_settled(), 1);

        // The block in flight is the first one, uncorrupted.
        let block = reader.try_settled().expect("first block still in flight");
        assert!(block.samples().iter().all(|&s| s == 1.0));

        // Releasing re-arms the exchange.
        reader.release(block);
        writer.push(&[4.0; 4]);
        assert_eq!(stats.blocks_settled(), 2);
        let block = reader.try_settled().expect("exchange recovered");
        assert!(block.samples().iter().all(|&s| s == 4.0));
    }

    #[tokio::test]
    async fn halt_switch_stops_intake_immediately() {
        let (mut writer, mut reader) = block_exchange(4);
        let halt = writer.halt_switch();

        writer.push(&[1.0; 2]);
        halt.halt();
        writer.push(&[2.0; 10]);

        assert_eq!(writer.pending(), 2);
        assert!(reader.try_settled().is_none());
    }

    #[tokio::test]
    async fn dropping_writer_closes_settled_lane() {
        let (mut writer, mut reader) = block_exchange(4);
        writer.push(&[0.5; 4]);
        drop(writer);

        // The already-settled block drains first, then the lane reports closed.
        assert!(reader.settled().await.is_some());
        assert!(reader.settled().await.is_none());
    }

    /// Hand-off exclusivity under real concurrency: a producer thread fills
    /// whole blocks with a single marker value while the consumer checks every
    /// delivered block is internally uniform (a torn read/write would mix
    /// markers) and that sequences only move forward.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_producer_never_tears_blocks() {
        const BLOCK: usize = 256;
        const CYCLES: usize = 200;

        let (mut writer, mut reader) = block_exchange(BLOCK);

        let producer = std::thread::spawn(move || {
            for i in 0..CYCLES {
                let marker = i as f32;
                let chunk = [marker; 32];
                for _ in 0..(BLOCK / 32) {
                    writer.push(&chunk);
                }
            }
            // Writer drops here, closing the lane.
        });

        let mut last_sequence = None;
        let mut delivered = 0u64;
        while let Some(block) = reader.settled().await {
            let first = block.samples()[0];
            assert!(
                block.samples().iter().all(|&s| s == first),
                "torn block at sequence {}",
                block.sequence()
            );
            if let Some(prev) = last_sequence {
                assert!(block.sequence() > prev, "sequence went backwards");
            }
            last_sequence = Some(block.sequence());
            delivered += 1;
            reader.release(block);
        }

        producer.join().expect("producer thread panicked");

        let stats = reader.stats();
        assert_eq!(delivered, stats.blocks_settled());
        assert_eq!(delivered + stats.overruns(), CYCLES as u64);
        assert!(delivered > 0);
    }
}
