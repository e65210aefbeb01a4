//! Consumer loop: encode settled blocks and forward them to the transport
//!
//! Runs on the non-real-time side of the exchange. Network latency is absorbed
//! here — the producer never waits on a send. The loop ends when the writer is
//! dropped or the stop token fires; either way every block that already
//! settled is finished before the single end-of-utterance marker goes out. A
//! transport failure aborts immediately and no end marker follows it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::exchange::{BlockReader, SampleBlock};
use crate::pcm;
use crate::transport::{FrameSink, TransportError};

/// Flag that switches a stop from graceful (drain settled blocks) to abrupt
/// (skip them). Set before cancelling the token.
pub type SkipDrain = Arc<AtomicBool>;

/// Pumps settled blocks through the encoder into a [`FrameSink`].
pub struct BlockStreamer<S: FrameSink> {
    reader: BlockReader,
    sink: S,
    /// Encode target, reused across blocks.
    scratch: Vec<i16>,
    blocks_sent: u64,
    stop: CancellationToken,
    skip_drain: SkipDrain,
}

impl<S: FrameSink> BlockStreamer<S> {
    pub fn new(
        reader: BlockReader,
        sink: S,
        block_size: usize,
        stop: CancellationToken,
        skip_drain: SkipDrain,
    ) -> Self {
        Self {
            reader,
            sink,
            scratch: vec![0; block_size],
            blocks_sent: 0,
            stop,
            skip_drain,
        }
    }

    /// Run until the writer disappears or the stop token fires.
    ///
    /// Returns the sink (so the session can keep the connection) and the
    /// number of blocks sent. On a transport error the sink is dropped with
    /// the dead connection and the error is returned as-is.
    pub async fn run(mut self) -> Result<(S, u64), TransportError> {
        log::debug!("Block streamer started");

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                settled = self.reader.settled() => match settled {
                    Some(block) => self.forward(block).await?,
                    None => break,
                },
            }
        }

        if self.skip_drain.load(Ordering::Relaxed) {
            // Abrupt stop: leftover settled blocks are dropped, the end marker
            // goes out on a best-effort basis.
            if let Err(e) = self.sink.send_end().await {
                log::warn!("Best-effort end marker failed: {}", e);
            }
        } else {
            while let Some(block) = self.reader.try_settled() {
                self.forward(block).await?;
            }
            self.sink.send_end().await?;
        }

        log::info!("Block streamer finished, {} blocks sent", self.blocks_sent);

        Ok((self.sink, self.blocks_sent))
    }

    async fn forward(&mut self, block: SampleBlock) -> Result<(), TransportError> {
        self.scratch.resize(block.len(), 0);
        pcm::encode_block_batch(block.samples(), &mut self.scratch);

        // The region is free as soon as its samples are encoded; hand it back
        // before the send so the producer never waits on the network.
        self.reader.release(block);

        self.sink.send_block(&self.scratch).await?;
        self.blocks_sent += 1;

        if self.blocks_sent % 32 == 0 {
            log::debug!("Block streamer: {} blocks sent", self.blocks_sent);
        }

        Ok(())
    }
}
