//! End-to-end pipeline scenarios with a recording transport.
//!
//! The microphone is simulated by pushing samples into the `BlockWriter` the
//! session hands out; the WebSocket is replaced by a sink that records every
//! frame it is asked to send.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vox_relay::pcm::encode_sample;
use vox_relay::session::{Session, SessionError, SessionState};
use vox_relay::transport::{FrameSink, TransportError};

const BLOCK: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Pcm(Vec<i16>),
    End,
}

/// Frame sink that logs everything sent through it. `fail_from` makes the
/// Nth (0-based) PCM send fail, simulating a dropped connection.
struct RecordingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    fail_from: Option<u64>,
    sent: u64,
}

impl RecordingSink {
    fn new(fail_from: Option<u64>) -> (Self, Arc<Mutex<Vec<Frame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                fail_from,
                sent: 0,
            },
            frames,
        )
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_block(&mut self, pcm: &[i16]) -> Result<(), TransportError> {
        if self.fail_from.is_some_and(|n| self.sent >= n) {
            return Err(TransportError::SendFailed("connection reset".to_string()));
        }
        self.sent += 1;
        self.frames.lock().unwrap().push(Frame::Pcm(pcm.to_vec()));
        Ok(())
    }

    async fn send_end(&mut self) -> Result<(), TransportError> {
        self.frames.lock().unwrap().push(Frame::End);
        Ok(())
    }
}

/// Let the spawned streamer catch up before the next block settles, so the
/// scenarios stay overrun-free.
async fn wait_for_frames(frames: &Arc<Mutex<Vec<Frame>>>, n: usize) {
    for _ in 0..500 {
        if frames.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("Timed out waiting for {} frames", n);
}

#[tokio::test(flavor = "multi_thread")]
async fn record_stop_close_full_lifecycle() {
    let (sink, frames) = RecordingSink::new(None);
    let mut session = Session::with_link(sink, BLOCK);
    assert_eq!(session.state(), SessionState::Ready);

    let mut writer = session.start_recording().unwrap();
    assert_eq!(session.state(), SessionState::Recording);

    for i in 0..3u32 {
        let value = (i as f32 + 1.0) * 0.1;
        writer.push(&vec![value; BLOCK]);
        wait_for_frames(&frames, i as usize + 1).await;
    }

    let summary = session.stop_recording().await.unwrap().unwrap();
    assert_eq!(summary.blocks_sent, 3);
    assert_eq!(summary.overruns, 0);
    assert_eq!(session.state(), SessionState::Ready);

    let log = frames.lock().unwrap().clone();
    assert_eq!(log.len(), 4, "three PCM frames then the end marker");
    for (i, frame) in log[..3].iter().enumerate() {
        match frame {
            Frame::Pcm(pcm) => {
                assert_eq!(pcm.len(), BLOCK);
                let expected = encode_sample((i as f32 + 1.0) * 0.1);
                assert!(
                    pcm.iter().all(|&s| s == expected),
                    "Block {} arrived out of capture order",
                    i
                );
            }
            Frame::End => panic!("End marker before the audio finished"),
        }
    }
    assert_eq!(log[3], Frame::End);

    session.close();
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failure_surfaces_and_releases() {
    let (sink, frames) = RecordingSink::new(Some(1));
    let mut session = Session::with_link(sink, BLOCK);
    let mut writer = session.start_recording().unwrap();

    writer.push(&vec![0.25; BLOCK]);
    wait_for_frames(&frames, 1).await;

    // The second block hits the failing send; the streamer terminates.
    writer.push(&vec![0.5; BLOCK]);
    for _ in 0..500 {
        if session.recording_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(session.recording_finished());

    let err = session.stop_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(session.state(), SessionState::Idle);

    let log = frames.lock().unwrap().clone();
    assert_eq!(log.len(), 1, "only the first block got through");
    assert!(matches!(log[0], Frame::Pcm(_)));
    assert!(
        !log.contains(&Frame::End),
        "No end marker after a transport failure"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_and_start_is_exclusive() {
    let (sink, frames) = RecordingSink::new(None);
    let mut session = Session::with_link(sink, BLOCK);

    // Stopping before anything started is a quiet no-op.
    assert!(session.stop_recording().await.unwrap().is_none());

    let _writer = session.start_recording().unwrap();
    let err = session.start_recording().unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));
    assert_eq!(session.state(), SessionState::Recording);

    let summary = session.stop_recording().await.unwrap().unwrap();
    assert_eq!(summary.blocks_sent, 0);
    assert_eq!(session.state(), SessionState::Ready);

    // An empty recording still terminates the utterance.
    assert_eq!(*frames.lock().unwrap(), vec![Frame::End]);

    assert!(session.stop_recording().await.unwrap().is_none());
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_discards_partial_audio_but_terminates_utterance() {
    let (sink, frames) = RecordingSink::new(None);
    let mut session = Session::with_link(sink, BLOCK);
    let mut writer = session.start_recording().unwrap();

    // Half a block: never settles, so nothing should reach the sink.
    writer.push(&vec![0.1; BLOCK / 2]);

    let summary = session.abort_recording().await.unwrap().unwrap();
    assert_eq!(summary.blocks_sent, 0);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(*frames.lock().unwrap(), vec![Frame::End]);
}
