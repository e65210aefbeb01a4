//! Session state machine
//!
//! Sequences `Idle -> Connecting -> Ready -> Recording -> Stopping` and owns
//! the lifetime of the transport link and the buffer exchange. All transitions
//! go through the pure [`reduce`] function, which returns the next state and a
//! list of effects; the [`Session`] driver executes those effects.
//!
//! Exactly one recording at a time: starts are rejected unless the session is
//! `Ready`, so recording never proceeds on a connection that is not open, and
//! re-entrant starts fail fast. A graceful stop drains the last settled block
//! and issues the end-of-utterance marker exactly once, then re-arms at
//! `Ready` with the connection kept open — the recognizer delivers the final
//! transcript after the marker. `close()` performs the terminal transition to
//! `Idle` and releases the transport.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::exchange::{block_exchange, BlockWriter, ExchangeStats, HaltSwitch};
use crate::streamer::{BlockStreamer, SkipDrain};
use crate::transport::{FrameSink, RecognizerLink, TranscriptReceiver, TransportError};

/// Logical session state. Advances monotonically through one recording and
/// returns to `Ready` (connection kept) or `Idle` (connection released).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Ready,
    Recording,
    Stopping,
}

/// Events that drive the state machine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectRequested,
    ConnectOk,
    ConnectFailed(String),
    /// Capture is live and the streamer is pumping.
    CaptureStarted,
    /// User-initiated graceful stop.
    StopRequested,
    /// Abrupt stop (device fault, external cancellation).
    AbortRequested,
    /// The streamer drained and issued the end marker.
    DrainComplete { blocks_sent: u64 },
    /// The transport failed or closed underneath us.
    TransportClosed(String),
    /// Terminal release of the session.
    CloseRequested,
}

/// Effects to execute after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    OpenTransport,
    SpawnStreamer,
    /// Stop accepting samples into the exchange immediately.
    HaltProducer,
    /// Cancel the streamer; `skip_drain` selects the abrupt path.
    CancelStreamer { skip_drain: bool },
    ReleaseTransport,
    SurfaceError(String),
}

/// Reducer: `(state, event) -> (next_state, effects)`.
///
/// Unhandled combinations are explicit no-ops; stopping an idle or ready
/// session is one of them by design.
pub fn reduce(state: SessionState, event: SessionEvent) -> (SessionState, Vec<SessionEffect>) {
    use SessionEffect::*;
    use SessionEvent::*;
    use SessionState::*;

    match (state, event) {
        (Idle, ConnectRequested) => (Connecting, vec![OpenTransport]),
        (Connecting, ConnectOk) => (Ready, vec![]),
        (Connecting, ConnectFailed(e)) => (Idle, vec![SurfaceError(e)]),

        (Ready, CaptureStarted) => (Recording, vec![SpawnStreamer]),

        (Recording, StopRequested) => (
            Stopping,
            vec![HaltProducer, CancelStreamer { skip_drain: false }],
        ),
        (Recording, AbortRequested) => (
            Stopping,
            vec![HaltProducer, CancelStreamer { skip_drain: true }],
        ),
        (Recording, TransportClosed(e)) => {
            (Idle, vec![HaltProducer, ReleaseTransport, SurfaceError(e)])
        }

        (Stopping, DrainComplete { .. }) => (Ready, vec![]),
        (Stopping, TransportClosed(e)) => (Idle, vec![ReleaseTransport, SurfaceError(e)]),

        (_, CloseRequested) => (Idle, vec![ReleaseTransport]),

        // Everything else, including StopRequested while Idle/Ready: no-op.
        (state, _) => (state, vec![]),
    }
}

/// Errors surfaced by the session driver.
#[derive(Debug)]
pub enum SessionError {
    /// Operation not valid in the current state (e.g. re-entrant start, or
    /// start without an open connection).
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    Transport(TransportError),
    /// The streamer task died without returning.
    StreamerPanicked(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidState { operation, state } => {
                write!(f, "Cannot {} while session is {:?}", operation, state)
            }
            SessionError::Transport(e) => write!(f, "{}", e),
            SessionError::StreamerPanicked(e) => write!(f, "Streamer task failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Outcome of a completed recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingSummary {
    pub blocks_sent: u64,
    /// Hand-offs that found the consumer still busy (drop-newest policy).
    pub overruns: u64,
}

struct ActiveRecording<S> {
    halt: HaltSwitch,
    stop: CancellationToken,
    skip_drain: SkipDrain,
    stats: Arc<ExchangeStats>,
    task: JoinHandle<Result<(S, u64), TransportError>>,
}

/// One capture-to-transport session. Generic over the sink so tests can
/// substitute a recording transport for the live WebSocket link.
pub struct Session<S: FrameSink + 'static> {
    id: Uuid,
    state: SessionState,
    block_size: usize,
    link: Option<S>,
    active: Option<ActiveRecording<S>>,
}

impl<S: FrameSink + Send + 'static> Session<S> {
    fn new_idle(block_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            block_size,
            link: None,
            active: None,
        }
    }

    /// Build a session around an already-open transport. Used by tests and by
    /// callers that manage their own connection.
    pub fn with_link(link: S, block_size: usize) -> Self {
        let mut session = Self::new_idle(block_size);
        session.transition(SessionEvent::ConnectRequested);
        session.link = Some(link);
        session.transition(SessionEvent::ConnectOk);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Apply one event through the reducer and record the transition.
    fn transition(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        let (next, effects) = reduce(self.state, event);
        if next != self.state {
            log::info!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
        for effect in &effects {
            if let SessionEffect::SurfaceError(e) = effect {
                log::error!("Session {}: {}", self.id, e);
            }
        }
        effects
    }

    /// Begin a recording: allocate the exchange, move the link into a spawned
    /// [`BlockStreamer`], and return the producer half for the audio source.
    ///
    /// Fails unless the session is `Ready` — this is both the fail-fast for a
    /// connection that never opened and the rejection of re-entrant starts.
    pub fn start_recording(&mut self) -> Result<BlockWriter, SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::InvalidState {
                operation: "start recording",
                state: self.state,
            });
        }
        let link = self.link.take().ok_or(SessionError::InvalidState {
            operation: "start recording",
            state: self.state,
        })?;

        let (writer, reader) = block_exchange(self.block_size);
        let halt = writer.halt_switch();
        let stats = writer.stats();
        let stop = CancellationToken::new();
        let skip_drain = SkipDrain::default();

        let streamer = BlockStreamer::new(
            reader,
            link,
            self.block_size,
            stop.clone(),
            skip_drain.clone(),
        );
        let task = tokio::spawn(streamer.run());

        self.active = Some(ActiveRecording {
            halt,
            stop,
            skip_drain,
            stats,
            task,
        });
        self.transition(SessionEvent::CaptureStarted);

        Ok(writer)
    }

    /// Whether the streamer has already finished (e.g. the transport died
    /// mid-recording). Lets callers notice a failure before they stop.
    pub fn recording_finished(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.task.is_finished())
            .unwrap_or(false)
    }

    /// Graceful stop: halt sample intake, let the already-settled blocks
    /// finish their encode+send, then the end marker goes out.
    ///
    /// Stopping a session that is not recording is an `Ok(None)` no-op.
    pub async fn stop_recording(&mut self) -> Result<Option<RecordingSummary>, SessionError> {
        if self.state != SessionState::Recording {
            return Ok(None);
        }
        self.finish(SessionEvent::StopRequested).await.map(Some)
    }

    /// Abrupt stop: halt intake, skip the drain, best-effort end marker.
    pub async fn abort_recording(&mut self) -> Result<Option<RecordingSummary>, SessionError> {
        if self.state != SessionState::Recording {
            return Ok(None);
        }
        self.finish(SessionEvent::AbortRequested).await.map(Some)
    }

    async fn finish(&mut self, event: SessionEvent) -> Result<RecordingSummary, SessionError> {
        let active = self.active.take().ok_or(SessionError::InvalidState {
            operation: "stop recording",
            state: self.state,
        })?;

        for effect in self.transition(event) {
            match effect {
                SessionEffect::HaltProducer => active.halt.halt(),
                SessionEffect::CancelStreamer { skip_drain } => {
                    active.skip_drain.store(skip_drain, Ordering::Relaxed);
                    active.stop.cancel();
                }
                _ => {}
            }
        }

        match active.task.await {
            Ok(Ok((link, blocks_sent))) => {
                let overruns = active.stats.overruns();
                if overruns > 0 {
                    log::warn!(
                        "Session {}: {} blocks dropped to overruns",
                        self.id,
                        overruns
                    );
                }
                self.link = Some(link);
                self.transition(SessionEvent::DrainComplete { blocks_sent });
                Ok(RecordingSummary {
                    blocks_sent,
                    overruns,
                })
            }
            Ok(Err(e)) => {
                self.transition(SessionEvent::TransportClosed(e.to_string()));
                Err(SessionError::Transport(e))
            }
            Err(join_err) => {
                self.transition(SessionEvent::TransportClosed(join_err.to_string()));
                Err(SessionError::StreamerPanicked(join_err.to_string()))
            }
        }
    }

    /// Terminal transition: release the transport (and any recording still in
    /// flight) and return to `Idle`.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.halt.halt();
            active.skip_drain.store(true, Ordering::Relaxed);
            active.stop.cancel();
            // The detached task finishes on its own; the sink it returns is
            // dropped with it.
        }
        for effect in self.transition(SessionEvent::CloseRequested) {
            if matches!(effect, SessionEffect::ReleaseTransport) {
                self.link = None;
            }
        }
    }
}

impl Session<RecognizerLink> {
    /// Connect to the recognizer and arm the session.
    pub async fn connect(url: &str, block_size: usize) -> Result<Self, SessionError> {
        let mut session = Self::new_idle(block_size);
        session.transition(SessionEvent::ConnectRequested);

        match RecognizerLink::connect(url).await {
            Ok(link) => {
                session.link = Some(link);
                session.transition(SessionEvent::ConnectOk);
                Ok(session)
            }
            Err(e) => {
                session.transition(SessionEvent::ConnectFailed(e.to_string()));
                Err(SessionError::Transport(e))
            }
        }
    }

    /// Take the inbound transcript receiver. Call once, after connecting and
    /// before the first recording (the link moves into the streamer while a
    /// recording runs).
    pub fn take_transcripts(&mut self) -> Option<TranscriptReceiver> {
        self.link.as_mut()?.take_transcripts()
    }
}
