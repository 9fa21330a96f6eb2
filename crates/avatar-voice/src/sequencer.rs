//! **ChunkSequencer**: Reorders asynchronously annotated agent audio into one gap-free
//! playback timeline.
//!
//! The sequencer itself is a plain state machine: every input goes through
//! [`ChunkSequencer::handle`], which returns the side effects to perform as
//! [`SequencerAction`]s. [`SequencerDriver`] is the async shell that performs them
//! (annotation calls, playback, timers) and feeds the results back in.
//!
//! Every asynchronous operation carries the session *epoch* it was issued under. A session
//! reset or an interrupt bumps the epoch, so late results from a discarded session are
//! recognized and dropped instead of leaking into the new one.
//!
//! ```text
//!  submit ──► pending (FIFO) ──► annotating (≤ parallel limit) ──► ready (by sequence)
//!                                                                      │ in-order guard
//!                                                                      ▼
//!                                                               playing ──► PlaybackEngine
//! ```

use crate::annotation::{MouthCueAnnotator, MouthCues};
use crate::config::{GapPolicy, SequencerConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::PlaybackEngine;
use crate::pose::PoseState;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Groups the chunks of one agent utterance (the audio `event_id` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one chunk across async boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub epoch: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Lets a lone first chunk start if no second chunk shows up.
    FirstChunk,
    /// Releases the oldest ready chunk once it has waited the buffer window.
    BufferWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { sequence: u64 },
    /// The ready queue was full; the chunk was dropped.
    Rejected,
}

/// Everything the sequencer reacts to.
#[derive(Debug)]
pub enum SequencerInput {
    Submit {
        session: Option<SessionId>,
        audio_base64: String,
    },
    Annotated {
        ticket: Ticket,
        result: VoiceResult<MouthCues>,
    },
    PlaybackEnded {
        ticket: Ticket,
    },
    TimerFired {
        epoch: u64,
        timer: Timer,
    },
    /// Transcript of what the agent is saying; passed to annotation from now on.
    DialogHint {
        text: String,
    },
    /// Barge-in: stop playback and discard everything.
    Interrupt,
}

/// Side effects requested by the sequencer.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerAction {
    Annotate {
        ticket: Ticket,
        audio_base64: Arc<str>,
        dialog_text: Option<Arc<str>>,
    },
    /// Start playback; the pose switches to speaking with these cues.
    Play {
        ticket: Ticket,
        audio_base64: Arc<str>,
        cues: MouthCues,
    },
    StopPlayback,
    /// Return the pose to idle.
    Idle,
    ArmTimer {
        epoch: u64,
        timer: Timer,
        deadline: Instant,
    },
}

/// Result of one [`ChunkSequencer::handle`] call.
#[derive(Debug, Default)]
pub struct Step {
    /// Set for `Submit` inputs.
    pub outcome: Option<SubmitOutcome>,
    pub actions: Vec<SequencerAction>,
}

#[derive(Debug, Clone)]
struct Chunk {
    sequence: u64,
    audio: Arc<str>,
    accepted_at: Instant,
}

#[derive(Debug)]
struct ReadyChunk {
    chunk: Chunk,
    cues: MouthCues,
}

/// Point-in-time view of the queues, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerSnapshot {
    pub session: Option<SessionId>,
    pub epoch: u64,
    pub pending: usize,
    pub annotating: usize,
    pub ready: usize,
    pub playing: Option<Ticket>,
    pub last_played: Option<u64>,
}

pub struct ChunkSequencer {
    config: SequencerConfig,
    epoch: u64,
    session: Option<SessionId>,
    next_sequence: u64,
    last_played: Option<u64>,
    /// Failed sequence numbers the in-order guard may step over (`GapPolicy::SkipDropped`).
    skipped: BTreeSet<u64>,
    pending: VecDeque<Chunk>,
    annotating: BTreeMap<u64, Chunk>,
    ready: BTreeMap<u64, ReadyChunk>,
    /// May belong to an older epoch: a superseding session lets the current chunk finish.
    playing: Option<Ticket>,
    first_chunk_armed: bool,
    /// The first-chunk timeout fired before anything played; the next in-order chunk goes.
    startup_expired: bool,
    window_deadline: Option<Instant>,
    /// Survives session resets: the agent's text usually arrives before its audio.
    dialog: Option<Arc<str>>,
    actions: Vec<SequencerAction>,
}

impl ChunkSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            epoch: 0,
            session: None,
            next_sequence: 0,
            last_played: None,
            skipped: BTreeSet::new(),
            pending: VecDeque::new(),
            annotating: BTreeMap::new(),
            ready: BTreeMap::new(),
            playing: None,
            first_chunk_armed: false,
            startup_expired: false,
            window_deadline: None,
            dialog: None,
            actions: Vec::new(),
        }
    }

    /// Single dispatch entry point.
    pub fn handle(&mut self, input: SequencerInput, now: Instant) -> Step {
        let outcome = match input {
            SequencerInput::Submit {
                session,
                audio_base64,
            } => Some(self.submit(session, audio_base64, now)),
            SequencerInput::Annotated { ticket, result } => {
                self.annotated(ticket, result, now);
                None
            }
            SequencerInput::PlaybackEnded { ticket } => {
                self.playback_ended(ticket, now);
                None
            }
            SequencerInput::TimerFired { epoch, timer } => {
                self.timer_fired(epoch, timer, now);
                None
            }
            SequencerInput::DialogHint { text } => {
                debug!(chars = text.len(), "ChunkSequencer: dialog hint updated");
                self.dialog = Some(text.into());
                None
            }
            SequencerInput::Interrupt => {
                self.interrupt();
                None
            }
        };
        Step {
            outcome,
            actions: std::mem::take(&mut self.actions),
        }
    }

    pub fn snapshot(&self) -> SequencerSnapshot {
        SequencerSnapshot {
            session: self.session.clone(),
            epoch: self.epoch,
            pending: self.pending.len(),
            annotating: self.annotating.len(),
            ready: self.ready.len(),
            playing: self.playing,
            last_played: self.last_played,
        }
    }

    fn unplayed(&self) -> usize {
        self.pending.len() + self.annotating.len() + self.ready.len()
    }

    fn submit(&mut self, session: Option<SessionId>, audio: String, now: Instant) -> SubmitOutcome {
        if session.is_none() || session != self.session {
            self.reset_session(session);
        }

        if self.ready.len() >= self.config.max_buffer_size {
            warn!(
                session = ?self.session,
                ready = self.ready.len(),
                in_flight = self.annotating.len(),
                "ChunkSequencer: ready queue full, dropping chunk"
            );
            return SubmitOutcome::Rejected;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.push_back(Chunk {
            sequence,
            audio: audio.into(),
            accepted_at: now,
        });
        debug!(session = ?self.session, sequence, "ChunkSequencer: chunk accepted");
        self.pump(now);
        SubmitOutcome::Accepted { sequence }
    }

    /// Bump the epoch and drop all per-session state. Returns how many chunks were discarded.
    fn clear(&mut self) -> usize {
        self.epoch += 1;
        let discarded = self.unplayed();
        self.pending.clear();
        self.annotating.clear();
        self.ready.clear();
        self.skipped.clear();
        self.next_sequence = 0;
        self.last_played = None;
        self.first_chunk_armed = false;
        self.startup_expired = false;
        self.window_deadline = None;
        discarded
    }

    fn reset_session(&mut self, session: Option<SessionId>) {
        let discarded = self.clear();
        info!(
            previous = ?self.session,
            session = ?session,
            epoch = self.epoch,
            discarded,
            "ChunkSequencer: new session"
        );
        self.session = session;
    }

    /// Fill free annotation slots from the pending FIFO.
    fn pump(&mut self, now: Instant) {
        while self.annotating.len() < self.config.parallel_processing_limit {
            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            let ticket = Ticket {
                epoch: self.epoch,
                sequence: chunk.sequence,
            };
            if chunk.sequence == 0 && !self.first_chunk_armed && self.last_played.is_none() {
                self.first_chunk_armed = true;
                self.actions.push(SequencerAction::ArmTimer {
                    epoch: self.epoch,
                    timer: Timer::FirstChunk,
                    deadline: now + self.config.first_chunk_timeout(),
                });
            }
            self.actions.push(SequencerAction::Annotate {
                ticket,
                audio_base64: Arc::clone(&chunk.audio),
                dialog_text: self.dialog.clone(),
            });
            self.annotating.insert(chunk.sequence, chunk);
        }
    }

    fn annotated(&mut self, ticket: Ticket, result: VoiceResult<MouthCues>, now: Instant) {
        if ticket.epoch != self.epoch {
            debug!(?ticket, epoch = self.epoch, "ChunkSequencer: stale annotation ignored");
            return;
        }
        let Some(chunk) = self.annotating.remove(&ticket.sequence) else {
            return;
        };
        match result {
            Ok(cues) => {
                debug!(
                    sequence = chunk.sequence,
                    cues = cues.cues().len(),
                    "ChunkSequencer: chunk ready"
                );
                self.ready.insert(chunk.sequence, ReadyChunk { chunk, cues });
            }
            Err(e) => {
                warn!(
                    session = ?self.session,
                    sequence = chunk.sequence,
                    policy = ?self.config.gap_policy,
                    "ChunkSequencer: annotation failed, dropping chunk: {}",
                    e
                );
                if self.config.gap_policy == GapPolicy::SkipDropped {
                    self.skipped.insert(chunk.sequence);
                }
            }
        }
        self.pump(now);
        self.try_release(now, false);
    }

    fn playback_ended(&mut self, ticket: Ticket, now: Instant) {
        if self.playing != Some(ticket) {
            debug!(?ticket, "ChunkSequencer: playback end for an item no longer tracked");
            return;
        }
        self.playing = None;
        self.actions.push(SequencerAction::Idle);
        self.try_release(now, true);
    }

    fn timer_fired(&mut self, epoch: u64, timer: Timer, now: Instant) {
        if epoch != self.epoch {
            return;
        }
        match timer {
            Timer::FirstChunk => {
                if !self.first_chunk_armed {
                    return;
                }
                self.first_chunk_armed = false;
                if self.last_played.is_none() {
                    self.startup_expired = true;
                }
                self.try_release(now, true);
            }
            Timer::BufferWindow => {
                if self.window_deadline.is_some_and(|d| d <= now) {
                    self.window_deadline = None;
                }
                self.try_release(now, false);
            }
        }
    }

    fn interrupt(&mut self) {
        let discarded = self.clear();
        self.session = None;
        self.playing = None;
        self.dialog = None;
        info!(epoch = self.epoch, discarded, "ChunkSequencer: interrupted");
        self.actions.push(SequencerAction::StopPlayback);
        self.actions.push(SequencerAction::Idle);
    }

    /// Next sequence number allowed to play.
    fn next_expected(&self) -> u64 {
        let mut next = self.last_played.map_or(0, |s| s + 1);
        while self.skipped.contains(&next) {
            next += 1;
        }
        next
    }

    /// Release the oldest ready chunk if the in-order guard and release policy allow.
    /// `force` covers the event-driven triggers (first-chunk timeout, playback ended).
    fn try_release(&mut self, now: Instant, force: bool) {
        if self.playing.is_some() {
            return;
        }
        let Some((&oldest, ready)) = self.ready.first_key_value() else {
            return;
        };
        if oldest != self.next_expected() {
            // An earlier chunk is still annotating; use free slots to close the gap.
            debug!(
                oldest,
                expected = self.next_expected(),
                "ChunkSequencer: waiting for earlier chunk"
            );
            self.pump(now);
            return;
        }

        let window_deadline = ready.chunk.accepted_at + self.config.buffer_window();
        let release = force
            || self.startup_expired
            || self.ready.len() >= 2
            || now >= window_deadline;
        if !release {
            if self.window_deadline.map_or(true, |d| d > window_deadline) {
                self.window_deadline = Some(window_deadline);
                self.actions.push(SequencerAction::ArmTimer {
                    epoch: self.epoch,
                    timer: Timer::BufferWindow,
                    deadline: window_deadline,
                });
            }
            return;
        }

        let Some(ReadyChunk { chunk, cues }) = self.ready.remove(&oldest) else {
            return;
        };
        let ticket = Ticket {
            epoch: self.epoch,
            sequence: chunk.sequence,
        };
        self.last_played = Some(chunk.sequence);
        self.skipped.retain(|&s| s > chunk.sequence);
        self.first_chunk_armed = false;
        self.startup_expired = false;
        self.window_deadline = None;
        self.playing = Some(ticket);
        info!(
            session = ?self.session,
            sequence = chunk.sequence,
            ready = self.ready.len(),
            annotating = self.annotating.len(),
            "ChunkSequencer: releasing chunk"
        );
        self.actions.push(SequencerAction::Play {
            ticket,
            audio_base64: chunk.audio,
            cues,
        });
        // Prefetch while this one plays.
        self.pump(now);
    }
}

enum Command {
    Submit {
        session: Option<SessionId>,
        audio_base64: String,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    DialogHint(String),
    Interrupt,
    Snapshot {
        reply: oneshot::Sender<SequencerSnapshot>,
    },
}

/// Cloneable front door to a running [`SequencerDriver`].
#[derive(Clone)]
pub struct SequencerHandle {
    commands: mpsc::UnboundedSender<Command>,
    engine: Arc<PlaybackEngine>,
}

impl SequencerHandle {
    /// Submit one audio chunk. `session` is the utterance id; `None` starts a fresh
    /// unsequenced session for every chunk.
    pub async fn submit(
        &self,
        session: Option<SessionId>,
        audio_base64: String,
    ) -> VoiceResult<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                session,
                audio_base64,
                reply,
            })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        rx.await
            .map_err(|e| VoiceError::ChannelSend(format!("sequencer stopped: {}", e)))
    }

    /// Barge-in. Output stops before this returns; the queues are cleared by the driver.
    pub fn interrupt(&self) -> VoiceResult<()> {
        self.engine.stop();
        self.commands
            .send(Command::Interrupt)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Hint the annotator with what the agent is saying. Applies to chunks that start
    /// annotation after this call; cleared by [`interrupt`](Self::interrupt).
    pub fn set_dialog_hint(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.commands
            .send(Command::DialogHint(text.into()))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub async fn snapshot(&self) -> VoiceResult<SequencerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        rx.await
            .map_err(|e| VoiceError::ChannelSend(format!("sequencer stopped: {}", e)))
    }
}

/// Owns a [`ChunkSequencer`] and performs its actions.
pub struct SequencerDriver {
    sequencer: ChunkSequencer,
    annotator: Arc<dyn MouthCueAnnotator>,
    engine: Arc<PlaybackEngine>,
    pose_tx: watch::Sender<PoseState>,
    events_tx: mpsc::UnboundedSender<SequencerInput>,
}

impl SequencerDriver {
    /// Spawn the driver task. Returns the handle, the chunk-level pose state and the task.
    /// The task ends when every handle has been dropped.
    pub fn spawn(
        config: SequencerConfig,
        annotator: Arc<dyn MouthCueAnnotator>,
        engine: Arc<PlaybackEngine>,
    ) -> (SequencerHandle, watch::Receiver<PoseState>, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pose_tx, pose_rx) = watch::channel(PoseState::idle());

        let driver = Self {
            sequencer: ChunkSequencer::new(config),
            annotator,
            engine: Arc::clone(&engine),
            pose_tx,
            events_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, events_rx));
        let handle = SequencerHandle {
            commands: commands_tx,
            engine,
        };
        (handle, pose_rx, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SequencerInput>,
    ) {
        info!("SequencerDriver: started");
        loop {
            let input = tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Submit { session, audio_base64, reply }) => {
                        let step = self.dispatch(SequencerInput::Submit { session, audio_base64 });
                        if let Some(outcome) = step {
                            let _ = reply.send(outcome);
                        }
                        continue;
                    }
                    Some(Command::DialogHint(text)) => SequencerInput::DialogHint { text },
                    Some(Command::Interrupt) => SequencerInput::Interrupt,
                    Some(Command::Snapshot { reply }) => {
                        let _ = reply.send(self.sequencer.snapshot());
                        continue;
                    }
                    None => break,
                },
                Some(ev) = events.recv() => ev,
            };
            self.dispatch(input);
        }
        self.engine.stop();
        info!("SequencerDriver: stopped");
    }

    fn dispatch(&mut self, input: SequencerInput) -> Option<SubmitOutcome> {
        let now = tokio::time::Instant::now().into_std();
        let step = self.sequencer.handle(input, now);
        for action in step.actions {
            self.execute(action);
        }
        step.outcome
    }

    fn execute(&mut self, action: SequencerAction) {
        match action {
            SequencerAction::Annotate {
                ticket,
                audio_base64,
                dialog_text,
            } => {
                let annotator = Arc::clone(&self.annotator);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = annotator.annotate(&audio_base64, dialog_text.as_deref()).await;
                    let _ = events.send(SequencerInput::Annotated { ticket, result });
                });
            }
            SequencerAction::Play {
                ticket,
                audio_base64,
                cues,
            } => {
                self.pose_tx.send_replace(PoseState::speaking(cues));
                let engine = Arc::clone(&self.engine);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    match engine.play(&audio_base64).await {
                        Ok(outcome) => debug!(?ticket, ?outcome, "SequencerDriver: playback finished"),
                        Err(e) => warn!(?ticket, "SequencerDriver: playback failed: {}", e),
                    }
                    let _ = events.send(SequencerInput::PlaybackEnded { ticket });
                });
            }
            SequencerAction::StopPlayback => self.engine.stop(),
            SequencerAction::Idle => {
                self.pose_tx.send_replace(PoseState::idle());
            }
            SequencerAction::ArmTimer {
                epoch,
                timer,
                deadline,
            } => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                    let _ = events.send(SequencerInput::TimerFired { epoch, timer });
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::MouthCue;
    use std::time::Duration;

    fn cues() -> MouthCues {
        MouthCues::new(vec![MouthCue::new(0.0, 0.1, "A")], 0.1)
    }

    fn submit(seq: &mut ChunkSequencer, session: &str, now: Instant) -> Step {
        seq.handle(
            SequencerInput::Submit {
                session: Some(session.into()),
                audio_base64: "AAAA".into(),
            },
            now,
        )
    }

    fn annotated(seq: &mut ChunkSequencer, epoch: u64, sequence: u64, now: Instant) -> Step {
        seq.handle(
            SequencerInput::Annotated {
                ticket: Ticket { epoch, sequence },
                result: Ok(cues()),
            },
            now,
        )
    }

    fn played(step: &Step) -> Vec<u64> {
        step.actions
            .iter()
            .filter_map(|a| match a {
                SequencerAction::Play { ticket, .. } => Some(ticket.sequence),
                _ => None,
            })
            .collect()
    }

    fn annotations(step: &Step) -> Vec<u64> {
        step.actions
            .iter()
            .filter_map(|a| match a {
                SequencerAction::Annotate { ticket, .. } => Some(ticket.sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn assigns_sequences_and_limits_parallel_annotation() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        let s0 = submit(&mut seq, "s1", t0);
        assert_eq!(s0.outcome, Some(SubmitOutcome::Accepted { sequence: 0 }));
        assert_eq!(annotations(&s0), vec![0]);
        assert!(s0.actions.iter().any(|a| matches!(
            a,
            SequencerAction::ArmTimer { timer: Timer::FirstChunk, .. }
        )));

        let s1 = submit(&mut seq, "s1", t0);
        assert_eq!(annotations(&s1), vec![1]);
        let s2 = submit(&mut seq, "s1", t0);
        assert_eq!(s2.outcome, Some(SubmitOutcome::Accepted { sequence: 2 }));
        assert!(annotations(&s2).is_empty());
        assert_eq!(seq.snapshot().pending, 1);
        assert_eq!(seq.snapshot().annotating, 2);
    }

    #[test]
    fn out_of_order_completion_still_plays_in_order() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;

        let step = annotated(&mut seq, epoch, 1, t0);
        assert!(played(&step).is_empty());
        let step = annotated(&mut seq, epoch, 0, t0);
        assert_eq!(played(&step), vec![0]);

        let step = seq.handle(
            SequencerInput::PlaybackEnded {
                ticket: Ticket { epoch, sequence: 0 },
            },
            t0,
        );
        assert_eq!(step.actions.first(), Some(&SequencerAction::Idle));
        assert_eq!(played(&step), vec![1]);
    }

    #[test]
    fn keeps_annotating_while_a_chunk_plays() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        for _ in 0..4 {
            submit(&mut seq, "s1", t0);
        }
        let epoch = seq.snapshot().epoch;

        let step = annotated(&mut seq, epoch, 0, t0);
        assert_eq!(annotations(&step), vec![2]);
        let step = annotated(&mut seq, epoch, 1, t0);
        assert_eq!(played(&step), vec![0]);
        assert_eq!(annotations(&step), vec![3]);

        let snap = seq.snapshot();
        assert_eq!((snap.pending, snap.annotating, snap.ready), (0, 2, 1));
    }

    #[test]
    fn dialog_hint_reaches_later_annotations() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        let hints = |step: &Step| -> Vec<Option<String>> {
            step.actions
                .iter()
                .filter_map(|a| match a {
                    SequencerAction::Annotate { dialog_text, .. } => {
                        Some(dialog_text.as_deref().map(str::to_string))
                    }
                    _ => None,
                })
                .collect()
        };

        assert_eq!(hints(&submit(&mut seq, "s1", t0)), vec![None]);
        seq.handle(SequencerInput::DialogHint { text: "Hello there".into() }, t0);
        // A new session keeps the hint.
        assert_eq!(hints(&submit(&mut seq, "s2", t0)), vec![Some("Hello there".to_string())]);

        seq.handle(SequencerInput::Interrupt, t0);
        assert_eq!(hints(&submit(&mut seq, "s3", t0)), vec![None]);
    }

    #[test]
    fn lone_first_chunk_waits_for_timeout() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;
        let step = annotated(&mut seq, epoch, 0, t0 + Duration::from_millis(100));
        assert!(played(&step).is_empty());

        let step = seq.handle(
            SequencerInput::TimerFired {
                epoch,
                timer: Timer::FirstChunk,
            },
            t0 + Duration::from_millis(500),
        );
        assert_eq!(played(&step), vec![0]);
    }

    #[test]
    fn buffer_window_releases_oldest() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;
        let step = annotated(&mut seq, epoch, 0, t0);
        assert_eq!(played(&step), vec![] as Vec<u64>);
        let step = annotated(&mut seq, epoch, 1, t0);
        assert_eq!(played(&step), vec![0]);
        seq.handle(SequencerInput::PlaybackEnded { ticket: Ticket { epoch, sequence: 0 } }, t0);
        assert_eq!(seq.snapshot().playing, Some(Ticket { epoch, sequence: 1 }));
        seq.handle(SequencerInput::PlaybackEnded { ticket: Ticket { epoch, sequence: 1 } }, t0);

        // A third chunk arriving after playback went idle waits out the window.
        let t1 = t0 + Duration::from_secs(5);
        submit(&mut seq, "s1", t1);
        let step = annotated(&mut seq, epoch, 2, t1);
        assert!(played(&step).is_empty());
        let deadline = step.actions.iter().find_map(|a| match a {
            SequencerAction::ArmTimer { timer: Timer::BufferWindow, deadline, .. } => Some(*deadline),
            _ => None,
        });
        assert_eq!(deadline, Some(t1 + Duration::from_millis(1000)));
        let step = seq.handle(
            SequencerInput::TimerFired { epoch, timer: Timer::BufferWindow },
            t1 + Duration::from_millis(1000),
        );
        assert_eq!(played(&step), vec![2]);
    }

    #[test]
    fn new_session_discards_and_restarts_numbering() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let old_epoch = seq.snapshot().epoch;

        let step = submit(&mut seq, "s2", t0);
        assert_eq!(step.outcome, Some(SubmitOutcome::Accepted { sequence: 0 }));
        let snap = seq.snapshot();
        assert_eq!(snap.session, Some("s2".into()));
        assert_eq!(snap.pending + snap.annotating + snap.ready, 1);

        // Late result from the old session is ignored.
        let step = annotated(&mut seq, old_epoch, 1, t0);
        assert!(step.actions.is_empty());
        assert_eq!(seq.snapshot().ready, 0);
    }

    #[test]
    fn absent_session_resets_every_chunk() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        for _ in 0..3 {
            let step = seq.handle(
                SequencerInput::Submit {
                    session: None,
                    audio_base64: "AAAA".into(),
                },
                t0,
            );
            assert_eq!(step.outcome, Some(SubmitOutcome::Accepted { sequence: 0 }));
        }
    }

    #[test]
    fn queued_chunks_are_not_capped() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        for i in 0..8 {
            assert_eq!(
                submit(&mut seq, "s1", t0).outcome,
                Some(SubmitOutcome::Accepted { sequence: i })
            );
        }
        let snap = seq.snapshot();
        assert_eq!((snap.pending, snap.annotating, snap.ready), (6, 2, 0));
    }

    #[test]
    fn full_ready_queue_rejects_without_consuming_a_sequence() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        for _ in 0..7 {
            submit(&mut seq, "s1", t0);
        }
        let epoch = seq.snapshot().epoch;
        // Chunk 0 stays in annotation, so 1..=5 pile up behind the in-order guard.
        for sequence in 1..=5 {
            let step = annotated(&mut seq, epoch, sequence, t0);
            assert!(played(&step).is_empty());
        }
        let snap = seq.snapshot();
        assert_eq!((snap.pending, snap.annotating, snap.ready), (0, 2, 5));

        assert_eq!(submit(&mut seq, "s1", t0).outcome, Some(SubmitOutcome::Rejected));
        assert_eq!(seq.snapshot().ready, 5);

        // The head arrives and plays, then its successor drains one more slot.
        let step = annotated(&mut seq, epoch, 0, t0);
        assert_eq!(played(&step), vec![0]);
        assert_eq!(seq.snapshot().ready, 5);
        let step = seq.handle(SequencerInput::PlaybackEnded { ticket: Ticket { epoch, sequence: 0 } }, t0);
        assert_eq!(played(&step), vec![1]);
        assert_eq!(seq.snapshot().ready, 4);
        // Numbering continues without a gap.
        assert_eq!(
            submit(&mut seq, "s1", t0).outcome,
            Some(SubmitOutcome::Accepted { sequence: 7 })
        );
    }

    #[test]
    fn failed_annotation_stalls_by_default() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;
        seq.handle(
            SequencerInput::Annotated {
                ticket: Ticket { epoch, sequence: 0 },
                result: Err(VoiceError::Annotation("down".into())),
            },
            t0,
        );
        let step = annotated(&mut seq, epoch, 1, t0 + Duration::from_secs(10));
        assert!(played(&step).is_empty());
        assert_eq!(seq.snapshot().ready, 1);
    }

    #[test]
    fn skip_dropped_steps_over_failures() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig {
            gap_policy: GapPolicy::SkipDropped,
            ..Default::default()
        });
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;
        seq.handle(
            SequencerInput::Annotated {
                ticket: Ticket { epoch, sequence: 0 },
                result: Err(VoiceError::Annotation("down".into())),
            },
            t0,
        );
        let step = annotated(&mut seq, epoch, 1, t0 + Duration::from_secs(2));
        assert_eq!(played(&step), vec![1]);
    }

    #[test]
    fn interrupt_clears_everything_and_stops() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        submit(&mut seq, "s1", t0);
        let epoch = seq.snapshot().epoch;
        annotated(&mut seq, epoch, 0, t0);
        annotated(&mut seq, epoch, 1, t0);
        assert!(seq.snapshot().playing.is_some());

        let step = seq.handle(SequencerInput::Interrupt, t0);
        assert!(step.actions.contains(&SequencerAction::StopPlayback));
        let snap = seq.snapshot();
        assert_eq!(snap.session, None);
        assert_eq!((snap.pending, snap.annotating, snap.ready), (0, 0, 0));
        assert_eq!(snap.playing, None);

        // The stopped item's end notification is no longer tracked.
        let step = seq.handle(SequencerInput::PlaybackEnded { ticket: Ticket { epoch, sequence: 0 } }, t0);
        assert!(step.actions.is_empty());
    }

    #[test]
    fn superseding_session_waits_for_current_chunk() {
        let t0 = Instant::now();
        let mut seq = ChunkSequencer::new(SequencerConfig::default());
        submit(&mut seq, "s1", t0);
        let e1 = seq.snapshot().epoch;
        annotated(&mut seq, e1, 0, t0);
        seq.handle(SequencerInput::TimerFired { epoch: e1, timer: Timer::FirstChunk }, t0);
        let playing = seq.snapshot().playing;
        assert_eq!(playing, Some(Ticket { epoch: e1, sequence: 0 }));

        submit(&mut seq, "s2", t0);
        submit(&mut seq, "s2", t0);
        let e2 = seq.snapshot().epoch;
        annotated(&mut seq, e2, 0, t0);
        let step = annotated(&mut seq, e2, 1, t0);
        assert!(played(&step).is_empty());

        let step = seq.handle(SequencerInput::PlaybackEnded { ticket: Ticket { epoch: e1, sequence: 0 } }, t0);
        assert_eq!(played(&step), vec![0]);
        assert_eq!(seq.snapshot().playing, Some(Ticket { epoch: e2, sequence: 0 }));
    }
}
