//! **PlaybackEngine**: Single-item PCM playback with a sample-accurate cursor.
//!
//! Each `play` call decodes one base64 PCM16 payload and hands it to an [`AudioSink`] wrapped
//! in a [`ClockedSource`]. The source counts the frames the output device actually pulls, so
//! `elapsed_seconds()` follows the audio clock rather than a wall-clock timer. `stop()` is the
//! barge-in kill-switch: the source goes silent on its very next pull.

use crate::error::{VoiceError, VoiceResult};
use crate::pcm::PcmBuffer;
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

const STATE_PLAYING: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// How a `play` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The buffer played to its last sample.
    Completed,
    /// `stop()` cut it short.
    Stopped,
    /// The payload could not be decoded (or was empty); nothing was played.
    Skipped,
}

/// Notifications emitted by the engine, one `Started` (unless skipped) and exactly one
/// `Ended` per `play` call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { item: u64, duration: Duration },
    Ended { item: u64, outcome: PlaybackOutcome },
}

/// Output device seam. Implemented over rodio for real speakers and in memory for tests.
pub trait AudioSink: Send + Sync {
    /// Queue a source for immediate playback.
    fn append(&self, source: ClockedSource) -> VoiceResult<()>;
}

/// Shared between the engine and the source running on the audio thread.
struct Progress {
    item: u64,
    frames: AtomicU64,
    state: AtomicU8,
    done: Notify,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Progress {
    /// Move out of PLAYING exactly once; the winner announces the end.
    fn finish(&self, to: u8) -> bool {
        if self
            .state
            .compare_exchange(STATE_PLAYING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let outcome = if to == STATE_COMPLETED {
            PlaybackOutcome::Completed
        } else {
            PlaybackOutcome::Stopped
        };
        let _ = self.events.send(PlaybackEvent::Ended {
            item: self.item,
            outcome,
        });
        self.done.notify_one();
        true
    }

    fn is_playing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PLAYING
    }
}

/// Mono f32 source that records how many frames the output has consumed.
pub struct ClockedSource {
    samples: Arc<[f32]>,
    pos: usize,
    sample_rate: u32,
    progress: Arc<Progress>,
}

impl Iterator for ClockedSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if !self.progress.is_playing() {
            return None;
        }
        match self.samples.get(self.pos) {
            Some(&sample) => {
                self.pos += 1;
                self.progress.frames.store(self.pos as u64, Ordering::Release);
                Some(sample)
            }
            None => {
                self.progress.finish(STATE_COMPLETED);
                None
            }
        }
    }
}

impl Source for ClockedSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.samples.len().saturating_sub(self.pos))
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs_f64(
            self.samples.len() as f64 / self.sample_rate.max(1) as f64,
        ))
    }
}

struct Active {
    progress: Arc<Progress>,
    duration: f64,
    sample_rate: u32,
}

/// Plays one decoded buffer at a time. Callers serialize `play` calls; overlapping calls
/// are rejected with [`VoiceError::PlaybackBusy`].
pub struct PlaybackEngine {
    sink: Box<dyn AudioSink>,
    sample_rate: u32,
    current: Mutex<Option<Active>>,
    next_item: AtomicU64,
    events_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackEngine {
    /// Create an engine over `sink`. Returns the engine and its event receiver.
    pub fn new(
        sink: Box<dyn AudioSink>,
        sample_rate: u32,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            sink,
            sample_rate,
            current: Mutex::new(None),
            next_item: AtomicU64::new(0),
            events_tx,
        };
        (engine, events_rx)
    }

    /// Decode and play one base64 PCM16 payload, resolving when it ends.
    ///
    /// `Started` is emitted before the first sample is queued. A payload that fails to
    /// decode is a no-op that resolves to [`PlaybackOutcome::Skipped`].
    pub async fn play(&self, audio_base64: &str) -> VoiceResult<PlaybackOutcome> {
        let item = self.next_item.fetch_add(1, Ordering::Relaxed);
        let progress = {
            let mut current = self.lock_current();
            if current.as_ref().is_some_and(|a| a.progress.is_playing()) {
                return Err(VoiceError::PlaybackBusy);
            }

            let buffer = match PcmBuffer::from_base64(audio_base64) {
                Ok(b) if !b.is_empty() => PcmBuffer::new(b.samples, self.sample_rate),
                Ok(_) => {
                    debug!(item, "PlaybackEngine: empty payload, skipping");
                    return Ok(self.skip(item));
                }
                Err(e) => {
                    warn!(item, "PlaybackEngine: undecodable payload, skipping: {}", e);
                    return Ok(self.skip(item));
                }
            };

            let duration = buffer.duration_seconds();
            let progress = Arc::new(Progress {
                item,
                frames: AtomicU64::new(0),
                state: AtomicU8::new(STATE_PLAYING),
                done: Notify::new(),
                events: self.events_tx.clone(),
            });
            let source = ClockedSource {
                samples: buffer.samples.into(),
                pos: 0,
                sample_rate: self.sample_rate,
                progress: Arc::clone(&progress),
            };

            *current = Some(Active {
                progress: Arc::clone(&progress),
                duration,
                sample_rate: self.sample_rate,
            });
            let _ = self.events_tx.send(PlaybackEvent::Started {
                item,
                duration: Duration::from_secs_f64(duration),
            });
            if let Err(e) = self.sink.append(source) {
                warn!(item, "PlaybackEngine: sink rejected source: {}", e);
                progress.finish(STATE_STOPPED);
                *current = None;
                return Err(e);
            }
            debug!(item, duration, "PlaybackEngine: playing");
            progress
        };

        progress.done.notified().await;

        match progress.state.load(Ordering::Acquire) {
            STATE_COMPLETED => {
                let mut current = self.lock_current();
                if current.as_ref().is_some_and(|a| a.progress.item == item) {
                    *current = None;
                }
                Ok(PlaybackOutcome::Completed)
            }
            _ => Ok(PlaybackOutcome::Stopped),
        }
    }

    fn skip(&self, item: u64) -> PlaybackOutcome {
        let _ = self.events_tx.send(PlaybackEvent::Ended {
            item,
            outcome: PlaybackOutcome::Skipped,
        });
        PlaybackOutcome::Skipped
    }

    /// Halt output immediately. Idempotent; a no-op when nothing is playing.
    pub fn stop(&self) {
        let active = self.lock_current().take();
        if let Some(active) = active {
            if active.progress.finish(STATE_STOPPED) {
                info!(item = active.progress.item, "PlaybackEngine: stopped");
            }
        }
    }

    /// Seconds of the current item the device has consumed, clamped to its duration.
    /// Reads 0 when nothing is playing.
    pub fn elapsed_seconds(&self) -> f64 {
        match self.lock_current().as_ref() {
            Some(a) if a.progress.is_playing() => {
                let frames = a.progress.frames.load(Ordering::Acquire);
                (frames as f64 / a.sample_rate as f64).min(a.duration)
            }
            _ => 0.0,
        }
    }

    /// Total duration of the current item, 0 when idle.
    pub fn duration_seconds(&self) -> f64 {
        match self.lock_current().as_ref() {
            Some(a) if a.progress.is_playing() => a.duration,
            _ => 0.0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock_current()
            .as_ref()
            .is_some_and(|a| a.progress.is_playing())
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Active>> {
        // The guarded value stays consistent even if a holder panicked.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Speaker output via rodio's default device.
///
/// `OutputStream` is not `Send` on every platform, so it lives on its own thread for as
/// long as this sink exists; only the `Sink` is shared.
pub struct RodioSink {
    sink: Sink,
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl RodioSink {
    pub fn open_default() -> VoiceResult<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();

        thread::Builder::new()
            .name("avatar-audio-out".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    if handle_tx.send(Ok(handle)).is_err() {
                        return;
                    }
                    // Returns once the sink (and its sender) is dropped.
                    let _ = keepalive_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(e.to_string()));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|e| VoiceError::Playback(format!("output thread exited: {}", e)))?
            .map_err(VoiceError::Playback)?;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("RodioSink: default output ready");
        Ok(Self {
            sink,
            _keepalive: keepalive_tx,
        })
    }
}

impl AudioSink for RodioSink {
    fn append(&self, source: ClockedSource) -> VoiceResult<()> {
        self.sink.append(source);
        Ok(())
    }
}

/// In-memory output for tests and headless runs. Nothing is consumed until
/// [`MemorySink::pull`] is called, which stands in for the device clock.
#[derive(Default)]
pub struct MemorySink {
    current: Mutex<Option<ClockedSource>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume up to `frames` samples from the queued source, returning what was played.
    /// Pulling past the end completes the item.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(frames);
        let Some(source) = guard.as_mut() else {
            return out;
        };
        for _ in 0..frames {
            match source.next() {
                Some(s) => out.push(s),
                None => {
                    *guard = None;
                    break;
                }
            }
        }
        out
    }

    /// Consume the rest of the queued source.
    pub fn drain(&self) -> Vec<f32> {
        self.pull(usize::MAX / 2)
    }

    /// True while a source is queued and has not reported its end.
    pub fn has_source(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl AudioSink for MemorySink {
    fn append(&self, source: ClockedSource) -> VoiceResult<()> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        Ok(())
    }
}

impl AudioSink for Arc<MemorySink> {
    fn append(&self, source: ClockedSource) -> VoiceResult<()> {
        self.as_ref().append(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::encode_pcm16_base64;

    fn engine() -> (
        Arc<PlaybackEngine>,
        Arc<MemorySink>,
        mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let sink = Arc::new(MemorySink::new());
        let (engine, rx) = PlaybackEngine::new(Box::new(Arc::clone(&sink)), 16000);
        (Arc::new(engine), sink, rx)
    }

    fn tone(samples: usize) -> String {
        encode_pcm16_base64(&vec![0.25; samples])
    }

    #[tokio::test]
    async fn completes_and_reports_events_once() {
        let (engine, sink, mut rx) = engine();
        let e = Arc::clone(&engine);
        let task = tokio::spawn(async move { e.play(&tone(1600)).await });
        tokio::task::yield_now().await;

        assert!(matches!(rx.recv().await, Some(PlaybackEvent::Started { item: 0, .. })));
        assert!(engine.is_playing());
        assert!((engine.duration_seconds() - 0.1).abs() < 1e-9);

        sink.drain();
        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Completed);
        assert_eq!(
            rx.recv().await,
            Some(PlaybackEvent::Ended {
                item: 0,
                outcome: PlaybackOutcome::Completed
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(!engine.is_playing());
        assert_eq!(engine.elapsed_seconds(), 0.0);
    }

    #[tokio::test]
    async fn elapsed_tracks_consumed_frames() {
        let (engine, sink, _rx) = engine();
        let e = Arc::clone(&engine);
        let _task = tokio::spawn(async move { e.play(&tone(16000)).await });
        tokio::task::yield_now().await;

        let mut last = engine.elapsed_seconds();
        assert_eq!(last, 0.0);
        for _ in 0..9 {
            sink.pull(1600);
            let now = engine.elapsed_seconds();
            assert!(now >= last);
            assert!(now <= engine.duration_seconds());
            last = now;
        }
        assert!((last - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_resets_cursor_and_resolves_stopped() {
        let (engine, sink, mut rx) = engine();
        let e = Arc::clone(&engine);
        let task = tokio::spawn(async move { e.play(&tone(16000)).await });
        tokio::task::yield_now().await;
        let _ = rx.recv().await;

        sink.pull(4000);
        assert!(engine.elapsed_seconds() > 0.0);
        engine.stop();
        assert_eq!(engine.elapsed_seconds(), 0.0);
        assert_eq!(engine.duration_seconds(), 0.0);
        assert!(sink.pull(100).is_empty());

        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(
            rx.recv().await,
            Some(PlaybackEvent::Ended {
                item: 0,
                outcome: PlaybackOutcome::Stopped
            })
        );

        // Idempotent when idle.
        engine.stop();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_noop() {
        let (engine, _sink, mut rx) = engine();
        let outcome = engine.play("%%% not audio %%%").await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Skipped);
        assert_eq!(
            rx.recv().await,
            Some(PlaybackEvent::Ended {
                item: 0,
                outcome: PlaybackOutcome::Skipped
            })
        );
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn overlapping_play_is_rejected() {
        let (engine, sink, _rx) = engine();
        let e = Arc::clone(&engine);
        let first = tokio::spawn(async move { e.play(&tone(800)).await });
        tokio::task::yield_now().await;

        let second = engine.play(&tone(800)).await;
        assert!(matches!(second, Err(VoiceError::PlaybackBusy)));

        sink.drain();
        assert_eq!(first.await.unwrap().unwrap(), PlaybackOutcome::Completed);
        assert!(!sink.has_source());
    }
}
