//! Pose projection: what the avatar's face and body should be doing right now.
//!
//! The sequencer sets the chunk-level [`PoseState`] (expression, animation, cues) when a chunk
//! starts and ends. [`PosePoller`] samples the playback cursor at a fixed cadence and
//! publishes the resulting [`Pose`] for the renderer.

use crate::annotation::MouthCues;
use crate::playback::PlaybackEngine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Rhubarb mouth shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Viseme {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    X,
}

impl Viseme {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "A" => Viseme::A,
            "B" => Viseme::B,
            "C" => Viseme::C,
            "D" => Viseme::D,
            "E" => Viseme::E,
            "F" => Viseme::F,
            "G" => Viseme::G,
            "H" => Viseme::H,
            "X" => Viseme::X,
            _ => return None,
        })
    }

    /// Morph target driven for this shape.
    pub fn morph_target(self) -> &'static str {
        match self {
            Viseme::A | Viseme::X => "viseme_PP",
            Viseme::B => "viseme_kk",
            Viseme::C => "viseme_I",
            Viseme::D => "viseme_aa",
            Viseme::E => "viseme_O",
            Viseme::F => "viseme_U",
            Viseme::G => "viseme_FF",
            Viseme::H => "viseme_TH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FacialExpression {
    #[default]
    Default,
    Smile,
    Sad,
    Angry,
    Surprised,
    FunnyFace,
}

impl FacialExpression {
    /// Blend-shape weights for this expression; anything not listed rests at 0.
    pub fn blend_shapes(self) -> &'static [(&'static str, f32)] {
        match self {
            FacialExpression::Default => &[],
            FacialExpression::Smile => &[
                ("browInnerUp", 0.17),
                ("eyeSquintLeft", 0.4),
                ("eyeSquintRight", 0.44),
                ("noseSneerLeft", 0.17),
                ("noseSneerRight", 0.14),
                ("mouthPressLeft", 0.61),
                ("mouthPressRight", 0.41),
            ],
            FacialExpression::Sad => &[
                ("mouthFrownLeft", 1.0),
                ("mouthFrownRight", 1.0),
                ("mouthShrugLower", 0.78),
                ("browInnerUp", 0.45),
                ("eyeSquintLeft", 0.72),
                ("eyeSquintRight", 0.75),
                ("eyeLookDownLeft", 0.5),
                ("eyeLookDownRight", 0.5),
                ("jawForward", 1.0),
            ],
            FacialExpression::Angry => &[
                ("browDownLeft", 1.0),
                ("browDownRight", 1.0),
                ("eyeSquintLeft", 1.0),
                ("eyeSquintRight", 1.0),
                ("jawForward", 1.0),
                ("jawLeft", 1.0),
                ("mouthShrugLower", 1.0),
                ("noseSneerLeft", 1.0),
                ("noseSneerRight", 0.42),
                ("cheekSquintLeft", 1.0),
                ("cheekSquintRight", 1.0),
                ("mouthClose", 0.23),
                ("mouthFunnel", 0.63),
            ],
            FacialExpression::Surprised => &[
                ("eyeWideLeft", 0.5),
                ("eyeWideRight", 0.5),
                ("jawOpen", 0.35),
                ("mouthFunnel", 1.0),
                ("browInnerUp", 1.0),
            ],
            FacialExpression::FunnyFace => &[
                ("jawLeft", 0.63),
                ("mouthPucker", 0.53),
                ("noseSneerLeft", 1.0),
                ("noseSneerRight", 0.39),
                ("mouthLeft", 1.0),
                ("eyeLookUpLeft", 1.0),
                ("eyeLookUpRight", 1.0),
                ("cheekPuff", 1.0),
                ("mouthDimpleLeft", 0.41),
                ("mouthRollLower", 0.32),
                ("mouthSmileLeft", 0.35),
                ("mouthSmileRight", 0.35),
            ],
        }
    }
}

/// Body animation clips shipped with the avatar rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Animation {
    #[default]
    Idle,
    TalkingOne,
    TalkingTwo,
    TalkingThree,
    SadIdle,
    Defeated,
    Angry,
    Surprised,
    DismissingGesture,
    HappyIdle,
    ThoughtfulHeadShake,
}

/// Chunk-level pose fields, set when a chunk starts and reset when it ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseState {
    pub expression: FacialExpression,
    pub animation: Animation,
    pub cues: Option<MouthCues>,
}

impl PoseState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn speaking(cues: MouthCues) -> Self {
        Self {
            expression: FacialExpression::Smile,
            animation: Animation::TalkingTwo,
            cues: Some(cues),
        }
    }
}

/// What the renderer should show this frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Pose {
    pub animation: Animation,
    pub expression: FacialExpression,
    pub viseme: Option<Viseme>,
    pub is_speaking: bool,
    /// Seconds into the current chunk.
    pub elapsed: f64,
}

/// Match `elapsed` (chunk-relative seconds) against the state's cues.
pub fn project(state: &PoseState, elapsed: f64, is_speaking: bool) -> Pose {
    let viseme = state
        .cues
        .as_ref()
        .and_then(|cues| cues.active_at(elapsed))
        .and_then(|cue| Viseme::from_key(&cue.value));
    Pose {
        animation: state.animation,
        expression: state.expression,
        viseme,
        is_speaking,
        elapsed,
    }
}

/// Samples the playback cursor and publishes poses.
pub struct PosePoller;

impl PosePoller {
    /// Spawn the poller. It republishes on every tick and whenever the chunk-level state
    /// changes, and exits when the state sender or every pose receiver is gone.
    pub fn spawn(
        engine: Arc<PlaybackEngine>,
        mut state_rx: watch::Receiver<PoseState>,
        poll_interval: Duration,
    ) -> (watch::Receiver<Pose>, JoinHandle<()>) {
        let (pose_tx, pose_rx) = watch::channel(Pose::default());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let state = state_rx.borrow_and_update().clone();
                let pose = project(&state, engine.elapsed_seconds(), engine.is_playing());
                if pose_tx.send(pose).is_err() {
                    break;
                }
            }
            debug!("PosePoller: stopped");
        });
        (pose_rx, task)
    }
}
