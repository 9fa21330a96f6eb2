//! **Mouth-cue annotation**: Turn a chunk's PCM into time-aligned viseme cues.
//!
//! Implement `MouthCueAnnotator` for a lip-sync service. Three backends ship here: the HTTP
//! lip-sync route, the Rhubarb Lip Sync CLI, and a placeholder that keeps the mouth at rest.

use crate::config::{AnnotationBackend, AnnotationConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::{wav_bytes, PcmBuffer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One mouth shape held over `[start, end)`, in seconds from the chunk's own origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouthCue {
    pub start: f64,
    pub end: f64,
    /// Rhubarb shape key (`A`..`H`, `X` for rest).
    pub value: String,
}

impl MouthCue {
    pub fn new(start: f64, end: f64, value: impl Into<String>) -> Self {
        Self {
            start,
            end,
            value: value.into(),
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }
}

/// Cues for one chunk, sorted by start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MouthCues {
    cues: Vec<MouthCue>,
    /// Duration reported by the annotator (0 when unknown).
    pub duration: f64,
}

impl MouthCues {
    /// Normalize: drop inverted cues, sort by start.
    pub fn new(mut cues: Vec<MouthCue>, duration: f64) -> Self {
        cues.retain(|c| c.end >= c.start);
        cues.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self { cues, duration }
    }

    pub fn cues(&self) -> &[MouthCue] {
        &self.cues
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// First cue whose window contains `t`.
    pub fn active_at(&self, t: f64) -> Option<&MouthCue> {
        self.cues.iter().find(|c| c.contains(t))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CueMetadata {
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CueField {
    Flat(Vec<MouthCue>),
    Nested(Box<CueDocument>),
}

#[derive(Debug, Deserialize)]
struct CueDocument {
    #[serde(rename = "mouthCues")]
    mouth_cues: CueField,
    #[serde(default)]
    metadata: Option<CueMetadata>,
}

/// Parse an annotation response body. Accepts the flat Rhubarb document
/// (`{mouthCues: [...], metadata}`) and the same document wrapped once more under
/// `mouthCues`, which is what the lip-sync route returns.
pub fn parse_mouth_cues(body: &[u8]) -> VoiceResult<MouthCues> {
    let mut doc: CueDocument = serde_json::from_slice(body)
        .map_err(|e| VoiceError::Annotation(format!("malformed cue document: {}", e)))?;
    let mut duration = doc.metadata.as_ref().map(|m| m.duration).unwrap_or(0.0);
    loop {
        match doc.mouth_cues {
            CueField::Flat(cues) => return Ok(MouthCues::new(cues, duration)),
            CueField::Nested(inner) => {
                if let Some(m) = inner.metadata.as_ref() {
                    duration = m.duration;
                }
                doc = *inner;
            }
        }
    }
}

/// Resolves mouth cues for one chunk of base64 PCM16 audio.
#[async_trait]
pub trait MouthCueAnnotator: Send + Sync {
    /// Annotate one payload. `dialog_text` is an optional transcript hint.
    async fn annotate(
        &self,
        audio_base64: &str,
        dialog_text: Option<&str>,
    ) -> VoiceResult<MouthCues>;
}

/// Placeholder annotator: one rest cue spanning the whole chunk. Use to run the pipeline
/// without a lip-sync service.
#[derive(Debug, Default)]
pub struct PlaceholderAnnotator;

#[async_trait]
impl MouthCueAnnotator for PlaceholderAnnotator {
    async fn annotate(&self, audio_base64: &str, _dialog_text: Option<&str>) -> VoiceResult<MouthCues> {
        let duration = PcmBuffer::from_base64(audio_base64)?.duration_seconds();
        Ok(MouthCues::new(vec![MouthCue::new(0.0, duration, "X")], duration))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationRequest<'a> {
    audio_payload: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dialog_text: Option<&'a str>,
}

/// Lip-sync over HTTP: POST `{audioPayload, dialogText?}`, receive a cue document.
#[derive(Debug, Clone)]
pub struct HttpAnnotator {
    pub url: String,
    client: reqwest::Client,
}

impl HttpAnnotator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Annotation(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl MouthCueAnnotator for HttpAnnotator {
    async fn annotate(&self, audio_base64: &str, dialog_text: Option<&str>) -> VoiceResult<MouthCues> {
        let resp = self
            .client
            .post(&self.url)
            .json(&AnnotationRequest {
                audio_payload: audio_base64,
                dialog_text,
            })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(VoiceError::Annotation(format!(
                "lip-sync service returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        let cues = parse_mouth_cues(&body)?;
        debug!(cues = cues.cues().len(), "HttpAnnotator: annotated chunk");
        Ok(cues)
    }
}

/// Rhubarb Lip Sync CLI. The chunk is written to a temporary WAV and the JSON report is
/// read from stdout.
#[derive(Debug, Clone)]
pub struct RhubarbAnnotator {
    pub binary: String,
    /// `phonetic` is fast and language independent; `pocketSphinx` is English only.
    pub recognizer: String,
}

impl RhubarbAnnotator {
    pub fn new(binary: impl Into<String>, recognizer: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            recognizer: recognizer.into(),
        }
    }
}

#[async_trait]
impl MouthCueAnnotator for RhubarbAnnotator {
    async fn annotate(&self, audio_base64: &str, dialog_text: Option<&str>) -> VoiceResult<MouthCues> {
        let pcm = PcmBuffer::from_base64(audio_base64)?;
        let mut wav = tempfile::Builder::new()
            .prefix("avatar-chunk-")
            .suffix(".wav")
            .tempfile()?;
        wav.write_all(&wav_bytes(&pcm.samples, pcm.sample_rate)?)?;
        wav.flush()?;

        let dialog = match dialog_text {
            Some(text) if !text.trim().is_empty() => {
                let mut f = tempfile::Builder::new().suffix(".txt").tempfile()?;
                f.write_all(text.as_bytes())?;
                f.flush()?;
                Some(f)
            }
            _ => None,
        };

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-f").arg("json").arg("-r").arg(&self.recognizer);
        if let Some(d) = dialog.as_ref() {
            cmd.arg("-d").arg(d.path());
        }
        cmd.arg(wav.path());

        let output = cmd.output().await.map_err(|e| {
            VoiceError::Annotation(format!("failed to run {}: {}", self.binary, e))
        })?;
        if !output.status.success() {
            return Err(VoiceError::Annotation(format!(
                "rhubarb exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_mouth_cues(&output.stdout)
    }
}

/// Build the annotator selected by config.
pub fn build_annotator(config: &AnnotationConfig) -> VoiceResult<Arc<dyn MouthCueAnnotator>> {
    let annotator: Arc<dyn MouthCueAnnotator> = match config.backend {
        AnnotationBackend::Http => Arc::new(HttpAnnotator::new(
            config.url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?),
        AnnotationBackend::Rhubarb => Arc::new(RhubarbAnnotator::new(
            config.rhubarb_path.clone(),
            config.recognizer.clone(),
        )),
        AnnotationBackend::Placeholder => Arc::new(PlaceholderAnnotator),
    };
    info!(backend = ?config.backend, "Mouth-cue annotator ready");
    Ok(annotator)
}
