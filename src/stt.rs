//! Streaming speech-to-text: the provider seam plus the supervising client
//! that keeps one session per speaker alive across transport failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::ids::UserId;
use crate::domain::transcript::WordTiming;
use crate::error::AccordResult;

/// Reconnect attempts before the stream is abandoned.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF_BASE_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Exponential reconnect backoff: `min(2000 * 2^attempt, 30000)` ms.
pub fn backoff_delay_ms(attempt: u32) -> u64 {
    BACKOFF_BASE_MS
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
        .min(BACKOFF_CAP_MS)
}

/// One recognition update from the provider.
#[derive(Debug, Clone)]
pub struct SttEvent {
    pub text: String,
    pub is_final: bool,
    pub words: Vec<WordTiming>,
}

/// A speech-to-text provider able to run one bidirectional streaming
/// session: PCM chunks in, partial/final recognition events out.
///
/// `stream` returns `Ok(())` on clean end-of-stream (the audio sender was
/// dropped) and `Err` on a transport failure the client may retry.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn stream(
        &self,
        audio: &mut mpsc::Receiver<Bytes>,
        events: &mpsc::Sender<SttEvent>,
    ) -> AccordResult<()>;
}

/// Thin REST binding for the recognition provider: audio accumulates into
/// short segments that are recognized one request at a time. Partials are
/// not available over this transport; every result is final.
pub struct HttpStt {
    client: reqwest::Client,
    api_key: String,
    region: String,
    language: String,
}

const STT_SEGMENT_CHUNKS: usize = 30;

impl HttpStt {
    pub fn new(api_key: String, region: Option<String>, language: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            region: region.unwrap_or_else(|| "eu".to_string()),
            language,
        }
    }

    async fn recognize(&self, segment: Vec<u8>) -> AccordResult<Option<String>> {
        let url = format!(
            "https://{}.stt.example/v1/recognize?language={}",
            self.region, self.language
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("content-type", "audio/l16; rate=16000; channels=1")
            .body(segment)
            .send()
            .await
            .map_err(crate::error::TransportError::Http)?;
        if !response.status().is_success() {
            return Err(crate::error::TransportError::Stream(format!(
                "recognizer returned {}",
                response.status()
            ))
            .into());
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(crate::error::TransportError::Http)?;
        Ok(body
            .get("text")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl SpeechToText for HttpStt {
    async fn stream(
        &self,
        audio: &mut mpsc::Receiver<Bytes>,
        events: &mpsc::Sender<SttEvent>,
    ) -> AccordResult<()> {
        let mut segment: Vec<u8> = Vec::new();
        let mut chunks = 0usize;
        loop {
            match audio.recv().await {
                Some(chunk) => {
                    segment.extend_from_slice(&chunk);
                    chunks += 1;
                    if chunks < STT_SEGMENT_CHUNKS {
                        continue;
                    }
                }
                None if segment.is_empty() => return Ok(()),
                None => {}
            }

            let done = chunks < STT_SEGMENT_CHUNKS;
            if let Some(text) = self.recognize(std::mem::take(&mut segment)).await? {
                let _ = events
                    .send(SttEvent {
                        text,
                        is_final: true,
                        words: Vec::new(),
                    })
                    .await;
            }
            chunks = 0;
            if done {
                return Ok(());
            }
        }
    }
}

/// Fallback provider for deployments without STT credentials: drains audio
/// and emits nothing, so rooms stay functional for audio relay.
pub struct UnconfiguredStt;

#[async_trait]
impl SpeechToText for UnconfiguredStt {
    async fn stream(
        &self,
        audio: &mut mpsc::Receiver<Bytes>,
        _events: &mpsc::Sender<SttEvent>,
    ) -> AccordResult<()> {
        warn!("no STT provider configured; transcription disabled for this stream");
        while audio.recv().await.is_some() {}
        Ok(())
    }
}

/// Handle to one speaker's supervised recognition stream.
pub struct SttStreamHandle {
    pub audio_tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl SttStreamHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for SttStreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a supervised recognition stream for one speaker.
///
/// Transport failures reconnect with exponential backoff, up to
/// [`MAX_RECONNECT_ATTEMPTS`]; buffered audio in the channel survives the
/// reconnect. Events are forwarded tagged with the speaker.
pub fn spawn_stream(
    provider: Arc<dyn SpeechToText>,
    speaker: UserId,
    events_tx: mpsc::Sender<(UserId, SttEvent)>,
) -> SttStreamHandle {
    let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(64);

    let task = tokio::spawn(async move {
        let (session_tx, mut session_rx) = mpsc::channel::<SttEvent>(64);

        // Forwarder: tag events with the speaker for the room supervisor.
        let forward_speaker = speaker.clone();
        let forward_events = events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                if forward_events
                    .send((forward_speaker.clone(), event))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut attempt: u32 = 0;
        loop {
            match provider.stream(&mut audio_rx, &session_tx).await {
                Ok(()) => {
                    info!(%speaker, "recognition stream ended cleanly");
                    break;
                }
                Err(err) if attempt >= MAX_RECONNECT_ATTEMPTS => {
                    error!(%speaker, %err, "recognition stream abandoned after max reconnect attempts");
                    break;
                }
                Err(err) => {
                    let delay = backoff_delay_ms(attempt);
                    warn!(%speaker, %err, attempt, delay_ms = delay, "recognition stream failed; reconnecting");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }

        drop(session_tx);
        let _ = forwarder.await;
    });

    SttStreamHandle { audio_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_contract() {
        let expected = [
            2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000, 30_000, 30_000,
        ];
        let actual: Vec<u64> = (0..10).map(backoff_delay_ms).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn backoff_saturates_far_out() {
        assert_eq!(backoff_delay_ms(63), 30_000);
        assert_eq!(backoff_delay_ms(64), 30_000);
    }

    struct EchoStt;

    #[async_trait]
    impl SpeechToText for EchoStt {
        async fn stream(
            &self,
            audio: &mut mpsc::Receiver<Bytes>,
            events: &mpsc::Sender<SttEvent>,
        ) -> AccordResult<()> {
            while let Some(chunk) = audio.recv().await {
                let _ = events
                    .send(SttEvent {
                        text: format!("{} bytes", chunk.len()),
                        is_final: true,
                        words: Vec::new(),
                    })
                    .await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stream_tags_events_with_speaker() {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = spawn_stream(
            Arc::new(EchoStt),
            UserId::parse("alice").unwrap(),
            events_tx,
        );

        handle.audio_tx.send(Bytes::from_static(&[0u8; 4])).await.unwrap();
        let (speaker, event) = events_rx.recv().await.unwrap();
        assert_eq!(speaker.as_str(), "alice");
        assert_eq!(event.text, "4 bytes");
    }
}
