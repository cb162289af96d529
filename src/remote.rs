//! Remote assistant client
//!
//! Sends the utterance transcript to the assistant server and fetches the
//! best-effort acknowledgment clip. Reply audio may arrive inline (binary
//! body, reply text in a header) or in a JSON envelope carrying the reply
//! string plus either base64-embedded audio or a follow-up audio URL.
//! Requests fail fast; the core never retries.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use url::Url;

use crate::playback::AudioClip;
use crate::{Error, Result};

/// Header carrying reply text when audio arrives inline
const REPLY_TEXT_HEADER: &str = "x-reply-text";

/// Reply from the assistant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    /// Reply text to display
    pub text: String,
    /// Spoken reply, if the server rendered one
    pub audio: Option<AudioClip>,
}

/// Remote assistant port
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Send the utterance and receive the assistant's reply.
    ///
    /// # Errors
    ///
    /// Returns error on network or server failure; surfaced once to the
    /// user, never retried here.
    async fn send_utterance(&self, text: &str) -> Result<AssistantReply>;

    /// Fetch the acknowledgment clip for an utterance. Best-effort:
    /// absence or failure is non-fatal and silently skipped.
    async fn fetch_ack(&self, text: &str) -> Option<AudioClip>;
}

/// JSON reply envelope
#[derive(Debug, serde::Deserialize)]
struct ReplyEnvelope {
    reply: String,
    audio_b64: Option<String>,
    audio_url: Option<String>,
}

/// HTTP implementation of the assistant backend
pub struct HttpVoiceClient {
    client: reqwest::Client,
    server: Url,
}

impl HttpVoiceClient {
    /// Create a client for the given server base address
    #[must_use]
    pub fn new(server: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.server
            .join(path)
            .map_err(|e| Error::Remote(format!("invalid endpoint: {e}")))
    }

    /// Resolve an envelope into reply text plus audio, fetching a follow-up
    /// audio URL when the audio was not embedded
    async fn resolve_envelope(&self, envelope: ReplyEnvelope) -> Result<AssistantReply> {
        let audio = match (&envelope.audio_b64, &envelope.audio_url) {
            (Some(encoded), _) => Some(decode_embedded_audio(encoded)?),
            (None, Some(follow_up)) => {
                let url = self
                    .server
                    .join(follow_up)
                    .map_err(|e| Error::Remote(format!("invalid audio url: {e}")))?;
                let bytes = self
                    .client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|e| Error::Remote(format!("audio fetch failed: {e}")))?
                    .bytes()
                    .await?;
                Some(AudioClip::new(bytes.to_vec()))
            }
            (None, None) => None,
        };

        Ok(AssistantReply {
            text: envelope.reply,
            audio,
        })
    }
}

#[async_trait]
impl VoiceBackend for HttpVoiceClient {
    async fn send_utterance(&self, text: &str) -> Result<AssistantReply> {
        let url = self.endpoint("/utterance")?;
        tracing::debug!(url = %url, "sending utterance");

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| Error::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "assistant request failed");
            return Err(Error::Remote(format!("server error {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("application/json") {
            let envelope: ReplyEnvelope = response.json().await.map_err(Error::Http)?;
            self.resolve_envelope(envelope).await
        } else {
            // Inline binary audio; reply text travels in a header
            let reply_text = response
                .headers()
                .get(REPLY_TEXT_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let bytes = response.bytes().await?;
            let audio = if bytes.is_empty() {
                None
            } else {
                Some(AudioClip::new(bytes.to_vec()))
            };
            Ok(AssistantReply {
                text: reply_text,
                audio,
            })
        }
    }

    async fn fetch_ack(&self, text: &str) -> Option<AudioClip> {
        let url = self
            .endpoint(&format!("/ack?text={}", urlencoding::encode(text)))
            .ok()?;

        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(bytes) if !bytes.is_empty() => Some(AudioClip::new(bytes.to_vec())),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "ack body read failed, skipping");
                    None
                }
            },
            Ok(response) => {
                tracing::debug!(status = %response.status(), "no ack available");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "ack fetch failed, skipping");
                None
            }
        }
    }
}

/// Decode base64-embedded reply audio
fn decode_embedded_audio(encoded: &str) -> Result<AudioClip> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::Remote(format!("invalid embedded audio: {e}")))?;
    Ok(AudioClip::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_embedded_audio() {
        let raw = r#"{"reply": "done", "audio_b64": "AAEC", "audio_url": null}"#;
        let envelope: ReplyEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.reply, "done");

        let clip = decode_embedded_audio(envelope.audio_b64.as_deref().unwrap()).unwrap();
        assert_eq!(clip.bytes, vec![0u8, 1, 2]);
    }

    #[test]
    fn envelope_parses_with_follow_up_url() {
        let raw = r#"{"reply": "done", "audio_url": "/audio/42.mp3"}"#;
        let envelope: ReplyEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.audio_url.as_deref(), Some("/audio/42.mp3"));
        assert!(envelope.audio_b64.is_none());
    }

    #[test]
    fn invalid_base64_is_a_remote_error() {
        assert!(matches!(
            decode_embedded_audio("not base64!!"),
            Err(Error::Remote(_))
        ));
    }

    #[test]
    fn ack_urls_are_percent_encoded() {
        let client = HttpVoiceClient::new(Url::parse("http://localhost:8787").unwrap());
        let url = client
            .endpoint(&format!("/ack?text={}", urlencoding::encode("turn off the lights")))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8787/ack?text=turn%20off%20the%20lights"
        );
    }
}
