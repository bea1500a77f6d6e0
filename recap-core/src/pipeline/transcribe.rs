use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::fs;
use url::Url;

use crate::config::{TranscriptFormat, TranscriptionSection};

use super::error::{TranscriptionError, TranscriptionResult};

const WORDS_PER_CUE: usize = 8;
const MAX_CUE_SECONDS: f64 = 5.0;

/// Speech-to-text collaborator used by the transcription stage.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> TranscriptionResult<Transcript>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub words: Vec<TranscriptWord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub punctuated_word: Option<String>,
}

impl TranscriptWord {
    fn display(&self) -> &str {
        self.punctuated_word.as_deref().unwrap_or(&self.word)
    }
}

impl Transcript {
    pub fn render(&self, format: TranscriptFormat) -> TranscriptionResult<String> {
        match format {
            TranscriptFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|err| TranscriptionError::Malformed(err.to_string())),
            TranscriptFormat::Txt => Ok(format!("{}\n", self.text.trim())),
            TranscriptFormat::Srt => Ok(self.to_srt()),
        }
    }

    fn to_srt(&self) -> String {
        let mut out = String::new();
        for (number, cue) in self.cues().iter().enumerate() {
            let (Some(first), Some(last)) = (cue.first(), cue.last()) else {
                continue;
            };
            let text = cue
                .iter()
                .map(|word| word.display())
                .collect::<Vec<_>>()
                .join(" ");
            let _ = write!(
                out,
                "{}\n{} --> {}\n{}\n\n",
                number + 1,
                srt_timestamp(first.start),
                srt_timestamp(last.end),
                text
            );
        }
        out
    }

    /// Groups words into subtitle cues, breaking on sentence ends, on a word cap
    /// and on cue length.
    fn cues(&self) -> Vec<Vec<&TranscriptWord>> {
        let mut cues = Vec::new();
        let mut current: Vec<&TranscriptWord> = Vec::new();
        for word in &self.words {
            if let Some(first) = current.first() {
                if word.end - first.start > MAX_CUE_SECONDS {
                    cues.push(std::mem::take(&mut current));
                }
            }
            current.push(word);
            let sentence_end = word.display().ends_with(&['.', '?', '!'][..]);
            if sentence_end || current.len() >= WORDS_PER_CUE {
                cues.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            cues.push(current);
        }
        cues
    }
}

fn srt_timestamp(seconds: f64) -> String {
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        millis / 3_600_000,
        (millis / 60_000) % 60,
        (millis / 1000) % 60,
        millis % 1000
    )
}

/// Deepgram prerecorded-audio client.
#[derive(Debug, Clone)]
pub struct DeepgramTranscriber {
    client: Client,
    endpoint: String,
    api_key: String,
    punctuate: bool,
    tier: Option<String>,
}

impl DeepgramTranscriber {
    pub fn from_config(config: &TranscriptionSection) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            punctuate: config.punctuate,
            tier: config.tier.clone(),
        }
    }

    fn request_url(&self) -> TranscriptionResult<Url> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|source| TranscriptionError::Endpoint {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("punctuate", if self.punctuate { "true" } else { "false" });
            if let Some(tier) = &self.tier {
                query.append_pair("tier", tier);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &Path) -> TranscriptionResult<Transcript> {
        if self.api_key.trim().is_empty() {
            return Err(TranscriptionError::MissingApiKey);
        }
        let url = self.request_url()?;
        let body = fs::read(audio)
            .await
            .map_err(|source| TranscriptionError::Io {
                path: audio.to_path_buf(),
                source,
            })?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Token {}", self.api_key))
            .header(CONTENT_TYPE, "audio/mpeg")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: DeepgramResponse = response.json().await?;
        payload.into_transcript()
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Debug, Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    words: Vec<TranscriptWord>,
}

impl DeepgramResponse {
    fn into_transcript(self) -> TranscriptionResult<Transcript> {
        let alternative = self
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|channel| channel.alternatives.into_iter().next())
            .ok_or_else(|| TranscriptionError::Malformed("response has no alternatives".into()))?;
        Ok(Transcript {
            text: alternative.transcript,
            confidence: alternative.confidence,
            words: alternative.words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> TranscriptWord {
        TranscriptWord {
            word: text.trim_end_matches('.').to_lowercase(),
            start,
            end,
            confidence: 0.9,
            punctuated_word: Some(text.to_string()),
        }
    }

    #[test]
    fn parses_deepgram_payload() {
        let raw = r#"{
            "metadata": {"request_id": "x"},
            "results": {"channels": [{"alternatives": [{
                "transcript": "hello world",
                "confidence": 0.97,
                "words": [
                    {"word": "hello", "start": 0.1, "end": 0.4, "confidence": 0.99, "punctuated_word": "Hello"},
                    {"word": "world", "start": 0.5, "end": 0.9, "confidence": 0.95}
                ]
            }]}]}
        }"#;
        let response: DeepgramResponse = serde_json::from_str(raw).unwrap();
        let transcript = response.into_transcript().unwrap();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(transcript.words.len(), 2);
        assert_eq!(transcript.words[0].display(), "Hello");
        assert_eq!(transcript.words[1].display(), "world");
    }

    #[test]
    fn empty_channels_are_malformed() {
        let response: DeepgramResponse =
            serde_json::from_str(r#"{"results": {"channels": []}}"#).unwrap();
        assert!(matches!(
            response.into_transcript(),
            Err(TranscriptionError::Malformed(_))
        ));
    }

    #[test]
    fn srt_breaks_cues_on_sentence_end() {
        let transcript = Transcript {
            text: "Hi there. Bye.".into(),
            confidence: None,
            words: vec![
                word("Hi", 0.0, 0.3),
                word("there.", 0.4, 0.9),
                word("Bye.", 61.0, 61.5),
            ],
        };
        let srt = transcript.render(TranscriptFormat::Srt).unwrap();
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:00,900\nHi there.\n\n2\n00:01:01,000 --> 00:01:01,500\nBye.\n\n"
        );
    }

    #[test]
    fn txt_and_json_renderings() {
        let transcript = Transcript {
            text: " plain words ".into(),
            confidence: Some(0.5),
            words: vec![word("plain", 0.0, 0.2)],
        };
        assert_eq!(
            transcript.render(TranscriptFormat::Txt).unwrap(),
            "plain words\n"
        );
        let json = transcript.render(TranscriptFormat::Json).unwrap();
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back, transcript);
    }

    #[test]
    fn request_url_carries_options() {
        let transcriber = DeepgramTranscriber {
            client: Client::new(),
            endpoint: "https://api.deepgram.com/v1/listen".into(),
            api_key: "k".into(),
            punctuate: true,
            tier: Some("enhanced".into()),
        };
        assert_eq!(
            transcriber.request_url().unwrap().as_str(),
            "https://api.deepgram.com/v1/listen?punctuate=true&tier=enhanced"
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_reading_audio() {
        let transcriber = DeepgramTranscriber {
            client: Client::new(),
            endpoint: "https://api.deepgram.com/v1/listen".into(),
            api_key: String::new(),
            punctuate: true,
            tier: None,
        };
        let err = transcriber
            .transcribe(Path::new("/no/such/audio.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::MissingApiKey));
    }
}
