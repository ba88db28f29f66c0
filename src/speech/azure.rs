//! Azure Speech Services clients for the managed backend.
//!
//! Synthesis posts SSML to the regional REST endpoint. Recognition streams
//! raw PCM over the conversation WebSocket endpoint and reads hypothesis
//! and phrase messages back. Both authenticate with the short-lived bearer
//! token issued by the chat server.

use super::credentials::SpeechCredential;
use super::managed::{CloudRecognizer, CloudSynthesizer, RecognizerEvent};
use crate::audio::{CaptureFormat, MicrophoneSource, MicrophoneStream};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Output format requested from the synthesis endpoint.
pub const SYNTHESIS_OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a stopped turn waits for the service to close its last phrase.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Escape text for inclusion in SSML.
#[must_use]
pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[must_use]
pub fn build_ssml(text: &str, voice: &str, language: &str) -> String {
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{}'>\
         <voice name='{}'>{}</voice></speak>",
        escape_xml(language),
        escape_xml(voice),
        escape_xml(text)
    )
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// [`CloudSynthesizer`] over the Azure text-to-speech REST API.
#[derive(Debug, Clone, Default)]
pub struct AzureRestSynthesizer {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl AzureRestSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `base_url` instead of the regional endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn endpoint(&self, region: &str) -> Result<Url> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => format!("https://{region}.tts.speech.microsoft.com"),
        };
        service_url(&base, &["cognitiveservices", "v1"])
    }
}

/// `base` with `segments` appended to its path.
fn service_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| ChatError::Config(format!("invalid speech endpoint {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| ChatError::Config(format!("speech endpoint {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl CloudSynthesizer for AzureRestSynthesizer {
    async fn synthesize(
        &self,
        credential: &SpeechCredential,
        voice: &str,
        language: &str,
        text: &str,
    ) -> Result<Vec<u8>> {
        let endpoint = self.endpoint(&credential.region)?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&credential.access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", SYNTHESIS_OUTPUT_FORMAT)
            .header(reqwest::header::USER_AGENT, "vrmchat")
            .body(build_ssml(text, voice, language))
            .send()
            .await
            .map_err(|e| ChatError::Synthesis(format!("synthesis request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Synthesis(format!(
                "synthesis service returned {status}"
            )));
        }
        let audio = response
            .bytes()
            .await
            .map_err(|e| ChatError::Synthesis(format!("synthesis body unreadable: {e}")))?;
        if audio.is_empty() {
            return Err(ChatError::Synthesis("synthesis returned no audio".into()));
        }
        Ok(audio.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Recognition
// ---------------------------------------------------------------------------

/// A message received on the recognition socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionMessage {
    Hypothesis(String),
    Phrase { status: String, text: String },
    TurnEnd,
    Other,
}

impl RecognitionMessage {
    /// The recognizer event this message reports, if any.
    #[must_use]
    pub fn into_event(self) -> Option<RecognizerEvent> {
        match self {
            Self::Hypothesis(text) if !text.is_empty() => Some(RecognizerEvent::Recognizing(text)),
            Self::Phrase { status, text } => match status.as_str() {
                "Success" if !text.is_empty() => Some(RecognizerEvent::Recognized(text)),
                "Success" | "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => {
                    Some(RecognizerEvent::NoMatch)
                }
                "EndOfDictation" => None,
                _ => Some(RecognizerEvent::Canceled(status)),
            },
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct HypothesisBody {
    #[serde(rename = "Text", default)]
    text: String,
}

#[derive(Deserialize)]
struct PhraseBody {
    #[serde(rename = "RecognitionStatus")]
    status: String,
    #[serde(rename = "DisplayText", default)]
    display_text: String,
}

/// Parse a recognition socket message.
///
/// Messages are either header-prefixed (`Path:speech.phrase` and other
/// headers, a blank line, then JSON) or bare JSON whose kind is inferred
/// from its fields.
#[must_use]
pub fn parse_recognition_message(raw: &str) -> RecognitionMessage {
    let split = raw
        .find("\r\n\r\n")
        .map(|i| (&raw[..i], &raw[i + 4..]))
        .or_else(|| raw.find("\n\n").map(|i| (&raw[..i], &raw[i + 2..])));

    let (path, body) = match split {
        Some((headers, body)) => {
            let path = headers.lines().find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("path")
                    .then(|| value.trim().to_owned())
            });
            (path, body.trim())
        }
        None => (None, raw.trim()),
    };

    match path.as_deref() {
        Some("speech.hypothesis") => serde_json::from_str::<HypothesisBody>(body)
            .map(|h| RecognitionMessage::Hypothesis(h.text))
            .unwrap_or(RecognitionMessage::Other),
        Some("speech.phrase") => serde_json::from_str::<PhraseBody>(body)
            .map(|p| RecognitionMessage::Phrase {
                status: p.status,
                text: p.display_text,
            })
            .unwrap_or(RecognitionMessage::Other),
        Some("turn.end") => RecognitionMessage::TurnEnd,
        Some(_) => RecognitionMessage::Other,
        None => {
            if let Ok(phrase) = serde_json::from_str::<PhraseBody>(body) {
                RecognitionMessage::Phrase {
                    status: phrase.status,
                    text: phrase.display_text,
                }
            } else if let Ok(hypothesis) = serde_json::from_str::<HypothesisBody>(body)
                && !hypothesis.text.is_empty()
            {
                RecognitionMessage::Hypothesis(hypothesis.text)
            } else {
                RecognitionMessage::Other
            }
        }
    }
}

struct StreamingTurn {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// [`CloudRecognizer`] streaming microphone PCM to Azure over WebSocket.
pub struct AzureStreamingRecognizer {
    microphone: Arc<dyn MicrophoneSource>,
    format: CaptureFormat,
    base_url: Option<String>,
    turn: Mutex<Option<StreamingTurn>>,
}

impl AzureStreamingRecognizer {
    pub fn new(microphone: Arc<dyn MicrophoneSource>, format: CaptureFormat) -> Self {
        Self {
            microphone,
            format,
            base_url: None,
            turn: Mutex::new(None),
        }
    }

    /// Use `base_url` instead of the regional endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn endpoint(&self, region: &str, language: &str) -> Result<Url> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => format!("wss://{region}.stt.speech.microsoft.com"),
        };
        let mut url = service_url(
            &base,
            &["speech", "recognition", "conversation", "cognitiveservices", "v1"],
        )?;
        url.query_pairs_mut()
            .append_pair("language", language)
            .append_pair("format", "simple");
        Ok(url)
    }
}

#[async_trait]
impl CloudRecognizer for AzureStreamingRecognizer {
    async fn start_continuous(
        &self,
        credential: &SpeechCredential,
        language: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<()> {
        let mut turn = self.turn.lock().await;
        if let Some(previous) = turn.take() {
            previous.task.abort();
        }

        let url = self.endpoint(&credential.region, language)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Connection(format!("invalid recognition url: {e}")))?;
        let headers = request.headers_mut();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
            .map_err(|e| ChatError::Credential(format!("unusable token: {e}")))?;
        headers.insert("Authorization", bearer);
        let content_type = format!(
            "audio/wav; codecs=audio/pcm; samplerate={}",
            self.format.sample_rate
        );
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert("Content-Type", value);
        }

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ChatError::Connection("recognition connect timed out".into()))?
            .map_err(|e| ChatError::Connection(format!("recognition connect failed: {e}")))?;
        let microphone = self.microphone.open(self.format)?;
        info!(region = %credential.region, language, "recognition socket open");

        let trailing_silence = vec![0u8; self.format.sample_rate as usize * 2];
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(stream_turn(
            socket,
            microphone,
            events,
            stop_rx,
            trailing_silence,
        ));
        *turn = Some(StreamingTurn {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    async fn stop_continuous(&self) -> Result<()> {
        let Some(turn) = self.turn.lock().await.take() else {
            return Ok(());
        };
        let _ = turn.stop.send(());
        let abort = turn.task.abort_handle();
        match tokio::time::timeout(STOP_GRACE * 2, turn.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(ChatError::Connection(format!("recognition task failed: {e}"))),
            Err(_) => {
                warn!("recognition socket did not close in time");
                abort.abort();
                Ok(())
            }
        }
    }
}

type RecognitionSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_chunk(microphone: &mut Option<MicrophoneStream>) -> Option<Vec<u8>> {
    match microphone {
        Some(stream) => stream.chunks.recv().await,
        None => std::future::pending().await,
    }
}

async fn stream_turn(
    socket: RecognitionSocket,
    microphone: MicrophoneStream,
    events: mpsc::UnboundedSender<RecognizerEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    trailing_silence: Vec<u8>,
) {
    let (mut write, mut read) = socket.split();
    let mut microphone = Some(microphone);
    let mut stopping = false;
    let grace = tokio::time::sleep(Duration::MAX);
    tokio::pin!(grace);

    loop {
        tokio::select! {
            chunk = next_chunk(&mut microphone) => match chunk {
                Some(chunk) => {
                    if let Err(e) = write.send(Message::Binary(chunk)).await {
                        let _ = events.send(RecognizerEvent::Canceled(format!("send failed: {e}")));
                        break;
                    }
                }
                None => {
                    debug!("microphone stream ended");
                    microphone = None;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_recognition_message(&text) {
                    RecognitionMessage::TurnEnd if stopping => break,
                    parsed => {
                        if let Some(event) = parsed.into_event() {
                            let _ = events.send(event);
                        }
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    if !stopping {
                        let reason = frame.map_or_else(|| "closed".to_owned(), |f| f.reason.to_string());
                        let _ = events.send(RecognizerEvent::Canceled(reason));
                    }
                    return;
                }
                Some(Err(e)) => {
                    if !stopping {
                        let _ = events.send(RecognizerEvent::Canceled(format!("read failed: {e}")));
                    }
                    return;
                }
                None => return,
                Some(Ok(_)) => {}
            },
            _ = &mut stop_rx, if !stopping => {
                stopping = true;
                microphone = None;
                // Silence lets the service close the phrase in progress.
                if write.send(Message::Binary(trailing_silence.clone())).await.is_err() {
                    break;
                }
                grace.as_mut().reset(tokio::time::Instant::now() + STOP_GRACE);
            }
            () = &mut grace, if stopping => {
                debug!("no turn end before the grace period");
                break;
            }
        }
    }

    if let Err(e) = write.send(Message::Close(None)).await {
        debug!("recognition close handshake failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::{ScriptedMicrophone, WAIT};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> SpeechCredential {
        SpeechCredential {
            access_token: "tok".into(),
            region: "japaneast".into(),
        }
    }

    #[test]
    fn ssml_escapes_text() {
        let ssml = build_ssml("a < b & \"c\"", "ja-JP-AoiNeural", "ja-JP");
        assert!(ssml.contains("xml:lang='ja-JP'"));
        assert!(ssml.contains("<voice name='ja-JP-AoiNeural'>"));
        assert!(ssml.contains("a &lt; b &amp; &quot;c&quot;"));
    }

    #[test]
    fn parses_header_prefixed_messages() {
        let hypothesis = "X-RequestId:1\r\nPath:speech.hypothesis\r\n\r\n{\"Text\":\"こん\",\"Offset\":0}";
        assert_eq!(
            parse_recognition_message(hypothesis),
            RecognitionMessage::Hypothesis("こん".into())
        );

        let phrase = "path:speech.phrase\r\n\r\n{\"RecognitionStatus\":\"Success\",\"DisplayText\":\"こんにちは。\"}";
        assert_eq!(
            parse_recognition_message(phrase).into_event(),
            Some(RecognizerEvent::Recognized("こんにちは。".into()))
        );

        assert_eq!(
            parse_recognition_message("Path:turn.end\r\n\r\n{}"),
            RecognitionMessage::TurnEnd
        );
        assert_eq!(
            parse_recognition_message("Path:speech.startDetected\r\n\r\n{\"Offset\":1}"),
            RecognitionMessage::Other
        );
    }

    #[test]
    fn parses_bare_json_and_maps_statuses() {
        assert_eq!(
            parse_recognition_message("{\"RecognitionStatus\":\"NoMatch\"}").into_event(),
            Some(RecognizerEvent::NoMatch)
        );
        assert_eq!(
            parse_recognition_message("{\"RecognitionStatus\":\"Error\"}").into_event(),
            Some(RecognizerEvent::Canceled("Error".into()))
        );
        assert_eq!(
            parse_recognition_message("{\"Text\":\"hi\",\"Offset\":3}"),
            RecognitionMessage::Hypothesis("hi".into())
        );
        assert_eq!(parse_recognition_message("not json"), RecognitionMessage::Other);
    }

    #[test]
    fn endpoints_default_to_the_credential_region() {
        let synthesizer = AzureRestSynthesizer::new();
        assert_eq!(
            synthesizer.endpoint("japaneast").unwrap().as_str(),
            "https://japaneast.tts.speech.microsoft.com/cognitiveservices/v1"
        );
        let recognizer = AzureStreamingRecognizer::new(
            ScriptedMicrophone::new(),
            CaptureFormat {
                sample_rate: 16_000,
                chunk_samples: 400,
            },
        );
        assert_eq!(
            recognizer.endpoint("japaneast", "ja-JP").unwrap().as_str(),
            "wss://japaneast.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?language=ja-JP&format=simple"
        );
    }

    #[test]
    fn recognizer_endpoint_encodes_language_and_keeps_base_path() {
        let recognizer = AzureStreamingRecognizer::new(
            ScriptedMicrophone::new(),
            CaptureFormat {
                sample_rate: 16_000,
                chunk_samples: 400,
            },
        )
        .with_base_url("ws://127.0.0.1:9000/proxy/");
        let url = recognizer.endpoint("ignored", "en US&format=detailed").unwrap();
        assert_eq!(
            url.path(),
            "/proxy/speech/recognition/conversation/cognitiveservices/v1"
        );
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("language".to_owned(), "en US&format=detailed".to_owned()),
                ("format".to_owned(), "simple".to_owned()),
            ]
        );
    }

    #[test]
    fn unparsable_base_url_is_a_config_error() {
        let synthesizer = AzureRestSynthesizer::new().with_base_url("not a url");
        assert!(matches!(
            synthesizer.endpoint("japaneast"),
            Err(ChatError::Config(_))
        ));
        let synthesizer = AzureRestSynthesizer::new().with_base_url("mailto:someone@example.com");
        assert!(matches!(
            synthesizer.endpoint("japaneast"),
            Err(ChatError::Config(_))
        ));
    }

    #[tokio::test]
    async fn synthesizer_posts_ssml_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cognitiveservices/v1"))
            .and(header("authorization", "Bearer tok"))
            .and(header("x-microsoft-outputformat", SYNTHESIS_OUTPUT_FORMAT))
            .and(body_string_contains("こんにちは"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF....".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let synthesizer = AzureRestSynthesizer::new().with_base_url(server.uri());
        let audio = synthesizer
            .synthesize(&credential(), "ja-JP-AoiNeural", "ja-JP", "こんにちは")
            .await
            .unwrap();
        assert_eq!(audio, b"RIFF....");
    }

    #[tokio::test]
    async fn synthesizer_maps_http_failure_to_synthesis_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let synthesizer = AzureRestSynthesizer::new().with_base_url(server.uri());
        let err = synthesizer
            .synthesize(&credential(), "v", "ja-JP", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Synthesis(_)));
    }

    #[tokio::test]
    async fn recognizer_streams_audio_and_reports_results() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let format = CaptureFormat {
            sample_rate: 16_000,
            chunk_samples: 400,
        };
        let silence_len = format.sample_rate as usize * 2;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(bytes) if bytes.len() == silence_len => {
                        ws.send(Message::Text("Path:turn.end\r\n\r\n{}".into()))
                            .await
                            .unwrap();
                    }
                    Message::Binary(bytes) => {
                        received.push(bytes);
                        ws.send(Message::Text(
                            "Path:speech.hypothesis\r\n\r\n{\"Text\":\"hel\",\"Offset\":0}".into(),
                        ))
                        .await
                        .unwrap();
                        ws.send(Message::Text(
                            "Path:speech.phrase\r\n\r\n{\"RecognitionStatus\":\"Success\",\"DisplayText\":\"hello.\"}"
                                .into(),
                        ))
                        .await
                        .unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let microphone = ScriptedMicrophone::new();
        let recognizer = AzureStreamingRecognizer::new(microphone.clone(), format)
            .with_base_url(format!("ws://{addr}"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        recognizer
            .start_continuous(&credential(), "en-US", tx)
            .await
            .unwrap();
        assert_eq!(microphone.opened(), vec![format]);
        assert!(microphone.push(&[1, 2, 3, 4]));

        let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(first, Some(RecognizerEvent::Recognizing("hel".into())));
        let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(second, Some(RecognizerEvent::Recognized("hello.".into())));

        recognizer.stop_continuous().await.unwrap();
        assert!(!microphone.is_open());
        let received = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(received, vec![vec![1, 2, 3, 4]]);
    }

    #[tokio::test]
    async fn recognizer_connect_failure_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let microphone = ScriptedMicrophone::new();
        let recognizer = AzureStreamingRecognizer::new(
            microphone.clone(),
            CaptureFormat {
                sample_rate: 16_000,
                chunk_samples: 400,
            },
        )
        .with_base_url(format!("ws://{addr}"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = recognizer
            .start_continuous(&credential(), "en-US", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Connection(_)));
        assert!(microphone.opened().is_empty());
    }
}
