//! Speech output: Google Translate TTS for synthesis, `mpg123` for playback.

use jarvis_core::{SpeechBackend, SpeechError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

const TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";
const TTS_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64)";
const TTS_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest utterance the endpoint accepts in one request.
const TTS_MAX_CHARS: usize = 200;

pub struct CloudSpeech {
    client: reqwest::blocking::Client,
    lang: String,
    player: PathBuf,
}

impl CloudSpeech {
    pub fn new(lang: &str) -> Result<Self, SpeechError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TTS_TIMEOUT)
            .user_agent(TTS_USER_AGENT)
            .build()
            .map_err(|e| SpeechError::Synthesis(format!("http client: {e}")))?;
        Ok(Self {
            client,
            lang: lang.to_string(),
            player: PathBuf::from("mpg123"),
        })
    }

    /// Use a different playback program (invoked as `<player> -q <file>`).
    pub fn with_player(mut self, player: impl Into<PathBuf>) -> Self {
        self.player = player.into();
        self
    }

    fn request(&self, text: &str) -> reqwest::blocking::RequestBuilder {
        self.client.get(TTS_ENDPOINT).query(&[
            ("ie", "UTF-8"),
            ("client", "tw-ob"),
            ("tl", self.lang.as_str()),
            ("q", text),
        ])
    }
}

impl SpeechBackend for CloudSpeech {
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        if text.chars().count() > TTS_MAX_CHARS {
            return Err(SpeechError::Synthesis(format!(
                "utterance longer than {TTS_MAX_CHARS} characters"
            )));
        }
        let response = self
            .request(text)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SpeechError::Synthesis(e.to_string()))?;
        let bytes = response
            .bytes()
            .map_err(|e| SpeechError::Synthesis(e.to_string()))?;
        if bytes.is_empty() {
            return Err(SpeechError::Synthesis("empty audio response".into()));
        }
        tracing::debug!(text, bytes = bytes.len(), "speech synthesised");
        Ok(bytes.to_vec())
    }

    fn play(&self, audio: &Path) -> Result<(), SpeechError> {
        let status = Command::new(&self.player)
            .arg("-q")
            .arg(audio)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SpeechError::Playback(format!("{}: {e}", self.player.display())))?;
        if !status.success() {
            return Err(SpeechError::Playback(format!(
                "{} exited with {status}",
                self.player.display()
            )));
        }
        Ok(())
    }
}
