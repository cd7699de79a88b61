//! Spoken announcements.
//!
//! [`Announcer::enqueue`] pushes text onto an unbounded queue and returns
//! immediately. A fixed pool of worker threads drains the queue; each
//! worker renders the utterance through an on-disk cache (one file per
//! normalised text, synthesised at most once) and plays it, blocking only
//! itself until playback ends.

use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("audio playback failed: {0}")]
    Playback(String),
    #[error("audio cache I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders text to audio and plays audio files.
pub trait SpeechBackend: Send + Sync + 'static {
    /// Produce encoded audio (MP3) for `text`.
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError>;
    /// Play an audio file, returning once playback has finished.
    fn play(&self, audio: &Path) -> Result<(), SpeechError>;
}

/// Cache key for an utterance: spaces and path-unsafe characters become `_`.
pub fn normalize(text: &str) -> String {
    text.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Content-addressed store of rendered utterances.
pub struct AudioCache {
    dir: PathBuf,
    /// One lock per key so two workers never synthesise the same text.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AudioCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, text: &str) -> PathBuf {
        self.dir.join(format!("{}.mp3", normalize(text)))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }

    /// Path to the rendered audio for `text`, synthesising it on a cache miss.
    pub fn get_or_render(&self, text: &str, backend: &dyn SpeechBackend) -> Result<PathBuf, SpeechError> {
        let path = self.path_for(text);
        let lock = self.key_lock(&normalize(text));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if path.is_file() {
            tracing::debug!(text, path = %path.display(), "audio cache hit");
            return Ok(path);
        }

        tracing::info!(text, "audio cache miss, synthesising");
        let audio = backend.synthesize(text)?;
        std::fs::create_dir_all(&self.dir)?;
        let part = path.with_extension("mp3.part");
        std::fs::write(&part, audio)?;
        std::fs::rename(&part, &path)?;
        Ok(path)
    }
}

enum Job {
    Speak(String),
    Stop,
}

/// Clone-safe producer side of the announcement queue.
#[derive(Clone)]
pub struct Announcer {
    tx: Sender<Job>,
}

impl Announcer {
    /// Queue `text` for speaking. Never blocks, never fails; if the pool is
    /// gone the utterance is dropped.
    pub fn enqueue(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(text = %text, "announcement queued");
        if self.tx.send(Job::Speak(text)).is_err() {
            tracing::debug!("announcement queue closed, utterance dropped");
        }
    }

    /// Announcer with no workers behind it, for callers that must not speak.
    pub fn disconnected() -> Self {
        let (tx, _rx) = crossbeam_channel::unbounded();
        Self { tx }
    }
}

/// Worker threads draining the announcement queue.
pub struct SpeechPool {
    tx: Sender<Job>,
    stopping: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl SpeechPool {
    /// Start `workers` threads (at least one) sharing `backend` and `cache`.
    pub fn spawn<B: SpeechBackend>(backend: B, cache: AudioCache, workers: usize) -> Result<Self, SpeechError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let backend: Arc<dyn SpeechBackend> = Arc::new(backend);
        let cache = Arc::new(cache);
        let stopping = Arc::new(AtomicBool::new(false));

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                let backend = backend.clone();
                let cache = cache.clone();
                let stopping = stopping.clone();
                std::thread::Builder::new()
                    .name(format!("jarvis-speech-{i}"))
                    .spawn(move || worker_loop(rx, &*backend, &cache, &stopping))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(workers = handles.len(), "speech pool started");
        Ok(Self {
            tx,
            stopping,
            workers: handles,
        })
    }

    pub fn announcer(&self) -> Announcer {
        Announcer { tx: self.tx.clone() }
    }

    /// Let in-flight utterances finish, discard anything still queued and
    /// join the workers.
    pub fn shutdown(self) {
        self.stopping.store(true, Ordering::Release);
        for _ in &self.workers {
            let _ = self.tx.send(Job::Stop);
        }
        for handle in self.workers {
            if handle.join().is_err() {
                tracing::warn!("speech worker panicked");
            }
        }
        tracing::info!("speech pool stopped");
    }
}

fn worker_loop(rx: Receiver<Job>, backend: &dyn SpeechBackend, cache: &AudioCache, stopping: &AtomicBool) {
    while let Ok(job) = rx.recv() {
        let text = match job {
            Job::Stop => break,
            Job::Speak(text) => text,
        };
        if stopping.load(Ordering::Acquire) {
            tracing::debug!(text = %text, "shutting down, utterance discarded");
            continue;
        }
        speak(backend, cache, &text);
    }
}

fn speak(backend: &dyn SpeechBackend, cache: &AudioCache, text: &str) {
    let path = match cache.get_or_render(text, backend) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(text, error = %e, "dropping utterance");
            return;
        }
    };
    if let Err(e) = backend.play(&path) {
        tracing::warn!(text, error = %e, "playback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        synthesized: AtomicUsize,
        played: Mutex<Vec<String>>,
        fail_text: Option<String>,
        synth_delay: Duration,
    }

    #[derive(Clone, Default)]
    struct StubBackend(Arc<Recorder>);

    impl SpeechBackend for StubBackend {
        fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
            std::thread::sleep(self.0.synth_delay);
            if self.0.fail_text.as_deref() == Some(text) {
                return Err(SpeechError::Synthesis("service unavailable".into()));
            }
            self.0.synthesized.fetch_add(1, Ordering::SeqCst);
            Ok(b"ID3fake".to_vec())
        }

        fn play(&self, audio: &Path) -> Result<(), SpeechError> {
            let stem = audio.file_stem().unwrap().to_string_lossy().into_owned();
            self.0.played.lock().unwrap().push(stem);
            Ok(())
        }
    }

    fn wait_for_plays(rec: &Recorder, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while rec.played.lock().unwrap().len() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} plays");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Hello alice"), "Hello_alice");
        assert_eq!(normalize(" Remodeling faces "), "Remodeling_faces");
        assert_eq!(normalize("../etc/passwd"), "___etc_passwd");
    }

    #[test]
    fn test_duplicate_text_synthesised_once_played_twice() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend(Arc::new(Recorder {
            synth_delay: Duration::from_millis(30),
            ..Default::default()
        }));
        let pool = SpeechPool::spawn(backend.clone(), AudioCache::new(dir.path()), 2).unwrap();
        let announcer = pool.announcer();

        announcer.enqueue("Hello alice");
        announcer.enqueue("Hello alice");
        wait_for_plays(&backend.0, 2);
        pool.shutdown();

        assert_eq!(backend.0.synthesized.load(Ordering::SeqCst), 1);
        assert_eq!(*backend.0.played.lock().unwrap(), vec!["Hello_alice", "Hello_alice"]);
        assert!(dir.path().join("Hello_alice.mp3").is_file());
    }

    #[test]
    fn test_single_worker_preserves_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend::default();
        let pool = SpeechPool::spawn(backend.clone(), AudioCache::new(dir.path()), 1).unwrap();
        let announcer = pool.announcer();

        for name in ["a", "b", "c"] {
            announcer.enqueue(format!("Hello {name}"));
        }
        wait_for_plays(&backend.0, 3);
        pool.shutdown();

        assert_eq!(
            *backend.0.played.lock().unwrap(),
            vec!["Hello_a", "Hello_b", "Hello_c"]
        );
    }

    #[test]
    fn test_synthesis_failure_does_not_stall_queue() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend(Arc::new(Recorder {
            fail_text: Some("broken".into()),
            ..Default::default()
        }));
        let pool = SpeechPool::spawn(backend.clone(), AudioCache::new(dir.path()), 1).unwrap();
        let announcer = pool.announcer();

        announcer.enqueue("broken");
        announcer.enqueue("Hello bob");
        wait_for_plays(&backend.0, 1);
        pool.shutdown();

        assert_eq!(*backend.0.played.lock().unwrap(), vec!["Hello_bob"]);
        assert!(!dir.path().join("broken.mp3").exists());
    }

    #[test]
    fn test_cached_audio_skips_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Hello_carol.mp3"), b"ID3cached").unwrap();
        let backend = StubBackend::default();
        let cache = AudioCache::new(dir.path());

        let path = cache.get_or_render("Hello carol", &backend).unwrap();
        assert_eq!(path, dir.path().join("Hello_carol.mp3"));
        assert_eq!(backend.0.synthesized.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SpeechPool::spawn(StubBackend::default(), AudioCache::new(dir.path()), 1).unwrap();
        let announcer = pool.announcer();
        pool.shutdown();
        announcer.enqueue("Hello nobody");
        Announcer::disconnected().enqueue("Hello void");
    }
}
