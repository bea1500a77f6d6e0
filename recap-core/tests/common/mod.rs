#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recap_core::{
    load_recap_config, CommandExecutor, RecapConfig, RecordingService, Transcriber, Transcript,
    TranscriptWord, TranscriptionError,
};
use tempfile::TempDir;

#[cfg(unix)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code as u32)
}

pub type RecordedCalls = Arc<Mutex<Vec<Vec<String>>>>;

/// Stands in for ffmpeg: writes a small file at the output argument and can be
/// told to fail whenever an argument matches `fail_on`.
pub struct FakeFfmpeg {
    calls: RecordedCalls,
    fail_on: Option<&'static str>,
}

impl FakeFfmpeg {
    pub fn build(fail_on: Option<&'static str>) -> (Arc<dyn CommandExecutor>, RecordedCalls) {
        let calls: RecordedCalls = Arc::new(Mutex::new(Vec::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
            calls: Arc::clone(&calls),
            fail_on,
        });
        (executor, calls)
    }
}

#[async_trait]
impl CommandExecutor for FakeFfmpeg {
    async fn run(&self, _program: &Path, args: &[String]) -> std::io::Result<Output> {
        self.calls.lock().unwrap().push(args.to_vec());
        if let Some(marker) = self.fail_on {
            if args.iter().any(|arg| arg == marker) {
                return Ok(Output {
                    status: exit_status(1),
                    stdout: Vec::new(),
                    stderr: format!("{marker}: encoder not available").into_bytes(),
                });
            }
        }
        if args.first().map(String::as_str) == Some("-hide_banner") {
            return Ok(Output {
                status: exit_status(1),
                stdout: Vec::new(),
                stderr: b"At least one output file must be specified".to_vec(),
            });
        }
        if let Some(output) = args.last() {
            tokio::fs::write(output, format!("fake output of {}", args.join(" "))).await?;
        }
        Ok(Output {
            status: exit_status(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

pub struct FakeTranscriber {
    delay: Duration,
}

impl FakeTranscriber {
    pub fn instant() -> Arc<dyn Transcriber> {
        Arc::new(Self {
            delay: Duration::ZERO,
        })
    }

    pub fn slow(delay: Duration) -> Arc<dyn Transcriber> {
        Arc::new(Self { delay })
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<Transcript, TranscriptionError> {
        if !audio.exists() {
            return Err(TranscriptionError::Malformed(format!(
                "{} missing",
                audio.display()
            )));
        }
        tokio::time::sleep(self.delay).await;
        Ok(Transcript {
            text: "hello world".into(),
            confidence: Some(0.98),
            words: vec![
                TranscriptWord {
                    word: "hello".into(),
                    start: 0.0,
                    end: 0.4,
                    confidence: 0.99,
                    punctuated_word: Some("Hello".into()),
                },
                TranscriptWord {
                    word: "world".into(),
                    start: 0.5,
                    end: 0.9,
                    confidence: 0.97,
                    punctuated_word: Some("world.".into()),
                },
            ],
        })
    }
}

pub fn fixture_config(base: &Path) -> RecapConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/recap.toml");
    let mut config = load_recap_config(path).expect("fixture config");
    config.paths.base_dir = base.to_string_lossy().into_owned();
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: RecapConfig,
    pub service: RecordingService,
    pub calls: RecordedCalls,
}

pub fn harness(fail_on: Option<&'static str>) -> Harness {
    harness_with(fail_on, FakeTranscriber::instant(), |_| {})
}

pub fn harness_with(
    fail_on: Option<&'static str>,
    transcriber: Arc<dyn Transcriber>,
    adjust: impl FnOnce(&mut RecapConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture_config(dir.path());
    adjust(&mut config);
    let (executor, calls) = FakeFfmpeg::build(fail_on);
    let service = RecordingService::new(&config)
        .unwrap()
        .with_executor(executor)
        .with_transcriber(transcriber);
    Harness {
        dir,
        config,
        service,
        calls,
    }
}
