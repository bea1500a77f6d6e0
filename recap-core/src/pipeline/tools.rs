use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::PipelineSection;

use super::error::{PipelineError, PipelineResult};

const INVALID_INPUT_MARKER: &str = "Invalid data found when processing input";

/// Runs an external program to completion and hands back its captured output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// ffmpeg invocations used by the pipeline stages.
#[derive(Clone)]
pub struct FfmpegTools {
    ffmpeg: PathBuf,
    audio_quality: u8,
    compress_crf: u8,
    thumbnail_offset: String,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for FfmpegTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegTools")
            .field("ffmpeg", &self.ffmpeg)
            .field("audio_quality", &self.audio_quality)
            .field("compress_crf", &self.compress_crf)
            .field("thumbnail_offset", &self.thumbnail_offset)
            .finish()
    }
}

impl FfmpegTools {
    pub fn from_config(config: &PipelineSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg_path),
            audio_quality: config.audio_quality,
            compress_crf: config.compress_crf,
            thumbnail_offset: config.thumbnail_offset.clone(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Opens the input without an output target. ffmpeg always exits non-zero in
    /// that mode, so only the decoder's complaint on stderr counts as a failure.
    pub async fn probe(&self, input: &Path) -> PipelineResult<()> {
        let args = vec![
            "-hide_banner".to_string(),
            "-i".to_string(),
            path_arg(input),
        ];
        let output = self.spawn(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(INVALID_INPUT_MARKER) {
            return Err(PipelineError::InvalidInput(format!(
                "{} is not a readable media file",
                input.display()
            )));
        }
        Ok(())
    }

    pub async fn extract_audio(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path_arg(input),
            "-vn".to_string(),
            "-c:a".to_string(),
            "libmp3lame".to_string(),
            "-q:a".to_string(),
            self.audio_quality.to_string(),
            path_arg(output),
        ];
        self.run_checked(&args).await
    }

    pub async fn compress(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path_arg(input),
            "-vcodec".to_string(),
            "libx264".to_string(),
            "-crf".to_string(),
            self.compress_crf.to_string(),
            path_arg(output),
        ];
        self.run_checked(&args).await
    }

    pub async fn thumbnail(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path_arg(input),
            "-ss".to_string(),
            self.thumbnail_offset.clone(),
            "-vframes".to_string(),
            "1".to_string(),
            path_arg(output),
        ];
        self.run_checked(&args).await
    }

    async fn run_checked(&self, args: &[String]) -> PipelineResult<()> {
        let output = self.spawn(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::CommandFailure {
                command: self.describe(args),
                status: output.status.code(),
                stderr: tail(&stderr, 20),
            });
        }
        Ok(())
    }

    async fn spawn(&self, args: &[String]) -> PipelineResult<Output> {
        debug!(target: "pipeline", command = %self.describe(args), "running ffmpeg");
        self.executor
            .run(&self.ffmpeg, args)
            .await
            .map_err(|source| PipelineError::Spawn {
                command: self.describe(args),
                source,
            })
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.ffmpeg.display(), args.join(" "))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Last `lines` lines of ffmpeg's stderr; the banner and stream dump above them
/// rarely matter.
fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.trim_end().lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use std::process::ExitStatus;

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

    type RecordedCalls = Arc<Mutex<Vec<Vec<String>>>>;

    struct ScriptedExecutor {
        calls: RecordedCalls,
        exit_code: i32,
        stderr: &'static str,
    }

    impl ScriptedExecutor {
        fn build(exit_code: i32, stderr: &'static str) -> (Arc<dyn CommandExecutor>, RecordedCalls) {
            let calls: RecordedCalls = Arc::new(Mutex::new(Vec::new()));
            let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
                calls: Arc::clone(&calls),
                exit_code,
                stderr,
            });
            (executor, calls)
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, _program: &Path, args: &[String]) -> std::io::Result<Output> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(Output {
                status: exit_status(self.exit_code),
                stdout: Vec::new(),
                stderr: self.stderr.as_bytes().to_vec(),
            })
        }
    }

    fn section() -> PipelineSection {
        PipelineSection {
            ffmpeg_path: "ffmpeg".into(),
            probe_input: true,
            audio_quality: 2,
            compress_crf: 28,
            thumbnail_offset: "00:00:02.000".into(),
        }
    }

    #[tokio::test]
    async fn commands_match_expected_arguments() {
        let (executor, calls) = ScriptedExecutor::build(0, "");
        let tools = FfmpegTools::from_config(&section()).with_executor(executor);
        tools
            .extract_audio(Path::new("in.mp4"), Path::new("a.mp3"))
            .await
            .unwrap();
        tools
            .compress(Path::new("in.mp4"), Path::new("c.mp4"))
            .await
            .unwrap();
        tools
            .thumbnail(Path::new("c.mp4"), Path::new("t.jpg"))
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0].join(" "),
            "-y -i in.mp4 -vn -c:a libmp3lame -q:a 2 a.mp3"
        );
        assert_eq!(calls[1].join(" "), "-y -i in.mp4 -vcodec libx264 -crf 28 c.mp4");
        assert_eq!(
            calls[2].join(" "),
            "-y -i c.mp4 -ss 00:00:02.000 -vframes 1 t.jpg"
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failure() {
        let (executor, _) = ScriptedExecutor::build(1, "line one\nencoder exploded");
        let tools = FfmpegTools::from_config(&section()).with_executor(executor);
        let err = tools
            .compress(Path::new("in.mp4"), Path::new("c.mp4"))
            .await
            .unwrap_err();
        match err {
            PipelineError::CommandFailure { status, stderr, .. } => {
                assert_eq!(status, Some(1));
                assert!(stderr.ends_with("encoder exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_only_fails_on_invalid_data() {
        let (executor, _) =
            ScriptedExecutor::build(1, "At least one output file must be specified");
        let tools = FfmpegTools::from_config(&section()).with_executor(executor);
        tools.probe(Path::new("in.mp4")).await.unwrap();

        let (executor, _) = ScriptedExecutor::build(
            1,
            "in.mp4: Invalid data found when processing input",
        );
        let tools = FfmpegTools::from_config(&section()).with_executor(executor);
        let err = tools.probe(Path::new("in.mp4")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
    }
}
