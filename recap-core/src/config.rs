use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const API_KEY_ENV: &str = "RECAP_TRANSCRIPTION_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecapConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub ingest: IngestSection,
    pub pipeline: PipelineSection,
    pub transcription: TranscriptionSection,
}

impl RecapConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("recordings.sqlite")
    }

    pub fn staging_retention(&self) -> Duration {
        Duration::from_secs(self.ingest.staging_retention_hours.saturating_mul(3600))
    }

    pub fn validate(&self) -> Result<()> {
        if !(4..=64).contains(&self.ingest.id_length) {
            return Err(ConfigError::Invalid {
                field: "ingest.id_length",
                reason: format!("{} is outside 4..=64", self.ingest.id_length),
            });
        }
        if self.pipeline.compress_crf > 51 {
            return Err(ConfigError::Invalid {
                field: "pipeline.compress_crf",
                reason: format!("{} exceeds 51", self.pipeline.compress_crf),
            });
        }
        if self.transcription.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "transcription.timeout_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub media_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    #[serde(default = "default_staging_retention_hours")]
    pub staging_retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    pub ffmpeg_path: String,
    #[serde(default)]
    pub probe_input: bool,
    pub audio_quality: u8,
    pub compress_crf: u8,
    pub thumbnail_offset: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptFormat {
    Json,
    Srt,
    Txt,
}

impl TranscriptFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TranscriptFormat::Json => "json",
            TranscriptFormat::Srt => "srt",
            TranscriptFormat::Txt => "txt",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub timeout_seconds: u64,
    pub format: TranscriptFormat,
    pub punctuate: bool,
    pub tier: Option<String>,
}

impl TranscriptionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_id_length() -> usize {
    crate::ident::DEFAULT_ID_LENGTH
}

fn default_staging_retention_hours() -> u64 {
    72
}

pub fn load_recap_config<P: AsRef<Path>>(path: P) -> Result<RecapConfig> {
    let mut config: RecapConfig = load_toml(path)?;
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            config.transcription.api_key = key;
        }
    }
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/recap.toml");
        let config = load_recap_config(path).expect("config should parse");
        assert_eq!(config.system.node_name, "recap-primary");
        assert_eq!(config.ingest.id_length, 10);
        assert_eq!(config.pipeline.compress_crf, 28);
        assert_eq!(config.pipeline.thumbnail_offset, "00:00:02.000");
        assert_eq!(config.transcription.format, TranscriptFormat::Json);
        assert_eq!(config.transcription.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/recap.toml");
        let mut config = load_recap_config(path).unwrap();
        config.paths.base_dir = "/srv/recap".into();
        config.paths.media_dir = "media".into();
        assert_eq!(config.media_dir(), PathBuf::from("/srv/recap/media"));
        config.paths.media_dir = "/mnt/media".into();
        assert_eq!(config.media_dir(), PathBuf::from("/mnt/media"));
    }

    #[test]
    fn huge_retention_saturates() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/recap.toml");
        let mut config = load_recap_config(path).unwrap();
        assert_eq!(config.staging_retention(), Duration::from_secs(72 * 3600));
        config.ingest.staging_retention_hours = u64::MAX;
        assert_eq!(config.staging_retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/recap.toml");
        let mut config = load_recap_config(path).unwrap();
        config.transcription.timeout_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "transcription.timeout_seconds",
                ..
            })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_recap_config("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
