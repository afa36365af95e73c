//! Retrieval job runner: one engine invocation per request, followed by a
//! single move of the produced file to its display name.
//!
//! Every job gets a fresh UUID before the engine runs. The engine writes to
//! `{storage_root}/{job_id}.{ext}`, which keeps concurrent jobs apart even
//! though the final name (derived from the title) is only known afterwards.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    engine::{EXT_PLACEHOLDER, EngineOptions, ExtractionEngine, PostProcess},
    error::RetrievalError,
    naming::{ParsedMetadata, extract_metadata, name_artifact, sanitize},
};

pub const AUDIO_BITRATE_KBPS: u32 = 192;
const UNKNOWN_EXTENSION: &str = "unknown";
/// Leftovers of an interrupted engine run, never a finished artifact.
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Audio,
    Video,
}

impl MediaFormat {
    /// Strict parse of a user-facing choice (`mp3` / `mp4`).
    pub fn parse(choice: &str) -> Option<Self> {
        match choice.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Audio),
            "mp4" => Some(Self::Video),
            _ => None,
        }
    }

    /// Lenient parse used by the HTTP surface: anything unrecognised, or no
    /// choice at all, means video.
    pub fn from_choice(choice: Option<&str>) -> Self {
        choice.and_then(Self::parse).unwrap_or(Self::Video)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }

    pub fn engine_options(self, output_template: PathBuf) -> EngineOptions {
        match self {
            Self::Audio => EngineOptions {
                format: "bestaudio/best".into(),
                output_template,
                postprocess: PostProcess::ExtractAudio {
                    codec: "mp3",
                    bitrate_kbps: AUDIO_BITRATE_KBPS,
                },
                quiet: true,
            },
            Self::Video => EngineOptions {
                format: "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best".into(),
                output_template,
                postprocess: PostProcess::Merge { container: "mp4" },
                quiet: true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
}

/// A finished file under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub job_id: Uuid,
    pub extension: String,
    /// Sanitized `{title}.{ext}`; this is what clients use to fetch it.
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieval {
    pub artifact: Artifact,
    pub metadata: ParsedMetadata,
}

#[derive(Clone)]
pub struct JobRunner {
    storage_root: PathBuf,
    engine: Arc<dyn ExtractionEngine>,
}

impl JobRunner {
    pub fn new(storage_root: impl Into<PathBuf>, engine: Arc<dyn ExtractionEngine>) -> Self {
        Self {
            storage_root: storage_root.into(),
            engine,
        }
    }

    /// Runs the job on the blocking pool. The engine call cannot be cancelled;
    /// dropping the future leaves it running to completion.
    pub async fn run(&self, request: DownloadRequest) -> Result<Retrieval, RetrievalError> {
        let runner = self.clone();
        task::spawn_blocking(move || runner.run_blocking(&request))
            .await
            .map_err(|err| RetrievalError::Internal(format!("task join error: {err}")))?
    }

    pub fn run_blocking(&self, request: &DownloadRequest) -> Result<Retrieval, RetrievalError> {
        let job_id = Uuid::new_v4();
        let template = self
            .storage_root
            .join(format!("{job_id}.{EXT_PLACEHOLDER}"));
        let options = request.format.engine_options(template);
        let expected_ext = options.target_extension();

        info!(%job_id, url = %request.url, format = expected_ext, "starting retrieval");
        let raw = self.engine.fetch(&request.url, &options)?;

        let expected = self.storage_root.join(format!("{job_id}.{expected_ext}"));
        let produced = locate_output(&self.storage_root, job_id, &expected)?;
        let extension = produced
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(str::to_owned)
            .or_else(|| Some(raw.ext.clone()).filter(|ext| !ext.is_empty()))
            .unwrap_or_else(|| UNKNOWN_EXTENSION.to_owned());

        let file_name = if sanitize(&raw.title).trim().is_empty() {
            format!("{job_id}.{extension}")
        } else {
            name_artifact(&raw.title, &extension)
        };
        let destination = self.storage_root.join(&file_name);

        if destination != produced {
            move_into_place(&produced, &destination)?;
        }

        info!(%job_id, file = %file_name, "retrieval finished");
        Ok(Retrieval {
            artifact: Artifact {
                job_id,
                extension,
                file_name,
                path: destination,
            },
            metadata: extract_metadata(&raw.title),
        })
    }
}

/// Finds the engine's output for `job_id`. The engine is free to pick another
/// extension than the one requested, so when `expected` is absent any
/// finished file starting with the job id is adopted.
fn locate_output(root: &Path, job_id: Uuid, expected: &Path) -> Result<PathBuf, RetrievalError> {
    if expected.is_file() {
        return Ok(expected.to_path_buf());
    }

    let prefix = job_id.to_string();
    let fallback = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with(&prefix)
                && !PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .map(|entry| entry.into_path());

    match fallback {
        Some(path) => {
            warn!(%job_id, expected = %expected.display(), found = %path.display(), "engine output had an unexpected name");
            Ok(path)
        }
        None => Err(RetrievalError::ArtifactMissing {
            job_id,
            dir: root.to_path_buf(),
        }),
    }
}

/// Moves `from` to `to` without ever replacing an existing file. A hard link
/// fails atomically when the destination exists; filesystems without hard
/// links fall back to a checked rename. On collision the temporary file is
/// discarded since nothing can reference it.
///
/// Once the link exists the artifact is in place, so failing to drop the
/// temporary name only leaves a stray file behind.
fn move_into_place(from: &Path, to: &Path) -> Result<(), RetrievalError> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            if let Err(err) = fs::remove_file(from) {
                warn!(path = %from.display(), error = %err, "failed to remove temporary file after linking");
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(collision(from, to)),
        Err(_) if to.exists() => Err(collision(from, to)),
        Err(_) => fs::rename(from, to).map_err(|err| RetrievalError::filesystem("moving", from, err)),
    }
}

fn collision(from: &Path, to: &Path) -> RetrievalError {
    if let Err(err) = fs::remove_file(from) {
        warn!(path = %from.display(), error = %err, "failed to discard temporary file");
    }
    RetrievalError::Collision {
        path: to.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, RawMetadata};
    use anyhow::Result;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Writes the files it is told to, relative to the output template.
    struct FakeEngine {
        title: String,
        reported_ext: String,
        /// Extension of the file actually written; `None` writes nothing.
        written_ext: Option<String>,
        seen: Mutex<Vec<EngineOptions>>,
    }

    impl FakeEngine {
        fn new(title: &str, written_ext: Option<&str>) -> Self {
            Self {
                title: title.into(),
                reported_ext: "webm".into(),
                written_ext: written_ext.map(str::to_owned),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ExtractionEngine for FakeEngine {
        fn fetch(&self, _url: &str, options: &EngineOptions) -> Result<RawMetadata, EngineError> {
            self.seen.lock().unwrap().push(options.clone());
            if let Some(ext) = &self.written_ext {
                let path = options
                    .output_template
                    .to_string_lossy()
                    .replace(EXT_PLACEHOLDER, ext);
                fs::write(path, b"media").unwrap();
            }
            Ok(RawMetadata {
                title: self.title.clone(),
                ext: self.reported_ext.clone(),
            })
        }
    }

    struct FailingEngine;

    impl ExtractionEngine for FailingEngine {
        fn fetch(&self, _url: &str, _options: &EngineOptions) -> Result<RawMetadata, EngineError> {
            Err(EngineError::SourceUnavailable("Video unavailable".into()))
        }
    }

    fn request(format: MediaFormat) -> DownloadRequest {
        DownloadRequest {
            url: "https://example.com/watch?v=abc".into(),
            format,
        }
    }

    fn file_names(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn format_choice_parsing() {
        assert_eq!(MediaFormat::parse(" MP3 "), Some(MediaFormat::Audio));
        assert_eq!(MediaFormat::parse("mp4"), Some(MediaFormat::Video));
        assert_eq!(MediaFormat::parse("flac"), None);
        assert_eq!(MediaFormat::from_choice(None), MediaFormat::Video);
        assert_eq!(MediaFormat::from_choice(Some("ogg")), MediaFormat::Video);
        assert_eq!(MediaFormat::from_choice(Some("mp3")), MediaFormat::Audio);
    }

    #[test]
    fn engine_options_follow_format() {
        let audio = MediaFormat::Audio.engine_options(PathBuf::from("x.%(ext)s"));
        assert_eq!(audio.format, "bestaudio/best");
        assert_eq!(
            audio.postprocess,
            PostProcess::ExtractAudio {
                codec: "mp3",
                bitrate_kbps: 192
            }
        );
        let video = MediaFormat::Video.engine_options(PathBuf::from("x.%(ext)s"));
        assert!(video.format.starts_with("bestvideo[ext=mp4]+bestaudio[ext=m4a]"));
        assert_eq!(video.target_extension(), "mp4");
    }

    #[test]
    fn audio_job_renames_to_sanitized_title() -> Result<()> {
        let dir = tempdir()?;
        let engine = Arc::new(FakeEngine::new("Artist - Song: Live?", Some("mp3")));
        let runner = JobRunner::new(dir.path(), engine.clone());

        let result = runner.run_blocking(&request(MediaFormat::Audio))?;
        assert_eq!(result.artifact.file_name, "Artist - Song Live.mp3");
        assert_eq!(result.artifact.extension, "mp3");
        assert_eq!(result.artifact.path, dir.path().join("Artist - Song Live.mp3"));
        assert_eq!(result.metadata.artist, "Artist");
        assert_eq!(result.metadata.song, "Song: Live?");
        assert_eq!(file_names(dir.path())?, vec!["Artist - Song Live.mp3"]);

        let seen = engine.seen.lock().unwrap();
        let template = seen[0].output_template.to_string_lossy().into_owned();
        assert!(template.ends_with(&format!("{}.%(ext)s", result.artifact.job_id)));
        Ok(())
    }

    #[test]
    fn unexpected_extension_is_found_by_job_id_prefix() -> Result<()> {
        let dir = tempdir()?;
        let engine = Arc::new(FakeEngine::new("Some Clip", Some("mkv")));
        let runner = JobRunner::new(dir.path(), engine);

        let result = runner.run_blocking(&request(MediaFormat::Video))?;
        assert_eq!(result.artifact.file_name, "Some Clip.mkv");
        assert_eq!(result.artifact.extension, "mkv");
        assert!(result.artifact.path.is_file());
        Ok(())
    }

    #[test]
    fn missing_output_is_an_error_not_a_success() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("someone-else.mp3"), b"other")?;
        let runner = JobRunner::new(dir.path(), Arc::new(FakeEngine::new("Title", None)));

        let err = runner.run_blocking(&request(MediaFormat::Audio)).unwrap_err();
        assert!(matches!(err, RetrievalError::ArtifactMissing { .. }));
        Ok(())
    }

    #[test]
    fn partial_downloads_are_not_adopted() -> Result<()> {
        let dir = tempdir()?;
        let runner = JobRunner::new(dir.path(), Arc::new(FakeEngine::new("Title", Some("mp4.part"))));

        let err = runner.run_blocking(&request(MediaFormat::Video)).unwrap_err();
        assert!(matches!(err, RetrievalError::ArtifactMissing { .. }));
        Ok(())
    }

    #[test]
    fn existing_destination_is_never_overwritten() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("Same Title.mp4"), b"first")?;
        let runner = JobRunner::new(dir.path(), Arc::new(FakeEngine::new("Same Title", Some("mp4"))));

        let err = runner.run_blocking(&request(MediaFormat::Video)).unwrap_err();
        assert!(matches!(err, RetrievalError::Collision { .. }));
        assert_eq!(fs::read(dir.path().join("Same Title.mp4"))?, b"first");
        assert_eq!(file_names(dir.path())?, vec!["Same Title.mp4"]);
        Ok(())
    }

    #[test]
    fn blank_title_keeps_job_id_name() -> Result<()> {
        let dir = tempdir()?;
        let runner = JobRunner::new(dir.path(), Arc::new(FakeEngine::new("???", Some("mp3"))));

        let result = runner.run_blocking(&request(MediaFormat::Audio))?;
        assert_eq!(
            result.artifact.file_name,
            format!("{}.mp3", result.artifact.job_id)
        );
        assert!(result.artifact.path.is_file());
        assert_eq!(result.metadata.artist, "Unknown");
        Ok(())
    }

    #[test]
    fn engine_failure_propagates_category() -> Result<()> {
        let dir = tempdir()?;
        let runner = JobRunner::new(dir.path(), Arc::new(FailingEngine));

        let err = runner.run_blocking(&request(MediaFormat::Audio)).unwrap_err();
        assert!(matches!(err, RetrievalError::SourceUnavailable(_)));
        assert!(file_names(dir.path())?.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn linked_artifact_survives_undeletable_temporary_name() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let staging = dir.path().join("staging");
        let storage = dir.path().join("storage");
        fs::create_dir(&staging)?;
        fs::create_dir(&storage)?;
        let from = staging.join("job.mp3");
        let to = storage.join("Song.mp3");
        fs::write(&from, b"media")?;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o555))?;

        let moved = move_into_place(&from, &to);
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755))?;

        assert!(moved.is_ok(), "{moved:?}");
        assert_eq!(fs::read(&to)?, b"media");
        Ok(())
    }

    #[tokio::test]
    async fn each_job_gets_its_own_temporary_name() -> Result<()> {
        let dir = tempdir()?;
        let engine = Arc::new(FakeEngine::new("Clip", Some("mp4")));
        let runner = JobRunner::new(dir.path(), engine.clone());

        let first = runner.run(request(MediaFormat::Video)).await?;
        let second = runner.run(request(MediaFormat::Video)).await;
        assert_ne!(first.artifact.job_id, Uuid::nil());
        assert!(matches!(second, Err(RetrievalError::Collision { .. })));

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].output_template, seen[1].output_template);
        Ok(())
    }
}
