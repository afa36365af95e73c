//! The extraction engine seam.
//!
//! The actual download, format negotiation and transcoding are done by
//! `yt-dlp` (which in turn drives ffmpeg). This module only knows how to build
//! its command line, run it to completion, and sort its failures into the few
//! categories callers care about.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Placeholder yt-dlp substitutes with the extension of the file it writes.
pub const EXT_PLACEHOLDER: &str = "%(ext)s";

/// Post-processing the engine applies once the streams are on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    /// Transcode to a single audio file.
    ExtractAudio {
        codec: &'static str,
        bitrate_kbps: u32,
    },
    /// Mux the selected streams into one container.
    Merge { container: &'static str },
}

/// Everything the engine needs besides the source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// yt-dlp format selector, e.g. `bestaudio/best`.
    pub format: String,
    /// Output path containing [`EXT_PLACEHOLDER`].
    pub output_template: PathBuf,
    pub postprocess: PostProcess,
    pub quiet: bool,
}

impl EngineOptions {
    /// Extension the produced file should carry once post-processing ran.
    pub fn target_extension(&self) -> &'static str {
        match self.postprocess {
            PostProcess::ExtractAudio { codec, .. } => codec,
            PostProcess::Merge { container } => container,
        }
    }
}

/// The slice of the engine's info dump we read back after a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub title: String,
    /// Extension yt-dlp reports for the selected format. For audio extraction
    /// this is the pre-transcode container, not the final file.
    #[serde(default)]
    pub ext: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("unreadable engine output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Black-box, blocking retrieval of a single URL.
pub trait ExtractionEngine: Send + Sync {
    /// Downloads `url` according to `options` and returns the reported
    /// metadata. The file itself is written somewhere matching
    /// `options.output_template`.
    fn fetch(&self, url: &str, options: &EngineOptions) -> Result<RawMetadata, EngineError>;
}

/// [`ExtractionEngine`] backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_BIN)
    }
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs `yt-dlp --version` so a missing binary is reported up front
    /// instead of on the first request.
    pub fn version(&self) -> Result<String, EngineError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|source| self.launch_error(source))?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Command line for a single download. Kept separate from [`fetch`] so the
    /// flags can be checked without spawning anything.
    ///
    /// [`fetch`]: ExtractionEngine::fetch
    pub fn args(url: &str, options: &EngineOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--format".into(),
            options.format.clone().into(),
            "--output".into(),
            options.output_template.clone().into_os_string(),
            "--no-playlist".into(),
            "--dump-single-json".into(),
            "--no-simulate".into(),
        ];

        match options.postprocess {
            PostProcess::ExtractAudio {
                codec,
                bitrate_kbps,
            } => {
                args.push("--extract-audio".into());
                args.push("--audio-format".into());
                args.push(codec.into());
                args.push("--audio-quality".into());
                args.push(format!("{bitrate_kbps}K").into());
            }
            PostProcess::Merge { container } => {
                args.push("--merge-output-format".into());
                args.push(container.into());
            }
        }

        if options.quiet {
            args.push("--quiet".into());
            args.push("--no-warnings".into());
            args.push("--no-progress".into());
        }

        args.push("--".into());
        args.push(url.into());
        args
    }

    fn launch_error(&self, source: io::Error) -> EngineError {
        EngineError::Launch {
            program: self.program.display().to_string(),
            source,
        }
    }
}

impl ExtractionEngine for YtDlp {
    fn fetch(&self, url: &str, options: &EngineOptions) -> Result<RawMetadata, EngineError> {
        debug!(program = %self.program.display(), url, "invoking extraction engine");

        let output = Command::new(&self.program)
            .args(Self::args(url, options))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| self.launch_error(source))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            warn!(url, status = %output.status, stderr = %stderr.trim(), "extraction engine failed");
            return Err(classify_failure(&output.status.to_string(), &stderr));
        }

        let info: RawMetadata = serde_json::from_slice(&output.stdout)?;
        debug!(url, title = %info.title, ext = %info.ext, "extraction engine finished");
        Ok(info)
    }
}

const UNAVAILABLE_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "not available",
    "blocked",
    "sign in to confirm",
    "http error 403",
    "http error 404",
    "unsupported url",
];

const NETWORK_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "network is unreachable",
    "temporary failure in name resolution",
    "unable to download webpage",
];

/// Sorts a failed run by its stderr. Unavailability wins over network noise
/// because yt-dlp often mentions both when a video is geo-blocked.
pub fn classify_failure(status: &str, stderr: &str) -> EngineError {
    let lower = stderr.to_lowercase();
    let detail = stderr.trim().to_owned();

    if UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return EngineError::SourceUnavailable(detail);
    }
    if NETWORK_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return EngineError::Network(detail);
    }
    EngineError::Failed {
        status: status.to_owned(),
        stderr: detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn audio_options(template: PathBuf) -> EngineOptions {
        EngineOptions {
            format: "bestaudio/best".into(),
            output_template: template,
            postprocess: PostProcess::ExtractAudio {
                codec: "mp3",
                bitrate_kbps: 192,
            },
            quiet: true,
        }
    }

    fn as_strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[cfg(unix)]
    fn install_stub(dir: &Path, body: &str) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        fs::write(&script_path, format!("#!/bin/sh\n{body}"))?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[test]
    fn audio_args_request_transcode_at_fixed_bitrate() {
        let args = as_strings(YtDlp::args(
            "https://example.com/watch?v=1",
            &audio_options(PathBuf::from("/tmp/job.%(ext)s")),
        ));
        let joined = args.join(" ");
        assert!(joined.contains("--format bestaudio/best"));
        assert!(joined.contains("--extract-audio --audio-format mp3 --audio-quality 192K"));
        assert!(joined.contains("--output /tmp/job.%(ext)s"));
        assert!(joined.contains("--quiet"));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/watch?v=1"));
        assert_eq!(args[args.len() - 2], "--");
    }

    #[test]
    fn merge_args_select_container() {
        let options = EngineOptions {
            format: "bestvideo+bestaudio/best".into(),
            output_template: PathBuf::from("job.%(ext)s"),
            postprocess: PostProcess::Merge { container: "mp4" },
            quiet: false,
        };
        let args = as_strings(YtDlp::args("https://example.com/v", &options));
        let joined = args.join(" ");
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(!joined.contains("--extract-audio"));
        assert!(!joined.contains("--quiet"));
        assert_eq!(options.target_extension(), "mp4");
    }

    #[test]
    fn classify_failure_sorts_stderr() {
        assert!(matches!(
            classify_failure("exit status: 1", "ERROR: [youtube] abc: Video unavailable"),
            EngineError::SourceUnavailable(_)
        ));
        assert!(matches!(
            classify_failure("exit status: 1", "ERROR: [youtube] abc: Private video. Sign in"),
            EngineError::SourceUnavailable(_)
        ));
        assert!(matches!(
            classify_failure("exit status: 1", "ERROR: Unable to download webpage: timed out"),
            EngineError::Network(_)
        ));
        assert!(matches!(
            classify_failure("exit status: 2", "ERROR: postprocessing: ffmpeg exploded"),
            EngineError::Failed { .. }
        ));
    }

    #[test]
    fn raw_metadata_tolerates_missing_fields() -> Result<()> {
        let info: RawMetadata = serde_json::from_str(r#"{"title":"Song","formats":[]}"#)?;
        assert_eq!(info.title, "Song");
        assert!(info.ext.is_empty());
        Ok(())
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let engine = YtDlp::new("/definitely/not/here/yt-dlp");
        assert!(matches!(engine.version(), Err(EngineError::Launch { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn fetch_reads_info_dump_from_stub() -> Result<()> {
        let dir = tempdir()?;
        let script = install_stub(
            dir.path(),
            r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; shift; fi
  shift
done
path=$(printf '%s' "$out" | sed 's/%(ext)s/mp3/')
printf 'audio' > "$path"
printf '{"id":"abc","title":"Stub Artist - Stub Song","ext":"webm"}\n'
"#,
        )?;
        let engine = YtDlp::new(&script);
        let template = dir.path().join("job.%(ext)s");
        let info = engine.fetch("https://example.com/v", &audio_options(template))?;
        assert_eq!(info.title, "Stub Artist - Stub Song");
        assert_eq!(info.ext, "webm");
        assert_eq!(fs::read_to_string(dir.path().join("job.mp3"))?, "audio");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn fetch_classifies_stub_failure() -> Result<()> {
        let dir = tempdir()?;
        let script = install_stub(
            dir.path(),
            "echo 'ERROR: [youtube] abc: Video unavailable' >&2\nexit 1\n",
        )?;
        let engine = YtDlp::new(&script);
        let result = engine.fetch(
            "https://example.com/v",
            &audio_options(dir.path().join("job.%(ext)s")),
        );
        assert!(matches!(result, Err(EngineError::SourceUnavailable(_))));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn version_reports_stub_output() -> Result<()> {
        let dir = tempdir()?;
        let script = install_stub(dir.path(), "echo 2025.01.01\n")?;
        assert_eq!(YtDlp::new(&script).version()?, "2025.01.01");
        Ok(())
    }
}
