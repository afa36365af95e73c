#![forbid(unsafe_code)]

//! Command-line downloader. Fetches one URL as mp3 or mp4 into a local
//! directory, asking on stdin for whatever was not given as an argument.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use mediagrab::{
    engine::{DEFAULT_YTDLP_BIN, YtDlp},
    retrieval::{DownloadRequest, JobRunner, MediaFormat},
    store::ArtifactStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Mp3,
    Mp4,
}

impl From<FormatArg> for MediaFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Mp3 => MediaFormat::Audio,
            FormatArg::Mp4 => MediaFormat::Video,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Download a video as MP3 or MP4.")]
struct Cli {
    #[arg(value_name = "URL", help = "Video URL (prompted for when omitted)")]
    url: Option<String>,
    #[arg(short = 'f', long = "format", value_enum, help = "Output format (prompted for when omitted)")]
    format: Option<FormatArg>,
    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "PATH",
        help = "Where to save the file (default ~/Downloads)"
    )]
    output_dir: Option<PathBuf>,
    #[arg(long = "ytdlp", value_name = "PATH", default_value = DEFAULT_YTDLP_BIN, help = "yt-dlp executable to invoke")]
    ytdlp: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "mediagrab=warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let url = match cli.url {
        Some(url) => url,
        None => prompt(&mut input, "Enter video URL: ")?,
    };
    if url.is_empty() {
        bail!("no URL given");
    }
    let format = match cli.format {
        Some(format) => format.into(),
        None => ask_format(&mut input)?,
    };

    let engine = YtDlp::new(&cli.ytdlp);
    engine
        .version()
        .with_context(|| format!("{} is not usable", cli.ytdlp.display()))?;

    let output_dir = match cli.output_dir {
        Some(dir) => dir,
        None => default_output_dir()?,
    };
    ArtifactStore::new(&output_dir)
        .prepare()
        .with_context(|| format!("creating {}", output_dir.display()))?;

    println!("Downloading {} as {}...", url, format.extension());
    let runner = JobRunner::new(&output_dir, Arc::new(engine));
    let retrieval = runner
        .run_blocking(&DownloadRequest { url, format })
        .context("download failed")?;

    println!("File saved as: {}", retrieval.artifact.path.display());
    println!("Artist: {}", retrieval.metadata.artist);
    println!("Song: {}", retrieval.metadata.song);
    Ok(())
}

fn prompt(input: &mut impl BufRead, question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush().context("flushing stdout")?;
    let mut line = String::new();
    input.read_line(&mut line).context("reading from stdin")?;
    Ok(line.trim().to_owned())
}

fn ask_format(input: &mut impl BufRead) -> Result<MediaFormat> {
    let answer = prompt(input, "Download as MP3 or MP4? (mp3/mp4): ")?;
    let Some(format) = MediaFormat::parse(&answer) else {
        bail!("invalid format choice {answer:?}; expected 'mp3' or 'mp4'");
    };
    Ok(format)
}

fn default_output_dir() -> Result<PathBuf> {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .context("cannot determine a downloads directory; pass --output-dir")
}
