//! Logging init: file under the XDG state dir, falling back to stderr when
//! the state directory is unwritable.

use anyhow::Result;
use std::fs;
use std::io;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

enum LogSink {
    File(fs::File),
    Stderr,
}

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogSink::File(f) => f.write(buf),
            LogSink::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogSink::File(f) => f.flush(),
            LogSink::Stderr => io::stderr().lock().flush(),
        }
    }
}

struct SinkMaker(Option<fs::File>);

impl<'a> MakeWriter<'a> for SinkMaker {
    type Writer = LogSink;

    fn make_writer(&'a self) -> LogSink {
        self.0
            .as_ref()
            .and_then(|f| f.try_clone().ok())
            .map(LogSink::File)
            .unwrap_or(LogSink::Stderr)
    }
}

fn open_log_file() -> Result<fs::File> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mim")?;
    let dir = xdg_dirs.get_state_home();
    fs::create_dir_all(&dir)?;
    let path = dir.join("mim.log");
    let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(file)
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mim=debug"))
}

/// Initialize structured logging to `~/.local/state/mim/mim.log`, or to
/// stderr when the state dir cannot be opened.
pub fn init_logging() -> Result<()> {
    let file = match open_log_file() {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("mim: log file unavailable ({e:#}); logging to stderr");
            None
        }
    };
    let to_file = file.is_some();

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(SinkMaker(file))
        .with_ansi(false)
        .init();

    if to_file {
        tracing::info!("mim logging initialized");
    }
    Ok(())
}

/// Stderr-only init for contexts that must not touch the state dir.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
