//! Service log sinks and supervisor tracing setup.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use tracing_subscriber::EnvFilter;

/// Log destination of a single service.
pub trait ServiceLog: Send + Sync {
    /// Opens a writer appending to the log.
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;
}

/// Hands out per-service log sinks.
pub trait LoggingManager: Send + Sync {
    fn service_log(&self, id: &str) -> Box<dyn ServiceLog>;
}

/// Writes each service to `<dir>/<id>.log`.
#[derive(Debug, Clone)]
pub struct FileLoggingManager {
    dir: PathBuf,
}

impl FileLoggingManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }
}

impl LoggingManager for FileLoggingManager {
    fn service_log(&self, id: &str) -> Box<dyn ServiceLog> {
        Box::new(FileServiceLog {
            path: self.log_path(id),
        })
    }
}

struct FileServiceLog {
    path: PathBuf,
}

impl ServiceLog for FileServiceLog {
    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }
}

/// Discards all service output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLoggingManager;

impl LoggingManager for NullLoggingManager {
    fn service_log(&self, _id: &str) -> Box<dyn ServiceLog> {
        Box::new(NullServiceLog)
    }
}

struct NullServiceLog;

impl ServiceLog for NullServiceLog {
    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(io::sink()))
    }
}

/// Duplicates writes into two sinks; used to mirror service logs to the console.
pub struct Tee<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.primary.write(buf)?;
        // console mirroring is best effort
        let _ = self.secondary.write_all(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.secondary.flush();
        self.primary.flush()
    }
}

/// Opens the service log, mirrored to stdout when `debug` is set.
pub fn open_service_log(
    manager: &dyn LoggingManager,
    id: &str,
    debug: bool,
) -> io::Result<Box<dyn Write + Send>> {
    let writer = manager.service_log(id).writer()?;
    if debug {
        Ok(Box::new(Tee::new(writer, io::stdout())))
    } else {
        Ok(writer)
    }
}

/// Returns the last `lines` lines of a log file.
pub fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);
    Ok(all_lines[start..].to_vec())
}

/// Installs the global tracing subscriber. `level` overrides `RUST_LOG`.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
