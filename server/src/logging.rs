use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::twitch::sink::CHAT_RECORD_MARKER;

/// Append-only log file that rolls over to `<name>.1 .. <name>.N` once it
/// grows past `max_bytes`. Rollover happens between writes, so a record is
/// never split across files.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            max_backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Cloneable handle so the subscriber and the [`Telemetry`] guard share one file.
#[derive(Debug, Clone)]
pub struct SharedLogFile(Arc<Mutex<RotatingFile>>);

impl SharedLogFile {
    pub fn new(file: RotatingFile) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    fn lock(&self) -> MutexGuard<'_, RotatingFile> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }
}

pub struct LogFileWriter<'a>(MutexGuard<'a, RotatingFile>);

impl Write for LogFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for SharedLogFile {
    type Writer = LogFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(self.lock())
    }
}

/// Process-wide logging. Build once in `main` and keep alive until exit;
/// dropping it flushes the JSON log file.
pub struct Telemetry {
    log_file: SharedLogFile,
    path: PathBuf,
}

impl Telemetry {
    pub fn init(config: &LoggingConfig) -> io::Result<Self> {
        let path = config.file_path();
        let log_file = SharedLogFile::new(RotatingFile::open(
            &path,
            config.max_file_bytes,
            config.max_backups,
        )?);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{},{}=info,tower_http=info",
                config.level, CHAT_RECORD_MARKER
            )
            .into()
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(json_layer(log_file.clone()))
            .try_init()
            .map_err(|e| io::Error::other(e.to_string()))?;

        Ok(Self { log_file, path })
    }

    pub fn log_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.log_file.flush();
    }
}

/// One JSON object per line with event fields flattened to the top level.
fn json_layer<S>(writer: SharedLogFile) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::sink::{ChatSink, TracingChatSink};
    use crate::twitch::types::ChatEvent;
    use std::collections::BTreeMap;

    #[test]
    fn test_rotates_and_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.log");
        let mut file = RotatingFile::open(&path, 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();

        let read = |p: &Path| fs::read_to_string(p).unwrap();
        assert_eq!(read(&path), "dddddddd\n");
        assert_eq!(read(&dir.path().join("nested/app.log.1")), "cccccccc\n");
        assert_eq!(read(&dir.path().join("nested/app.log.2")), "bbbbbbbb\n");
        assert!(!dir.path().join("nested/app.log.3").exists());
    }

    #[test]
    fn test_reopen_appends_and_counts_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "0123456789").unwrap();

        let mut file = RotatingFile::open(&path, 12, 1).unwrap();
        file.write_all(b"xyz\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "xyz\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("app.log.1")).unwrap(),
            "0123456789"
        );
    }

    #[test]
    fn test_chat_record_written_as_flat_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multichat.log");
        let log_file = SharedLogFile::new(RotatingFile::open(&path, 1024 * 1024, 1).unwrap());
        let subscriber = tracing_subscriber::registry().with(json_layer(log_file.clone()));

        let mut tags = BTreeMap::new();
        tags.insert("user-id".to_string(), "77".to_string());
        let sink = TracingChatSink::new(false);
        tracing::subscriber::with_default(subscriber, || {
            sink.emit(&ChatEvent {
                channel: "chan".to_string(),
                author: "alice".to_string(),
                author_id: Some("77".to_string()),
                content: "hello".to_string(),
                tags,
            });
            sink.emit(&ChatEvent {
                channel: "chan".to_string(),
                author: "bob".to_string(),
                author_id: None,
                content: "hi".to_string(),
                tags: BTreeMap::new(),
            });
        });
        log_file.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first["message"], "chat.message");
        assert_eq!(first["target"], CHAT_RECORD_MARKER);
        assert_eq!(first["level"], "INFO");
        assert_eq!(first["channel"], "chan");
        assert_eq!(first["author"], "alice");
        assert_eq!(first["author_id"], "77");
        assert_eq!(first["content"], "hello");
        let tags: BTreeMap<String, String> =
            serde_json::from_str(first["tags"].as_str().unwrap()).unwrap();
        assert_eq!(tags.get("user-id").map(String::as_str), Some("77"));

        assert!(records[1].get("author_id").is_none());
        assert_eq!(records[1]["tags"], "{}");
    }
}
