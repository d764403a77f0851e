use chrono::Utc;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// `message` value that marks a chat record in the multichat log.
pub const CHAT_RECORD_MARKER: &str = "chat.message";

const INITIAL_CHUNK: u64 = 1024;

#[derive(Debug, Default, Clone)]
pub struct Filters {
    pub channel: Option<String>,
    pub author: Option<String>,
}

impl Filters {
    fn matches(&self, record: &ChatRecord) -> bool {
        let field_matches = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            Some(wanted) => actual.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        field_matches(&self.channel, &record.channel) && field_matches(&self.author, &record.author)
    }
}

#[derive(Debug, Deserialize)]
struct ChatRecord {
    timestamp: Option<String>,
    message: Option<String>,
    channel: Option<String>,
    author: Option<String>,
    content: Option<String>,
}

impl ChatRecord {
    fn format(&self) -> String {
        let timestamp = self
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        format!(
            "{} [{}] {}: {}",
            timestamp,
            self.channel.as_deref().unwrap_or("?"),
            self.author.as_deref().unwrap_or("?"),
            self.content.as_deref().unwrap_or("")
        )
    }
}

/// Formats one log line for display, or `None` when it is not a chat record
/// or does not pass the filters.
pub fn render_line(line: &str, filters: &Filters) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: ChatRecord = serde_json::from_str(line).ok()?;
    if record.message.as_deref() != Some(CHAT_RECORD_MARKER) || !filters.matches(&record) {
        return None;
    }
    Some(record.format())
}

/// Last lines of a file plus the offset they were read up to.
#[derive(Debug)]
pub struct TailSnapshot {
    pub lines: Vec<String>,
    pub end_offset: u64,
}

/// Reads the last `n` lines by scanning backwards in growing chunks.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<TailSnapshot> {
    let mut file = File::open(path)?;
    let end_offset = file.seek(SeekFrom::End(0))?;
    if n == 0 {
        return Ok(TailSnapshot {
            lines: Vec::new(),
            end_offset,
        });
    }

    let mut end = end_offset;
    let mut chunk = INITIAL_CHUNK;
    let mut data: Vec<u8> = Vec::new();
    while end > 0 && data.iter().filter(|b| **b == b'\n').count() <= n {
        let start = end.saturating_sub(chunk);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        buf.extend_from_slice(&data);
        data = buf;
        end = start;
        chunk = chunk.saturating_mul(2);
    }

    let text = String::from_utf8_lossy(&data);
    let all: Vec<&str> = text.lines().collect();
    let lines = all[all.len().saturating_sub(n)..]
        .iter()
        .map(|line| line.to_string())
        .collect();
    Ok(TailSnapshot { lines, end_offset })
}

/// Polls a growing log file for complete new lines, starting over from the
/// top when the file shrinks (rotation or truncation).
#[derive(Debug)]
pub struct Follower {
    path: PathBuf,
    file: File,
    position: u64,
    partial: Vec<u8>,
}

impl Follower {
    pub fn open(path: impl Into<PathBuf>, position: u64) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file,
            position,
            partial: Vec::new(),
        })
    }

    pub fn poll(&mut self) -> io::Result<Vec<String>> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            // Between the rename and the new file being created.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if len < self.position {
            self.file = File::open(&self.path)?;
            self.position = 0;
            self.partial.clear();
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        self.file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        self.position += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        Ok(String::from_utf8_lossy(&complete)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chat(channel: &str, author: &str, content: &str) -> String {
        serde_json::json!({
            "timestamp": "2024-05-01T12:00:00.000000Z",
            "level": "INFO",
            "message": "chat.message",
            "target": "chat.message",
            "channel": channel,
            "author": author,
            "content": content,
            "tags": "{}"
        })
        .to_string()
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_render_formats_chat_record() {
        let line = chat("chan", "alice", "hello there");
        assert_eq!(
            render_line(&line, &Filters::default()).as_deref(),
            Some("2024-05-01T12:00:00.000000Z [chan] alice: hello there")
        );
    }

    #[test]
    fn test_render_skips_other_lines() {
        let filters = Filters::default();
        assert_eq!(render_line("", &filters), None);
        assert_eq!(render_line("not json at all", &filters), None);
        assert_eq!(
            render_line(
                r#"{"timestamp":"t","level":"INFO","message":"Chat aggregator started"}"#,
                &filters
            ),
            None
        );
    }

    #[test]
    fn test_render_applies_filters() {
        let line = chat("chan", "alice", "hi");
        let by_channel = Filters {
            channel: Some("other".to_string()),
            author: None,
        };
        let by_author = Filters {
            channel: Some("chan".to_string()),
            author: Some("alice".to_string()),
        };
        assert_eq!(render_line(&line, &by_channel), None);
        assert!(render_line(&line, &by_author).is_some());
    }

    #[test]
    fn test_render_fills_missing_fields() {
        let rendered = render_line(r#"{"message":"chat.message"}"#, &Filters::default()).unwrap();
        assert!(rendered.ends_with(" [?] ?: "), "got {rendered}");
    }

    #[test]
    fn test_tail_returns_last_lines_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multichat.log");
        let body: String = (0..200)
            .map(|i| format!("{}\n", chat("chan", "user", &format!("message number {}", i))))
            .collect();
        append(&path, &body);

        let snapshot = tail_lines(&path, 3).unwrap();
        assert_eq!(snapshot.end_offset, body.len() as u64);
        let rendered: Vec<String> = snapshot
            .lines
            .iter()
            .filter_map(|l| render_line(l, &Filters::default()))
            .collect();
        assert_eq!(rendered.len(), 3);
        assert!(rendered[0].ends_with("message number 197"));
        assert!(rendered[2].ends_with("message number 199"));
    }

    #[test]
    fn test_tail_of_short_file_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multichat.log");
        append(&path, "one\ntwo\n");

        assert_eq!(tail_lines(&path, 10).unwrap().lines, ["one", "two"]);
        assert!(tail_lines(&path, 0).unwrap().lines.is_empty());
        assert!(tail_lines(&dir.path().join("missing.log"), 5).is_err());
    }

    #[test]
    fn test_follower_yields_only_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multichat.log");
        append(&path, "old\n");
        let start = tail_lines(&path, 1).unwrap().end_offset;
        let mut follower = Follower::open(&path, start).unwrap();

        assert!(follower.poll().unwrap().is_empty());
        append(&path, "first\nsec");
        assert_eq!(follower.poll().unwrap(), ["first"]);
        append(&path, "ond\n");
        assert_eq!(follower.poll().unwrap(), ["second"]);
    }

    #[test]
    fn test_follower_reopens_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multichat.log");
        append(&path, "a fairly long line before rotation\n");
        let start = tail_lines(&path, 1).unwrap().end_offset;
        let mut follower = Follower::open(&path, start).unwrap();

        fs::rename(&path, dir.path().join("multichat.log.1")).unwrap();
        assert!(follower.poll().unwrap().is_empty());
        append(&path, "fresh\n");
        assert_eq!(follower.poll().unwrap(), ["fresh"]);
    }
}
