use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Serialize;
use tracing::warn;

use crate::types::now_ms;

const CSV_FLUSH_EVERY_RECORDS: usize = 200;
const JSONL_FLUSH_EVERY_LINES: usize = 100;
const FLUSH_EVERY_MS: u64 = 1_000;

/// Append-only CSV file with a fixed header. An existing file whose header differs is moved
/// aside before a fresh one is started.
pub struct CsvAppender {
    writer: csv::Writer<BufWriter<File>>,
    pending_records: usize,
    last_flush_ms: u64,
}

impl CsvAppender {
    pub fn open(path: impl AsRef<Path>, header: &[&str]) -> anyhow::Result<Self> {
        let path = path.as_ref();
        rotate_on_header_mismatch(path, &header.join(","))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        if is_empty {
            writer
                .write_record(header)
                .with_context(|| format!("write header {}", path.display()))?;
            writer
                .flush()
                .with_context(|| format!("flush {}", path.display()))?;
        }

        Ok(Self {
            writer,
            pending_records: 0,
            last_flush_ms: now_ms(),
        })
    }

    pub fn write_record<I, S>(&mut self, record: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer.write_record(record)?;
        self.pending_records = self.pending_records.saturating_add(1);

        let now = now_ms();
        if self.pending_records >= CSV_FLUSH_EVERY_RECORDS
            || now.saturating_sub(self.last_flush_ms) >= FLUSH_EVERY_MS
        {
            self.writer.flush()?;
            self.pending_records = 0;
            self.last_flush_ms = now;
        }
        Ok(())
    }

    pub fn flush_and_sync(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        self.pending_records = 0;
        self.last_flush_ms = now_ms();
        self.writer
            .get_ref()
            .get_ref()
            .sync_all()
            .context("sync csv file")?;
        Ok(())
    }
}

fn rotate_on_header_mismatch(path: &Path, expected: &str) -> anyhow::Result<()> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() == 0 {
        return Ok(());
    }

    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut first = String::new();
    BufReader::new(f)
        .read_line(&mut first)
        .with_context(|| format!("read header {}", path.display()))?;
    if first.trim_end() == expected {
        return Ok(());
    }

    let backup = suffixed_path(path, "schema_mismatch");
    std::fs::rename(path, &backup).with_context(|| {
        format!(
            "rotate schema-mismatched csv {} -> {}",
            path.display(),
            backup.display()
        )
    })?;
    warn!(
        path = %path.display(),
        backup = %backup.display(),
        "csv schema mismatch; rotated file"
    );
    Ok(())
}

fn suffixed_path(path: &Path, tag: &str) -> PathBuf {
    let base_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    path.with_file_name(format!("{base_name}.{tag}_{}", now_ms()))
}

/// Append-only JSON-lines file (heartbeats, dead letters).
pub struct JsonlAppender {
    out: BufWriter<File>,
    pending_lines: usize,
    last_flush_ms: u64,
}

impl JsonlAppender {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            pending_lines: 0,
            last_flush_ms: now_ms(),
        })
    }

    pub fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.pending_lines = self.pending_lines.saturating_add(1);

        let now = now_ms();
        if self.pending_lines >= JSONL_FLUSH_EVERY_LINES
            || now.saturating_sub(self.last_flush_ms) >= FLUSH_EVERY_MS
        {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> anyhow::Result<()> {
        let line = serde_json::to_string(value).context("serialize jsonl line")?;
        self.write_line(&line)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        self.pending_lines = 0;
        self.last_flush_ms = now_ms();
        Ok(())
    }

    pub fn flush_and_sync(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        self.out.get_ref().sync_all().context("sync jsonl file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tradevol_recorder_{}_{}", std::process::id(), name))
    }

    #[test]
    fn csv_header_is_written_once() {
        let path = temp_path("once.csv");
        let _ = std::fs::remove_file(&path);
        {
            let mut w = CsvAppender::open(&path, &["a", "b"]).expect("open");
            w.write_record(["1", "2"]).expect("write");
            w.flush_and_sync().expect("sync");
        }
        {
            let mut w = CsvAppender::open(&path, &["a", "b"]).expect("reopen");
            w.write_record(["3", "4"]).expect("write");
            w.flush_and_sync().expect("sync");
        }
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw, "a,b\n1,2\n3,4\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn csv_with_other_header_is_rotated() {
        let path = temp_path("rotate.csv");
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, "old,header\nx,y\n").expect("seed");
        {
            let mut w = CsvAppender::open(&path, &["a", "b"]).expect("open");
            w.flush_and_sync().expect("sync");
        }
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw, "a,b\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn jsonl_appends_lines() {
        let path = temp_path("lines.jsonl");
        let _ = std::fs::remove_file(&path);
        {
            let mut w = JsonlAppender::open(&path).expect("open");
            w.write_json(&serde_json::json!({"n": 1})).expect("write");
            w.write_line(r#"{"n":2}"#).expect("write");
            w.flush_and_sync().expect("sync");
        }
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
