//! Append-only output: one record per prompt, each followed by `<nl>`.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::Result;

pub const RECORD_DELIMITER: &str = "<nl>";

/// Outcome of decoding one generated sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Text(String),
    /// Decoding failed with the given message; written as an empty record.
    Failed(String),
}

impl Completion {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Failed(_) => "",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

pub struct RecordWriter<W: Write> {
    inner: W,
    records: usize,
}

impl RecordWriter<File> {
    /// Opens `path` for appending, creating it when missing. Existing
    /// records are kept.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Writes one record and flushes it.
    pub fn write(&mut self, completion: &Completion) -> Result<()> {
        self.inner.write_all(completion.text().as_bytes())?;
        self.inner.write_all(RECORD_DELIMITER.as_bytes())?;
        self.inner.flush()?;
        self.records += 1;
        Ok(())
    }

    /// Records written through this writer.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Splits an output file back into records. A trailing fragment without a
/// delimiter is an interrupted write and is dropped.
pub fn split_records(contents: &str) -> Vec<&str> {
    let mut records: Vec<&str> = contents.split(RECORD_DELIMITER).collect();
    records.pop();
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_delimited() -> anyhow::Result<()> {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write(&Completion::Text("return a;\n}".to_string()))?;
        writer.write(&Completion::Failed("bad utf8".to_string()))?;
        writer.write(&Completion::Text("x".to_string()))?;
        assert_eq!(writer.records(), 3);
        let out = String::from_utf8(writer.into_inner())?;
        assert_eq!(out, "return a;\n}<nl><nl>x<nl>");
        assert_eq!(split_records(&out), ["return a;\n}", "", "x"]);
        Ok(())
    }

    #[test]
    fn split_drops_partial_record() {
        assert!(split_records("").is_empty());
        assert_eq!(split_records("a<nl>b"), ["a"]);
        assert_eq!(split_records("<nl>"), [""]);
    }

    #[test]
    fn append_keeps_existing_records() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.txt");
        for text in ["first", "second"] {
            let mut writer = RecordWriter::append(&path)?;
            writer.write(&Completion::Text(text.to_string()))?;
        }
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(split_records(&contents), ["first", "second"]);
        Ok(())
    }
}
