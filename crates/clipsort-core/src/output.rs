//! Report output for a finished job in JSON or JSON Lines.
//!
//! JSON writes one document holding the job state, every result and the
//! aggregates. JSON Lines writes one result per line, then a single
//! `{"summary": ...}` line, so it can be streamed while a job runs.

use serde::Serialize;
use std::io::{self, Write};

use crate::types::{Distribution, JobState, PhotoResult, ValueStats};

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON document
    Json,
    /// One JSON object per line (newline-delimited JSON)
    JsonLines,
}

impl OutputFormat {
    /// Parse format from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "jsonl" | "jsonlines" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// Aggregates written after the results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job: Option<JobState>,
    pub distribution: Distribution,
    pub value_stats: ValueStats,
}

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    summary: &'a JobSummary,
    results: &'a [PhotoResult],
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    summary: &'a JobSummary,
}

/// Serializes job results to a writer.
pub struct OutputWriter<W: Write> {
    writer: W,
    format: OutputFormat,
    pretty: bool,
    results_written: usize,
}

impl<W: Write> OutputWriter<W> {
    /// `pretty` only affects the JSON format.
    pub fn new(writer: W, format: OutputFormat, pretty: bool) -> Self {
        Self {
            writer,
            format,
            pretty,
            results_written: 0,
        }
    }

    fn write_value<T: Serialize>(&mut self, item: &T, pretty: bool) -> io::Result<()> {
        if pretty {
            serde_json::to_writer_pretty(&mut self.writer, item).map_err(io::Error::other)?;
        } else {
            serde_json::to_writer(&mut self.writer, item).map_err(io::Error::other)?;
        }
        writeln!(self.writer)
    }

    /// Write one result as its own line. JSON Lines only.
    pub fn write_result(&mut self, result: &PhotoResult) -> io::Result<()> {
        if self.format != OutputFormat::JsonLines {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "per-result output needs the jsonl format",
            ));
        }
        self.write_value(result, false)?;
        self.results_written += 1;
        Ok(())
    }

    /// Write a complete report.
    pub fn write_report(&mut self, results: &[PhotoResult], summary: &JobSummary) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                let report = Report { summary, results };
                self.write_value(&report, self.pretty)?;
                self.results_written += results.len();
            }
            OutputFormat::JsonLines => {
                for result in results {
                    self.write_result(result)?;
                }
                self.write_value(&SummaryLine { summary }, false)?;
            }
        }
        Ok(())
    }

    pub fn results_written(&self) -> usize {
        self.results_written
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Consume the writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
