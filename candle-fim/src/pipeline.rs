//! Drives prompts through a [`Generator`] batch by batch and streams the
//! decoded continuations to a [`RecordWriter`].
use std::io::Write;

use indicatif::ProgressBar;

use crate::batcher::Batcher;
use crate::generation::Generator;
use crate::writer::{Completion, RecordWriter};
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub records: usize,
    /// Records written empty because decoding failed.
    pub failures: usize,
}

/// Writes exactly one record per prompt, in prompt order. Decode failures
/// are logged and written as empty records; generation and write errors
/// abort the run, as does a zero `batch_size`.
pub fn run<G: Generator, W: Write>(
    prompts: &[String],
    batch_size: usize,
    generator: &mut G,
    writer: &mut RecordWriter<W>,
    progress: &ProgressBar,
) -> Result<RunSummary> {
    if batch_size == 0 {
        return Err(Error::Config("batch size must be at least 1".to_string()));
    }
    let mut summary = RunSummary::default();
    for batch in Batcher::new(prompts.iter().cloned(), batch_size) {
        let generated = generator.generate(&batch)?;
        if generated.len() != batch.len() {
            return Err(Error::Generation(format!(
                "got {} sequences for a batch of {} prompts",
                generated.len(),
                batch.len()
            )));
        }
        for ids in generated.iter() {
            let completion = match generator.decode(ids) {
                Ok(text) => Completion::Text(text),
                Err(err) => {
                    tracing::warn!(record = summary.records, "decoding failed: {err}");
                    summary.failures += 1;
                    Completion::Failed(err.to_string())
                }
            };
            writer.write(&completion)?;
            summary.records += 1;
        }
        summary.batches += 1;
        progress.inc(1);
        tracing::debug!(
            batch = summary.batches,
            records = summary.records,
            "batch written"
        );
    }
    Ok(summary)
}
