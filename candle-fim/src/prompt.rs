//! Prompt layouts for the two fill-in-the-middle families.
use crate::dataset::ContractRow;
use crate::family::{ModelFamily, Task};
use crate::{Error, Result};

/// Placeholder for the hidden function body in the dataset.
pub const FILL_MARKER: &str = "<FILL_FUNCTION_BODY>";

pub const FIM_BEGIN: &str = "<｜fim▁begin｜>";
pub const FIM_HOLE: &str = "<｜fim▁hole｜>";
pub const FIM_END: &str = "<｜fim▁end｜>";

pub const PSM_PREFIX: &str = "▁<PRE>";
pub const PSM_SUFFIX: &str = "▁<SUF>";
pub const PSM_MIDDLE: &str = "▁<MID>";

/// Appended after a candidate body, the model continues with its verdict.
pub const CORRECT_SENTINEL: &str = "<correct>";

fn split_at_marker(masked: &str) -> Result<(&str, &str)> {
    let found = masked.matches(FILL_MARKER).count();
    if found != 1 {
        return Err(Error::FillMarker { found });
    }
    match masked.split_once(FILL_MARKER) {
        Some(parts) => Ok(parts),
        None => Err(Error::FillMarker { found: 0 }),
    }
}

/// `<｜fim▁begin｜>prefix<｜fim▁hole｜>suffix<｜fim▁end｜>`
pub fn fim_prompt(masked: &str) -> Result<String> {
    let (prefix, suffix) = split_at_marker(masked)?;
    Ok(format!("{FIM_BEGIN}{prefix}{FIM_HOLE}{suffix}{FIM_END}"))
}

/// `▁<PRE>prefix▁<SUF>suffix▁<MID>`
pub fn psm_prompt(masked: &str) -> Result<String> {
    let (prefix, suffix) = split_at_marker(masked)?;
    Ok(format!("{PSM_PREFIX}{prefix}{PSM_SUFFIX}{suffix}{PSM_MIDDLE}"))
}

pub fn continuation_prompt(base: &str, candidate: &str) -> String {
    format!("{base}\n{candidate}\n{CORRECT_SENTINEL}")
}

/// Builds prompts for one family and task.
#[derive(Clone, Copy, Debug)]
pub struct PromptBuilder {
    family: ModelFamily,
    task: Task,
}

impl PromptBuilder {
    pub fn new(family: ModelFamily, task: Task) -> Self {
        Self { family, task }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn base_prompt(&self, masked: &str) -> Result<String> {
        match self.family {
            ModelFamily::DeepSeek => fim_prompt(masked),
            ModelFamily::CodeLlama => psm_prompt(masked),
        }
    }

    /// `index` is only used to point at the offending row in errors.
    pub fn build(&self, index: usize, row: &ContractRow) -> Result<String> {
        let base = self.base_prompt(&row.masked_contract)?;
        match self.task {
            Task::Baseline => Ok(base),
            Task::Judge => {
                let candidate =
                    row.prior_output(self.family)
                        .ok_or_else(|| Error::MissingColumn {
                            row: index,
                            column: self.family.output_column(),
                        })?;
                Ok(continuation_prompt(&base, candidate))
            }
        }
    }

    pub fn build_all(&self, rows: &[ContractRow]) -> Result<Vec<String>> {
        rows.iter()
            .enumerate()
            .map(|(index, row)| self.build(index, row))
            .collect()
    }
}
