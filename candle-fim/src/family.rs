//! Model families and tasks, selected once at startup.
use crate::{Error, Result};

/// End-of-sequence id used by the fill-in-the-middle runs (`<|EOT|>` in the
/// DeepSeek-coder vocabulary).
pub const FIM_EOS_TOKEN_ID: u32 = 32021;

/// The checkpoint family decides both the prompt layout and the pad token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelFamily {
    /// `<｜fim▁begin｜>…<｜fim▁hole｜>…<｜fim▁end｜>` prompts.
    #[value(name = "deepseek")]
    DeepSeek,
    /// `▁<PRE>…▁<SUF>…▁<MID>` prompts, eos doubles as pad.
    #[value(name = "codellama")]
    CodeLlama,
}

impl ModelFamily {
    /// Anything that does not mention `deepseek` is treated as CodeLlama.
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.contains("deepseek") {
            Self::DeepSeek
        } else {
            Self::CodeLlama
        }
    }

    /// Column holding this family's earlier generations, used by the judge task.
    pub fn output_column(&self) -> &'static str {
        match self {
            Self::DeepSeek => "deepseek_output",
            Self::CodeLlama => "codellama_output",
        }
    }

    pub fn pad_token_id(&self, tokens: &SpecialTokens) -> u32 {
        match self {
            Self::DeepSeek => tokens.pad.unwrap_or(tokens.eos),
            Self::CodeLlama => tokens.eos,
        }
    }

    pub fn eos_token_id(&self, task: Task, tokens: &SpecialTokens) -> u32 {
        match (self, task) {
            (_, Task::Baseline) | (Self::DeepSeek, Task::Judge) => FIM_EOS_TOKEN_ID,
            (Self::CodeLlama, Task::Judge) => tokens.eos,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeepSeek => write!(f, "deepseek"),
            Self::CodeLlama => write!(f, "codellama"),
        }
    }
}

/// What the model is asked to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// Fill the masked function body.
    Baseline,
    /// Continue a prompt that already holds a candidate body, expecting a
    /// correctness label.
    Judge,
}

impl std::str::FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gen_baseline" => Ok(Self::Baseline),
            "" => Err(Error::Config("empty task name".to_string())),
            _ => Ok(Self::Judge),
        }
    }
}

/// Special token ids discovered from the tokenizer files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: u32,
    pub pad: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENS: SpecialTokens = SpecialTokens {
        eos: 2,
        pad: Some(7),
    };

    #[test]
    fn family_from_model_id() {
        assert_eq!(
            ModelFamily::from_model_id("deepseek-ai/deepseek-coder-6.7b-base"),
            ModelFamily::DeepSeek
        );
        assert_eq!(
            ModelFamily::from_model_id("codellama/CodeLlama-7b-hf"),
            ModelFamily::CodeLlama
        );
        assert_eq!(
            ModelFamily::from_model_id("some-org/other-model"),
            ModelFamily::CodeLlama
        );
    }

    #[test]
    fn task_parsing() {
        assert_eq!("gen_baseline".parse::<Task>().unwrap(), Task::Baseline);
        assert_eq!("gen_judge".parse::<Task>().unwrap(), Task::Judge);
        assert!("".parse::<Task>().is_err());
    }

    #[test]
    fn stop_token_policy() {
        use ModelFamily::*;
        assert_eq!(DeepSeek.eos_token_id(Task::Baseline, &TOKENS), FIM_EOS_TOKEN_ID);
        assert_eq!(DeepSeek.eos_token_id(Task::Judge, &TOKENS), FIM_EOS_TOKEN_ID);
        assert_eq!(CodeLlama.eos_token_id(Task::Baseline, &TOKENS), FIM_EOS_TOKEN_ID);
        assert_eq!(CodeLlama.eos_token_id(Task::Judge, &TOKENS), 2);
    }

    #[test]
    fn pad_token_policy() {
        assert_eq!(ModelFamily::DeepSeek.pad_token_id(&TOKENS), 7);
        assert_eq!(ModelFamily::CodeLlama.pad_token_id(&TOKENS), 2);
        let no_pad = SpecialTokens { eos: 5, pad: None };
        assert_eq!(ModelFamily::DeepSeek.pad_token_id(&no_pad), 5);
    }
}
