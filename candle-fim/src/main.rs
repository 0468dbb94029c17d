use anyhow::{bail, Context, Error as E, Result};
use candle::DType;
use candle_nn::VarBuilder;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;

use candle_fim::batcher::batch_count;
use candle_fim::dataset::DatasetSource;
use candle_fim::family::{ModelFamily, Task};
use candle_fim::generation::{GenerationConfig, LlamaGenerator, PaddingPolicy};
use candle_fim::hub::{self, AdapterFiles, FileSource, ModelFiles};
use candle_fim::lora::LoraAdapter;
use candle_fim::model::{Llama, LlamaConfig, LoadOptions};
use candle_fim::pipeline;
use candle_fim::prompt::PromptBuilder;
use candle_fim::writer::RecordWriter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// `gen_baseline` fills masked bodies, any other value builds judge prompts.
    #[arg(long, default_value = "gen_baseline")]
    task: String,

    #[arg(long = "batch_size", default_value_t = 2)]
    batch_size: usize,

    /// Quantize the decoder projections to 8 bits.
    #[arg(long = "load_in_8bit")]
    load_in_8bit: bool,

    /// LoRA adapter directory or Hub id, empty for none.
    #[arg(long = "model_peft", default_value = "")]
    model_peft: String,

    /// Hub id or local directory of the base model.
    #[arg(long = "model_id", default_value = "deepseek-ai/deepseek-coder-6.7b-base")]
    model_id: String,

    /// Hub dataset id, or a local .jsonl/.json/.parquet file.
    #[arg(long = "dataset_id", default_value = "zhaospei/smart-contract-gen")]
    dataset_id: String,

    /// Completions are appended to this file.
    #[arg(long = "output_file", default_value = "gen.output")]
    output_file: String,

    /// Prompts longer than this many tokens are truncated.
    #[arg(long = "max_length", default_value_t = 2048)]
    max_length: usize,

    /// `longest` pads each batch to its longest prompt, anything else pads
    /// to `max_length`.
    #[arg(long, default_value = "longest")]
    padding: String,

    #[arg(long = "max_new_tokens", default_value_t = 128)]
    max_new_tokens: usize,

    #[arg(long = "data_split", default_value = "test")]
    data_split: String,

    /// Overrides the family guessed from the model id.
    #[arg(long = "model_family", value_enum)]
    model_family: Option<ModelFamily>,

    #[arg(long, default_value = "main")]
    revision: String,

    /// bf16, f16 or f32.
    #[arg(long)]
    dtype: Option<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// The temperature used to generate samples, 0 means greedy decoding.
    #[arg(long, default_value_t = 0.)]
    temperature: f64,

    /// Nucleus sampling probability cutoff.
    #[arg(long = "top_p")]
    top_p: Option<f64>,

    /// Only sample among the top K samples.
    #[arg(long = "top_k")]
    top_k: Option<usize>,

    /// The seed to use when generating random samples.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Only process the first rows of the split.
    #[arg(long)]
    limit: Option<usize>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(fmt_layer);
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    if args.batch_size == 0 {
        bail!("--batch_size must be at least 1")
    }
    let task: Task = args.task.parse()?;
    let family = args
        .model_family
        .unwrap_or_else(|| ModelFamily::from_model_id(&args.model_id));
    tracing::info!(?task, %family, model_id = %args.model_id, "starting");

    let source = DatasetSource::new(&args.dataset_id, &args.data_split);
    let mut rows = source
        .load()
        .with_context(|| format!("loading dataset {source}"))?;
    if let Some(limit) = args.limit {
        rows.truncate(limit)
    }
    let prompts = PromptBuilder::new(family, task)
        .build_all(&rows)
        .context("building prompts")?;
    tracing::info!(rows = prompts.len(), "prompts ready");

    let device = candle_fim::device(args.cpu)?;
    let dtype = match args.dtype.as_deref() {
        Some("f16") => DType::F16,
        Some("bf16") | None => DType::BF16,
        Some("f32") => DType::F32,
        Some(dtype) => bail!("Unsupported dtype {dtype}"),
    };

    let model_source = FileSource::new(&args.model_id, &args.revision)?;
    let files = ModelFiles::resolve(&model_source)
        .with_context(|| format!("resolving model files for {}", args.model_id))?;
    let raw_config = hub::read_json(&files.config)?;
    let config: LlamaConfig = serde_json::from_value(raw_config.clone())?;
    let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(E::msg)?;
    let tokenizer_config = files
        .tokenizer_config
        .as_deref()
        .map(hub::read_json)
        .transpose()?;
    let tokens = hub::special_tokens(&tokenizer, tokenizer_config.as_ref(), &raw_config)?;

    let adapter = if args.model_peft.is_empty() {
        None
    } else {
        let adapter_source = FileSource::new(&args.model_peft, "main")?;
        let adapter_files = AdapterFiles::resolve(&adapter_source)
            .with_context(|| format!("resolving adapter {}", args.model_peft))?;
        Some(LoraAdapter::load(&adapter_files, &device)?)
    };
    let opts = LoadOptions {
        quantize: args.load_in_8bit,
        adapter,
    };
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
    let model = Llama::load(&config, vb, &opts)?;

    let generation_config = GenerationConfig {
        max_new_tokens: args.max_new_tokens,
        max_length: args.max_length,
        padding: PaddingPolicy::from_flag(&args.padding),
        eos_token_id: family.eos_token_id(task, &tokens),
        pad_token_id: family.pad_token_id(&tokens),
        temperature: args.temperature,
        top_p: args.top_p,
        top_k: args.top_k,
        seed: args.seed,
    };
    tracing::info!(
        eos = generation_config.eos_token_id,
        pad = generation_config.pad_token_id,
        padding = ?generation_config.padding,
        "generation config"
    );
    let mut generator = LlamaGenerator::new(model, tokenizer, generation_config)?;

    let mut writer = RecordWriter::append(&args.output_file)
        .with_context(|| format!("opening {}", args.output_file))?;
    let progress = ProgressBar::new(batch_count(prompts.len(), args.batch_size) as u64);
    progress.set_style(ProgressStyle::with_template(
        "{elapsed_precise} [{bar:40}] {pos}/{len} batches ({eta})",
    )?);

    let summary = pipeline::run(
        &prompts,
        args.batch_size,
        &mut generator,
        &mut writer,
        &progress,
    )?;
    progress.finish();
    tracing::info!(
        records = summary.records,
        failures = summary.failures,
        output = %args.output_file,
        "done"
    );
    Ok(())
}
