//! bias-probes CLI: probe training and SAE evaluation

use anyhow::{bail, Result};
use bias_probes::classes::class_name;
use bias_probes::corpus::{fetch_dataset_file, BIAS_IN_BIOS_DATASET, PILE_10K_DATASET};
use bias_probes::{
    ae_group_paths, ae_paths, eval_saes, load_text_inputs, parquet_split_file, ActivationModel,
    BiasInBios, EvalConfig, Experiment, ExperimentConfig, IoMode, ProbeModel, SubmoduleTrainers,
    PARQUET_REVISION,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "bias-probes")]
#[command(about = "Profession and gender probes on language model activations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Model ID from `HuggingFace` (LLaMA-family or Qwen2)
    #[arg(short, long, global = true, default_value = "HuggingFaceTB/SmolLM2-135M")]
    model: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Train one probe per bias-in-bios profession
    TrainProbes(TrainArgs),
    /// Score trained sparse autoencoders on a text corpus
    EvalSaes(EvalArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Local train split (Parquet, JSON Lines or JSON array of {hard_text, profession, gender})
    #[arg(long, requires = "test")]
    train: Option<PathBuf>,

    /// Local test split
    #[arg(long, requires = "train")]
    test: Option<PathBuf>,

    /// HuggingFace dataset to fetch the splits from when no local files are given
    #[arg(long, default_value = BIAS_IN_BIOS_DATASET)]
    dataset: String,

    /// Dataset branch to fetch from
    #[arg(long, default_value = PARQUET_REVISION)]
    revision: String,

    /// Train split file in the dataset (default: its Parquet export)
    #[arg(long)]
    train_file: Option<String>,

    /// Test split file in the dataset (default: its Parquet export)
    #[arg(long)]
    test_file: Option<String>,

    #[arg(long, default_value_t = 1000)]
    train_set_size: usize,

    #[arg(long, default_value_t = 1000)]
    test_set_size: usize,

    #[arg(long, default_value_t = 128)]
    context_length: usize,

    #[arg(long, default_value_t = 50)]
    probe_batch_size: usize,

    #[arg(long, default_value_t = 20)]
    llm_batch_size: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 1e-2)]
    lr: f64,

    /// Layer to probe (default: the model's probe layer)
    #[arg(long)]
    layer: Option<usize>,

    /// Skip the male / female / professor / nurse groups
    #[arg(long)]
    no_paired_classes: bool,

    /// Output directory for probe checkpoints
    #[arg(short, long, default_value = "trained_bib_probes")]
    output: PathBuf,

    /// Do not write probes to disk
    #[arg(long)]
    no_save: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args)]
struct EvalArgs {
    /// Root directory of trained dictionaries
    #[arg(long, default_value = "dictionaries")]
    dictionaries: PathBuf,

    /// Model directory prefix inside the dictionaries root
    #[arg(long, default_value = "smollm135m")]
    model_location: String,

    #[arg(long, default_value = "_sweep0709")]
    sweep_name: String,

    /// Submodule directories to evaluate
    #[arg(long, value_delimiter = ',', default_value = "resid_post_layer_15")]
    submodules: Vec<String>,

    /// Trainer ids evaluated in every submodule
    #[arg(long, value_delimiter = ',', default_value = "10")]
    trainer_ids: Vec<usize>,

    /// Local text corpus (Parquet or JSON Lines of {text})
    #[arg(long)]
    texts: Option<PathBuf>,

    /// HuggingFace dataset to fetch the text corpus from when no local file is given
    #[arg(long, default_value = PILE_10K_DATASET)]
    text_dataset: String,

    /// Dataset branch to fetch from
    #[arg(long, default_value = PARQUET_REVISION)]
    text_revision: String,

    /// Corpus file in the dataset (default: the train split of its Parquet export)
    #[arg(long)]
    text_file: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    n_inputs: usize,

    #[arg(long, default_value_t = 128)]
    context_length: usize,

    #[arg(long, default_value_t = 16)]
    llm_batch_size: usize,

    #[arg(long, default_value_t = 16)]
    sae_batch_size: usize,

    /// Contexts held by the activation buffer
    #[arg(long, default_value_t = 512)]
    buffer_size: usize,

    /// Evaluate transcoders (encode the layer input, reconstruct its output)
    #[arg(long)]
    transcoder: bool,

    /// Layer override (default: the layer in each dictionary config)
    #[arg(long)]
    layer: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loading model...");
    let model = ProbeModel::from_pretrained_with_device(&cli.model, cli.cpu)?;
    info!(
        "Model: {} layers, {} hidden",
        model.n_layers(),
        model.d_model()
    );

    match cli.command {
        Command::TrainProbes(args) => train_probes(model, args),
        Command::EvalSaes(args) => evaluate_saes(&model, args),
    }
}

fn train_probes(model: ProbeModel, args: TrainArgs) -> Result<()> {
    let corpus = match (&args.train, &args.test) {
        (Some(train), Some(test)) => BiasInBios::load(train, test)?,
        _ => {
            let train_file = args.train_file.unwrap_or_else(|| parquet_split_file("train"));
            let test_file = args.test_file.unwrap_or_else(|| parquet_split_file("test"));
            BiasInBios::from_hub(&args.dataset, &args.revision, &train_file, &test_file)?
        }
    };
    if corpus.is_empty() {
        bail!("bias-in-bios corpus is empty");
    }

    let config = ExperimentConfig {
        train_set_size: args.train_set_size,
        test_set_size: args.test_set_size,
        context_length: args.context_length,
        probe_batch_size: args.probe_batch_size,
        llm_batch_size: args.llm_batch_size,
        epochs: args.epochs,
        lr: args.lr,
        include_paired_classes: !args.no_paired_classes,
        layer: args.layer,
        probe_dir: args.output,
        save_results: !args.no_save,
        seed: args.seed,
    };

    let experiment = Experiment::new(Box::new(model), config);
    let results = experiment.run(&corpus)?;

    println!("\n=== Test accuracy (layer {}) ===", results.layer);
    for (class, accuracy) in &results.test_accuracies {
        let name = class_name(*class).unwrap_or("unknown");
        println!("{class:3} {name:20} {:.1}%", accuracy * 100.0);
    }
    if let Some(path) = &results.checkpoint {
        println!("\nProbes saved to {}", path.display());
    }
    Ok(())
}

fn evaluate_saes(model: &ProbeModel, args: EvalArgs) -> Result<()> {
    let texts_path = match &args.texts {
        Some(path) => path.clone(),
        None => {
            let file = args
                .text_file
                .clone()
                .unwrap_or_else(|| parquet_split_file("train"));
            fetch_dataset_file(&args.text_dataset, &args.text_revision, &file)?
        }
    };
    let texts = load_text_inputs(&texts_path, args.n_inputs, args.context_length)?;
    info!("Loaded {} input texts", texts.len());

    let submodule_trainers: SubmoduleTrainers = args
        .submodules
        .iter()
        .map(|s| (s.clone(), args.trainer_ids.clone()))
        .collect();
    let groups = ae_group_paths(
        &args.dictionaries,
        &args.model_location,
        &args.sweep_name,
        &submodule_trainers,
    );
    let paths = ae_paths(&groups);

    let config = EvalConfig {
        n_inputs: args.n_inputs,
        context_length: args.context_length,
        llm_batch_size: args.llm_batch_size,
        sae_batch_size: args.sae_batch_size,
        buffer_size: args.buffer_size,
        io: if args.transcoder {
            IoMode::InAndOut
        } else {
            IoMode::Out
        },
        layer: args.layer,
        ..Default::default()
    };

    if let Some(results) = eval_saes(model, &paths, &texts, &config)? {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}
