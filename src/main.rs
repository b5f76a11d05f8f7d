use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use price_engine::{
    commands::{
        estimate, evaluate_bootstrap, evaluate_models, export_lightgbm, generate_oof, model_info,
        monitor_report, record_truth, save_baseline, train_all, train_bootstrap, train_meta,
        train_specialists, train_unified,
    },
    config::EngineSettings,
    context::AppContext,
    models::Platform,
};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "price-engine")]
#[command(about = "Trains and serves the book price estimation ensemble")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train per-platform specialist models
    TrainSpecialists {
        /// Platform to train (repeatable; defaults to every platform)
        #[arg(long = "platform", value_name = "PLATFORM")]
        platforms: Vec<Platform>,
        /// Keep going when a platform fails for reasons other than insufficient data
        #[arg(long)]
        allow_partial: bool,
        /// Training data file (defaults to TRAINING_DATA_FILE)
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Train the unified fallback model on canonical prices
    TrainUnified {
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Generate grouped out-of-fold specialist predictions for the stacking model
    GenerateOof {
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Train the stacking meta-model from saved out-of-fold predictions
    TrainMeta,
    /// Train the bootstrap ensemble used for prediction intervals
    TrainBootstrap {
        /// Number of ensemble members (defaults to BOOTSTRAP_MODELS)
        #[arg(long = "models", value_name = "N")]
        models: Option<usize>,
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Run the whole training pipeline in dependency order
    TrainAll {
        #[arg(long)]
        allow_partial: bool,
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Estimate prices for a book signal (or an array of them) read from a JSON file
    Estimate {
        #[arg(short, long = "input", value_name = "PATH")]
        input: PathBuf,
    },
    /// Report interval coverage of the deployed bootstrap ensemble on labelled data
    EvaluateBootstrap {
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Compare the unified model, bootstrap mean and routed estimator on labelled data
    EvaluateModels {
        #[arg(long = "data", value_name = "PATH")]
        data: Option<PathBuf>,
    },
    /// Record the realised price for a served prediction
    RecordTruth {
        #[arg(long = "id", value_name = "UUID")]
        id: Uuid,
        #[arg(long = "price", value_name = "PRICE")]
        price: f64,
    },
    /// Save recent served predictions of one model as its drift baseline
    SaveBaseline {
        #[arg(long = "model", value_name = "NAME")]
        model: String,
        #[arg(long = "hours", value_name = "N", default_value_t = 168)]
        hours: i64,
    },
    /// Report served-prediction metrics and drift alerts
    MonitorReport {
        /// Model to check against its baseline (metrics cover every model when omitted)
        #[arg(long = "model", value_name = "NAME")]
        model: Option<String>,
        #[arg(long = "hours", value_name = "N", default_value_t = 24)]
        hours: i64,
    },
    /// Print the deployed models and their training metrics
    ModelInfo,
    /// Export a tree model artifact as LightGBM model text
    ExportLightgbm {
        /// Model artifact directory
        #[arg(long = "model", value_name = "DIR")]
        model: PathBuf,
        /// Destination file for the model text
        #[arg(short, long = "output", value_name = "PATH")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("Failed to load .env: {err}");
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings_map: HashMap<String, String> = env::vars().collect();
    let settings = EngineSettings::from_settings_map(&settings_map)?;
    configure_thread_pool(settings.training_threads);

    let app_context = AppContext::initialize(settings).await?;
    info!(
        "Starting price engine (models under {})",
        app_context.store().root().display()
    );

    let outcome = dispatch(&app_context, command).await;
    app_context.shutdown();
    outcome
}

async fn dispatch(app_context: &AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::TrainSpecialists {
            platforms,
            allow_partial,
            data,
        } => {
            train_specialists::run(app_context, &platforms, allow_partial, data.as_deref()).await?;
        }
        Commands::TrainUnified { data } => {
            train_unified::run(app_context, data.as_deref()).await?;
        }
        Commands::GenerateOof { data } => {
            generate_oof::run(app_context, data.as_deref()).await?;
        }
        Commands::TrainMeta => {
            train_meta::run(app_context).await?;
        }
        Commands::TrainBootstrap { models, data } => {
            train_bootstrap::run(app_context, models, data.as_deref()).await?;
        }
        Commands::TrainAll {
            allow_partial,
            data,
        } => {
            train_all::run(app_context, allow_partial, data.as_deref()).await?;
        }
        Commands::Estimate { input } => {
            estimate::run(app_context, &input).await?;
        }
        Commands::EvaluateBootstrap { data } => {
            evaluate_bootstrap::run(app_context, data.as_deref()).await?;
        }
        Commands::EvaluateModels { data } => {
            evaluate_models::run(app_context, data.as_deref()).await?;
        }
        Commands::RecordTruth { id, price } => {
            record_truth::run(app_context, id, price).await?;
        }
        Commands::SaveBaseline { model, hours } => {
            save_baseline::run(app_context, &model, hours).await?;
        }
        Commands::MonitorReport { model, hours } => {
            monitor_report::run(app_context, model.as_deref(), hours).await?;
        }
        Commands::ModelInfo => {
            model_info::run(app_context).await?;
        }
        Commands::ExportLightgbm { model, output } => {
            export_lightgbm::run(app_context, &model, &output).await?;
        }
    }

    Ok(())
}

fn configure_thread_pool(threads: usize) {
    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        warn!("Rayon thread pool already configured: {err}");
    }
}
