use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hostwatch::config::{HostwatchConfig, StreamKind};
use hostwatch::storage::artifact::{JsonModelStore, ModelStore};
use hostwatch::telemetry::dataset::{read_jsonl, write_jsonl};
use hostwatch::telemetry::synth::{generate, SynthSpec};
use hostwatch::telemetry::Schema;

#[derive(Parser)]
#[command(
    name = "hostwatch",
    about = "Host telemetry anomaly detection with isolation forests",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults: $HOSTWATCH_CONFIG, /etc/hostwatch/hostwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate synthetic host telemetry
    Generate {
        /// Output JSON-lines file
        #[arg(long, default_value = "data/synthetic_logs.jsonl")]
        output: PathBuf,

        /// Append to the SQLite telemetry table instead of writing a file
        #[arg(long)]
        sqlite: bool,

        /// Number of normal rows
        #[arg(long, default_value = "500")]
        normal: usize,

        /// Number of extreme rows appended after the normal ones
        #[arg(long, default_value = "10")]
        anomalies: usize,

        /// PRNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Leave out timestamps
        #[arg(long)]
        no_timestamps: bool,
    },

    /// Train an isolation forest and save the model artifact
    Train {
        /// Training data (JSON lines); reads the SQLite telemetry table if omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Where to write the model (overrides config)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Number of trees (overrides config)
        #[arg(long)]
        trees: Option<usize>,

        /// Expected anomaly fraction (overrides config)
        #[arg(long)]
        contamination: Option<f64>,

        /// PRNG seed (overrides config)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Score a dataset with a trained model and report the anomalies
    Detect {
        /// Data to score (JSON lines)
        #[arg(long)]
        input: PathBuf,

        /// Write anomalous rows here as JSON lines
        #[arg(long)]
        output: Option<PathBuf>,

        /// Model artifact (overrides config)
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Watch the telemetry stream and alert on new anomalies
    Watch {
        /// Stream kind (overrides config)
        #[arg(long, value_enum)]
        stream: Option<StreamKind>,

        /// JSON-lines stream path (overrides config)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Model artifact (overrides config)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Polling interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<f64>,

        /// Start from the beginning of the stream instead of the saved cursor
        #[arg(long)]
        from_start: bool,
    },

    /// List recent alerts
    Alerts {
        /// Maximum number of alerts
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(config: &HostwatchConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn ensure_parent(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn open_db(config: &HostwatchConfig) -> Result<hostwatch::storage::Pool> {
    ensure_parent(&config.storage.db_path)?;
    hostwatch::storage::open_pool(&config.storage.db_path.to_string_lossy())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HostwatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Generate {
            output,
            sqlite,
            normal,
            anomalies,
            seed,
            no_timestamps,
        } => {
            let records = generate(&SynthSpec {
                normal,
                anomalies,
                seed,
                include_timestamps: !no_timestamps,
                ..SynthSpec::default()
            });
            if sqlite {
                let pool = open_db(&config)?;
                hostwatch::storage::append_telemetry(&pool, &records)?;
                println!(
                    "[✔] Appended {} synthetic logs to {}",
                    records.len(),
                    config.storage.db_path.display()
                );
            } else {
                ensure_parent(&output)?;
                write_jsonl(&output, &records)?;
                println!("[✔] Saved {} synthetic logs to {}", records.len(), output.display());
            }
        }
        Commands::Train {
            input,
            model,
            trees,
            contamination,
            seed,
        } => {
            if let Some(t) = trees {
                config.training.tree_count = t;
            }
            if let Some(c) = contamination {
                config.training.contamination_rate = c;
            }
            if let Some(s) = seed {
                config.training.seed = s;
            }
            let model_path = model.unwrap_or_else(|| config.model.path.clone());

            let records = match input {
                Some(path) => read_jsonl(&path)?,
                None => hostwatch::storage::read_telemetry(&open_db(&config)?)?,
            };
            let schema = Schema::new(config.schema.fields.clone())?;
            let (artifact, report) = hostwatch::runner::train(&records, schema, &config.training)?;
            JsonModelStore::new(&model_path).save(&artifact)?;

            println!("Trained {} trees on {} rows", report.trees, report.rows);
            println!("Threshold:        {:.4}", report.threshold);
            println!("Flagged in train: {}", report.flagged);
            println!("Model saved to {}", model_path.display());
        }
        Commands::Detect {
            input,
            output,
            model,
        } => {
            let model_path = model.unwrap_or_else(|| config.model.path.clone());
            let artifact = JsonModelStore::new(&model_path).load()?;
            let records = read_jsonl(&input)?;
            let report = hostwatch::runner::detect(&artifact, records);

            println!("[!] Anomalies Detected:\n");
            println!("{:>8} | {:>7} | Record", "Row", "Score");
            println!("{:->8}-|-{:->7}-|-{:-<40}", "", "", "");
            for c in report.anomalies() {
                println!(
                    "{:>8} | {:>7.4} | {}",
                    c.position,
                    c.anomaly_score,
                    serde_json::to_string(&c.record)?
                );
            }
            if !report.skipped.is_empty() {
                println!("\nSkipped {} rows that do not match the model schema", report.skipped.len());
            }

            if let Some(out) = output {
                ensure_parent(&out)?;
                let rows: Vec<_> = report.anomalies().map(|c| c.record.clone()).collect();
                write_jsonl(&out, &rows)?;
                println!("Anomalies saved to {}", out.display());
            }
        }
        Commands::Watch {
            stream,
            path,
            model,
            interval,
            from_start,
        } => {
            if let Some(kind) = stream {
                config.stream.kind = kind;
            }
            if let Some(p) = path {
                config.stream.path = p;
            }
            if let Some(m) = model {
                config.model.path = m;
            }
            if let Some(i) = interval {
                config.monitor.poll_interval_secs = i;
            }
            if from_start {
                config.monitor.resume = false;
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, stopping monitor");
                    on_signal.cancel();
                }
            });

            let stats = hostwatch::watch(&config, cancel).await?;
            println!(
                "Stopped by user. {} records processed, {} anomalies, {} skipped.",
                stats.records, stats.anomalies, stats.skipped
            );
        }
        Commands::Alerts { limit, json } => {
            let pool = open_db(&config)?;
            let alerts = hostwatch::detect::alert::list_recent(&pool, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&alerts)?);
            } else if alerts.is_empty() {
                println!("No alerts recorded.");
            } else {
                println!("{:<25} | {:>8} | {:<7} | {:>7}", "Time", "Position", "Verdict", "Score");
                println!("{:-<25}-|-{:->8}-|-{:-<7}-|-{:->7}", "", "", "", "");
                for a in alerts {
                    println!(
                        "{:<25} | {:>8} | {:<7} | {:>7.4}",
                        a.created_at, a.position, a.verdict, a.score
                    );
                }
            }
        }
    }

    Ok(())
}
