mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use scout_core::time::now_unix_secs;
use scout_core::{
    BatchSummary, Granularity, LeadScout, ModelSnapshot, ScoreOutput, ScoreRequest, export_quantized, export_snapshot,
    score_batch,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "scout", about = "Score inbound leads and draft outreach")]
struct Cli {
    /// Model config TOML (falls back to SCOUT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a freshly initialized model snapshot
    Init {
        /// Output snapshot path
        #[arg(long)]
        out: PathBuf,

        /// RNG seed for weight initialization
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Score one or more leads
    Score {
        /// Model snapshot JSON
        #[arg(long)]
        model: PathBuf,

        /// Lead JSON file (one object or an array)
        leads: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Score a lead and draft an outreach message
    Draft {
        #[arg(long)]
        model: PathBuf,

        lead: PathBuf,

        /// RNG seed for sampling
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Quantize a snapshot's weights
    Quantize {
        #[arg(long)]
        model: PathBuf,

        #[arg(long)]
        out: PathBuf,

        /// Bit width (2..=8); defaults to the model config
        #[arg(long)]
        bits: Option<u8>,

        /// per_tensor or per_channel; defaults to the model config
        #[arg(long)]
        granularity: Option<String>,

        /// Labelled leads (`converted: bool`) to check accuracy degradation on
        #[arg(long)]
        eval: Option<PathBuf>,

        /// Decision threshold on the 0..1 score
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,

        /// Tolerated accuracy drop (fraction)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Write the snapshot even if the drop exceeds tolerance
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Init { out, seed } => cmd_init(&cli, out, *seed),
        Commands::Score { model, leads, json } => cmd_score(&cli, model, leads, *json),
        Commands::Draft { model, lead, seed } => cmd_draft(model, lead, *seed),
        Commands::Quantize {
            model,
            out,
            bits,
            granularity,
            eval,
            threshold,
            tolerance,
            force,
        } => cmd_quantize(
            model,
            out,
            *bits,
            granularity.as_deref(),
            eval.as_deref(),
            *threshold,
            *tolerance,
            *force,
        ),
    }
}

fn open_scout(path: &Path) -> Result<LeadScout> {
    let snapshot = config::load_snapshot(path)?;
    LeadScout::new(snapshot).context("snapshot failed validation")
}

fn write_snapshot(snapshot: &ModelSnapshot, path: &Path) -> Result<()> {
    let json = export_snapshot(snapshot).context("failed to serialize snapshot")?;
    std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))
}

fn cmd_init(cli: &Cli, out: &Path, seed: u64) -> Result<()> {
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let model_config = config::load_model_config(config_path.as_deref())?;
    let mut rng = SmallRng::seed_from_u64(seed);
    let snapshot = ModelSnapshot::init(model_config, &mut rng).context("failed to initialize model")?;
    write_snapshot(&snapshot, out)?;

    println!(
        "initialized {} → d_model={}, layers={}, experts={}, parameters={}",
        out.display(),
        snapshot.config.d_model,
        snapshot.config.n_layers,
        snapshot.config.n_experts,
        snapshot.parameter_count()
    );
    Ok(())
}

#[derive(Serialize)]
struct ScoreLine {
    id: String,
    score: f64,
    percent: f64,
    label: String,
    top_signal: Option<String>,
    error: Option<String>,
}

impl ScoreLine {
    fn new(id: String, result: &scout_core::Result<ScoreOutput>) -> Self {
        match result {
            Ok(out) => {
                let top = out
                    .relevance
                    .iter()
                    .max_by(|a, b| a.relevance.total_cmp(&b.relevance))
                    .map(|r| r.kind.to_string());
                ScoreLine {
                    id,
                    score: out.score,
                    percent: out.percent,
                    label: out.label.to_string(),
                    top_signal: top,
                    error: None,
                }
            }
            Err(e) => ScoreLine {
                id,
                score: 0.0,
                percent: 0.0,
                label: "error".to_string(),
                top_signal: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn cmd_score(cli: &Cli, model: &Path, leads_path: &Path, json: bool) -> Result<()> {
    let scout = open_scout(model)?;
    let leads = config::load_leads(leads_path)?;
    let now = now_unix_secs();

    let mut ids = Vec::with_capacity(leads.len());
    let mut requests = Vec::with_capacity(leads.len());
    for (i, lead) in leads.iter().enumerate() {
        let id = lead.id.clone().unwrap_or_else(|| format!("lead-{}", i + 1));
        let request = lead
            .to_request(now)
            .with_context(|| format!("invalid lead {id}"))?;
        ids.push(id);
        requests.push(request);
    }

    let results = score_batch(&scout, &requests);
    let lines: Vec<ScoreLine> = ids
        .into_iter()
        .zip(&results)
        .map(|(id, r)| ScoreLine::new(id, r))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&lines).context("failed to serialize scores")?);
    } else {
        for line in &lines {
            match &line.error {
                Some(e) => println!("{:<20} error: {e}", line.id),
                None => println!(
                    "{:<20} {:>6.1}%  {:<6}  top={}",
                    line.id,
                    line.percent,
                    line.label,
                    line.top_signal.as_deref().unwrap_or("-")
                ),
            }
        }
    }

    if cli.verbose {
        let summary = BatchSummary::from_results(&results);
        eprintln!(
            "--- batch: scored={}, failed={}, mean={:.3}, busiest_expert_share={:.2} ---",
            summary.scored,
            summary.failed,
            summary.mean_score,
            summary.utilization.max_share()
        );
    }
    Ok(())
}

fn cmd_draft(model: &Path, lead_path: &Path, seed: Option<u64>) -> Result<()> {
    let scout = open_scout(model)?;
    let leads = config::load_leads(lead_path)?;
    let Some(lead) = leads.first() else {
        bail!("no lead in {}", lead_path.display());
    };
    let request: ScoreRequest = lead.to_request(now_unix_secs()).context("invalid lead")?;

    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };
    let (scored, draft) = scout.draft(&request, &mut rng).context("failed to draft outreach")?;

    let name = lead.name.as_deref().unwrap_or("there");
    println!("score: {:.1}% ({})", scored.percent, scored.label);
    println!();
    println!("Hi {name},");
    println!();
    println!("{}", draft.hook);
    if !draft.body.is_empty() {
        println!("{}", draft.body);
    }
    println!();
    println!("Worth a quick chat?");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_quantize(
    model: &Path,
    out: &Path,
    bits: Option<u8>,
    granularity: Option<&str>,
    eval: Option<&Path>,
    threshold: f64,
    tolerance: Option<f64>,
    force: bool,
) -> Result<()> {
    let scout = open_scout(model)?;
    let bits = bits.unwrap_or(scout.config().quant_bits);
    let granularity = match granularity {
        Some(g) => g.parse::<Granularity>().context("invalid --granularity")?,
        None => scout.config().quant_granularity,
    };

    let quantized = scout
        .snapshot()
        .quantize_weights(bits, granularity)
        .context("failed to quantize snapshot")?;

    if let Some(eval_path) = eval {
        let labelled = config::load_labelled(eval_path)?;
        let now = now_unix_secs();
        let eval_set = labelled
            .iter()
            .map(|l| l.lead.to_request(now).map(|req| (req, l.converted)))
            .collect::<scout_core::Result<Vec<_>>>()
            .context("invalid evaluation lead")?;
        let served = quantized.dequantize().context("quantized snapshot failed validation")?;
        let quant_scout = LeadScout::new(served).context("quantized snapshot failed validation")?;
        let report = scout
            .degradation(&quant_scout, &eval_set, threshold, tolerance)
            .context("failed to evaluate degradation")?;

        println!(
            "accuracy: float={:.3}, quantized={:.3}, drop={:.3} (tolerance {:.3}), max_score_delta={:.5}",
            report.float_accuracy, report.quant_accuracy, report.drop, report.tolerance, report.max_score_delta
        );
        if !report.within_tolerance && !force {
            bail!(
                "accuracy drop {:.3} exceeds tolerance {:.3}; not writing {}",
                report.drop,
                report.tolerance,
                out.display()
            );
        }
    }

    let json = export_quantized(&quantized).context("failed to serialize quantized snapshot")?;
    std::fs::write(out, &json).with_context(|| format!("failed to write {}", out.display()))?;
    let (stored, full) = quantized.tensors.iter().fold((0usize, 0usize), |(s, f), t| {
        (s + t.codes().len() + 8 * t.scales().len(), f + 8 * t.codes().len())
    });
    let ratio = stored as f64 / full.max(1) as f64;
    println!(
        "quantized {} → {} ({bits}-bit, {granularity:?}, {} tensors, weight storage {:.0}% of f64)",
        model.display(),
        out.display(),
        quantized.tensors.len(),
        100.0 * ratio
    );
    Ok(())
}
