//! CLI application for mining change detection and model evaluation.
//!
//! Usage:
//!   mining-detect detect <before> <after>                 # Human-readable output
//!   mining-detect detect <before> <after> --json          # JSON output
//!   mining-detect detect <before> <after> --heatmap h.png # Save the change mask
//!   mining-detect evaluate test/ --report report.txt      # Evaluate on a test set

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::info;
use mining_change::evaluation::{evaluate_test_set, EvaluationSummary};
use mining_change::{DetectionResult, DetectorConfig, MiningDetector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "mining-detect")]
#[command(
    author,
    version,
    about = "Mining change detection on before/after imagery",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Model artifact, tried before the configured candidates
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// JSON detector configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect changes between two images
    Detect {
        /// Before image
        before: PathBuf,

        /// After image
        after: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save the change mask as a PNG
        #[arg(long, conflicts_with = "no_heatmap")]
        heatmap: Option<PathBuf>,

        /// Skip returning the change mask
        #[arg(long)]
        no_heatmap: bool,

        /// Seed for the ensemble jitter (random if omitted)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Evaluate the model on a test directory with A/, B/ and label/ folders
    Evaluate {
        /// Test set directory
        test_dir: PathBuf,

        /// Where to write the text report
        #[arg(long, default_value = "evaluation_report.txt")]
        report: PathBuf,

        /// Number of detailed examples to print
        #[arg(long, default_value = "5")]
        examples: usize,
    },
}

/// Output structure for JSON serialization
#[derive(Serialize)]
struct DetectOutput<'a> {
    before: String,
    after: String,
    detected: bool,
    #[serde(flatten)]
    result: &'a DetectionResult,
    heatmap_path: Option<String>,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => DetectorConfig::load(path)?,
        None => DetectorConfig::default(),
    };
    let detector = MiningDetector::from_config(config, args.model.as_deref())?;

    match &args.command {
        Command::Detect {
            before,
            after,
            json,
            output,
            heatmap,
            no_heatmap,
            seed,
        } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(*seed),
                None => StdRng::from_entropy(),
            };
            let result = detector.detect_changes_with_rng(
                before.as_path(),
                after.as_path(),
                !no_heatmap,
                &mut rng,
            )?;

            let heatmap_path = match (heatmap, &result.heatmap) {
                (Some(path), Some(mask)) => {
                    mask.to_gray_image().save(path)?;
                    info!("heatmap written to {}", path.display());
                    Some(path.display().to_string())
                }
                _ => None,
            };

            let out = DetectOutput {
                before: before.display().to_string(),
                after: after.display().to_string(),
                detected: result.confidence > detector.confidence_threshold(),
                result: &result,
                heatmap_path,
            };
            let text = if *json {
                serde_json::to_string_pretty(&out)?
            } else {
                format_human_readable(&out)
            };
            write_output(output.as_deref(), &text)?;
        }
        Command::Evaluate {
            test_dir,
            report,
            examples,
        } => {
            let summary = evaluate_test_set(&detector, test_dir)?;
            let text = summary.render();
            std::fs::write(report, &text)?;
            println!("{}", text);
            println!("{}", format_examples(&summary, *examples));
            info!("report written to {}", report.display());
        }
    }

    Ok(())
}

fn write_output(path: Option<&Path>, text: &str) -> std::io::Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, text)?;
            info!("output written to {}", path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn format_human_readable(out: &DetectOutput<'_>) -> String {
    let r = out.result;
    let mut s = String::new();

    s.push_str(&format!("Image Pair: {} -> {}\n", out.before, out.after));
    s.push_str(&format!(
        "Mining Detection Confidence: {:.1}%\n",
        r.confidence * 100.0
    ));
    s.push_str(&format!("Prediction Uncertainty: {:.3}\n", r.prediction_std));
    let passes: Vec<String> = r.raw_predictions.iter().map(|p| format!("{p:.3}")).collect();
    s.push_str(&format!("Ensemble passes: [{}]\n", passes.join(", ")));

    if !out.detected {
        s.push_str("\nNo significant change detected.\n");
        return s;
    }

    s.push_str("\nAnalysis:\n");
    s.push_str(&format!("  Affected Area: {:.2}%\n", r.affected_area * 100.0));
    s.push_str(&format!("  Severity: {}\n", r.severity));
    if let Some(path) = &out.heatmap_path {
        s.push_str(&format!("  Heatmap: {}\n", path));
    }

    s
}

fn format_examples(summary: &EvaluationSummary, n: usize) -> String {
    let mut s = String::from("Detailed Examples:\n");
    for pair in summary.examples(n) {
        let label = |change: bool| if change { "Change" } else { "No Change" };
        let name = |p: &Path| {
            p.file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        s.push_str(&format!(
            "\nImage Pair: {} -> {}\n",
            name(&pair.before),
            name(&pair.after)
        ));
        s.push_str(&format!("True Label: {}\n", label(pair.true_change)));
        s.push_str(&format!("Predicted: {}\n", label(pair.predicted_change)));
        s.push_str(&format!("Confidence: {:.3}\n", pair.confidence));
        s.push_str(&format!("Affected Area: {:.3}\n", pair.affected_area));
        s.push_str(&format!("Severity: {}\n", pair.severity));
        s.push_str(&format!("Prediction Uncertainty: {:.3}\n", pair.prediction_std));
    }
    s
}
