//! PackScan - packaged food and drink recognition
//!
//! Offline driver for the scan pipeline: feeds still images through a scan
//! session as if they were consecutive camera frames.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use packscan::analysis::fusion::SampleSource;
use packscan::analysis::text::fold_text;
use packscan::capture::{load_frame, save_frame, PackagingKind};
use packscan::config::{default_config_path, load_config, AppConfig, PreprocessPreset};
use packscan::resolver::{FrameHints, FrameOutcome, NoRecentActivity, ProductCandidate, ProductSearch, ResolveOutcome, ScanSession};
use packscan::vision::{preprocess_frame, preprocess_frame_with, TesseractEngine};

/// PackScan - packaged food and drink recognition
#[derive(Parser, Debug)]
#[command(name = "packscan")]
#[command(about = "Recognize packaged food and drinks from camera frames")]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// OCR locale, e.g. nb-NO or en-US
    #[arg(long, global = true)]
    locale: Option<String>,

    /// Use the aggressive preprocessing preset for the first pass
    #[arg(long, global = true)]
    aggressive: bool,

    /// OCR deadline per call in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run images through the scan loop as consecutive frames
    Scan {
        /// Images in capture order
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Time between frames on the scan clock
        #[arg(long, default_value = "250")]
        frame_interval_ms: u64,

        /// Packaging shape (can, bottle, carton, wrapper, pouch, box, unknown)
        #[arg(long, default_value = "unknown")]
        packaging: PackagingKind,

        /// JSON product list to resolve committed readings against
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Write the OCR-preprocessed version of an image
    Preprocess {
        input: PathBuf,
        output: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = effective_config(&args)?;

    match args.command {
        Command::Scan {
            images,
            frame_interval_ms,
            packaging,
            catalog,
        } => {
            let catalog = match catalog {
                Some(path) => Some(CatalogSearch::load(&path)?),
                None => None,
            };
            scan(config, &images, frame_interval_ms, packaging, catalog.as_ref()).await
        }
        Command::Preprocess { input, output } => preprocess(&config, &input, &output),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Config file plus command line overrides
fn effective_config(args: &Args) -> Result<AppConfig> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => default_config_path().ok().filter(|p| p.exists()),
    };

    let mut config = match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            load_config(&path)?
        }
        None => AppConfig::default(),
    };

    if let Some(locale) = &args.locale {
        config.ocr.locale = locale.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.ocr.timeout_ms = timeout_ms;
    }
    if args.aggressive {
        config.preprocess.preset = PreprocessPreset::Aggressive;
    }

    Ok(config.normalized())
}

/// One JSON line of scan output
#[derive(Debug, Serialize)]
struct ScanReport<'a> {
    image: String,
    timestamp_ms: u64,
    quality: f32,
    retried: bool,
    text: Option<&'a str>,
    confidence: Option<f32>,
    source: Option<SampleSource>,
    stable_count: u32,
    committed: bool,
    seeds: Vec<&'a str>,
    brands: Vec<&'a str>,
    resolved: Option<ResolveOutcome>,
}

impl<'a> ScanReport<'a> {
    fn new(image: &Path, outcome: &'a FrameOutcome, resolved: Option<ResolveOutcome>) -> Self {
        Self {
            image: image.display().to_string(),
            timestamp_ms: outcome.timestamp_ms,
            quality: outcome.quality.overall,
            retried: outcome.retried,
            text: outcome.fused.as_ref().map(|f| f.text.as_str()),
            confidence: outcome.fused.as_ref().map(|f| f.conf),
            source: outcome.fused.as_ref().map(|f| f.source),
            stable_count: outcome.decision_input.as_ref().map_or(0, |d| d.stable_count),
            committed: outcome.committed,
            seeds: outcome.search_seeds.iter().map(|s| s.text.as_str()).collect(),
            brands: outcome.brand_hits.iter().map(|h| h.canonical.as_str()).collect(),
            resolved,
        }
    }
}

async fn scan(
    config: AppConfig,
    images: &[PathBuf],
    frame_interval_ms: u64,
    packaging: PackagingKind,
    catalog: Option<&CatalogSearch>,
) -> Result<()> {
    let mut session = ScanSession::new(config, TesseractEngine::new);
    let hints = FrameHints {
        packaging,
        ..FrameHints::default()
    };
    info!("Scanning {} images in session {}", images.len(), session.id());

    for (i, path) in images.iter().enumerate() {
        let frame = load_frame(path, i as u64 * frame_interval_ms)?;
        let outcome = session.process_frame(&frame, &hints).await?;

        let resolved = match catalog {
            Some(catalog) if outcome.committed => session
                .resolve(&frame, &outcome, &hints, catalog, &NoRecentActivity)
                .await
                .unwrap_or_else(|e| {
                    warn!("Resolve failed: {}", e);
                    None
                }),
            _ => None,
        };

        let report = ScanReport::new(path, &outcome, resolved);
        println!("{}", serde_json::to_string(&report)?);
    }

    session.close();
    Ok(())
}

fn preprocess(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    let frame = load_frame(input, 0)?;
    let processed = match config.preprocess.preset {
        PreprocessPreset::Aggressive => preprocess_frame(&frame, PreprocessPreset::Aggressive),
        PreprocessPreset::Normal => preprocess_frame_with(&frame, &config.preprocess.first_pass()),
    };
    save_frame(&processed, output)?;
    info!("Wrote {}", output.display());
    Ok(())
}

/// Catalog entry in the `--catalog` file
#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    id: String,
    brand: String,
    name: String,
}

/// Fuzzy product search over a local JSON catalog
struct CatalogSearch {
    entries: Vec<CatalogEntry>,
}

impl CatalogSearch {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        info!("Loaded {} catalog entries", entries.len());
        Ok(Self { entries })
    }
}

#[async_trait]
impl ProductSearch for CatalogSearch {
    async fn search(&self, seed: &str) -> Result<Vec<ProductCandidate>> {
        let seed = fold_text(seed);
        if seed.is_empty() {
            return Ok(vec![]);
        }

        let mut found: Vec<ProductCandidate> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let label = fold_text(&format!("{} {}", entry.brand, entry.name));
                let similarity = strsim::normalized_levenshtein(&seed, &label) as f32;
                let contained = label.contains(&seed) || seed.contains(&label);
                let score = if contained { similarity.max(0.6) } else { similarity };
                (score >= 0.35).then(|| ProductCandidate {
                    id: entry.id.clone(),
                    brand: entry.brand.clone(),
                    name: entry.name.clone(),
                    score: score.min(0.99),
                })
            })
            .collect();
        found.sort_by(|a, b| b.score.total_cmp(&a.score));
        found.truncate(10);
        Ok(found)
    }
}
