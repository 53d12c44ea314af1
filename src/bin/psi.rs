//! psi: build labeled PSI databases and run local query rounds.
//!
//! Input files hold one record per line: `item` or `item,label`. Items are
//! hashed to 128 bits, labels are taken as UTF-8 bytes.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use labeled_psi::messages;
use labeled_psi::{Item, Label, OprfKey, PsiParams, Receiver, Sender, SenderConfig, SenderDb};

#[derive(Parser)]
#[command(name = "psi")]
#[command(about = "Labeled private set intersection")]
#[command(version)]
struct Args {
    /// Log verbosity
    #[arg(long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    SmallTest,
}

#[derive(Subcommand)]
enum Command {
    /// Write a parameter preset as JSON
    Params {
        #[arg(long, value_enum, default_value = "default")]
        preset: Preset,

        #[arg(long, default_value = "params.json")]
        out: PathBuf,
    },

    /// Build a sender database from an item file
    Build {
        #[arg(long)]
        params: PathBuf,

        /// Item file, one `item[,label]` per line
        #[arg(long)]
        items: PathBuf,

        /// Label length in bytes (0 for an unlabeled database)
        #[arg(long, default_value = "0")]
        label_bytes: usize,

        /// Store items as OPRF outputs under a fresh key
        #[arg(long)]
        oprf: bool,

        /// Keep bundle caches in coefficient form
        #[arg(long)]
        compressed: bool,

        /// Items inserted per batch
        #[arg(long, default_value = "1024")]
        chunk: usize,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "sender.db")]
        out: PathBuf,
    },

    /// Query a database in-process and print the intersection
    Query {
        #[arg(long)]
        db: PathBuf,

        /// Query file, one item per line
        #[arg(long)]
        items: PathBuf,

        /// Sender worker threads (defaults to available parallelism)
        #[arg(long)]
        threads: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn rng_from(seed: Option<u64>) -> ChaCha20Rng {
    match seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    }
}

fn read_records(path: &Path) -> Result<Vec<(String, Option<String>)>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (item, label) = match line.split_once(',') {
            Some((item, label)) => (item.trim(), Some(label.trim().to_string())),
            None => (line, None),
        };
        records.push((item.to_string(), label));
    }
    Ok(records)
}

fn write_params(preset: Preset, out: &Path) -> Result<()> {
    let params = match preset {
        Preset::Default => PsiParams::default(),
        Preset::SmallTest => PsiParams::small_test(),
    };
    fs::write(out, params.to_json_string()?)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    info!("Wrote parameters to {}", out.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build(
    params: &Path,
    items: &Path,
    label_bytes: usize,
    oprf: bool,
    compressed: bool,
    chunk: usize,
    seed: Option<u64>,
    out: &Path,
) -> Result<()> {
    let params = PsiParams::load(params)
        .with_context(|| format!("Failed to load parameters from {}", params.display()))?;
    let mut rng = rng_from(seed);
    let oprf_key = oprf.then(|| OprfKey::random(&mut rng));
    let db = SenderDb::new(params, label_bytes, compressed, oprf_key)
        .with_context(|| "Failed to create database")?;

    let data: Vec<(Item, Label)> = read_records(items)?
        .into_iter()
        .map(|(item, label)| {
            (
                Item::hash_bytes(item.as_bytes()),
                label.map(String::into_bytes).unwrap_or_default(),
            )
        })
        .collect();
    info!("Read {} records from {}", data.len(), items.display());

    let start = Instant::now();
    let pb = ProgressBar::new(data.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    for batch in data.chunks(chunk.max(1)) {
        db.insert(batch)
            .with_context(|| "Failed to insert items")?;
        pb.inc(batch.len() as u64);
    }
    pb.finish_with_message("Done");
    info!(
        "Built database: {} items in {} bundles ({:.2?})",
        db.item_count(),
        db.bin_bundle_count(),
        start.elapsed()
    );

    let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    db.save(&mut writer)
        .with_context(|| format!("Failed to save database to {}", out.display()))?;
    writer.flush()?;
    info!("Saved database to {}", out.display());
    Ok(())
}

fn query(db_path: &Path, items: &Path, threads: Option<usize>, seed: Option<u64>) -> Result<()> {
    let file =
        File::open(db_path).with_context(|| format!("Failed to open {}", db_path.display()))?;
    let db = SenderDb::load(BufReader::new(file))
        .with_context(|| format!("Failed to load database from {}", db_path.display()))?;
    let params = db.params().clone();
    let use_oprf = db.oprf_key().is_some();

    let mut config = SenderConfig::default();
    if let Some(threads) = threads {
        config.thread_count = threads;
    }
    let sender = Sender::new(Arc::new(db), config)?;

    let records = read_records(items)?;
    let query_items: Vec<Item> = records
        .iter()
        .map(|(item, _)| Item::hash_bytes(item.as_bytes()))
        .collect();

    let mut rng = rng_from(seed);
    let receiver = Receiver::new(params, &mut rng)?;
    let mut pending = receiver.begin_query(&query_items);

    let start = Instant::now();
    if use_oprf {
        let request = receiver.create_oprf_request(&mut pending, &mut rng)?;
        let response = sender.process_oprf(&request)?;
        receiver.process_oprf_response(&mut pending, &response)?;
    }
    let request = receiver
        .create_query(&mut pending, &mut rng)
        .with_context(|| "Failed to create query")?;
    let request_size = messages::to_bytes(&request)?.len();
    let response = sender
        .process_query(&request, &mut rng)
        .with_context(|| "Failed to answer query")?;
    let response_size = messages::to_bytes(&response)?.len();
    let matches = receiver.process_response(&mut pending, &response)?;

    info!(
        "Query: {} KB up, {} KB down, {:.2?}",
        request_size / 1024,
        response_size / 1024,
        start.elapsed()
    );
    for ((item, _), record) in records.iter().zip(&matches) {
        match (&record.label, record.found) {
            (Some(label), true) => {
                let label = String::from_utf8_lossy(label);
                println!("{item}\tfound\t{}", label.trim_end_matches('\0'));
            }
            (None, true) => println!("{item}\tfound"),
            _ => println!("{item}\tabsent"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Params { preset, out } => write_params(preset, &out),
        Command::Build {
            params,
            items,
            label_bytes,
            oprf,
            compressed,
            chunk,
            seed,
            out,
        } => build(&params, &items, label_bytes, oprf, compressed, chunk, seed, &out),
        Command::Query {
            db,
            items,
            threads,
            seed,
        } => query(&db, &items, threads, seed),
    }
}
