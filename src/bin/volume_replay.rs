use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "volume_replay")]
struct Args {
    /// JSONL file of trade batches, one per line.
    #[arg(long)]
    batches: PathBuf,

    /// CSV of queries (kind,id,client,from_date,to_date).
    #[arg(long)]
    queries: PathBuf,

    /// Output CSV (default: <queries>.results.csv).
    #[arg(long)]
    out: Option<PathBuf>,

    /// Optional config file; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(p) => tradevol::config::Config::load(p).context("load config")?,
        None => tradevol::config::Config::default(),
    };
    let out_csv = args
        .out
        .unwrap_or_else(|| args.queries.with_extension("results.csv"));

    let opts = tradevol::replay::ReplayOptions {
        batches: args.batches.clone(),
        queries: args.queries.clone(),
        out_csv: out_csv.clone(),
    };
    let res = tradevol::replay::run_replay(&cfg, &opts)
        .await
        .with_context(|| format!("replay {}", args.batches.display()))?;

    println!("batches_ingested={}", res.batches_ingested);
    println!("batches_failed={}", res.batches_failed);
    println!("queries={}", res.queries);
    println!("query_errors={}", res.query_errors);
    println!(
        "watermark_ms={}",
        res.watermark_ms
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("out_csv={}", out_csv.display());

    Ok(())
}
