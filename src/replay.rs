use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::VolumeResult;
use crate::recorder::CsvAppender;
use crate::schema::{QUERIES_HEADER, RESULTS_HEADER, SCHEMA_VERSION};
use crate::types::TradeBatch;

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// JSONL file, one batch per line.
    pub batches: PathBuf,
    /// CSV with `QUERIES_HEADER` columns.
    pub queries: PathBuf,
    pub out_csv: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayResult {
    pub batches_ingested: u64,
    pub batches_failed: u64,
    pub queries: u64,
    pub query_errors: u64,
    pub watermark_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Asset,
    Pair,
}

impl QueryKind {
    fn as_str(self) -> &'static str {
        match self {
            QueryKind::Asset => "asset",
            QueryKind::Pair => "pair",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QueryRow {
    kind: QueryKind,
    id: String,
    client: String,
    from_date: NaiveDate,
    to_date: NaiveDate,
}

/// Ingests every batch of `opts.batches` into a fresh in-memory engine, then answers the
/// queries of `opts.queries` against it and writes one result row per query.
pub async fn run_replay(cfg: &Config, opts: &ReplayOptions) -> anyhow::Result<ReplayResult> {
    let engine = Engine::in_memory(cfg).await.context("build engine")?;
    let mut res = ReplayResult::default();

    let f = File::open(&opts.batches)
        .with_context(|| format!("open {}", opts.batches.display()))?;
    for (idx, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", opts.batches.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let batch: TradeBatch = serde_json::from_str(&line)
            .with_context(|| format!("parse batch at line {}", idx + 1))?;
        match engine.aggregator.ingest(&batch).await {
            Ok(_) => res.batches_ingested += 1,
            Err(e) => {
                res.batches_failed += 1;
                warn!(batch_id = %batch.batch_id, error = %e, "replay batch failed");
            }
        }
    }
    res.watermark_ms = engine.aggregator.watermark();

    let queries = read_queries(&opts.queries)?;
    let mut out = CsvAppender::open(&opts.out_csv, &RESULTS_HEADER)?;
    for q in &queries {
        res.queries += 1;
        let (volume, quote_volume, error) = match evaluate(&engine, q).await {
            Ok((v, qv)) => (
                v.to_string(),
                qv.map(|x| x.to_string()).unwrap_or_default(),
                String::new(),
            ),
            Err(e) => {
                res.query_errors += 1;
                (String::new(), String::new(), e.to_string())
            }
        };
        out.write_record([
            SCHEMA_VERSION.to_string(),
            q.kind.as_str().to_string(),
            q.id.clone(),
            q.client.clone(),
            q.from_date.to_string(),
            q.to_date.to_string(),
            volume,
            quote_volume,
            error,
        ])?;
    }
    out.flush_and_sync()?;

    info!(
        batches = res.batches_ingested,
        failed = res.batches_failed,
        queries = res.queries,
        query_errors = res.query_errors,
        "replay finished"
    );
    Ok(res)
}

async fn evaluate(engine: &Engine, q: &QueryRow) -> VolumeResult<(f64, Option<f64>)> {
    match q.kind {
        QueryKind::Asset => {
            let v = engine
                .queries
                .asset_volume(&q.id, &q.client, q.from_date, q.to_date)
                .await?;
            Ok((v, None))
        }
        QueryKind::Pair => {
            let v = engine
                .queries
                .asset_pair_volume(&q.id, &q.client, q.from_date, q.to_date)
                .await?;
            Ok((v.base, Some(v.quote)))
        }
    }
}

fn read_queries(path: &Path) -> anyhow::Result<Vec<QueryRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    if !headers.iter().eq(QUERIES_HEADER.iter().copied()) {
        anyhow::bail!(
            "{}: unexpected header {:?}, want {:?}",
            path.display(),
            headers,
            QUERIES_HEADER
        );
    }
    let mut out = Vec::new();
    for row in rdr.deserialize() {
        let row: QueryRow = row.with_context(|| format!("parse {}", path.display()))?;
        out.push(row);
    }
    Ok(out)
}
