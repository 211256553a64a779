use std::path::Path;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::consumer::{BatchOutcome, InboundSender};
use crate::graceful_shutdown::{self, ShutdownRx};
use crate::types::TradeBatch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub malformed: u64,
    pub ingested: u64,
    pub dead_lettered: u64,
    pub interrupted: u64,
}

/// Replays a JSONL file of batches (`{"batch_id": .., "events": [..]}` per line) onto the
/// inbound channel. Each batch waits for its ack before the next line is read.
pub async fn run_file_feed(
    path: &Path,
    inbound: InboundSender,
    mut shutdown: ShutdownRx,
) -> anyhow::Result<FeedStats> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            _ = graceful_shutdown::requested(&mut shutdown) => {
                info!(lines = stats.lines, "feed stopped by shutdown");
                break;
            }
            line = lines.next_line() => {
                line.with_context(|| format!("read {}", path.display()))?
            }
        };
        let Some(line) = line else {
            break;
        };
        stats.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        let batch: TradeBatch = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                stats.malformed += 1;
                warn!(line_no = stats.lines, error = %e, "skip malformed batch line");
                continue;
            }
        };

        match inbound.submit(batch).await? {
            BatchOutcome::Ingested(_) => stats.ingested += 1,
            BatchOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
            BatchOutcome::Interrupted => {
                stats.interrupted += 1;
                break;
            }
        }
    }

    info!(
        path = %path.display(),
        lines = stats.lines,
        ingested = stats.ingested,
        dead_lettered = stats.dead_lettered,
        malformed = stats.malformed,
        "feed finished"
    );
    Ok(stats)
}
