use std::path::PathBuf;

use assert_approx_eq::assert_approx_eq;

#[tokio::test]
async fn replay_fixture_produces_expected_volumes() -> anyhow::Result<()> {
    let fixture = PathBuf::from("tests/fixtures/replay_small");
    assert!(fixture.exists());

    let cfg = tradevol::config::Config::load(fixture.join("config.toml"))?;
    let out_csv = std::env::temp_dir().join(format!(
        "tradevol_replay_test_{}_{}.csv",
        std::process::id(),
        tradevol::types::now_ms()
    ));
    let _ = std::fs::remove_file(&out_csv);

    let res = tradevol::replay::run_replay(
        &cfg,
        &tradevol::replay::ReplayOptions {
            batches: fixture.join("batches.jsonl"),
            queries: fixture.join("queries.csv"),
            out_csv: out_csv.clone(),
        },
    )
    .await?;

    assert_eq!(res.batches_ingested, 3);
    assert_eq!(res.batches_failed, 0);
    assert_eq!(res.queries, 8);
    assert_eq!(res.query_errors, 3);
    assert_eq!(res.watermark_ms, Some(1_709_339_400_000));

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(&out_csv)?;
    let header = rdr.headers()?.clone();
    assert_eq!(
        header.iter().collect::<Vec<_>>(),
        tradevol::schema::RESULTS_HEADER.to_vec()
    );

    let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>()?;
    assert_eq!(rows.len(), 8);
    let volume = |i: usize| -> anyhow::Result<f64> { Ok(rows[i][6].parse::<f64>()?) };

    // Two wallets reported alice's trade; it counts once.
    assert_approx_eq!(volume(0)?, 1.5, 1e-9);
    // Wildcard: (alice 1.5 + bob 2.0) / 2.
    assert_approx_eq!(volume(1)?, 1.75, 1e-9);
    // Pair view of bob: both legs.
    assert_approx_eq!(volume(2)?, 2.0, 1e-9);
    assert_approx_eq!(rows[2][7].parse::<f64>()?, 120_000.0, 1e-6);
    // A wallet is addressed with the `wallet:` prefix, through the mirrored row.
    assert_approx_eq!(volume(3)?, 90_000.0, 1e-6);
    // The ETH trade sits in the watermark's own hour and is not visible yet.
    assert_approx_eq!(volume(4)?, 0.0, 1e-12);

    assert!(rows[5][8].contains("unknown asset"));
    assert!(rows[6][8].contains("invalid range"));
    assert!(rows[7][8].contains("unknown asset pair"));
    for row in &rows[..5] {
        assert_eq!(&row[0], tradevol::schema::SCHEMA_VERSION);
        assert!(row[8].is_empty());
    }

    let _ = std::fs::remove_file(&out_csv);
    Ok(())
}
