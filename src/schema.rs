pub const SCHEMA_VERSION: &str = "v1";

pub const FILE_HEALTH_JSONL: &str = "health.jsonl";
pub const FILE_DEAD_LETTER_JSONL: &str = "dead_letter.jsonl";

/// Input of `volume_replay`: one query per row.
pub const QUERIES_HEADER: [&str; 5] = ["kind", "id", "client", "from_date", "to_date"];

/// Output of `volume_replay`.
pub const RESULTS_HEADER: [&str; 9] = [
    "schema_version",
    "kind",
    "id",
    "client",
    "from_date",
    "to_date",
    "volume",
    "quote_volume",
    "error",
];
