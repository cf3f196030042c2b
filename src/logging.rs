use crate::config::{LogFormat, LogLevel};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

fn json_line(record: &log::Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });

    serde_json::to_string(&log_entry).unwrap_or_else(|_| {
        json!({"error": "Failed to serialize log entry", "raw_message": record.args().to_string()})
            .to_string()
    })
}

/// Install the global logger. `RUST_LOG` wins over `level` when set.
pub fn init(level: LogLevel, format: LogFormat) -> Result<(), log::SetLoggerError> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));

    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }

    builder.try_init()
}
