//! Engine tuning knobs and session construction.

use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};
use snafu::prelude::*;

use crate::error::{DataFusionSnafu, EngineResult};

/// Resource settings applied to every DataFusion session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSettings {
    /// Target partitions (worker threads); `None` uses available parallelism.
    pub threads: Option<usize>,
    /// Memory pool ceiling in bytes; `None` is unbounded.
    pub memory_limit: Option<usize>,
    /// Keep file order instead of repartitioning scans round-robin.
    pub preserve_order: bool,
}

impl EngineSettings {
    /// Effective number of target partitions.
    pub fn target_partitions(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Parse a human memory size such as `512MB`, `4GiB` or `1000000`.
///
/// # Examples
///
/// ```
/// use scooter_trips_datafusion::settings::parse_memory_size;
///
/// assert_eq!(parse_memory_size("1024"), Some(1024));
/// assert_eq!(parse_memory_size("2KB"), Some(2048));
/// assert_eq!(parse_memory_size("4 GiB"), Some(4 << 30));
/// assert_eq!(parse_memory_size("lots"), None);
/// ```
pub fn parse_memory_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };

    let bytes = number * multiplier as f64;
    (bytes.is_finite() && bytes >= 0.0).then_some(bytes as usize)
}

/// Build a session context configured from `settings`.
pub fn session_context(settings: &EngineSettings) -> EngineResult<SessionContext> {
    let mut config = SessionConfig::new()
        .with_target_partitions(settings.target_partitions())
        .with_repartition_file_scans(!settings.preserve_order)
        .with_round_robin_repartition(!settings.preserve_order);

    // Plain Utf8 keeps the schema identical to what ingestion wrote.
    config.options_mut().execution.parquet.schema_force_view_types = false;

    let mut runtime = RuntimeEnvBuilder::new();
    if let Some(bytes) = settings.memory_limit {
        runtime = runtime.with_memory_limit(bytes, 1.0);
    }
    let runtime = runtime.build_arc().context(DataFusionSnafu)?;

    Ok(SessionContext::new_with_config_rt(config, runtime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_threads_set_target_partitions() -> Result<(), Box<dyn std::error::Error>> {
        let settings = EngineSettings {
            threads: Some(3),
            ..EngineSettings::default()
        };
        let ctx = session_context(&settings)?;
        let config = ctx.copied_config();
        assert_eq!(config.target_partitions(), 3);
        assert!(config.options().optimizer.repartition_file_scans);
        Ok(())
    }

    #[test]
    fn preserve_order_disables_repartitioning() -> Result<(), Box<dyn std::error::Error>> {
        let settings = EngineSettings {
            preserve_order: true,
            threads: Some(0),
            ..EngineSettings::default()
        };
        assert_eq!(settings.target_partitions(), 1);
        let ctx = session_context(&settings)?;
        let config = ctx.copied_config();
        assert!(!config.options().optimizer.repartition_file_scans);
        assert!(!config.options().optimizer.enable_round_robin_repartition);
        Ok(())
    }

    #[test]
    fn memory_sizes_accept_units() {
        assert_eq!(parse_memory_size("1.5KB"), Some(1536));
        assert_eq!(parse_memory_size("3m"), Some(3 << 20));
        assert_eq!(parse_memory_size(""), None);
        assert_eq!(parse_memory_size("12PB"), None);
    }
}
