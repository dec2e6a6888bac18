use std::sync::Once;

use log::LevelFilter;

/// Logger settings for binaries embedding the backend.
///
/// The filter is taken from `env_filter`, then `LUMEN_LOG`, then `RUST_LOG`,
/// in `env_logger` syntax ("info", "lumen_device=debug,wgpu=warn"). Without
/// any of them everything logs at `default_level`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    pub default_level: LevelFilter,
    pub write_style: env_logger::WriteStyle,
    /// Prefix lines with a millisecond timestamp.
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            env_filter: None,
            default_level: LevelFilter::Info,
            write_style: env_logger::WriteStyle::Auto,
            timestamps: false,
        }
    }
}

impl LoggingConfig {
    fn filter(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.env_filter
            .clone()
            .or_else(|| env("LUMEN_LOG"))
            .or_else(|| env("RUST_LOG"))
            .filter(|f| !f.trim().is_empty())
    }
}

static INIT: Once = Once::new();

/// Installs the global logger on first call; later calls do nothing.
///
/// A logger installed by the host application beforehand is left alone.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        match config.filter(|key| std::env::var(key).ok()) {
            Some(filter) => {
                builder.parse_filters(&filter);
            }
            None => {
                builder.filter_level(config.default_level);
            }
        }

        builder.write_style(config.write_style);
        if config.timestamps {
            builder.format_timestamp_millis();
        } else {
            builder.format_timestamp(None);
        }

        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins_over_environment() {
        let config = LoggingConfig {
            env_filter: Some("warn".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(config.filter(|_| Some("trace".into())).as_deref(), Some("warn"));
    }

    #[test]
    fn lumen_log_is_read_before_rust_log() {
        let env = |key: &str| match key {
            "LUMEN_LOG" => Some("lumen_device=debug".to_string()),
            "RUST_LOG" => Some("error".to_string()),
            _ => None,
        };
        assert_eq!(LoggingConfig::default().filter(env).as_deref(), Some("lumen_device=debug"));
    }

    #[test]
    fn blank_filters_fall_back_to_the_default_level() {
        assert_eq!(LoggingConfig::default().filter(|_| Some("  ".into())), None);
    }
}
