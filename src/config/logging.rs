use tracing_subscriber::EnvFilter;

use super::{ConfigError, LogOutput, LoggingConfig};

/// Installs the global tracing subscriber from the `logging` section.
/// Must run once, before any task is spawned.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|err| ConfigError::Invalid(format!("bad logging level: {err}")))?;
    for (target, level) in &config.options {
        let directive = format!("{target}={level}").parse().map_err(|err| {
            ConfigError::Invalid(format!("bad logging override '{target}': {err}"))
        })?;
        filter = filter.add_directive(directive);
    }

    let result = match config.output {
        LogOutput::Console => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init(),
        LogOutput::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    result.map_err(|err| ConfigError::Invalid(format!("cannot install logger: {err}")))
}
