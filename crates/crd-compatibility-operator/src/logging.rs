use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Plain,

    /// One JSON object per line
    Json,
}

/// Initializes `tracing` with the log directives read from the environment variable `env`.
///
/// If the variable is unset or contains invalid directives, the maximum log level is INFO.
pub fn initialize_logging(env: &str, format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_env_var(env)
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
