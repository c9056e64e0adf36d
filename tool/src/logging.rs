use std::io::{self, IsTerminal as _};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

const ENV_NAME: &str = "HTIDX_LOG";

/// Creates the env filter from [`ENV_NAME`], defaulting to `info`.
fn env_filter() -> EnvFilter {
    let directives = match std::env::var(ENV_NAME) {
        Ok(env) => env,
        Err(std::env::VarError::NotPresent) => String::new(),
        Err(std::env::VarError::NotUnicode(_)) => {
            panic!("Environment variable {} is not unicode", ENV_NAME);
        }
    };

    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}

/// Install the global subscriber. Logs go to stderr so they never mix with command output.
pub fn init() {
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_timer(fmt::time::SystemTime::default());
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .event_format(format)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}
