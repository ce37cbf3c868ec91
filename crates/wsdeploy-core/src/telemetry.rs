//! Process-wide tracing initialisation.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log targets owned by this workspace.
const DEPLOY_TARGETS: [&str; 2] = ["wsdeploy_core", "wsdeploy_client"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the deploy crates log at `level` and
/// everything else (HTTP stack, runtime) at `warn` or quieter. With `json`,
/// log lines are newline-delimited JSON with event fields at the top level.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        registry.with(fmt::layer()).try_init().ok();
    }
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: Level) -> String {
    // Larger levels are more verbose.
    let dependencies = level.min(Level::WARN);
    let mut directives = dependencies.as_str().to_ascii_lowercase();
    for target in DEPLOY_TARGETS {
        directives.push_str(&format!(",{target}={}", level.as_str().to_ascii_lowercase()));
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_crates_get_the_requested_level() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,wsdeploy_core=debug,wsdeploy_client=debug"
        );
    }

    #[test]
    fn dependencies_never_log_louder_than_warn() {
        assert_eq!(
            default_directives(Level::TRACE),
            "warn,wsdeploy_core=trace,wsdeploy_client=trace"
        );
        assert_eq!(
            default_directives(Level::ERROR),
            "error,wsdeploy_core=error,wsdeploy_client=error"
        );
    }

    #[test]
    fn directives_parse_as_a_filter() {
        assert!(EnvFilter::try_new(default_directives(Level::INFO)).is_ok());
    }
}
