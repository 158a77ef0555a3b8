//! Tracing setup for the runner.
//!
//! `RUST_LOG` wins when set. Otherwise `JOBPOOL_LOG` picks the level for our
//! own crates (default `warn`, so child output is not drowned out), and
//! `LOG_FORMAT=json` switches to JSON lines. Everything goes to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "JOBPOOL_LOG";

pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(std::env::var(LOG_ENV).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("error") => "error",
        _ => "warn",
    };
    format!("jobpool={level},jobpool_run={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_warn() {
        insta::assert_snapshot!(filter_directives(None), @"jobpool=warn,jobpool_run=warn");
        insta::assert_snapshot!(filter_directives(Some("loud")), @"jobpool=warn,jobpool_run=warn");
    }

    #[test]
    fn honours_known_levels() {
        insta::assert_snapshot!(filter_directives(Some("debug")), @"jobpool=debug,jobpool_run=debug");
    }
}
