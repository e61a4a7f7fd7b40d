use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing once. `RUST_LOG` selects levels (default `info`);
/// `log_format` chooses compact text or structured JSON output.
///
/// Later calls are no-ops, so tests and the binary can both call it.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                try_init_with(fmt_layer)
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                try_init_with(fmt_layer)
            }
        };
        init_result = Some(result);
    });
    init_result.unwrap_or(Ok(()))
}

fn try_init_with<L>(fmt_layer: L) -> anyhow::Result<()>
where
    L: tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static,
{
    tracing_subscriber::registry().with(fmt_layer).try_init()?;
    Ok(())
}

/// Run an async test body with tracing installed. Used by `#[shoal::test]`.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    install_for_tests(test_name);
    f().await
}

/// Synchronous equivalent of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    install_for_tests(test_name);
    f()
}

fn install_for_tests(test_name: &str) {
    // Another harness may already own the global subscriber.
    if let Err(e) = init(LogFormat::Text) {
        eprintln!("tracing init for {test_name} failed: {e}");
    }
}
