use tracing_subscriber::{fmt, EnvFilter};

use crate::{errors::Error, Result};

/// Install the global `tracing` subscriber.
///
/// Defaults to `info` for this crate and `service_name`; `RUST_LOG` overrides.
/// Calling it again (tests, embedding binaries) returns `Ok` and leaves the
/// first subscriber in place.
pub fn init(service_name: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(service_name)?,
    };

    if fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!(service = service_name, "Logging already initialized");
    }
    Ok(())
}

fn default_filter(service_name: &str) -> Result<EnvFilter> {
    let directives = format!(
        "info,mhk_core=info,{}=info",
        service_name.replace('-', "_")
    );
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("invalid log filter {directives:?}: {e}")))
}
