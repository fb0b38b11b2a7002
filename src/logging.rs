use anyhow::Result;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Installs terminal logging on stderr.
///
/// `directives` overrides `RUST_LOG` when given.
pub fn init(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;
    Ok(())
}
