use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "import_service=info";

/// `RUST_LOG` wins over the default directive when set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
