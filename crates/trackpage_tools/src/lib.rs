#![forbid(unsafe_code)]

pub mod terminal_credentials;
pub mod vault_cli;

pub use terminal_credentials::{default_credential_provider, TerminalCredentialProvider};

/// Installs the `fmt` subscriber used by every trackpage binary. `RUST_LOG` overrides
/// the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
