pub mod config;
pub mod server;
pub mod tailer;

/// Which process a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Tailer,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tailer => "tailer",
            Role::Server => "server",
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Print where a missing config was looked for, then exit.
pub(crate) fn exit_config_not_found(role: Role) -> ! {
    eprintln!("Error: {} config not found", role.as_str());
    eprintln!("Searched locations:");
    eprintln!("  ~/.config/logship/{}.yml", role.as_str());
    eprintln!("  /etc/logship/{}.yml", role.as_str());
    eprintln!(
        "\nUse --config <path> to specify a config file, or run 'logship config init --role {}' to generate one.",
        role.as_str()
    );
    std::process::exit(1);
}
