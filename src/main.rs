use anyhow::Result;
use std::sync::Arc;

use oauth2_keeper::auth::{renewal, token_preview, TokenManager, TokenState, TracingListener};
use oauth2_keeper::config::{self, Command, Config};
use oauth2_keeper::http_client::ReqwestTransport;
use oauth2_keeper::store;

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        interactive_config.export();
    }

    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Authorization server: {}", config.base_url);

    let store = store::open_store(config.store_file.as_deref());

    let transport = Arc::new(ReqwestTransport::new(
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?);

    let manager = Arc::new(TokenManager::new(
        config.client_settings()?,
        store,
        transport,
    ));
    manager.subscribe(Arc::new(TracingListener));

    match config.command.clone() {
        Command::Status => print_status(&manager).await,
        Command::Access { code, redirect_uri } => {
            let state = manager.sign_in(&code, &redirect_uri).await?;
            print_state(&state)?;
        }
        Command::Refresh => {
            let state = manager.refresh().await?;
            print_state(&state)?;
        }
        Command::Revoke => {
            if let Some(payload) = manager.revoke().await? {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
        }
        Command::SignOut => {
            manager.sign_out().await?;
            println!("Signed out");
        }
        Command::Header => {
            let header = manager.authorization_header().await?;
            println!("Authorization: {}", header.authorization);
        }
        Command::Watch => watch(manager, &config).await,
    }

    Ok(())
}

/// Print whether the stored token is usable
async fn print_status(manager: &TokenManager) {
    match manager.load().await {
        Some(state) => {
            let authenticated = manager.is_authenticated().await;
            println!("  Authenticated: {}", authenticated);
            println!(
                "  Access token:  {}",
                state.access_token.as_deref().map(token_preview).unwrap_or_default()
            );
            println!(
                "  Refreshable:   {}",
                if state.refresh_token.is_some() { "yes" } else { "no" }
            );
            println!("  Expires in:    {}s", manager.expires_in().await / 1000);
        }
        None => println!("  Not authenticated"),
    }
}

/// Print a token state with secrets masked
fn print_state(state: &TokenState) -> Result<()> {
    let mut masked = state.clone();
    masked.access_token = masked.access_token.as_deref().map(token_preview);
    masked.refresh_token = masked.refresh_token.as_deref().map(token_preview);
    println!("{}", serde_json::to_string_pretty(&masked)?);
    Ok(())
}

/// Run the renewal scheduler until shutdown
async fn watch(manager: Arc<TokenManager>, config: &Config) {
    let policy = config.renewal_policy();
    tracing::info!("Token renewal started ({:?})", config.renewal_mode);

    let handle = renewal::spawn(manager, policy);

    shutdown_signal().await;
    handle.stop();

    tracing::info!("Token renewal stopped");
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
