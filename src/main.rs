//! fitsession - session client for the fitness booking API
//!
//! Manages the login session (token storage, refresh, logout) and issues
//! authenticated requests against the backend.

mod api;
mod auth;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::ApiClient;
use crate::auth::{
    AccessTokenOptions, AuthEvent, ExpiresIn, FileStorage, HttpRefreshTransport, TokenGrant,
    TokenManager, TokenStore,
};
use crate::config::Config;

#[derive(Parser)]
#[command(name = "fitsession")]
#[command(about = "Session client for the fitness booking API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store tokens issued by a login or registration
    Login {
        #[arg(long)]
        access_token: String,

        #[arg(long)]
        refresh_token: String,

        /// Lifetime in seconds, or an absolute ISO 8601 date
        #[arg(long)]
        expires_in: Option<String>,
    },

    /// Log out and clear stored credentials
    Logout,

    /// Show current session status
    Status,

    /// Print a usable access token, refreshing it if needed
    Token {
        /// Print the stored token without refreshing
        #[arg(long)]
        no_refresh: bool,
    },

    /// Authenticated GET against the API, relative to the base URL
    Get {
        path: String,
    },
}

fn parse_expires_in(raw: String) -> ExpiresIn {
    match raw.trim().parse::<u64>() {
        Ok(secs) => ExpiresIn::Seconds(secs),
        Err(_) => ExpiresIn::At(raw),
    }
}

/// Forward session events to the log
fn spawn_event_logger(manager: &TokenManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                AuthEvent::TokenRefreshed { .. } => tracing::info!("Session refreshed"),
                AuthEvent::TokenExpired { reason } => {
                    tracing::warn!("Session expired: {}", reason)
                }
                AuthEvent::AuthenticationFailed { error } => {
                    tracing::warn!("Authentication failed: {}", error)
                }
                AuthEvent::TokensCleared => tracing::info!("Session cleared"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;
    let storage = FileStorage::new(config.storage_dir()?);
    let manager = TokenManager::new(TokenStore::new(Arc::new(storage)));

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    manager.set_transport(Arc::new(HttpRefreshTransport::new(
        http.clone(),
        config.refresh_url()?,
    )));
    manager.hydrate().await;
    spawn_event_logger(&manager);

    match cli.command {
        Commands::Login {
            access_token,
            refresh_token,
            expires_in,
        } => {
            let mut grant = TokenGrant::new(access_token, refresh_token);
            grant.expires_in = expires_in.map(parse_expires_in);
            manager
                .store_tokens(grant)
                .await
                .context("Failed to store tokens")?;
            println!("Logged in.");
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            manager
                .clear_tokens()
                .await
                .context("Failed to clear tokens")?;
            println!("Logged out.");
        }
        Commands::Status => {
            let status = manager.status().await;
            if status.authenticated {
                println!("Session:     authenticated");
            } else {
                println!("Session:     none");
            }
            if let Some(exp) = status.expires_at {
                println!("  expires_at: {}", exp);
            }
            println!("Failures:    {}", status.consecutive_failures);
            if status.refreshing {
                println!("Refresh:     in progress");
            }
            if !status.authenticated {
                println!("\nRun 'fitsession login' to authenticate.");
            }
        }
        Commands::Token { no_refresh } => {
            let opts = AccessTokenOptions {
                skip_refresh: no_refresh,
            };
            match manager.access_token(opts).await {
                Some(token) => println!("{}", token),
                None => anyhow::bail!("Not logged in. Run 'fitsession login'."),
            }
        }
        Commands::Get { path } => {
            let client = ApiClient::new(http, config.base_url()?, manager.clone());
            let resp = client.get(&path).await?;
            let body = resp.text().await.context("Failed to read response body")?;
            println!("{}", body);
        }
    }

    Ok(())
}
