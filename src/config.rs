use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Password, Select};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::auth::{ClientSettings, RenewalPolicy, DEFAULT_TOKEN_PATH, STORAGE_KEY};

/// OAuth2 Keeper - keeps an OAuth2 client session alive
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Authorization server base URL
    #[arg(short, long, env = "OAUTH_BASE_URL")]
    pub base_url: Option<String>,

    /// OAuth2 client id
    #[arg(short, long, env = "OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Token endpoint path for the authorization code grant
    #[arg(long, env = "OAUTH_ACCESS_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub access_path: String,

    /// Token endpoint path for the refresh token grant
    #[arg(long, env = "OAUTH_REFRESH_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub refresh_path: String,

    /// Revocation endpoint path
    #[arg(long, env = "OAUTH_REVOKE_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub revoke_path: String,

    /// Path to the SQLite credential store (in-memory when unset)
    #[arg(short, long, env = "OAUTH_STORE_FILE")]
    pub store_file: Option<String>,

    /// Key under which the token state is stored
    #[arg(long, env = "OAUTH_STORAGE_KEY", default_value = STORAGE_KEY)]
    pub storage_key: String,

    /// Renewal mode (once, continuous)
    #[arg(long, env = "RENEWAL_MODE", default_value = "continuous")]
    pub renewal_mode: String,

    /// Refresh this many milliseconds before expiry
    #[arg(long, env = "RENEWAL_LEAD_MS", default_value = "60000")]
    pub renewal_lead_ms: u64,

    /// First retry delay after a failed refresh (milliseconds)
    #[arg(long, env = "RENEWAL_BACKOFF_BASE_MS", default_value = "1000")]
    pub renewal_backoff_base_ms: u64,

    /// Maximum retry delay after failed refreshes (milliseconds)
    #[arg(long, env = "RENEWAL_BACKOFF_MAX_MS", default_value = "300000")]
    pub renewal_backoff_max_ms: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub http_connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "0")]
    pub http_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the stored token state
    Status,

    /// Exchange an authorization code for a token
    Access {
        #[arg(long)]
        code: String,
        #[arg(long)]
        redirect_uri: String,
    },

    /// Refresh the stored token
    Refresh,

    /// Revoke the stored token and clear it
    Revoke,

    /// Clear local state and revoke the token remotely
    SignOut,

    /// Print the authorization header
    Header,

    /// Keep the token renewed until interrupted
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Authorization server
    pub base_url: String,
    pub access_path: String,
    pub refresh_path: String,
    pub revoke_path: String,

    // Client registration
    pub client_id: String,
    pub client_secret: Option<String>,

    // Persistence
    pub store_file: Option<PathBuf>,
    pub storage_key: String,

    // Renewal
    pub renewal_mode: RenewalMode,
    pub renewal_lead: Duration,
    pub renewal_backoff_base: Duration,
    pub renewal_backoff_max: Duration,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    pub log_level: String,

    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RenewalMode {
    Once,
    Continuous,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            base_url: args
                .base_url
                .filter(|s| !s.is_empty())
                .context("OAUTH_BASE_URL is required (use -b or set OAUTH_BASE_URL env var)")?,
            access_path: args.access_path,
            refresh_path: args.refresh_path,
            revoke_path: args.revoke_path,

            client_id: args
                .client_id
                .filter(|s| !s.is_empty())
                .context("OAUTH_CLIENT_ID is required (use -c or set OAUTH_CLIENT_ID env var)")?,
            client_secret: args.client_secret.filter(|s| !s.is_empty()),

            store_file: args
                .store_file
                .filter(|s| !s.is_empty())
                .map(|s| expand_tilde(&s)),
            storage_key: args.storage_key,

            renewal_mode: parse_renewal_mode(&args.renewal_mode),
            renewal_lead: Duration::from_millis(args.renewal_lead_ms),
            renewal_backoff_base: Duration::from_millis(args.renewal_backoff_base_ms),
            renewal_backoff_max: Duration::from_millis(args.renewal_backoff_max_ms),

            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,

            command: args.command.unwrap_or(Command::Status),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .with_context(|| format!("OAUTH_BASE_URL is not a valid URL: {}", self.base_url))?;

        if self.renewal_mode == RenewalMode::Continuous
            && self.renewal_backoff_max < self.renewal_backoff_base
        {
            anyhow::bail!(
                "RENEWAL_BACKOFF_MAX_MS ({}) must not be lower than RENEWAL_BACKOFF_BASE_MS ({})",
                self.renewal_backoff_max.as_millis(),
                self.renewal_backoff_base.as_millis()
            );
        }

        Ok(())
    }

    /// Client settings for the token manager
    pub fn client_settings(&self) -> Result<ClientSettings> {
        let mut settings = ClientSettings::with_paths(
            &self.base_url,
            &self.access_path,
            &self.refresh_path,
            &self.revoke_path,
        )?
        .client_id(self.client_id.clone())
        .storage_key(self.storage_key.clone());

        if let Some(secret) = &self.client_secret {
            settings = settings.client_secret(secret.clone());
        }

        Ok(settings)
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        match self.renewal_mode {
            RenewalMode::Once => RenewalPolicy::Once,
            RenewalMode::Continuous => RenewalPolicy::Continuous {
                lead: self.renewal_lead,
                backoff_base: self.renewal_backoff_base,
                backoff_max: self.renewal_backoff_max,
            },
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse renewal mode from string
fn parse_renewal_mode(s: &str) -> RenewalMode {
    match s.to_lowercase().as_str() {
        "once" => RenewalMode::Once,
        _ => RenewalMode::Continuous, // default
    }
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing required values)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_client_id = std::env::var("OAUTH_CLIENT_ID").is_ok();

    !env_file_exists && !has_client_id
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("OAuth2 Keeper - First Time Setup");
    println!();
    println!("No configuration found. Let's register your client.");
    println!();

    let base_url: String = Input::new()
        .with_prompt("Authorization server base URL (OAUTH_BASE_URL)")
        .validate_with(|input: &String| -> Result<(), String> {
            Url::parse(input).map(|_| ()).map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read OAUTH_BASE_URL")?;

    let client_id: String = Input::new()
        .with_prompt("Client id (OAUTH_CLIENT_ID)")
        .interact_text()
        .context("Failed to read OAUTH_CLIENT_ID")?;

    if client_id.is_empty() {
        anyhow::bail!("OAUTH_CLIENT_ID cannot be empty");
    }

    let client_secret: String = Password::new()
        .with_prompt("Client secret (OAUTH_CLIENT_SECRET, empty for public clients)")
        .allow_empty_password(true)
        .interact()
        .context("Failed to read OAUTH_CLIENT_SECRET")?;

    let default_store = default_store_path();
    println!();
    let store_file: String = Input::new()
        .with_prompt("Credential store file (OAUTH_STORE_FILE)")
        .default(default_store)
        .interact_text()
        .context("Failed to read OAUTH_STORE_FILE")?;

    println!();
    let modes = vec!["continuous", "once"];
    let mode_idx = Select::new()
        .with_prompt("Token renewal mode")
        .items(&modes)
        .default(0)
        .interact()
        .context("Failed to read renewal mode selection")?;
    let renewal_mode = modes[mode_idx].to_string();

    let config = InteractiveConfig {
        base_url,
        client_id,
        client_secret,
        store_file,
        renewal_mode,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub store_file: String,
    pub renewal_mode: String,
}

impl InteractiveConfig {
    /// Export as environment variables so `Config::load()` picks them up
    pub fn export(&self) {
        std::env::set_var("OAUTH_BASE_URL", &self.base_url);
        std::env::set_var("OAUTH_CLIENT_ID", &self.client_id);
        if !self.client_secret.is_empty() {
            std::env::set_var("OAUTH_CLIENT_SECRET", &self.client_secret);
        }
        std::env::set_var("OAUTH_STORE_FILE", &self.store_file);
        std::env::set_var("RENEWAL_MODE", &self.renewal_mode);
    }
}

/// Default credential store location under the user data directory
fn default_store_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("oauth2-keeper").join("credentials.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("credentials.sqlite3"))
        .to_string_lossy()
        .to_string()
}

fn render_env_file(config: &InteractiveConfig) -> String {
    format!(
        r#"# OAuth2 Keeper Configuration
# Generated by interactive setup

# Authorization server (required)
OAUTH_BASE_URL={}

# Client registration (id required, secret optional)
OAUTH_CLIENT_ID={}
OAUTH_CLIENT_SECRET={}

# SQLite credential store
OAUTH_STORE_FILE={}

# Token renewal (once, continuous)
RENEWAL_MODE={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.base_url,
        config.client_id,
        config.client_secret,
        config.store_file,
        config.renewal_mode,
    )
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(render_env_file(config).as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
