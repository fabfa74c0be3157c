//! CLI administration tool for site-pipeline.
//!
//! Manages API tokens and drives the pipeline directly, without going through
//! the HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Create a new API token
//! cargo run --bin admin -- token create
//!
//! # List all tokens
//! cargo run --bin admin -- token list
//!
//! # Revoke a token
//! cargo run --bin admin -- token revoke "CI deploys"
//!
//! # Build site 3 locally
//! cargo run --bin admin -- site generate 3
//!
//! # Deploy site 3
//! cargo run --bin admin -- site deploy 3 --domain harbour.example.test \
//!     --address 203.0.113.10 --user deploy --key /etc/pipeline/keys/id_ed25519 \
//!     --remote-root /srv/sites --app-port 4100
//!
//! # Check database connection
//! cargo run --bin admin -- db check
//! ```
//!
//! # Environment Variables
//!
//! Same as the server; see `site_pipeline::config`.

use site_pipeline::api::dto::{AuthBody, DeployBody, HostBody};
use site_pipeline::application::services::{AuthService, DeployRequest, PipelineService};
use site_pipeline::config::{self, Config};
use site_pipeline::domain::entities::DeploymentRecord;
use site_pipeline::server;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use dialoguer::{Confirm, Input, Password};
use sqlx::PgPool;
use validator::Validate;

/// CLI tool for managing site-pipeline.
#[derive(Parser)]
#[command(name = "admin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Top-level command groups.
#[derive(Subcommand)]
enum Commands {
    /// Manage API tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Build and deploy sites
    Site {
        #[command(subcommand)]
        action: SiteAction,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

/// Token management subcommands.
#[derive(Subcommand)]
enum TokenAction {
    /// Create a new API token
    Create {
        /// Token name (e.g., "CI deploys")
        #[arg(short, long)]
        name: Option<String>,

        /// Custom token value (optional, auto-generated if not provided)
        #[arg(short, long)]
        token: Option<String>,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List all tokens
    List,

    /// Revoke a token
    Revoke {
        /// Token name or ID to revoke
        name_or_id: String,
    },
}

/// Pipeline subcommands.
#[derive(Subcommand)]
enum SiteAction {
    /// Build a site into the local build root
    Generate { site_id: i64 },

    /// Build, package and deploy a site to a remote host
    Deploy {
        site_id: i64,

        #[command(flatten)]
        target: DeployArgs,
    },

    /// Show the current deployment record and recent attempts
    Status {
        site_id: i64,

        /// Number of finished attempts to show
        #[arg(short, long, default_value_t = 5)]
        limit: i64,
    },

    /// Remove local builds and bundles of a site
    Cleanup { site_id: i64 },
}

#[derive(Args)]
struct DeployArgs {
    /// Public domain the site is served under
    #[arg(long)]
    domain: String,

    /// Host name or IP of the target
    #[arg(long)]
    address: String,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(long)]
    user: String,

    /// Private key path; prompts for a password when neither this nor --agent is set
    #[arg(long, conflicts_with = "agent")]
    key: Option<String>,

    /// Authenticate with the local ssh agent
    #[arg(long)]
    agent: bool,

    #[arg(long, default_value = "/srv/sites")]
    remote_root: String,

    /// Base port of the blue/green pair
    #[arg(long)]
    app_port: u16,
}

/// Database operation subcommands.
#[derive(Subcommand)]
enum DbAction {
    /// Check database connection
    Check,

    /// Show database info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = config::load_from_env()?;

    let pool = server::connect_pool(&config).await?;

    match cli.command {
        Commands::Token { action } => handle_token_action(action, &config, pool).await?,
        Commands::Site { action } => handle_site_action(action, &config, pool).await?,
        Commands::Db { action } => handle_db_action(action, &pool).await?,
    }

    Ok(())
}

/// Dispatches token management commands.
async fn handle_token_action(action: TokenAction, config: &Config, pool: PgPool) -> Result<()> {
    let state = server::build_state(config, pool);
    let auth = state.auth_service;

    match action {
        TokenAction::Create { name, token, yes } => create_token(&auth, name, token, yes).await?,
        TokenAction::List => list_tokens(&auth).await?,
        TokenAction::Revoke { name_or_id } => revoke_token(&auth, name_or_id).await?,
    }

    Ok(())
}

/// Creates a new API token with interactive prompts.
///
/// Only the HMAC of the token is stored; the raw value is shown once.
async fn create_token(
    auth: &AuthService,
    name: Option<String>,
    token: Option<String>,
    skip_confirm: bool,
) -> Result<()> {
    println!("{}", "🔑 Create API Token".bright_blue().bold());
    println!();

    let token_name = match name {
        Some(n) => n,
        None => Input::new()
            .with_prompt("Token name")
            .with_initial_text("CI deploys")
            .interact_text()?,
    };

    if token.is_some() {
        println!("{}", "⚠️  Using provided token value".yellow());
    }

    if !skip_confirm {
        let confirmed = Confirm::new()
            .with_prompt(format!("Create token '{token_name}'?"))
            .default(true)
            .interact()?;

        if !confirmed {
            println!("{}", "❌ Cancelled".red());
            return Ok(());
        }
    }

    let (stored, raw) = auth
        .issue(&token_name, token)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create token: {}", e))?;

    println!();
    println!("{}", "✅ Token created successfully!".green().bold());
    println!("  ID:    {}", stored.id.to_string().bright_black());
    println!("  Name:  {}", stored.name.cyan());
    println!("  Token: {}", raw.bright_yellow().bold());
    println!();
    println!(
        "{}",
        "⚠️  IMPORTANT: Save this token now! You won't be able to see it again."
            .red()
            .bold()
    );
    println!();
    println!("{}", "Example:".bright_white());
    println!(
        "  curl -H \"Authorization: Bearer {}\" http://localhost:3000/api/sites/1/status",
        raw.bright_yellow()
    );
    println!();

    Ok(())
}

/// Lists all API tokens with status indicators.
async fn list_tokens(auth: &AuthService) -> Result<()> {
    println!("{}", "📋 API Tokens".bright_blue().bold());
    println!();

    let tokens = auth
        .list()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list tokens: {}", e))?;

    if tokens.is_empty() {
        println!("{}", "  No tokens found".yellow());
        println!();
        println!(
            "  Create one with: {} admin token create",
            "cargo run --bin".bright_cyan()
        );
        return Ok(());
    }

    println!(
        "  {:<4} {:<28} {:<17} {:<17} {:<8}",
        "ID".bright_white().bold(),
        "Name".bright_white().bold(),
        "Created".bright_white().bold(),
        "Last used".bright_white().bold(),
        "Status".bright_white().bold()
    );
    println!("  {}", "─".repeat(80).bright_black());

    for token in &tokens {
        let status = if token.revoked_at.is_some() {
            "REVOKED".red()
        } else {
            "ACTIVE".green()
        };
        let last_used = token
            .last_used_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!(
            "  {:<4} {:<28} {:<17} {:<17} {}",
            token.id.to_string().bright_black(),
            token.name.cyan(),
            token
                .created_at
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .bright_black(),
            last_used.bright_black(),
            status
        );
    }

    println!();
    println!(
        "  Total: {}",
        tokens.len().to_string().bright_white().bold()
    );
    println!();

    Ok(())
}

/// Revokes a token by name or ID with confirmation prompt.
async fn revoke_token(auth: &AuthService, name_or_id: String) -> Result<()> {
    println!("{}", "🔒 Revoke API Token".bright_blue().bold());
    println!();

    let token = auth
        .find(&name_or_id)
        .await
        .map_err(|e| anyhow::anyhow!("Database error: {}", e))?
        .context("Token not found")?;

    if token.revoked_at.is_some() {
        println!("{}", "⚠️  This token is already revoked".yellow());
        return Ok(());
    }

    println!("  Token: {}", token.name.cyan());
    println!("  ID:    {}", token.id.to_string().bright_black());
    println!();

    let confirmed = Confirm::new()
        .with_prompt("Revoke this token?")
        .default(false)
        .interact()?;

    if !confirmed {
        println!("{}", "❌ Cancelled".red());
        return Ok(());
    }

    auth.revoke(token.id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to revoke token: {}", e))?;

    println!();
    println!("{}", "✅ Token revoked successfully!".green().bold());
    println!();

    Ok(())
}

/// Dispatches pipeline commands.
async fn handle_site_action(action: SiteAction, config: &Config, pool: PgPool) -> Result<()> {
    for dir in [&config.build_root, &config.bundle_root, &config.ssh_control_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let state = server::build_state(config, pool);
    let pipeline = state.pipeline;

    match action {
        SiteAction::Generate { site_id } => generate_site(&pipeline, site_id).await?,
        SiteAction::Deploy { site_id, target } => deploy_site(&pipeline, site_id, target).await?,
        SiteAction::Status { site_id, limit } => show_status(&pipeline, site_id, limit).await?,
        SiteAction::Cleanup { site_id } => {
            let report = pipeline.cleanup(site_id).await?;
            println!(
                "{} builds removed: {}, bundles removed: {}",
                "🧹".bright_blue(),
                report.builds_removed,
                report.bundles_removed
            );
        }
    }

    Ok(())
}

async fn generate_site(pipeline: &PipelineService, site_id: i64) -> Result<()> {
    println!("{}", format!("🏗️  Building site {site_id}").bright_blue().bold());

    let report = pipeline.generate(site_id).await?;

    println!("  Artifact: {}", report.artifact_path.bright_white());
    println!("  Pages:    {}", report.page_count.to_string().bright_green());
    if report.no_published_pages {
        println!("{}", "  ⚠️  Site has no published pages".yellow());
    }
    for page in &report.degraded {
        println!("  {} {}", "degraded".yellow(), page.slug);
    }
    if !report.media_fallbacks.is_empty() {
        println!(
            "  {} {} media item(s) use the fallback URL",
            "⚠️ ".yellow(),
            report.media_fallbacks.len()
        );
    }
    for token in &report.rejected_theme_tokens {
        println!("  {} {}", "rejected theme token".yellow(), token);
    }
    println!("{}", "✅ Build complete".green().bold());

    Ok(())
}

async fn deploy_site(pipeline: &PipelineService, site_id: i64, target: DeployArgs) -> Result<()> {
    let auth = if target.agent {
        AuthBody::Agent
    } else if let Some(path) = target.key {
        AuthBody::Key { path }
    } else {
        AuthBody::Password {
            password: Password::new().with_prompt("SSH password").interact()?,
        }
    };

    let body = DeployBody {
        domain: target.domain,
        host: HostBody {
            address: target.address,
            port: target.port,
            user: target.user,
            auth,
            remote_root: target.remote_root,
            app_port: target.app_port,
        },
    };
    body.validate().context("Invalid deploy target")?;
    let request = DeployRequest::from(body);

    println!(
        "{}",
        format!("🚀 Deploying site {site_id} to {}", request.domain)
            .bright_blue()
            .bold()
    );

    match pipeline.deploy(site_id, request).await {
        Ok(record) => {
            print_record(&record);
            println!("{}", "✅ Site is live".green().bold());
            Ok(())
        }
        Err(e) => {
            if let Some(record) = &e.record {
                print_record(record);
                if let Some(output) = &record.command_output {
                    println!("{}", "Command output:".bright_white());
                    println!("{}", output.bright_black());
                }
            }
            Err(e.into())
        }
    }
}

async fn show_status(pipeline: &PipelineService, site_id: i64, limit: i64) -> Result<()> {
    match pipeline.status(site_id).await? {
        Some(record) => print_record(&record),
        None => println!("{}", "  Site has never been deployed".yellow()),
    }

    let attempts = pipeline.history(site_id, limit).await?;
    if attempts.is_empty() {
        return Ok(());
    }

    println!();
    println!("{}", "Recent attempts:".bright_white().bold());
    for attempt in attempts {
        println!(
            "  {} {:<10} {:<12} {}",
            attempt
                .finished_at
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .bright_black(),
            attempt.state.to_string(),
            attempt.stage.map(|s| s.to_string()).unwrap_or_default(),
            attempt.last_error.unwrap_or_default().red()
        );
    }

    Ok(())
}

fn print_record(record: &DeploymentRecord) {
    println!("  Site:    {}", record.site_id.to_string().bright_white());
    println!("  Domain:  {}", record.domain.cyan());
    println!("  State:   {}", record.state.to_string().bright_white().bold());
    if let Some(stage) = record.stage {
        println!("  Stage:   {stage}");
    }
    if let Some(live) = &record.live {
        println!(
            "  Live:    {} slot on port {} ({})",
            live.slot.as_str(),
            live.port,
            live.release_path.bright_black()
        );
    }
    if let Some(error) = &record.last_error {
        println!("  Error:   {}", error.red());
    }
}

/// Handles database diagnostic commands.
async fn handle_db_action(action: DbAction, pool: &PgPool) -> Result<()> {
    match action {
        DbAction::Check => {
            println!("{}", "🔍 Checking database connection...".bright_blue());

            sqlx::query("SELECT 1").fetch_one(pool).await?;

            println!("{}", "✅ Database connection OK".green().bold());
        }
        DbAction::Info => {
            println!("{}", "ℹ️  Database Information".bright_blue().bold());
            println!();

            let version: String = sqlx::query_scalar("SELECT version()")
                .fetch_one(pool)
                .await?;
            let sites: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sites")
                .fetch_one(pool)
                .await?;
            let live: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM deployments WHERE state = 'live'")
                    .fetch_one(pool)
                    .await?;

            println!("  PostgreSQL: {}", version.bright_white());
            println!("  Sites:      {}", sites.to_string().bright_green().bold());
            println!("  Live:       {}", live.to_string().bright_green().bold());
            println!();
        }
    }

    Ok(())
}
