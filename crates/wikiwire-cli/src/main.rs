//! `wikiwire` command-line client.
//!
//! A thin wrapper around the wikiwire-protocol facade that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Connects and probes the server
//! 4. Runs one command and prints the result

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use wikiwire_protocol::{
    Client, ClientConfig, Credentials, ModuleInput, PageSetSelector, QueryStatus, TokenKind,
    TokenScope,
};

#[derive(Parser)]
#[command(
    name = "wikiwire",
    about = "Client for MediaWiki-style action APIs",
    version,
    long_about = "Talks to a wiki's api.php endpoint in whichever protocol dialect the \
                  server speaks: probes the server, runs paginated list queries and \
                  fetches tokens."
)]
struct Cli {
    /// API endpoint URL (e.g. https://en.wikipedia.org/w/api.php)
    #[arg(long, env = "WIKIWIRE_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Set the logging level (overrides RUST_LOG)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected server version, protocol generation and lag support
    Site,

    /// Run a list module to exhaustion and print the merged items
    List {
        /// List module name, e.g. categorymembers
        module: String,

        /// Parameter prefix of the module, e.g. cm
        #[arg(long)]
        prefix: String,

        /// Module parameter without prefix, as name=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Stop after this many items
        #[arg(long)]
        max_items: Option<usize>,

        /// Items per request
        #[arg(long)]
        batch: Option<u32>,
    },

    /// Fetch a token, logging in first when credentials are given
    Token {
        /// Token kind: csrf, edit, watch, patrol, rollback, userrights, login, ...
        kind: TokenKind,

        #[arg(long, env = "WIKIWIRE_USER")]
        user: Option<String>,

        #[arg(long, env = "WIKIWIRE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Page the token is for (rollback on older servers)
        #[arg(long)]
        page: Option<String>,

        /// User the token is for (rollback and userrights on older servers)
        #[arg(long)]
        target_user: Option<String>,
    },
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{s}'"))
}

fn init_logging(level: Option<LogLevel>) {
    let filter = match level {
        Some(level) => EnvFilter::new(Level::from(level).as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn scope_for(
    kind: TokenKind,
    page: Option<String>,
    target_user: Option<String>,
) -> Result<TokenScope> {
    Ok(match (kind, page, target_user) {
        (TokenKind::Rollback, Some(page), Some(user)) => TokenScope::PageUser { page, user },
        (TokenKind::Rollback, _, _) => TokenScope::Session,
        (TokenKind::UserRights, _, Some(user)) => TokenScope::User(user),
        (_, None, None) => TokenScope::Session,
        (kind, _, _) => bail!("--page/--target-user do not apply to {kind} tokens"),
    })
}

async fn connect(endpoint: Option<String>) -> Result<Client> {
    let mut config = ClientConfig::from_env().context("Invalid WIKIWIRE_* environment")?;
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    Client::connect(config)
        .await
        .context("Failed to connect to the API endpoint")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let client = connect(cli.endpoint).await?;

    match cli.command {
        Commands::Site => {
            let site = client.site();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&site)?);
            } else {
                println!("Site:       {}", site.site_name.as_deref().unwrap_or("(unnamed)"));
                println!("Version:    {}", site.version);
                println!("Protocol:   {}", site.generation);
                println!("Lag checks: {}", if client.lag_checking() { "yes" } else { "no" });
            }
        }
        Commands::List {
            module,
            prefix,
            params,
            max_items,
            batch,
        } => {
            let mut input = ModuleInput::list(&module, &prefix);
            for (name, value) in params {
                input = input.param(&name, value);
            }
            if let Some(max) = max_items {
                input = input.max_items(max);
            }
            if let Some(batch) = batch {
                input = input.batch_size(batch);
            }

            let result = client
                .query(vec![input], PageSetSelector::None)
                .collect()
                .await
                .with_context(|| format!("list={module} failed"))?;
            let items = result.data.list(&module);

            if cli.json {
                println!("{}", serde_json::to_string_pretty(items)?);
            } else {
                for item in items {
                    match item.get("title").and_then(Value::as_str) {
                        Some(title) => println!("{title}"),
                        None => println!("{item}"),
                    }
                }
            }
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
            if let QueryStatus::Failed { code, info, .. } = &result.status {
                bail!("query stopped early ({code}): {info}");
            }
            tracing::info!("{} item(s) in {} round(s)", items.len(), result.rounds);
        }
        Commands::Token {
            kind,
            user,
            password,
            page,
            target_user,
        } => {
            if let (Some(user), Some(password)) = (user, password) {
                let handle = client.login(&Credentials::new(user, password)).await?;
                tracing::info!("Logged in as {}", handle.user_name);
            }
            let scope = scope_for(kind, page, target_user)?;
            let token = client.token(kind, scope).await?;
            println!("{}", token.value);
        }
    }

    Ok(())
}
