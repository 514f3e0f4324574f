//! Courier Tunnel proxy host
//!
//! Logs into the chat service, then serves tunnel traffic for authorized
//! senders: encrypted packets arriving in conversations become real HTTP
//! requests and TCP connections on the local network, with results streamed
//! back the same way.

use anyhow::{bail, Context, Result};
use clap::Parser;
use courier_tunnel::{
    auth::Whitelist,
    config::Config,
    session::{Multiplexer, MuxConfig},
    storage::{AuthStore, Credentials},
    transport::{ChatTransport, WsChatClient},
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Courier Tunnel host - tunnel HTTP and TCP through a chat messenger
#[derive(Parser, Debug)]
#[command(name = "courier-host")]
#[command(about = "Courier Tunnel host - serves tunnel sessions over chat conversations")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Whitelist file path (overrides config)
    #[arg(short, long)]
    whitelist: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Write a default configuration file and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.write_config {
        Config::default().save(&args.config)?;
        println!("wrote {}", args.config);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(level.as_str());
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }

    let (client, events) = WsChatClient::connect(
        &config.transport.url,
        config.transport.request_timeout(),
    )
    .await
    .context("Failed to connect to the chat service")?;

    let store = AuthStore::new(&config.paths.auth_data);
    let credentials = login(&client, &store).await?;

    let login_info = client
        .present_token(&credentials.token)
        .await
        .context("Token presentment failed")?;
    let display_name = login_info
        .profile
        .contact
        .names
        .first()
        .map(|n| n.name.clone())
        .unwrap_or_else(|| login_info.profile.contact.id.to_string());
    info!("Logged in as {}", display_name);

    let whitelist_path = args
        .whitelist
        .as_deref()
        .unwrap_or(&config.paths.whitelist);
    let whitelist = Whitelist::load(whitelist_path);
    if whitelist.is_empty() {
        warn!("whitelist is empty, every sender will be ignored");
    } else {
        info!("{} authorized sender(s)", whitelist.len());
    }

    let mux = Multiplexer::new(
        Arc::new(client),
        Arc::new(whitelist),
        credentials,
        MuxConfig::from_config(&config),
    )?;
    mux.run(events).await?;
    Ok(())
}

/// Present stored credentials, or run the interactive first-login flow.
/// A rejected verification code is fatal.
async fn login(client: &WsChatClient, store: &AuthStore) -> Result<Credentials> {
    if let Some(credentials) = store.load() {
        client
            .present_device(&credentials.device_id)
            .await
            .context("Device presentment failed")?;
        return Ok(credentials);
    }

    let device_id = uuid::Uuid::new_v4().to_string();
    client
        .present_device(&device_id)
        .await
        .context("Device presentment failed")?;

    let phone = prompt("phone: ")?;
    let verify_token = client
        .request_code(&phone)
        .await
        .context("Verification code request failed")?;

    let code = prompt("sms code: ")?;
    let Some(token) = client.present_code(&verify_token, &code).await? else {
        bail!("wrong code!");
    };

    let credentials = Credentials { device_id, token };
    store
        .save(&credentials)
        .context("Failed to persist credentials")?;
    Ok(credentials)
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
