use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use allochory_channels::presence::format_member;
use allochory_channels::{
    AblyChannel, LocalHub, PubSubChannel, Relay, RelayEvent, RelayOptions, publish_payload,
};
use allochory_core::dispatcher::Dispatcher;
use allochory_core::types::{ChatPayload, InvokeRequest, REQUEST_NAME, response_name};

mod config;

use config::{AllochoryConfig, ChannelProvider};

#[derive(Parser)]
#[command(name = "allochory")]
#[command(version)]
#[command(about = "Allochory: chat and agent invocations over a shared channel")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the channel, serve registered agents, and open the chat prompt
    Start {
        /// Use an in-process channel instead of the configured provider
        #[arg(long)]
        local: bool,
    },

    /// Publish a plain chat message
    Send {
        /// The message text
        text: String,
    },

    /// Publish an invoke request
    Invoke {
        /// Input text for the tool
        text: String,

        /// Target agent id (defaults to dispatch.default_agent)
        #[arg(long)]
        to: Option<String>,

        /// Tool name (defaults to dispatch.default_tool)
        #[arg(long)]
        tool: Option<String>,

        /// Wait up to this many seconds for the agent's response
        #[arg(long)]
        wait: Option<u64>,
    },

    /// List the agents this node registers
    Agents,

    /// Show who is present on the channel
    Roster,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so the chat prompt on stdout stays readable
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Agents => cmd_agents(&cli.config).await,
        Commands::Start { local } => cmd_start(&cli.config, local).await,
        Commands::Send { text } => cmd_send(&cli.config, &text).await,
        Commands::Invoke {
            text,
            to,
            tool,
            wait,
        } => cmd_invoke(&cli.config, &text, to, tool, wait).await,
        Commands::Roster => cmd_roster(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Allochory initialized at {}", config_dir.display());
    println!(
        "Export ABLY_API_KEY and ABLY_CLIENT_ID, or set provider = \"local\" in {}.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    let registry = cfg.build_registry()?;
    if registry.is_empty() {
        println!("No agents configured.");
        return Ok(());
    }
    for descriptor in registry.list() {
        println!("{}  {} [{}]", descriptor.id, descriptor.name, descriptor.tools.join(", "));
        if !descriptor.description.is_empty() {
            println!("    {}", descriptor.description);
        }
    }
    Ok(())
}

/// Open the configured channel, or an in-process one when `force_local` is set
fn open_channel(cfg: &AllochoryConfig, force_local: bool) -> Result<Arc<dyn PubSubChannel>> {
    let client_id = cfg.channel.effective_client_id();
    if force_local || cfg.channel.provider == ChannelProvider::Local {
        let hub = LocalHub::new(&cfg.channel.name, 256);
        info!("Using in-process channel '{}' as {}", cfg.channel.name, client_id);
        return Ok(Arc::new(hub.connect(client_id)));
    }

    cfg.channel.validate_ably()?;
    let channel = AblyChannel::new(
        &cfg.channel.rest_url,
        cfg.channel.name.clone(),
        &cfg.channel.api_key,
        client_id,
        Duration::from_secs(cfg.channel.poll_interval_secs),
    )?
    .with_realtime_url(&cfg.channel.realtime_url)?;
    info!("Connected to Ably channel '{}' as {}", cfg.channel.name, client_id);
    Ok(Arc::new(channel))
}

/// Remote-only commands make no sense against a fresh in-process hub
fn open_remote_channel(cfg: &AllochoryConfig) -> Result<Arc<dyn PubSubChannel>> {
    if cfg.channel.provider == ChannelProvider::Local {
        bail!(
            "This command needs a shared channel. The local provider only exists inside `allochory start`"
        );
    }
    open_channel(cfg, false)
}

async fn cmd_start(config_path: &Option<PathBuf>, local: bool) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    info!("Starting Allochory relay...");

    let registry = Arc::new(cfg.build_registry()?);
    let agent_count = registry.len();
    info!("Registered {} agents", agent_count);

    let channel = open_channel(&cfg, local)?;
    let client_id = channel.client_id().to_string();
    let options = RelayOptions {
        publish_errors: cfg.dispatch.publish_errors,
        greeting: cfg
            .channel
            .greeting
            .then(|| format!("Hello from {}!", client_id)),
    };
    let relay = Arc::new(Relay::new(channel.clone(), Dispatcher::new(registry), options));

    let mut events = relay.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("UI fell behind, {} events skipped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let entered = relay.announce().await;
    info!("Announced {} agents in presence", entered);
    if entered < agent_count {
        eprintln!(
            "[presence] only {} of {} agents are visible to other participants, see the log for details",
            entered, agent_count
        );
    }

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(relay.clone().run(cancel.clone()));

    println!("Allochory is running on '{}' as {}.", channel.name(), client_id);
    println!(
        "Type a message to chat, or /invoke <text> to ask {}. Also: /agents /history /quit",
        cfg.dispatch.default_agent
    );

    let mut input = spawn_stdin_reader();
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = input.recv(), if input_open => {
                let Some(line) = line else {
                    // stdin closed: keep serving until Ctrl+C
                    input_open = false;
                    continue;
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Agents => {
                        for member in relay.roster().snapshot().await {
                            println!("  {}", format_member(&member));
                        }
                    }
                    Input::History => {
                        for entry in relay.history().snapshot().await {
                            println!("  {}", entry);
                        }
                    }
                    Input::Invoke(text) => {
                        let request = InvokeRequest::new(
                            cfg.dispatch.default_tool.clone(),
                            text,
                            client_id.clone(),
                            cfg.dispatch.default_agent.clone(),
                        );
                        if let Err(e) = publish_payload(channel.as_ref(), REQUEST_NAME, &request).await {
                            error!("Failed to publish invoke request: {:#}", e);
                        }
                    }
                    Input::Chat(text) => {
                        let payload = ChatPayload::new(text, client_id.clone());
                        if let Err(e) = publish_payload(channel.as_ref(), &client_id, &payload).await {
                            error!("Failed to publish message: {:#}", e);
                        }
                    }
                }
            }
        }
    }

    cancel.cancel();
    match runner.await {
        Ok(Err(e)) => error!("Relay stopped with error: {:#}", e),
        Err(e) => error!("Relay task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = channel.close().await {
        warn!("Failed to close channel: {:#}", e);
    }
    drop(relay);
    printer.abort();

    println!("Allochory stopped.");
    Ok(())
}

fn render_event(event: &RelayEvent) {
    match event {
        RelayEvent::MessageAppended(entry) => println!("{}", entry),
        RelayEvent::ResponsePublished { .. } => {}
        RelayEvent::DispatchFailed { kind, message } => eprintln!("[{}] {}", kind, message),
        RelayEvent::RosterChanged(members) => {
            let names: Vec<String> = members.iter().map(format_member).collect();
            if names.is_empty() {
                println!("Online agents: none");
            } else {
                println!("Online agents: {}", names.join("; "));
            }
        }
    }
}

/// A line typed at the chat prompt
#[derive(Debug, PartialEq)]
enum Input {
    Empty,
    Quit,
    Agents,
    History,
    Invoke(String),
    Chat(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    match line {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/agents" => Input::Agents,
        "/history" => Input::History,
        _ => match line.strip_prefix("/invoke ") {
            Some(text) if !text.trim().is_empty() => Input::Invoke(text.trim().to_string()),
            _ => Input::Chat(line.to_string()),
        },
    }
}

/// Read stdin lines on a plain thread; the receiver closes at EOF
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn cmd_send(config_path: &Option<PathBuf>, text: &str) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    let channel = open_remote_channel(&cfg)?;
    let client_id = channel.client_id().to_string();

    publish_payload(channel.as_ref(), &client_id, &ChatPayload::new(text, client_id.clone())).await?;
    println!("Sent to {}.", channel.name());
    Ok(())
}

async fn cmd_invoke(
    config_path: &Option<PathBuf>,
    text: &str,
    to: Option<String>,
    tool: Option<String>,
    wait: Option<u64>,
) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    let channel = open_remote_channel(&cfg)?;

    let to = to.unwrap_or_else(|| cfg.dispatch.default_agent.clone());
    let tool = tool.unwrap_or_else(|| cfg.dispatch.default_tool.clone());
    let request = InvokeRequest::new(tool, text, channel.client_id(), to.clone());
    let conversation_id = request.conversation_id.clone().unwrap_or_default();

    // Subscribe before publishing so the response cannot slip past
    let responses = match wait {
        Some(_) => Some(channel.subscribe().await?),
        None => None,
    };

    publish_payload(channel.as_ref(), REQUEST_NAME, &request).await?;
    println!("Invoke request sent to {} (conversation {}).", to, conversation_id);

    if let (Some(mut responses), Some(secs)) = (responses, wait) {
        let expected_name = response_name(&to);
        let waited = tokio::time::timeout(Duration::from_secs(secs), async {
            while let Some(message) = responses.recv().await {
                let same_conversation = message
                    .data
                    .get("conversation_id")
                    .and_then(|v| v.as_str())
                    .is_none_or(|id| id == conversation_id);
                if message.name == expected_name && same_conversation {
                    return Some(message);
                }
            }
            None
        })
        .await;

        match waited {
            Ok(Some(message)) => {
                let text = message.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                println!("{}: {}", message.name, text);
            }
            Ok(None) => println!("Channel closed before a response arrived."),
            Err(_) => println!("No response within {}s.", secs),
        }
    }

    channel.close().await?;
    Ok(())
}

async fn cmd_roster(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AllochoryConfig::load(config_path)?;
    let channel = open_remote_channel(&cfg)?;
    let members = channel.presence_members().await?;
    if members.is_empty() {
        println!("Nobody is present on {}.", channel.name());
    }
    for member in members {
        println!("{} [{}]", format_member(&member), member.status);
    }
    Ok(())
}
