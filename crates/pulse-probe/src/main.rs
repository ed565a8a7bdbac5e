use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::WrapErr;
use pulse_channel::{
    ChannelConfig, ChannelKey, ChannelKind, ChannelRegistry, ConnectionManager, Event, EventStream,
    Message, RegistryConfig,
};
use tokio::runtime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Attach to a pulse channel and print every event it delivers.
///
/// Examples:
///   pulse-probe attach wss://dash.example.com/ws/chat/lobby
///   pulse-probe channel wss://dash.example.com/ws chat lobby --tenant acme --token t0k
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect straight to a channel endpoint URL
    #[command(alias = "a")]
    Attach(AttachCmd),

    /// Resolve a channel key against a base URL, the way the registry does
    #[command(alias = "c")]
    Channel(ChannelCmd),
}

#[derive(Args)]
struct AttachCmd {
    /// The WebSocket URL to connect to (ws:// or wss://)
    url: Url,

    #[command(flatten)]
    opts: ProbeOpts,
}

#[derive(Args)]
struct ChannelCmd {
    /// Base URL shared by every channel (ws:// or wss://)
    base: Url,

    /// Channel family
    #[arg(value_enum)]
    kind: Kind,

    /// Room or stream name
    room: String,

    /// Tenant scope, sent as the `tenant` query parameter
    #[arg(long)]
    tenant: Option<String>,

    /// Opaque credential appended to the URL
    #[arg(long)]
    token: Option<String>,

    #[command(flatten)]
    opts: ProbeOpts,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Chat,
    Infrastructure,
}

impl From<Kind> for ChannelKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Chat => ChannelKind::Conversation,
            Kind::Infrastructure => ChannelKind::Infrastructure,
        }
    }
}

#[derive(Args)]
struct ProbeOpts {
    /// Fixed delay between reconnect attempts, e.g. "5s", "500ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    reconnect_interval: Option<Duration>,

    /// Automatic reconnect attempts before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Interval between heartbeat pings
    #[arg(long, value_parser = humantime::parse_duration)]
    heartbeat: Option<Duration>,

    /// Drop the connection after this much silence
    #[arg(long, value_parser = humantime::parse_duration)]
    liveness_timeout: Option<Duration>,

    /// Maximum duration to wait when establishing a connection
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "10s")]
    timeout: Duration,

    /// JSON messages to send once connected. Each must carry a "type" field.
    #[arg(short, long = "send", value_name = "JSON")]
    messages: Vec<String>,

    /// Extra message tags to print as typed events, e.g. "chat_message"
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Pretty-print message bodies
    #[arg(long)]
    pretty: bool,
}

impl ProbeOpts {
    fn apply(&self, mut config: ChannelConfig) -> ChannelConfig {
        if let Some(interval) = self.reconnect_interval {
            config = config.reconnect_interval(interval);
        }
        if let Some(attempts) = self.max_attempts {
            config = config.max_reconnect_attempts(attempts);
        }
        if let Some(interval) = self.heartbeat {
            config = config.heartbeat_interval(interval);
        }
        if self.liveness_timeout.is_some() {
            config = config.liveness_timeout(self.liveness_timeout);
        }
        config.connect_timeout(self.timeout)
    }

    fn outbound(&self) -> eyre::Result<Vec<Message>> {
        self.messages
            .iter()
            .map(|raw| Message::parse(raw).wrap_err_with(|| format!("invalid message: {raw}")))
            .collect()
    }

    fn event_names(&self) -> Vec<String> {
        ["connected", "disconnected", "error", "reconnect_failed", "message"]
            .into_iter()
            .map(str::to_string)
            .chain(self.tags.iter().cloned())
            .collect()
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pulse_channel=info,pulse_probe=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let res = match args.command {
        Commands::Attach(cmd) => run_attach(cmd),
        Commands::Channel(cmd) => run_channel(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
        std::process::exit(1);
    }
}

fn block_on<F: std::future::Future<Output = eyre::Result<()>>>(fut: F) -> eyre::Result<()> {
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(fut)
}

fn run_attach(cmd: AttachCmd) -> eyre::Result<()> {
    block_on(async move {
        let outbound = cmd.opts.outbound()?;
        let config = cmd.opts.apply(ChannelConfig::new(cmd.url.as_str()));
        let manager = ConnectionManager::new(config)?;
        let events = manager.listen(cmd.opts.event_names());
        manager.connect();

        let result = probe(events, &outbound, cmd.opts.pretty, |msg| manager.send(msg)).await;
        manager.disconnect();
        result
    })
}

fn run_channel(cmd: ChannelCmd) -> eyre::Result<()> {
    block_on(async move {
        let outbound = cmd.opts.outbound()?;
        let mut config = RegistryConfig::new(cmd.base.as_str())
            .conversation(cmd.opts.apply(ChannelConfig::conversational("")))
            .infrastructure(cmd.opts.apply(ChannelConfig::infrastructure("")));
        if let Some(token) = cmd.token {
            config = config.credentials(token);
        }
        let registry = ChannelRegistry::new(config)?;

        let mut key = ChannelKey::new(cmd.kind.into(), cmd.room);
        if let Some(tenant) = cmd.tenant {
            key = key.with_tenant(tenant);
        }
        info!(channel = %key, url = %registry.url_for(&key)?, "Resolved channel");

        let channel = registry.get_service(&key)?;
        let events = channel.listen(cmd.opts.event_names());

        let result = probe(events, &outbound, cmd.opts.pretty, |msg| channel.send(msg)).await;
        registry.cleanup_service(&key);
        result
    })
}

/// Print events until ctrl-c or until reconnection gives up.
async fn probe(
    mut events: EventStream,
    outbound: &[Message],
    pretty: bool,
    send: impl Fn(&Message) -> bool,
) -> eyre::Result<()> {
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.next() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        match &event {
            Event::Connected => {
                println!("-- connected");
                for msg in outbound {
                    if !send(msg) {
                        warn!(kind = %msg.kind(), "Message not sent");
                    }
                }
            }
            Event::Disconnected { reason } => {
                println!("-- disconnected: {}", reason.as_deref().unwrap_or("no reason"));
            }
            Event::Error(err) => println!("-- error: {err}"),
            Event::ReconnectFailed { attempts } => {
                return Err(eyre::eyre!("gave up after {attempts} reconnect attempts"));
            }
            Event::Message(msg) => println!("{}", render(msg, pretty)?),
            Event::Typed { tag, body } => {
                let body = serde_json::Value::Object(body.clone());
                let body = if pretty {
                    serde_json::to_string_pretty(&body)?
                } else {
                    body.to_string()
                };
                println!("[{tag}] {body}");
            }
        }
    }
}

fn render(msg: &Message, pretty: bool) -> eyre::Result<String> {
    let text = if pretty {
        serde_json::to_string_pretty(msg)?
    } else {
        serde_json::to_string(msg)?
    };
    Ok(text)
}
