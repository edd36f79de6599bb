//! Tether client binary.
//!
//! Dials a tether server, keeps the encrypted channel alive with echo probes,
//! reports latency and traffic, and can optionally open one raw stream that
//! pipes stdin lines out and prints whatever the remote sends back.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tether_session::{
    read_completely, CommandHandler, EchoUpdate, InitialSender, Limited, LinkError, Multiplexer,
    Socket, SocketEvent, StaticSecret, StreamSender,
};
use tether_wire::{InitialStreamHeader, StreamHeader};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::TetherConfig;
use logging::TetherLogFormatter;

/// Encrypted, multiplexed WebSocket client
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Encrypted multiplexed WebSocket client")]
struct Args {
    /// WebSocket endpoint, e.g. ws://127.0.0.1:8182/sshwifty/socket
    #[arg(long)]
    url: Option<String>,

    /// Shared secret (prefer TETHER_SECRET to keep it out of the process list)
    #[arg(long)]
    secret: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Echo probe interval, e.g. 10s
    #[arg(long)]
    echo_interval: Option<humantime::Duration>,

    /// Dial timeout, e.g. 10s
    #[arg(long)]
    dial_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disconnect after this long instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<humantime::Duration>,

    /// Open a raw stream for this command id (0-15)
    #[arg(long)]
    command_id: Option<u8>,

    /// Initial request payload sent with --command-id
    #[arg(long, default_value = "")]
    payload: String,
}

/// Stream handler that prints inbound data to stdout
struct RawCommand {
    payload: Vec<u8>,
}

#[async_trait]
impl CommandHandler for RawCommand {
    async fn run(&self, initial: InitialSender) -> Result<(), LinkError> {
        component!(
            debug,
            "stream",
            "Requesting command {} on stream {}",
            initial.command(),
            initial.id()
        );
        initial.send(&self.payload)?.wait().await
    }

    async fn initialize(&self, header: InitialStreamHeader) -> Result<(), LinkError> {
        if header.success {
            component!(info, "stream", "Command {} accepted", header.command);
        } else {
            component!(
                warn,
                "stream",
                "Command {} rejected with code {}",
                header.command,
                header.data
            );
        }
        Ok(())
    }

    async fn tick(&self, header: StreamHeader, reader: &mut Limited<'_>) -> Result<(), LinkError> {
        let data = read_completely(reader).await?;
        trace!(component = "stream", "Marker {} carried {} bytes", header.marker, data.len());

        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(&data)
            .await
            .map_err(|e| LinkError::Command(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| LinkError::Command(e.to_string()))
    }

    async fn close(&self) {
        component!(debug, "stream", "Stream closing");
    }

    async fn completed(&self) {
        component!(info, "stream", "Stream completed");
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("tether={}", args.log_level).parse()?)
            .add_directive(format!("tether_session={}", args.log_level).parse()?)
            .add_directive(format!("tether_wire={}", args.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(TetherLogFormatter::default())
        .init();

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TetherConfig::load_from_file(&args.config)?;
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(secret) = args.secret {
        config.secret = Some(secret);
    }
    if let Some(interval) = args.echo_interval {
        config.echo_interval = interval.into();
    }
    if let Some(timeout) = args.dial_timeout {
        config.dial_timeout = timeout.into();
    }

    if config.url.is_empty() {
        anyhow::bail!("no server URL configured; pass --url or set TETHER_URL");
    }
    let secret = config
        .secret
        .clone()
        .context("no secret configured; pass --secret or set TETHER_SECRET")?;

    let socket_config = config.socket_config();
    socket_config
        .validate()
        .context("invalid tether configuration")?;

    let socket = Socket::new(socket_config, Arc::new(StaticSecret::new(secret)));
    let mut reporter = tokio::spawn(report_events(socket.subscribe()));

    let mux = socket
        .get()
        .await
        .with_context(|| format!("failed to connect to {}", config.url))?;

    let stdin_task = match args.command_id {
        Some(command_id) => {
            let stream = open_raw_stream(&mux, command_id, args.payload.into_bytes()).await?;
            Some(tokio::spawn(pipe_stdin(stream)))
        }
        None => None,
    };

    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration.into()).await,
            None => std::future::pending().await,
        }
    };

    let failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            component!(info, "socket", "Interrupted, disconnecting");
            None
        }
        _ = deadline => {
            component!(info, "socket", "Run duration elapsed, disconnecting");
            None
        }
        outcome = &mut reporter => outcome.context("event reporter panicked")?,
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    socket.close().await;

    let stats = socket.stats();
    info!(
        "Traffic: {} bytes in ({} messages), {} bytes out ({} messages); last RTT {:?}; {} echo failures",
        stats.bytes_in,
        stats.messages_in,
        stats.bytes_out,
        stats.messages_out,
        stats.last_rtt,
        stats.echo_failures
    );

    match failure {
        Some(e) => Err(anyhow::Error::new(e).context("connection lost")),
        None => Ok(()),
    }
}

/// Request `command_id` on a fresh stream and hand back its sender
async fn open_raw_stream(
    mux: &Multiplexer,
    command_id: u8,
    payload: Vec<u8>,
) -> anyhow::Result<StreamSender> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let requested = mux
        .request(command_id, move |sender| {
            let _ = tx.send(sender);
            Arc::new(RawCommand { payload }) as Arc<dyn CommandHandler>
        })
        .await
        .with_context(|| format!("failed to open stream for command {}", command_id))?;

    component!(info, "stream", "Opened stream {}", requested.stream_id);
    rx.recv().await.context("stream sender was not handed over")
}

/// Send stdin lines on marker 0 until EOF, then close the stream
async fn pipe_stdin(stream: StreamSender) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut data = line.into_bytes();
        data.push(b'\n');
        stream.send_data(0, Bytes::from(data)).await?;
    }

    component!(debug, "stream", "Stdin closed, closing stream {}", stream.id());
    stream.close().await?;
    Ok(())
}

/// Log socket events until the connection ends; returns the failure, if any
async fn report_events(mut events: mpsc::UnboundedReceiver<SocketEvent>) -> Option<LinkError> {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connecting => component!(info, "socket", "Connecting"),
            SocketEvent::Connected => component!(info, "socket", "Connected"),
            SocketEvent::Traffic { inbound, outbound } => {
                trace!(component = "socket", "Traffic: +{} in, +{} out", inbound, outbound)
            }
            SocketEvent::Echo(EchoUpdate::Delay(rtt)) => {
                component!(info, "echo", "Round trip {:?}", rtt)
            }
            SocketEvent::Echo(EchoUpdate::Failed) => component!(warn, "echo", "Echo probe failed"),
            SocketEvent::Closed(None) => {
                component!(info, "socket", "Connection closed");
                return None;
            }
            SocketEvent::Closed(Some(e)) | SocketEvent::Failed(e) => {
                component!(error, "socket", "Connection lost: {}", e);
                return Some(e);
            }
        }
    }

    None
}
