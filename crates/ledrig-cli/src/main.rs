//! LED Rig Control Tool
//!
//! CLI for driving an LED rig directly over serial or through a relay.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledrig_client::{
    AnimationManager, Color, Command, ConnectionState, DeviceController, Event, Pattern, Project,
    TransportConfig,
};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum CliTransport {
    /// Serial port attached to this machine
    #[default]
    Serial,
    /// Relay over HTTP
    Http,
    /// Relay over WebSocket
    Websocket,
}

#[derive(Parser)]
#[command(name = "ledrigctl")]
#[command(about = "Control tool for LED rigs")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Transport to use
    #[arg(long, default_value = "serial", value_enum)]
    transport: CliTransport,

    /// Serial port path or relay URL
    #[arg(long, default_value = "/dev/ttyUSB0")]
    target: String,

    /// Serial baud rate
    #[arg(long, default_value = "9600")]
    baud: u32,

    /// I/O timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set one pixel
    Pixel {
        index: u8,
        /// Color as #RRGGBB or r,g,b
        color: Color,
    },
    /// Set an inclusive range of pixels
    Range { start: u8, end: u8, color: Color },
    /// Fill the whole strip
    Fill { color: Color },
    /// Turn all pixels off
    Clear,
    /// Set global brightness (0-255)
    Brightness { level: u8 },
    /// Check that the rig answers
    Ping,
    /// Blink a color
    Blink {
        color: Color,

        /// Blink rate in Hz
        #[arg(long, default_value = "2")]
        hz: f64,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Play a pattern from a project file
    Play {
        /// Project JSON file
        project: String,

        /// Pattern name
        pattern: String,

        /// Stop after this many seconds (default: until the pattern ends or Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Print events as JSON lines
    Watch,
}

impl Cli {
    fn transport_config(&self) -> TransportConfig {
        match self.transport {
            CliTransport::Serial => TransportConfig::Serial {
                port: self.target.clone(),
                baud: self.baud,
                timeout_ms: self.timeout_ms,
            },
            CliTransport::Http => TransportConfig::Http {
                url: self.target.clone(),
                timeout_ms: self.timeout_ms,
            },
            CliTransport::Websocket => TransportConfig::WebSocket {
                url: self.target.clone(),
                timeout_ms: self.timeout_ms,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let controller = DeviceController::new();
    controller
        .connect(&cli.transport_config())
        .await
        .with_context(|| format!("Failed to connect to {}", cli.target))?;

    let timeout = Duration::from_millis(cli.timeout_ms);
    let result = match cli.command {
        Commands::Pixel { index, color } => {
            send_and_report(&controller, Command::SetPixel { index, color }, timeout).await
        }
        Commands::Range { start, end, color } => {
            if start > end {
                bail!("Range start {} is past end {}", start, end);
            }
            send_and_report(&controller, Command::SetRange { start, end, color }, timeout).await
        }
        Commands::Fill { color } => {
            send_and_report(&controller, Command::Fill { color }, timeout).await
        }
        Commands::Clear => send_and_report(&controller, Command::Clear, timeout).await,
        Commands::Brightness { level } => {
            send_and_report(&controller, Command::SetBrightness { level }, timeout).await
        }
        Commands::Ping => send_and_report(&controller, Command::Ping, timeout).await,
        Commands::Blink { color, hz, seconds } => {
            play(&controller, Pattern::blink(color, hz), seconds).await
        }
        Commands::Play {
            project,
            pattern,
            seconds,
        } => {
            let project = Project::load(&project)
                .with_context(|| format!("Failed to load project {}", project))?;
            let pattern = project.pattern(&pattern)?.clone();
            play(&controller, pattern, seconds).await
        }
        Commands::Watch => watch(&controller).await,
    };

    controller.disconnect().await;
    result
}

/// Sends one command and prints the device's answer, if any arrives in time.
async fn send_and_report(controller: &DeviceController, command: Command, timeout: Duration) -> Result<()> {
    let mut events = controller.subscribe();
    let seq = controller
        .send(command)
        .await
        .with_context(|| format!("Failed to send {}", command))?;
    println!("Sent {} (seq {})", command, seq);

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match events.recv_timeout(remaining).await {
            Some(Event::Device(event)) if event.acked_seq() == Some(seq) => {
                println!("{}", serde_json::to_string(&event)?);
                return Ok(());
            }
            Some(Event::Device(event)) if matches!(event, ledrig_client::DeviceEvent::Error { .. }) => {
                bail!("Device reported {}", serde_json::to_string(&event)?);
            }
            Some(other) => debug!("Ignoring {:?}", other),
            None => {
                println!("No acknowledgement within {:?}", timeout);
                return Ok(());
            }
        }
    }
}

/// Plays a pattern until it completes, faults, times out or Ctrl-C.
async fn play(controller: &DeviceController, pattern: Pattern, seconds: Option<u64>) -> Result<()> {
    let name = pattern.name.clone();
    let manager = AnimationManager::new(controller.clone());
    let mut events = controller.subscribe();
    manager.start(pattern).await?;
    println!("Playing '{}' (Ctrl-C to stop)", name);

    let limit = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(limit);

    let outcome = loop {
        tokio::select! {
            _ = &mut limit => break Ok(()),
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = events.recv() => match event {
                Some(Event::Animation(ledrig_client::AnimationEvent::Completed { .. })) => break Ok(()),
                Some(Event::Animation(ledrig_client::AnimationEvent::Faulted { reason, .. })) => {
                    break Err(anyhow::anyhow!("Animation '{}' faulted: {}", name, reason));
                }
                Some(Event::State(ConnectionState::Failed)) => {
                    debug!("Connection failed during playback");
                }
                Some(_) => {}
                None => break Ok(()),
            },
        }
    };

    manager.stop().await;
    outcome
}

/// Prints every event as a JSON line until Ctrl-C.
async fn watch(controller: &DeviceController) -> Result<()> {
    let mut events = controller.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => return Ok(()),
            },
        }
    }
}
