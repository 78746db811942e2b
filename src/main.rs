//! GSM modem daemon
//!
//! Waits for incoming calls, SMS and GPS reports and handles them with the
//! demo handlers until interrupted.

use clap::{Parser, Subcommand};
use gsm_modem_rs::config::Config;
use gsm_modem_rs::dispatcher::{Dispatcher, ModemEvent};
use gsm_modem_rs::gps::describe_location;
use gsm_modem_rs::handlers::{describe_signal, DemoHandler};
use gsm_modem_rs::session::{ModemControl, ModemSession};
use gsm_modem_rs::{Error, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// GSM modem demo - answers calls, echoes SMS, prints GPS reports
#[derive(Parser)]
#[command(name = "gsm-modem-rs")]
#[command(about = "Handle incoming calls, SMS and GPS reports from a GSM modem")]
struct Cli {
    /// Serial port of the modem
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// SIM card PIN
    #[arg(long, global = true)]
    pin: Option<String>,

    /// JSON config file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for calls, SMS and GPS reports (default)
    Run,

    /// Print the current signal strength
    Signal,

    /// Print the current GPS location
    Location,

    /// Send an SMS
    SendSms {
        /// Destination number
        number: String,

        /// Message text
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Signal => cmd_signal(&config).await,
        Commands::Location => cmd_location(&config).await,
        Commands::SendSms { number, text } => cmd_send_sms(&config, &number, &text).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Exiting with error");
    }
    result
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    if let Some(pin) = &cli.pin {
        config.pin = Some(pin.clone());
    }

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_run(config: &Config) -> Result<()> {
    println!("Initializing modem...");
    let (session, mut events) = ModemSession::open(config)?;

    let result = listen(&session, &mut events, config).await;

    // Release the port on every exit path
    session.close().await?;
    result
}

async fn listen(
    session: &ModemSession,
    events: &mut mpsc::UnboundedReceiver<ModemEvent>,
    config: &Config,
) -> Result<()> {
    session.connect().await?;
    println!("Waiting for incoming calls or SMS messages");

    let mut dispatcher = Dispatcher::new(DemoHandler::stdout(config));
    let run = tokio::time::timeout(config.run_timeout(), dispatcher.run(session, events));

    tokio::select! {
        result = run => match result {
            Ok(result) => result,
            Err(_) => {
                info!("Run timeout reached");
                Ok(())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

async fn cmd_signal(config: &Config) -> Result<()> {
    let (session, _events) = ModemSession::open(config)?;

    let result = async {
        session.connect().await?;
        let rssi = session.signal_strength().await?;
        println!("{}", describe_signal(rssi));
        Ok::<(), Error>(())
    }
    .await;

    session.close().await?;
    result
}

async fn cmd_location(config: &Config) -> Result<()> {
    let (session, _events) = ModemSession::open(config)?;

    let result = async {
        session.connect().await?;
        let location = session.location().await?;
        println!("{}", describe_location(location.as_ref()));
        Ok::<(), Error>(())
    }
    .await;

    session.close().await?;
    result
}

async fn cmd_send_sms(config: &Config, number: &str, text: &str) -> Result<()> {
    let (session, _events) = ModemSession::open(config)?;

    let result = async {
        session.connect().await?;
        let reference = session.send_sms(number, text).await?;
        println!("SMS sent (reference {})", reference);
        Ok::<(), Error>(())
    }
    .await;

    session.close().await?;
    result
}
