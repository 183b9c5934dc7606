use csv::{ReaderBuilder, Trim};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use web_bank::bank;

/// The size of the channel for processing commands.
const CHANNEL_SIZE: usize = 100;

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    if args.len() != 2 {
        eprintln!("Usage: {} <commands_csv_file>", args[0]);
        std::process::exit(1);
    }
    let input_file = &args[1];

    let config = match bank::Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {err}");
            std::process::exit(1);
        }
    };
    info!("Using fallback data in {}", config.data_dir.display());
    let ledger = bank::LedgerService::from_config(&config).await;

    let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
    let mut state = bank::State::new(ledger, receiver);

    let handle = tokio::spawn(async move {
        state.run().await;
        state
    });

    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(input_file)
        .expect("Failed to read CSV file");

    for command in reader.deserialize::<bank::Command>() {
        match command {
            Ok(command) => {
                if let Err(err) = sender.send(command).await {
                    error!("Error sending command: {err}");
                }
            }
            Err(err) => error!("Skipping malformed command: {err}"),
        }
    }

    drop(sender); // Close the sender to signal no more commands will be sent
    let state = handle
        .await
        .expect("Failed to join the state handling task");

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for outcome in state.get_outcomes() {
        if let Err(err) = writer.serialize(outcome) {
            eprintln!("Error writing outcome: {err}");
        }
    }
    if let Err(err) = writer.flush() {
        eprintln!("Error flushing output: {err}");
    }
}
