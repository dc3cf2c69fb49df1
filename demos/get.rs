//! Fetch one or more resources from a switch and print them as JSON.
//!
//! ```text
//! RUST_LOG=mup1_client=debug cargo run --example get -- \
//!     --port /dev/ttyACM0 /ietf-system:system-state /ietf-interfaces:interfaces
//! ```
//!
//! All URIs are requested concurrently over the one link.

use std::time::Duration;

use clap::Parser;
use mup1_client::{Client, ClientConfig, SerialConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "get", about = "GET resources over a MUP1 serial link")]
struct Cli {
    /// Serial device.
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    #[arg(long, default_value_t = mup1_client::transport::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Client settings as JSON (see `ClientConfig::from_json`).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Ping the device before sending requests.
    #[arg(long, default_value_t = false)]
    ping: bool,

    /// Resource paths, optionally with a query (`/c?d=a`).
    #[arg(required = true)]
    uris: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ClientConfig::default(),
    };

    let client = Client::builder()
        .config(config)
        .open_serial(&SerialConfig::new(cli.port.clone(), cli.baud))?;

    if cli.ping {
        let pong = client.ping(Duration::from_secs(2)).await?;
        println!("# device: {}", String::from_utf8_lossy(&pong));
    }

    let requests = cli.uris.iter().map(|uri| {
        let client = client.clone();
        let uri = uri.clone();
        tokio::spawn(async move {
            let result = client.get(&uri).await;
            (uri, result)
        })
    });
    let handles: Vec<_> = requests.collect();

    let mut failures = 0;
    for handle in handles {
        let (uri, result) = handle.await?;
        match result {
            Ok(Some(payload)) => {
                println!("# {}", uri);
                println!("{}", serde_json::to_string_pretty(&payload.to_json())?);
            }
            Ok(None) => println!("# {} (no content)", uri),
            Err(e) => {
                eprintln!("# {} failed: {}", uri, e);
                failures += 1;
            }
        }
    }

    client.close().await;
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
