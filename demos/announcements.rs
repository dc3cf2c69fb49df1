//! Print device announcements until the link drops or Ctrl-C.
//!
//! ```text
//! cargo run --example announcements -- --port /dev/ttyACM0
//! ```

use clap::Parser;
use mup1_client::{Client, SerialConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "announcements")]
struct Cli {
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    #[arg(long, default_value_t = mup1_client::transport::DEFAULT_BAUD_RATE)]
    baud: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::open_serial(&SerialConfig::new(cli.port, cli.baud))?;
    let mut announcements = client.subscribe_announcements();

    loop {
        tokio::select! {
            received = announcements.recv() => match received {
                Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                Err(RecvError::Lagged(missed)) => eprintln!("missed {} announcement(s)", missed),
                Err(RecvError::Closed) => break,
            },
            _ = client.closed() => break,
            _ = tokio::signal::ctrl_c() => {
                client.close().await;
                break;
            }
        }
    }

    Ok(())
}
