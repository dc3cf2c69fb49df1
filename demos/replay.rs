//! Extract serial writes from an `strace` log and optionally replay them.
//!
//! ```text
//! strace -f -yy -e trace=write -s 65535 -o session.log mvdct device /dev/ttyACM0 get ...
//! cargo run --example replay -- --log session.log --out session.bin
//! cargo run --example replay -- --log session.log --out session.bin --replay
//! ```

use std::path::PathBuf;

use clap::Parser;
use mup1_client::capture::{self, CapturedWrite};
use mup1_client::protocol::FrameType;
use mup1_client::transport::{open_serial, SerialConfig, DEFAULT_BAUD_RATE};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "replay")]
struct Cli {
    /// strace output to read.
    #[arg(short, long)]
    log: PathBuf,

    /// File receiving the extracted bytes.
    #[arg(short, long)]
    out: PathBuf,

    /// Only keep writes on this file descriptor.
    #[arg(long)]
    fd: Option<u32>,

    /// Serial device the capture was taken on, and the replay target.
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Send the extracted bytes to the device after a ping probe.
    #[arg(long, default_value_t = false)]
    replay: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let log = std::fs::read_to_string(&cli.log)?;
    let device = cli.port.rsplit('/').next().unwrap_or(&cli.port);
    let writes = capture::extract_writes(&log, device, cli.fd)?;
    if writes.is_empty() {
        eprintln!("no writes to {} found in {}", device, cli.log.display());
        std::process::exit(1);
    }

    let bytes: Vec<u8> = writes.iter().flat_map(|w| w.data.iter().copied()).collect();
    std::fs::write(&cli.out, &bytes)?;
    println!(
        "wrote {} bytes from {} write(s) into {}",
        bytes.len(),
        writes.len(),
        cli.out.display()
    );
    summarize(&writes);

    if cli.replay {
        let mut port = open_serial(&SerialConfig::new(cli.port.clone(), cli.baud))?;
        capture::replay(&mut port, &writes).await?;
        println!("replay sent to {}", cli.port);
    }

    Ok(())
}

fn summarize(writes: &[CapturedWrite]) {
    for frame in capture::frames(writes) {
        match frame.frame_type {
            FrameType::CoapRequest => match mup1_client::coap::CoapMessage::parse(frame.payload()) {
                Ok(message) => println!(
                    "  {} {} (id {})",
                    message.method().map(|m| m.as_str()).unwrap_or("?"),
                    message.uri(),
                    message.message_id
                ),
                Err(e) => println!("  unparsable CoAP request: {}", e),
            },
            other => println!("  {:?} frame, {} bytes", other, frame.payload().len()),
        }
    }
}
