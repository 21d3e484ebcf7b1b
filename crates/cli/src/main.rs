use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use signalcast::{RendezvousConfig, RendezvousServer};

#[derive(Parser)]
#[command(
    name = "signalcast-server",
    about = "Rendezvous service pairing one media host with many clients"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Length of minted pairing codes
    #[arg(long, default_value_t = signalcast::protocol::DEFAULT_CODE_LEN)]
    code_len: usize,

    /// Seconds a registered host or paired client has to open its channel
    #[arg(long, default_value_t = 10)]
    claim_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut server = RendezvousServer::with_config(RendezvousConfig {
        bind_addr: args.bind,
        code_len: args.code_len,
        claim_timeout: Duration::from_secs(args.claim_timeout),
    });

    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to start server: {}", e);
            return;
        }
    };

    println!("Rendezvous server on {addr}, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
    }

    server.stop();
}
