use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use umbra::config::{BootstrapPeer, Config};
use umbra::context::{Context, RuntimeOptions};
use umbra::service::NetworkAddress;

/// An ONS record served by this node: `name.loki=<64 hex chars>`.
#[derive(Clone, Debug)]
struct OnsRecordArg {
    name: String,
    address: NetworkAddress,
}

impl FromStr for OnsRecordArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, hex_part) = s
            .split_once('=')
            .ok_or_else(|| "ons record must be NAME=ADDRESSHEX".to_string())?;
        let bytes = hex::decode(hex_part).map_err(|_| "address must be hex".to_string())?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "address must be 32 bytes".to_string())?;
        Ok(Self {
            name: name.to_string(),
            address: NetworkAddress::from_bytes(bytes),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "umbra")]
#[command(author, version, about = "onion-routed overlay network node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short, long, default_value = "./umbra-data")]
    data_dir: PathBuf,

    /// Bootstrap peers, format IP:PORT/IDENTITYHEX.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Relay other nodes' paths through this node.
    #[arg(long)]
    transit: bool,

    /// Advertise and grant exit service.
    #[arg(long)]
    exit: bool,

    /// ONS records to answer lookups for (NAME=ADDRESSHEX).
    #[arg(long = "ons", value_name = "RECORD")]
    ons: Vec<OnsRecordArg>,

    /// Ready lookup paths to maintain.
    #[arg(long, default_value = "4")]
    lookup_paths: usize,

    /// Hops per path.
    #[arg(long, default_value = "3")]
    hop_count: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = Config {
        bind: args.bind,
        data_dir: args.data_dir,
        allow_transit: args.transit,
        allows_exit: args.exit,
        bootstrap: args.bootstrap,
        num_lookup_paths: args.lookup_paths,
        hop_count: args.hop_count,
        ons_records: args.ons.into_iter().map(|r| (r.name, r.address)).collect(),
    };

    let mut context = Context::new();
    if let Err(err) = context.configure(config) {
        error!(error = %err, "invalid configuration");
        return 1;
    }
    if let Err(err) = context.setup(&RuntimeOptions { show_banner: true }).await {
        error!(error = %err, "router failed to start");
        return 2;
    }

    let router = context.router().cloned().expect("router exists after setup");
    info!(rid = %router.router_id(), addr = %router.local_addr(), "node running");

    // Signal wiring: INT/TERM stop the router, HUP is a reload no-op.
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    return;
                }
            };
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(hup) => hup,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGHUP");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received, shutting down");
                        router.stop();
                        break;
                    }
                    _ = term.recv() => {
                        info!("terminate received, shutting down");
                        router.stop();
                        break;
                    }
                    _ = hup.recv() => {
                        info!("reload requested, nothing to do");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                router.stop();
            }
        }
    });

    context.run().await
}
