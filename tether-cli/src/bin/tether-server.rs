//! Tether Server - accepts peers and echoes custom requests
//!
//! Every `Custom` request is answered with a `Custom` response carrying the
//! same payload, computed on the task queue rather than the receive thread.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether::{
    Connection, Guarantee, MessageHandler, MessageId, NetworkHandler, Request, Response,
    ResponseBody, TaskQueue,
};
use tether_cli::{display_connection_stats, format_compact_stats, init_logging, Config, RoleSetting};

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Tether reliable-UDP echo server", long_about = None)]
struct Args {
    /// Bind address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads for echo responses
    #[arg(long)]
    workers: Option<usize>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_example: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct EchoHandler {
    tasks: TaskQueue,
}

impl MessageHandler for EchoHandler {
    fn handle_request(&self, connection: &Arc<Connection>, id: MessageId, request: Request) {
        match request {
            Request::Custom(payload) => {
                let connection = Arc::clone(connection);
                let queued = self.tasks.submit(move || {
                    let len = payload.len();
                    let response = Response::to(id, ResponseBody::Custom(payload));
                    match connection.send_response(response, Guarantee::ResendOnce) {
                        Ok(_) => tracing::debug!(
                            "Echoed {} bytes to {}",
                            len,
                            connection.address_string()
                        ),
                        Err(e) => tracing::warn!(
                            "Cannot echo to {}: {}",
                            connection.address_string(),
                            e
                        ),
                    }
                });
                if !queued {
                    tracing::warn!("Task queue stopped, dropping request {}", id);
                }
            }
            other => tracing::debug!(
                "Ignoring {:?} request from {}",
                other.kind(),
                connection.address_string()
            ),
        }
    }

    fn handle_response_only(&self, connection: &Arc<Connection>, response: Response) {
        tracing::debug!(
            "Unsolicited {:?} response from {}",
            response.kind(),
            connection.address_string()
        );
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.write_example {
        Config::example_server().to_file(path)?;
        println!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::example_server(),
    };
    config.network.role = match config.network.role {
        RoleSetting::Client => RoleSetting::Server,
        role => role,
    };
    if let Some(bind) = args.bind {
        config.network.bind = bind;
    }
    if let Some(workers) = args.workers {
        config.network.workers = workers;
    }
    if let Some(stats) = args.stats {
        config.network.stats_interval_secs = stats;
    }

    let network_config = config.network_config()?;
    tracing::info!("Tether server starting...");

    let handler = Arc::new(EchoHandler {
        tasks: TaskQueue::new(config.network.workers),
    });
    let network = NetworkHandler::bind(network_config, handler)?;
    network.start()?;
    tracing::info!("Listening on: {}", network.local_addr());

    let start_time = Instant::now();
    let stats_interval = config.stats_interval();

    loop {
        if stats_interval.is_zero() {
            thread::sleep(Duration::from_secs(1));
            continue;
        }

        thread::sleep(stats_interval);
        let connections = network.connections();
        if args.verbose {
            display_connection_stats(&connections, start_time.elapsed());
        }
        for conn in &connections {
            tracing::info!(
                "{} {} {:?}: {}",
                conn.id(),
                conn.address_string(),
                conn.state(),
                format_compact_stats(&conn.stats())
            );
        }
    }
}
