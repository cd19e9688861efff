//! Tether Client - connects, measures ping and exchanges echo messages

use bytes::Bytes;
use clap::Parser;
use crossbeam::channel;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether::protocol::PingFailure;
use tether::{
    Connection, ConnectionState, Guarantee, MessageHandler, MessageId, NetworkHandler, Request,
    Response, ResponseBody, SentItem,
};
use tether_cli::{format_compact_stats, init_logging, Config, RoleSetting};

#[derive(Parser, Debug)]
#[command(name = "tether-client")]
#[command(about = "Tether reliable-UDP test client", long_about = None)]
struct Args {
    /// Server to connect to (host[:port])
    #[arg(short, long)]
    server: String,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ping echoes (0 skips the ping)
    #[arg(long, default_value = "5")]
    pings: usize,

    /// Number of custom messages to exchange
    #[arg(long, default_value = "10")]
    messages: usize,

    /// Payload size of each custom message in bytes
    #[arg(long, default_value = "256")]
    size: usize,

    /// Seconds to wait for the handshake and for each reply
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// User name sent during authentication
    #[arg(short, long)]
    user: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle_request(&self, connection: &Arc<Connection>, _id: MessageId, request: Request) {
        tracing::info!(
            "{:?} request from {}",
            request.kind(),
            connection.address_string()
        );
    }

    fn handle_response_only(&self, connection: &Arc<Connection>, response: Response) {
        tracing::info!(
            "Unsolicited {:?} response from {}",
            response.kind(),
            connection.address_string()
        );
    }
}

fn wait_for_authentication(conn: &Connection, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match conn.state() {
            ConnectionState::Authenticated => return Ok(()),
            ConnectionState::Closed => anyhow::bail!("Connection closed during handshake"),
            _ if Instant::now() >= deadline => anyhow::bail!("Handshake timed out"),
            _ => thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn measure_ping(conn: &Connection, count: usize, timeout: Duration) -> anyhow::Result<()> {
    let (tx, rx) = channel::bounded(1);
    let failed = tx.clone();
    let allowed_failures = (count / 2) as u32;

    conn.calculate_ping(
        count,
        allowed_failures,
        move |ping, failures| {
            let _ = tx.send(Ok((ping, failures)));
        },
        move |reason, failures| {
            let _ = failed.send(Err((reason, failures)));
        },
    );

    match rx.recv_timeout(timeout) {
        Ok(Ok((ping, failures))) => {
            tracing::info!("Ping: {} ms ({} of {} echoes lost)", ping, failures, count);
            Ok(())
        }
        Ok(Err((PingFailure::LossTooHigh, failures))) => {
            anyhow::bail!("Ping failed: {} of {} echoes lost", failures, count)
        }
        Ok(Err((PingFailure::ConnectionClosed, _))) => {
            anyhow::bail!("Ping failed: connection closed")
        }
        Err(_) => anyhow::bail!("Ping timed out"),
    }
}

fn wait_for_echo(item: &SentItem, expected: &Bytes, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(response) = item.response() {
            return matches!(&response.body, ResponseBody::Custom(payload) if payload == expected);
        }
        if item.status() == tether::protocol::Completion::Failed || Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::example_client(),
    };
    config.network.role = RoleSetting::Client;
    if let Some(user) = &args.user {
        config.connection.user_name = user.clone();
    }

    let timeout = Duration::from_secs(args.timeout);
    let network = NetworkHandler::bind(config.network_config()?, Arc::new(LogHandler))?;
    network.start()?;

    tracing::info!("Connecting to {} from {}", args.server, network.local_addr());
    let started = Instant::now();
    let conn = network.open_connection(&args.server)?;
    wait_for_authentication(&conn, timeout)?;
    tracing::info!(
        "Authenticated with {} in {} ms (user id {})",
        conn.address_string(),
        started.elapsed().as_millis(),
        conn.credentials().map_or(0, |c| c.user_id)
    );

    if args.pings > 0 {
        if let Err(e) = measure_ping(&conn, args.pings, timeout) {
            tracing::warn!("{}", e);
        }
    }

    let mut sent = Vec::with_capacity(args.messages);
    for i in 0..args.messages {
        let payload = Bytes::from(vec![(i % 256) as u8; args.size]);
        let item = conn.send_request(Request::Custom(payload.clone()), Guarantee::ResendOnce)?;
        sent.push((item, payload));
    }

    let echoed = sent
        .iter()
        .filter(|(item, payload)| wait_for_echo(item, payload, timeout))
        .count();
    tracing::info!("{} of {} messages echoed", echoed, args.messages);
    tracing::info!("Stats: {}", format_compact_stats(&conn.stats()));

    conn.close();
    network.update_all();
    network.shutdown();

    if echoed < args.messages {
        anyhow::bail!("{} messages were not echoed", args.messages - echoed);
    }
    Ok(())
}
