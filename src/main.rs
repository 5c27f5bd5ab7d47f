use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Weekday;
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use parking_lot::RwLock;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;
use zebra_scent::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding schedules.json and zebrascent.json
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Evaluation period in milliseconds
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// MQTT client id
    #[arg(long, default_value = "zebrascent")]
    client_id: String,

    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller (default)
    Run,
    /// Print the stored rule table
    Rules,
    /// Evaluate the stored rules at a time of day without touching outputs
    Check {
        /// Time of day, HH:MM
        #[arg(short, long)]
        at: MinuteOfDay,
        /// Days to evaluate (e.g. "mon,tue", "weekdays", "all")
        #[arg(long, default_value = "all")]
        days: Days,
    },
}

/// How often the host address is re-read
const NETWORK_CHECK: Duration = Duration::from_secs(30);

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so console replies on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("zebra_scent=info,zebrascentd=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let store = match FileStore::open(&cli.data_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("Cannot use data directory {}: {}", cli.data_dir.display(), e);
            return Err(e.into());
        }
    };

    match cli.command {
        None | Some(Commands::Run) => run(store, cli.tick_ms, cli.client_id, !cli.no_console).await?,
        Some(Commands::Rules) => print_rules(&store),
        Some(Commands::Check { at, days }) => check(&store, at, days),
    }

    Ok(())
}

fn print_rules(store: &FileStore) {
    let rules = store.load_rules();
    for (slot, rule) in rules.iter().enumerate().filter(|(_, r)| r.enabled) {
        println!(
            "#{:<2} ch{} {}-{} {}",
            slot, rule.channel, rule.start, rule.end, rule.days
        );
    }
    println!("{} of {} slots in use", rules.enabled_count(), MAX_RULES);
}

fn check(store: &FileStore, at: MinuteOfDay, days: Days) {
    let rules = store.load_rules();
    for day in WEEK.into_iter().filter(|d| days.contains(*d)) {
        println!("{day} {at} -> {}", evaluate(&rules, at, day));
    }
}

#[instrument(skip(store))]
async fn run(store: FileStore, tick_ms: u64, client_id: String, console: bool) -> Result<()> {
    let link: SharedLink = Arc::new(RwLock::new(Link::default()));
    tokio::spawn(watch_network(link.clone()));

    warn!("No GPIO backend configured, driving a simulated register");
    let mut controller = Controller::new(SystemClock, SimulatedRegister::new(), store, link.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    controller.subscribe(events_tx);

    let (request_tx, mut request_rx) = mpsc::channel::<Request>(32);

    let bridge = MqttBridge::new(
        client_id,
        link,
        request_tx.clone(),
        controller.config_updates(),
        controller.state_updates(),
        events_rx,
    );
    tokio::spawn(bridge.run());

    if console {
        let tx = request_tx.clone();
        tokio::spawn(async move {
            let input = BufReader::new(tokio::io::stdin());
            if let Err(e) = console::run(input, tokio::io::stdout(), tx).await {
                error!("Console failed: {}", e);
            }
        });
    }
    drop(request_tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Running, tick every {} ms", tick_ms);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.tick();
            }
            Some(request) = request_rx.recv() => {
                controller.handle_request(request);
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Address the host would use for outbound traffic.
///
/// Connecting a UDP socket only selects a route, nothing is sent.
fn local_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

async fn watch_network(link: SharedLink) {
    let mut every = tokio::time::interval(NETWORK_CHECK);
    loop {
        every.tick().await;
        let ip = local_address();
        if link.write().update_address(ip) {
            match ip {
                Some(ip) => info!("Network up, address {}", ip),
                None => warn!("Network down"),
            }
        }
    }
}
