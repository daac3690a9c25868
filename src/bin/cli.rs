use std::error::Error;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vtk_pos::net::Connection;
use vtk_pos::stage::{self, PaymentOptions};

/// Drives a payment transaction (or a single IDL ping) against a
/// Vendotek POS terminal.
#[derive(Parser)]
#[command(name = "vtk-cli")]
struct Cli {
    /// POS hostname or IP
    #[arg(long)]
    host: String,

    /// POS port number
    #[arg(long)]
    port: String,

    /// Price in minor currency units
    #[arg(long, required_unless_present = "ping", conflicts_with = "ping")]
    price: Option<i64>,

    /// Connect, send an IDL message, disconnect
    #[arg(long)]
    ping: bool,

    /// Product name
    #[arg(long)]
    prodname: Option<String>,

    /// Product id
    #[arg(long)]
    prodid: Option<i64>,

    /// Event name
    #[arg(long)]
    evname: Option<String>,

    /// Event number
    #[arg(long)]
    evnum: Option<i64>,

    /// Timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Increase verbosity (-v: stage progress, -vv: wire dumps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let timeout = Duration::from_secs(cli.timeout);

    let mut conn = Connection::new();
    conn.connect(&cli.host, &cli.port)?;

    let result: Result<(), Box<dyn Error>> = if cli.ping {
        stage::run_ping(&mut conn, timeout).map_err(Into::into)
    } else {
        let opts = PaymentOptions {
            event_number: cli.evnum,
            event_name: cli.evname,
            product_id: cli.prodid,
            product_name: cli.prodname,
            // --price is mandatory unless --ping is set
            price: cli.price.unwrap_or(0),
            timeout,
        };
        stage::run_payment(&mut conn, &opts).map_err(Into::into)
    };

    if conn.state().is_established() {
        let _ = conn.shutdown();
    }
    result
}
