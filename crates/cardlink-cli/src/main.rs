use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cardlink::{Aid, Apdu, Connection, PcscReader};

#[derive(Parser)]
#[command(name = "cardlink")]
#[command(about = "Smart-card diagnostics - select applications and send raw APDUs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available PC/SC readers
    Readers,
    /// Select an application by AID (hex)
    Select { aid: String },
    /// Send a raw APDU (hex: CLA INS P1 P2 [data]), optionally selecting
    /// an application first
    Apdu {
        apdu: String,
        /// AID to select before sending (hex)
        #[arg(long)]
        aid: Option<String>,
    },
}

fn main() {
    // Initialize tracing subscriber with environment-based filtering
    // Set RUST_LOG=debug for detailed logs, RUST_LOG=trace for very verbose
    // Default: info level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Readers => list_readers(),
        Command::Select { aid } => select(&aid),
        Command::Apdu { apdu, aid } => send_apdu(&apdu, aid.as_deref()),
    }
}

fn list_readers() {
    let reader = match PcscReader::new() {
        Ok(r) => r,
        Err(err) => {
            eprintln!("Failed to establish PC/SC context: {err}");
            return;
        }
    };
    match reader.list_readers() {
        Ok(readers) if readers.is_empty() => println!("No readers found"),
        Ok(readers) => {
            for (i, name) in readers.iter().enumerate() {
                println!("{}: {}", i + 1, name);
            }
        }
        Err(err) => eprintln!("Failed to list readers: {err}"),
    }
}

fn connect() -> Option<Connection> {
    let reader = match PcscReader::new() {
        Ok(r) => r,
        Err(err) => {
            eprintln!("Failed to establish PC/SC context: {err}");
            return None;
        }
    };
    let (transport, reader_name) = match reader.connect_first() {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("Failed to connect to card: {err}");
            eprintln!("Please ensure a card is present on the reader");
            return None;
        }
    };
    println!("Reader: {reader_name}\n");

    let conn = Connection::new();
    conn.start();
    conn.transport_opened(Box::new(transport));
    Some(conn)
}

fn select(aid_hex: &str) {
    let Some(aid) = decode_hex(aid_hex) else { return };
    let Some(conn) = connect() else { return };
    let card = match conn.smart_card() {
        Ok(card) => card,
        Err(err) => {
            eprintln!("Connection not usable: {err}");
            return;
        }
    };

    match card.select_application(Aid::new(aid)).wait() {
        Ok(out) => {
            println!("Selected in {:?}", out.elapsed);
            if !out.data.is_empty() {
                println!("FCI ({} bytes): {}", out.data.len(), hex::encode_upper(&out.data));
            }
        }
        Err(err) => eprintln!("Selection failed: {err}"),
    }
    conn.close().wait();
}

fn send_apdu(apdu_hex: &str, aid_hex: Option<&str>) {
    let Some(bytes) = decode_hex(apdu_hex) else { return };
    if bytes.len() < 4 {
        eprintln!("APDU needs at least CLA INS P1 P2");
        return;
    }
    let mut apdu = Apdu::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    if bytes.len() > 4 {
        apdu = apdu.data(bytes[4..].to_vec());
    }

    let Some(conn) = connect() else { return };
    let card = match conn.smart_card() {
        Ok(card) => card,
        Err(err) => {
            eprintln!("Connection not usable: {err}");
            return;
        }
    };

    let result = match aid_hex.and_then(decode_hex) {
        Some(aid) => card
            .execute_for(Aid::new(aid), apdu, Default::default())
            .wait(),
        None => card.execute(apdu).wait(),
    };

    match result {
        Ok(out) => {
            println!("Status: {:04X} ({:?})", out.sw, out.elapsed);
            if !out.data.is_empty() {
                println!("Data ({} bytes): {}", out.data.len(), hex::encode_upper(&out.data));
            }
        }
        Err(err) => eprintln!("Command failed: {err}"),
    }
    conn.close().wait();
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    match hex::decode(cleaned) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            eprintln!("Invalid hex input: {err}");
            None
        }
    }
}
