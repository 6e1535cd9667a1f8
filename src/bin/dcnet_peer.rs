use std::net::SocketAddr;
use std::time::Duration;

use ark_bls12_381::G1Projective;
use clap::Parser;
use dcnet::p2p::TcpRoomTransport;
use dcnet::room::{Room, StaticDirectory};
use dcnet::security::SessionRng;
use dcnet::session::{ParticipantSession, SessionConfig, SessionEvent};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    about = "DC-net participant: anonymously broadcasts one message to a fixed room",
    author,
    version
)]
struct Cli {
    /// This participant's index (1-based, position in the --peer list)
    #[arg(long = "index")]
    index: usize,

    /// Address of every participant in index order, this one included
    /// (repeat flag for multiple)
    #[arg(long = "peer", required = true)]
    peers: Vec<SocketAddr>,

    /// Message to broadcast; 0 stays silent
    #[arg(long = "message", default_value_t = 0)]
    message: u64,

    /// Resolve collisions by average comparison instead of coin flips
    #[arg(long = "non-probabilistic", default_value_t = false)]
    non_probabilistic: bool,

    /// Skip commitments and proofs on contributions
    #[arg(long = "no-attestation", default_value_t = false)]
    no_attestation: bool,

    /// How long to keep dialing peers that are not up yet
    #[arg(long = "connect-timeout-secs", default_value_t = 30)]
    connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Participant failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let directory = StaticDirectory::new(cli.peers, cli.non_probabilistic);
    let room = Room::from_directory(&directory)?;

    let mut config = SessionConfig::new(cli.index, room.clone(), cli.message);
    config.attest_contributions = !cli.no_attestation;

    let mut session = ParticipantSession::<G1Projective>::new(config)?;
    let mut events = session.events().ok_or("event stream already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SessionEvent::MessageResolved { round, message } = event {
                println!("round {round}: {message}");
            }
        }
    });

    let timeout = Duration::from_secs(cli.connect_timeout_secs);
    let (transport, source) = TcpRoomTransport::connect(&room, cli.index, timeout).await?;

    let mut rng = SessionRng::from_entropy();
    let result = session.run(&transport, source, &mut rng).await;
    drop(transport);
    let _ = printer.await;

    let report = result?;
    info!(
        "resolved {} messages in {} rounds ({} real)",
        report.messages.len(),
        report.total_rounds,
        report.real_rounds
    );
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
