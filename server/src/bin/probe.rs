use clap::Parser;
use relay_shared::{write_frame, PacketReader, DEFAULT_PORT};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about = "Connects to a relay server and prints what it sends back")]
    struct Args {
        /// Server address
        #[clap(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        addr: String,
        /// Room to join
        #[clap(short, long, default_value = "probe")]
        room: String,
        /// Identity to resume, 0 for a fresh one
        #[clap(short, long, default_value = "0")]
        client_id: u64,
        /// Team to join
        #[clap(short, long, default_value = "probe")]
        team: String,
        /// Only ask for the server counters
        #[clap(long)]
        stats: bool,
        /// Seconds to keep listening
        #[clap(short, long, default_value = "10")]
        duration: u64,
    }

    let args = Args::parse();

    let stream = TcpStream::connect(&args.addr).await?;
    println!("Connected to {} from {}", args.addr, stream.local_addr()?);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);

    let request = if args.stats {
        json!({ "type": "STATS" })
    } else {
        json!({
            "type": "HANDSHAKE",
            "clientId": args.client_id,
            "roomId": args.room,
            "clientState": { "teamId": args.team },
        })
    };
    println!("Sending: {}", request);
    write_frame(&mut write_half, &serde_json::to_vec(&request)?).await?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut next_heartbeat = Instant::now() + Duration::from_secs(5);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        // Keep the room from going idle while we listen
        if !args.stats && now >= next_heartbeat {
            write_frame(&mut write_half, br#"{"type":"HEARTBEAT"}"#).await?;
            next_heartbeat = now + Duration::from_secs(5);
        }

        let until = if args.stats {
            deadline
        } else {
            deadline.min(next_heartbeat)
        };
        let wait = until.saturating_duration_since(now);
        match timeout(wait, reader.next_frame()).await {
            Ok(Ok(Some(frame))) => match serde_json::from_slice::<Value>(&frame) {
                Ok(packet) => {
                    println!("Received: {}", packet);
                    if args.stats && packet["type"] == "STATS" {
                        break;
                    }
                }
                Err(e) => println!("Failed to parse frame: {}", e),
            },
            Ok(Ok(None)) => {
                println!("Server closed the connection");
                break;
            }
            Ok(Err(e)) => {
                println!("Error receiving: {}", e);
                break;
            }
            Err(_) => {}
        }
    }

    println!("Probe finished");
    Ok(())
}
