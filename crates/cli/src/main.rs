use clap::{Parser, ValueEnum};
use rtsp::media::passthrough_factory;
use rtsp::protocol::Credentials;
use rtsp::transport::{ControlProtocol, MediaTransport};
use rtsp::{Client, ClientConfig};
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, ValueEnum)]
enum Media {
    Tcp,
    Udp,
    Raw,
}

#[derive(Clone, Copy, ValueEnum)]
enum Control {
    Tcp,
    Udp,
    Http,
}

#[derive(Parser)]
#[command(name = "rtsp-pull", about = "Pull an RTSP presentation and report received frames")]
struct Args {
    /// Presentation URL (rtsp://, rtspu://, http://)
    url: String,

    /// Media transport offered first
    #[arg(long, short, value_enum, default_value = "udp")]
    transport: Media,

    /// Control connection; taken from the URL scheme when omitted
    #[arg(long, value_enum)]
    control: Option<Control>,

    #[arg(long, short)]
    user: Option<String>,

    #[arg(long, short, default_value = "")]
    password: String,

    /// Stop after this many seconds (0 runs until the stream ends)
    #[arg(long, short, default_value_t = 10)]
    seconds: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = ClientConfig {
        media_transport: match args.transport {
            Media::Tcp => MediaTransport::Interleaved,
            Media::Udp => MediaTransport::Udp,
            Media::Raw => MediaTransport::Raw,
        },
        control: args.control.map(|c| match c {
            Control::Tcp => ControlProtocol::Tcp,
            Control::Udp => ControlProtocol::Udp,
            Control::Http => ControlProtocol::Http,
        }),
        credentials: args.user.map(|u| Credentials::new(u, args.password)),
        depacketizer: passthrough_factory(),
        ..ClientConfig::default()
    };

    let client = match Client::new(&args.url, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Invalid location: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = client.start_playing(None) {
        eprintln!("Failed to start playing: {}", e);
        return ExitCode::FAILURE;
    }
    println!("Playing {} over {:?}", client.location(), client.media_transport());

    let started = Instant::now();
    let limit = Duration::from_secs(args.seconds);
    // control location -> (frames, bytes)
    let mut streams: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    while client.is_playing() && (args.seconds == 0 || started.elapsed() < limit) {
        for (control, mut frame) in client.frames() {
            let bytes = frame.buffer().map(|b| b.len()).unwrap_or(0);
            tracing::debug!(%control, timestamp = ?frame.timestamp(), packets = frame.count(), bytes, "frame");
            let entry = streams.entry(control).or_default();
            entry.0 += 1;
            entry.1 += bytes;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let stats = client.stats();
    client.close();
    for (control, (frames, bytes)) in &streams {
        println!("{}: {} frames, {} bytes", control, frames, bytes);
    }
    println!(
        "{} requests, {} retransmissions",
        stats.requests_sent, stats.retransmissions
    );
    ExitCode::SUCCESS
}
