use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use relay::feedback::rtcp;
use relay::media::h264::ANNEX_B_START_CODE;
use relay::session::sdp;
use relay::source::FileConnector;
use relay::transport::UdpSessionFactory;
use relay::{JitterConfig, MediaKind, NackConfig, Relay, RelayConfig, RouterState, RtpReceiver};

#[derive(Parser)]
#[command(
    name = "rtmp-rtc-relay",
    about = "Relay H.264 streams to RTP peers with NACK retransmission"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay an Annex B file to one RTP peer
    Send {
        /// H.264 Annex B elementary stream
        #[arg(long, short)]
        input: PathBuf,

        /// Playback frame rate
        #[arg(long, default_value_t = 25)]
        fps: u32,

        /// Receiver address (host:port)
        #[arg(long, short)]
        peer: SocketAddr,

        /// Local address for the relay's sockets
        #[arg(long, short, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Address advertised in the SDP answer when behind NAT
        #[arg(long)]
        public_ip: Option<IpAddr>,

        /// RTP payload size limit
        #[arg(long, default_value_t = 1200)]
        mtu: usize,
    },
    /// Receive an RTP H.264 stream into an Annex B file
    Receive {
        /// Listen address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:5004")]
        bind: SocketAddr,

        /// Output Annex B file
        #[arg(long, short)]
        output: PathBuf,

        /// Longest wait for a missing packet, in ms of media time
        #[arg(long, default_value_t = 100)]
        max_wait_ms: u32,

        /// Stop after this many seconds without packets
        #[arg(long, default_value_t = 5)]
        idle_timeout: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let result = match args.command {
        Command::Send {
            input,
            fps,
            peer,
            bind,
            public_ip,
            mtu,
        } => send(input, fps, peer, bind, public_ip, mtu),
        Command::Receive {
            bind,
            output,
            max_wait_ms,
            idle_timeout,
        } => receive(bind, output, max_wait_ms, Duration::from_secs(idle_timeout)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn send(
    input: PathBuf,
    fps: u32,
    peer: SocketAddr,
    bind: IpAddr,
    public_ip: Option<IpAddr>,
    mtu: usize,
) -> relay::Result<()> {
    let input = input.canonicalize()?;
    let url = format!("file://{}", input.display());

    let config = RelayConfig {
        mtu,
        ..RelayConfig::default()
    };
    let mut sessions = UdpSessionFactory::new(bind);
    if let Some(ip) = public_ip {
        sessions = sessions.with_public_ip(ip);
    }
    let relay = Relay::new(
        Arc::new(FileConnector::new(fps)),
        Arc::new(sessions),
        config.clone(),
    );

    let offer = sdp::receiver_offer(peer, &config, &[MediaKind::Video]);
    let subscription = relay.subscribe(&url, &offer)?;
    println!(
        "Relaying {} to {} (transport {})",
        input.display(),
        peer,
        subscription.transport_id
    );
    println!("{}", subscription.answer);

    while let Some(router) = relay.router(&subscription.stream_path) {
        if router.state() == RouterState::Stopped {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    relay.shutdown();
    Ok(())
}

fn receive(
    bind: SocketAddr,
    output: PathBuf,
    max_wait_ms: u32,
    idle_timeout: Duration,
) -> relay::Result<()> {
    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(Duration::from_millis(10)))?;
    let mut out = BufWriter::new(File::create(&output)?);

    let config = RelayConfig::default();
    let jitter = JitterConfig {
        max_wait_ms,
        ..JitterConfig::default()
    };
    let mut receiver = RtpReceiver::new(&jitter, NackConfig::default(), config.video_clock_rate);

    println!("Receiving on {} into {}", socket.local_addr()?, output.display());

    let mut buf = vec![0u8; 2048];
    let mut sender: Option<SocketAddr> = None;
    let mut last_packet = Instant::now();
    let mut nal_count = 0usize;

    while last_packet.elapsed() < idle_timeout {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let datagram = &buf[..len];
                if rtcp::is_rtcp(datagram) {
                    continue;
                }
                last_packet = Instant::now();
                sender = Some(from);
                match receiver.push_datagram(datagram, last_packet) {
                    Ok(nals) => {
                        nal_count += nals.len();
                        write_nals(&mut out, &nals)?;
                    }
                    Err(e) => tracing::warn!(from = %from, error = %e, "bad RTP datagram"),
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e.into()),
        }

        if let (Some(nack), Some(to)) = (receiver.poll_nack(Instant::now()), sender) {
            socket.send_to(&nack.marshal(), to)?;
        }
    }

    out.flush()?;
    println!(
        "Received {} packets, wrote {} NAL units, skipped {}",
        receiver.received(),
        nal_count,
        receiver.skipped()
    );
    Ok(())
}

fn write_nals(out: &mut impl Write, nals: &[Bytes]) -> std::io::Result<()> {
    for nal in nals {
        out.write_all(&ANNEX_B_START_CODE)?;
        out.write_all(nal)?;
    }
    Ok(())
}
