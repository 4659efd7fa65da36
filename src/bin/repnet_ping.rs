use std::{
    error::Error,
    io,
    net::{IpAddr, SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use repnet::{Config, Detached, Dispatch, Node, TcpStreamTransport, UdpTransport};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Datagram address of the node to probe
    address: SocketAddr,
    /// Number of probes to send
    #[arg(short, long, default_value_t = 3)]
    count: u32,
    /// Milliseconds to wait for each echo
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

/// Local address the kernel would route `target` through.
fn local_ip_for(target: SocketAddr) -> io::Result<IpAddr> {
    let unspecified = if target.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(unspecified)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let socket = UdpSocket::bind((local_ip_for(cli.address)?, 0))?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    let me = socket.local_addr()?.to_string();

    let config = Config::default();
    let node = Node::new(
        config.clone(),
        &me,
        Arc::new(UdpTransport::from_socket(
            socket.try_clone()?,
            config.udp_port,
        )),
        Arc::new(TcpStreamTransport::new(Arc::from(me.as_str()), Vec::new(), 0)),
        Arc::new(Detached),
    );
    let mut receiver = node.receiver();
    let timeout = Duration::from_millis(cli.timeout_ms);

    for seq in 0..cli.count {
        node.ping_addr(cli.address)?;

        let deadline = Instant::now() + timeout;
        let mut answered = false;
        while !answered && Instant::now() < deadline {
            if let Some(Ok(Dispatch::Rtt { millis, .. })) = receiver.poll(&socket) {
                println!("echo from {}: seq={seq} time={millis:.3} ms", cli.address);
                answered = true;
            }
        }
        if !answered {
            println!("no echo from {}: seq={seq}", cli.address);
        }
    }

    println!("{}", node.counters());
    Ok(())
}
