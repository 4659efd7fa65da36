use std::{
    collections::HashMap,
    error::Error,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use log::{debug, error, info};
use repnet::{
    CoherentState, Config, HostName, Node, QueueError, Replication, TcpStreamTransport,
    UdpTransport,
    pool::WorkerPool,
    protocol::{CoherencyLease, FilePageHint, Lsn, PageCompactRequest, SequenceAck},
    transport::StreamServer,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Name this node announces to its peers
    #[arg(long)]
    host: String,
    /// Current coordinator; defaults to this node
    #[arg(long)]
    master: Option<String>,
    /// Commissioned peer, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Datagram address to bind
    #[arg(long, default_value = "0.0.0.0:19000")]
    bind: SocketAddr,
    /// Stream channel address to listen on
    #[arg(long, default_value = "0.0.0.0:19001")]
    stream_bind: SocketAddr,
    /// Stream port for peers named without one
    #[arg(long, default_value_t = 19001)]
    stream_port: u16,
    /// Milliseconds between lease rounds or acknowledgements
    #[arg(long, default_value_t = 1000)]
    lease_interval_ms: u64,
    /// Lease duration in milliseconds
    #[arg(long, default_value_t = 5000)]
    lease_ms: i32,
    /// Worker threads for stream connections and queued work
    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[command(flatten)]
    config: Config,
}

/// Stand-in replication engine: tracks which replicas acknowledge and runs queued
/// work on a pool.
struct Engine {
    master: HostName,
    acked: Mutex<HashMap<HostName, SequenceAck>>,
    work: WorkerPool,
}

impl Engine {
    /// Replicas that acknowledged since the last call.
    fn take_acked(&self) -> Vec<HostName> {
        let mut acked = self.acked.lock().unwrap_or_else(PoisonError::into_inner);
        acked.drain().map(|(host, _)| host).collect()
    }
}

impl Replication for Engine {
    fn master(&self) -> Option<HostName> {
        Some(Arc::clone(&self.master))
    }

    fn generation(&self) -> u32 {
        1
    }

    fn verify_master_lease(&self, _commissioned: &[HostName]) -> bool {
        true
    }

    fn on_sequence_ack(&self, from: &HostName, ack: SequenceAck) {
        debug!("{from} acknowledged {}", ack.lsn);
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Arc::clone(from), ack);
    }

    fn on_lease(&self, from: &HostName, lease: CoherencyLease) {
        debug!("lease from {from} valid until {}", lease.expires_at_ms());
    }

    fn on_compaction_request(&self, from: &HostName, request: PageCompactRequest) {
        info!(
            "{from} asked to compact file {} ({} bytes)",
            request.file_id,
            request.size()
        );
        if let Err(e) = self.enqueue_compaction_work(&request) {
            error!("{e}");
        }
    }

    fn on_truncate_request(&self, from: &HostName, lsn: Lsn) {
        info!("{from} asked to truncate the log at {lsn}");
    }

    fn enqueue_prefetch(&self, hint: FilePageHint) -> Result<(), QueueError> {
        self.work
            .execute(move || debug!("prefetch page {} of file {}", hint.page_no, hint.file_id))
            .map_err(|e| QueueError(e.to_string()))
    }

    fn enqueue_compaction_work(&self, request: &PageCompactRequest) -> Result<(), QueueError> {
        let file_id = request.file_id;
        self.work
            .execute(move || debug!("compacting file {file_id}"))
            .map_err(|e| QueueError(e.to_string()))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))?;
    }

    let me: HostName = Arc::from(cli.host.as_str());
    let master: HostName = Arc::from(cli.master.as_deref().unwrap_or(cli.host.as_str()));
    let peers: Vec<HostName> = cli.peers.iter().map(|p| Arc::from(p.as_str())).collect();

    let socket = UdpSocket::bind(cli.bind)?;
    let datagrams = Arc::new(UdpTransport::from_socket(
        socket.try_clone()?,
        cli.config.udp_port,
    ));
    let stream = Arc::new(TcpStreamTransport::new(
        Arc::clone(&me),
        peers,
        cli.stream_port,
    ));
    let engine = Arc::new(Engine {
        master,
        acked: Mutex::new(HashMap::new()),
        work: WorkerPool::new("repnet-work", cli.workers)?,
    });

    let node = Arc::new(Node::new(
        cli.config.clone(),
        &me,
        datagrams,
        stream,
        Arc::clone(&engine) as Arc<dyn Replication>,
    ));
    let reader = node.start_receiver(socket, Arc::clone(&shutdown))?;

    let server = StreamServer::bind(
        cli.stream_bind,
        WorkerPool::new("repnet-stream", cli.workers)?,
    )?;
    let listener = {
        let node = Arc::clone(&node);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("repnet-stream".into())
            .spawn(move || {
                if let Err(e) = server.serve(node, shutdown) {
                    error!("stream channel failed: {e}");
                }
            })?
    };

    let interval = Duration::from_millis(cli.lease_interval_ms);
    let mut offset = 0u32;
    while !shutdown.load(Ordering::Relaxed) {
        if node.is_coordinator() {
            for host in engine.take_acked() {
                node.registry()
                    .set_coherent_state(&host, CoherentState::Coherent);
            }
            if node.broadcast_leases(cli.lease_ms) {
                debug!("lease round left some replicas unleased");
            }
        } else {
            offset = offset.wrapping_add(1);
            if let Err(e) = node.send_ack(Lsn::new(1, offset), 1) {
                if e.is_fatal() {
                    error!("{e}");
                    std::process::abort();
                }
                debug!("ack failed: {e}");
            }
        }
        thread::sleep(interval);
    }

    info!("shutting down\n{}", node.counters());
    let _ = reader.join();
    let _ = listener.join();
    Ok(())
}
