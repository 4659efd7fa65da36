pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lease;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod replication;
pub mod stats;
pub mod throttle;
pub mod transport;

pub use config::Config;
pub use error::{NetError, QueueError};
pub use handlers::{Dispatch, Probe};
pub use node::Node;
pub use registry::{CoherentState, HostName, HostRegistry, host_checksum};
pub use replication::{Detached, Replication};
pub use stats::Counters;
pub use transport::{DatagramTransport, StreamTransport, TcpStreamTransport, UdpTransport};
