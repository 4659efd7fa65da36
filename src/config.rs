//! Runtime switches for transport selection and tracing.
use clap::{ArgAction, Args};

pub const DEFAULT_UDP_PORT: u16 = 19000;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct Config {
    /// Send sequence acknowledgements over the datagram channel
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub udp: bool,

    /// Send coherency leases over the datagram channel
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub coherency_lease_udp: bool,

    /// Send page compaction requests over the datagram channel
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    pub page_compact_udp: bool,

    /// Fan page prefetch hints out to replicas
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    pub prefault_udp: bool,

    /// Check this node's master lease before issuing coherency leases
    #[arg(long)]
    pub master_lease: bool,

    /// Log connectivity changes and skipped peers while issuing leases
    #[arg(long)]
    pub verbose_leases: bool,

    /// Log the base time of each lease round
    #[arg(long)]
    pub lease_base_trace: bool,

    /// Log outgoing sequence acknowledgements
    #[arg(long)]
    pub ack_trace: bool,

    /// Datagram port for host names that do not carry one
    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    pub udp_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: true,
            coherency_lease_udp: true,
            page_compact_udp: false,
            prefault_udp: false,
            master_lease: false,
            verbose_leases: false,
            lease_base_trace: false,
            ack_trace: false,
            udp_port: DEFAULT_UDP_PORT,
        }
    }
}
