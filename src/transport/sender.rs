use std::sync::Arc;

use log::error;

use crate::{protocol::Envelope, stats::Stats};

use super::{DatagramTransport, TransportError};

/// Counting front for a [`DatagramTransport`]. Never retries.
pub struct DatagramSender {
    transport: Arc<dyn DatagramTransport>,
    stats: Arc<Stats>,
}

impl DatagramSender {
    pub fn new(transport: Arc<dyn DatagramTransport>, stats: Arc<Stats>) -> Self {
        Self { transport, stats }
    }

    pub fn send(&self, to: &str, envelope: &Envelope) -> Result<usize, TransportError> {
        match self.transport.send(to, envelope) {
            Ok(n) => {
                self.stats.record_sent();
                Ok(n)
            }
            Err(e) => {
                if !e.is_soft() {
                    error!(
                        "udp send of {:?} to {to} failed, sz:{}: {e}",
                        envelope.message_type(),
                        envelope.encoded_len()
                    );
                }
                self.stats.record_failed();
                Err(e)
            }
        }
    }

    pub fn transport(&self) -> &Arc<dyn DatagramTransport> {
        &self.transport
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use crate::{protocol::MessageType, transport::testing::RecordingTransport};

    use super::*;

    #[test]
    fn counts_successes_and_failures() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_for("down");
        let stats = Arc::new(Stats::new());
        let sender = DatagramSender::new(transport.clone(), Arc::clone(&stats));

        let envelope = Envelope::bare(MessageType::UdpPing, "me");
        assert_eq!(sender.send("up", &envelope).unwrap(), envelope.encoded_len());
        assert!(sender.send("down", &envelope).is_err());
        assert!(sender.send("down", &envelope).is_err());

        let counters = stats.snapshot();
        assert_eq!(counters.sent, 1);
        assert_eq!(counters.failed, 2);
        assert_eq!(transport.sent().len(), 1);
    }
}
