//! Client configuration: the knobs a caller can turn without this crate
//! growing a dependency on any particular config-file format. This crate
//! has no on-disk repository to read a `.git/config` from, so the
//! equivalent values are just a plain struct with a `Default` a caller can
//! override.

use crate::pack::{PackReaderLimits, PackWriterConfig};
use std::time::Duration;

/// Wall-clock budgets for each phase of a conversation. Exceeding one
/// surfaces as `GitSyncError::TransportTimeout`.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub advertisement: Duration,
    pub negotiation_round: Duration,
    pub pack_receive: Duration,
    pub pack_transmit: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            advertisement: Duration::from_secs(30),
            negotiation_round: Duration::from_secs(60),
            pack_receive: Duration::from_secs(300),
            pack_transmit: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// sent as the `agent=` capability on every conversation.
    pub agent: String,
    pub pack_reader: PackReaderLimits,
    pub pack_writer: PackWriterConfig,
    pub timeouts: PhaseTimeouts,
    /// true for a dumb-pipe HTTP transport: the engine must resend its full
    /// accumulated want/have state every round rather than relying on the
    /// server remembering earlier rounds.
    pub stateless: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent: format!("gitsync/{}", env!("CARGO_PKG_VERSION")),
            pack_reader: PackReaderLimits::default(),
            pack_writer: PackWriterConfig::default(),
            timeouts: PhaseTimeouts::default(),
            stateless: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_embeds_crate_version() {
        let config = ClientConfig::default();
        assert!(config.agent.starts_with("gitsync/"));
    }
}
