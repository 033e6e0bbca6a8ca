/// Process-wide tunables, overridable at construction.
///
/// `simulated_network_delay_ms` and `simulated_failure_percent` are only
/// consulted by [`crate::gateway::mock::MockGateway`]; a real transport
/// ignores them.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub max_retry: u32,
    pub simulated_network_delay_ms: u64,
    pub simulated_failure_percent: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retry: 5,
            simulated_network_delay_ms: 800,
            simulated_failure_percent: 15,
        }
    }
}
