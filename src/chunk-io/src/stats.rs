use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use wire_proto::{ChunkPartType, ChunkTypeWithAddress, NetworkAddress};

/// Smoothing factor for the RTT moving average.
const RTT_ALPHA: f32 = 0.25;
/// Score penalty factor applied per recorded defect.
const DEFECT_PENALTY: f32 = 0.5;
const DEFAULT_RTT_MS: f32 = 200.0;

#[derive(Clone, Copy, Debug)]
struct ServerRecord {
    rtt_ms: f32,
    defects: u32,
}

impl ServerRecord {
    fn new(default_rtt_ms: f32) -> Self {
        Self {
            rtt_ms: default_rtt_ms,
            defects: 0,
        }
    }

    fn score(&self) -> f32 {
        // Higher is better. A server at the default RTT with no defects
        // scores 1.0; slow or failing servers decay towards zero.
        let rtt_component = DEFAULT_RTT_MS / self.rtt_ms.max(1.0);
        rtt_component * DEFECT_PENALTY.powi(self.defects.min(8) as i32)
    }
}

/// Aggregated per-chunkserver quality numbers. Shared between the connector
/// (which records them) and the read planner (which consumes them as scores).
pub struct ChunkserverStats {
    default_rtt_ms: f32,
    servers: Mutex<HashMap<NetworkAddress, ServerRecord>>,
}

impl Default for ChunkserverStats {
    fn default() -> Self {
        Self::new(DEFAULT_RTT_MS)
    }
}

impl ChunkserverStats {
    pub fn new(default_rtt_ms: f32) -> Self {
        Self {
            default_rtt_ms,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_read_time(&self, address: NetworkAddress, elapsed_ms: u64) {
        let mut servers = self.servers.lock().unwrap();
        let record = servers
            .entry(address)
            .or_insert_with(|| ServerRecord::new(self.default_rtt_ms));
        record.rtt_ms = (1.0 - RTT_ALPHA) * record.rtt_ms + RTT_ALPHA * elapsed_ms as f32;
        if record.defects > 0 {
            record.defects -= 1;
        }
    }

    pub fn register_defect(&self, address: NetworkAddress) {
        let mut servers = self.servers.lock().unwrap();
        let record = servers
            .entry(address)
            .or_insert_with(|| ServerRecord::new(self.default_rtt_ms));
        record.defects = record.defects.saturating_add(1);
    }

    pub fn score(&self, address: NetworkAddress) -> f32 {
        let servers = self.servers.lock().unwrap();
        servers
            .get(&address)
            .map(|record| record.score())
            .unwrap_or(1.0)
    }

    /// Scores keyed by chunk part for the planner (§4.2). When several
    /// locations hold the same part the best server wins.
    pub fn part_scores(
        &self,
        locations: &[ChunkTypeWithAddress],
    ) -> BTreeMap<ChunkPartType, f32> {
        let mut scores: BTreeMap<ChunkPartType, f32> = BTreeMap::new();
        for location in locations {
            let score = self.score(location.address);
            let entry = scores.entry(location.part_type).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defects_lower_the_score() {
        let stats = ChunkserverStats::default();
        let addr = NetworkAddress::new(1, 1);
        let healthy = stats.score(addr);
        stats.register_defect(addr);
        assert!(stats.score(addr) < healthy);
        // A successful read works the defect off again.
        stats.register_read_time(addr, 200);
        assert!(stats.score(addr) > DEFECT_PENALTY - 0.01);
    }

    #[test]
    fn slow_servers_score_below_fast_ones() {
        let stats = ChunkserverStats::default();
        let fast = NetworkAddress::new(1, 1);
        let slow = NetworkAddress::new(2, 2);
        for _ in 0..16 {
            stats.register_read_time(fast, 10);
            stats.register_read_time(slow, 900);
        }
        assert!(stats.score(fast) > stats.score(slow));
    }
}
