use crate::store::now_millis;
use parking_lot::Mutex;

/// 2024-01-01T00:00:00Z in unix milliseconds.
const EPOCH_MS: u64 = 1_704_067_200_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style id generator: milliseconds since a fixed epoch, a node
/// number derived from the node id, and a per-millisecond sequence.
pub struct IdGenerator {
    node: u64,
    state: Mutex<(u64, u64)>,
}

impl IdGenerator {
    pub fn new(node_id: &str) -> Self {
        let node = u64::from(crc32fast::hash(node_id.as_bytes())) & ((1 << NODE_BITS) - 1);
        IdGenerator {
            node,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let (last_ms, seq) = &mut *state;
        let mut now = now_millis().saturating_sub(EPOCH_MS).max(*last_ms);
        if now == *last_ms {
            *seq = (*seq + 1) & MAX_SEQUENCE;
            if *seq == 0 {
                // sequence exhausted for this millisecond, borrow the next one
                now += 1;
            }
        } else {
            *seq = 0;
        }
        *last_ms = now;
        (now << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | *seq
    }
}
