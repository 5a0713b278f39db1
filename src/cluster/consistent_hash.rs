use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_REPLICAS: usize = 4;

/// Consistent hash ring mapping keys to node ids.
///
/// Each node is placed at `replicas` points, the CRC-32 of
/// `"{index}{node_id}"` for each replica index.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    /// Sorted ring positions.
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        HashRing {
            replicas: replicas.max(1),
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Place each node on the ring. Empty ids are ignored.
    pub fn add<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            let node = node.as_ref();
            if node.is_empty() {
                continue;
            }
            for i in 0..self.replicas {
                let point = crc32fast::hash(format!("{i}{node}").as_bytes());
                self.points.push(point);
                self.owners.insert(point, node.to_string());
            }
        }
        self.points.sort_unstable();
        self.points.dedup();
    }

    /// Node owning `key`, or `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(partition_key(key).as_bytes());
        let idx = self.points.partition_point(|&p| p < hash);
        let point = self.points[idx % self.points.len()];
        self.owners.get(&point).map(String::as_str)
    }

    /// Bucket keys by owning node, keeping each bucket in input order.
    pub fn group_by_owner<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            if let Some(owner) = self.get(key.as_ref()) {
                groups
                    .entry(owner.to_string())
                    .or_default()
                    .push(key.as_ref().to_string());
            }
        }
        groups
    }
}

/// The part of `key` that is hashed: the text between the first `{` and the
/// following `}` when that is non-empty, otherwise the whole key.
pub fn partition_key(key: &str) -> &str {
    if let Some(start) = key.find('{')
        && let Some(len) = key[start + 1..].find('}')
        && len > 0
    {
        return &key[start + 1..start + 1 + len];
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key() {
        assert_eq!(partition_key("user:{42}:name"), "42");
        assert_eq!(partition_key("{a}b{c}"), "a");
        assert_eq!(partition_key("plain"), "plain");
        assert_eq!(partition_key("empty{}tag"), "empty{}tag");
        assert_eq!(partition_key("open{only"), "open{only");
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let mut ring = HashRing::default();
        assert!(ring.get("k").is_none());
        ring.add(&["10.0.0.1:6399", "10.0.0.2:6399", "10.0.0.3:6399", ""]);
        for i in 0..100 {
            let key = format!("key:{i}");
            let first = ring.get(&key).unwrap().to_string();
            assert_eq!(ring.get(&key), Some(first.as_str()));
        }

        let mut other = HashRing::default();
        other.add(&["10.0.0.3:6399", "10.0.0.1:6399", "10.0.0.2:6399"]);
        for i in 0..100 {
            let key = format!("key:{i}");
            assert_eq!(ring.get(&key), other.get(&key));
        }
    }

    #[test]
    fn test_hash_tags_colocate() {
        let mut ring = HashRing::default();
        ring.add(&["a", "b", "c", "d"]);
        let owner = ring.get("{order:7}:items").unwrap();
        assert_eq!(ring.get("{order:7}:total"), Some(owner));
        assert_eq!(ring.get("order:7"), Some(owner));
    }

    #[test]
    fn test_group_by_owner_covers_all_keys() {
        let mut ring = HashRing::default();
        ring.add(&["a", "b"]);
        let keys: Vec<String> = (0..50).map(|i| format!("k{i}")).collect();
        let groups = ring.group_by_owner(&keys);
        assert_eq!(groups.values().map(Vec::len).sum::<usize>(), 50);
        for (owner, bucket) in &groups {
            assert!(bucket.iter().all(|k| ring.get(k) == Some(owner.as_str())));
        }
    }

    #[test]
    fn test_wraps_past_last_point() {
        let mut ring = HashRing::new(1);
        ring.add(&["only"]);
        for i in 0..20 {
            assert_eq!(ring.get(&format!("{i}")), Some("only"));
        }
    }
}
