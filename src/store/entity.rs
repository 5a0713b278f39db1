use crate::resp::CmdLine;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Set(HashSet<Vec<u8>>),
}

impl Entity {
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::String(_) => "string",
            Entity::List(_) => "list",
            Entity::Hash(_) => "hash",
            Entity::Set(_) => "set",
        }
    }

    /// The single command that recreates this value under `key` on an empty
    /// table. Containers are never stored empty, so the command always has at
    /// least one element.
    pub fn to_command(&self, key: &str) -> CmdLine {
        let mut cmd = Vec::new();
        match self {
            Entity::String(v) => {
                cmd.push(b"SET".to_vec());
                cmd.push(key.as_bytes().to_vec());
                cmd.push(v.clone());
            }
            Entity::List(items) => {
                cmd.push(b"RPUSH".to_vec());
                cmd.push(key.as_bytes().to_vec());
                cmd.extend(items.iter().cloned());
            }
            Entity::Hash(fields) => {
                cmd.push(b"HSET".to_vec());
                cmd.push(key.as_bytes().to_vec());
                for (f, v) in fields {
                    cmd.push(f.clone());
                    cmd.push(v.clone());
                }
            }
            Entity::Set(members) => {
                cmd.push(b"SADD".to_vec());
                cmd.push(key.as_bytes().to_vec());
                cmd.extend(members.iter().cloned());
            }
        }
        cmd
    }
}

/// Wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruction_commands() {
        let s = Entity::String(b"v".to_vec());
        assert_eq!(s.to_command("k"), vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);

        let l = Entity::List(VecDeque::from(vec![b"a".to_vec(), b"b".to_vec()]));
        assert_eq!(
            l.to_command("l"),
            vec![b"RPUSH".to_vec(), b"l".to_vec(), b"a".to_vec(), b"b".to_vec()]
        );

        let mut h = HashMap::new();
        h.insert(b"f".to_vec(), b"1".to_vec());
        let cmd = Entity::Hash(h).to_command("h");
        assert_eq!(cmd[0], b"HSET");
        assert_eq!(cmd.len(), 4);

        let set: HashSet<Vec<u8>> = [b"x".to_vec()].into_iter().collect();
        assert_eq!(Entity::Set(set).type_name(), "set");
    }
}
