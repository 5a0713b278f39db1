pub mod client;
pub mod consistent_hash;
pub mod idgen;
pub mod router;
pub mod transaction;

use crate::command::key_string;
use crate::error::{KvError, KvResult};
use crate::resp::{CmdLine, RespValue};
use crate::store::Db;
use client::PeerPool;
use consistent_hash::HashRing;
use idgen::IdGenerator;
use parking_lot::Mutex;
use router::{Route, route_of, route_table};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use transaction::{CLEANUP_DELAY, LOCK_TIMEOUT, Transaction};

/// Cluster front end: routes each command to the node owning its keys and
/// coordinates multi-node writes with two-phase commit.
///
/// Two-phase commit here is best effort. If a participant fails during the
/// commit round, participants that already committed are not compensated.
pub struct Cluster {
    self_id: String,
    nodes: Vec<String>,
    db: Arc<Db>,
    ring: HashRing,
    peers: HashMap<String, PeerPool>,
    transactions: Mutex<HashMap<String, Arc<Transaction>>>,
    ids: IdGenerator,
    routes: HashMap<&'static str, Route>,
    this: Weak<Cluster>,
}

fn tx_timeout_key(txid: &str) -> String {
    format!("tx:{txid}")
}

fn tx_cleanup_key(txid: &str) -> String {
    format!("tx-clean:{txid}")
}

fn command_name(cmdline: &[Vec<u8>]) -> String {
    cmdline
        .first()
        .map(|n| String::from_utf8_lossy(n).to_lowercase())
        .unwrap_or_default()
}

impl Cluster {
    /// `peers` and `self_id` are `host:port` addresses; duplicates are
    /// collapsed and this node is always part of the ring.
    pub fn new(self_id: impl Into<String>, peers: &[String], db: Arc<Db>) -> Arc<Cluster> {
        let self_id = self_id.into();
        let mut nodes: Vec<String> = Vec::new();
        for node in peers.iter().chain(std::iter::once(&self_id)) {
            if !node.is_empty() && !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        let mut ring = HashRing::default();
        ring.add(&nodes);
        let peers = nodes
            .iter()
            .filter(|n| **n != self_id)
            .map(|n| (n.clone(), PeerPool::new(n.clone())))
            .collect();
        info!(node = %self_id, nodes = ?nodes, "Cluster mode enabled");
        Arc::new_cyclic(|this| Cluster {
            ids: IdGenerator::new(&self_id),
            self_id,
            nodes,
            db,
            ring,
            peers,
            transactions: Mutex::new(HashMap::new()),
            routes: route_table(),
            this: this.clone(),
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    fn owner(&self, key: &[u8]) -> String {
        self.ring
            .get(&key_string(key))
            .unwrap_or(self.self_id.as_str())
            .to_string()
    }

    /// Entry point for client commands.
    pub async fn exec(&self, cmdline: CmdLine) -> RespValue {
        let name = command_name(&cmdline);
        let result = match route_of(&self.routes, &name) {
            Route::Local => Ok(self.db.exec(&cmdline).await),
            Route::Prepare | Route::Commit | Route::Rollback => Ok(self.exec_local(&cmdline).await),
            Route::Relay => self.relay_by_first_key(&cmdline).await,
            Route::Del => self.del(&cmdline).await,
            Route::MSet => self.mset(&cmdline).await,
            Route::MGet => self.mget(&cmdline).await,
            Route::Exists => self.exists(&cmdline).await,
            Route::MSetNx => self.msetnx(&cmdline).await,
            Route::Rename => self.rename(&cmdline).await,
            Route::Broadcast => self.broadcast(&cmdline).await,
        };
        result.unwrap_or_else(|e| RespValue::error(e.to_string()))
    }

    /// Send a command to `node`, running it in-process when that is this
    /// node. `Err` means the node could not be reached; a command failure
    /// comes back as an error reply.
    pub async fn relay(&self, node: &str, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if node == self.self_id {
            return Ok(self.exec_local(cmdline).await);
        }
        let pool = self
            .peers
            .get(node)
            .ok_or_else(|| KvError::peer(node, "unknown node"))?;
        pool.request(cmdline).await
    }

    /// Run on this node only. Transaction control commands end here and are
    /// never relayed further.
    async fn exec_local(&self, cmdline: &[Vec<u8>]) -> RespValue {
        let name = command_name(cmdline);
        match (name.as_str(), cmdline.len()) {
            ("prepare", n) if n >= 3 => {
                let txid = key_string(&cmdline[1]);
                self.prepare_local(&txid, cmdline[2..].to_vec()).await
            }
            ("commit", 2) => self.commit_local(&key_string(&cmdline[1])).await,
            ("rollback", 2) => self.rollback_local(&key_string(&cmdline[1])).await,
            ("prepare" | "commit" | "rollback", _) => {
                RespValue::error(KvError::WrongArgCount(name.clone()).to_string())
            }
            _ => self.db.exec(cmdline).await,
        }
    }

    async fn relay_by_first_key(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        match cmdline.get(1) {
            Some(key) => self.relay(&self.owner(key), cmdline).await,
            None => Ok(self.db.exec(cmdline).await),
        }
    }

    // ---- transaction participant ----

    fn transaction(&self, txid: &str) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(txid).cloned()
    }

    pub async fn prepare_local(&self, txid: &str, cmdline: CmdLine) -> RespValue {
        let keys = match self.db.commands().lookup(&cmdline) {
            Ok(spec) => {
                let (mut write, read) = (spec.keys)(&cmdline[1..]);
                write.extend(read);
                write
            }
            Err(e) => return RespValue::error(e.to_string()),
        };
        let tx = self
            .transactions
            .lock()
            .entry(txid.to_string())
            .or_insert_with(|| Arc::new(Transaction::new(txid, cmdline, keys, self.db.clone())))
            .clone();
        if let Err(e) = tx.prepare().await {
            return RespValue::error(e.to_string());
        }
        self.schedule_timeout(txid);
        RespValue::ok()
    }

    fn schedule_timeout(&self, txid: &str) {
        let Some(wheel) = self.db.scheduler() else {
            return;
        };
        let this = self.this.clone();
        let id = txid.to_string();
        wheel.delay(
            LOCK_TIMEOUT,
            tx_timeout_key(txid),
            Box::new(move || {
                let Some(cluster) = this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if cluster.rollback_local(&id).await == RespValue::integer(1) {
                        warn!(txid = %id, "Transaction not finished in time, rolled back");
                    }
                });
            }),
        );
    }

    pub async fn commit_local(&self, txid: &str) -> RespValue {
        let Some(tx) = self.transaction(txid) else {
            return RespValue::integer(0);
        };
        let reply = tx.commit().await;
        self.finish(&tx).await;
        reply
    }

    pub async fn rollback_local(&self, txid: &str) -> RespValue {
        let Some(tx) = self.transaction(txid) else {
            return RespValue::integer(0);
        };
        let reply = tx.rollback().await;
        self.finish(&tx).await;
        reply
    }

    /// Cancel the timeout of a finished transaction and forget it after the
    /// grace period.
    async fn finish(&self, tx: &Transaction) {
        if !tx.status().await.is_finished() {
            return;
        }
        let txid = tx.id().to_string();
        match self.db.scheduler() {
            Some(wheel) => {
                wheel.cancel(&tx_timeout_key(&txid));
                let this = self.this.clone();
                let key = tx_cleanup_key(&txid);
                wheel.delay(
                    CLEANUP_DELAY,
                    key,
                    Box::new(move || {
                        if let Some(cluster) = this.upgrade() {
                            cluster.transactions.lock().remove(&txid);
                        }
                    }),
                );
            }
            None => {
                self.transactions.lock().remove(&txid);
            }
        }
    }

    // ---- transaction coordinator ----

    /// Run one sub-command per node as a distributed transaction and return
    /// each node's commit reply.
    ///
    /// A `0` reply to `COMMIT` counts as success even though it also means the
    /// participant no longer knew the transaction, e.g. after a restart.
    pub async fn two_phase(&self, groups: BTreeMap<String, CmdLine>) -> KvResult<Vec<(String, RespValue)>> {
        let txid = self.ids.next_id().to_string();
        debug!(txid = %txid, nodes = groups.len(), "Starting distributed transaction");

        for (node, cmdline) in &groups {
            let mut prepare = vec![b"PREPARE".to_vec(), txid.clone().into_bytes()];
            prepare.extend(cmdline.iter().cloned());
            if let Err(e) = self.expect_ok(node, &txid, &prepare).await {
                self.rollback_all(&groups, &txid).await;
                return Err(e);
            }
        }

        let commit = vec![b"COMMIT".to_vec(), txid.clone().into_bytes()];
        let mut replies = Vec::with_capacity(groups.len());
        for node in groups.keys() {
            match self.expect_ok(node, &txid, &commit).await {
                Ok(reply) => replies.push((node.clone(), reply)),
                Err(e) => {
                    // nodes that already committed treat this as a no-op
                    self.rollback_all(&groups, &txid).await;
                    return Err(e);
                }
            }
        }
        Ok(replies)
    }

    async fn expect_ok(&self, node: &str, txid: &str, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        match self.relay(node, cmdline).await? {
            RespValue::Error(msg) => Err(KvError::Transaction(
                txid.to_string(),
                format!("node {node}: {msg}"),
            )),
            reply => Ok(reply),
        }
    }

    async fn rollback_all(&self, groups: &BTreeMap<String, CmdLine>, txid: &str) {
        let rollback = vec![b"ROLLBACK".to_vec(), txid.as_bytes().to_vec()];
        for node in groups.keys() {
            if let Err(e) = self.relay(node, &rollback).await {
                warn!(txid, node = %node, error = %e, "Rollback not delivered");
            }
        }
    }

    // ---- routed multi-key commands ----

    async fn del(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() < 2 {
            return Ok(self.db.exec(cmdline).await);
        }
        let keys: Vec<String> = cmdline[1..].iter().map(|k| key_string(k)).collect();
        let groups = self.ring.group_by_owner(&keys);
        if groups.len() == 1 {
            return self.relay(&self.owner(&cmdline[1]), cmdline).await;
        }
        let subcommands = groups
            .into_iter()
            .map(|(node, keys)| {
                let mut sub = vec![b"DEL".to_vec()];
                sub.extend(keys.into_iter().map(String::into_bytes));
                (node, sub)
            })
            .collect();
        let replies = self.two_phase(subcommands).await?;
        let deleted = replies.iter().filter_map(|(_, r)| r.as_integer()).sum();
        Ok(RespValue::integer(deleted))
    }

    async fn mset(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() < 3 || cmdline.len() % 2 == 0 {
            return Err(KvError::WrongArgCount("mset".into()));
        }
        let mut groups: BTreeMap<String, CmdLine> = BTreeMap::new();
        for pair in cmdline[1..].chunks(2) {
            groups
                .entry(self.owner(&pair[0]))
                .or_insert_with(|| vec![b"MSET".to_vec()])
                .extend(pair.iter().cloned());
        }
        if groups.len() == 1 {
            return self.relay(&self.owner(&cmdline[1]), cmdline).await;
        }
        self.two_phase(groups).await?;
        Ok(RespValue::ok())
    }

    async fn mget(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() < 2 {
            return Ok(self.db.exec(cmdline).await);
        }
        let keys: Vec<String> = cmdline[1..].iter().map(|k| key_string(k)).collect();
        let mut values: HashMap<String, RespValue> = HashMap::new();
        for (node, group) in self.ring.group_by_owner(&keys) {
            let mut sub = vec![b"MGET".to_vec()];
            sub.extend(group.iter().map(|k| k.clone().into_bytes()));
            match self.relay(&node, &sub).await? {
                RespValue::Array(Some(items)) if items.len() == group.len() => {
                    values.extend(group.into_iter().zip(items));
                }
                RespValue::Error(msg) => return Ok(RespValue::Error(msg)),
                other => {
                    return Err(KvError::peer(node, format!("unexpected MGET reply {other:?}")));
                }
            }
        }
        let ordered = keys
            .iter()
            .map(|k| values.get(k).cloned().unwrap_or(RespValue::null_bulk_string()))
            .collect();
        Ok(RespValue::array(ordered))
    }

    async fn exists(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() < 2 {
            return Ok(self.db.exec(cmdline).await);
        }
        let keys: Vec<String> = cmdline[1..].iter().map(|k| key_string(k)).collect();
        let mut count = 0;
        for (node, group) in self.ring.group_by_owner(&keys) {
            let mut sub = vec![b"EXISTS".to_vec()];
            sub.extend(group.into_iter().map(String::into_bytes));
            match self.relay(&node, &sub).await? {
                RespValue::Integer(n) => count += n,
                RespValue::Error(msg) => return Ok(RespValue::Error(msg)),
                other => {
                    return Err(KvError::peer(node, format!("unexpected EXISTS reply {other:?}")));
                }
            }
        }
        Ok(RespValue::integer(count))
    }

    /// No key may be set unless none exists, which participants cannot decide
    /// independently, so every key has to live on one node.
    async fn msetnx(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() < 3 || cmdline.len() % 2 == 0 {
            return Err(KvError::WrongArgCount("msetnx".into()));
        }
        let owner = self.owner(&cmdline[1]);
        if cmdline[1..].chunks(2).any(|pair| self.owner(&pair[0]) != owner) {
            return Err(KvError::CrossSlot("msetnx"));
        }
        self.relay(&owner, cmdline).await
    }

    async fn rename(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        if cmdline.len() != 3 {
            return Ok(self.db.exec(cmdline).await);
        }
        let src = self.owner(&cmdline[1]);
        if src != self.owner(&cmdline[2]) {
            return Err(KvError::CrossSlot("rename"));
        }
        self.relay(&src, cmdline).await
    }

    async fn broadcast(&self, cmdline: &[Vec<u8>]) -> KvResult<RespValue> {
        let mut last = RespValue::ok();
        for node in &self.nodes {
            let reply = self.relay(node, cmdline).await?;
            if reply.is_error() {
                return Ok(reply);
            }
            last = reply;
        }
        Ok(last)
    }
}
