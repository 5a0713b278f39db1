use crate::error::{KvError, KvResult};
use crate::resp::{CmdLine, RespValue};
use crate::store::Db;
use crate::store::lock::KeyGuards;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A prepared transaction that is neither committed nor rolled back within
/// this window is rolled back by its participant.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a finished transaction stays registered so late messages still
/// find it.
pub const CLEANUP_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Created,
    Prepared,
    Committed,
    RolledBack,
}

impl TxStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::RolledBack)
    }
}

/// Prior state of one key.
#[derive(Debug)]
enum Undo {
    /// Commands that recreate the old value and TTL.
    Restore(Vec<CmdLine>),
    /// The key did not exist.
    Absent,
}

struct TxState {
    status: TxStatus,
    guards: Option<KeyGuards>,
    undo: Vec<(String, Undo)>,
}

/// One participant's share of a distributed command.
///
/// `prepare` write-locks the keys and snapshots them; the locks stay held
/// until `commit` or `rollback`. The status field makes both of those safe
/// to call more than once.
pub struct Transaction {
    id: String,
    cmdline: CmdLine,
    keys: Vec<String>,
    db: Arc<Db>,
    state: Mutex<TxState>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, cmdline: CmdLine, mut keys: Vec<String>, db: Arc<Db>) -> Self {
        let mut seen = std::collections::HashSet::new();
        keys.retain(|k| seen.insert(k.clone()));
        Transaction {
            id: id.into(),
            cmdline,
            keys,
            db,
            state: Mutex::new(TxState {
                status: TxStatus::Created,
                guards: None,
                undo: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub async fn status(&self) -> TxStatus {
        self.state.lock().await.status
    }

    /// Lock the keys and record how to restore them. A no-op if already
    /// prepared.
    pub async fn prepare(&self) -> KvResult<()> {
        let mut state = self.state.lock().await;
        match state.status {
            TxStatus::Prepared => return Ok(()),
            TxStatus::Committed | TxStatus::RolledBack => {
                return Err(KvError::Transaction(self.id.clone(), "already finished".into()));
            }
            TxStatus::Created => {}
        }
        let guards = self.db.lock_keys(&self.keys).await;
        state.undo = self
            .keys
            .iter()
            .map(|key| {
                let undo = match self.db.reconstruction(key) {
                    Some(commands) => Undo::Restore(commands),
                    None => Undo::Absent,
                };
                (key.clone(), undo)
            })
            .collect();
        state.guards = Some(guards);
        state.status = TxStatus::Prepared;
        debug!(txid = %self.id, keys = self.keys.len(), "Transaction prepared");
        Ok(())
    }

    /// Apply the command under the prepared locks and release them. A
    /// command error rolls this participant back and is returned as is.
    pub async fn commit(&self) -> RespValue {
        let mut state = self.state.lock().await;
        match state.status {
            TxStatus::Prepared => {}
            TxStatus::Committed => return RespValue::integer(0),
            TxStatus::Created => {
                return RespValue::error(
                    KvError::Transaction(self.id.clone(), "not prepared".into()).to_string(),
                );
            }
            TxStatus::RolledBack => {
                return RespValue::error(
                    KvError::Transaction(self.id.clone(), "already rolled back".into()).to_string(),
                );
            }
        }
        let reply = self.db.exec_locked(&self.cmdline).await;
        if reply.is_error() {
            warn!(txid = %self.id, "Transaction command failed, rolling back");
            self.undo(&mut state).await;
            return reply;
        }
        state.undo.clear();
        state.guards.take();
        state.status = TxStatus::Committed;
        debug!(txid = %self.id, "Transaction committed");
        reply
    }

    /// Restore every key from its snapshot and release the locks. Returns 1
    /// if this call did the rollback, 0 if there was nothing to undo.
    pub async fn rollback(&self) -> RespValue {
        let mut state = self.state.lock().await;
        match state.status {
            TxStatus::Prepared => {
                self.undo(&mut state).await;
                debug!(txid = %self.id, "Transaction rolled back");
                RespValue::integer(1)
            }
            TxStatus::Created => {
                state.status = TxStatus::RolledBack;
                RespValue::integer(0)
            }
            TxStatus::Committed | TxStatus::RolledBack => RespValue::integer(0),
        }
    }

    async fn undo(&self, state: &mut TxState) {
        for (key, undo) in std::mem::take(&mut state.undo) {
            let del: CmdLine = vec![b"DEL".to_vec(), key.clone().into_bytes()];
            self.db.exec_locked(&del).await;
            if let Undo::Restore(commands) = undo {
                for cmd in commands {
                    if let RespValue::Error(e) = self.db.exec_locked(&cmd).await {
                        warn!(txid = %self.id, key = %key, error = %e, "Failed to restore key");
                    }
                }
            }
        }
        state.guards.take();
        state.status = TxStatus::RolledBack;
    }
}
