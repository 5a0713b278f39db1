#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("ERR {0}")]
    Generic(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR syntax error")]
    SyntaxError,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR internal error")]
    Internal,

    #[error("ERR peer {peer}: {reason}")]
    Peer { peer: String, reason: String },

    #[error("ERR transaction {0}: {1}")]
    Transaction(String, String),

    /// A multi-key command whose keys have different owners.
    #[error("ERR {0} must within one slot in cluster mode")]
    CrossSlot(&'static str),

    #[error("ERR {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    pub fn peer(peer: impl Into<String>, reason: impl ToString) -> Self {
        KvError::Peer {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;
