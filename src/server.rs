use crate::cluster::Cluster;
use crate::command::CommandTable;
use crate::config::Config;
use crate::error::KvResult;
use crate::persistence::aof::{self, Aof};
use crate::resp::{CmdLine, RespParser, RespValue};
use crate::store::Db;
use crate::timewheel::{DEFAULT_INTERVAL, DEFAULT_SLOTS, TimeWheel};
use bytes::BytesMut;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that answers command lines: the local table in standalone mode,
/// the routing front end in cluster mode.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, cmdline: CmdLine) -> impl Future<Output = RespValue> + Send;
}

impl Executor for Db {
    fn execute(&self, cmdline: CmdLine) -> impl Future<Output = RespValue> + Send {
        async move { self.exec(&cmdline).await }
    }
}

impl Executor for Cluster {
    fn execute(&self, cmdline: CmdLine) -> impl Future<Output = RespValue> + Send {
        self.exec(cmdline)
    }
}

/// Build the node described by `config` and serve it on `listener` until
/// `shutdown` is cancelled. With the log enabled it is replayed before the
/// first client is accepted and synced after the last one.
pub async fn serve(config: Config, listener: TcpListener, shutdown: CancellationToken) -> KvResult<()> {
    let wheel = TimeWheel::start(DEFAULT_INTERVAL, DEFAULT_SLOTS);
    let db = Db::new(Arc::new(CommandTable::new()), Some(wheel));

    if config.appendonly {
        let path = PathBuf::from(&config.appendfilename);
        let loaded = aof::load(&db, &path, None).await?;
        info!("Loaded {loaded} commands from {}", path.display());
        db.attach_aof(Aof::open(path)?);
    }

    if config.cluster_enabled() {
        let cluster = Cluster::new(config.self_id.clone(), &config.peers, db.clone());
        run_server(listener, cluster, config.maxclients, shutdown).await?;
    } else {
        run_server(listener, db.clone(), config.maxclients, shutdown).await?;
    }

    if let Some(aof) = db.aof() {
        aof.sync().await;
    }
    Ok(())
}

/// Accept clients until `shutdown` is cancelled.
pub async fn run_server<E: Executor>(
    listener: TcpListener,
    engine: Arc<E>,
    max_clients: usize,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let slots = Arc::new(Semaphore::new(max_clients.max(1)));
    info!("Server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };
                let Ok(permit) = slots.clone().try_acquire_owned() else {
                    warn!("Rejecting {peer_addr}: max number of clients reached");
                    tokio::spawn(reject(stream));
                    continue;
                };
                debug!("New connection from {peer_addr}");

                let engine = engine.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(stream, engine, shutdown).await {
                        debug!("Connection error from {peer_addr}: {e}");
                    }
                    debug!("Connection closed: {peer_addr}");
                });
            }
            _ = shutdown.cancelled() => {
                info!("Shutting down...");
                return Ok(());
            }
        }
    }
}

async fn reject(mut stream: TcpStream) {
    let reply = RespValue::error("ERR max number of clients reached");
    let _ = stream.write_all(&reply.serialize()).await;
}

async fn handle_connection<E: Executor>(
    mut stream: TcpStream,
    engine: Arc<E>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = Vec::with_capacity(4096);

    loop {
        // Answer every complete command already buffered
        loop {
            match RespParser::parse(&mut buf) {
                Ok(Some(value)) => {
                    let Some(cmdline) = value.into_cmdline() else {
                        RespValue::error("ERR invalid command format").write_to(&mut out);
                        continue;
                    };
                    if cmdline[0].eq_ignore_ascii_case(b"quit") {
                        RespValue::ok().write_to(&mut out);
                        stream.write_all(&out).await?;
                        return Ok(());
                    }
                    engine.execute(cmdline).await.write_to(&mut out);
                }
                Ok(None) => break,
                Err(e) => {
                    RespValue::error(format!("ERR Protocol error: {e}")).write_to(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }

        tokio::select! {
            result = stream.read_buf(&mut buf) => {
                if result? == 0 {
                    return Ok(());
                }
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
