//! Snapshot sync between a primary and bootstrapping replicas
//!
//! Protocol, on the `<exchange>_dataDump` exchange:
//!
//! 1. The replica subscribes, then publishes `Request { request_id }`.
//! 2. Every snapshot server answers with `Offer { request_id, endpoint }`.
//! 3. The replica connects to the first matching endpoint over TCP and reads
//!    one frame: a big-endian `u64` length followed by a bincode
//!    [`IndexSnapshot`].

use fileshelf_bus::{Message, MessageBus};
use fileshelf_common::config::SyncConfig;
use fileshelf_common::{Error, Result};
use fileshelf_meta_store::{IndexSnapshot, MetaIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Refuse frames larger than this
const MAX_SNAPSHOT_SIZE: u64 = 1 << 32;

/// Control messages on the sync exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    Request { request_id: Uuid },
    Offer { request_id: Uuid, endpoint: String },
}

impl SyncMessage {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::new(serde_json::to_vec(self)?))
    }

    fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload)
            .inspect_err(|e| warn!(error = %e, "ignoring malformed sync message"))
            .ok()
    }
}

/// Serves index snapshots to bootstrapping replicas
pub struct SnapshotServer {
    endpoint: String,
    tasks: Vec<JoinHandle<()>>,
}

impl SnapshotServer {
    /// Bind a listener and start answering snapshot requests on `exchange`
    pub async fn start(
        index: Arc<MetaIndex>,
        bus: Arc<dyn MessageBus>,
        exchange: &str,
        config: &SyncConfig,
    ) -> Result<Self> {
        let listener = bind_in_range(config).await?;
        let port = listener.local_addr()?.port();
        let endpoint = format!("{}:{port}", config.advertised_host());

        let mut requests = bus.subscribe(exchange).await?;
        info!(%endpoint, exchange, "snapshot server listening");

        let offer_endpoint = endpoint.clone();
        let exchange_name = exchange.to_string();
        let answer = tokio::spawn(async move {
            while let Some(delivery) = requests.next().await {
                let Some(SyncMessage::Request { request_id }) = SyncMessage::parse(delivery.payload())
                else {
                    continue;
                };
                debug!(%request_id, "snapshot requested");
                let offer = SyncMessage::Offer {
                    request_id,
                    endpoint: offer_endpoint.clone(),
                };
                let published = match offer.to_message() {
                    Ok(message) => bus.publish(&exchange_name, message).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = published {
                    error!(%request_id, error = %e, "failed to offer snapshot");
                }
            }
        });

        let serve = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "snapshot listener accept failed");
                        continue;
                    }
                };
                let index = index.clone();
                tokio::spawn(async move {
                    match send_snapshot(&index, stream).await {
                        Ok(size) => info!(%peer, size, "snapshot sent"),
                        Err(e) => error!(%peer, error = %e, "snapshot transfer failed"),
                    }
                });
            }
        });

        Ok(Self {
            endpoint,
            tasks: vec![answer, serve],
        })
    }

    /// Address announced to replicas
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for SnapshotServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind inside `[min_port, max_port]`, starting from a random port
async fn bind_in_range(config: &SyncConfig) -> Result<TcpListener> {
    let host = config.listen_host.as_str();
    if config.min_port == 0 && config.max_port == 0 {
        return Ok(TcpListener::bind((host, 0)).await?);
    }
    if config.min_port > config.max_port {
        return Err(Error::Configuration(format!(
            "sync port range {}..={} is empty",
            config.min_port, config.max_port
        )));
    }

    let span = u32::from(config.max_port - config.min_port) + 1;
    let start = rand::thread_rng().gen_range(0..span);
    let mut last_error = None;
    for step in 0..span {
        let offset = (start + step) % span;
        let Ok(port) = u16::try_from(u32::from(config.min_port) + offset) else {
            continue;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.map_or_else(
        || Error::Configuration("no port available for snapshot server".into()),
        Error::Io,
    ))
}

async fn send_snapshot(index: &MetaIndex, mut stream: TcpStream) -> Result<usize> {
    let bytes = index.snapshot()?.to_bytes()?;
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(bytes.len())
}

/// Read a `len` byte frame body, growing the buffer as bytes arrive
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(len).read_to_end(&mut buf).await?;
    if buf.len() as u64 != len {
        return Err(Error::Serialization(format!(
            "snapshot truncated: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Ask the primary for a snapshot and download it
pub async fn fetch_snapshot(
    bus: &dyn MessageBus,
    exchange: &str,
    config: &SyncConfig,
) -> Result<IndexSnapshot> {
    let wait = config.request_timeout();
    let mut offers = bus.subscribe(exchange).await?;

    let request_id = Uuid::new_v4();
    bus.publish(exchange, SyncMessage::Request { request_id }.to_message()?)
        .await?;
    info!(%request_id, exchange, "requested index snapshot");

    let endpoint = timeout(wait, async {
        while let Some(delivery) = offers.next().await {
            if let Some(SyncMessage::Offer {
                request_id: offered,
                endpoint,
            }) = SyncMessage::parse(delivery.payload())
            {
                if offered == request_id {
                    return Ok(endpoint);
                }
            }
        }
        Err(Error::bus("sync exchange closed before a snapshot was offered"))
    })
    .await
    .map_err(|_| Error::bus(format!("no snapshot offer within {wait:?}")))??;
    drop(offers);

    debug!(%endpoint, "downloading snapshot");
    let snapshot = timeout(wait, async {
        let mut stream = TcpStream::connect(&endpoint).await?;
        let len = stream.read_u64().await?;
        if len > MAX_SNAPSHOT_SIZE {
            return Err(Error::Serialization(format!(
                "snapshot of {len} bytes exceeds the {MAX_SNAPSHOT_SIZE} byte limit"
            )));
        }
        let buf = read_frame(&mut stream, len).await?;
        IndexSnapshot::from_bytes(&buf)
    })
    .await
    .map_err(|_| Error::bus(format!("snapshot download from {endpoint} timed out")))??;

    info!(
        %endpoint,
        files = snapshot.file_count(),
        schema_version = snapshot.schema_version,
        "snapshot received"
    );
    Ok(snapshot)
}
