use portico_crypto::CryptoError;
use portico_proto::CodecError;
use portico_storage::{ImageStore, Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::dispatch;
use crate::metrics::Metrics;
use crate::registry::ClientRegistry;
use crate::session::Role;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Crypto,
    Codec,
    Config,
    Io,
    Closed,
    Timeout,
    Protocol,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Crypto => write!(f, "crypto failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Config => write!(f, "configuration failure"),
            Self::Io => write!(f, "io failure"),
            Self::Closed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Protocol => write!(f, "protocol violation"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}

impl From<CryptoError> for ServerError {
    fn from(_: CryptoError) -> Self {
        Self::Crypto
    }
}

impl From<CodecError> for ServerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(_) => Self::Io,
            _ => Self::Codec,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(_: ConfigError) -> Self {
        Self::Config
    }
}

impl From<std::io::Error> for ServerError {
    fn from(_: std::io::Error) -> Self {
        Self::Io
    }
}

/// Process-wide state shared by every connection task and worker; handed
/// around explicitly instead of through a global registry.
pub struct NodeState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub images: ImageStore,
    pub registry: ClientRegistry,
    pub metrics: Arc<Metrics>,
    /// Identity id of this server: SHA-256 of its public key.
    pub server_id: [u8; 32],
    /// Wakes the neighborhood action worker after a transactional enqueue.
    pub worker_signal: Notify,
}

pub type SharedNode = Arc<NodeState>;

impl NodeState {
    pub async fn init(config: ServerConfig) -> Result<SharedNode, ServerError> {
        let storage = Storage::connect(&config.database_path).await?;
        storage.migrate().await?;
        let images = ImageStore::new(config.image_dir.clone());
        images.ensure_dir().await?;
        let server_id = config.identity_keys.identity_id();
        Ok(Arc::new(NodeState {
            config,
            storage: Arc::new(storage),
            images,
            registry: ClientRegistry::new(),
            metrics: Arc::new(Metrics::new()),
            server_id,
            worker_signal: Notify::new(),
        }))
    }

    /// Active role endpoints with their ports.
    pub fn role_ports(&self) -> Vec<(Role, u16)> {
        vec![
            (Role::Primary, self.config.primary_port),
            (Role::ServerNeighbor, self.config.server_neighbor_port),
            (Role::ClientNonCustomer, self.config.client_non_customer_port),
            (Role::ClientCustomer, self.config.client_customer_port),
            (Role::ClientAppService, self.config.client_app_service_port),
        ]
    }
}

/// Binds one TCP listener per role endpoint and spawns its accept loop.
pub async fn run_listeners(node: &SharedNode) -> Result<Vec<JoinHandle<()>>, ServerError> {
    let mut handles = Vec::new();
    for (role, port) in node.role_ports() {
        let listener =
            TcpListener::bind((node.config.bind_address.as_str(), port)).await?;
        info!(role = ?role, port, "listening");
        let node = node.clone();
        handles.push(tokio::spawn(accept_loop(node, listener, role)));
    }
    Ok(handles)
}

async fn accept_loop(node: SharedNode, listener: TcpListener, role: Role) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if stream.set_nodelay(true).is_err() {
                    warn!(%remote, "failed to set nodelay");
                }
                let node = node.clone();
                tokio::spawn(async move {
                    dispatch::serve_connection(node, stream, role, remote).await;
                });
            }
            Err(err) => {
                error!(role = ?role, error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
