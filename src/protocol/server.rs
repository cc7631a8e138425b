use std::{
    env, fs, io,
    net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
    path::PathBuf,
    process,
    sync::Arc,
    thread,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::engine::ScratchSpace;

use super::{ConnectionGuard, ConnectionHandler, Disconnect, SharedState};

/// Sent in place of a frame to clients that do not speak the protocol.
pub const DEFAULT_FALLBACK: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/plain\r\n\
Content-Length: 20\r\n\
Connection: close\r\n\
\r\n\
not a visage client\n";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },
    #[error("cannot create the scratch directory \"{}\": {source}", .path.display())]
    ScratchDir { path: PathBuf, source: io::Error },
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Most sockets served at once; zero for no limit.
    pub max_connections: usize,
    /// Largest accepted image in bytes; zero for no limit.
    pub max_size: u32,
    /// Parent of every connection's scratch directory.
    pub scratch_dir: PathBuf,
    /// Bytes written to a client whose first frame has a bad prefix.
    pub fallback: Vec<u8>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            max_connections: 0,
            max_size: 0,
            scratch_dir: env::temp_dir().join(format!("visage-{}", process::id())),
            fallback: DEFAULT_FALLBACK.to_vec(),
        }
    }
}

/// Accepts connections and serves each one on its own thread.
pub struct ImageServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    state: Arc<SharedState>,
}

impl ImageServer {
    pub fn bind(config: ServerConfig, state: SharedState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.address).map_err(|source| ServerError::Bind {
            address: config.address,
            source,
        })?;
        fs::create_dir_all(&config.scratch_dir).map_err(|source| ServerError::ScratchDir {
            path: config.scratch_dir.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections forever. Handlers are never joined; the loop only
    /// waits when the connection limit has been reached.
    pub fn listen(self) -> Result<(), ServerError> {
        info!("listening at {}", self.local_addr()?);

        loop {
            self.state.wait_for_vacancy(self.config.max_connections);

            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let guard = self.state.open_socket();
        let config = Arc::clone(&self.config);

        // On failure the closure, and with it the guard, is dropped, which
        // releases the socket count.
        let spawned = thread::Builder::new()
            .name(format!("conn-{peer}"))
            .spawn(move || handle_connection(stream, peer, guard, config));

        if let Err(e) = spawned {
            warn!("failed to start handler for {peer}: {e}");
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut guard: ConnectionGuard,
    config: Arc<ServerConfig>,
) {
    let id = guard.start_thread();
    info!("connection {id} from {peer}");

    match ScratchSpace::create(&config.scratch_dir, id) {
        Ok(scratch) => {
            let state = Arc::clone(guard.state());
            let handler = ConnectionHandler::new(&stream, state, config, scratch);

            match handler.serve() {
                reason @ (Disconnect::Closed | Disconnect::NonProtocol) => {
                    info!("connection {id} closed: {reason}")
                }
                reason => warn!("connection {id} ended: {reason}"),
            }
        }
        Err(e) => warn!("connection {id} has no scratch space: {e}"),
    }

    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("connection {id} already shut down: {e}");
    }
    drop(stream);
    drop(guard);
}
