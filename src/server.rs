use std::{
    error, fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
};

use crate::{
    nat::Nat,
    obfuscation::{DelayWindow, HandshakeAction, ObfuscationError, WeightedSelector},
    tun::{TunError, TunPool},
    tunnel::{SessionRegistry, TunnelId, TunnelSession},
};

pub struct Config {
    pub listen_addr: SocketAddr,
    pub public_ipv4: Ipv4Addr,
    pub public_ipv6: Option<Ipv6Addr>,
    pub max_tunnels: usize,
    pub cover_delays: DelayWindow,
    pub nat_idle_timeout: Option<Duration>,
}

pub struct Server {
    config: Config,
    nat: Arc<Nat>,
    pool: Arc<TunPool>,
    registry: Arc<SessionRegistry>,
    handshake_actions: Arc<WeightedSelector<HandshakeAction>>,
    next_tunnel_id: Arc<AtomicU64>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, ServerError> {
        let nat = Arc::new(Nat::new(config.public_ipv4, config.public_ipv6));
        let pool = Arc::new(TunPool::new(config.max_tunnels));
        let handshake_actions = Arc::new(HandshakeAction::selector()?);
        Ok(Server {
            config,
            nat,
            pool,
            registry: Arc::new(SessionRegistry::new()),
            handshake_actions,
            next_tunnel_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Accepts connections until interrupted. Every connection gets its
    /// own task; the listener itself never blocks on a session.
    pub fn run(self) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_accept_loop())
    }

    async fn run_accept_loop(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            "Started server on {}, public addresses {}{}",
            self.config.listen_addr,
            self.config.public_ipv4,
            match self.config.public_ipv6 {
                Some(addr) => format!(", {}", addr),
                None => String::new(),
            }
        );

        let sweeper = self.config.nat_idle_timeout.map(|timeout| {
            let nat = self.nat.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(timeout).await;
                    let evicted = nat.evict_idle(timeout);
                    if evicted > 0 {
                        debug!("Evicted {} idle connections", evicted);
                    }
                }
            })
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let nat = self.nat.clone();
                            let pool = self.pool.clone();
                            let registry = self.registry.clone();
                            let handshake_actions = self.handshake_actions.clone();
                            let next_tunnel_id = self.next_tunnel_id.clone();
                            let cover_delays = self.config.cover_delays;
                            tokio::spawn(async move {
                                handle_connection(
                                    stream,
                                    peer_addr,
                                    nat,
                                    pool,
                                    registry,
                                    handshake_actions,
                                    next_tunnel_id,
                                    cover_delays,
                                )
                                .await;
                            });
                        }
                        Err(err) => warn!("Failed to accept connection: {}", err),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break;
                }
            }
        }
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    nat: Arc<Nat>,
    pool: Arc<TunPool>,
    registry: Arc<SessionRegistry>,
    handshake_actions: Arc<WeightedSelector<HandshakeAction>>,
    next_tunnel_id: Arc<AtomicU64>,
    cover_delays: DelayWindow,
) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => {
            debug!("WebSocket handshake with {} failed: {}", peer_addr, err);
            return;
        }
    };
    let device = match pool.allocate() {
        Ok(device) => device,
        Err(TunError::PoolExhausted) => {
            info!("Turned away {}: no available TUN interfaces", peer_addr);
            let close_frame = CloseFrame {
                code: CloseCode::Again,
                reason: "No available TUN interfaces".into(),
            };
            if let Err(err) = ws_stream.close(Some(close_frame)).await {
                debug!("Failed to close channel to {}: {}", peer_addr, err);
            }
            return;
        }
        Err(err) => {
            warn!("Failed to open TUN interface for {}: {}", peer_addr, err);
            if let Err(err) = ws_stream.close(None).await {
                debug!("Failed to close channel to {}: {}", peer_addr, err);
            }
            return;
        }
    };
    let tunnel_id = TunnelId::new(next_tunnel_id.fetch_add(1, Ordering::Relaxed));
    let session = TunnelSession::new(
        tunnel_id,
        device,
        nat,
        registry,
        pool,
        cover_delays,
        handshake_actions,
    );
    session.run(ws_stream).await;
}

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Obfuscation(ObfuscationError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Obfuscation(e) => write!(f, "Obfuscation error: {}", e),
        }
    }
}

impl error::Error for ServerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Obfuscation(err) => Some(err),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> ServerError {
        Self::Io(err)
    }
}

impl From<ObfuscationError> for ServerError {
    fn from(err: ObfuscationError) -> ServerError {
        Self::Obfuscation(err)
    }
}
