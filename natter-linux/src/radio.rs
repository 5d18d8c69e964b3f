//! Radio abstraction: the scan primitive and stream sockets the service drives.
//!
//! `LanRadio` stands in for the short-range radio on a LAN: UDP multicast adverts for
//! discovery, TCP streams with a service handshake for links.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use natter_core::{LinkError, PeerAddress, Sighting};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::{discovery, transport};

const INBOUND_QUEUE: usize = 8;
const LISTEN_BACKOFF: Duration = Duration::from_millis(200);

/// Byte stream of one established link.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

pub type Link = Box<dyn LinkStream>;

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Fail fast with `PermissionOrRadio` when the radio is off or access is denied.
    async fn ensure_ready(&self) -> Result<(), LinkError>;

    /// Push sightings into `sightings` until cancelled. The caller bounds the duration and
    /// cancels by dropping the future.
    async fn scan(&self, sightings: mpsc::Sender<Sighting>) -> Result<(), LinkError>;

    /// Open an outgoing link to `peer`'s service.
    async fn connect(&self, peer: &PeerAddress) -> Result<Link, LinkError>;

    /// Wait for the next inbound link; returns the remote address it identified itself with.
    async fn accept(&self) -> Result<(PeerAddress, Link), LinkError>;
}

/// Who we are on the air.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub address: PeerAddress,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct LanSettings {
    pub discovery_port: u16,
    pub link_port: u16,
    pub static_peers: HashMap<PeerAddress, SocketAddr>,
}

pub struct LanRadio {
    identity: LocalIdentity,
    settings: LanSettings,
    link_port: u16,
    /// Inbound sockets that completed the handshake.
    inbound: Mutex<mpsc::Receiver<(PeerAddress, TcpStream)>>,
    /// Link endpoints learned from adverts, plus static peers.
    known: Arc<Mutex<HashMap<PeerAddress, SocketAddr>>>,
    advertiser: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl LanRadio {
    /// Bind the link listener and start advertising. Must run inside a tokio runtime.
    pub async fn bind(identity: LocalIdentity, settings: LanSettings) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", settings.link_port)).await?;
        let link_port = listener.local_addr()?.port();
        let known = Arc::new(Mutex::new(settings.static_peers.clone()));
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let listener = tokio::spawn(listen_loop(
            listener,
            identity.address.clone(),
            inbound_tx,
        ));
        let advertiser = tokio::spawn(discovery::advertise_loop(
            identity.clone(),
            settings.discovery_port,
            link_port,
        ));
        Ok(Self {
            identity,
            settings,
            link_port,
            inbound: Mutex::new(inbound),
            known,
            advertiser,
            listener,
        })
    }

    /// Port the link listener actually bound.
    pub fn link_port(&self) -> u16 {
        self.link_port
    }
}

impl Drop for LanRadio {
    fn drop(&mut self) {
        self.advertiser.abort();
        self.listener.abort();
    }
}

/// Accept sockets and run each handshake on its own task, so a caller that never says
/// hello cannot hold up anyone else.
async fn listen_loop(
    listener: TcpListener,
    own: PeerAddress,
    inbound: mpsc::Sender<(PeerAddress, TcpStream)>,
) {
    loop {
        let (mut stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Cannot accept links: {}", e);
                tokio::time::sleep(LISTEN_BACKOFF).await;
                continue;
            }
        };
        let own = own.clone();
        let inbound = inbound.clone();
        tokio::spawn(async move {
            match transport::handshake_accept(&mut stream, &own).await {
                Ok(peer) => {
                    let _ = inbound.send((peer, stream)).await;
                }
                Err(e) => log::debug!("Handshake with {} failed: {}", from, e),
            }
        });
    }
}

#[async_trait]
impl Radio for LanRadio {
    async fn ensure_ready(&self) -> Result<(), LinkError> {
        discovery::check_route(self.settings.discovery_port)
    }

    async fn scan(&self, sightings: mpsc::Sender<Sighting>) -> Result<(), LinkError> {
        discovery::scan(
            &self.identity.address,
            self.settings.discovery_port,
            &self.settings.static_peers,
            self.known.clone(),
            sightings,
        )
        .await
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Link, LinkError> {
        let addr = self.known.lock().await.get(peer).copied().ok_or_else(|| {
            LinkError::ConnectRejected(format!("no known endpoint for {}; scan first", peer))
        })?;
        let stream = transport::connect(addr, &self.identity.address, peer).await?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<(PeerAddress, Link), LinkError> {
        match self.inbound.lock().await.recv().await {
            Some((peer, stream)) => Ok((peer, Box::new(stream))),
            None => Err(LinkError::SocketIo("link listener stopped".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[tokio::test]
    async fn silent_caller_does_not_hold_up_other_links() {
        let me = PeerAddress::new("02:00:00:00:00:02");
        let caller = PeerAddress::new("02:00:00:00:00:01");
        let radio = LanRadio::bind(
            LocalIdentity {
                address: me.clone(),
                display_name: "test".into(),
            },
            LanSettings {
                discovery_port: 0,
                link_port: 0,
                static_peers: HashMap::new(),
            },
        )
        .await
        .unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, radio.link_port()));

        // connects, then never sends a hello
        let _silent = TcpStream::connect(addr).await.unwrap();
        let started = Instant::now();
        let from = caller.clone();
        let dial = tokio::spawn(async move { transport::connect(addr, &from, &me).await });

        let (peer, _link) = tokio::time::timeout(Duration::from_secs(2), radio.accept())
            .await
            .expect("inbound link held up behind the silent socket")
            .unwrap();
        assert_eq!(peer, caller);
        dial.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory radio for service tests: duplex pipes instead of sockets.

    use super::*;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;

    pub enum DialPlan {
        Fail(LinkError),
        Link(DuplexStream),
    }

    pub struct MockRadio {
        pub ready: std::sync::Mutex<Result<(), LinkError>>,
        pub sightings: std::sync::Mutex<Vec<Sighting>>,
        dials: std::sync::Mutex<HashMap<PeerAddress, VecDeque<DialPlan>>>,
        incoming: Mutex<mpsc::UnboundedReceiver<(PeerAddress, DuplexStream)>>,
        incoming_tx: mpsc::UnboundedSender<(PeerAddress, DuplexStream)>,
    }

    impl MockRadio {
        pub fn new() -> Arc<Self> {
            let (incoming_tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                ready: std::sync::Mutex::new(Ok(())),
                sightings: std::sync::Mutex::new(Vec::new()),
                dials: std::sync::Mutex::new(HashMap::new()),
                incoming: Mutex::new(rx),
                incoming_tx,
            })
        }

        /// Next `connect(peer)` returns a link; the test keeps the far end.
        pub fn expect_dial(&self, peer: &str) -> DuplexStream {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            self.plan(peer, DialPlan::Link(ours));
            theirs
        }

        pub fn expect_dial_failure(&self, peer: &str, err: LinkError) {
            self.plan(peer, DialPlan::Fail(err));
        }

        /// Simulate `peer` connecting to us; the test keeps the far end.
        pub fn inject_incoming(&self, peer: &str) -> DuplexStream {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let _ = self.incoming_tx.send((PeerAddress::new(peer), ours));
            theirs
        }

        fn plan(&self, peer: &str, plan: DialPlan) {
            self.dials
                .lock()
                .unwrap()
                .entry(PeerAddress::new(peer))
                .or_default()
                .push_back(plan);
        }
    }

    #[async_trait]
    impl Radio for MockRadio {
        async fn ensure_ready(&self) -> Result<(), LinkError> {
            self.ready.lock().unwrap().clone()
        }

        async fn scan(&self, tx: mpsc::Sender<Sighting>) -> Result<(), LinkError> {
            let sightings = self.sightings.lock().unwrap().clone();
            for s in sightings {
                if tx.send(s).await.is_err() {
                    return Ok(());
                }
            }
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn connect(&self, peer: &PeerAddress) -> Result<Link, LinkError> {
            let plan = self
                .dials
                .lock()
                .unwrap()
                .get_mut(peer)
                .and_then(|q| q.pop_front());
            match plan {
                Some(DialPlan::Link(stream)) => Ok(Box::new(stream)),
                Some(DialPlan::Fail(e)) => Err(e),
                None => Err(LinkError::ConnectRejected("no such peer".into())),
            }
        }

        async fn accept(&self) -> Result<(PeerAddress, Link), LinkError> {
            match self.incoming.lock().await.recv().await {
                Some((peer, stream)) => Ok((peer, Box::new(stream))),
                None => std::future::pending().await,
            }
        }
    }
}
