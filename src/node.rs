//! Node roles over the peer communicator: a client which dials out to one address, and a server
//! which accepts inbound connections and keeps the live set of connected peers.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::message::Message;
use crate::peer::{MessageHandler, PeerCommunicator, TransportError};

/// A node which actively connects to one `address:port` and exposes the resulting connection.
pub struct NodeClient {
    peer: Arc<PeerCommunicator>,
}

impl NodeClient {
    pub fn connect(
        address: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TransportError> {
        let socket = TcpStream::connect(address)?;
        socket.set_nodelay(true)?;
        let peer = PeerCommunicator::start(socket, handler)?;
        info!("connected to {}", address);
        Ok(NodeClient { peer })
    }

    pub fn peer(&self) -> &Arc<PeerCommunicator> {
        &self.peer
    }

    pub fn address(&self) -> SocketAddr {
        self.peer.address()
    }

    pub fn dispatch(&self, message: &Message) -> Result<(), TransportError> {
        self.peer.dispatch(message)
    }

    pub fn shutdown(&self) {
        self.peer.shutdown()
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, Arc<PeerCommunicator>>>>;

/// A node which listens for inbound connections. Accepting and per-peer receive loops run on
/// independent threads; the connected-peer registry is the single synchronized source of truth
/// for who is currently attached.
pub struct NodeServer {
    local_address: SocketAddr,
    peers: PeerMap,
    closed: Arc<AtomicBool>,
}

impl NodeServer {
    /// Binds `0.0.0.0:port` (use port 0 for an ephemeral port) and starts accepting.
    pub fn bind(port: u16, handler: Arc<dyn MessageHandler>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let local_address = listener.local_addr()?;
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let accept_peers = peers.clone();
        let accept_closed = closed.clone();
        thread::Builder::new()
            .name(format!("node-accept-{}", local_address.port()))
            .spawn(move || {
                accept_loop(listener, handler, accept_peers, accept_closed);
            })
            .map_err(TransportError::Io)?;

        info!("listening on {}", local_address);
        Ok(NodeServer { local_address, peers, closed })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn port(&self) -> u16 {
        self.local_address.port()
    }

    /// The addresses of every currently connected peer.
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().expect("peer registry lock poisoned").keys().cloned().collect()
    }

    /// Dispatches the same message to every currently connected peer. A failing peer is logged
    /// and does not stop delivery to the others.
    pub fn broadcast(&self, message: &Message) {
        let peers: Vec<Arc<PeerCommunicator>> = {
            let registry = self.peers.lock().expect("peer registry lock poisoned");
            registry.values().cloned().collect()
        };
        for peer in peers {
            if let Err(err) = peer.dispatch(message) {
                warn!("broadcast to {} failed: {}", peer.address(), err);
            }
        }
    }

    /// Stops accepting and closes every peer connection.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept call so the loop observes the flag.
        let wake = SocketAddr::from(([127, 0, 0, 1], self.local_address.port()));
        let _ = TcpStream::connect(wake);

        let peers: Vec<Arc<PeerCommunicator>> = {
            let mut registry = self.peers.lock().expect("peer registry lock poisoned");
            registry.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.shutdown();
        }
        info!("server on {} shut down", self.local_address);
    }
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    peers: PeerMap,
    closed: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(socket) => {
                if let Err(err) = socket.set_nodelay(true) {
                    warn!("could not configure inbound socket: {}", err);
                }
                let registered = Arc::new(RegisteredPeer {
                    inner: handler.clone(),
                    peers: peers.clone(),
                });
                match PeerCommunicator::start(socket, registered) {
                    Ok(peer) => {
                        info!("peer {} connected", peer.address());
                        let address = peer.address();
                        let mut registry = peers.lock().expect("peer registry lock poisoned");
                        registry.insert(address, peer.clone());
                        // The receive loop starts before this insert lands. A peer that
                        // disconnected in that window already ran its removal against an
                        // empty slot, so the entry must not outlive the connection.
                        if peer.is_closed() {
                            registry.remove(&address);
                        }
                    }
                    Err(err) => warn!("could not start inbound connection: {}", err),
                }
            }
            Err(err) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("accept failed: {}", err);
            }
        }
    }
}

/// Wraps the application handler so a closing connection removes itself from the registry
/// before the application is told about it.
struct RegisteredPeer {
    inner: Arc<dyn MessageHandler>,
    peers: PeerMap,
}

impl MessageHandler for RegisteredPeer {
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>) {
        self.inner.handle(message, sender);
    }

    fn connection_closed(&self, peer: &Arc<PeerCommunicator>) {
        let removed = self
            .peers
            .lock()
            .expect("peer registry lock poisoned")
            .remove(&peer.address())
            .is_some();
        if removed {
            info!("peer {} disconnected", peer.address());
        }
        self.inner.connection_closed(peer);
    }

    fn connection_failed(&self, peer: &Arc<PeerCommunicator>, error: &TransportError) {
        self.inner.connection_failed(peer, error);
    }
}
