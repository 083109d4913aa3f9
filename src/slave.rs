//! The slave node: binds a shuffle server for its peers, dials the master, announces itself
//! and hands every inbound message to the phase driver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::message::{codes, Message};
use crate::node::{NodeClient, NodeServer};
use crate::peer::{MessageHandler, PeerCommunicator, TransportError};
use crate::phase::{PhaseKind, SlaveDriver};
use crate::storage::SlaveStorage;
use crate::task::{Mapper, Reducer, TaskParameters, TaskValue};

/// A running slave. Dropping it does not stop it; call [`SlaveNode::shutdown`].
pub struct SlaveNode<V: TaskValue> {
    server: NodeServer,
    master: NodeClient,
    driver: Arc<SlaveDriver<V>>,
    shuffle_address: SocketAddr,
}

impl<V: TaskValue> SlaveNode<V> {
    /// Brings a slave online: binds the shuffle server on `listen_port` (0 for an ephemeral
    /// port), connects to the master, announces the shuffle address and starts the phase
    /// machine in Setup.
    pub fn start(
        master_address: SocketAddr,
        listen_port: u16,
        mapper: Arc<dyn Mapper<V>>,
        reducer: Arc<dyn Reducer<V>>,
        storage: Arc<dyn SlaveStorage<V>>,
    ) -> Result<Self, TransportError> {
        // The driver needs the live master connection, and the connection needs a handler.
        // The relay breaks the cycle, holding messages back until the driver exists.
        let relay = Arc::new(RelayHandler::new());
        let server = NodeServer::bind(listen_port, relay.clone())?;
        let master = NodeClient::connect(master_address, relay.clone())?;

        // The address peers can reach this slave's shuffle server on. The IP the master link
        // was routed over is the one other nodes in the cluster can route to as well.
        let shuffle_address =
            SocketAddr::new(master.peer().local_address().ip(), server.port());
        master.dispatch(&Message::with_data(codes::SLAVE_CONNECTED, &shuffle_address)?)?;

        let parameters = TaskParameters {
            mapper,
            reducer,
            storage,
            master: master.peer().clone(),
        };
        let driver = SlaveDriver::start(parameters);
        relay.install(driver.clone());

        info!("slave up; shuffle address {}", shuffle_address);
        Ok(SlaveNode { server, master, driver, shuffle_address })
    }

    /// The address this slave serves shuffle requests on, as announced to the master.
    pub fn shuffle_address(&self) -> SocketAddr {
        self.shuffle_address
    }

    pub fn current_phase(&self) -> PhaseKind {
        self.driver.current_phase()
    }

    /// Disconnects from the master and stops serving peers.
    pub fn shutdown(&self) {
        self.master.shutdown();
        self.server.shutdown();
    }
}

struct RelayState {
    handler: Option<Arc<dyn MessageHandler>>,
    pending: Vec<(Message, Arc<PeerCommunicator>)>,
}

/// Queues messages received before the phase driver is installed and replays them, in arrival
/// order, once it is.
struct RelayHandler {
    state: Mutex<RelayState>,
}

impl RelayHandler {
    fn new() -> Self {
        RelayHandler {
            state: Mutex::new(RelayState { handler: None, pending: Vec::new() }),
        }
    }

    /// Replays while still holding the state lock: a message arriving concurrently blocks in
    /// `handle` until the queue has drained, so installation never reorders a connection's
    /// messages.
    fn install(&self, handler: Arc<dyn MessageHandler>) {
        let mut state = self.state.lock().expect("relay lock poisoned");
        state.handler = Some(handler.clone());
        for (message, sender) in state.pending.drain(..) {
            handler.handle(message, &sender);
        }
    }

    fn installed(&self) -> Option<Arc<dyn MessageHandler>> {
        self.state.lock().expect("relay lock poisoned").handler.clone()
    }
}

impl MessageHandler for RelayHandler {
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>) {
        let handler = {
            let mut state = self.state.lock().expect("relay lock poisoned");
            match &state.handler {
                Some(handler) => handler.clone(),
                None => {
                    state.pending.push((message, sender.clone()));
                    return;
                }
            }
        };
        handler.handle(message, sender);
    }

    fn connection_closed(&self, peer: &Arc<PeerCommunicator>) {
        if let Some(handler) = self.installed() {
            handler.connection_closed(peer);
        }
    }

    fn connection_failed(&self, peer: &Arc<PeerCommunicator>, error: &TransportError) {
        if let Some(handler) = self.installed() {
            handler.connection_failed(peer, error);
        } else {
            error!("transport fault on {} before startup finished: {}", peer.address(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    struct Sink;

    impl MessageHandler for Sink {
        fn handle(&self, _message: Message, _sender: &Arc<PeerCommunicator>) {}
    }

    struct Recorder {
        seen: Mutex<Vec<i32>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: Message, _sender: &Arc<PeerCommunicator>) {
            self.seen.lock().unwrap().push(message.code());
        }
    }

    fn local_peer() -> (Arc<PeerCommunicator>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let outbound = TcpStream::connect(address).unwrap();
        let (inbound, _) = listener.accept().unwrap();
        let peer = PeerCommunicator::start(outbound, Arc::new(Sink)).unwrap();
        (peer, inbound)
    }

    #[test]
    fn relay_replays_queued_messages_in_arrival_order() {
        let (peer, _remote) = local_peer();
        let relay = RelayHandler::new();

        relay.handle(Message::new(codes::SETTING_UP), &peer);
        relay.handle(Message::new(codes::MAP_CHUNK), &peer);

        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        relay.install(recorder.clone());
        relay.handle(Message::new(codes::END_MAP), &peer);

        assert_eq!(
            vec![codes::SETTING_UP, codes::MAP_CHUNK, codes::END_MAP],
            *recorder.seen.lock().unwrap()
        );
    }

    #[test]
    fn relay_without_a_handler_queues_silently() {
        let (peer, _remote) = local_peer();
        let relay = RelayHandler::new();
        relay.handle(Message::new(codes::IDLE), &peer);
        assert!(relay.installed().is_none());
    }
}
