//! The master node: registers slaves, drives one task at a time through its stages and
//! collects the reduced results.
//!
//! The task lifecycle, observed through slave messages only:
//!
//! ```text
//! Waiting --run_task--> Mapping --all chunks mapped--> Syncing --all slaves idle--> Reducing
//!         <--all result streams ended-- Done
//! ```
//!
//! Chunk distribution is demand-driven: an idle notice is the only signal a slave has spare
//! capacity, and every idle notice during the map stage hands out at most one chunk. The
//! Syncing stage exists because key discovery is asynchronous: a slave's key reports are
//! ordered before its post-map idle on the same connection, so once every slave has idled
//! after the end-of-map broadcast the key set is complete and can be partitioned.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::data::Datum;
use crate::message::{codes, Message};
use crate::node::NodeServer;
use crate::peer::{MessageHandler, PeerCommunicator, TransportError};
use crate::task::TaskValue;

/// One unit of map input, handed to exactly one slave.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text(String),
    File(PathBuf),
}

impl Chunk {
    fn into_message(self) -> Result<Message, bincode::Error> {
        match self {
            Chunk::Text(text) => Message::with_data(codes::MAP_CHUNK, &text),
            Chunk::File(path) => Ok(Message::with_file(codes::MAP_CHUNK, path)),
        }
    }
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error("could not encode a task message")]
    Codec(#[from] bincode::Error),
    #[error("no slave is connected")]
    NoSlaves,
    #[error("a task is already running")]
    TaskInProgress,
    #[error("task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Waiting,
    Mapping,
    Syncing,
    Reducing,
    Done,
}

struct SlaveLink {
    peer: Arc<PeerCommunicator>,
    shuffle_address: SocketAddr,
    outstanding: usize,
}

struct MasterState<V> {
    stage: Stage,
    slaves: HashMap<SocketAddr, SlaveLink>,
    chunks: VecDeque<Message>,
    keys: BTreeSet<String>,
    ready: HashSet<SocketAddr>,
    finished: HashSet<SocketAddr>,
    results: Vec<Datum<V>>,
    failure: Option<String>,
}

struct MasterCore<V: TaskValue> {
    state: Mutex<MasterState<V>>,
    changed: Condvar,
    clients: Option<Arc<NodeServer>>,
}

/// A running master. One task runs at a time; [`MasterNode::run_task`] blocks its caller until
/// the task completes or fails.
pub struct MasterNode<V: TaskValue> {
    server: NodeServer,
    core: Arc<MasterCore<V>>,
}

impl<V: TaskValue> MasterNode<V> {
    /// Binds the slave-facing server on `port` and, when `client_port` is given, a second
    /// server on which connected clients receive progress notices and the final result.
    pub fn start(port: u16, client_port: Option<u16>) -> Result<Self, TransportError> {
        let clients = match client_port {
            Some(port) => Some(Arc::new(NodeServer::bind(port, Arc::new(ClientHandler))?)),
            None => None,
        };

        let core = Arc::new(MasterCore {
            state: Mutex::new(MasterState {
                stage: Stage::Waiting,
                slaves: HashMap::new(),
                chunks: VecDeque::new(),
                keys: BTreeSet::new(),
                ready: HashSet::new(),
                finished: HashSet::new(),
                results: Vec::new(),
                failure: None,
            }),
            changed: Condvar::new(),
            clients,
        });

        let handler = Arc::new(MasterHandler { core: core.clone() });
        let server = NodeServer::bind(port, handler)?;
        info!("master up on {}", server.local_address());
        Ok(MasterNode { server, core })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.server.local_address()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// The number of currently registered slaves.
    pub fn slave_count(&self) -> usize {
        self.core.state.lock().expect("master state lock poisoned").slaves.len()
    }

    /// Blocks until at least `count` slaves have registered.
    pub fn wait_for_slaves(&self, count: usize) {
        let mut state = self.core.state.lock().expect("master state lock poisoned");
        while state.slaves.len() < count {
            state = self.core.changed.wait(state).expect("master state lock poisoned");
        }
    }

    /// Runs one task over the given chunks and blocks until every registered slave has closed
    /// its result stream. Returns the reduced pairs, one per distinct key.
    pub fn run_task(&self, chunks: Vec<Chunk>) -> Result<Vec<Datum<V>>, MasterError> {
        let encoded = chunks
            .into_iter()
            .map(Chunk::into_message)
            .collect::<Result<VecDeque<_>, _>>()?;

        let peers: Vec<Arc<PeerCommunicator>> = {
            let mut state = self.core.state.lock().expect("master state lock poisoned");
            if state.stage != Stage::Waiting {
                return Err(MasterError::TaskInProgress);
            }
            if state.slaves.is_empty() {
                return Err(MasterError::NoSlaves);
            }
            state.chunks = encoded;
            state.keys.clear();
            state.ready.clear();
            state.finished.clear();
            state.results.clear();
            state.failure = None;
            state.stage = Stage::Mapping;
            state.slaves.values().map(|link| link.peer.clone()).collect()
        };

        info!("task started across {} slaves", peers.len());
        self.core.notify_clients(&Message::new(codes::MAPPING));
        for peer in peers {
            if let Err(err) = peer.dispatch(&Message::new(codes::SETTING_UP)) {
                warn!("could not announce the task to {}: {}", peer.address(), err);
            }
        }

        let mut state = self.core.state.lock().expect("master state lock poisoned");
        while state.stage != Stage::Done {
            state = self.core.changed.wait(state).expect("master state lock poisoned");
        }
        state.stage = Stage::Waiting;
        match state.failure.take() {
            Some(report) => Err(MasterError::TaskFailed(report)),
            None => Ok(std::mem::take(&mut state.results)),
        }
    }

    /// Stops both servers and disconnects every slave and client.
    pub fn shutdown(&self) {
        self.server.shutdown();
        if let Some(clients) = &self.core.clients {
            clients.shutdown();
        }
    }
}

impl<V: TaskValue> MasterCore<V> {
    fn notify_clients(&self, message: &Message) {
        if let Some(clients) = &self.clients {
            clients.broadcast(message);
        }
    }

    fn register_slave(&self, peer: &Arc<PeerCommunicator>, shuffle_address: SocketAddr) {
        {
            let mut state = self.state.lock().expect("master state lock poisoned");
            // Joining mid-task would hand map chunks to a slave still in setup. The slave can
            // reconnect once the running task is over.
            if state.stage != Stage::Waiting {
                warn!(
                    "slave {} tried to join while a task is running; ignoring it",
                    peer.address()
                );
                return;
            }
            info!("slave {} registered; shuffle address {}", peer.address(), shuffle_address);
            state.slaves.insert(
                peer.address(),
                SlaveLink { peer: peer.clone(), shuffle_address, outstanding: 0 },
            );
            self.changed.notify_all();
        }
        if let Ok(notice) = Message::with_data(codes::SLAVE_CONNECTED, &shuffle_address) {
            self.notify_clients(&notice);
        }
    }

    fn deregister_slave(&self, address: SocketAddr) {
        let shuffle_address = {
            let mut state = self.state.lock().expect("master state lock poisoned");
            let link = match state.slaves.remove(&address) {
                Some(link) => link,
                None => return,
            };
            state.ready.remove(&address);
            state.finished.remove(&address);
            if state.stage != Stage::Waiting && state.stage != Stage::Done {
                // Mapped data and key ownership died with the slave. Fail the task rather
                // than deliver a silently incomplete result.
                error!("slave {} lost mid-task", address);
                state.failure = Some(format!("slave {} was lost mid-task", address));
                self.complete(&mut state);
            } else {
                info!("slave {} deregistered", address);
            }
            self.changed.notify_all();
            link.shuffle_address
        };
        if let Ok(notice) = Message::with_data(codes::SLAVE_DISCONNECTED, &shuffle_address) {
            self.notify_clients(&notice);
        }
    }

    fn on_idle(&self, sender: &Arc<PeerCommunicator>) {
        let mut state = self.state.lock().expect("master state lock poisoned");
        match state.stage {
            Stage::Mapping => {
                let address = sender.address();
                let chunk = state.chunks.pop_front();
                let link = match state.slaves.get_mut(&address) {
                    Some(link) => link,
                    None => {
                        warn!("idle notice from unregistered peer {}", address);
                        if let Some(chunk) = chunk {
                            state.chunks.push_front(chunk);
                        }
                        return;
                    }
                };
                if link.outstanding > 0 {
                    link.outstanding -= 1;
                }
                match chunk {
                    Some(chunk) => {
                        link.outstanding += 1;
                        if let Err(err) = link.peer.dispatch(&chunk) {
                            error!("could not hand a chunk to {}: {}", address, err);
                        }
                    }
                    None => {
                        if state.slaves.values().all(|link| link.outstanding == 0) {
                            info!("every chunk is mapped; synchronizing {} slaves", state.slaves.len());
                            state.stage = Stage::Syncing;
                            for link in state.slaves.values() {
                                if let Err(err) = link.peer.dispatch(&Message::new(codes::END_MAP)) {
                                    warn!("could not end the map stage on {}: {}", link.peer.address(), err);
                                }
                            }
                        }
                    }
                }
            }
            Stage::Syncing => {
                state.ready.insert(sender.address());
                if state.ready.len() == state.slaves.len() {
                    self.begin_reduce(&mut state);
                }
            }
            // Idle notices outside an active stage carry no work to hand out.
            Stage::Waiting | Stage::Reducing | Stage::Done => {
                debug!("idle notice from {} ignored in {:?}", sender.address(), state.stage)
            }
        }
    }

    /// Partitions the discovered keys round-robin over the slaves, in a deterministic order,
    /// and starts the shuffle everywhere.
    fn begin_reduce(&self, state: &mut MasterState<V>) {
        state.stage = Stage::Reducing;
        let mut links: Vec<&SlaveLink> = state.slaves.values().collect();
        links.sort_by_key(|link| link.shuffle_address);

        let addresses: Vec<SocketAddr> = links.iter().map(|link| link.shuffle_address).collect();
        info!("reducing {} keys over {:?}", state.keys.len(), addresses);

        let mut assignments: Vec<Vec<String>> = vec![Vec::new(); links.len()];
        for (index, key) in state.keys.iter().enumerate() {
            assignments[index % links.len()].push(key.clone());
        }

        match Message::with_data(codes::LOAD_SLAVE_ADDRESSES, &addresses) {
            Ok(message) => {
                for link in &links {
                    if let Err(err) = link.peer.dispatch(&message) {
                        warn!("could not load addresses on {}: {}", link.peer.address(), err);
                    }
                }
            }
            Err(err) => error!("could not encode the slave address list: {}", err),
        }
        for (link, keys) in links.iter().zip(assignments) {
            match Message::with_data(codes::REDUCE_KEYS, &keys) {
                Ok(message) => {
                    if let Err(err) = link.peer.dispatch(&message) {
                        warn!("could not assign keys to {}: {}", link.peer.address(), err);
                    }
                }
                Err(err) => error!("could not encode a key assignment: {}", err),
            }
        }
        self.notify_clients(&Message::new(codes::REDUCING));
    }

    fn on_key_found(&self, key: String) {
        let mut state = self.state.lock().expect("master state lock poisoned");
        match state.stage {
            Stage::Mapping | Stage::Syncing => {
                state.keys.insert(key);
            }
            stage => warn!("key report {:?} outside the map stage ({:?})", key, stage),
        }
    }

    fn on_result(&self, datum: Datum<V>) {
        let mut state = self.state.lock().expect("master state lock poisoned");
        state.results.push(datum);
    }

    fn on_failure(&self, report: String) {
        error!("a slave reported a task failure: {}", report);
        let mut state = self.state.lock().expect("master state lock poisoned");
        state.failure.get_or_insert(report);
    }

    fn on_stream_end(&self, sender: &Arc<PeerCommunicator>) {
        let mut state = self.state.lock().expect("master state lock poisoned");
        if state.stage != Stage::Reducing {
            warn!("result stream end from {} outside the reduce stage", sender.address());
            return;
        }
        state.finished.insert(sender.address());
        if state.finished.len() == state.slaves.len() {
            self.complete(&mut state);
        }
    }

    /// Closes out the running task: publishes the outcome to any connected clients and wakes
    /// the caller blocked in `run_task`.
    fn complete(&self, state: &mut MasterState<V>) {
        state.stage = Stage::Done;
        match &state.failure {
            Some(report) => {
                if let Ok(notice) = Message::with_data(codes::FAILURE, report) {
                    self.notify_clients(&notice);
                }
            }
            None => {
                info!("task complete; {} result pairs", state.results.len());
                if self.clients.is_some() {
                    match write_result_file(&state.results) {
                        Ok(path) => {
                            self.notify_clients(&Message::with_file(codes::SEND_RESULT, &path));
                            let _ = fs::remove_file(&path);
                        }
                        Err(err) => error!("could not materialize the result file: {}", err),
                    }
                }
            }
        }
        self.changed.notify_all();
    }
}

/// Serializes the result pairs into a fresh file, ready to stream to clients.
fn write_result_file<V: TaskValue>(results: &[Datum<V>]) -> Result<PathBuf, MasterError> {
    let path = std::env::temp_dir().join(format!("map-reduce-result-{}", Uuid::new_v4()));
    let encoded = bincode::serialize(results)?;
    fs::write(&path, encoded).map_err(TransportError::from)?;
    Ok(path)
}

struct MasterHandler<V: TaskValue> {
    core: Arc<MasterCore<V>>,
}

impl<V: TaskValue> MessageHandler for MasterHandler<V> {
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>) {
        match message.code() {
            codes::SLAVE_CONNECTED => match message.data::<SocketAddr>() {
                Ok(address) => self.core.register_slave(sender, address),
                Err(err) => warn!("malformed slave registration: {}", err),
            },
            codes::SLAVE_DISCONNECTED => self.core.deregister_slave(sender.address()),
            codes::IDLE => self.core.on_idle(sender),
            codes::KEY_FOUND => match message.data::<String>() {
                Ok(key) => self.core.on_key_found(key),
                Err(err) => warn!("malformed key report: {}", err),
            },
            codes::RESULT_PAIR => match message.data::<Datum<V>>() {
                Ok(datum) => self.core.on_result(datum),
                Err(err) => warn!("malformed result pair: {}", err),
            },
            codes::END_OF_RESULT_STREAM => self.core.on_stream_end(sender),
            codes::FAILURE => match message.data::<String>() {
                Ok(report) => self.core.on_failure(report),
                Err(_) => self.core.on_failure("unreadable failure report".to_string()),
            },
            code => debug!("master ignoring opcode {} from {}", code, sender.address()),
        }
    }

    fn connection_closed(&self, peer: &Arc<PeerCommunicator>) {
        self.core.deregister_slave(peer.address());
    }
}

/// Clients only listen; anything they send is noted and dropped.
struct ClientHandler;

impl MessageHandler for ClientHandler {
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>) {
        debug!("ignoring opcode {} from client {}", message.code(), sender.address());
    }
}
