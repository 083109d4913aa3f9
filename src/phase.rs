//! The slave-side execution state machine: named phases consuming inbound messages and
//! emitting outbound ones, with explicit transitions driven by a single message-handling
//! context.
//!
//! A phase never constructs its successor itself. During `execute` it only *records* the next
//! phase tag; the driver afterwards takes the tag, terminates the old phase, builds the next
//! one through [`build_phase`] and initializes it before routing further messages to it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crate::map_phase::MapPhase;
use crate::message::{codes, Message};
use crate::node::NodeClient;
use crate::peer::{MessageHandler, PeerCommunicator};
use crate::reduce_phase::ReducePhase;
use crate::task::{TaskParameters, TaskValue};

/// The identity of each state of the slave state machine. The task wires a fixed graph:
/// Setup → Map → Reduce → Load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Setup,
    Map,
    Reduce,
    Load,
}

/// One state of the slave state machine.
pub trait Phase<V>: Send {
    fn kind(&self) -> PhaseKind;

    /// Binds the phase and announces readiness to the master.
    fn initialize(&mut self, parameters: &TaskParameters<V>);

    /// The sole event handler; the only place transitions are recorded.
    fn execute(&mut self, message: Message, sender: &Arc<PeerCommunicator>);

    /// Releases phase-scoped resources before the driver advances.
    fn terminate(&mut self, _parameters: &TaskParameters<V>) {}

    /// Takes the successor recorded during `execute`, if any.
    fn take_transition(&mut self) -> Option<PhaseKind>;
}

/// The state every phase carries: the master link, the recorded transition and a table of
/// outbound connections to peer slaves, opened lazily and reused for the phase's lifetime.
pub struct PhaseCore {
    next: Option<PhaseKind>,
    master: Arc<PeerCommunicator>,
    peers: HashMap<SocketAddr, NodeClient>,
    handler: Weak<dyn MessageHandler>,
}

impl PhaseCore {
    pub fn new(master: Arc<PeerCommunicator>, handler: Weak<dyn MessageHandler>) -> Self {
        PhaseCore { next: None, master, peers: HashMap::new(), handler }
    }

    pub fn master(&self) -> &Arc<PeerCommunicator> {
        &self.master
    }

    /// Records the phase to advance to once the current event is fully handled.
    pub fn advance(&mut self, kind: PhaseKind) {
        self.next = Some(kind);
    }

    pub fn take_transition(&mut self) -> Option<PhaseKind> {
        self.next.take()
    }

    pub fn dispatch_to_master(&self, message: &Message) {
        if let Err(err) = self.master.dispatch(message) {
            error!("could not reach the master: {}", err);
        }
    }

    /// Announces to the master that this slave has spare capacity.
    pub fn dispatch_idle(&self) {
        self.dispatch_to_master(&Message::new(codes::IDLE));
    }

    /// Sends a message to a peer slave, connecting first if no connection to that peer exists
    /// yet. Responses arrive on the same connection and are routed back into the driver.
    pub fn dispatch_to_slave(&mut self, address: SocketAddr, message: &Message) {
        match self.peers.entry(address) {
            Entry::Occupied(entry) => {
                if let Err(err) = entry.get().dispatch(message) {
                    error!("dispatch to slave {} failed: {}", address, err);
                }
            }
            Entry::Vacant(slot) => {
                let handler = match self.handler.upgrade() {
                    Some(handler) => handler,
                    None => {
                        warn!("phase driver is gone; dropping message to {}", address);
                        return;
                    }
                };
                match NodeClient::connect(address, handler) {
                    Ok(client) => {
                        if let Err(err) = client.dispatch(message) {
                            error!("dispatch to slave {} failed: {}", address, err);
                        }
                        slot.insert(client);
                    }
                    Err(err) => error!("could not reach slave {}: {}", address, err),
                }
            }
        }
    }

    /// Answers a peer over the connection its request arrived on.
    pub fn respond_to_peer(peer: &Arc<PeerCommunicator>, message: &Message) {
        if let Err(err) = peer.dispatch(message) {
            error!("response to {} failed: {}", peer.address(), err);
        }
    }

    /// Shuts down every outbound peer connection opened by this phase.
    pub fn close_peers(&mut self) {
        for (_, client) in self.peers.drain() {
            client.shutdown();
        }
    }
}

/// Constructs the phase named by `kind`, wired to the given parameters and driver.
pub fn build_phase<V: TaskValue>(
    kind: PhaseKind,
    parameters: &TaskParameters<V>,
    handler: Weak<dyn MessageHandler>,
) -> Box<dyn Phase<V>> {
    let core = PhaseCore::new(parameters.master.clone(), handler);
    match kind {
        PhaseKind::Setup => Box::new(SetupPhase::new(core)),
        PhaseKind::Map => Box::new(MapPhase::new(core, parameters)),
        PhaseKind::Reduce => Box::new(ReducePhase::new(core, parameters)),
        PhaseKind::Load => Box::new(LoadPhase::new(core)),
    }
}

struct DriverState<V> {
    phase: Box<dyn Phase<V>>,
    parameters: TaskParameters<V>,
    handler: Weak<dyn MessageHandler>,
}

/// The driver owns the current phase and routes every inbound message through it, on whichever
/// receive thread the message arrived. The driver lock makes phase execution the single
/// event-handling context of the slave.
pub struct SlaveDriver<V: TaskValue> {
    state: Mutex<DriverState<V>>,
}

impl<V: TaskValue> SlaveDriver<V> {
    /// Builds the driver and initializes the Setup phase, which announces the first idle.
    pub fn start(parameters: TaskParameters<V>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SlaveDriver<V>>| {
            let handler: Weak<dyn MessageHandler> = weak.clone();
            let mut phase = build_phase(PhaseKind::Setup, &parameters, handler.clone());
            phase.initialize(&parameters);
            SlaveDriver {
                state: Mutex::new(DriverState { phase, parameters, handler }),
            }
        })
    }

    pub fn current_phase(&self) -> PhaseKind {
        self.state.lock().expect("phase driver lock poisoned").phase.kind()
    }
}

impl<V: TaskValue> MessageHandler for SlaveDriver<V> {
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>) {
        let mut state = self.state.lock().expect("phase driver lock poisoned");
        let state = &mut *state;
        state.phase.execute(message, sender);

        if let Some(kind) = state.phase.take_transition() {
            info!("phase {:?} -> {:?}", state.phase.kind(), kind);
            state.phase.terminate(&state.parameters);
            let mut next = build_phase(kind, &state.parameters, state.handler.clone());
            next.initialize(&state.parameters);
            state.phase = next;
        }
    }
}

/// The initial phase: waits for the master to announce the task, then hands over to Map.
///
/// Deliberately announces no idle. An idle notice means map capacity, and a setup-time idle
/// racing a freshly started task would be miscounted as such before the slave has even seen
/// the task announcement. The map phase announces the first real idle on entry.
pub struct SetupPhase<V> {
    core: PhaseCore,
    value: PhantomData<V>,
}

impl<V> SetupPhase<V> {
    pub fn new(core: PhaseCore) -> Self {
        SetupPhase { core, value: PhantomData }
    }
}

impl<V: TaskValue> Phase<V> for SetupPhase<V> {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Setup
    }

    fn initialize(&mut self, _parameters: &TaskParameters<V>) {
        info!("setup phase ready");
    }

    fn execute(&mut self, message: Message, _sender: &Arc<PeerCommunicator>) {
        match message.code() {
            codes::SETTING_UP => {
                info!("task announced; advancing to the map phase");
                self.core.advance(PhaseKind::Map);
            }
            code => debug!("setup phase ignoring opcode {}", code),
        }
    }

    fn take_transition(&mut self) -> Option<PhaseKind> {
        self.core.take_transition()
    }
}

/// The terminal phase of a task. The slave parks here once its results have been streamed out;
/// a new task announcement moves the machine back into Map.
///
/// Unlike the other phases this one announces no idle: the end-of-result marker already told
/// the master this slave is done, and an idle sent now could be mistaken for map capacity by
/// a task started right after.
pub struct LoadPhase<V> {
    core: PhaseCore,
    value: PhantomData<V>,
}

impl<V> LoadPhase<V> {
    pub fn new(core: PhaseCore) -> Self {
        LoadPhase { core, value: PhantomData }
    }
}

impl<V: TaskValue> Phase<V> for LoadPhase<V> {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Load
    }

    fn initialize(&mut self, _parameters: &TaskParameters<V>) {
        info!("task complete; awaiting further instructions");
    }

    fn execute(&mut self, message: Message, _sender: &Arc<PeerCommunicator>) {
        match message.code() {
            codes::SETTING_UP => {
                info!("new task announced; advancing to the map phase");
                self.core.advance(PhaseKind::Map);
            }
            code => debug!("load phase ignoring opcode {}", code),
        }
    }

    fn take_transition(&mut self) -> Option<PhaseKind> {
        self.core.take_transition()
    }
}
