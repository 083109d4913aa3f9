//! The reduce phase: the distributed shuffle. For every key this slave owns it pulls all
//! values for that key from every peer slave, reduces them, and streams the results to the
//! master. It simultaneously serves the symmetric requests of its peers out of local storage.
//!
//! The only coordination primitive is per-key reference counting: a key's buffer closes
//! exactly when every peer has ended its value stream for that key, and the phase completes
//! exactly when the phase-wide outstanding count reaches zero.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;

use crate::data::{DataPool, Datum};
use crate::message::{codes, Message};
use crate::peer::PeerCommunicator;
use crate::phase::{Phase, PhaseCore, PhaseKind};
use crate::storage::SlaveStorage;
use crate::task::{Reducer, TaskParameters, TaskValue};

pub struct ReducePhase<V: TaskValue> {
    core: PhaseCore,
    reducer: Arc<dyn Reducer<V>>,
    storage: Arc<dyn SlaveStorage<V>>,
    slave_addresses: Vec<SocketAddr>,
    buffers: HashMap<String, Arc<DataPool<V>>>,
    results: HashMap<String, Receiver<V>>,
    requests: HashMap<String, usize>,
    total_requests: usize,
    reducers: Vec<thread::JoinHandle<()>>,
    senders: Vec<thread::JoinHandle<()>>,
    collectors: Vec<thread::JoinHandle<()>>,
}

impl<V: TaskValue> ReducePhase<V> {
    pub fn new(core: PhaseCore, parameters: &TaskParameters<V>) -> Self {
        ReducePhase {
            core,
            reducer: parameters.reducer.clone(),
            storage: parameters.storage.clone(),
            slave_addresses: Vec::new(),
            buffers: HashMap::new(),
            results: HashMap::new(),
            requests: HashMap::new(),
            total_requests: 0,
            reducers: Vec::new(),
            senders: Vec::new(),
            collectors: Vec::new(),
        }
    }

    /// Kicks off the shuffle: for every owned key, allocate its buffer, fan a value request
    /// out to every peer, and start the reduce task consuming the still-growing buffer.
    fn start_reduce(&mut self, keys: Vec<String>) {
        if self.slave_addresses.is_empty() && !keys.is_empty() {
            error!("reduce keys arrived before any slave addresses; dropping them");
            return;
        }
        info!(
            "reducing {} keys against {} slaves",
            keys.len(),
            self.slave_addresses.len()
        );
        for key in keys {
            let buffer = Arc::new(DataPool::new());
            self.buffers.insert(key.clone(), buffer.clone());
            self.request_values(&key);

            let (result, collectable) = channel();
            self.results.insert(key.clone(), collectable);

            let reducer = self.reducer.clone();
            let handle = thread::Builder::new()
                .name(format!("reduce-{}", key))
                .spawn(move || {
                    let value = reducer.reduce(&key, &mut buffer.iter());
                    // A send failure only means nobody collects anymore; the result is
                    // harvested through the channel either way.
                    let _ = result.send(value);
                })
                .expect("could not spawn a reduce task");
            self.reducers.push(handle);
        }

        // A slave which owns no keys has nothing outstanding and is done right away.
        if self.total_requests == 0 {
            self.finish_phase();
        }
    }

    fn request_values(&mut self, key: &str) {
        let fan_out = self.slave_addresses.len();
        self.requests.insert(key.to_string(), fan_out);
        self.total_requests += fan_out;

        let message = match Message::with_data(codes::REQUEST_VALUES, &key.to_string()) {
            Ok(message) => message,
            Err(err) => {
                error!("could not encode a value request: {}", err);
                return;
            }
        };
        for address in self.slave_addresses.clone() {
            self.core.dispatch_to_slave(address, &message);
        }
    }

    /// Streams every locally stored value for `key` back to the requesting peer, on a
    /// dedicated thread so the event context never blocks on a peer's read speed.
    fn send_values(&mut self, key: String, requester: Arc<PeerCommunicator>) {
        let storage = self.storage.clone();
        let handle = thread::Builder::new()
            .name(format!("value-sender-{}", key))
            .spawn(move || {
                for value in storage.read(&key) {
                    let datum = Datum::new(key.clone(), value);
                    match Message::with_data(codes::KEY_VALUE, &datum) {
                        Ok(message) => {
                            if requester.dispatch(&message).is_err() {
                                warn!("peer {} went away mid-stream", requester.address());
                                return;
                            }
                        }
                        Err(err) => error!("could not encode a value for {:?}: {}", key, err),
                    }
                }
                match Message::with_data(codes::END_OF_DATA_STREAM, &key) {
                    Ok(message) => PhaseCore::respond_to_peer(&requester, &message),
                    Err(err) => error!("could not encode end-of-stream for {:?}: {}", key, err),
                }
            })
            .expect("could not spawn a value sender");
        self.senders.push(handle);
    }

    fn buffer_value(&mut self, datum: Datum<V>) {
        match self.buffers.get(&datum.key) {
            Some(buffer) => {
                if buffer.emit(datum.value).is_err() {
                    warn!("value for {:?} arrived after its buffer closed", datum.key);
                }
            }
            // Inbound values can only be routed once the owning key's shuffle has started.
            None => warn!("value for unknown key {:?}", datum.key),
        }
    }

    /// One peer finished streaming `key`. At zero pending requests the key's buffer closes,
    /// unblocking its reduce task, and a collector is dispatched for its result.
    ///
    /// An end-of-stream for a key with nothing pending is a protocol fault from the peer, not
    /// a reason to take the slave down; it is logged and dropped, and the phase-wide count
    /// only moves for decrements that actually happened.
    fn finish_stream(&mut self, key: String) {
        let remaining = match self.requests.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                warn!("duplicate end-of-stream for key {:?}", key);
                return;
            }
            None => {
                warn!("end-of-stream for unknown key {:?}", key);
                return;
            }
        };
        if remaining == 0 {
            if let Some(buffer) = self.buffers.get(&key) {
                buffer.close();
            }
            self.collect_result(key);
        }

        self.total_requests -= 1;
        if self.total_requests == 0 {
            self.finish_phase();
        }
    }

    /// Waits for the key's reduce computation on its own thread and forwards the result to
    /// the master, so slow reduces never block shuffle progress for other keys. A reduce task
    /// which died is observable here as a dropped channel and is reported, not hung on.
    fn collect_result(&mut self, key: String) {
        let collectable = match self.results.remove(&key) {
            Some(collectable) => collectable,
            None => {
                warn!("no pending result for key {:?}", key);
                return;
            }
        };
        let master = self.core.master().clone();
        let handle = thread::Builder::new()
            .name(format!("collect-{}", key))
            .spawn(move || match collectable.recv() {
                Ok(value) => {
                    let datum = Datum::new(key, value);
                    match Message::with_data(codes::RESULT_PAIR, &datum) {
                        Ok(message) => {
                            if let Err(err) = master.dispatch(&message) {
                                error!("could not deliver a result pair: {}", err);
                            }
                        }
                        Err(err) => error!("could not encode a result pair: {}", err),
                    }
                }
                Err(_) => {
                    error!("reduce task for key {:?} failed", key);
                    let report = format!("reduce failed for key {}", key);
                    match Message::with_data(codes::FAILURE, &report) {
                        Ok(message) => {
                            if let Err(err) = master.dispatch(&message) {
                                error!("could not report the failure: {}", err);
                            }
                        }
                        Err(err) => error!("could not encode the failure report: {}", err),
                    }
                }
            })
            .expect("could not spawn a result collector");
        self.collectors.push(handle);
    }

    /// Every key from every peer is fully drained. Collectors are awaited first so that every
    /// result pair reaches the master before the end-of-result marker does.
    fn finish_phase(&mut self) {
        for collector in self.collectors.drain(..) {
            let _ = collector.join();
        }
        for reducer in self.reducers.drain(..) {
            let _ = reducer.join();
        }
        info!("shuffle complete; result stream closed");
        self.core.dispatch_to_master(&Message::new(codes::END_OF_RESULT_STREAM));
        self.core.advance(PhaseKind::Load);
        self.core.dispatch_idle();
    }
}

impl<V: TaskValue> Phase<V> for ReducePhase<V> {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Reduce
    }

    fn initialize(&mut self, _parameters: &TaskParameters<V>) {
        info!("reduce phase ready");
        self.core.dispatch_idle();
    }

    fn execute(&mut self, message: Message, sender: &Arc<PeerCommunicator>) {
        match message.code() {
            codes::LOAD_SLAVE_ADDRESSES => match message.data::<Vec<SocketAddr>>() {
                Ok(addresses) => {
                    debug!("shuffle partners: {:?}", addresses);
                    self.slave_addresses = addresses;
                }
                Err(err) => error!("malformed slave address list: {}", err),
            },
            codes::REDUCE_KEYS => match message.data::<Vec<String>>() {
                Ok(keys) => self.start_reduce(keys),
                Err(err) => error!("malformed reduce key list: {}", err),
            },
            codes::KEY_VALUE => match message.data::<Datum<V>>() {
                Ok(datum) => self.buffer_value(datum),
                Err(err) => error!("malformed key value: {}", err),
            },
            codes::REQUEST_VALUES => match message.data::<String>() {
                Ok(key) => self.send_values(key, sender.clone()),
                Err(err) => error!("malformed value request: {}", err),
            },
            codes::END_OF_DATA_STREAM => match message.data::<String>() {
                Ok(key) => self.finish_stream(key),
                Err(err) => error!("malformed end-of-stream: {}", err),
            },
            code => debug!("reduce phase ignoring opcode {}", code),
        }
    }

    fn terminate(&mut self, _parameters: &TaskParameters<V>) {
        for sender in self.senders.drain(..) {
            let _ = sender.join();
        }
        self.storage.terminate();
        self.core.close_peers();
    }

    fn take_transition(&mut self) -> Option<PhaseKind> {
        self.core.take_transition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    use crate::data::PoolClosed;
    use crate::peer::MessageHandler;
    use crate::storage::MemoryStorage;
    use crate::task::Mapper;

    struct Sink;

    impl MessageHandler for Sink {
        fn handle(&self, _message: Message, _sender: &Arc<PeerCommunicator>) {}
    }

    struct NullMapper;

    impl Mapper<u64> for NullMapper {
        fn map(&self, _chunk: &str, _sink: &DataPool<Datum<u64>>) -> Result<(), PoolClosed> {
            Ok(())
        }
    }

    struct SumReducer;

    impl Reducer<u64> for SumReducer {
        fn reduce(&self, _key: &str, values: &mut dyn Iterator<Item = u64>) -> u64 {
            values.sum()
        }
    }

    /// A live loopback connection standing in for the master link. The remote end is kept
    /// open and unread so dispatches succeed.
    fn local_peer() -> (Arc<PeerCommunicator>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let outbound = TcpStream::connect(address).unwrap();
        let (inbound, _) = listener.accept().unwrap();
        let peer = PeerCommunicator::start(outbound, Arc::new(Sink)).unwrap();
        (peer, inbound)
    }

    fn reduce_phase(
        master: Arc<PeerCommunicator>,
        handler: &Arc<dyn MessageHandler>,
    ) -> ReducePhase<u64> {
        let parameters = TaskParameters::<u64> {
            mapper: Arc::new(NullMapper),
            reducer: Arc::new(SumReducer),
            storage: Arc::new(MemoryStorage::new()),
            master: master.clone(),
        };
        let core = PhaseCore::new(master, Arc::downgrade(handler));
        ReducePhase::new(core, &parameters)
    }

    fn end_of_stream(key: &str) -> Message {
        Message::with_data(codes::END_OF_DATA_STREAM, &key.to_string()).unwrap()
    }

    #[test]
    fn duplicate_end_of_stream_is_dropped_not_fatal() {
        let (master, _remote) = local_peer();
        let handler: Arc<dyn MessageHandler> = Arc::new(Sink);
        let mut phase = reduce_phase(master.clone(), &handler);

        // Two shuffle partners on unbound ports: dials fail and are logged, which is all
        // this test needs from the fan-out.
        let addresses: Vec<SocketAddr> =
            vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()];
        phase.execute(
            Message::with_data(codes::LOAD_SLAVE_ADDRESSES, &addresses).unwrap(),
            &master,
        );
        phase.execute(
            Message::with_data(codes::REDUCE_KEYS, &vec!["k1".to_string(), "k2".to_string()])
                .unwrap(),
            &master,
        );
        assert_eq!(4, phase.total_requests);

        // Both peers end k1, then one of them repeats itself.
        phase.execute(end_of_stream("k1"), &master);
        phase.execute(end_of_stream("k1"), &master);
        phase.execute(end_of_stream("k1"), &master);
        assert_eq!(2, phase.total_requests);
        assert!(phase.take_transition().is_none());

        // The phase still completes normally once k2 drains.
        phase.execute(end_of_stream("k2"), &master);
        phase.execute(end_of_stream("k2"), &master);
        assert_eq!(0, phase.total_requests);
        assert_eq!(Some(PhaseKind::Load), phase.take_transition());
    }

    #[test]
    fn end_of_stream_for_unknown_key_is_dropped() {
        let (master, _remote) = local_peer();
        let handler: Arc<dyn MessageHandler> = Arc::new(Sink);
        let mut phase = reduce_phase(master.clone(), &handler);

        phase.execute(end_of_stream("never-assigned"), &master);
        assert_eq!(0, phase.total_requests);
        assert!(phase.take_transition().is_none());
    }
}
