//! The map phase: applies the user mapper to inbound chunks on a bounded worker pool while a
//! single persistor thread drains the shared data pool into local storage, reporting each
//! distinct key to the master exactly once.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;

use crate::data::{DataPool, Datum};
use crate::executor::WorkerPool;
use crate::message::{codes, Message, Payload};
use crate::peer::PeerCommunicator;
use crate::phase::{Phase, PhaseCore, PhaseKind};
use crate::storage::SlaveStorage;
use crate::task::{Mapper, TaskParameters, TaskValue};

/// How many chunks are mapped concurrently on one slave.
const MAP_WORKERS: usize = 5;

pub struct MapPhase<V: TaskValue> {
    core: PhaseCore,
    mapper: Arc<dyn Mapper<V>>,
    storage: Arc<dyn SlaveStorage<V>>,
    pool: Arc<DataPool<Datum<V>>>,
    mappers: WorkerPool,
    persistor: Option<thread::JoinHandle<()>>,
}

impl<V: TaskValue> MapPhase<V> {
    pub fn new(core: PhaseCore, parameters: &TaskParameters<V>) -> Self {
        MapPhase {
            core,
            mapper: parameters.mapper.clone(),
            storage: parameters.storage.clone(),
            pool: Arc::new(DataPool::new()),
            mappers: WorkerPool::new("mapper", MAP_WORKERS),
            persistor: None,
        }
    }

    fn submit_chunk(&mut self, message: &Message) {
        if self.persistor.is_none() {
            self.start_persistor();
        }
        let chunk = match chunk_text(message) {
            Ok(chunk) => chunk,
            Err(err) => {
                error!("discarding malformed map chunk: {}", err);
                return;
            }
        };

        let mapper = self.mapper.clone();
        let pool = self.pool.clone();
        let master = self.core.master().clone();
        let submitted = self.mappers.submit(Box::new(move || {
            // A faulting mapper must still free its capacity slot, or the master would wait
            // on this chunk forever.
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mapper.map(&chunk, &pool)));
            match outcome {
                Ok(Err(err)) => error!("mapper rejected a chunk: {}", err),
                Err(_) => error!("mapper task died on a chunk"),
                Ok(Ok(())) => {}
            }
            if let Err(err) = master.dispatch(&Message::new(codes::IDLE)) {
                error!("could not reach the master: {}", err);
            }
        }));
        if let Err(err) = submitted {
            error!("map worker pool unavailable: {}", err);
        }
    }

    /// Starts the single consumer of the data pool. Being the only thread which observes the
    /// mapped stream, it can both deduplicate key discovery and persist without further
    /// synchronization.
    fn start_persistor(&mut self) {
        let pool = self.pool.clone();
        let storage = self.storage.clone();
        let master = self.core.master().clone();

        let handle = thread::Builder::new()
            .name("data-persistor".to_string())
            .spawn(move || {
                let mut keys_found: HashSet<String> = HashSet::new();
                for datum in pool.iter() {
                    if keys_found.insert(datum.key.clone()) {
                        match Message::with_data(codes::KEY_FOUND, &datum.key) {
                            Ok(message) => {
                                if let Err(err) = master.dispatch(&message) {
                                    error!("could not report key to the master: {}", err);
                                }
                            }
                            Err(err) => error!("could not encode a found key: {}", err),
                        }
                    }
                    storage.insert(&datum.key, datum.value);
                }
                debug!("data persistor drained the pool; {} distinct keys", keys_found.len());
            })
            .expect("could not spawn the data persistor");
        self.persistor = Some(handle);
    }

    /// Closes the pool, drains the mapper pool and joins the persistor, in that order. After
    /// this returns, every datum emitted by any mapper task has been persisted exactly once.
    fn end_map(&mut self) {
        self.pool.close();
        self.mappers.join();
        if let Some(persistor) = self.persistor.take() {
            if persistor.join().is_err() {
                error!("the data persistor terminated abnormally");
            }
        }
        info!("map phase finished");
    }
}

impl<V: TaskValue> Phase<V> for MapPhase<V> {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Map
    }

    fn initialize(&mut self, _parameters: &TaskParameters<V>) {
        info!("map phase ready");
        self.core.dispatch_idle();
    }

    fn execute(&mut self, message: Message, _sender: &Arc<PeerCommunicator>) {
        match message.code() {
            codes::MAP_CHUNK => self.submit_chunk(&message),
            codes::END_MAP => {
                self.end_map();
                self.core.advance(PhaseKind::Reduce);
                self.core.dispatch_idle();
            }
            code => debug!("map phase ignoring opcode {}", code),
        }
    }

    fn take_transition(&mut self) -> Option<PhaseKind> {
        self.core.take_transition()
    }
}

/// A chunk arrives either inline or as a transferred file, whose materialized copy is read
/// back as text.
fn chunk_text(message: &Message) -> io::Result<String> {
    match message.payload() {
        Payload::File(path) => fs::read_to_string(path),
        Payload::Data(_) => message
            .data::<String>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
        Payload::Empty => Err(io::Error::new(io::ErrorKind::InvalidData, "empty map chunk")),
    }
}
