//! The capability interfaces a task plugs into the engine, and the immutable parameter bundle
//! a phase receives on entry.

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::{DataPool, Datum, PoolClosed};
use crate::peer::PeerCommunicator;
use crate::storage::SlaveStorage;

/// The bound every mapped/reduced value type must satisfy: it crosses the wire (serde) and
/// worker-thread boundaries.
pub trait TaskValue: Serialize + DeserializeOwned + Clone + Debug + Send + 'static {}

impl<T> TaskValue for T where T: Serialize + DeserializeOwned + Clone + Debug + Send + 'static {}

/// The user mapper: consumes one chunk of input and emits (key, value) pairs into the sink.
pub trait Mapper<V>: Send + Sync {
    fn map(&self, chunk: &str, sink: &DataPool<Datum<V>>) -> Result<(), PoolClosed>;
}

/// The user reducer: folds every value observed for a key into a single value. The input
/// sequence carries no ordering guarantee, so a deterministic task needs an order-insensitive
/// reducer.
pub trait Reducer<V>: Send + Sync {
    fn reduce(&self, key: &str, values: &mut dyn Iterator<Item = V>) -> V;
}

/// The configuration bundle handed to a phase on entry: the user capabilities, the storage
/// handle and the master connection. Phases clone the handles they need and never outlive them.
pub struct TaskParameters<V> {
    pub mapper: Arc<dyn Mapper<V>>,
    pub reducer: Arc<dyn Reducer<V>>,
    pub storage: Arc<dyn SlaveStorage<V>>,
    pub master: Arc<PeerCommunicator>,
}

impl<V> Clone for TaskParameters<V> {
    fn clone(&self) -> Self {
        TaskParameters {
            mapper: self.mapper.clone(),
            reducer: self.reducer.clone(),
            storage: self.storage.clone(),
            master: self.master.clone(),
        }
    }
}
