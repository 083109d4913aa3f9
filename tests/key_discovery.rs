//! Key discovery through a map phase observed at the wire: overlapping chunks mapped
//! concurrently must produce exactly one KEY_FOUND per distinct key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use map_reduce::data::{DataPool, Datum, PoolClosed};
use map_reduce::map_phase::MapPhase;
use map_reduce::message::{codes, Message};
use map_reduce::node::{NodeClient, NodeServer};
use map_reduce::peer::{MessageHandler, PeerCommunicator};
use map_reduce::phase::{Phase, PhaseCore, PhaseKind};
use map_reduce::storage::MemoryStorage;
use map_reduce::task::{Mapper, Reducer, TaskParameters};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Inbox {
    sender: Mutex<Sender<Message>>,
}

impl MessageHandler for Inbox {
    fn handle(&self, message: Message, _sender: &Arc<PeerCommunicator>) {
        let _ = self.sender.lock().unwrap().send(message);
    }
}

struct Sink;

impl MessageHandler for Sink {
    fn handle(&self, _message: Message, _sender: &Arc<PeerCommunicator>) {}
}

struct WordCountMapper;

impl Mapper<u64> for WordCountMapper {
    fn map(&self, chunk: &str, sink: &DataPool<Datum<u64>>) -> Result<(), PoolClosed> {
        for word in chunk.split_whitespace() {
            sink.emit(Datum::new(word, 1))?;
        }
        Ok(())
    }
}

struct SumReducer;

impl Reducer<u64> for SumReducer {
    fn reduce(&self, _key: &str, values: &mut dyn Iterator<Item = u64>) -> u64 {
        values.sum()
    }
}

/// A stand-in master which records every message the phase dispatches over its master link.
fn listening_master() -> (NodeServer, NodeClient, Receiver<Message>) {
    let (sender, receiver) = channel();
    let inbox = Arc::new(Inbox { sender: Mutex::new(sender) });
    let server = NodeServer::bind(0, inbox).unwrap();
    let address = SocketAddr::from(([127, 0, 0, 1], server.port()));
    let link = NodeClient::connect(address, Arc::new(Sink)).unwrap();
    (server, link, receiver)
}

#[test]
fn overlapping_chunks_report_each_key_exactly_once() {
    let (server, link, messages) = listening_master();

    let parameters = TaskParameters::<u64> {
        mapper: Arc::new(WordCountMapper),
        reducer: Arc::new(SumReducer),
        storage: Arc::new(MemoryStorage::new()),
        master: link.peer().clone(),
    };
    let handler: Arc<dyn MessageHandler> = Arc::new(Sink);
    let core = PhaseCore::new(parameters.master.clone(), Arc::downgrade(&handler));
    let mut phase = MapPhase::new(core, &parameters);
    phase.initialize(&parameters);

    // Every chunk repeats "x"; the other keys appear once each.
    let chunks = ["x y", "x z", "x"];
    for chunk in &chunks {
        let message = Message::with_data(codes::MAP_CHUNK, &chunk.to_string()).unwrap();
        phase.execute(message, &parameters.master);
    }
    phase.execute(Message::new(codes::END_MAP), &parameters.master);
    assert_eq!(Some(PhaseKind::Reduce), phase.take_transition());

    // Per-connection ordering puts every KEY_FOUND before the post-drain idle, and one idle
    // follows initialization plus each mapped chunk; stop at the final one.
    let expected_idles = 1 + chunks.len() + 1;
    let mut idles = 0;
    let mut reported: HashMap<String, usize> = HashMap::new();
    while idles < expected_idles {
        let message = messages.recv_timeout(RECV_TIMEOUT).unwrap();
        match message.code() {
            codes::IDLE => idles += 1,
            codes::KEY_FOUND => {
                *reported.entry(message.data::<String>().unwrap()).or_insert(0) += 1;
            }
            code => panic!("unexpected opcode {} from the map phase", code),
        }
    }

    assert_eq!(3, reported.len());
    assert_eq!(1, reported["x"]);
    assert_eq!(1, reported["y"]);
    assert_eq!(1, reported["z"]);

    link.shutdown();
    server.shutdown();
}
