//! An example which simulates a full word-count cluster locally (on one machine): one master
//! and three slaves, all in one process.
//!
//! Run this example as follows
//!     RUST_LOG=map_reduce=info cargo run --example simulate

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate map_reduce;

use std::net::SocketAddr;
use std::sync::Arc;

use map_reduce::configurations::get_config;
use map_reduce::data::{DataPool, Datum, PoolClosed};
use map_reduce::master::{Chunk, MasterNode};
use map_reduce::slave::SlaveNode;
use map_reduce::storage::MemoryStorage;
use map_reduce::task::{Mapper, Reducer};

const NUM_OF_SLAVES: usize = 3;

const INPUT: &str = "\
the quick brown fox jumps over the lazy dog
the dog barks and the fox runs
a lazy afternoon for a quick fox
";

struct WordCountMapper;

impl Mapper<u64> for WordCountMapper {
    fn map(&self, chunk: &str, sink: &DataPool<Datum<u64>>) -> Result<(), PoolClosed> {
        for word in chunk.split_whitespace() {
            sink.emit(Datum::new(word, 1))?;
        }
        Ok(())
    }
}

struct WordCountReducer;

impl Reducer<u64> for WordCountReducer {
    fn reduce(&self, _key: &str, values: &mut dyn Iterator<Item = u64>) -> u64 {
        values.sum()
    }
}

fn main() {
    env_logger::init();

    let config = get_config("Config");
    info!("Configurations = {:?}\n", config);

    let master_address = config["master"];
    let master =
        MasterNode::<u64>::start(master_address.port(), None).expect("Could not start the master");

    let mut slaves = Vec::new();
    for _ in 0..NUM_OF_SLAVES {
        let slave = SlaveNode::<u64>::start(
            SocketAddr::V4(master_address),
            0,
            Arc::new(WordCountMapper),
            Arc::new(WordCountReducer),
            Arc::new(MemoryStorage::new()),
        )
        .expect("Could not start a slave");
        slaves.push(slave);
    }
    master.wait_for_slaves(NUM_OF_SLAVES);

    let chunks: Vec<Chunk> =
        INPUT.lines().map(|line| Chunk::Text(line.to_string())).collect();
    let mut results = master.run_task(chunks).expect("The task failed");
    results.sort_by(|a, b| a.key.cmp(&b.key));

    for datum in &results {
        println!("{} = {}", datum.key, datum.value);
    }

    for slave in &slaves {
        slave.shutdown();
    }
    master.shutdown();
}
