//! A script used to start one word-count slave, which connects to the master and then serves
//! tasks until killed.
//!
//! You can run this example as follows
//!     RUST_LOG=map_reduce=info cargo run --example start_slave -- <listen_port> Config
//! where <listen_port> is the port this slave serves shuffle requests on (0 picks a free one),
//! so that several slaves can share one machine.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate map_reduce;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use map_reduce::configurations::get_config;
use map_reduce::data::{DataPool, Datum, PoolClosed};
use map_reduce::slave::SlaveNode;
use map_reduce::storage::MemoryStorage;
use map_reduce::task::{Mapper, Reducer};

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

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    match args.len() {
        3 => {
            let listen_port: u16 = match args[1].parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("Error: second argument not an u16");
                    return;
                }
            };

            let config = get_config(&args[2]);
            let master_address = SocketAddr::V4(config["master"]);

            let slave = SlaveNode::<u64>::start(
                master_address,
                listen_port,
                Arc::new(WordCountMapper),
                Arc::new(WordCountReducer),
                Arc::new(MemoryStorage::new()),
            )
            .expect("Could not start the slave");
            info!("Serving tasks on {}", slave.shuffle_address());

            loop {
                thread::park();
            }
        }
        _ => {
            panic!("Expected 2 arguments (excluding file name)");
        }
    }
}
