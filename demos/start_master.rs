//! A script used to start the master, wait for a number of slaves, run one word-count task over
//! an input file and print the reduced pairs.
//!
//! You can run this example as follows
//!     RUST_LOG=map_reduce=info cargo run --example start_master -- <num_of_slaves> <input_file> Config
//! where <input_file> is a plain-text file whose lines become the map chunks.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate map_reduce;

use std::env;
use std::fs;

use map_reduce::configurations::get_config;
use map_reduce::master::{Chunk, MasterNode};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    match args.len() {
        4 => {
            let num_of_slaves: usize = match args[1].parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("Error: second argument not an usize");
                    return;
                }
            };

            let input = fs::read_to_string(&args[2]).expect("Could not read the input file");

            let config = get_config(&args[3]);
            let master_address = config["master"];
            let client_address = config["client"];

            let master = MasterNode::<u64>::start(master_address.port(), Some(client_address.port()))
                .expect("Could not start the master");

            info!("Waiting for {} slaves", num_of_slaves);
            master.wait_for_slaves(num_of_slaves);

            let chunks: Vec<Chunk> =
                input.lines().map(|line| Chunk::Text(line.to_string())).collect();
            let mut results = master.run_task(chunks).expect("The task failed");
            results.sort_by(|a, b| a.key.cmp(&b.key));

            for datum in &results {
                println!("{} = {}", datum.key, datum.value);
            }
            master.shutdown();
        }
        _ => {
            panic!("Expected 3 arguments (excluding file name)");
        }
    }
}
