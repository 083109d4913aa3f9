//! End-to-end word-count tasks over a real local cluster: a master and slaves connected over
//! loopback TCP, exercising the full map, shuffle and reduce pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use map_reduce::data::{DataPool, Datum, PoolClosed};
use map_reduce::master::{Chunk, MasterNode};
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

fn start_slave(master: &MasterNode<u64>) -> SlaveNode<u64> {
    let address = SocketAddr::from(([127, 0, 0, 1], master.port()));
    SlaveNode::<u64>::start(
        address,
        0,
        Arc::new(WordCountMapper),
        Arc::new(WordCountReducer),
        Arc::new(MemoryStorage::new()),
    )
    .unwrap()
}

fn text_chunks(chunks: &[&str]) -> Vec<Chunk> {
    chunks.iter().map(|chunk| Chunk::Text(chunk.to_string())).collect()
}

fn as_counts(results: Vec<Datum<u64>>) -> HashMap<String, u64> {
    let pairs = results.len();
    let counts: HashMap<String, u64> =
        results.into_iter().map(|datum| (datum.key, datum.value)).collect();
    // Exactly one result pair per distinct key.
    assert_eq!(pairs, counts.len());
    counts
}

#[test]
fn counts_words_across_two_slaves() {
    let master = MasterNode::<u64>::start(0, None).unwrap();
    let slaves = vec![start_slave(&master), start_slave(&master)];
    master.wait_for_slaves(2);

    let results = master.run_task(text_chunks(&["a b a", "b c"])).unwrap();
    let counts = as_counts(results);

    assert_eq!(3, counts.len());
    assert_eq!(2, counts["a"]);
    assert_eq!(2, counts["b"]);
    assert_eq!(1, counts["c"]);

    for slave in &slaves {
        slave.shutdown();
    }
    master.shutdown();
}

#[test]
fn keys_repeated_across_chunks_reduce_once() {
    let master = MasterNode::<u64>::start(0, None).unwrap();
    let slave = start_slave(&master);
    master.wait_for_slaves(1);

    let results = master.run_task(text_chunks(&["x y", "x z", "x"])).unwrap();
    let counts = as_counts(results);

    assert_eq!(3, counts.len());
    assert_eq!(3, counts["x"]);
    assert_eq!(1, counts["y"]);
    assert_eq!(1, counts["z"]);

    slave.shutdown();
    master.shutdown();
}

#[test]
fn maps_a_chunk_shared_as_a_file() {
    let input = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(input.path(), "pear apple\npear").unwrap();

    let master = MasterNode::<u64>::start(0, None).unwrap();
    let slave = start_slave(&master);
    master.wait_for_slaves(1);

    let results = master.run_task(vec![Chunk::File(input.path().to_path_buf())]).unwrap();
    let counts = as_counts(results);

    assert_eq!(2, counts["pear"]);
    assert_eq!(1, counts["apple"]);

    slave.shutdown();
    master.shutdown();
}

#[test]
fn empty_task_completes_with_no_results() {
    let master = MasterNode::<u64>::start(0, None).unwrap();
    let slave = start_slave(&master);
    master.wait_for_slaves(1);

    let results = master.run_task(Vec::new()).unwrap();
    assert!(results.is_empty());

    slave.shutdown();
    master.shutdown();
}

#[test]
fn cluster_runs_consecutive_tasks() {
    let master = MasterNode::<u64>::start(0, None).unwrap();
    let slave = start_slave(&master);
    master.wait_for_slaves(1);

    let first = as_counts(master.run_task(text_chunks(&["one two one"])).unwrap());
    assert_eq!(2, first["one"]);
    assert_eq!(1, first["two"]);

    // Slave storage is cleared between tasks, so counts never leak across.
    let second = as_counts(master.run_task(text_chunks(&["one"])).unwrap());
    assert_eq!(1, second["one"]);
    assert_eq!(None, second.get("two"));

    slave.shutdown();
    master.shutdown();
}

#[test]
fn task_without_slaves_is_rejected() {
    let master = MasterNode::<u64>::start(0, None).unwrap();
    assert!(master.run_task(text_chunks(&["a"])).is_err());
    master.shutdown();
}
