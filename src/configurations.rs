//! A module that contains functions required to read, parse and return the configuration settings
//! from the file `Config.toml` at the root of this crate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use config::{Config, File};

/// Returns the address configured for each node role (`master`, `slave`, `client`).
pub fn get_config(file_name: &str) -> HashMap<String, SocketAddrV4> {
    let c = read_config(file_name);
    parse_config(&c)
}

fn read_config(file_name: &str) -> HashMap<String, HashMap<String, String>> {
    let mut c = Config::default();
    c.merge(File::with_name(file_name)).expect("Could not read the configuration file");
    c.try_into::<HashMap<String, HashMap<String, String>>>().expect("Could not try_into")
}

fn parse_config(c: &HashMap<String, HashMap<String, String>>) -> HashMap<String, SocketAddrV4> {
    c.iter()
        .map(|(role, value)| {
            (
                role.clone(),
                SocketAddrV4::new(
                    Ipv4Addr::from_str(&value["host"]).expect("Malformed host address"),
                    value["port"].parse().expect("Malformed port number"),
                ),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_role_section() {
        let mut section = HashMap::new();
        section.insert("host".to_string(), "127.0.0.1".to_string());
        section.insert("port".to_string(), "13370".to_string());
        let mut raw = HashMap::new();
        raw.insert("master".to_string(), section);

        let parsed = parse_config(&raw);
        assert_eq!("127.0.0.1:13370".parse::<SocketAddrV4>().unwrap(), parsed["master"]);
    }
}
