// Member lookup
// Loads the initial set of known peers from the configured member list or
// from the cluster member file

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use tracing::{error, info, warn};

use cumulus_api::{Node, NodeBuilder};
use cumulus_common::DEFAULT_LAN_PORT;

use crate::model::Configuration;

/// Static member lookup
///
/// `cumulus.member.list` wins over the file; each entry is
/// `host[:port][?wan=host:port&dc=name&name=alias]`.
pub struct FileMemberLookup {
    member_list: Vec<String>,
    cluster_conf_path: String,
}

impl FileMemberLookup {
    pub fn new(config: &Configuration) -> Self {
        Self {
            member_list: config.member_list(),
            cluster_conf_path: config.member_conf_path(),
        }
    }

    pub fn with_path(path: &str) -> Self {
        Self {
            member_list: Vec::new(),
            cluster_conf_path: path.to_string(),
        }
    }

    /// Read member lines from the cluster member file
    fn parse_cluster_conf(&self) -> Vec<String> {
        let path = Path::new(&self.cluster_conf_path);
        if !path.exists() {
            info!("No cluster member file at {}", self.cluster_conf_path);
            return vec![];
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open cluster member file: {}", e);
                return vec![];
            }
        };

        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect()
    }

    /// Parse one member entry into a DISCONNECTED node descriptor
    pub fn parse_member(entry: &str) -> Option<Node> {
        let (address, query) = match entry.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (entry, None),
        };
        let (host, port) = parse_host_port(address, DEFAULT_LAN_PORT)?;
        let mut builder = NodeBuilder::new(host, port);

        for param in query.into_iter().flat_map(|q| q.split('&')) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim() {
                "wan" => match parse_host_port(value.trim(), port) {
                    Some((wan_host, wan_port)) => builder = builder.wan(wan_host, wan_port),
                    None => warn!("Ignoring malformed WAN address in '{}'", entry),
                },
                "dc" => builder = builder.data_center(value.trim()),
                "name" => builder = builder.name(value.trim()),
                other => warn!("Unknown member option '{}' in '{}'", other, entry),
            }
        }

        Some(builder.build())
    }

    /// Load the configured members
    pub fn get_members(&self) -> Vec<Node> {
        let entries = if self.member_list.is_empty() {
            self.parse_cluster_conf()
        } else {
            self.member_list.clone()
        };

        let members: Vec<Node> = entries
            .iter()
            .filter_map(|entry| {
                let member = Self::parse_member(entry);
                if member.is_none() {
                    warn!("Skipping malformed member entry '{}'", entry);
                }
                member
            })
            .collect();

        info!("Loaded {} cluster members", members.len());
        members
    }
}

fn parse_host_port(address: &str, default_port: u16) -> Option<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((address.to_string(), default_port)),
    }
}
