//! Fabric configuration, parsed from the command line or the environment.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use trellis_errors::{FabricError, FabricResult};
use trellis_wire::NodeId;

/// Options recognized by the remote-execution fabric.
///
/// Host and port lists are comma-separated and must be the same length for a
/// given role; validation happens in the accessor methods so a bad pair is a
/// [`FabricError::Config`], not a panic deep in checkout.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "trellis")]
pub struct FabricOptions {
    /// Largest number of pooled connections per backend.
    #[arg(long, env = "TRELLIS_MAX_POOL_SIZE", default_value_t = 100)]
    pub max_pool_size: usize,

    /// Connections the pooler keeps warm per backend.
    #[arg(long, env = "TRELLIS_MIN_POOL_SIZE", default_value_t = 1)]
    pub min_pool_size: usize,

    /// Port the pool-manager worker listens on.
    #[arg(long, env = "TRELLIS_POOLER_PORT", default_value_t = 6667)]
    pub pooler_port: u16,

    /// Directory holding the pooler's Unix socket.
    #[arg(long, env = "TRELLIS_UNIX_SOCKET_DIR", default_value = "/tmp")]
    pub unix_socket_dir: PathBuf,

    /// Comma-separated data-node hosts.
    #[arg(long, env = "TRELLIS_DATA_NODE_HOSTS", default_value = "")]
    pub data_node_hosts: String,

    /// Comma-separated data-node ports, parallel to the host list.
    #[arg(long, env = "TRELLIS_DATA_NODE_PORTS", default_value = "")]
    pub data_node_ports: String,

    /// Comma-separated coordinator hosts.
    #[arg(long, env = "TRELLIS_COORD_HOSTS", default_value = "")]
    pub coord_hosts: String,

    /// Comma-separated coordinator ports, parallel to the host list.
    #[arg(long, env = "TRELLIS_COORD_PORTS", default_value = "")]
    pub coord_ports: String,

    /// Keep backend connections bound to the session instead of returning
    /// them to the pool between transactions.
    #[arg(long, env = "TRELLIS_PERSISTENT_CONNECTIONS")]
    pub persistent_connections: bool,

    /// Comma-separated ids of data nodes to prefer for replicated reads.
    #[arg(long, env = "TRELLIS_PREFERRED_DATA_NODES", default_value = "")]
    pub preferred_data_nodes: String,

    /// Data node written first for replicated tables.
    #[arg(long, env = "TRELLIS_PRIMARY_DATA_NODE")]
    pub primary_data_node: Option<u32>,
}

impl Default for FabricOptions {
    fn default() -> Self {
        // no args: every field takes its declared default
        FabricOptions::parse_from(std::iter::empty::<std::ffi::OsString>())
    }
}

impl FabricOptions {
    /// `(host, port)` per data node, in node-id order.
    pub fn data_nodes(&self) -> FabricResult<Vec<(String, u16)>> {
        zip_hosts_ports("data_node", &self.data_node_hosts, &self.data_node_ports)
    }

    /// `(host, port)` per peer coordinator, in node-id order.
    pub fn coordinators(&self) -> FabricResult<Vec<(String, u16)>> {
        zip_hosts_ports("coord", &self.coord_hosts, &self.coord_ports)
    }

    /// Parsed preferred-node ids.
    pub fn preferred_data_nodes(&self) -> FabricResult<Vec<NodeId>> {
        split_csv(&self.preferred_data_nodes)
            .map(|id| {
                id.parse::<u32>().map(NodeId).map_err(|_| {
                    FabricError::Config(format!("bad preferred data node id {id:?}"))
                })
            })
            .collect()
    }

    pub fn primary_data_node(&self) -> Option<NodeId> {
        self.primary_data_node.map(NodeId)
    }

    /// Path of the pooler's Unix socket.
    pub fn pooler_socket_path(&self) -> PathBuf {
        pooler_socket_path(&self.unix_socket_dir, self.pooler_port)
    }
}

pub fn pooler_socket_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!(".s.TRELLIS_POOL.{port}"))
}

fn split_csv(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}

fn zip_hosts_ports(what: &str, hosts: &str, ports: &str) -> FabricResult<Vec<(String, u16)>> {
    let hosts: Vec<&str> = split_csv(hosts).collect();
    let ports: Vec<&str> = split_csv(ports).collect();
    if hosts.len() != ports.len() {
        return Err(FabricError::Config(format!(
            "{what}: {} hosts but {} ports",
            hosts.len(),
            ports.len()
        )));
    }
    hosts
        .into_iter()
        .zip(ports)
        .map(|(h, p)| {
            let port = p
                .parse::<u16>()
                .map_err(|_| FabricError::Config(format!("{what}: bad port {p:?}")))?;
            Ok((h.to_owned(), port))
        })
        .collect()
}
