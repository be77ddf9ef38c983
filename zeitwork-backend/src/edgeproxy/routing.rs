use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::domains::RouteRow;

/// One healthy upstream an instance exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub instance_id: Uuid,
    pub address: String,
    pub port: u16,
}

impl Backend {
    /// `http://[addr]:port` origin for the upstream request
    pub fn origin(&self) -> String {
        if self.address.contains(':') {
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

/// Immutable host → backends snapshot.
///
/// A refresh builds a whole new table and swaps it in atomically;
/// in-flight requests keep using the snapshot they started with.
#[derive(Debug, Default)]
pub struct RoutingTable {
    hosts: HashMap<String, Vec<Backend>>,
}

impl RoutingTable {
    pub fn from_rows(rows: Vec<RouteRow>) -> Self {
        let mut hosts: HashMap<String, Vec<Backend>> = HashMap::new();
        for row in rows {
            hosts
                .entry(normalize_host(&row.domain_name))
                .or_default()
                .push(Backend {
                    instance_id: row.instance_id,
                    address: row.ipv6_address,
                    port: row.default_port as u16,
                });
        }
        Self { hosts }
    }

    pub fn backends(&self, host: &str) -> Option<&[Backend]> {
        self.hosts.get(&normalize_host(host)).map(Vec::as_slice)
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &String> {
        self.hosts.keys()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Lowercase and strip any port suffix from a Host header value
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    // IPv6 literals keep their brackets; everything else loses the port.
    let stripped = if host.starts_with('[') {
        host.split(']').next().map(|h| format!("{}]", h)).unwrap_or_else(|| host.to_string())
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    stripped.to_ascii_lowercase()
}

/// Pick a backend for a client by consistent hash over the healthy set.
///
/// The same client IP keeps landing on the same backend while the set is
/// stable. When every backend is marked failed the hash falls back to the
/// full set rather than refusing service.
pub fn select_backend<'a, F>(
    backends: &'a [Backend],
    client_ip: &str,
    is_failed: F,
) -> Option<&'a Backend>
where
    F: Fn(&Backend) -> bool,
{
    if backends.is_empty() {
        return None;
    }

    let healthy: Vec<&Backend> = backends.iter().filter(|b| !is_failed(b)).collect();
    if !healthy.is_empty() {
        return Some(healthy[hash_index(client_ip, healthy.len())]);
    }

    // Every backend recently failed; spread load over all of them rather
    // than refusing service outright.
    Some(&backends[hash_index(client_ip, backends.len())])
}

fn hash_index(client_ip: &str, len: usize) -> usize {
    let digest = Sha256::digest(client_ip.as_bytes());
    let mut value = [0u8; 8];
    value.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(value) % len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(n: u16) -> Backend {
        Backend {
            instance_id: Uuid::now_v7(),
            address: format!("fd00::{}", n),
            port: 3000,
        }
    }

    fn rows() -> Vec<RouteRow> {
        vec![
            RouteRow {
                domain_name: "App.Zeitwork.Dev".to_string(),
                instance_id: Uuid::now_v7(),
                ipv6_address: "fd00::1".to_string(),
                default_port: 3000,
            },
            RouteRow {
                domain_name: "app.zeitwork.dev".to_string(),
                instance_id: Uuid::now_v7(),
                ipv6_address: "fd00::2".to_string(),
                default_port: 3000,
            },
        ]
    }

    #[test]
    fn test_table_groups_backends_by_normalized_host() {
        let table = RoutingTable::from_rows(rows());
        assert_eq!(table.len(), 1);
        assert_eq!(table.backends("app.zeitwork.dev").unwrap().len(), 2);
        assert_eq!(table.backends("APP.zeitwork.dev:443").unwrap().len(), 2);
        assert!(table.backends("other.example.com").is_none());
    }

    #[test]
    fn test_normalize_host_strips_port_and_case() {
        assert_eq!(normalize_host("Example.COM:8443"), "example.com");
        assert_eq!(normalize_host(" example.com "), "example.com");
        assert_eq!(normalize_host("[fd00::1]:443"), "[fd00::1]");
    }

    #[test]
    fn test_selection_is_sticky_per_client() {
        let backends = vec![backend(1), backend(2), backend(3)];
        let first = select_backend(&backends, "198.51.100.7", |_| false).unwrap();
        for _ in 0..10 {
            let again = select_backend(&backends, "198.51.100.7", |_| false).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_selection_avoids_failed_backends() {
        let backends = vec![backend(1), backend(2)];
        let bad = backends[0].instance_id;
        for ip in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            let chosen = select_backend(&backends, ip, |b| b.instance_id == bad).unwrap();
            assert_ne!(chosen.instance_id, bad);
        }
    }

    #[test]
    fn test_all_failed_falls_back_to_full_set() {
        let backends = vec![backend(1), backend(2)];
        let chosen = select_backend(&backends, "203.0.113.9", |_| true);
        assert!(chosen.is_some());
    }

    #[test]
    fn test_empty_backend_list_selects_nothing() {
        assert!(select_backend(&[], "203.0.113.9", |_| false).is_none());
    }

    #[test]
    fn test_backend_origin_brackets_ipv6() {
        assert_eq!(backend(1).origin(), "http://[fd00::1]:3000");
        let v4 = Backend {
            instance_id: Uuid::now_v7(),
            address: "10.0.0.5".to_string(),
            port: 8080,
        };
        assert_eq!(v4.origin(), "http://10.0.0.5:8080");
    }
}
