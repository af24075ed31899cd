//! ARP-table host hints. Hosts the kernel already resolved are cheap,
//! high-signal sweep candidates when no CIDR was given.

use std::net::Ipv4Addr;

use tracing::debug;

/// Read IPv4 hosts from the kernel ARP table. Returns an empty list on
/// platforms without `/proc/net/arp` or when the table cannot be read.
pub fn arp_hosts() -> Vec<Ipv4Addr> {
    match std::fs::read_to_string("/proc/net/arp") {
        Ok(table) => parse_arp_table(&table),
        Err(_) => Vec::new(),
    }
}

fn parse_arp_table(table: &str) -> Vec<Ipv4Addr> {
    let mut hosts = Vec::new();
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(ip), Some(_hw_type), Some(flags)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        // Flags 0x0 marks an incomplete entry
        if flags == "0x0" {
            continue;
        }
        if let Ok(addr) = ip.parse::<Ipv4Addr>() {
            hosts.push(addr);
        }
    }
    debug!(count = hosts.len(), "ARP table hosts");
    hosts
}
