//! Periodic listening-port scanner.
//!
//! Every tick the scanner enumerates TCP sockets in LISTEN state from
//! `/proc/net/tcp` and `/proc/net/tcp6`, filters out infrastructure
//! ports, and diffs the result against the previous snapshot. Newly
//! opened ports are announced before closed ones, both in ascending
//! order, so a single tick's output is deterministic. Enumeration
//! failures are logged and treated as an unchanged snapshot; the scanner
//! itself never dies.
//!
//! Consumers subscribe through a broadcast channel rather than callbacks;
//! a lagging subscriber misses events but never blocks the scanner.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// TCP state column value for LISTEN in procfs.
const TCP_LISTEN: &str = "0A";

/// Direction of a port transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    Opened,
    Closed,
}

impl PortChange {
    /// Wire spelling used in client notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortChange::Opened => "open",
            PortChange::Closed => "close",
        }
    }
}

/// One observed transition of a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEvent {
    pub port: u16,
    pub change: PortChange,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Time between scans.
    pub interval: Duration,

    /// Ports never reported (the agent's own listener, helper ports,
    /// operator exclusions).
    pub exclude: BTreeSet<u16>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            exclude: BTreeSet::new(),
        }
    }
}

/// Handle to the port scanner; cheap to share.
#[derive(Debug)]
pub struct PortScanner {
    config: ScannerConfig,
    events: broadcast::Sender<PortEvent>,
}

impl PortScanner {
    pub fn new(config: ScannerConfig) -> Self {
        // 256 in-flight events is far beyond a realistic tick's output.
        let (events, _) = broadcast::channel(256);
        Self { config, events }
    }

    /// Subscribe to port transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event stream. The scan loop publishes through a
    /// clone of this channel; tests can inject events the same way.
    pub fn sender(&self) -> broadcast::Sender<PortEvent> {
        self.events.clone()
    }

    /// Launch the scan loop on the current runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut prev: BTreeSet<u16> = BTreeSet::new();
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let current = match listening_ports().await {
                    Ok(ports) => ports
                        .into_iter()
                        .filter(|p| !config.exclude.contains(p))
                        .collect::<BTreeSet<u16>>(),
                    Err(e) => {
                        warn!(error = %e, "port enumeration failed; keeping previous snapshot");
                        continue;
                    }
                };

                let (added, removed) = diff_snapshots(&prev, &current);
                if !added.is_empty() || !removed.is_empty() {
                    debug!(?added, ?removed, "listening ports changed");
                }

                for port in added {
                    let _ = events.send(PortEvent {
                        port,
                        change: PortChange::Opened,
                    });
                }
                for port in removed {
                    let _ = events.send(PortEvent {
                        port,
                        change: PortChange::Closed,
                    });
                }

                prev = current;
            }
        })
    }
}

/// Ascending `added` and `removed` port lists between two snapshots.
pub fn diff_snapshots(prev: &BTreeSet<u16>, current: &BTreeSet<u16>) -> (Vec<u16>, Vec<u16>) {
    let added = current.difference(prev).copied().collect();
    let removed = prev.difference(current).copied().collect();
    (added, removed)
}

/// Enumerate TCP ports in LISTEN state across IPv4 and IPv6.
async fn listening_ports() -> std::io::Result<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();

    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => ports.extend(parse_proc_net_tcp(&content)),
            // IPv6 may be disabled in minimal containers.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(ports)
}

/// Parse one procfs TCP table, keeping local ports of LISTEN sockets.
fn parse_proc_net_tcp(content: &str) -> BTreeSet<u16> {
    content.lines().skip(1).filter_map(parse_socket_line).collect()
}

/// Extract the local port from one socket line, if it is in LISTEN state.
///
/// Lines look like:
/// `0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 …`
/// where the local address is `hex_ip:hex_port` and the fourth column is
/// the state.
fn parse_socket_line(line: &str) -> Option<u16> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = fields.next()?;

    if state != TCP_LISTEN {
        return None;
    }

    let port_hex = local.rsplit(':').next()?;
    u16::from_str_radix(port_hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0100007F:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0\n\
   1: 0100007F:1F90 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 20 4 30 10 -1\n\
   2: 00000000:1BBD 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12347 1 0000000000000000 100 0 0 10 0\n";

    const SAMPLE_TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 00000000000000000000000000000000:0BB9 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22345 1 0000000000000000 100 0 0 10 0\n";

    #[test]
    fn parses_listen_sockets_only() {
        let ports = parse_proc_net_tcp(SAMPLE_TCP);
        // 0x0BB8 = 3000 listens, 0x1F90 = 8080 is ESTABLISHED, 0x1BBD = 7101 listens.
        assert_eq!(ports, BTreeSet::from([3000, 7101]));
    }

    #[test]
    fn parses_ipv6_table() {
        let ports = parse_proc_net_tcp(SAMPLE_TCP6);
        assert_eq!(ports, BTreeSet::from([3001]));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let ports = parse_proc_net_tcp("header\ngarbage line\n   9: nocolonhere 00000000:0000 0A\n");
        assert!(ports.is_empty());
    }

    #[test]
    fn diff_reports_added_and_removed_in_ascending_order() {
        let prev = BTreeSet::from([3000, 5174, 9000]);
        let current = BTreeSet::from([3000, 8123, 4000]);

        let (added, removed) = diff_snapshots(&prev, &current);
        assert_eq!(added, vec![4000, 8123]);
        assert_eq!(removed, vec![5174, 9000]);
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let snap = BTreeSet::from([80, 443]);
        let (added, removed) = diff_snapshots(&snap, &snap.clone());
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn change_wire_spelling() {
        assert_eq!(PortChange::Opened.as_str(), "open");
        assert_eq!(PortChange::Closed.as_str(), "close");
    }

    #[tokio::test]
    async fn subscribers_receive_fanout() {
        let scanner = PortScanner::new(ScannerConfig::default());
        let mut rx_a = scanner.subscribe();
        let mut rx_b = scanner.subscribe();

        scanner
            .sender()
            .send(PortEvent {
                port: 8123,
                change: PortChange::Opened,
            })
            .expect("send");

        assert_eq!(rx_a.recv().await.expect("a").port, 8123);
        assert_eq!(rx_b.recv().await.expect("b").port, 8123);
    }
}
