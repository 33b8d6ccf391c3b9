//! Platform implementation for Linux-class hosts (gateways, SBCs)

use super::Platform;
use crate::protocol::MacAddress;
use std::fs;
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Instant;
use tracing::{error, info, warn};

/// Exit status used when re-executing the binary is not possible; a supervisor
/// (systemd, runit) is expected to start the process again.
pub const RESTART_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone)]
pub struct HostPlatform {
    boot: Instant,
    route_target: Option<String>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            route_target: None,
        }
    }

    /// Report the local address of the route towards `host:port` (normally the
    /// first configured broker) as the device's network address.
    pub fn with_route_target(mut self, host: &str, port: u16) -> Self {
        self.route_target = Some(format!("{host}:{port}"));
        self
    }

    /// Hardware id of the first non-loopback interface with a real address
    pub fn discover_mac() -> Option<MacAddress> {
        let mut interfaces: Vec<_> = fs::read_dir("/sys/class/net")
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.file_name().is_some_and(|name| name != "lo"))
            .collect();
        interfaces.sort();

        interfaces.iter().find_map(|path| {
            let text = fs::read_to_string(path.join("address")).ok()?;
            text.parse::<MacAddress>()
                .ok()
                .filter(|mac| !mac.is_zero())
        })
    }

    fn local_address(&self) -> Option<String> {
        let target = self.route_target.as_deref()?.to_socket_addrs().ok()?.next()?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).ok()?;
        // UDP connect only selects a route; nothing is sent.
        socket.connect(target).ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn restart(&self) -> ! {
        warn!("Restarting device");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            match std::env::current_exe() {
                Ok(exe) => {
                    info!(exe = %exe.display(), "Re-executing binary");
                    let err = std::process::Command::new(exe)
                        .args(std::env::args_os().skip(1))
                        .exec();
                    error!(error = %err, "Re-exec failed, exiting for supervisor restart");
                }
                Err(e) => {
                    error!(error = %e, "Cannot locate current binary, exiting for supervisor restart");
                }
            }
        }

        std::process::exit(RESTART_EXIT_CODE)
    }

    fn free_memory(&self) -> u64 {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_available(&meminfo))
            .unwrap_or(0)
    }

    fn network_address(&self) -> String {
        self.local_address()
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }
}

/// Extract `MemAvailable` from /proc/meminfo contents, in bytes
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let platform = HostPlatform::new();
        let first = platform.now_ms();
        let second = platform.now_ms();
        assert!(second >= first);
    }

    #[test]
    fn test_clones_share_boot_time() {
        let platform = HostPlatform::new();
        let clone = platform.clone();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clone.now_ms() >= 5);
        assert!(platform.now_ms() >= 5);
    }

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:        8000000 kB\nMemFree:          100000 kB\nMemAvailable:    2000000 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2_048_000_000));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_network_address_without_route_target() {
        assert_eq!(HostPlatform::new().network_address(), "0.0.0.0");
    }

    #[test]
    fn test_network_address_towards_loopback() {
        let platform = HostPlatform::new().with_route_target("127.0.0.1", 1883);
        assert_eq!(platform.network_address(), "127.0.0.1");
    }
}
