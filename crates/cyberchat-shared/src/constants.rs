use std::time::Duration;

/// DNS-SD service type advertised and browsed on the local link
pub const SERVICE_TYPE: &str = "_cyberchat._tcp.local.";

/// Default HTTPS listen port
pub const DEFAULT_PORT: u16 = 7331;

/// Ports probed when discovering a peer from an inbound message
pub const PROBE_PORTS: [u16; 5] = [7331, 7332, 7333, 7334, 7335];

/// Maximum message content size in bytes (100 MiB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// A peer is active while `now - last_seen` stays within this window
pub const ACTIVE_PEER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Budget for one peer message POST (dial + TLS + request)
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Budget for a whoami key fetch issued by the scanner
pub const KEY_FETCH_TIMEOUT: Duration = Duration::from_millis(1500);

/// Budget for one whoami probe during opportunistic discovery
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Hard deadline for one scan cycle
pub const SCAN_DEADLINE: Duration = Duration::from_millis(1500);

/// Scan interval bounds; the scanner backs off between them
pub const SCAN_BASE_INTERVAL: Duration = Duration::from_secs(2);
pub const SCAN_MAX_INTERVAL: Duration = Duration::from_secs(15);

/// How often the chosen network interface is re-checked
pub const INTERFACE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Suppressor window deduplicating concurrent eviction work
pub const EVICTION_COOLDOWN: Duration = Duration::from_secs(5);

/// Suppressor window before re-probing a peer that failed discovery
pub const DISCOVERY_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Stored messages older than this are swept daily
pub const MESSAGE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Minimum spacing between file-transfer progress events
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(500);

/// WebSocket session ping interval and read deadline
pub const SESSION_PING_INTERVAL: Duration = Duration::from_secs(54);
pub const SESSION_READ_DEADLINE: Duration = Duration::from_secs(60);
