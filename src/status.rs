//! Live server status.
//!
//! `ServerStats` holds the state shared between the accept loop and every
//! connection task: the connection counters, the start time and the bound
//! address. All counter updates are single atomic operations; the start
//! time and bound address are written once before the first connection is
//! accepted.
//!
//! A [`StatusSnapshot`] is computed from `ServerStats` on every request and
//! never stored.

use chrono::{DateTime, Local, SecondsFormat};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Anything that can produce a point-in-time status view.
///
/// The command dispatcher holds one of these to answer `status`.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> StatusSnapshot;
}

/// Point-in-time, read-only view of server counters and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    /// Time since the server started accepting (zero before start).
    pub uptime: Duration,
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Connections currently open.
    pub active_connections: u64,
    /// Wall-clock time the server started, if it has.
    pub start_time: Option<DateTime<Local>>,
    /// Bound address, or the configured one before binding.
    pub address: String,
}

impl StatusSnapshot {
    /// Uptime truncated to whole seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.uptime.as_secs()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start_time = match &self.start_time {
            Some(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
            None => "not started".to_string(),
        };

        writeln!(f, "Server status:")?;
        writeln!(f, "  Address:            {}", self.address)?;
        writeln!(f, "  Start time:         {start_time}")?;
        writeln!(
            f,
            "  Uptime:             {} ({}s)",
            format_uptime(self.uptime),
            self.uptime_seconds()
        )?;
        writeln!(f, "  Total connections:  {}", self.total_connections)?;
        writeln!(f, "  Active connections: {}", self.active_connections)
    }
}

/// Format a duration as `1h2m3s`, dropping leading zero units.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[derive(Debug)]
struct StartTime {
    instant: Instant,
    wall: DateTime<Local>,
}

/// Counters and timing shared by every task of one server.
#[derive(Debug)]
pub struct ServerStats {
    configured_address: String,
    bound_address: OnceLock<SocketAddr>,
    started: OnceLock<StartTime>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

impl ServerStats {
    /// Create stats for a server configured to listen on `address`.
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            configured_address: address.into(),
            bound_address: OnceLock::new(),
            started: OnceLock::new(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        })
    }

    /// Record the bound address and start time.
    ///
    /// Only the first call has any effect; a server is started at most once.
    pub fn mark_started(&self, bound: SocketAddr) {
        let _ = self.bound_address.set(bound);
        let _ = self.started.set(StartTime {
            instant: Instant::now(),
            wall: Local::now(),
        });
    }

    /// Address the listener is bound to, once started.
    pub fn bound_address(&self) -> Option<SocketAddr> {
        self.bound_address.get().copied()
    }

    /// Count a newly accepted connection.
    ///
    /// The returned guard decrements the active count when dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ActiveConnection {
        // Total before active so a concurrent reader never sees active > total.
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ActiveConnection {
            stats: Arc::clone(self),
        }
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Compute a fresh snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        // Active is read first: it can only have been incremented after the
        // matching total increment, so the pair stays ordered.
        let active_connections = self.active_connections();
        let total_connections = self.total_connections();

        let (uptime, start_time) = match self.started.get() {
            Some(start) => (start.instant.elapsed(), Some(start.wall)),
            None => (Duration::ZERO, None),
        };

        let address = match self.bound_address() {
            Some(addr) => addr.to_string(),
            None => self.configured_address.clone(),
        };

        StatusSnapshot {
            uptime,
            total_connections,
            active_connections,
            start_time,
            address,
        }
    }
}

impl StatusSource for ServerStats {
    fn status(&self) -> StatusSnapshot {
        self.snapshot()
    }
}

/// One counted open connection; decrements the active gauge exactly once.
#[derive(Debug)]
pub struct ActiveConnection {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
