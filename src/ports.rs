use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

/// Hands out currently-unused loopback TCP ports within a configured range.
/// A returned port is confirmed free by a bind probe at allocation time;
/// the small window before the engine binds it is tolerated by the probe
/// runner's startup retry.
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    fn is_port_available(port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(_) => false,
        }
    }

    /// Pick a free port, or None when the range is exhausted. Random start
    /// point spreads consecutive jobs across the range so a just-released
    /// port in TIME_WAIT is unlikely to be handed out again immediately.
    pub fn allocate(&self) -> Option<u16> {
        let span = (self.range_end - self.range_start) as u32 + 1;
        let offset = rand::rng().random_range(0..span);

        let mut in_use = self.in_use.lock().expect("port allocator lock poisoned");
        if in_use.len() as u32 >= span {
            return None;
        }

        for i in 0..span {
            let port = self.range_start + ((offset + i) % span) as u16;
            if in_use.contains(&port) {
                continue;
            }
            if Self::is_port_available(port) {
                in_use.insert(port);
                return Some(port);
            }
        }
        None
    }

    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().expect("port allocator lock poisoned");
        if !in_use.remove(&port) {
            log::debug!("Released port {port} that was not tracked as allocated");
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.in_use.lock().expect("port allocator lock poisoned").len()
    }
}
