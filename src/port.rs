//! Per-port bookkeeping: open/closed state, per-port sequence expectations,
//! and reassembly buffers (`spec.md` §3, §4.3).

use std::collections::HashMap;

/// State tracked for a single logical port.
#[derive(Debug, Clone, Default)]
pub struct PortState {
    pub open_locally: bool,
    pub open_remotely: bool,
    pub next_expected_port_seq: u8,
    pub expected_sub_seq: u8,
    pub reassembly: Vec<u8>,
    pub available_messages: Vec<Vec<u8>>,
}

impl PortState {
    pub fn is_open(&self) -> bool {
        self.open_locally || self.open_remotely
    }

    /// Flush a partial reassembly buffer (port closed mid-reassembly, or a
    /// sub-sequence inconsistency was detected). `spec.md` §4.3, §8.
    pub fn flush_reassembly(&mut self) {
        self.reassembly.clear();
        self.expected_sub_seq = 0;
    }
}

/// Map of `port -> PortState`, plus round-robin bookkeeping for
/// `getNextCompleteMessage` (`spec.md` §4.3).
#[derive(Debug, Default)]
pub struct PortTable {
    ports: HashMap<u8, PortState>,
    round_robin_cursor: u8,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, port: u8) -> &mut PortState {
        self.ports.entry(port).or_default()
    }

    pub fn get(&self, port: u8) -> Option<&PortState> {
        self.ports.get(&port)
    }

    pub fn is_open(&self, port: u8) -> bool {
        self.ports.get(&port).map(PortState::is_open).unwrap_or(false)
    }

    pub fn open_local(&mut self, port: u8) {
        self.entry(port).open_locally = true;
    }

    pub fn open_remote(&mut self, port: u8) {
        self.entry(port).open_remotely = true;
    }

    /// Close the port on the given side; the port is removed from the table
    /// once both sides have closed it.
    pub fn close_local(&mut self, port: u8) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.open_locally = false;
            if !p.is_open() {
                self.ports.remove(&port);
            }
        }
    }

    pub fn close_remote(&mut self, port: u8) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.open_remotely = false;
            if !p.is_open() {
                self.ports.remove(&port);
            }
        }
    }

    pub fn reset(&mut self) {
        self.ports.clear();
        self.round_robin_cursor = 0;
    }

    /// Total number of complete messages queued across all ports, without
    /// consuming any of them.
    pub fn next_complete_message_count(&self) -> usize {
        self.ports.values().map(|p| p.available_messages.len()).sum()
    }

    /// Round-robin pick the next port with at least one available message,
    /// returning `(port, message_bytes)` and removing that message from the
    /// queue.
    pub fn next_complete_message(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut ports: Vec<u8> = self.ports.keys().copied().collect();
        ports.sort_unstable();
        if ports.is_empty() {
            return None;
        }
        let start = self
            .round_robin_cursor
            .checked_add(0)
            .unwrap_or(0);
        let start_idx = ports
            .iter()
            .position(|&p| p >= start)
            .unwrap_or(0);
        for i in 0..ports.len() {
            let idx = (start_idx + i) % ports.len();
            let port = ports[idx];
            if let Some(state) = self.ports.get_mut(&port) {
                if !state.available_messages.is_empty() {
                    let msg = state.available_messages.remove(0);
                    self.round_robin_cursor = port.wrapping_add(1);
                    return Some((port, msg));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_iff_local_or_remote() {
        let mut t = PortTable::new();
        assert!(!t.is_open(3));
        t.open_local(3);
        assert!(t.is_open(3));
        t.close_local(3);
        assert!(!t.is_open(3));
    }

    #[test]
    fn round_robin_across_ports() {
        let mut t = PortTable::new();
        t.entry(1).available_messages.push(b"a".to_vec());
        t.entry(2).available_messages.push(b"b".to_vec());
        let (p1, _) = t.next_complete_message().unwrap();
        let (p2, _) = t.next_complete_message().unwrap();
        assert_ne!(p1, p2);
        assert!(t.next_complete_message().is_none());
    }
}
