//! Port assignment across the servers of one process

use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortConflictError {
    #[error("Port {port} for '{server}' is already used by '{holder}'")]
    Claimed {
        server: String,
        port: u16,
        holder: String,
    },
    #[error("Port for '{server}' is out of range (base {base_port} + index {index})")]
    OutOfRange {
        server: String,
        base_port: u16,
        index: usize,
    },
}

/// Claims ports so that no two servers of this process share one
///
/// A server reuses the port from its record when that port is still free.
/// Otherwise it falls back to `base_port + index`, where the index is the
/// server's position in the fleet ordering.
#[derive(Debug, Default)]
pub struct PortAllocator {
    claimed: Mutex<BTreeMap<u16, String>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_port(server: &str, base_port: u16, index: usize) -> Result<u16, PortConflictError> {
        u16::try_from(index)
            .ok()
            .and_then(|i| base_port.checked_add(i))
            .ok_or_else(|| PortConflictError::OutOfRange {
                server: server.to_string(),
                base_port,
                index,
            })
    }

    pub fn assign(
        &self,
        server: &str,
        index: usize,
        base_port: u16,
        previous: Option<u16>,
    ) -> Result<u16, PortConflictError> {
        let mut claimed = self.claimed.lock();

        if let Some(port) = previous {
            match claimed.get(&port) {
                None => {
                    claimed.insert(port, server.to_string());
                    return Ok(port);
                }
                Some(holder) if holder == server => return Ok(port),
                Some(_) => {}
            }
        }

        let port = Self::default_port(server, base_port, index)?;
        match claimed.get(&port) {
            Some(holder) if holder != server => Err(PortConflictError::Claimed {
                server: server.to_string(),
                port,
                holder: holder.clone(),
            }),
            _ => {
                claimed.insert(port, server.to_string());
                Ok(port)
            }
        }
    }

    pub fn release(&self, port: u16) {
        self.claimed.lock().remove(&port);
    }

    pub fn claimed(&self) -> Vec<(u16, String)> {
        self.claimed
            .lock()
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_fleet_uses_base_plus_index() {
        let ports = PortAllocator::new();
        assert_eq!(ports.assign("a", 0, 50051, None).unwrap(), 50051);
        assert_eq!(ports.assign("b", 1, 50051, None).unwrap(), 50052);
        assert_eq!(ports.assign("c", 2, 50051, None).unwrap(), 50053);
    }

    #[test]
    fn test_previous_port_preferred() {
        let ports = PortAllocator::new();
        assert_eq!(ports.assign("a", 0, 50051, Some(50060)).unwrap(), 50060);
        assert_eq!(ports.claimed(), vec![(50060, "a".to_string())]);
    }

    #[test]
    fn test_claimed_previous_falls_back() {
        let ports = PortAllocator::new();
        ports.assign("a", 0, 50051, Some(50052)).unwrap();
        assert_eq!(ports.assign("b", 2, 50051, Some(50052)).unwrap(), 50053);
    }

    #[test]
    fn test_conflict_on_claimed_fallback() {
        let ports = PortAllocator::new();
        ports.assign("a", 0, 50051, Some(50052)).unwrap();
        assert_eq!(
            ports.assign("b", 1, 50051, None),
            Err(PortConflictError::Claimed {
                server: "b".into(),
                port: 50052,
                holder: "a".into()
            })
        );
    }

    #[test]
    fn test_release_and_reassign() {
        let ports = PortAllocator::new();
        ports.assign("a", 0, 50051, None).unwrap();
        ports.release(50051);
        assert_eq!(ports.assign("b", 0, 50051, None).unwrap(), 50051);
        assert_eq!(ports.claimed(), vec![(50051, "b".to_string())]);
    }

    #[test]
    fn test_out_of_range() {
        let ports = PortAllocator::new();
        assert!(matches!(
            ports.assign("z", 10, 65530, None),
            Err(PortConflictError::OutOfRange { .. })
        ));
    }
}
