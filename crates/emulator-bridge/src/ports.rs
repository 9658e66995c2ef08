//! Port Allocation
//!
//! Reserves TCP ports for emulator instances outside the bridge daemon's
//! auto-attach window. A daemon scanning that window attaches to every
//! emulator it finds there, so several daemons running side by side race
//! for the same instance and leave it "offline" for all but one of them.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use emu_harness_core::config::{PortConfig, PortRange};
use emu_harness_core::{HarnessError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Checks whether a port can currently be bound on the host
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Opaque identity of whoever holds a lease (one per lifecycle / build)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LeaseKey(String);

impl LeaseKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// A fresh key nobody else can hold
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ports held by one emulator instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortLease {
    pub key: LeaseKey,
    /// Console port, always even
    pub command_port: u16,
    /// Port the bridge daemon talks to the instance on, `command_port + 1`
    pub bridge_port: u16,
    /// Port of the bridge server dedicated to this instance
    pub bridge_server_port: u16,
    /// Port the emulator reports its console port back on
    pub callback_port: u16,
}

impl PortLease {
    pub fn ports(&self) -> [u16; 4] {
        [
            self.command_port,
            self.bridge_port,
            self.bridge_server_port,
            self.callback_port,
        ]
    }

    /// Bridge serial of the instance listening on these ports
    pub fn serial(&self) -> String {
        format!("emulator-{}", self.command_port)
    }
}

/// Probe that binds the port on loopback and immediately lets it go
pub fn loopback_probe() -> PortProbe {
    Arc::new(|port| TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok())
}

/// Process-wide port bookkeeping, shared by all lifecycles through an `Arc`
pub struct PortAllocator {
    policy: PortConfig,
    registry: Mutex<HashMap<u16, LeaseKey>>,
    probe: PortProbe,
}

impl PortAllocator {
    /// Create an allocator for the given policy
    pub fn new(policy: PortConfig) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            registry: Mutex::new(HashMap::new()),
            probe: loopback_probe(),
        })
    }

    /// Replace the host probe
    pub fn with_probe(mut self, probe: PortProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn policy(&self) -> &PortConfig {
        &self.policy
    }

    /// Reserve the full set of ports one emulator instance needs
    pub fn lease(&self, key: &LeaseKey) -> Result<PortLease> {
        let mut registry = self.registry.lock();

        let block = self.find_block(&registry, self.policy.command_range, 3)?;
        let command_port = if block[0] % 2 == 0 { block[0] } else { block[1] };
        let bridge_port = command_port + 1;
        // the third port of the block only guarantees an even start and is not kept

        let aux = self.find_free(
            &registry,
            self.policy.aux_range,
            2,
            &[command_port, bridge_port],
        )?;

        let lease = PortLease {
            key: key.clone(),
            command_port,
            bridge_port,
            bridge_server_port: aux[0],
            callback_port: aux[1],
        };

        for port in lease.ports() {
            registry.insert(port, key.clone());
        }

        info!(
            "Leased ports for {}: console {}, adb {}, adb server {}, callback {}",
            key, lease.command_port, lease.bridge_port, lease.bridge_server_port, lease.callback_port
        );
        Ok(lease)
    }

    /// Free every port of a lease. Releasing twice is a no-op.
    pub fn release(&self, lease: &PortLease) -> usize {
        let mut registry = self.registry.lock();
        let mut freed = 0;
        for port in lease.ports() {
            if registry.get(&port) == Some(&lease.key) {
                registry.remove(&port);
                freed += 1;
            }
        }
        if freed > 0 {
            debug!("Released {} ports held by {}", freed, lease.key);
        }
        freed
    }

    /// Number of ports currently reserved
    pub fn reserved_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.registry.lock().contains_key(&port)
    }

    fn is_available(&self, registry: &HashMap<u16, LeaseKey>, port: u16) -> bool {
        if self.policy.bridge_window().contains(port) {
            return false;
        }
        !registry.contains_key(&port) && (self.probe)(port)
    }

    fn find_block(
        &self,
        registry: &HashMap<u16, LeaseKey>,
        range: PortRange,
        count: usize,
    ) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut start = range.start as u32;
        let end = range.end as u32;
        while start + count as u32 <= end {
            let taken = (start..start + count as u32)
                .map(|p| p as u16)
                .find(|p| !self.is_available(registry, *p));
            match taken {
                None => return Ok((start..start + count as u32).map(|p| p as u16).collect()),
                Some(port) => start = port as u32 + 1,
            }
        }

        warn!("No block of {} free ports in {}..{}", count, range.start, range.end);
        Err(HarnessError::AllocationExhausted(format!(
            "no {} consecutive free ports in {}..{}",
            count, range.start, range.end
        )))
    }

    fn find_free(
        &self,
        registry: &HashMap<u16, LeaseKey>,
        range: PortRange,
        count: usize,
        exclude: &[u16],
    ) -> Result<Vec<u16>> {
        let ports: Vec<u16> = (range.start..range.end)
            .filter(|p| !exclude.contains(p) && self.is_available(registry, *p))
            .take(count)
            .collect();

        if ports.len() < count {
            warn!("Only {} of {} ports free in {}..{}", ports.len(), count, range.start, range.end);
            return Err(HarnessError::AllocationExhausted(format!(
                "{} free ports needed in {}..{}, found {}",
                count,
                range.start,
                range.end,
                ports.len()
            )));
        }
        Ok(ports)
    }
}
