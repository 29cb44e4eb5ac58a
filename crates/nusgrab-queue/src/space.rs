//! Free-space queries and in-batch claim accounting.

use std::collections::HashMap;

use nusgrab_io::{Device, StorageLayout};
use tracing::debug;

/// Reports storage capacity per device class. `None` means the device
/// is not mounted or cannot be queried.
pub trait SpaceOracle: Send + Sync {
    fn free_bytes(&self, device: Device) -> Option<u64>;
    fn total_bytes(&self, device: Device) -> Option<u64>;
}

/// Production oracle backed by the platform disk list.
///
/// A device maps to the mounted disk with the longest mount point that
/// is a prefix of the device's root directory.
pub struct SysinfoOracle {
    layout: StorageLayout,
}

impl SysinfoOracle {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    fn query(&self, device: Device, pick: impl Fn(&sysinfo::Disk) -> u64) -> Option<u64> {
        let root = self.layout.root(device);
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let value = disks
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(pick);
        debug!(%device, root = %root.display(), ?value, "disk query");
        value
    }
}

impl SpaceOracle for SysinfoOracle {
    fn free_bytes(&self, device: Device) -> Option<u64> {
        self.query(device, |disk| disk.available_space())
    }

    fn total_bytes(&self, device: Device) -> Option<u64> {
        self.query(device, |disk| disk.total_space())
    }
}

/// Oracle view that subtracts space claimed earlier in the same batch,
/// so later checks stay consistent without re-querying the device.
pub struct SpaceAccountant<'a> {
    oracle: &'a dyn SpaceOracle,
    claims: HashMap<Device, u64>,
}

impl<'a> SpaceAccountant<'a> {
    pub fn new(oracle: &'a dyn SpaceOracle) -> Self {
        Self {
            oracle,
            claims: HashMap::new(),
        }
    }

    pub fn free_bytes(&self, device: Device) -> Option<u64> {
        let claimed = self.claims.get(&device).copied().unwrap_or(0);
        self.oracle
            .free_bytes(device)
            .map(|free| free.saturating_sub(claimed))
    }

    pub fn claim(&mut self, device: Device, bytes: u64) {
        *self.claims.entry(device).or_insert(0) += bytes;
    }
}
