use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Destination device classes for downloads and installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// External USB storage.
    Usb,
    /// Removable SD card.
    Sd,
    /// Internal console storage.
    Mlc,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Usb, Device::Sd, Device::Mlc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Usb => "usb",
            Device::Sd => "sd",
            Device::Mlc => "mlc",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps each device class to the root directory title folders go under.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub usb_root: PathBuf,
    pub sd_root: PathBuf,
    pub mlc_root: PathBuf,
}

impl StorageLayout {
    pub fn root(&self, device: Device) -> &Path {
        match device {
            Device::Usb => &self.usb_root,
            Device::Sd => &self.sd_root,
            Device::Mlc => &self.mlc_root,
        }
    }
}
