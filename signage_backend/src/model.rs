use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pretrained model variant renders an image.
///
/// The set is closed: anything that is not one of the known labels parses to
/// [`ModelKey::Sd15`], the fast default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelKey {
    #[default]
    Sd15,
    Sdxl,
    Leosam,
}

impl ModelKey {
    pub const ALL: [ModelKey; 3] = [ModelKey::Sd15, ModelKey::Sdxl, ModelKey::Leosam];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKey::Sd15 => "sd15",
            ModelKey::Sdxl => "sdxl",
            ModelKey::Leosam => "leosam",
        }
    }

    /// Exact, case-sensitive match against the known labels.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }

    pub fn parse_or_default(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_default()
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute device identifiers a request may name explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
    Mps,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
            Device::Mps => "mps",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cuda" => Some(Device::Cuda),
            "cpu" => Some(Device::Cpu),
            "mps" => Some(Device::Mps),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
