use crate::GraphmlError;
use std::fmt;
use std::str::FromStr;

/// Unit of bandwidth attributes in the topology file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthUnits {
    /// KiB/s, as written by Shadow
    #[default]
    Shadow,
    /// Kbit/s, as written by ModelNet
    ModelNet,
    /// Explicit KiB/s
    KiB,
    /// Explicit Kbit/s
    Kb,
}

impl BandwidthUnits {
    /// Convert a bandwidth value in these units to Mbit/s
    pub fn to_mbit(self, value: f64) -> f64 {
        match self {
            BandwidthUnits::Shadow | BandwidthUnits::KiB => value * 1024.0 * 8.0 / 1_000_000.0,
            BandwidthUnits::ModelNet | BandwidthUnits::Kb => value * 1000.0 / 1_000_000.0,
        }
    }
}

impl FromStr for BandwidthUnits {
    type Err = GraphmlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shadow" => Ok(BandwidthUnits::Shadow),
            "modelnet" => Ok(BandwidthUnits::ModelNet),
            "KiB" => Ok(BandwidthUnits::KiB),
            "Kb" => Ok(BandwidthUnits::Kb),
            other => Err(GraphmlError::UnknownUnits(other.to_string())),
        }
    }
}

impl fmt::Display for BandwidthUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BandwidthUnits::Shadow => "shadow",
            BandwidthUnits::ModelNet => "modelnet",
            BandwidthUnits::KiB => "KiB",
            BandwidthUnits::Kb => "Kb",
        };
        f.write_str(s)
    }
}
