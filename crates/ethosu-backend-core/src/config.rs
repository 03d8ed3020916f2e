//! Accelerator variants and per-compilation hardware configuration.

use std::fmt;
use std::str::FromStr;

/// An Ethos-U configuration, identified by product and MAC count.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcceleratorVariant {
    /// Ethos-U55 with 256 MACs per cycle.
    EthosU55_256,
    /// Ethos-U55 with 128 MACs per cycle.
    EthosU55_128,
    /// Ethos-U55 with 64 MACs per cycle.
    EthosU55_64,
    /// Ethos-U55 with 32 MACs per cycle.
    EthosU55_32,
    /// Ethos-U65 with 256 MACs per cycle.
    EthosU65_256,
}

impl AcceleratorVariant {
    /// Every supported variant.
    pub const ALL: [AcceleratorVariant; 5] = [
        Self::EthosU55_256,
        Self::EthosU55_128,
        Self::EthosU55_64,
        Self::EthosU55_32,
        Self::EthosU65_256,
    ];

    /// Canonical identifier, e.g. `"ethos-u55-256"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::EthosU55_256 => "ethos-u55-256",
            Self::EthosU55_128 => "ethos-u55-128",
            Self::EthosU55_64 => "ethos-u55-64",
            Self::EthosU55_32 => "ethos-u55-32",
            Self::EthosU65_256 => "ethos-u65-256",
        }
    }

    /// MACs per cycle.
    pub fn macs(self) -> u32 {
        match self {
            Self::EthosU55_256 | Self::EthosU65_256 => 256,
            Self::EthosU55_128 => 128,
            Self::EthosU55_64 => 64,
            Self::EthosU55_32 => 32,
        }
    }

    /// Size of the shared buffer holding weights and feature-map blocks.
    pub fn shram_bytes(self) -> usize {
        match self {
            Self::EthosU55_32 | Self::EthosU55_64 => 16 * 1024,
            Self::EthosU55_128 => 24 * 1024,
            Self::EthosU55_256 | Self::EthosU65_256 => 48 * 1024,
        }
    }

    /// Output channels produced per OFM block.
    pub fn ofm_block_depth(self) -> usize {
        match self {
            Self::EthosU55_32 | Self::EthosU55_64 => 8,
            Self::EthosU55_128 | Self::EthosU55_256 | Self::EthosU65_256 => 16,
        }
    }

    /// Numeric code used by the program serialization.
    pub fn code(self) -> u8 {
        match self {
            Self::EthosU55_256 => 0,
            Self::EthosU55_128 => 1,
            Self::EthosU55_64 => 2,
            Self::EthosU55_32 => 3,
            Self::EthosU65_256 => 4,
        }
    }
}

impl fmt::Display for AcceleratorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown variant identifier.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown accelerator variant '{0}' (expected one of: ethos-u55-256, ethos-u55-128, ethos-u55-64, ethos-u55-32, ethos-u65-256)")]
pub struct UnknownVariant(pub String);

impl FromStr for AcceleratorVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.name() == lower)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Physical memory area.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryArea {
    Sram,
    Dram,
    Flash,
}

impl MemoryArea {
    pub fn code(self) -> u8 {
        match self {
            Self::Sram => 0,
            Self::Dram => 1,
            Self::Flash => 2,
        }
    }
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sram => "SRAM",
            Self::Dram => "DRAM",
            Self::Flash => "Flash",
        })
    }
}

/// A memory pool available to the compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryPool {
    pub area: MemoryArea,
    /// Capacity in bytes.
    pub capacity: usize,
    /// May hold feature maps.
    pub activations: bool,
    /// May hold the constant blob.
    pub constants: bool,
}

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Hardware configuration for one compilation.
///
/// Pools are listed in placement preference order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareConfig {
    pub variant: AcceleratorVariant,
    pub pools: Vec<MemoryPool>,
}

impl HardwareConfig {
    /// Default memory system for `variant`.
    ///
    /// Ethos-U55 systems keep feature maps in SRAM and constants in Flash.
    /// Ethos-U65 systems prefer SRAM for feature maps and spill to DRAM,
    /// which also holds the constants.
    pub fn for_variant(variant: AcceleratorVariant) -> Self {
        let pools = match variant {
            AcceleratorVariant::EthosU65_256 => vec![
                MemoryPool {
                    area: MemoryArea::Sram,
                    capacity: MIB,
                    activations: true,
                    constants: false,
                },
                MemoryPool {
                    area: MemoryArea::Dram,
                    capacity: 64 * MIB,
                    activations: true,
                    constants: true,
                },
            ],
            _ => {
                let sram = match variant {
                    AcceleratorVariant::EthosU55_32 => 128 * KIB,
                    AcceleratorVariant::EthosU55_64 => 256 * KIB,
                    AcceleratorVariant::EthosU55_128 => 384 * KIB,
                    _ => 512 * KIB,
                };
                vec![
                    MemoryPool {
                        area: MemoryArea::Sram,
                        capacity: sram,
                        activations: true,
                        constants: false,
                    },
                    MemoryPool {
                        area: MemoryArea::Flash,
                        capacity: 8 * MIB,
                        activations: false,
                        constants: true,
                    },
                ]
            }
        };
        Self { variant, pools }
    }

    /// Overrides the capacity of every pool in `area`.
    pub fn with_pool_capacity(mut self, area: MemoryArea, bytes: usize) -> Self {
        for pool in self.pools.iter_mut().filter(|p| p.area == area) {
            pool.capacity = bytes;
        }
        self
    }

    /// Index of the first pool that may hold constants.
    pub fn constants_pool(&self) -> Option<usize> {
        self.pools.iter().position(|p| p.constants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_roundtrip() {
        for v in AcceleratorVariant::ALL {
            assert_eq!(v.name().parse::<AcceleratorVariant>(), Ok(v));
        }
        assert_eq!(
            "Ethos-U55-128".parse::<AcceleratorVariant>(),
            Ok(AcceleratorVariant::EthosU55_128)
        );
        assert!("ethos-u85-512".parse::<AcceleratorVariant>().is_err());
    }

    #[test]
    fn variant_properties() {
        assert_eq!(AcceleratorVariant::EthosU55_32.macs(), 32);
        assert_eq!(AcceleratorVariant::EthosU55_32.ofm_block_depth(), 8);
        assert_eq!(AcceleratorVariant::EthosU65_256.shram_bytes(), 48 * 1024);
    }

    #[test]
    fn default_pools() {
        let u55 = HardwareConfig::for_variant(AcceleratorVariant::EthosU55_256);
        assert_eq!(u55.pools[0].area, MemoryArea::Sram);
        assert_eq!(u55.pools[0].capacity, 512 * 1024);
        assert_eq!(u55.constants_pool(), Some(1));

        let u65 = HardwareConfig::for_variant(AcceleratorVariant::EthosU65_256);
        assert_eq!(u65.pools.len(), 2);
        assert!(u65.pools[1].activations && u65.pools[1].constants);
    }

    #[test]
    fn capacity_override() {
        let cfg = HardwareConfig::for_variant(AcceleratorVariant::EthosU55_64)
            .with_pool_capacity(MemoryArea::Sram, 4096);
        assert_eq!(cfg.pools[0].capacity, 4096);
        assert_eq!(cfg.pools[1].capacity, 8 * 1024 * 1024);
    }
}
