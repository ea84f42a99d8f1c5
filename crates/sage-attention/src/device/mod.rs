//! Hardware tiers and the per-process capability table.

pub mod capabilities;
pub mod tier;

pub use capabilities::{Capabilities, CapabilityProbe, EnvProbe, FixedProbe};
pub use tier::{HardwareTier, TierProfile, TileShape};
