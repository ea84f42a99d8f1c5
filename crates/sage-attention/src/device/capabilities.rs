//! Capability table: the active tier plus the kernel families available to
//! serve it.
//!
//! The table is computed once per process by [`Capabilities::global`] and is
//! read-only afterwards. Tests and embedders can build their own table with an
//! injected tier and kernels and hand it to
//! [`SageAttention::new`](crate::dispatch::SageAttention::new).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use candle_core::Device;

use crate::core::errors::{AttentionError, Result};
use crate::device::tier::{HardwareTier, TierProfile};
use crate::kernels::{FusedAttentionKernel, KernelFamily};

/// Environment variable naming the compute capability (`8.9` or `sm89`).
pub const COMPUTE_CAPABILITY_ENV: &str = "SAGEATTN_COMPUTE_CAPABILITY";

/// Source of the hardware tier for a device.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self, device: &Device) -> Result<HardwareTier>;
}

/// Reads the tier from [`COMPUTE_CAPABILITY_ENV`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvProbe;

impl CapabilityProbe for EnvProbe {
    fn probe(&self, device: &Device) -> Result<HardwareTier> {
        match std::env::var(COMPUTE_CAPABILITY_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Err(AttentionError::UnsupportedTier {
                detail: format!(
                    "no compute capability known for {:?}; set {COMPUTE_CAPABILITY_ENV}",
                    device.location()
                ),
            }),
        }
    }
}

/// Always reports the same tier.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub HardwareTier);

impl CapabilityProbe for FixedProbe {
    fn probe(&self, _device: &Device) -> Result<HardwareTier> {
        Ok(self.0)
    }
}

/// Active tier and registered kernel families.
#[derive(Clone)]
pub struct Capabilities {
    tier: HardwareTier,
    kernels: HashMap<KernelFamily, Arc<dyn FusedAttentionKernel>>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kernels: Vec<_> = self
            .kernels
            .iter()
            .map(|(family, kernel)| format!("{family}={}", kernel.name()))
            .collect();
        kernels.sort();
        f.debug_struct("Capabilities")
            .field("tier", &self.tier)
            .field("kernels", &kernels)
            .finish()
    }
}

impl Capabilities {
    /// Table for `tier` with no kernels registered.
    pub fn new(tier: HardwareTier) -> Self {
        Self {
            tier,
            kernels: HashMap::new(),
        }
    }

    /// Probe `device` and register the kernels built into this crate.
    pub fn detect(device: &Device, probe: &dyn CapabilityProbe) -> Result<Self> {
        let tier = probe.probe(device)?;
        Ok(Self::new(tier).with_builtin_kernels())
    }

    /// Register `kernel` as the implementation of `family`.
    pub fn with_kernel(mut self, family: KernelFamily, kernel: Arc<dyn FusedAttentionKernel>) -> Self {
        self.kernels.insert(family, kernel);
        self
    }

    /// Register the host emulation for every family.
    #[cfg(feature = "emulated")]
    pub fn with_builtin_kernels(self) -> Self {
        let kernel: Arc<dyn FusedAttentionKernel> = Arc::new(crate::kernels::EmulatedKernel::new());
        KernelFamily::ALL
            .into_iter()
            .fold(self, |caps, family| caps.with_kernel(family, Arc::clone(&kernel)))
    }

    #[cfg(not(feature = "emulated"))]
    pub fn with_builtin_kernels(self) -> Self {
        self
    }

    pub fn tier(&self) -> HardwareTier {
        self.tier
    }

    pub fn profile(&self) -> &'static TierProfile {
        self.tier.profile()
    }

    /// Kernel serving `family`, or [`AttentionError::KernelUnavailable`].
    pub fn kernel(&self, family: KernelFamily) -> Result<&Arc<dyn FusedAttentionKernel>> {
        self.kernels
            .get(&family)
            .ok_or(AttentionError::KernelUnavailable { family })
    }

    /// Process-wide table, detected through [`EnvProbe`] on first use.
    ///
    /// Only the first caller's `device` is probed; the stored table is
    /// returned for every later device. Concurrent first calls may each
    /// probe; the first stored table wins and every caller sees it.
    pub fn global(device: &Device) -> Result<Arc<Capabilities>> {
        static GLOBAL: OnceLock<Arc<Capabilities>> = OnceLock::new();
        if let Some(caps) = GLOBAL.get() {
            return Ok(Arc::clone(caps));
        }
        let detected = Arc::new(Self::detect(device, &EnvProbe)?);
        log::info!(
            "sage_attention capabilities detected tier={} kernels={:?}",
            detected.tier,
            detected
        );
        Ok(Arc::clone(GLOBAL.get_or_init(|| detected)))
    }
}
