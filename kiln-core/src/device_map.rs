/// Which GPU the model is placed on. There is no CPU variant: generation
/// refuses to start without a compatible accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    /// First available backend (CUDA, then Metal) at this ordinal.
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
