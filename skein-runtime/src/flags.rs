//! Per-fiber runtime flags.

use bitflags::bitflags;

bitflags! {
    /// Flags carried by every fiber and inherited by its children.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuntimeFlags: u32 {
        /// The fiber may be interrupted at checkpoints.
        const INTERRUPTION = 1 << 0;
        /// The fiber yields to the scheduler after its operation budget.
        const COOPERATIVE_YIELDING = 1 << 1;
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        RuntimeFlags::INTERRUPTION | RuntimeFlags::COOPERATIVE_YIELDING
    }
}

impl RuntimeFlags {
    /// Whether interruption is currently enabled.
    pub fn interruptible(self) -> bool {
        self.contains(RuntimeFlags::INTERRUPTION)
    }

    /// Whether the operation budget is enforced.
    pub fn cooperative_yielding(self) -> bool {
        self.contains(RuntimeFlags::COOPERATIVE_YIELDING)
    }
}

/// A change to apply to [`RuntimeFlags`] for the extent of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagsPatch {
    enable: RuntimeFlags,
    disable: RuntimeFlags,
}

impl FlagsPatch {
    /// A patch that turns `flags` on.
    pub fn enable(flags: RuntimeFlags) -> Self {
        Self { enable: flags, disable: RuntimeFlags::empty() }
    }

    /// A patch that turns `flags` off.
    pub fn disable(flags: RuntimeFlags) -> Self {
        Self { enable: RuntimeFlags::empty(), disable: flags }
    }

    /// Combine two patches; `other` wins where they disagree.
    pub fn and(self, other: FlagsPatch) -> Self {
        Self {
            enable: (self.enable - other.disable) | other.enable,
            disable: (self.disable - other.enable) | other.disable,
        }
    }

    /// The patch that moves `INTERRUPTION` back to its state in `flags`.
    pub(crate) fn restore_interruption(flags: RuntimeFlags) -> Self {
        if flags.interruptible() {
            Self::enable(RuntimeFlags::INTERRUPTION)
        } else {
            Self::disable(RuntimeFlags::INTERRUPTION)
        }
    }

    /// Apply the patch.
    pub fn apply(self, flags: RuntimeFlags) -> RuntimeFlags {
        (flags | self.enable) - self.disable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = RuntimeFlags::default();
        assert!(flags.interruptible());
        assert!(flags.cooperative_yielding());
    }

    #[test]
    fn test_patch_apply() {
        let off = FlagsPatch::disable(RuntimeFlags::INTERRUPTION);
        let flags = off.apply(RuntimeFlags::default());
        assert!(!flags.interruptible());
        assert!(flags.cooperative_yielding());

        let on = FlagsPatch::enable(RuntimeFlags::INTERRUPTION);
        assert_eq!(on.apply(flags), RuntimeFlags::default());
        assert_eq!(off.and(on).apply(flags), RuntimeFlags::default());
    }

    #[test]
    fn test_restore_interruption() {
        let masked = RuntimeFlags::COOPERATIVE_YIELDING;
        let patch = FlagsPatch::restore_interruption(RuntimeFlags::default());
        assert!(patch.apply(masked).interruptible());
        let patch = FlagsPatch::restore_interruption(masked);
        assert!(!patch.apply(RuntimeFlags::default()).interruptible());
    }
}
