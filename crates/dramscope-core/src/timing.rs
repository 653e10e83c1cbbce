//! Timing primitives: cache-line flush, fences, serialized cycle counter,
//! and dead-read-proof loads.
//!
//! Everything the samplers measure goes through the [`MemoryTimer`] trait so
//! the statistical layers can be driven by a deterministic stub in tests.
//! The production implementation is [`TscTimer`] on x86_64; other targets
//! get the coarse [`FallbackTimer`].
//!
//! Contract for all implementations: `timestamp()` deltas are monotone
//! non-decreasing on a single hardware thread, and the sequence
//! `flush(a); fence(); t0; touch(a); fence(); t1` yields `t1 - t0` equal to
//! the uncached load latency plus serialization overhead. Addresses handed
//! to `flush`/`touch` must lie inside a mapping that stays live for the
//! whole probe; the samplers only pass addresses owned by the address pool.

/// Abstract timing facade used by every sampler.
pub trait MemoryTimer {
    /// Evict the cache line holding `addr` from all levels.
    fn flush(&self, addr: usize);

    /// Full memory/speculation fence.
    fn fence(&self);

    /// Serializing read of the cycle counter. Orders with prior memory
    /// operations and is not reordered past subsequent ones.
    fn timestamp(&self) -> u64;

    /// Single byte read from `addr` that the optimizer cannot elide.
    fn touch(&self, addr: usize);
}

// ---------------------------------------------------------------------------
// x86_64 TSC implementation
// ---------------------------------------------------------------------------

/// `rdtscp`/`clflush`-based timer for x86_64.
///
/// `clflushopt` and `rdtscp` availability is probed once at construction;
/// older parts fall back to `clflush` and `lfence; rdtsc`.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct TscTimer {
    has_clflushopt: bool,
    has_rdtscp: bool,
}

#[cfg(target_arch = "x86_64")]
impl TscTimer {
    pub fn new() -> Self {
        Self {
            has_clflushopt: std::arch::is_x86_feature_detected!("clflushopt"),
            has_rdtscp: std::arch::is_x86_feature_detected!("rdtscp"),
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for TscTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Weakly-ordered line flush. Callers must have verified `clflushopt`
/// support.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "clflushopt")]
unsafe fn clflushopt(addr: *mut u8) {
    // SAFETY: caller guarantees the line is inside a live mapping and the
    // CPU supports clflushopt.
    unsafe { core::arch::x86_64::_mm_clflushopt(addr) }
}

#[cfg(target_arch = "x86_64")]
impl MemoryTimer for TscTimer {
    fn flush(&self, addr: usize) {
        if self.has_clflushopt {
            // SAFETY: clflushopt presence was probed in `new`; the sampler
            // only passes addresses inside pool-owned mappings.
            unsafe { clflushopt(addr as *mut u8) }
        } else {
            // SAFETY: clflush is baseline x86_64; same address contract.
            unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8) }
        }
    }

    fn fence(&self) {
        // SAFETY: mfence has no memory-safety preconditions.
        unsafe { core::arch::x86_64::_mm_mfence() }
    }

    fn timestamp(&self) -> u64 {
        if self.has_rdtscp {
            let mut aux = 0u32;
            // SAFETY: rdtscp presence was probed in `new`; it waits for all
            // prior loads. The trailing lfence keeps later instructions from
            // starting early.
            let t = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
            unsafe { core::arch::x86_64::_mm_lfence() };
            t
        } else {
            // SAFETY: rdtsc/lfence are baseline x86_64. lfence on both sides
            // gives the same serialization as rdtscp.
            unsafe {
                core::arch::x86_64::_mm_lfence();
                let t = core::arch::x86_64::_rdtsc();
                core::arch::x86_64::_mm_lfence();
                t
            }
        }
    }

    fn touch(&self, addr: usize) {
        // SAFETY: the sampler only passes addresses inside mappings owned by
        // the address pool for the duration of the probe. read_volatile
        // prevents the compiler from eliding the access.
        let v = unsafe { std::ptr::read_volatile(addr as *const u8) };
        std::hint::black_box(v);
    }
}

// ---------------------------------------------------------------------------
// Portable fallback
// ---------------------------------------------------------------------------

/// Coarse nanosecond timer for non-x86_64 targets and unit tests.
///
/// `flush` is a no-op (no portable line eviction), so latencies read through
/// this timer carry no bank signal; it exists to keep the statistical layers
/// runnable everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackTimer;

impl FallbackTimer {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryTimer for FallbackTimer {
    fn flush(&self, _addr: usize) {}

    fn fence(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn timestamp(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }

    fn touch(&self, addr: usize) {
        // SAFETY: same contract as TscTimer::touch — callers pass addresses
        // inside live mappings only.
        let v = unsafe { std::ptr::read_volatile(addr as *const u8) };
        std::hint::black_box(v);
    }
}

// ---------------------------------------------------------------------------
// CPU pinning
// ---------------------------------------------------------------------------

/// Pin the calling thread to one hardware thread.
///
/// Any context switch or cross-core migration during a sample set ruins the
/// cycle-count signal; the engine calls this once before the first probe
/// when configured with a CPU. No-op off Linux.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    // SAFETY: a zeroed cpu_set_t is a valid empty set; CPU_SET writes only
    // within it. sched_setaffinity(0, ..) targets the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

/// Best-effort hook to stop frequency scaling from smearing the cycle
/// counts: set the pinned CPU's cpufreq governor to `performance` and
/// disable turbo on intel_pstate systems.
///
/// Both sysfs writes need root; failures are reported, not fatal — the run
/// is just noisier without them. No-op off Linux.
#[cfg(target_os = "linux")]
pub fn quiesce_cpu_frequency(cpu: usize) -> std::io::Result<()> {
    let governor = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_governor");
    std::fs::write(governor, "performance")?;

    let no_turbo = "/sys/devices/system/cpu/intel_pstate/no_turbo";
    if std::path::Path::new(no_turbo).exists() {
        std::fs::write(no_turbo, "1")?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn quiesce_cpu_frequency(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_timestamp_is_monotonic() {
        let t = FallbackTimer::new();
        let t1 = t.timestamp();
        let t2 = t.timestamp();
        assert!(t2 >= t1);
    }

    #[test]
    fn fallback_touch_reads_live_buffer() {
        let t = FallbackTimer::new();
        let buf = vec![0xA5u8; 64];
        t.flush(buf.as_ptr() as usize);
        t.fence();
        t.touch(buf.as_ptr() as usize);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn tsc_timestamp_is_monotonic() {
        let t = TscTimer::new();
        let t1 = t.timestamp();
        let t2 = t.timestamp();
        assert!(t2 >= t1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn tsc_timed_load_is_positive() {
        let t = TscTimer::new();
        let buf = vec![1u8; 4096];
        let addr = buf.as_ptr() as usize;

        t.flush(addr);
        t.fence();
        let t0 = t.timestamp();
        t.touch(addr);
        t.fence();
        let t1 = t.timestamp();

        assert!(t1 >= t0);
    }
}
