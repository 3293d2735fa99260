use std::io;
use std::mem;

/// A thin wrapper over `cpu_set_t`, pinning the calling thread (one vCPU
/// thread per instance, the way the embedding hypervisor structures its
/// vCPU loop) to a fixed set of host CPUs.
#[derive(Clone, Copy)]
pub struct CpuSet(libc::cpu_set_t);

impl CpuSet {
    pub fn new() -> Self {
        // SAFETY: `cpu_set_t` is a plain-old-data bitmap; zero-initializing
        // it and then only ever touching it through the CPU_* macros below
        // keeps it in a valid state throughout.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        Self(set)
    }

    pub fn add(&mut self, cpu: usize) {
        unsafe { libc::CPU_SET(cpu, &mut self.0) };
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Pins the calling thread to `set` via `sched_setaffinity`.
pub fn apply_vcpu_affinity(set: &CpuSet) -> io::Result<()> {
    // SAFETY: `&set.0` is a valid, fully-initialized `cpu_set_t` of the size
    // we pass; pid 0 means "the calling thread".
    let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set.0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_does_not_panic_to_build() {
        let set = CpuSet::new();
        let _ = set;
    }
}
