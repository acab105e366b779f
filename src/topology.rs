//! CPU discovery and thread pinning.
//!
//! Only two things are needed from the platform: which logical CPUs this
//! process may run on, and a way to bind the calling thread to one of them.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical processor number as the OS numbers it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuHandle(pub u32);

impl CpuHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// CPUs the current process is allowed to run on.
///
/// Falls back to `0..available_parallelism` where the affinity mask cannot
/// be read.
pub fn list_cpus() -> Vec<CpuHandle> {
    match sys::allowed_cpus() {
        Some(cpus) if !cpus.is_empty() => cpus,
        _ => {
            let n = std::thread::available_parallelism().map_or(1, |n| n.get());
            (0..n as u32).map(CpuHandle).collect()
        }
    }
}

/// Bind the calling thread to `cpu`.
pub fn bind_to_cpu(cpu: CpuHandle) -> Result<()> {
    sys::bind(cpu)
}

#[cfg(target_os = "linux")]
mod sys {
    use super::CpuHandle;
    use crate::error::{Result, StageflowError};

    const MAX_CPUS: usize = libc::CPU_SETSIZE as usize;

    pub fn allowed_cpus() -> Option<Vec<CpuHandle>> {
        // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return None;
            }
            Some(
                (0..MAX_CPUS)
                    .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
                    .map(|cpu| CpuHandle(cpu as u32))
                    .collect(),
            )
        }
    }

    pub fn bind(cpu: CpuHandle) -> Result<()> {
        if cpu.index() >= MAX_CPUS {
            return Err(StageflowError::invalid(format!("{cpu} is out of range")));
        }
        // SAFETY: as above; pid 0 targets the calling thread.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu.index(), &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(StageflowError::Io(std::io::Error::last_os_error())
                .with_context(format!("binding thread to {cpu}")));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::CpuHandle;
    use crate::error::{Result, StageflowError};

    pub fn allowed_cpus() -> Option<Vec<CpuHandle>> {
        None
    }

    pub fn bind(cpu: CpuHandle) -> Result<()> {
        Err(StageflowError::Unsupported(format!(
            "cannot bind to {cpu}: thread affinity is not available on this platform"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_list_cpus_is_not_empty() {
        let cpus = list_cpus();
        assert!(!cpus.is_empty());
        let mut sorted = cpus.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), cpus.len());
    }

    #[test]
    fn test_cpu_handle_display() {
        assert_eq!(CpuHandle(3).to_string(), "cpu3");
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_bind_to_allowed_cpu() {
        let cpu = list_cpus()[0];
        std::thread::spawn(move || bind_to_cpu(cpu))
            .join()
            .unwrap()
            .unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_bind_out_of_range_fails() {
        assert!(bind_to_cpu(CpuHandle(u32::MAX)).is_err());
    }
}
