use thiserror::Error;

/// Failure to pin the calling thread to a core.
#[derive(Debug, Error)]
pub enum AffinityError {
    /// The number of online processors could not be determined.
    #[error("could not determine online processors")]
    NoProcessors,
    /// `sched_setaffinity` refused the request.
    #[error("sched_setaffinity failed for core {core}: {source}")]
    SetAffinity {
        /// Requested core
        core: usize,
        /// Underlying OS error
        source: std::io::Error,
    },
}

/// Returns the number of online processors, if the system reports a positive count.
pub fn online_cpus() -> Option<usize> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 { Some(n as usize) } else { None }
}

/// Pins the calling thread to core `worker % online_cpus()`.
///
/// Returns the core the thread was pinned to.
///
/// # Errors
///
/// Returns [`AffinityError`] if the processor count is unavailable or the kernel rejects the mask.
pub fn pin_current_thread(worker: usize) -> Result<usize, AffinityError> {
    let cpus = online_cpus().ok_or(AffinityError::NoProcessors)?;
    let core = worker % cpus;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(AffinityError::SetAffinity {
                core,
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(core)
}
