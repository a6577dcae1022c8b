use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{backend::Backend, probe, Result};

/// Abstraction for platform specific memory handling. The allocator only needs
/// to reserve executable pages at exact addresses, return them back when they
/// are no longer in use and flip write access on them, but it doesn't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Reserves `length` bytes at exactly `address`. Returns `None` if the
    /// range is not available, in which case nothing stays mapped.
    unsafe fn reserve_at(address: usize, length: usize, writable: bool) -> Option<usize>;

    /// Returns `length` bytes starting from `address` to the underlying
    /// kernel. The range is always an entire mapping.
    unsafe fn release(address: usize, length: usize);

    /// Changes write access on the range, which stays readable and executable.
    unsafe fn protect(address: usize, length: usize, writable: bool);

    /// Granularity of reservations in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Reservation granularity. 4096 bytes on most computers, but we only know it
/// at runtime.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll query it once and reuse it afterwards.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Platform::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// [`Backend`] backed by the virtual memory facilities of the operating
/// system: `mmap`, `munmap` and `mprotect` on Unix, `VirtualAlloc`,
/// `VirtualFree` and `VirtualProtect` on Windows. Pages are reserved by
/// probing exact addresses around the hint, see [`probe::search`].
///
/// Build the allocator with [`page_size`] as its granularity, or just use
/// [`crate::BlockAllocator::platform`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformBackend;

impl PlatformBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for PlatformBackend {
    fn reserve_near(
        &mut self,
        hint: usize,
        tolerance: usize,
        num_pages: usize,
        writable: bool,
    ) -> Result<usize> {
        probe::search(hint, tolerance, page_size(), num_pages, |address, length| unsafe {
            Platform::reserve_at(address, length, writable)
        })
    }

    fn release(&mut self, address: usize, length: usize) {
        unsafe { Platform::release(address, length) }
    }

    fn change_protection(&mut self, address: usize, length: usize, writable: bool) {
        unsafe { Platform::protect(address, length, writable) }
    }
}

#[cfg(unix)]
mod unix {
    use std::io;

    use super::{Platform, PlatformSpecificMemory};

    /// Fails instead of replacing whatever is mapped at the requested address.
    /// Kernels without this flag treat the address as a plain hint, so the
    /// result is always checked anyway.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NO_REPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NO_REPLACE: libc::c_int = 0;

    fn protection(writable: bool) -> libc::c_int {
        if writable {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_EXEC
        }
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve_at(address: usize, length: usize, writable: bool) -> Option<usize> {
            // Memory should be private to our process and not mapped to any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | NO_REPLACE;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let hint = address as *mut libc::c_void;
            let pointer = libc::mmap(hint, length, protection(writable), flags, -1, 0);

            if pointer == libc::MAP_FAILED {
                None
            } else if pointer as usize == address {
                Some(address)
            } else {
                // The kernel ignored the hint.
                libc::munmap(pointer, length);
                None
            }
        }

        unsafe fn release(address: usize, length: usize) {
            if libc::munmap(address as *mut libc::c_void, length) != 0 {
                log::warn!(
                    "munmap({address:#x}, {length:#x}) failed: {}",
                    io::Error::last_os_error()
                );
            }
        }

        unsafe fn protect(address: usize, length: usize, writable: bool) {
            let pointer = address as *mut libc::c_void;
            if libc::mprotect(pointer, length, protection(writable)) != 0 {
                log::warn!(
                    "mprotect({address:#x}, {length:#x}, writable: {writable}) failed: {}",
                    io::Error::last_os_error()
                );
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGESIZE) as usize
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};

    fn protection(writable: bool) -> Memory::PAGE_PROTECTION_FLAGS {
        if writable {
            Memory::PAGE_EXECUTE_READWRITE
        } else {
            Memory::PAGE_EXECUTE_READ
        }
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve_at(address: usize, length: usize, writable: bool) -> Option<usize> {
            // Memory has to be reserved first and then committed in order to
            // become usable. We can do both at the same time with one single
            // call. VirtualAlloc fails if anything else lives at `address`.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let requested = address as *const c_void;

            // See the parameters section of the VirtualAlloc docs on
            // learn.microsoft.com for all the options.
            let pointer =
                Memory::VirtualAlloc(Some(requested), length, flags, protection(writable));

            if pointer.is_null() {
                None
            } else if pointer as usize == address {
                Some(address)
            } else {
                // Rounded down to the allocation granularity, not what we asked.
                let _ = Memory::VirtualFree(pointer, 0, Memory::MEM_RELEASE);
                None
            }
        }

        unsafe fn release(address: usize, length: usize) {
            // We can skip decommitting by specifying length of 0 and
            // MEM_RELEASE flag. See the VirtualFree docs for details.
            let pointer = address as *mut c_void;

            if !Memory::VirtualFree(pointer, 0, Memory::MEM_RELEASE).as_bool() {
                log::warn!(
                    "VirtualFree({address:#x}) of {length:#x} bytes failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        unsafe fn protect(address: usize, length: usize, writable: bool) {
            let pointer = address as *const c_void;
            let mut previous = Memory::PAGE_PROTECTION_FLAGS::default();

            let changed =
                Memory::VirtualProtect(pointer, length, protection(writable), &mut previous);

            if !changed.as_bool() {
                log::warn!(
                    "VirtualProtect({address:#x}, {length:#x}, writable: {writable}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        unsafe fn page_size() -> usize {
            // Addresses passed to VirtualAlloc are rounded down to the
            // allocation granularity (usually 64K), not to the page size.
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwAllocationGranularity as usize
        }
    }
}
