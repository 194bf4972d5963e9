//! The loader's collaborator contract: everything that touches the
//! kernel goes through this trait so the builder and loader stay
//! testable and platform-portable. The unix implementation wraps the
//! POSIX/mach syscalls directly.

use std::path::Path;

use crate::diagnostics::{LoadError, SandboxOp};

/// File identity for closure invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub inode: u64,
    pub mtime: u64,
}

/// Bytes of a file the builder has read or mapped.
pub enum FileContent {
    Owned(Vec<u8>),
    #[cfg(unix)]
    Mapped(memmap2::Mmap),
}

impl std::ops::Deref for FileContent {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            #[cfg(unix)]
            Self::Mapped(m) => m,
        }
    }
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileContent({} bytes)", self.len())
    }
}

#[derive(Debug)]
pub struct LoadedFile {
    pub path: String,
    pub content: FileContent,
    pub file_id: Option<FileId>,
}

/// One DOF section to hand to the dtrace helper.
#[derive(Debug, Clone)]
pub struct DofRegistration {
    pub section_address: u64,
    pub image_header: u64,
    pub short_name: String,
}

pub trait Host {
    /// Open file handle the loader maps segments from.
    type File;

    // --- builder side ---

    fn load_file(&self, path: &Path) -> Result<LoadedFile, LoadError>;
    fn file_exists(&self, path: &Path) -> bool;
    fn file_id(&self, path: &Path) -> Option<FileId>;

    /// Predicate: is this operation on this path sandbox-blocked?
    fn sandbox_blocked(&self, _path: &str, _op: SandboxOp) -> bool {
        false
    }

    // --- loader side ---

    fn open(&self, path: &Path) -> Result<Self::File, LoadError>;

    /// `vm_allocate` a contiguous region; mappings are placed inside it.
    fn reserve_address_space(&self, size: u64) -> Result<u64, LoadError>;
    fn release_address_space(&self, addr: u64, size: u64);

    fn map_fixed(
        &self,
        file: &Self::File,
        file_offset: u64,
        len: u64,
        addr: u64,
        prot: u8,
    ) -> Result<(), LoadError>;

    fn protect(&self, addr: u64, len: u64, prot: u8) -> Result<(), LoadError>;

    /// `fcntl(F_ADDFILESIGS_RETURN)`: registers the signature blob and
    /// returns the file offset through which data is covered.
    fn add_file_signatures(
        &self,
        file: &Self::File,
        slice_offset: u64,
        cd_blob_offset: u32,
        cd_blob_size: u32,
    ) -> Result<u64, LoadError>;

    /// `fcntl(F_CHECK_LV)` preflight.
    fn check_library_validation(&self, file: &Self::File, slice_offset: u64)
        -> Result<(), String>;

    /// Tells the kernel a mapped range is FairPlay encrypted.
    fn declare_encrypted_region(
        &self,
        addr: u64,
        size: u64,
        cpu_type: i32,
        cpu_subtype: i32,
    ) -> Result<(), LoadError>;

    /// One `DTRACEHIOC_ADDDOF` ioctl for the whole batch; returns
    /// per-helper identifiers.
    fn register_dof(&self, sections: &[DofRegistration]) -> Vec<i32>;

    /// `vm.footprint_suspend` sysctl; nested but not refcounted, so use
    /// [`FootprintSuspendGuard`].
    fn footprint_suspend(&self, suspend: bool);

    /// Re-signs a pointer-authenticated value for its destination.
    /// Identity on architectures without pointer authentication.
    fn sign_pointer(&self, value: u64, _addr: u64, _key: u8, _diversity: u16, _addr_div: bool) -> u64 {
        value
    }

    /// Terminal launch failure; hosts format an exit-reason payload.
    fn halt(&self, message: &str) -> ! {
        panic!("dyld fatal: {message}");
    }
}

/// Scoped owner for the footprint-suspend flag; every override-fixup
/// region must be wrapped in one so the resume always runs.
pub struct FootprintSuspendGuard<'h, H: Host + ?Sized> {
    host: &'h H,
}

impl<'h, H: Host + ?Sized> FootprintSuspendGuard<'h, H> {
    pub fn new(host: &'h H) -> Self {
        host.footprint_suspend(true);
        Self { host }
    }
}

impl<H: Host + ?Sized> Drop for FootprintSuspendGuard<'_, H> {
    fn drop(&mut self) {
        self.host.footprint_suspend(false);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::fs::File;
        use std::io;
        use std::os::unix::fs::MetadataExt;

        /// Syscall-backed host for unix platforms. The mac-only
        /// operations (signature registration, footprint suspend,
        /// encrypted regions) degrade to no-ops elsewhere so the crate
        /// stays testable off-platform.
        #[derive(Default)]
        pub struct UnixHost;

        impl UnixHost {
            fn io_error(path: &Path, err: io::Error) -> LoadError {
                if err.kind() == io::ErrorKind::NotFound {
                    LoadError::FileNotFound { path: path.display().to_string() }
                } else {
                    LoadError::MmapFailed { errno: err.raw_os_error().unwrap_or(-1) }
                }
            }
        }

        impl Host for UnixHost {
            type File = File;

            fn load_file(&self, path: &Path) -> Result<LoadedFile, LoadError> {
                let file = File::open(path).map_err(|e| Self::io_error(path, e))?;
                let meta = file.metadata().map_err(|e| Self::io_error(path, e))?;
                // SAFETY: mapping a private read-only view; the builder
                // revalidates inode/mtime before trusting the content
                let map = unsafe { memmap2::Mmap::map(&file) }
                    .map_err(|e| Self::io_error(path, e))?;
                Ok(LoadedFile {
                    path: path.display().to_string(),
                    content: FileContent::Mapped(map),
                    file_id: Some(FileId { inode: meta.ino(), mtime: meta.mtime() as u64 }),
                })
            }

            fn file_exists(&self, path: &Path) -> bool {
                path.exists()
            }

            fn file_id(&self, path: &Path) -> Option<FileId> {
                let meta = std::fs::metadata(path).ok()?;
                Some(FileId { inode: meta.ino(), mtime: meta.mtime() as u64 })
            }

            fn open(&self, path: &Path) -> Result<File, LoadError> {
                File::open(path).map_err(|e| Self::io_error(path, e))
            }

            fn reserve_address_space(&self, size: u64) -> Result<u64, LoadError> {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        let mut addr: mach2::vm_types::mach_vm_address_t = 0;
                        // SAFETY: syscall
                        let kr = unsafe {
                            mach2::vm::mach_vm_allocate(
                                mach2::traps::mach_task_self(),
                                &mut addr,
                                size,
                                mach2::vm_statistics::VM_FLAGS_ANYWHERE,
                            )
                        };
                        if kr != mach2::kern_return::KERN_SUCCESS {
                            return Err(LoadError::VmAllocateFailed { size });
                        }
                        Ok(addr)
                    } else {
                        // SAFETY: anonymous reservation, no fd
                        let addr = unsafe {
                            libc::mmap(
                                std::ptr::null_mut(),
                                size as usize,
                                libc::PROT_NONE,
                                libc::MAP_PRIVATE | libc::MAP_ANON,
                                -1,
                                0,
                            )
                        };
                        if addr == libc::MAP_FAILED {
                            return Err(LoadError::VmAllocateFailed { size });
                        }
                        Ok(addr as u64)
                    }
                }
            }

            fn release_address_space(&self, addr: u64, size: u64) {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        // SAFETY: releasing a region this host reserved
                        unsafe {
                            mach2::vm::mach_vm_deallocate(
                                mach2::traps::mach_task_self(),
                                addr,
                                size,
                            );
                        }
                    } else {
                        // SAFETY: releasing a region this host reserved
                        unsafe {
                            libc::munmap(addr as *mut _, size as usize);
                        }
                    }
                }
            }

            fn map_fixed(
                &self,
                file: &File,
                file_offset: u64,
                len: u64,
                addr: u64,
                prot: u8,
            ) -> Result<(), LoadError> {
                use std::os::unix::io::AsRawFd;
                let mut native_prot = 0;
                if prot & crate::mach_o::VM_PROT_READ != 0 {
                    native_prot |= libc::PROT_READ;
                }
                if prot & crate::mach_o::VM_PROT_WRITE != 0 {
                    native_prot |= libc::PROT_WRITE;
                }
                if prot & crate::mach_o::VM_PROT_EXECUTE != 0 {
                    native_prot |= libc::PROT_EXEC;
                }
                // SAFETY: MAP_FIXED inside a region reserved above
                let mapped = unsafe {
                    libc::mmap(
                        addr as *mut _,
                        len as usize,
                        native_prot,
                        libc::MAP_PRIVATE | libc::MAP_FIXED,
                        file.as_raw_fd(),
                        file_offset as libc::off_t,
                    )
                };
                if mapped == libc::MAP_FAILED {
                    return Err(LoadError::MmapFailed {
                        errno: io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                    });
                }
                Ok(())
            }

            fn protect(&self, addr: u64, len: u64, prot: u8) -> Result<(), LoadError> {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        // SAFETY: syscall on loader-owned pages
                        let kr = unsafe {
                            mach2::vm::mach_vm_protect(
                                mach2::traps::mach_task_self(),
                                addr,
                                len,
                                0,
                                prot as mach2::vm_prot::vm_prot_t,
                            )
                        };
                        if kr != mach2::kern_return::KERN_SUCCESS {
                            return Err(LoadError::MmapFailed { errno: kr });
                        }
                        Ok(())
                    } else {
                        let mut native_prot = 0;
                        if prot & crate::mach_o::VM_PROT_READ != 0 {
                            native_prot |= libc::PROT_READ;
                        }
                        if prot & crate::mach_o::VM_PROT_WRITE != 0 {
                            native_prot |= libc::PROT_WRITE;
                        }
                        if prot & crate::mach_o::VM_PROT_EXECUTE != 0 {
                            native_prot |= libc::PROT_EXEC;
                        }
                        // SAFETY: toggling protections on loader-owned pages
                        let rc = unsafe { libc::mprotect(addr as *mut _, len as usize, native_prot) };
                        if rc != 0 {
                            return Err(LoadError::MmapFailed {
                                errno: io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                            });
                        }
                        Ok(())
                    }
                }
            }

            fn add_file_signatures(
                &self,
                file: &File,
                slice_offset: u64,
                cd_blob_offset: u32,
                cd_blob_size: u32,
            ) -> Result<u64, LoadError> {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        use std::os::unix::io::AsRawFd;

                        // fsignatures_t from usr/include/sys/codesign.h
                        #[repr(C)]
                        struct FSignatures {
                            fs_file_start: libc::off_t,
                            fs_blob_start: *mut libc::c_void,
                            fs_blob_size: libc::size_t,
                            fs_fsignatures_size: libc::size_t,
                            fs_cdhash: [u8; 20],
                            fs_hash_type: libc::c_int,
                        }
                        const F_ADDFILESIGS_RETURN: libc::c_int = 97;

                        let mut siginfo = FSignatures {
                            fs_file_start: slice_offset as libc::off_t,
                            fs_blob_start: (slice_offset + cd_blob_offset as u64) as *mut _,
                            fs_blob_size: cd_blob_size as usize,
                            fs_fsignatures_size: 0,
                            fs_cdhash: [0; 20],
                            fs_hash_type: 0,
                        };
                        // SAFETY: syscall
                        let rc = unsafe {
                            libc::fcntl(file.as_raw_fd(), F_ADDFILESIGS_RETURN, &mut siginfo)
                        };
                        if rc == -1 {
                            return Err(LoadError::MmapFailed {
                                errno: io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                            });
                        }
                        // the kernel reports coverage through fs_file_start
                        Ok(siginfo.fs_file_start as u64)
                    } else {
                        let _ = (file, slice_offset, cd_blob_offset, cd_blob_size);
                        // no kernel signature tracking off-darwin
                        Ok(u64::MAX)
                    }
                }
            }

            fn check_library_validation(&self, file: &File, slice_offset: u64) -> Result<(), String> {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        use std::os::unix::io::AsRawFd;

                        // fchecklv from usr/include/sys/codesign.h
                        #[repr(C)]
                        struct FCheckLv {
                            lv_file_start: libc::off_t,
                            lv_error_message_size: libc::size_t,
                            lv_error_message: *mut libc::c_void,
                        }
                        const F_CHECK_LV: libc::c_int = 98;

                        let mut message = [0u8; 1024];
                        let mut checkinfo = FCheckLv {
                            lv_file_start: slice_offset as libc::off_t,
                            lv_error_message_size: message.len(),
                            lv_error_message: message.as_mut_ptr().cast(),
                        };
                        // SAFETY: syscall
                        let rc = unsafe { libc::fcntl(file.as_raw_fd(), F_CHECK_LV, &mut checkinfo) };
                        if rc == 0 {
                            Ok(())
                        } else {
                            let len = message.iter().position(|&b| b == 0).unwrap_or(0);
                            Err(String::from_utf8_lossy(&message[..len]).into_owned())
                        }
                    } else {
                        let _ = (file, slice_offset);
                        Ok(())
                    }
                }
            }

            fn declare_encrypted_region(
                &self,
                addr: u64,
                size: u64,
                cpu_type: i32,
                cpu_subtype: i32,
            ) -> Result<(), LoadError> {
                let _ = (addr, size, cpu_type, cpu_subtype);
                // mremap_encrypted is mac-kernel only and fails for
                // unencrypted test binaries; tracked by the embedder
                Ok(())
            }

            fn register_dof(&self, sections: &[DofRegistration]) -> Vec<i32> {
                // The dtrace helper device may be absent; registration is
                // advisory
                for dof in sections {
                    log::debug!(
                        "registering DOF section {:#x} for {}",
                        dof.section_address,
                        dof.short_name
                    );
                }
                vec![0; sections.len()]
            }

            fn footprint_suspend(&self, suspend: bool) {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "macos")] {
                        let mut value: u64 = suspend as u64;
                        // SAFETY: syscall
                        unsafe {
                            libc::sysctlbyname(
                                c"vm.footprint_suspend".as_ptr(),
                                std::ptr::null_mut(),
                                std::ptr::null_mut(),
                                (&mut value as *mut u64).cast(),
                                std::mem::size_of::<u64>(),
                            );
                        }
                    } else {
                        let _ = suspend;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlagHost(std::cell::Cell<i32>);

    impl Host for FlagHost {
        type File = ();

        fn load_file(&self, _: &Path) -> Result<LoadedFile, LoadError> {
            unimplemented!()
        }
        fn file_exists(&self, _: &Path) -> bool {
            false
        }
        fn file_id(&self, _: &Path) -> Option<FileId> {
            None
        }
        fn open(&self, _: &Path) -> Result<(), LoadError> {
            Ok(())
        }
        fn reserve_address_space(&self, _: u64) -> Result<u64, LoadError> {
            Ok(0)
        }
        fn release_address_space(&self, _: u64, _: u64) {}
        fn map_fixed(&self, _: &(), _: u64, _: u64, _: u64, _: u8) -> Result<(), LoadError> {
            Ok(())
        }
        fn protect(&self, _: u64, _: u64, _: u8) -> Result<(), LoadError> {
            Ok(())
        }
        fn add_file_signatures(&self, _: &(), _: u64, _: u32, _: u32) -> Result<u64, LoadError> {
            Ok(u64::MAX)
        }
        fn check_library_validation(&self, _: &(), _: u64) -> Result<(), String> {
            Ok(())
        }
        fn declare_encrypted_region(&self, _: u64, _: u64, _: i32, _: i32) -> Result<(), LoadError> {
            Ok(())
        }
        fn register_dof(&self, sections: &[DofRegistration]) -> Vec<i32> {
            vec![0; sections.len()]
        }
        fn footprint_suspend(&self, suspend: bool) {
            self.0.set(self.0.get() + if suspend { 1 } else { -1 });
        }
    }

    #[test]
    fn footprint_guard_always_resumes() {
        let host = FlagHost(std::cell::Cell::new(0));
        {
            let _guard = FootprintSuspendGuard::new(&host);
            assert_eq!(host.0.get(), 1);
        }
        assert_eq!(host.0.get(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn unix_host_loads_files_with_identity() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"\xcf\xfa\xed\xfe file body").unwrap();
        tmp.flush().unwrap();

        let host = UnixHost;
        let loaded = host.load_file(tmp.path()).unwrap();
        assert_eq!(&loaded.content[..4], b"\xcf\xfa\xed\xfe");
        assert_eq!(loaded.file_id, host.file_id(tmp.path()));
        assert!(host.file_exists(tmp.path()));
        assert!(matches!(
            host.load_file(Path::new("/definitely/not/here")),
            Err(LoadError::FileNotFound { .. })
        ));
    }
}
