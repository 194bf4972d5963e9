//! Mach-O binary format primitives.
//!
//! Hand-rolled views over the structures in `usr/include/mach-o/loader.h`,
//! plus the variable-length integer codecs the linkedit tables use. The
//! higher level [`analyzer::MachOAnalyzer`] drives everything in here.

pub mod analyzer;
pub mod chained;
pub mod code_sign;
pub mod export_trie;
pub mod leb;
pub mod opcodes;
pub mod validate;

use scroll::Pread;

use crate::diagnostics::LoadError;

// usr/include/mach-o/loader.h, magic numbers for MachHeader
pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
// usr/include/mach-o/fat.h, big-endian on disk
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;

// usr/include/mach-o/loader.h, mach_header filetype values
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_BUNDLE: u32 = 0x8;

// usr/include/mach-o/loader.h, mach_header flags we care about
pub const MH_PIE: u32 = 0x0020_0000;
pub const MH_DYLDLINK: u32 = 0x4;
pub const MH_WEAK_DEFINES: u32 = 0x8000;
pub const MH_BINDS_TO_WEAK: u32 = 0x0001_0000;
pub const MH_HAS_TLV_DESCRIPTORS: u32 = 0x0080_0000;
pub const MH_APP_EXTENSION_SAFE: u32 = 0x0200_0000;

pub const LC_REQ_DYLD: u32 = 0x8000_0000;

// usr/include/mach-o/loader.h, load command types
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_UNIXTHREAD: u32 = 0x5;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// usr/include/mach-o/loader.h, segment flags
pub const SG_NORELOC: u32 = 0x4;
pub const SG_READ_ONLY: u32 = 0x10;

// usr/include/mach-o/loader.h, section type in the flags field
pub const SECTION_TYPE_MASK: u32 = 0x0000_00ff;
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16;
pub const S_DTRACE_DOF: u32 = 0xf;
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// usr/include/mach/vm_prot.h
pub const VM_PROT_READ: u8 = 0x1;
pub const VM_PROT_WRITE: u8 = 0x2;
pub const VM_PROT_EXECUTE: u8 = 0x4;

// usr/include/mach/machine.h
pub const CPU_TYPE_X86: i32 = 7;
pub const CPU_TYPE_X86_64: i32 = 7 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: i32 = 12;
pub const CPU_TYPE_ARM64: i32 = 12 | CPU_ARCH_ABI64;
pub const CPU_ARCH_ABI64: i32 = 0x0100_0000;
pub const CPU_SUBTYPE_X86_64_ALL: i32 = 3;
pub const CPU_SUBTYPE_X86_64_H: i32 = 8;
pub const CPU_SUBTYPE_ARM64_ALL: i32 = 0;
pub const CPU_SUBTYPE_ARM64E: i32 = 2;
pub const CPU_SUBTYPE_MASK: i32 = 0x00ff_ffff;

/// Page size in the file/vm accounting of closures; mach-o slices inside
/// fat files are aligned to this.
pub const PAGE_SIZE_4K: u64 = 0x1000;
pub const PAGE_SIZE_16K: u64 = 0x4000;

/// The architectures a launch can target. Subtype-capability bits are
/// masked off before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    X86_64h,
    Arm64,
    Arm64e,
}

impl Arch {
    pub fn from_cpu(cpu_type: i32, cpu_subtype: i32) -> Option<Self> {
        match (cpu_type, cpu_subtype & CPU_SUBTYPE_MASK) {
            (CPU_TYPE_X86, _) => Some(Self::X86),
            (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => Some(Self::X86_64h),
            (CPU_TYPE_X86_64, _) => Some(Self::X86_64),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => Some(Self::Arm64e),
            (CPU_TYPE_ARM64, _) => Some(Self::Arm64),
            _ => None,
        }
    }

    pub fn cpu_type(&self) -> i32 {
        match self {
            Self::X86 => CPU_TYPE_X86,
            Self::X86_64 | Self::X86_64h => CPU_TYPE_X86_64,
            Self::Arm64 | Self::Arm64e => CPU_TYPE_ARM64,
        }
    }

    pub fn cpu_subtype(&self) -> i32 {
        match self {
            Self::X86 => 3, // CPU_SUBTYPE_I386_ALL
            Self::X86_64 => CPU_SUBTYPE_X86_64_ALL,
            Self::X86_64h => CPU_SUBTYPE_X86_64_H,
            Self::Arm64 => CPU_SUBTYPE_ARM64_ALL,
            Self::Arm64e => CPU_SUBTYPE_ARM64E,
        }
    }

    pub fn is_64(&self) -> bool {
        !matches!(self, Self::X86)
    }

    pub fn pointer_size(&self) -> u64 {
        if self.is_64() { 8 } else { 4 }
    }

    /// arm64 hardware uses 16KB pages; everything else 4KB.
    pub fn page_size(&self) -> u64 {
        match self {
            Self::Arm64 | Self::Arm64e => PAGE_SIZE_16K,
            _ => PAGE_SIZE_4K,
        }
    }

    pub fn uses_pointer_authentication(&self) -> bool {
        matches!(self, Self::Arm64e)
    }

    /// Whether a slice with the given cpu type/subtype can run on this arch.
    /// An x86_64h machine runs plain x86_64 slices; arm64e runs arm64.
    pub fn compatible_with(&self, cpu_type: i32, cpu_subtype: i32) -> bool {
        let Some(slice) = Arch::from_cpu(cpu_type, cpu_subtype) else {
            return false;
        };
        match (self, slice) {
            (a, b) if *a == b => true,
            (Self::X86_64h, Self::X86_64) => true,
            (Self::Arm64e, Self::Arm64) => true,
            _ => false,
        }
    }
}

/// Platforms from `LC_BUILD_VERSION` (values from loader.h) or inferred
/// from the legacy `LC_VERSION_MIN_*` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    IOS,
    TvOS,
    WatchOS,
    BridgeOS,
    MacCatalyst,
    IOSSimulator,
    TvOSSimulator,
    WatchOSSimulator,
}

impl Platform {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::MacOS),
            2 => Some(Self::IOS),
            3 => Some(Self::TvOS),
            4 => Some(Self::WatchOS),
            5 => Some(Self::BridgeOS),
            6 => Some(Self::MacCatalyst),
            7 => Some(Self::IOSSimulator),
            8 => Some(Self::TvOSSimulator),
            9 => Some(Self::WatchOSSimulator),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> u32 {
        match self {
            Self::MacOS => 1,
            Self::IOS => 2,
            Self::TvOS => 3,
            Self::WatchOS => 4,
            Self::BridgeOS => 5,
            Self::MacCatalyst => 6,
            Self::IOSSimulator => 7,
            Self::TvOSSimulator => 8,
            Self::WatchOSSimulator => 9,
        }
    }

    /// On simulator and macOS platforms the dylibs backing the shared cache
    /// are also expected on disk.
    pub fn dylibs_expected_on_disk(&self) -> bool {
        matches!(
            self,
            Self::MacOS | Self::IOSSimulator | Self::TvOSSimulator | Self::WatchOSSimulator
        )
    }
}

/// How a dependent dylib is linked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Regular = 0,
    Weak = 1,
    Upward = 2,
    ReExport = 3,
}

impl LinkKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0x3 {
            1 => Self::Weak,
            2 => Self::Upward,
            3 => Self::ReExport,
            _ => Self::Regular,
        }
    }

    pub fn from_load_command(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(Self::Regular),
            LC_LOAD_WEAK_DYLIB => Some(Self::Weak),
            LC_REEXPORT_DYLIB => Some(Self::ReExport),
            LC_LOAD_UPWARD_DYLIB => Some(Self::Upward),
            _ => None,
        }
    }
}

// usr/include/mach-o/loader.h
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,        // mach magic number identifier
    pub cpu_type: i32,     // cpu_type_t cpu specifier
    pub cpu_subtype: i32,  // cpu_subtype_t machine specifier
    pub file_type: u32,    // type of file
    pub ncmds: u32,        // number of load commands
    pub sizeofcmds: u32,   // size of all the load commands
    pub flags: u32,
}

impl MachHeader {
    pub fn is_64(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Header size on disk; the 64-bit variant carries a trailing reserved
    /// word.
    pub fn size(&self) -> usize {
        if self.is_64() { 32 } else { 28 }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        let magic: u32 = read_u32(bytes, 0, "mach header")?;
        if magic != MH_MAGIC && magic != MH_MAGIC_64 {
            return Err(LoadError::malformed("mach header", "bad magic"));
        }
        Ok(Self {
            magic,
            cpu_type: read_u32(bytes, 4, "mach header")? as i32,
            cpu_subtype: read_u32(bytes, 8, "mach header")? as i32,
            file_type: read_u32(bytes, 12, "mach header")?,
            ncmds: read_u32(bytes, 16, "mach header")?,
            sizeofcmds: read_u32(bytes, 20, "mach header")?,
            flags: read_u32(bytes, 24, "mach header")?,
        })
    }
}

/// One load command: its type and the full command bytes (including the
/// 8-byte `cmd`/`cmdsize` prefix).
#[derive(Debug, Clone, Copy)]
pub struct RawLoadCommand<'buf> {
    pub cmd: u32,
    pub bytes: &'buf [u8],
}

impl<'buf> RawLoadCommand<'buf> {
    pub fn body(&self) -> &'buf [u8] {
        &self.bytes[8..]
    }

    /// Reads the NUL-terminated string at `offset` from the start of the
    /// command, the layout used by dylib paths and rpaths (`lc_str`).
    pub fn string_at(&self, offset: u32, site: &'static str) -> Result<&'buf str, LoadError> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Err(LoadError::malformed(site, "string offset past command"));
        }
        let tail = &self.bytes[offset..];
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(LoadError::malformed(site, "string not NUL terminated within command"))?;
        std::str::from_utf8(&tail[..nul])
            .map_err(|_| LoadError::malformed(site, "string is not utf-8"))
    }
}

/// Iterates the load command region. Commands vary in size so the cursor
/// advances by each command's `cmdsize` rather than a fixed stride.
pub struct LoadCommandsIter<'buf> {
    buffer: &'buf [u8],
    remaining: u32,
    error: Option<LoadError>,
}

impl<'buf> LoadCommandsIter<'buf> {
    pub fn new(buffer: &'buf [u8], count: u32) -> Self {
        Self {
            buffer,
            remaining: count,
            error: None,
        }
    }

    /// Malformed command regions end iteration early; the error is kept
    /// here for the caller to collect afterwards.
    pub fn take_error(&mut self) -> Option<LoadError> {
        self.error.take()
    }
}

impl<'buf> Iterator for LoadCommandsIter<'buf> {
    type Item = RawLoadCommand<'buf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.error.is_some() {
            return None;
        }
        if self.buffer.len() < 8 {
            self.error = Some(LoadError::malformed(
                "load commands",
                "load commands extend past header region",
            ));
            return None;
        }
        let cmd = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        let cmd_size =
            u32::from_le_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]) as usize;
        if cmd_size < 8 || cmd_size % 4 != 0 {
            self.error = Some(LoadError::malformed(
                "load commands",
                format!("load command {cmd:#x} size {cmd_size} is not a multiple of 4"),
            ));
            return None;
        }
        if cmd_size > self.buffer.len() {
            // The header lied: sizeofcmds was too small or ncmds too large
            self.error = Some(LoadError::malformed(
                "load commands",
                format!("load command {cmd:#x} extends past sizeofcmds"),
            ));
            return None;
        }
        let bytes = &self.buffer[..cmd_size];
        self.buffer = &self.buffer[cmd_size..];
        self.remaining -= 1;
        Some(RawLoadCommand { cmd, bytes })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize, site: &'static str) -> Result<u32, LoadError> {
    bytes
        .pread_with::<u32>(offset, scroll::LE)
        .map_err(|_| LoadError::malformed(site, "truncated"))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize, site: &'static str) -> Result<u64, LoadError> {
    bytes
        .pread_with::<u64>(offset, scroll::LE)
        .map_err(|_| LoadError::malformed(site, "truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(cmd: u32, size: u32) -> Vec<u8> {
        let mut v = vec![0u8; size as usize];
        v[0..4].copy_from_slice(&cmd.to_le_bytes());
        v[4..8].copy_from_slice(&size.to_le_bytes());
        v
    }

    #[test]
    fn iterates_commands_by_cmdsize() {
        let mut buf = cmd(LC_UUID, 24);
        buf.extend(cmd(LC_MAIN, 24));
        let mut it = LoadCommandsIter::new(&buf, 2);
        assert_eq!(it.next().unwrap().cmd, LC_UUID);
        assert_eq!(it.next().unwrap().cmd, LC_MAIN);
        assert!(it.next().is_none());
        assert!(it.take_error().is_none());
    }

    #[test]
    fn rejects_misaligned_command() {
        let buf = cmd(LC_UUID, 22);
        let mut it = LoadCommandsIter::new(&buf, 1);
        assert!(it.next().is_none());
        assert!(matches!(
            it.take_error(),
            Some(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_command_past_region() {
        let buf = cmd(LC_UUID, 64);
        let mut it = LoadCommandsIter::new(&buf[..24], 1);
        assert!(it.next().is_none());
        assert!(it.take_error().is_some());
    }

    #[test]
    fn arch_compatibility() {
        assert!(Arch::Arm64e.compatible_with(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL));
        assert!(!Arch::Arm64.compatible_with(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E));
        assert!(Arch::X86_64h.compatible_with(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL));
        assert!(!Arch::X86_64.compatible_with(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL));
    }
}
