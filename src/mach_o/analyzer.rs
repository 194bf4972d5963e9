//! Slice-level analysis of a mach-o file: header and load command
//! validation, segment/section/dependent extraction, linkedit layout, and
//! the entry points the fixup decoders hang off of.

use crate::diagnostics::{DylibVersion, LoadError};
use crate::mach_o::{
    self, export_trie, leb, opcodes, Arch, LinkKind, LoadCommandsIter, MachHeader, Platform,
    RawLoadCommand,
};

/// A named file range inside `__LINKEDIT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkeditRange {
    pub file_offset: u32,
    pub size: u32,
}

impl LinkeditRange {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> u64 {
        self.file_offset as u64 + self.size as u64
    }
}

/// Where each linkedit table lives, gathered from `LC_DYLD_INFO`,
/// `LC_SYMTAB` and friends.
#[derive(Debug, Clone, Default)]
pub struct LinkeditLayout {
    pub rebase_opcodes: LinkeditRange,
    pub bind_opcodes: LinkeditRange,
    pub weak_bind_opcodes: LinkeditRange,
    pub lazy_bind_opcodes: LinkeditRange,
    pub export_trie: LinkeditRange,
    pub chained_fixups: LinkeditRange,
    pub function_starts: LinkeditRange,
    pub data_in_code: LinkeditRange,
    pub split_seg_info: LinkeditRange,
    pub code_signature: LinkeditRange,
    pub symbol_table: LinkeditRange, // nlist array
    pub string_pool: LinkeditRange,
    pub local_relocs: LinkeditRange,
    pub extern_relocs: LinkeditRange,
    pub indirect_symbol_table: LinkeditRange,
    pub has_dyld_info: bool,
    pub symbol_count: u32,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub index: u32,
    pub name: String,
    pub file_offset: u64,
    pub file_size: u64,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub init_prot: u8,
    pub max_prot: u8,
    pub flags: u32,
}

impl SegmentInfo {
    pub fn readable(&self) -> bool {
        self.init_prot & mach_o::VM_PROT_READ != 0
    }
    pub fn writable(&self) -> bool {
        self.init_prot & mach_o::VM_PROT_WRITE != 0
    }
    pub fn executable(&self) -> bool {
        self.init_prot & mach_o::VM_PROT_EXECUTE != 0
    }
}

#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub segment_index: u32,
    pub segment_name: String,
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub file_offset: u32,
    pub flags: u32,
}

impl SectionInfo {
    pub fn section_type(&self) -> u32 {
        self.flags & mach_o::SECTION_TYPE_MASK
    }
}

#[derive(Debug, Clone)]
pub struct DependentDylib {
    pub path: String,
    pub kind: LinkKind,
    pub compat_version: DylibVersion,
    pub current_version: DylibVersion,
}

/// How control reaches the program: `LC_MAIN` records an offset into
/// `__TEXT`; `LC_UNIXTHREAD` (crt1.o era) records the initial pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Main { text_offset: u64 },
    Start { text_offset: u64 },
}

/// FairPlay-encrypted range of `__TEXT`, from `LC_ENCRYPTION_INFO[_64]`.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionRange {
    pub text_offset: u32,
    pub size: u32,
}

/// Everything parse_slice learns about a mach-o slice. Owns no file bytes,
/// so loaders can keep one per image and re-borrow the mapping on demand.
#[derive(Debug, Clone)]
pub struct SliceInfo {
    pub header: MachHeader,
    pub arch: Arch,
    pub platform: Platform,
    /// Packed X.Y.Z SDK version the slice was linked against; drives the
    /// validator relaxations for pre-10.14 binaries.
    pub sdk_version: u32,
    pub install_name: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub segments: Vec<SegmentInfo>,
    pub sections: Vec<SectionInfo>,
    pub dependents: Vec<DependentDylib>,
    pub rpaths: Vec<String>,
    pub linkedit: LinkeditLayout,
    pub entry: Option<EntryPoint>,
    pub encryption: Option<EncryptionRange>,
    pub dylib_compat_version: Option<DylibVersion>,
    pub dylib_current_version: Option<DylibVersion>,
}

impl SliceInfo {
    pub fn is_64(&self) -> bool {
        self.header.is_64()
    }

    pub fn pointer_size(&self) -> u64 {
        self.arch.pointer_size()
    }

    pub fn is_main_executable(&self) -> bool {
        self.header.file_type == mach_o::MH_EXECUTE
    }

    pub fn is_dylib(&self) -> bool {
        self.header.file_type == mach_o::MH_DYLIB
    }

    pub fn is_bundle(&self) -> bool {
        self.header.file_type == mach_o::MH_BUNDLE
    }

    pub fn has_weak_defs(&self) -> bool {
        self.header.flags & (mach_o::MH_WEAK_DEFINES | mach_o::MH_BINDS_TO_WEAK) != 0
    }

    pub fn exports_weak_defs(&self) -> bool {
        self.header.flags & mach_o::MH_WEAK_DEFINES != 0
    }

    pub fn is_pie(&self) -> bool {
        self.header.flags & mach_o::MH_PIE != 0
    }

    pub fn uses_dyld(&self) -> bool {
        self.header.flags & mach_o::MH_DYLDLINK != 0
    }

    pub fn uses_chained_fixups(&self) -> bool {
        !self.linkedit.chained_fixups.is_empty()
    }

    /// vmaddr of `__TEXT`; the slide is the delta between this and the
    /// runtime base.
    pub fn preferred_load_address(&self) -> u64 {
        self.segments
            .iter()
            .find(|s| s.name == "__TEXT")
            .map(|s| s.vm_addr)
            .unwrap_or(0)
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Total contiguous VM span to reserve when mapping this image.
    pub fn vm_size_to_map(&self) -> u64 {
        let base = self.preferred_load_address();
        self.segments
            .iter()
            .map(|s| (s.vm_addr - base) + s.vm_size)
            .max()
            .unwrap_or(0)
    }

    /// The segment containing the given offset-from-__TEXT, if any.
    pub fn segment_containing(&self, vm_offset: u64) -> Option<&SegmentInfo> {
        let base = self.preferred_load_address();
        self.segments.iter().find(|s| {
            let start = s.vm_addr - base;
            vm_offset >= start && vm_offset < start + s.vm_size
        })
    }

    pub fn has_objc(&self) -> bool {
        self.sections
            .iter()
            .any(|s| s.name == "__objc_imageinfo")
            || self.segments.iter().any(|s| s.name == "__OBJC")
    }

    /// +load methods come from non-lazy class/category lists.
    pub fn may_have_plus_loads(&self) -> bool {
        self.sections
            .iter()
            .any(|s| s.name == "__objc_nlclslist" || s.name == "__objc_nlcatlist")
    }

    pub fn has_thread_local_variables(&self) -> bool {
        self.header.flags & mach_o::MH_HAS_TLV_DESCRIPTORS != 0
    }

    /// The `__DATA,__interpose` section, if any.
    pub fn interpose_section(&self) -> Option<&SectionInfo> {
        self.sections
            .iter()
            .find(|s| s.name == "__interpose" && s.segment_name.starts_with("__DATA"))
    }

    pub fn dof_section_offsets(&self) -> Vec<u32> {
        let base = self.preferred_load_address();
        self.sections
            .iter()
            .filter(|s| s.section_type() == mach_o::S_DTRACE_DOF)
            .map(|s| (s.addr - base) as u32)
            .collect()
    }
}

/// A parsed slice plus the bytes backing it.
#[derive(Clone, Copy)]
pub struct MachOAnalyzer<'a> {
    pub data: &'a [u8],
    pub info: &'a SliceInfo,
}

/// Locates the slice for `arch` inside `bytes`, which may be a thin
/// mach-o or a fat file. Fat headers are big-endian; slices must be
/// 4KiB-aligned.
pub fn find_slice(bytes: &[u8], arch: Arch, path: &str) -> Result<(u64, u64), LoadError> {
    if bytes.len() < 8 {
        return Err(LoadError::NotMachO { path: path.into() });
    }
    let be_magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if be_magic != mach_o::FAT_MAGIC && be_magic != mach_o::FAT_MAGIC_64 {
        let le_magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if le_magic == mach_o::MH_MAGIC || le_magic == mach_o::MH_MAGIC_64 {
            return Ok((0, bytes.len() as u64));
        }
        return Err(LoadError::NotMachO { path: path.into() });
    }

    let is64 = be_magic == mach_o::FAT_MAGIC_64;
    let entry_size = if is64 { 32 } else { 20 };
    let nfat = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if nfat > 64 || bytes.len() < 8 + nfat * entry_size {
        return Err(LoadError::malformed("fat header", "bad slice count"));
    }
    let read_be32 = |off: usize| -> u32 {
        u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    };
    for i in 0..nfat {
        let entry = 8 + i * entry_size;
        let cpu_type = read_be32(entry) as i32;
        let cpu_subtype = read_be32(entry + 4) as i32;
        let (offset, size) = if is64 {
            let hi = read_be32(entry + 8) as u64;
            let lo = read_be32(entry + 12) as u64;
            let shi = read_be32(entry + 16) as u64;
            let slo = read_be32(entry + 20) as u64;
            ((hi << 32) | lo, (shi << 32) | slo)
        } else {
            (read_be32(entry + 8) as u64, read_be32(entry + 12) as u64)
        };
        if arch.compatible_with(cpu_type, cpu_subtype) {
            if offset % mach_o::PAGE_SIZE_4K != 0 {
                return Err(LoadError::malformed("fat header", "slice is not 4KB aligned"));
            }
            if offset.checked_add(size).is_none_or(|end| end > bytes.len() as u64) {
                return Err(LoadError::malformed("fat header", "slice extends past file"));
            }
            return Ok((offset, size));
        }
    }
    Err(LoadError::WrongArch { path: path.into() })
}

impl SliceInfo {
    /// Validates magic, cpu type/subtype, file type and platform, then
    /// walks the load commands collecting everything the builder and
    /// loader need. `bytes` must be a thin slice (see [`find_slice`]).
    pub fn parse(
        bytes: &[u8],
        arch: Arch,
        required_platform: Option<Platform>,
        path: &str,
    ) -> Result<Self, LoadError> {
        let header = MachHeader::parse(bytes).map_err(|_| LoadError::NotMachO { path: path.into() })?;

        if !arch.compatible_with(header.cpu_type, header.cpu_subtype) {
            return Err(LoadError::WrongArch { path: path.into() });
        }
        match header.file_type {
            mach_o::MH_EXECUTE | mach_o::MH_DYLIB | mach_o::MH_BUNDLE => {}
            _ => {
                return Err(LoadError::malformed(
                    "mach header",
                    format!("unloadable file type {}", header.file_type),
                ));
            }
        }
        if header.file_type == mach_o::MH_EXECUTE && !(header.flags & mach_o::MH_DYLDLINK != 0) {
            return Err(LoadError::StaticExecutable { path: path.into() });
        }

        let cmds_end = header.size() + header.sizeofcmds as usize;
        if cmds_end > bytes.len() {
            return Err(LoadError::malformed(
                "load commands",
                "sizeofcmds larger than file",
            ));
        }

        let mut info = SliceInfo {
            header,
            arch,
            platform: Platform::MacOS,
            sdk_version: 0,
            install_name: None,
            uuid: None,
            segments: Vec::new(),
            sections: Vec::new(),
            dependents: Vec::new(),
            rpaths: Vec::new(),
            linkedit: LinkeditLayout::default(),
            entry: None,
            encryption: None,
            dylib_compat_version: None,
            dylib_current_version: None,
        };

        let mut found_platform = None;
        let cmd_bytes = &bytes[header.size()..cmds_end];
        let mut iter = LoadCommandsIter::new(cmd_bytes, header.ncmds);
        let mut seg_index = 0u32;
        for lc in &mut iter {
            match lc.cmd {
                mach_o::LC_SEGMENT | mach_o::LC_SEGMENT_64 => {
                    info.parse_segment(&lc, seg_index)?;
                    seg_index += 1;
                }
                mach_o::LC_ID_DYLIB => {
                    let name_off = mach_o::read_u32(lc.bytes, 8, "LC_ID_DYLIB")?;
                    info.install_name = Some(lc.string_at(name_off, "LC_ID_DYLIB")?.to_owned());
                    info.dylib_current_version =
                        Some(DylibVersion(mach_o::read_u32(lc.bytes, 16, "LC_ID_DYLIB")?));
                    info.dylib_compat_version =
                        Some(DylibVersion(mach_o::read_u32(lc.bytes, 20, "LC_ID_DYLIB")?));
                }
                mach_o::LC_LOAD_DYLIB
                | mach_o::LC_LOAD_WEAK_DYLIB
                | mach_o::LC_REEXPORT_DYLIB
                | mach_o::LC_LOAD_UPWARD_DYLIB => {
                    let name_off = mach_o::read_u32(lc.bytes, 8, "dylib command")?;
                    info.dependents.push(DependentDylib {
                        path: lc.string_at(name_off, "dylib command")?.to_owned(),
                        kind: LinkKind::from_load_command(lc.cmd).unwrap_or(LinkKind::Regular),
                        current_version: DylibVersion(mach_o::read_u32(lc.bytes, 16, "dylib command")?),
                        compat_version: DylibVersion(mach_o::read_u32(lc.bytes, 20, "dylib command")?),
                    });
                }
                mach_o::LC_RPATH => {
                    let path_off = mach_o::read_u32(lc.bytes, 8, "LC_RPATH")?;
                    info.rpaths
                        .push(lc.string_at(path_off, "LC_RPATH")?.to_owned());
                }
                mach_o::LC_UUID => {
                    let body = lc.body();
                    if body.len() < 16 {
                        return Err(LoadError::malformed("LC_UUID", "truncated"));
                    }
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(&body[..16]);
                    info.uuid = Some(uuid);
                }
                mach_o::LC_DYLD_INFO | mach_o::LC_DYLD_INFO_ONLY => {
                    let r = |i: usize| mach_o::read_u32(lc.bytes, 8 + i * 4, "LC_DYLD_INFO");
                    info.linkedit.rebase_opcodes = LinkeditRange { file_offset: r(0)?, size: r(1)? };
                    info.linkedit.bind_opcodes = LinkeditRange { file_offset: r(2)?, size: r(3)? };
                    info.linkedit.weak_bind_opcodes =
                        LinkeditRange { file_offset: r(4)?, size: r(5)? };
                    info.linkedit.lazy_bind_opcodes =
                        LinkeditRange { file_offset: r(6)?, size: r(7)? };
                    info.linkedit.export_trie = LinkeditRange { file_offset: r(8)?, size: r(9)? };
                    info.linkedit.has_dyld_info = true;
                }
                mach_o::LC_DYLD_CHAINED_FIXUPS => {
                    info.linkedit.chained_fixups = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_DYLD_EXPORTS_TRIE => {
                    info.linkedit.export_trie = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_CODE_SIGNATURE => {
                    info.linkedit.code_signature = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_FUNCTION_STARTS => {
                    info.linkedit.function_starts = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_DATA_IN_CODE => {
                    info.linkedit.data_in_code = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_SEGMENT_SPLIT_INFO => {
                    info.linkedit.split_seg_info = Self::linkedit_data(&lc)?;
                }
                mach_o::LC_SYMTAB => {
                    let symoff = mach_o::read_u32(lc.bytes, 8, "LC_SYMTAB")?;
                    let nsyms = mach_o::read_u32(lc.bytes, 12, "LC_SYMTAB")?;
                    let stroff = mach_o::read_u32(lc.bytes, 16, "LC_SYMTAB")?;
                    let strsize = mach_o::read_u32(lc.bytes, 20, "LC_SYMTAB")?;
                    let nlist_size = if header.is_64() { 16 } else { 12 };
                    info.linkedit.symbol_table = LinkeditRange {
                        file_offset: symoff,
                        size: nsyms.saturating_mul(nlist_size),
                    };
                    info.linkedit.symbol_count = nsyms;
                    info.linkedit.string_pool = LinkeditRange { file_offset: stroff, size: strsize };
                }
                mach_o::LC_DYSYMTAB => {
                    // only the reloc and indirect tables matter here
                    let r = |byte_off: usize| mach_o::read_u32(lc.bytes, byte_off, "LC_DYSYMTAB");
                    let indirectsymoff = r(56)?;
                    let nindirectsyms = r(60)?;
                    let extreloff = r(64)?;
                    let nextrel = r(68)?;
                    let locreloff = r(72)?;
                    let nlocrel = r(76)?;
                    info.linkedit.indirect_symbol_table = LinkeditRange {
                        file_offset: indirectsymoff,
                        size: nindirectsyms.saturating_mul(4),
                    };
                    info.linkedit.extern_relocs =
                        LinkeditRange { file_offset: extreloff, size: nextrel.saturating_mul(8) };
                    info.linkedit.local_relocs =
                        LinkeditRange { file_offset: locreloff, size: nlocrel.saturating_mul(8) };
                }
                mach_o::LC_MAIN => {
                    let entryoff = mach_o::read_u64(lc.bytes, 8, "LC_MAIN")?;
                    info.entry = Some(EntryPoint::Main { text_offset: entryoff });
                }
                mach_o::LC_UNIXTHREAD => {
                    let pc = Self::unixthread_pc(&lc, arch)?;
                    // resolved against __TEXT below once segments are known
                    info.entry = Some(EntryPoint::Start { text_offset: pc });
                }
                mach_o::LC_ENCRYPTION_INFO | mach_o::LC_ENCRYPTION_INFO_64 => {
                    let cryptoff = mach_o::read_u32(lc.bytes, 8, "LC_ENCRYPTION_INFO")?;
                    let cryptsize = mach_o::read_u32(lc.bytes, 12, "LC_ENCRYPTION_INFO")?;
                    let cryptid = mach_o::read_u32(lc.bytes, 16, "LC_ENCRYPTION_INFO")?;
                    if cryptid != 0 {
                        info.encryption = Some(EncryptionRange {
                            text_offset: cryptoff,
                            size: cryptsize,
                        });
                    }
                }
                mach_o::LC_BUILD_VERSION => {
                    let plat = mach_o::read_u32(lc.bytes, 8, "LC_BUILD_VERSION")?;
                    info.sdk_version = mach_o::read_u32(lc.bytes, 16, "LC_BUILD_VERSION")?;
                    found_platform = Platform::from_raw(plat);
                    if found_platform.is_none() {
                        return Err(LoadError::malformed(
                            "LC_BUILD_VERSION",
                            format!("unknown platform {plat}"),
                        ));
                    }
                }
                mach_o::LC_VERSION_MIN_MACOSX => {
                    found_platform = Some(Platform::MacOS);
                    info.sdk_version = mach_o::read_u32(lc.bytes, 12, "LC_VERSION_MIN")?;
                }
                mach_o::LC_VERSION_MIN_IPHONEOS => {
                    found_platform = Some(Platform::IOS);
                    info.sdk_version = mach_o::read_u32(lc.bytes, 12, "LC_VERSION_MIN")?;
                }
                mach_o::LC_VERSION_MIN_TVOS => {
                    found_platform = Some(Platform::TvOS);
                    info.sdk_version = mach_o::read_u32(lc.bytes, 12, "LC_VERSION_MIN")?;
                }
                mach_o::LC_VERSION_MIN_WATCHOS => {
                    found_platform = Some(Platform::WatchOS);
                    info.sdk_version = mach_o::read_u32(lc.bytes, 12, "LC_VERSION_MIN")?;
                }
                _ => {}
            }
        }
        if let Some(err) = iter.take_error() {
            return Err(err);
        }

        // Resolve LC_UNIXTHREAD's absolute pc to a __TEXT offset
        if let Some(EntryPoint::Start { text_offset }) = info.entry {
            let base = info.preferred_load_address();
            if text_offset < base {
                return Err(LoadError::malformed("LC_UNIXTHREAD", "start pc below __TEXT"));
            }
            info.entry = Some(EntryPoint::Start { text_offset: text_offset - base });
        }

        match (required_platform, found_platform) {
            (_, None) => {
                return Err(LoadError::malformed(
                    "load commands",
                    "no platform load command",
                ));
            }
            (None, Some(p)) => info.platform = p,
            (Some(want), Some(got)) => {
                // Catalyst dylibs load into macOS processes
                let ok = want == got || (want == Platform::MacOS && got == Platform::MacCatalyst);
                if !ok {
                    return Err(LoadError::WrongPlatform { path: path.into() });
                }
                info.platform = got;
            }
        }

        Ok(info)
    }

    fn linkedit_data(lc: &RawLoadCommand<'_>) -> Result<LinkeditRange, LoadError> {
        Ok(LinkeditRange {
            file_offset: mach_o::read_u32(lc.bytes, 8, "linkedit_data_command")?,
            size: mach_o::read_u32(lc.bytes, 12, "linkedit_data_command")?,
        })
    }

    fn parse_segment(&mut self, lc: &RawLoadCommand<'_>, index: u32) -> Result<(), LoadError> {
        let is64 = lc.cmd == mach_o::LC_SEGMENT_64;
        let b = lc.bytes;
        let name_bytes = b
            .get(8..24)
            .ok_or(LoadError::malformed("segment command", "truncated"))?;
        let name = segment_name(name_bytes);
        let (vm_addr, vm_size, file_offset, file_size, prot_off, nsects_off) = if is64 {
            (
                mach_o::read_u64(b, 24, "segment command")?,
                mach_o::read_u64(b, 32, "segment command")?,
                mach_o::read_u64(b, 40, "segment command")?,
                mach_o::read_u64(b, 48, "segment command")?,
                56,
                64,
            )
        } else {
            (
                mach_o::read_u32(b, 24, "segment command")? as u64,
                mach_o::read_u32(b, 28, "segment command")? as u64,
                mach_o::read_u32(b, 32, "segment command")? as u64,
                mach_o::read_u32(b, 36, "segment command")? as u64,
                40,
                48,
            )
        };
        let max_prot = mach_o::read_u32(b, prot_off, "segment command")? as u8;
        let init_prot = mach_o::read_u32(b, prot_off + 4, "segment command")? as u8;
        let nsects = mach_o::read_u32(b, nsects_off, "segment command")?;
        let flags = mach_o::read_u32(b, nsects_off + 4, "segment command")?;

        let sect_size = if is64 { 80 } else { 68 };
        let sects_start = nsects_off + 8;
        if sects_start + nsects as usize * sect_size > b.len() {
            return Err(LoadError::malformed(
                "segment command",
                "sections extend past command",
            ));
        }
        for i in 0..nsects as usize {
            let s = &b[sects_start + i * sect_size..];
            let (addr, size, off_off, flags_off) = if is64 {
                (
                    mach_o::read_u64(s, 32, "section")?,
                    mach_o::read_u64(s, 40, "section")?,
                    48,
                    64,
                )
            } else {
                (
                    mach_o::read_u32(s, 32, "section")? as u64,
                    mach_o::read_u32(s, 36, "section")? as u64,
                    40,
                    56,
                )
            };
            self.sections.push(SectionInfo {
                segment_index: index,
                segment_name: name.clone(),
                name: segment_name(&s[0..16]),
                addr,
                size,
                file_offset: mach_o::read_u32(s, off_off, "section")?,
                flags: mach_o::read_u32(s, flags_off, "section")?,
            });
        }

        self.segments.push(SegmentInfo {
            index,
            name,
            file_offset,
            file_size,
            vm_addr,
            vm_size,
            init_prot,
            max_prot,
            flags,
        });
        Ok(())
    }

    /// Extracts the initial pc from an LC_UNIXTHREAD register dump. The
    /// register layout depends on the flavor, which depends on the arch.
    fn unixthread_pc(lc: &RawLoadCommand<'_>, arch: Arch) -> Result<u64, LoadError> {
        // body: flavor u32, count u32, then the register file
        let regs = 16usize;
        match arch {
            Arch::X86_64 | Arch::X86_64h => {
                // x86_thread_state64: rax..r15 then rip at index 16
                mach_o::read_u64(lc.bytes, regs + 16 * 8, "LC_UNIXTHREAD")
            }
            Arch::Arm64 | Arch::Arm64e => {
                // arm_thread_state64: x0-x28, fp, lr, sp then pc at index 32
                mach_o::read_u64(lc.bytes, regs + 32 * 8, "LC_UNIXTHREAD")
            }
            Arch::X86 => {
                // i386_thread_state: eip at index 10
                Ok(mach_o::read_u32(lc.bytes, regs + 10 * 4, "LC_UNIXTHREAD")? as u64)
            }
        }
    }
}

fn segment_name(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len().min(16));
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

impl<'a> MachOAnalyzer<'a> {
    pub fn new(data: &'a [u8], info: &'a SliceInfo) -> Self {
        Self { data, info }
    }

    /// Parses a thin slice and returns an owned [`SliceInfo`] along with
    /// nothing else; convenience for one-shot callers.
    pub fn parse_slice(
        data: &'a [u8],
        arch: Arch,
        platform: Option<Platform>,
        path: &str,
    ) -> Result<SliceInfo, LoadError> {
        SliceInfo::parse(data, arch, platform, path)
    }

    /// Iterates the raw load commands, re-checking the region bounds the
    /// way the initial parse did.
    pub fn for_each_load_command(
        &self,
        mut f: impl FnMut(RawLoadCommand<'a>) -> std::ops::ControlFlow<()>,
    ) -> Result<(), LoadError> {
        let header = &self.info.header;
        let cmds = self
            .data
            .get(header.size()..header.size() + header.sizeofcmds as usize)
            .ok_or(LoadError::malformed("load commands", "sizeofcmds larger than file"))?;
        let mut iter = LoadCommandsIter::new(cmds, header.ncmds);
        for lc in &mut iter {
            if f(lc).is_break() {
                return Ok(());
            }
        }
        match iter.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn linkedit_bytes(&self, range: LinkeditRange, site: &'static str) -> Result<&'a [u8], LoadError> {
        let start = range.file_offset as usize;
        let end = start + range.size as usize;
        self.data
            .get(start..end)
            .ok_or(LoadError::malformed(site, "linkedit range outside file"))
    }

    /// Decoded rebase locations from the classic opcode stream.
    pub fn for_each_rebase(
        &self,
        mut f: impl FnMut(opcodes::RebaseLocation) -> std::ops::ControlFlow<()>,
    ) -> Result<(), LoadError> {
        let range = self.info.linkedit.rebase_opcodes;
        if range.is_empty() {
            return Ok(());
        }
        let bytes = self.linkedit_bytes(range, "rebase opcodes")?;
        opcodes::for_each_rebase(bytes, self.info, &mut f).map(|_| ())
    }

    /// Decoded binds from the non-lazy, lazy and weak opcode streams, in
    /// that order (matching the order the builder applies them).
    pub fn for_each_bind(
        &self,
        mut f: impl FnMut(opcodes::BindLocation<'_>) -> std::ops::ControlFlow<()>,
    ) -> Result<(), LoadError> {
        for (range, lazy, site) in [
            (self.info.linkedit.bind_opcodes, false, "bind opcodes"),
            (self.info.linkedit.lazy_bind_opcodes, true, "lazy bind opcodes"),
        ] {
            if range.is_empty() {
                continue;
            }
            let bytes = self.linkedit_bytes(range, site)?;
            if opcodes::for_each_bind(bytes, self.info, lazy, &mut f)?.is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// The weak-coalescing bind entries (including strong-override markers).
    pub fn for_each_weak_bind(
        &self,
        mut f: impl FnMut(opcodes::BindLocation<'_>) -> std::ops::ControlFlow<()>,
    ) -> Result<(), LoadError> {
        let range = self.info.linkedit.weak_bind_opcodes;
        if range.is_empty() {
            return Ok(());
        }
        let bytes = self.linkedit_bytes(range, "weak bind opcodes")?;
        opcodes::for_each_bind(bytes, self.info, false, &mut f).map(|_| ())
    }

    /// Walks the export trie for `name`. Returns `None` when the symbol is
    /// not exported here; re-export results must be chased by the caller,
    /// which knows how to map an ordinal to a dependent image.
    pub fn find_exported_symbol(
        &self,
        name: &str,
    ) -> Result<Option<export_trie::ExportedSymbol>, LoadError> {
        let range = self.info.linkedit.export_trie;
        if !range.is_empty() {
            let trie = self.linkedit_bytes(range, "export trie")?;
            return export_trie::find(trie, name);
        }
        // Old binaries without a trie fall back to the symbol table
        self.find_in_symbol_table(name)
    }

    /// Linear nlist search for binaries predating the export trie.
    fn find_in_symbol_table(
        &self,
        name: &str,
    ) -> Result<Option<export_trie::ExportedSymbol>, LoadError> {
        const N_EXT: u8 = 0x01;
        const N_TYPE: u8 = 0x0e;
        const N_SECT: u8 = 0x0e;
        const N_ABS: u8 = 0x02;
        const N_WEAK_DEF: u16 = 0x0080;

        let syms = self.info.linkedit.symbol_table;
        if syms.is_empty() {
            return Ok(None);
        }
        let nlist_bytes = self.linkedit_bytes(syms, "symbol table")?;
        let strings = self.linkedit_bytes(self.info.linkedit.string_pool, "string pool")?;
        let is64 = self.info.is_64();
        let nlist_size = if is64 { 16 } else { 12 };
        for i in 0..self.info.linkedit.symbol_count as usize {
            let n = &nlist_bytes[i * nlist_size..];
            let strx = mach_o::read_u32(n, 0, "nlist")? as usize;
            let n_type = n[4];
            let n_desc = u16::from_le_bytes([n[6], n[7]]);
            if n_type & N_EXT == 0 {
                continue;
            }
            let kind_bits = n_type & N_TYPE;
            if kind_bits != N_SECT && kind_bits != N_ABS {
                continue;
            }
            let sym_name = strings
                .get(strx..)
                .and_then(|t| t.split(|&b| b == 0).next())
                .and_then(|s| std::str::from_utf8(s).ok())
                .unwrap_or("");
            if sym_name != name {
                continue;
            }
            let n_value = if is64 {
                mach_o::read_u64(n, 8, "nlist")?
            } else {
                mach_o::read_u32(n, 8, "nlist")? as u64
            };
            let kind = if kind_bits == N_ABS {
                export_trie::ExportKind::Absolute
            } else {
                export_trie::ExportKind::Regular
            };
            return Ok(Some(export_trie::ExportedSymbol {
                kind,
                value: if kind_bits == N_ABS {
                    n_value
                } else {
                    n_value - self.info.preferred_load_address()
                },
                is_weak_def: n_desc & N_WEAK_DEF != 0,
                re_export: None,
                resolver_offset: None,
            }));
        }
        Ok(None)
    }

    /// Initializer offsets from `__TEXT` in the order their sections
    /// appear. Handles both the modern offset lists and the legacy
    /// pointer-section form.
    pub fn initializer_offsets(&self) -> Result<Vec<u32>, LoadError> {
        let mut out = Vec::new();
        let base = self.info.preferred_load_address();
        let ptr_size = self.info.pointer_size() as usize;
        for sect in &self.info.sections {
            match sect.section_type() {
                mach_o::S_INIT_FUNC_OFFSETS => {
                    let start = sect.file_offset as usize;
                    let bytes = self
                        .data
                        .get(start..start + sect.size as usize)
                        .ok_or(LoadError::malformed("init offsets", "section outside file"))?;
                    for chunk in bytes.chunks_exact(4) {
                        out.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                    }
                }
                mach_o::S_MOD_INIT_FUNC_POINTERS => {
                    let start = sect.file_offset as usize;
                    let bytes = self
                        .data
                        .get(start..start + sect.size as usize)
                        .ok_or(LoadError::malformed("initializers", "section outside file"))?;
                    for chunk in bytes.chunks_exact(ptr_size) {
                        let value = if ptr_size == 8 {
                            u64::from_le_bytes(chunk.try_into().unwrap())
                        } else {
                            u32::from_le_bytes(chunk.try_into().unwrap()) as u64
                        };
                        // Chained-fixup images store the target in the
                        // chain entry rather than a plain vmaddr
                        let value = if self.info.uses_chained_fixups() {
                            crate::mach_o::chained::plain_rebase_target(value)
                        } else {
                            value
                        };
                        if value < base {
                            return Err(LoadError::malformed(
                                "initializers",
                                "initializer below image base",
                            ));
                        }
                        out.push((value - base) as u32);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// Export-trie-declared install name is authoritative for dylibs.
    pub fn install_name(&self) -> Option<&str> {
        self.info.install_name.as_deref()
    }

    pub fn leaf_name(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Reads a ULEB-encoded function-starts table; used by tooling, and kept
/// here because its encoding matches the other linkedit codecs.
pub fn function_starts(analyzer: &MachOAnalyzer<'_>) -> Result<Vec<u64>, LoadError> {
    let range = analyzer.info.linkedit.function_starts;
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = analyzer.linkedit_bytes(range, "function starts")?;
    let mut out = Vec::new();
    let mut offset = 0usize;
    let mut addr = 0u64;
    while offset < bytes.len() {
        if bytes[offset] == 0 {
            break;
        }
        let delta = leb::read_uleb128(bytes, &mut offset, "function starts")?;
        addr += delta;
        out.push(addr);
    }
    Ok(out)
}
