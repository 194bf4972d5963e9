//! Chained fixups (`LC_DYLD_CHAINED_FIXUPS`): an on-disk linked list of
//! fixup locations where each pointer-sized word encodes both its
//! resolution and the stride to the next fixup in the chain.

use std::ops::ControlFlow;

use crate::diagnostics::LoadError;
use crate::mach_o::analyzer::SliceInfo;
use crate::mach_o::read_u32;

/// Marker in a page_start table for pages with no fixups.
pub const CHAIN_PAGE_START_NONE: u16 = 0xFFFF;

const IMPORTS_FORMAT_CHAINED: u32 = 1;

/// Pointer-authentication key selectors on arm64e.
pub const PTRAUTH_KEY_NAMES: [&str; 4] = ["IA", "IB", "DA", "DB"];

/// One 64-bit on-disk chained pointer, decoded. The union is selected by
/// the top two bits: bit 63 = auth, bit 62 = bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPtr {
    /// 51-bit sign-extendable vmaddr-like target.
    Rebase { target: u64 },
    /// 16-bit ordinal into the imports table, 19-bit signed addend.
    Bind { ordinal: u16, addend: i64 },
    /// 32-bit offset target plus signing diversity.
    AuthRebase { target: u32, diversity: u16, addr_div: bool, key: u8 },
    AuthBind { ordinal: u16, diversity: u16, addr_div: bool, key: u8 },
}

impl ChainedPtr {
    pub fn decode(raw: u64) -> Self {
        let auth = raw >> 63 != 0;
        let bind = (raw >> 62) & 1 != 0;
        match (auth, bind) {
            (false, false) => {
                // sign extend the 51-bit target
                let target = (((raw & 0x0007_FFFF_FFFF_FFFF) as i64) << 13 >> 13) as u64;
                Self::Rebase { target }
            }
            (false, true) => {
                let ordinal = (raw & 0xFFFF) as u16;
                // 19-bit signed addend at bit 32
                let addend = ((raw >> 32) & 0x7FFFF) as i64;
                let addend = (addend << 45) >> 45;
                Self::Bind { ordinal, addend }
            }
            (true, false) => Self::AuthRebase {
                target: (raw & 0xFFFF_FFFF) as u32,
                diversity: ((raw >> 32) & 0xFFFF) as u16,
                addr_div: (raw >> 48) & 1 != 0,
                key: ((raw >> 49) & 0x3) as u8,
            },
            (true, true) => Self::AuthBind {
                ordinal: (raw & 0xFFFF) as u16,
                diversity: ((raw >> 32) & 0xFFFF) as u16,
                addr_div: (raw >> 48) & 1 != 0,
                key: ((raw >> 49) & 0x3) as u8,
            },
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::AuthBind { .. })
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::AuthRebase { .. } | Self::AuthBind { .. })
    }
}

/// Stride to the next fixup, in pointer units. Zero ends the chain.
pub fn next_stride(raw: u64) -> u64 {
    (raw >> 51) & 0x7FF
}

/// The plain-rebase target of a raw chained pointer, for callers that
/// read pointer sections (e.g. initializer lists) before fixup.
pub fn plain_rebase_target(raw: u64) -> u64 {
    match ChainedPtr::decode(raw) {
        ChainedPtr::Rebase { target } => target,
        ChainedPtr::AuthRebase { target, .. } => target as u64,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct ChainedImport<'a> {
    pub lib_ordinal: i64,
    pub weak_import: bool,
    pub symbol_name: &'a str,
}

/// Parsed `dyld_chained_fixups_header` plus its starts and imports.
#[derive(Debug, Clone)]
pub struct ChainedFixups<'a> {
    pub pointer_format: u16,
    pub page_size: u16,
    /// Chain start locations as vm offsets from the image base.
    pub starts: Vec<u64>,
    pub imports: Vec<ChainedImport<'a>>,
}

impl<'a> ChainedFixups<'a> {
    /// Parses the linkedit blob. Layout:
    /// `dyld_chained_fixups_header`, then per-segment
    /// `dyld_chained_starts_in_segment` tables, an imports array and a
    /// symbol string pool.
    pub fn parse(blob: &'a [u8], info: &SliceInfo) -> Result<Self, LoadError> {
        const SITE: &str = "chained fixups";
        let fixups_version = read_u32(blob, 0, SITE)?;
        if fixups_version != 0 {
            return Err(LoadError::malformed(SITE, "unknown fixups_version"));
        }
        let starts_offset = read_u32(blob, 4, SITE)? as usize;
        let imports_offset = read_u32(blob, 8, SITE)? as usize;
        let symbols_offset = read_u32(blob, 12, SITE)? as usize;
        let imports_count = read_u32(blob, 16, SITE)? as usize;
        let imports_format = read_u32(blob, 20, SITE)?;
        if imports_format != IMPORTS_FORMAT_CHAINED {
            return Err(LoadError::malformed(SITE, "unsupported imports format"));
        }

        // dyld_chained_starts_in_image
        let seg_count = read_u32(blob, starts_offset, SITE)? as usize;
        if seg_count > info.segments.len() {
            return Err(LoadError::malformed(SITE, "more chain segments than segments"));
        }
        let mut starts = Vec::new();
        let mut pointer_format = 0u16;
        let mut page_size = 0u16;
        for seg_index in 0..seg_count {
            let entry_off = read_u32(blob, starts_offset + 4 + seg_index * 4, SITE)? as usize;
            if entry_off == 0 {
                continue; // no fixups in this segment
            }
            let seg = starts_offset + entry_off;
            // dyld_chained_starts_in_segment
            let _size = read_u32(blob, seg, SITE)?;
            let this_page_size = read_u16(blob, seg + 4, SITE)?;
            let this_format = read_u16(blob, seg + 6, SITE)?;
            let segment_offset = crate::mach_o::read_u64(blob, seg + 8, SITE)?;
            let page_count = read_u16(blob, seg + 20, SITE)? as usize;
            if pointer_format == 0 {
                pointer_format = this_format;
                page_size = this_page_size;
            } else if pointer_format != this_format {
                return Err(LoadError::malformed(SITE, "mixed pointer formats"));
            }
            let seg_info = &info.segments[seg_index];
            let base = info.preferred_load_address();
            for page in 0..page_count {
                let start = read_u16(blob, seg + 22 + page * 2, SITE)?;
                if start == CHAIN_PAGE_START_NONE {
                    continue;
                }
                let vm_offset =
                    segment_offset + page as u64 * this_page_size as u64 + start as u64;
                // chains never cross out of their segment
                let seg_start = seg_info.vm_addr - base;
                if vm_offset < seg_start || vm_offset >= seg_start + seg_info.vm_size {
                    return Err(LoadError::malformed(SITE, "chain start outside its segment"));
                }
                starts.push(vm_offset);
            }
        }

        // imports: u32 each, lib_ordinal:8 | weak_import:1 | name_offset:23
        let mut imports = Vec::with_capacity(imports_count);
        for i in 0..imports_count {
            let raw = read_u32(blob, imports_offset + i * 4, SITE)?;
            let lib_ordinal = (raw & 0xFF) as u8 as i8 as i64; // sign extend
            let weak_import = (raw >> 8) & 1 != 0;
            let name_off = symbols_offset + (raw >> 9) as usize;
            let name_bytes = blob
                .get(name_off..)
                .ok_or(LoadError::malformed(SITE, "import name outside blob"))?;
            let nul = name_bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or(LoadError::malformed(SITE, "import name not terminated"))?;
            let symbol_name = std::str::from_utf8(&name_bytes[..nul])
                .map_err(|_| LoadError::malformed(SITE, "import name not utf-8"))?;
            imports.push(ChainedImport { lib_ordinal, weak_import, symbol_name });
        }

        Ok(Self { pointer_format, page_size, starts, imports })
    }
}

/// Walks one chain inside the file image, starting at `start_vm_offset`,
/// reporting `(vm_offset, raw, decoded)` for each fixup until the chain
/// ends or `f` breaks. Used at closure-build time; the runtime walks the
/// mapped copy instead.
pub fn walk_chain(
    data: &[u8],
    info: &SliceInfo,
    start_vm_offset: u64,
    f: &mut impl FnMut(u64, u64, ChainedPtr) -> ControlFlow<()>,
) -> Result<ControlFlow<()>, LoadError> {
    const SITE: &str = "chained fixups";
    let base = info.preferred_load_address();
    let mut vm_offset = start_vm_offset;
    loop {
        let seg = info
            .segment_containing(vm_offset)
            .ok_or(LoadError::malformed(SITE, "chain stepped outside segments"))?;
        let seg_vm_start = seg.vm_addr - base;
        let file_offset = (seg.file_offset + (vm_offset - seg_vm_start)) as usize;
        let raw = crate::mach_o::read_u64(data, file_offset, SITE)?;
        let decoded = ChainedPtr::decode(raw);
        if f(vm_offset, raw, decoded).is_break() {
            return Ok(ControlFlow::Break(()));
        }
        let stride = next_stride(raw);
        if stride == 0 {
            return Ok(ControlFlow::Continue(()));
        }
        let next = vm_offset + stride * 8;
        // chains never cross segment boundaries
        if next + 8 > seg_vm_start + seg.vm_size {
            return Err(LoadError::malformed(SITE, "chain crossed segment boundary"));
        }
        vm_offset = next;
    }
}

fn read_u16(bytes: &[u8], offset: usize, site: &'static str) -> Result<u16, LoadError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(LoadError::malformed(site, "truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_o::analyzer::{LinkeditLayout, SegmentInfo};
    use crate::mach_o::{Arch, MachHeader, Platform, MH_DYLIB, MH_MAGIC_64};

    fn raw_rebase(target: u64, next: u64) -> u64 {
        (target & 0x0007_FFFF_FFFF_FFFF) | (next << 51)
    }

    fn raw_bind(ordinal: u16, addend: i64, next: u64) -> u64 {
        (ordinal as u64)
            | (((addend as u64) & 0x7FFFF) << 32)
            | (next << 51)
            | (1u64 << 62)
    }

    #[test]
    fn decode_plain_rebase() {
        let ptr = ChainedPtr::decode(raw_rebase(0x10_0000, 3));
        assert_eq!(ptr, ChainedPtr::Rebase { target: 0x10_0000 });
        assert_eq!(next_stride(raw_rebase(0x10_0000, 3)), 3);
    }

    #[test]
    fn decode_plain_bind_with_negative_addend() {
        let raw = raw_bind(7, -8, 0);
        match ChainedPtr::decode(raw) {
            ChainedPtr::Bind { ordinal, addend } => {
                assert_eq!(ordinal, 7);
                assert_eq!(addend, -8);
            }
            other => panic!("decoded {other:?}"),
        }
        assert_eq!(next_stride(raw), 0);
    }

    #[test]
    fn decode_auth_bind() {
        let raw = (42u64) | (0xBEEFu64 << 32) | (1u64 << 48) | (2u64 << 49) | (1u64 << 62) | (1u64 << 63);
        match ChainedPtr::decode(raw) {
            ChainedPtr::AuthBind { ordinal, diversity, addr_div, key } => {
                assert_eq!(ordinal, 42);
                assert_eq!(diversity, 0xBEEF);
                assert!(addr_div);
                assert_eq!(key, 2);
                assert_eq!(PTRAUTH_KEY_NAMES[key as usize], "DA");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn auth_bit_selects_auth_layouts() {
        let raw = (0x1000u64) | (1u64 << 63);
        assert!(matches!(
            ChainedPtr::decode(raw),
            ChainedPtr::AuthRebase { target: 0x1000, .. }
        ));
    }

    fn two_segment_info() -> crate::mach_o::analyzer::SliceInfo {
        crate::mach_o::analyzer::SliceInfo {
            header: MachHeader {
                magic: MH_MAGIC_64,
                cpu_type: crate::mach_o::CPU_TYPE_X86_64,
                cpu_subtype: 3,
                file_type: MH_DYLIB,
                ncmds: 0,
                sizeofcmds: 0,
                flags: 0,
            },
            arch: Arch::X86_64,
            platform: Platform::MacOS,
            sdk_version: 0,
            install_name: None,
            uuid: None,
            segments: vec![
                SegmentInfo {
                    index: 0,
                    name: "__TEXT".into(),
                    file_offset: 0,
                    file_size: 0x1000,
                    vm_addr: 0,
                    vm_size: 0x1000,
                    init_prot: 5,
                    max_prot: 5,
                    flags: 0,
                },
                SegmentInfo {
                    index: 1,
                    name: "__DATA".into(),
                    file_offset: 0x1000,
                    file_size: 0x1000,
                    vm_addr: 0x1000,
                    vm_size: 0x1000,
                    init_prot: 3,
                    max_prot: 3,
                    flags: 0,
                },
            ],
            sections: vec![],
            dependents: vec![],
            rpaths: vec![],
            linkedit: LinkeditLayout::default(),
            entry: None,
            encryption: None,
            dylib_compat_version: None,
            dylib_current_version: None,
        }
    }

    #[test]
    fn parses_header_starts_and_imports() {
        let mut blob = Vec::new();
        blob.extend(0u32.to_le_bytes()); // fixups_version
        blob.extend(28u32.to_le_bytes()); // starts_offset
        blob.extend(64u32.to_le_bytes()); // imports_offset
        blob.extend(68u32.to_le_bytes()); // symbols_offset
        blob.extend(1u32.to_le_bytes()); // imports_count
        blob.extend(1u32.to_le_bytes()); // imports_format
        blob.extend(0u32.to_le_bytes()); // symbols_format
        // starts_in_image: __TEXT has no chains, __DATA entry at +12
        blob.extend(2u32.to_le_bytes());
        blob.extend(0u32.to_le_bytes());
        blob.extend(12u32.to_le_bytes());
        // starts_in_segment for __DATA
        blob.extend(24u32.to_le_bytes()); // size
        blob.extend(0x1000u16.to_le_bytes()); // page_size
        blob.extend(2u16.to_le_bytes()); // pointer format
        blob.extend(0x1000u64.to_le_bytes()); // segment_offset
        blob.extend(0u32.to_le_bytes()); // max_valid_pointer
        blob.extend(1u16.to_le_bytes()); // page_count
        blob.extend(0x10u16.to_le_bytes()); // page_start[0]
        // one import: ordinal 1, not weak, name offset 0
        blob.extend(1u32.to_le_bytes());
        blob.extend(b"_sym\0");

        let info = two_segment_info();
        let fixups = ChainedFixups::parse(&blob, &info).unwrap();
        assert_eq!(fixups.pointer_format, 2);
        assert_eq!(fixups.page_size, 0x1000);
        assert_eq!(fixups.starts, vec![0x1010]);
        assert_eq!(fixups.imports.len(), 1);
        assert_eq!(fixups.imports[0].lib_ordinal, 1);
        assert!(!fixups.imports[0].weak_import);
        assert_eq!(fixups.imports[0].symbol_name, "_sym");
    }

    #[test]
    fn chain_start_outside_segment_is_rejected() {
        let mut blob = Vec::new();
        blob.extend(0u32.to_le_bytes());
        blob.extend(28u32.to_le_bytes());
        blob.extend(64u32.to_le_bytes());
        blob.extend(64u32.to_le_bytes());
        blob.extend(0u32.to_le_bytes());
        blob.extend(1u32.to_le_bytes());
        blob.extend(0u32.to_le_bytes());
        blob.extend(2u32.to_le_bytes());
        blob.extend(0u32.to_le_bytes());
        blob.extend(12u32.to_le_bytes());
        blob.extend(24u32.to_le_bytes());
        blob.extend(0x1000u16.to_le_bytes());
        blob.extend(2u16.to_le_bytes());
        blob.extend(0x3000u64.to_le_bytes()); // past __DATA
        blob.extend(0u32.to_le_bytes());
        blob.extend(1u16.to_le_bytes());
        blob.extend(0u16.to_le_bytes());

        let info = two_segment_info();
        assert!(ChainedFixups::parse(&blob, &info).is_err());
    }
}
