//! The launch closure data model: a 4-byte-aligned typed-byte tree
//! describing exactly which images to load, which fixups to apply and
//! which shared-cache locations to patch.

pub mod patterns;
pub mod writer;

use crate::diagnostics::LoadError;
use crate::mach_o::LinkKind;

/// Bumped whenever an attribute's payload semantics change; readers and
/// the libdyld entry vector refuse mismatches.
pub const FORMAT_VERSION: u32 = 10;

pub type ImageNum = u32;

// Image numbers are drawn from disjoint ranges so a 22-bit number can
// name an image in any array without ambiguity.
pub const FIRST_DYLD_CACHE_IMAGE_NUM: ImageNum = 0x0000_0001;
pub const LAST_DYLD_CACHE_IMAGE_NUM: ImageNum = 0x0000_0FFF;
pub const FIRST_OTHER_OS_IMAGE_NUM: ImageNum = 0x0000_1001;
pub const LAST_OTHER_OS_IMAGE_NUM: ImageNum = 0x0000_1FFF;
pub const FIRST_LAUNCH_CLOSURE_IMAGE_NUM: ImageNum = 0x0000_2000;
/// Sentinel dependent for weak-linked dylibs whose file is absent.
pub const MISSING_WEAK_LINKED_IMAGE: ImageNum = 0x0FFF_FFFF;

/// The closed set of record tags. Containers hold further typed-byte
/// records; everything else is a flat attribute payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttrType {
    // containers
    LaunchClosure = 1,
    ImageArray = 2,
    Image = 3,
    DlopenClosure = 4,

    // attributes for Images
    ImageFlags = 7,
    PathWithHash = 8,
    FileInodeAndTime = 9,
    CdHash = 10,
    Uuid = 11,
    MappingInfo = 12,
    DiskSegment = 13,
    CacheSegment = 14,
    Dependents = 15,
    InitOffsets = 16,
    DofOffsets = 17,
    CodeSignLoc = 18,
    FairPlayLoc = 19,
    RebaseFixups = 20,
    BindFixups = 21,
    CachePatchInfo = 22,
    TextFixups = 23,
    ImageOverride = 24,
    InitBefores = 25,
    ChainedFixupsStarts = 26,
    ChainedFixupsTargets = 27,

    // attributes for Closures (launch or dlopen)
    ClosureFlags = 32,
    DyldCacheUuid = 33,
    MissingFiles = 34,
    EnvVar = 35,
    TopImage = 36,
    LibDyldEntry = 37,
    LibSystemNum = 38,
    BootUuid = 39,
    MainEntry = 40,
    StartEntry = 41,
    CacheOverrides = 42,
    InterposeTuples = 43,
}

impl AttrType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::LaunchClosure,
            2 => Self::ImageArray,
            3 => Self::Image,
            4 => Self::DlopenClosure,
            7 => Self::ImageFlags,
            8 => Self::PathWithHash,
            9 => Self::FileInodeAndTime,
            10 => Self::CdHash,
            11 => Self::Uuid,
            12 => Self::MappingInfo,
            13 => Self::DiskSegment,
            14 => Self::CacheSegment,
            15 => Self::Dependents,
            16 => Self::InitOffsets,
            17 => Self::DofOffsets,
            18 => Self::CodeSignLoc,
            19 => Self::FairPlayLoc,
            20 => Self::RebaseFixups,
            21 => Self::BindFixups,
            22 => Self::CachePatchInfo,
            23 => Self::TextFixups,
            24 => Self::ImageOverride,
            25 => Self::InitBefores,
            26 => Self::ChainedFixupsStarts,
            27 => Self::ChainedFixupsTargets,
            32 => Self::ClosureFlags,
            33 => Self::DyldCacheUuid,
            34 => Self::MissingFiles,
            35 => Self::EnvVar,
            36 => Self::TopImage,
            37 => Self::LibDyldEntry,
            38 => Self::LibSystemNum,
            39 => Self::BootUuid,
            40 => Self::MainEntry,
            41 => Self::StartEntry,
            42 => Self::CacheOverrides,
            43 => Self::InterposeTuples,
            _ => return None,
        })
    }
}

/// One record: a 4-byte `(type:8, length:24)` header then `length`
/// payload bytes, padded so the next record is 4-byte aligned.
#[derive(Debug, Clone, Copy)]
pub struct TypedBytes<'a> {
    pub kind: u8,
    pub payload: &'a [u8],
}

pub(crate) fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Walks the records inside a container payload. Unknown tags are
/// skipped so newer writers can append attributes.
pub fn for_each_record<'a>(
    container: &'a [u8],
    f: &mut impl FnMut(TypedBytes<'a>) -> std::ops::ControlFlow<()>,
) -> Result<(), LoadError> {
    let mut offset = 0usize;
    while offset < container.len() {
        let header = container
            .get(offset..offset + 4)
            .ok_or(LoadError::malformed("typed bytes", "truncated record header"))?;
        let word = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let kind = (word & 0xff) as u8;
        let length = (word >> 8) as usize;
        let payload = container
            .get(offset + 4..offset + 4 + length)
            .ok_or(LoadError::malformed("typed bytes", "record payload past container"))?;
        if f(TypedBytes { kind, payload }).is_break() {
            return Ok(());
        }
        offset += 4 + align4(length);
    }
    Ok(())
}

/// First record of the requested type, if present.
pub fn find_record<'a>(container: &'a [u8], wanted: AttrType) -> Option<&'a [u8]> {
    let mut found = None;
    let _ = for_each_record(container, &mut |rec| {
        if rec.kind == wanted as u8 {
            found = Some(rec.payload);
            std::ops::ControlFlow::Break(())
        } else {
            std::ops::ControlFlow::Continue(())
        }
    });
    found
}

/// Where a bind resolves to, packed into 8 bytes with a 2-bit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSymbolTarget {
    /// Slide this image by the runtime load delta.
    Rebase,
    /// Shared-cache base plus offset (62 bits).
    SharedCache { offset: u64 },
    /// Load address of `image_num` (22 bits) plus offset (40 bits).
    Image { image_num: ImageNum, offset: u64 },
    /// Literal value, sign-extended from 62 bits; used for weak-import
    /// NULL and absolute symbols.
    Absolute { value: i64 },
}

impl ResolvedSymbolTarget {
    pub fn to_raw(&self) -> u64 {
        match *self {
            Self::Rebase => 0,
            Self::SharedCache { offset } => 1 | (offset << 2),
            Self::Image { image_num, offset } => {
                2 | ((image_num as u64 & 0x3F_FFFF) << 2) | ((offset & 0xFF_FFFF_FFFF) << 24)
            }
            Self::Absolute { value } => 3 | ((value as u64) << 2),
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        match raw & 0x3 {
            0 => Self::Rebase,
            1 => Self::SharedCache { offset: raw >> 2 },
            2 => Self::Image {
                image_num: ((raw >> 2) & 0x3F_FFFF) as ImageNum,
                offset: raw >> 24,
            },
            _ => Self::Absolute {
                // sign extend from the 62 stored bits
                value: (raw as i64) >> 2,
            },
        }
    }
}

bitflags::bitflags! {
    /// Boolean image attributes; packed above the image number and max
    /// load count in the flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageFlags: u32 {
        const IS_INVALID         = 1 << 0;
        const HAS_16KB_PAGES     = 1 << 1;
        const IS_64              = 1 << 2;
        const HAS_OBJC           = 1 << 3;
        const MAY_HAVE_PLUS_LOADS = 1 << 4;
        const IS_ENCRYPTED       = 1 << 5;
        const HAS_WEAK_DEFS      = 1 << 6;
        const NEVER_UNLOAD       = 1 << 7;
        const CWD_SAME_AS_THIS   = 1 << 8;
        const IS_PLATFORM_BINARY = 1 << 9;
        const IS_BUNDLE          = 1 << 10;
        const IS_DYLIB           = 1 << 11;
        const IS_EXECUTABLE      = 1 << 12;
        const OVERRIDABLE_DYLIB  = 1 << 13;
        const IN_DYLD_CACHE      = 1 << 14;
    }
}

/// The packed image flags word: `image_num:22 | max_load_count:12 |
/// flag bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFlagsWord {
    pub image_num: ImageNum,
    pub max_load_count: u32,
    pub flags: ImageFlags,
}

impl ImageFlagsWord {
    pub fn to_raw(&self) -> u64 {
        (self.image_num as u64 & 0x3F_FFFF)
            | ((self.max_load_count as u64 & 0xFFF) << 22)
            | ((self.flags.bits() as u64) << 34)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            image_num: (raw & 0x3F_FFFF) as ImageNum,
            max_load_count: ((raw >> 22) & 0xFFF) as u32,
            flags: ImageFlags::from_bits_truncate((raw >> 34) as u32),
        }
    }
}

/// One dependent edge: `image_num:30 | kind:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedImage {
    pub kind: LinkKind,
    pub image_num: ImageNum,
}

impl LinkedImage {
    pub fn to_raw(&self) -> u32 {
        (self.image_num & 0x3FFF_FFFF) | ((self.kind as u32) << 30)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            kind: LinkKind::from_raw(raw >> 30),
            image_num: raw & 0x3FFF_FFFF,
        }
    }
}

/// Disk image segment accounting, in pages:
/// `file_page_count:30 | vm_page_count:30 | permissions:3 | padding:1`.
/// Padding records describe gaps for rare images whose segments are not
/// contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSegment {
    pub file_page_count: u32,
    pub vm_page_count: u32,
    pub permissions: u8,
    pub padding_not_seg: bool,
}

impl DiskSegment {
    pub fn to_raw(&self) -> u64 {
        (self.file_page_count as u64 & 0x3FFF_FFFF)
            | ((self.vm_page_count as u64 & 0x3FFF_FFFF) << 30)
            | (((self.permissions & 0x7) as u64) << 60)
            | ((self.padding_not_seg as u64) << 63)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            file_page_count: (raw & 0x3FFF_FFFF) as u32,
            vm_page_count: ((raw >> 30) & 0x3FFF_FFFF) as u32,
            permissions: ((raw >> 60) & 0x7) as u8,
            padding_not_seg: raw >> 63 != 0,
        }
    }
}

/// Cache-resident segment: sub-page sizes are allowed here.
/// `cache_offset:32 | size:28 | permissions:4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSegment {
    pub cache_offset: u32,
    pub size: u32,
    pub permissions: u8,
}

impl CacheSegment {
    pub fn to_raw(&self) -> u64 {
        (self.cache_offset as u64)
            | ((self.size as u64 & 0x0FFF_FFFF) << 32)
            | (((self.permissions & 0xF) as u64) << 60)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            cache_offset: (raw & 0xFFFF_FFFF) as u32,
            size: ((raw >> 32) & 0x0FFF_FFFF) as u32,
            permissions: ((raw >> 60) & 0xF) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub total_vm_pages: u32,
    /// Offset of this mach-o slice within its container file, in 4KiB
    /// units. Zero when the file is (now) thin.
    pub slice_offset_4k: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub inode: u64,
    pub mod_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSignatureLocation {
    pub file_offset: u32,
    pub file_size: u32,
}

/// FairPlay-encrypted range of `__TEXT`, in pages:
/// `text_page_count:28 | text_start_page:4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairPlayRange {
    pub text_page_count: u32,
    pub text_start_page: u32,
}

impl FairPlayRange {
    pub fn to_raw(&self) -> u32 {
        (self.text_page_count & 0x0FFF_FFFF) | (self.text_start_page << 28)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self { text_page_count: raw & 0x0FFF_FFFF, text_start_page: raw >> 28 }
    }
}

/// A shared-cache location to rewrite when an export is overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchEntry {
    pub overridden_dylib_in_cache: ImageNum,
    pub export_cache_offset: u32,
    pub replacement: ResolvedSymbolTarget,
}

/// One use-site of a patchable cache export:
/// `cache_offset:32 | addend:12 | authenticated:1 | addr_div:1 | key:2 |
/// discriminator:16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLocation {
    pub cache_offset: u32,
    pub addend: i64, // +/- 2048
    pub authenticated: bool,
    pub uses_address_diversity: bool,
    pub key: u8,
    pub discriminator: u16,
}

impl PatchLocation {
    pub fn to_raw(&self) -> u64 {
        (self.cache_offset as u64)
            | (((self.addend as u64) & 0xFFF) << 32)
            | ((self.authenticated as u64) << 44)
            | ((self.uses_address_diversity as u64) << 45)
            | (((self.key & 0x3) as u64) << 46)
            | ((self.discriminator as u64) << 48)
    }

    pub fn from_raw(raw: u64) -> Self {
        let addend = ((raw >> 32) & 0xFFF) as i64;
        Self {
            cache_offset: (raw & 0xFFFF_FFFF) as u32,
            addend: (addend << 52) >> 52,
            authenticated: (raw >> 44) & 1 != 0,
            uses_address_diversity: (raw >> 45) & 1 != 0,
            key: ((raw >> 46) & 0x3) as u8,
            discriminator: ((raw >> 48) & 0xFFFF) as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterposingTuple {
    pub stock_implementation: ResolvedSymbolTarget,
    pub new_implementation: ResolvedSymbolTarget,
}

/// Closure-level flags: `used_at_paths:1 | used_fallback_paths:1 |
/// init_image_count:16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosureFlags {
    pub used_at_paths: bool,
    pub used_fallback_paths: bool,
    pub init_image_count: u32,
}

impl ClosureFlags {
    pub fn to_raw(&self) -> u32 {
        (self.used_at_paths as u32)
            | ((self.used_fallback_paths as u32) << 1)
            | ((self.init_image_count & 0xFFFF) << 2)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            used_at_paths: raw & 1 != 0,
            used_fallback_paths: raw & 2 != 0,
            init_image_count: (raw >> 2) & 0xFFFF,
        }
    }
}

/// The string hash stored next to every image path.
pub fn path_hash(path: &str) -> u32 {
    let mut h: u32 = 0;
    for b in path.bytes() {
        h = h.wrapping_mul(5).wrapping_add(b as u32);
    }
    h
}

fn payload_u32(payload: &[u8], index: usize) -> Option<u32> {
    payload
        .get(index * 4..index * 4 + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn payload_u64(payload: &[u8], index: usize) -> Option<u64> {
    payload
        .get(index * 8..index * 8 + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn payload_u32s(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn payload_u64s(payload: &[u8]) -> Vec<u64> {
    payload
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .collect()
}

/// One image's attribute records.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    payload: &'a [u8],
}

impl<'a> Image<'a> {
    pub fn from_payload(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    fn attr(&self, t: AttrType) -> Option<&'a [u8]> {
        find_record(self.payload, t)
    }

    pub fn flags_word(&self) -> Result<ImageFlagsWord, LoadError> {
        self.attr(AttrType::ImageFlags)
            .and_then(|p| payload_u64(p, 0))
            .map(ImageFlagsWord::from_raw)
            .ok_or(LoadError::malformed("image", "missing flags attribute"))
    }

    pub fn image_num(&self) -> Result<ImageNum, LoadError> {
        Ok(self.flags_word()?.image_num)
    }

    pub fn flags(&self) -> ImageFlags {
        self.flags_word().map(|w| w.flags).unwrap_or_default()
    }

    pub fn is_invalid(&self) -> bool {
        self.flags().contains(ImageFlags::IS_INVALID)
    }

    pub fn in_dyld_cache(&self) -> bool {
        self.flags().contains(ImageFlags::IN_DYLD_CACHE)
    }

    pub fn never_unload(&self) -> bool {
        self.flags().contains(ImageFlags::NEVER_UNLOAD)
    }

    pub fn is_executable(&self) -> bool {
        self.flags().contains(ImageFlags::IS_EXECUTABLE)
    }

    pub fn overridable_dylib(&self) -> bool {
        self.flags().contains(ImageFlags::OVERRIDABLE_DYLIB)
    }

    pub fn has_weak_defs(&self) -> bool {
        self.flags().contains(ImageFlags::HAS_WEAK_DEFS)
    }

    pub fn page_size(&self) -> u64 {
        if self.flags().contains(ImageFlags::HAS_16KB_PAGES) {
            crate::mach_o::PAGE_SIZE_16K
        } else {
            crate::mach_o::PAGE_SIZE_4K
        }
    }

    /// The canonical path (first path attribute); later path attributes
    /// are aliases.
    pub fn path(&self) -> Result<&'a str, LoadError> {
        self.attr(AttrType::PathWithHash)
            .and_then(path_from_payload)
            .ok_or(LoadError::malformed("image", "missing path attribute"))
    }

    pub fn leaf_name(&self) -> &'a str {
        self.path()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
            .unwrap_or("")
    }

    pub fn for_each_alias(&self, f: &mut impl FnMut(&'a str)) {
        let mut first = true;
        let _ = for_each_record(self.payload, &mut |rec| {
            if rec.kind == AttrType::PathWithHash as u8 {
                if first {
                    first = false;
                } else if let Some(path) = path_from_payload(rec.payload) {
                    f(path);
                }
            }
            std::ops::ControlFlow::Continue(())
        });
    }

    pub fn has_path_with_hash(&self, path: &str, hash: u32) -> bool {
        let mut found = false;
        let _ = for_each_record(self.payload, &mut |rec| {
            if rec.kind == AttrType::PathWithHash as u8 {
                if let Some(p) = rec.payload.get(0..4) {
                    let h = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                    if h == hash && path_from_payload(rec.payload) == Some(path) {
                        found = true;
                        return std::ops::ControlFlow::Break(());
                    }
                }
            }
            std::ops::ControlFlow::Continue(())
        });
        found
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.attr(AttrType::Uuid)
            .and_then(|p| p.get(0..16))
            .map(|p| p.try_into().unwrap())
    }

    pub fn cd_hash(&self) -> Option<[u8; 20]> {
        self.attr(AttrType::CdHash)
            .and_then(|p| p.get(0..20))
            .map(|p| p.try_into().unwrap())
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        let p = self.attr(AttrType::FileInodeAndTime)?;
        Some(FileInfo {
            inode: payload_u64(p, 0)?,
            mod_time: payload_u64(p, 1)?,
        })
    }

    pub fn mapping_info(&self) -> Option<MappingInfo> {
        let p = self.attr(AttrType::MappingInfo)?;
        Some(MappingInfo {
            total_vm_pages: payload_u32(p, 0)?,
            slice_offset_4k: payload_u32(p, 1)?,
        })
    }

    pub fn vm_size_to_map(&self) -> u64 {
        self.mapping_info()
            .map(|m| m.total_vm_pages as u64 * self.page_size())
            .unwrap_or(0)
    }

    pub fn slice_offset_in_file(&self) -> u64 {
        self.mapping_info()
            .map(|m| m.slice_offset_4k as u64 * crate::mach_o::PAGE_SIZE_4K)
            .unwrap_or(0)
    }

    pub fn disk_segments(&self) -> Vec<DiskSegment> {
        self.attr(AttrType::DiskSegment)
            .map(|p| payload_u64s(p).into_iter().map(DiskSegment::from_raw).collect())
            .unwrap_or_default()
    }

    pub fn cache_segments(&self) -> Vec<CacheSegment> {
        self.attr(AttrType::CacheSegment)
            .map(|p| payload_u64s(p).into_iter().map(CacheSegment::from_raw).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self) -> Vec<LinkedImage> {
        self.attr(AttrType::Dependents)
            .map(|p| payload_u32s(p).into_iter().map(LinkedImage::from_raw).collect())
            .unwrap_or_default()
    }

    pub fn dependent_image_num(&self, dep_index: usize) -> Option<ImageNum> {
        self.dependents().get(dep_index).map(|d| d.image_num)
    }

    pub fn init_offsets(&self) -> Vec<u32> {
        self.attr(AttrType::InitOffsets).map(payload_u32s).unwrap_or_default()
    }

    pub fn has_initializers(&self) -> bool {
        self.attr(AttrType::InitOffsets).is_some_and(|p| !p.is_empty())
    }

    pub fn dof_offsets(&self) -> Vec<u32> {
        self.attr(AttrType::DofOffsets).map(payload_u32s).unwrap_or_default()
    }

    /// Launch-order list of images whose initializers run before this
    /// one's; carried on the top image.
    pub fn init_order(&self) -> Vec<ImageNum> {
        self.attr(AttrType::InitBefores).map(payload_u32s).unwrap_or_default()
    }

    pub fn code_signature_location(&self) -> Option<CodeSignatureLocation> {
        let p = self.attr(AttrType::CodeSignLoc)?;
        Some(CodeSignatureLocation {
            file_offset: payload_u32(p, 0)?,
            file_size: payload_u32(p, 1)?,
        })
    }

    pub fn fairplay_range(&self) -> Option<FairPlayRange> {
        self.attr(AttrType::FairPlayLoc)
            .and_then(|p| payload_u32(p, 0))
            .map(FairPlayRange::from_raw)
    }

    pub fn rebase_patterns(&self) -> Vec<patterns::RebasePattern> {
        self.attr(AttrType::RebaseFixups)
            .map(|p| {
                payload_u32s(p)
                    .into_iter()
                    .map(patterns::RebasePattern::from_raw)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bind_patterns(&self) -> Vec<patterns::BindPattern> {
        self.attr(AttrType::BindFixups)
            .map(|p| {
                payload_u64s(p)
                    .chunks_exact(2)
                    .map(|pair| patterns::BindPattern::from_raw(pair[0], pair[1]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn text_fixup_patterns(&self) -> Vec<patterns::TextFixupPattern> {
        let Some(p) = self.attr(AttrType::TextFixups) else {
            return Vec::new();
        };
        p.chunks_exact(16)
            .map(|c| patterns::TextFixupPattern {
                target: ResolvedSymbolTarget::from_raw(u64::from_le_bytes(
                    c[0..8].try_into().unwrap(),
                )),
                start_vm_offset: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                repeat_count: u16::from_le_bytes(c[12..14].try_into().unwrap()),
                skip_count: u16::from_le_bytes(c[14..16].try_into().unwrap()),
            })
            .collect()
    }

    pub fn chained_starts(&self) -> Vec<u64> {
        self.attr(AttrType::ChainedFixupsStarts).map(payload_u64s).unwrap_or_default()
    }

    pub fn chained_targets(&self) -> Vec<ResolvedSymbolTarget> {
        self.attr(AttrType::ChainedFixupsTargets)
            .map(|p| payload_u64s(p).into_iter().map(ResolvedSymbolTarget::from_raw).collect())
            .unwrap_or_default()
    }

    /// For a dylib root: the cache image this one replaces.
    pub fn override_of_cache_image(&self) -> Option<ImageNum> {
        self.attr(AttrType::ImageOverride).and_then(|p| payload_u32(p, 0))
    }

    /// Patchable exports, present only on cache-resident images.
    pub fn for_each_patchable_export(
        &self,
        f: &mut impl FnMut(u32, &[PatchLocation], &str),
    ) -> Result<(), LoadError> {
        let mut failure = None;
        let _ = for_each_record(self.payload, &mut |rec| {
            if rec.kind != AttrType::CachePatchInfo as u8 {
                return std::ops::ControlFlow::Continue(());
            }
            let p = rec.payload;
            let (Some(impl_off), Some(count)) = (payload_u32(p, 0), payload_u32(p, 1)) else {
                failure = Some(LoadError::malformed("patch info", "truncated header"));
                return std::ops::ControlFlow::Break(());
            };
            let locs_end = 8 + count as usize * 8;
            let Some(loc_bytes) = p.get(8..locs_end) else {
                failure = Some(LoadError::malformed("patch info", "locations past payload"));
                return std::ops::ControlFlow::Break(());
            };
            let locs: Vec<PatchLocation> = loc_bytes
                .chunks_exact(8)
                .map(|c| PatchLocation::from_raw(u64::from_le_bytes(c.try_into().unwrap())))
                .collect();
            let name = p
                .get(locs_end..)
                .and_then(|t| t.split(|&b| b == 0).next())
                .and_then(|s| std::str::from_utf8(s).ok())
                .unwrap_or("");
            f(impl_off, &locs, name);
            std::ops::ControlFlow::Continue(())
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn path_from_payload(payload: &[u8]) -> Option<&str> {
    let bytes = payload.get(4..)?;
    let nul = bytes.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&bytes[..nul]).ok()
}

/// An indexable array of images:
/// `(first_image_num, count, offsets[count])` then the image records.
#[derive(Debug, Clone, Copy)]
pub struct ImageArray<'a> {
    payload: &'a [u8],
    first_image_num: ImageNum,
    count: u32,
}

impl<'a> ImageArray<'a> {
    pub fn from_payload(payload: &'a [u8]) -> Result<Self, LoadError> {
        let first_image_num =
            payload_u32(payload, 0).ok_or(LoadError::malformed("image array", "truncated"))?;
        let count =
            payload_u32(payload, 1).ok_or(LoadError::malformed("image array", "truncated"))?;
        if payload.len() < 8 + count as usize * 4 {
            return Err(LoadError::malformed("image array", "offsets past payload"));
        }
        Ok(Self { payload, first_image_num, count })
    }

    pub fn first_image_num(&self) -> ImageNum {
        self.first_image_num
    }

    pub fn image_count(&self) -> u32 {
        self.count
    }

    /// O(1) lookup by image number within this array's range.
    pub fn image_for_num(&self, num: ImageNum) -> Option<Image<'a>> {
        if num < self.first_image_num || num >= self.first_image_num + self.count {
            return None;
        }
        let index = (num - self.first_image_num) as usize;
        let offset = payload_u32(self.payload, 2 + index)? as usize;
        let header = self.payload.get(offset..offset + 4)?;
        let word = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if (word & 0xff) as u8 != AttrType::Image as u8 {
            return None;
        }
        let length = (word >> 8) as usize;
        self.payload
            .get(offset + 4..offset + 4 + length)
            .map(Image::from_payload)
    }

    pub fn for_each_image(&self, f: &mut impl FnMut(Image<'a>)) {
        for i in 0..self.count {
            if let Some(image) = self.image_for_num(self.first_image_num + i) {
                f(image);
            }
        }
    }

    pub fn has_path(&self, path: &str) -> Option<ImageNum> {
        let hash = path_hash(path);
        for i in 0..self.count {
            let num = self.first_image_num + i;
            if let Some(image) = self.image_for_num(num) {
                if image.has_path_with_hash(path, hash) {
                    return Some(num);
                }
            }
        }
        None
    }
}

/// First-hit-wins search across closure and cache arrays.
pub fn find_image<'a>(arrays: &[ImageArray<'a>], num: ImageNum) -> Option<Image<'a>> {
    arrays.iter().find_map(|a| a.image_for_num(num))
}

/// Common accessors shared by launch and dlopen closures.
#[derive(Debug, Clone, Copy)]
pub struct Closure<'a> {
    payload: &'a [u8],
}

impl<'a> Closure<'a> {
    fn attr(&self, t: AttrType) -> Option<&'a [u8]> {
        find_record(self.payload, t)
    }

    pub fn images(&self) -> Result<ImageArray<'a>, LoadError> {
        let payload = self
            .attr(AttrType::ImageArray)
            .ok_or(LoadError::malformed("closure", "missing image array"))?;
        ImageArray::from_payload(payload)
    }

    pub fn top_image_num(&self) -> Result<ImageNum, LoadError> {
        self.attr(AttrType::TopImage)
            .and_then(|p| payload_u32(p, 0))
            .ok_or(LoadError::malformed("closure", "missing top image"))
    }

    pub fn patch_entries(&self) -> Vec<PatchEntry> {
        let Some(p) = self.attr(AttrType::CacheOverrides) else {
            return Vec::new();
        };
        p.chunks_exact(16)
            .map(|c| PatchEntry {
                overridden_dylib_in_cache: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                export_cache_offset: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                replacement: ResolvedSymbolTarget::from_raw(u64::from_le_bytes(
                    c[8..16].try_into().unwrap(),
                )),
            })
            .collect()
    }

    pub fn interpose_tuples(&self) -> Vec<InterposingTuple> {
        let Some(p) = self.attr(AttrType::InterposeTuples) else {
            return Vec::new();
        };
        p.chunks_exact(16)
            .map(|c| InterposingTuple {
                stock_implementation: ResolvedSymbolTarget::from_raw(u64::from_le_bytes(
                    c[0..8].try_into().unwrap(),
                )),
                new_implementation: ResolvedSymbolTarget::from_raw(u64::from_le_bytes(
                    c[8..16].try_into().unwrap(),
                )),
            })
            .collect()
    }
}

/// How dyld should launch a main executable.
#[derive(Debug, Clone, Copy)]
pub struct LaunchClosure<'a> {
    inner: Closure<'a>,
}

impl<'a> LaunchClosure<'a> {
    /// `bytes` must be a single top-level `launchClosure` record.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, LoadError> {
        let payload = outer_payload(bytes, AttrType::LaunchClosure)?;
        Ok(Self { inner: Closure { payload } })
    }

    pub fn closure(&self) -> &Closure<'a> {
        &self.inner
    }

    pub fn images(&self) -> Result<ImageArray<'a>, LoadError> {
        self.inner.images()
    }

    pub fn top_image_num(&self) -> Result<ImageNum, LoadError> {
        self.inner.top_image_num()
    }

    pub fn flags(&self) -> ClosureFlags {
        self.inner
            .attr(AttrType::ClosureFlags)
            .and_then(|p| payload_u32(p, 0))
            .map(ClosureFlags::from_raw)
            .unwrap_or_default()
    }

    pub fn initial_image_count(&self) -> u32 {
        self.flags().init_image_count
    }

    pub fn dyld_cache_uuid(&self) -> Option<[u8; 16]> {
        self.inner
            .attr(AttrType::DyldCacheUuid)
            .and_then(|p| p.get(0..16))
            .map(|p| p.try_into().unwrap())
    }

    pub fn boot_uuid(&self) -> Option<&'a str> {
        self.inner
            .attr(AttrType::BootUuid)
            .and_then(|p| p.split(|&b| b == 0).next())
            .and_then(|s| std::str::from_utf8(s).ok())
    }

    pub fn lib_system_image_num(&self) -> Option<ImageNum> {
        self.inner.attr(AttrType::LibSystemNum).and_then(|p| payload_u32(p, 0))
    }

    pub fn lib_dyld_entry(&self) -> Option<ResolvedSymbolTarget> {
        self.inner
            .attr(AttrType::LibDyldEntry)
            .and_then(|p| payload_u64(p, 0))
            .map(ResolvedSymbolTarget::from_raw)
    }

    pub fn main_entry(&self) -> Option<ResolvedSymbolTarget> {
        self.inner
            .attr(AttrType::MainEntry)
            .and_then(|p| payload_u64(p, 0))
            .map(ResolvedSymbolTarget::from_raw)
    }

    pub fn start_entry(&self) -> Option<ResolvedSymbolTarget> {
        self.inner
            .attr(AttrType::StartEntry)
            .and_then(|p| payload_u64(p, 0))
            .map(ResolvedSymbolTarget::from_raw)
    }

    pub fn env_vars(&self) -> Vec<&'a str> {
        let mut vars = Vec::new();
        let _ = for_each_record(self.inner.payload, &mut |rec| {
            if rec.kind == AttrType::EnvVar as u8 {
                if let Ok(s) = std::str::from_utf8(rec.payload) {
                    vars.push(s.trim_end_matches('\0'));
                }
            }
            std::ops::ControlFlow::Continue(())
        });
        vars
    }

    /// Paths that must remain missing for this closure to stay valid.
    pub fn must_be_missing_files(&self) -> Vec<&'a str> {
        let Some(p) = self.inner.attr(AttrType::MissingFiles) else {
            return Vec::new();
        };
        p.split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| std::str::from_utf8(s).ok())
            .collect()
    }

    pub fn patch_entries(&self) -> Vec<PatchEntry> {
        self.inner.patch_entries()
    }

    pub fn interpose_tuples(&self) -> Vec<InterposingTuple> {
        self.inner.interpose_tuples()
    }
}

/// How dyld should dlopen a mach-o file.
#[derive(Debug, Clone, Copy)]
pub struct DlopenClosure<'a> {
    inner: Closure<'a>,
}

impl<'a> DlopenClosure<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, LoadError> {
        let payload = outer_payload(bytes, AttrType::DlopenClosure)?;
        Ok(Self { inner: Closure { payload } })
    }

    pub fn closure(&self) -> &Closure<'a> {
        &self.inner
    }

    pub fn images(&self) -> Result<ImageArray<'a>, LoadError> {
        self.inner.images()
    }

    pub fn top_image_num(&self) -> Result<ImageNum, LoadError> {
        self.inner.top_image_num()
    }

    pub fn patch_entries(&self) -> Vec<PatchEntry> {
        self.inner.patch_entries()
    }
}

fn outer_payload(bytes: &[u8], wanted: AttrType) -> Result<&[u8], LoadError> {
    if bytes.len() < 4 {
        return Err(LoadError::malformed("closure", "too small"));
    }
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if (word & 0xff) as u8 != wanted as u8 {
        return Err(LoadError::malformed("closure", "wrong container type"));
    }
    let length = (word >> 8) as usize;
    bytes
        .get(4..4 + length)
        .ok_or(LoadError::malformed("closure", "payload past end"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_target_roundtrip() {
        for target in [
            ResolvedSymbolTarget::Rebase,
            ResolvedSymbolTarget::SharedCache { offset: 0x3FFF_FFFF_FFFF_FFF0 >> 2 },
            ResolvedSymbolTarget::Image { image_num: 0x2001, offset: 0xFF_FFFF_0000 },
            ResolvedSymbolTarget::Absolute { value: 0 },
            ResolvedSymbolTarget::Absolute { value: -1 },
        ] {
            assert_eq!(ResolvedSymbolTarget::from_raw(target.to_raw()), target, "{target:?}");
        }
    }

    #[test]
    fn absolute_target_sign_extends() {
        let raw = ResolvedSymbolTarget::Absolute { value: -64 }.to_raw();
        match ResolvedSymbolTarget::from_raw(raw) {
            ResolvedSymbolTarget::Absolute { value } => assert_eq!(value, -64),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn flags_word_roundtrip() {
        let word = ImageFlagsWord {
            image_num: 0x2042,
            max_load_count: 17,
            flags: ImageFlags::IS_DYLIB | ImageFlags::HAS_WEAK_DEFS | ImageFlags::IS_64,
        };
        assert_eq!(ImageFlagsWord::from_raw(word.to_raw()), word);
    }

    #[test]
    fn linked_image_roundtrip() {
        let li = LinkedImage { kind: LinkKind::Upward, image_num: 0x123 };
        assert_eq!(LinkedImage::from_raw(li.to_raw()), li);
        let missing = LinkedImage { kind: LinkKind::Weak, image_num: MISSING_WEAK_LINKED_IMAGE };
        assert_eq!(LinkedImage::from_raw(missing.to_raw()), missing);
    }

    #[test]
    fn disk_segment_roundtrip() {
        let seg = DiskSegment {
            file_page_count: 5,
            vm_page_count: 9,
            permissions: 3,
            padding_not_seg: false,
        };
        assert_eq!(DiskSegment::from_raw(seg.to_raw()), seg);
    }

    #[test]
    fn patch_location_addend_sign_extends() {
        let loc = PatchLocation {
            cache_offset: 0x1000,
            addend: -8,
            authenticated: true,
            uses_address_diversity: false,
            key: 2,
            discriminator: 0xBEEF,
        };
        assert_eq!(PatchLocation::from_raw(loc.to_raw()), loc);
    }

    #[test]
    fn path_hash_matches_reference() {
        // h = h*5 + c over the bytes
        let mut h: u32 = 0;
        for c in "/usr/lib/libSystem.B.dylib".bytes() {
            h = h.wrapping_mul(5).wrapping_add(c as u32);
        }
        assert_eq!(path_hash("/usr/lib/libSystem.B.dylib"), h);
        assert_ne!(path_hash("/a"), path_hash("/b"));
    }

    #[test]
    fn unknown_record_tags_are_skipped() {
        // one unknown record (tag 200), then a TopImage
        let mut bytes = Vec::new();
        bytes.extend((200u32 | (4 << 8)).to_le_bytes());
        bytes.extend(0xDEADBEEFu32.to_le_bytes());
        bytes.extend((AttrType::TopImage as u32 | (4 << 8)).to_le_bytes());
        bytes.extend(0x2000u32.to_le_bytes());
        assert_eq!(find_record(&bytes, AttrType::TopImage), Some(&0x2000u32.to_le_bytes()[..]));
    }
}
