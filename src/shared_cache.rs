//! A read-only view of the dyld shared cache: the header fields the
//! builder and loader consume, the install-name table, and the prebuilt
//! closure images (with their patchable-export tables) the cache builder
//! embedded.
//!
//! Building caches is a separate tool's job; this module only reads
//! them, plus a small writer used to assemble caches in tests.

use crate::closure::{Image, ImageArray, ImageNum, FIRST_DYLD_CACHE_IMAGE_NUM, FORMAT_VERSION};
use crate::diagnostics::LoadError;
use crate::mach_o::read_u32;

pub const CACHE_MAGIC_PREFIX: &[u8] = b"dyld_v1";

/// `cacheType` values in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Development,
    Production,
}

const SITE: &str = "shared cache";

// Fixed header layout:
//   0  magic[16]          "dyld_v1" + arch name, NUL padded
//  16  format_version     u32
//  20  cache_type         u32
//  24  dylibs_on_disk     u32
//  28  (reserved)         u32
//  32  uuid               [16]
//  48  unslid_base        u64
//  56  dylibs_array       u32 offset, u32 size
//  64  other_array        u32 offset, u32 size
//  72  image_entries      u32 offset, u32 count
const HEADER_SIZE: usize = 80;

/// One cache dylib: its install name and where its mach-o begins inside
/// the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheImageEntry<'a> {
    pub install_name: &'a str,
    pub macho_offset: u32,
}

pub struct SharedCache<'a> {
    bytes: &'a [u8],
    pub format_version: u32,
    pub cache_type: CacheType,
    pub dylibs_expected_on_disk: bool,
    pub uuid: [u8; 16],
    pub unslid_base: u64,
    dylib_images: ImageArray<'a>,
    other_images: Option<ImageArray<'a>>,
    entries: Vec<CacheImageEntry<'a>>,
}

impl<'a> SharedCache<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_SIZE || !bytes.starts_with(CACHE_MAGIC_PREFIX) {
            return Err(LoadError::malformed(SITE, "bad magic"));
        }
        let format_version = read_u32(bytes, 16, SITE)?;
        if format_version != FORMAT_VERSION {
            return Err(LoadError::malformed(
                SITE,
                format!("format version {format_version} != {FORMAT_VERSION}"),
            ));
        }
        let cache_type = match read_u32(bytes, 20, SITE)? {
            0 => CacheType::Development,
            1 => CacheType::Production,
            other => {
                return Err(LoadError::malformed(SITE, format!("unknown cache type {other}")));
            }
        };
        let dylibs_expected_on_disk = read_u32(bytes, 24, SITE)? != 0;
        let uuid: [u8; 16] = bytes[32..48].try_into().unwrap();
        let unslid_base = crate::mach_o::read_u64(bytes, 48, SITE)?;

        let record_at = |offset: u32, size: u32| -> Result<&'a [u8], LoadError> {
            bytes
                .get(offset as usize..offset as usize + size as usize)
                .ok_or(LoadError::malformed(SITE, "image array outside cache"))
        };
        let dylibs_off = read_u32(bytes, 56, SITE)?;
        let dylibs_size = read_u32(bytes, 60, SITE)?;
        let dylib_images =
            ImageArray::from_payload(&record_at(dylibs_off, dylibs_size)?[4..])?;

        let other_off = read_u32(bytes, 64, SITE)?;
        let other_size = read_u32(bytes, 68, SITE)?;
        let other_images = if other_size != 0 {
            Some(ImageArray::from_payload(&record_at(other_off, other_size)?[4..])?)
        } else {
            None
        };

        let entries_off = read_u32(bytes, 72, SITE)? as usize;
        let entries_count = read_u32(bytes, 76, SITE)? as usize;
        let mut entries = Vec::with_capacity(entries_count);
        for i in 0..entries_count {
            let e = entries_off + i * 8;
            let path_off = read_u32(bytes, e, SITE)? as usize;
            let macho_offset = read_u32(bytes, e + 4, SITE)?;
            let path = bytes
                .get(path_off..)
                .and_then(|t| t.split(|&b| b == 0).next())
                .and_then(|s| std::str::from_utf8(s).ok())
                .ok_or(LoadError::malformed(SITE, "bad install name"))?;
            entries.push(CacheImageEntry { install_name: path, macho_offset });
        }

        Ok(Self {
            bytes,
            format_version,
            cache_type,
            dylibs_expected_on_disk,
            uuid,
            unslid_base,
            dylib_images,
            other_images,
            entries,
        })
    }

    pub fn image_count(&self) -> u32 {
        self.dylib_images.image_count()
    }

    /// The prebuilt closure Image records for every cached dylib.
    pub fn image_array(&self) -> ImageArray<'a> {
        self.dylib_images
    }

    /// The "dlopen other" array: OS images not in the cache proper.
    pub fn other_image_array(&self) -> Option<ImageArray<'a>> {
        self.other_images
    }

    pub fn image_num_for_path(&self, path: &str) -> Option<ImageNum> {
        self.entries
            .iter()
            .position(|e| e.install_name == path)
            .map(|i| FIRST_DYLD_CACHE_IMAGE_NUM + i as u32)
    }

    pub fn image_for_num(&self, num: ImageNum) -> Option<Image<'a>> {
        self.dylib_images
            .image_for_num(num)
            .or_else(|| self.other_images.and_then(|a| a.image_for_num(num)))
    }

    pub fn entry_for_num(&self, num: ImageNum) -> Option<&CacheImageEntry<'a>> {
        let index = num.checked_sub(FIRST_DYLD_CACHE_IMAGE_NUM)? as usize;
        self.entries.get(index)
    }

    /// The mach-o slice for a cached dylib; everything after its header
    /// is addressable cache-relative, so the slice runs to cache end.
    pub fn macho_bytes_for_num(&self, num: ImageNum) -> Option<&'a [u8]> {
        let entry = self.entry_for_num(num)?;
        self.bytes.get(entry.macho_offset as usize..)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Assembles a cache file from prebuilt parts. The real cache builder is
/// a separate tool; this writer exists so tests and tooling can fabricate
/// caches with the same reader-visible layout.
#[derive(Default)]
pub struct CacheFileWriter {
    arch_name: String,
    cache_type: u32,
    dylibs_expected_on_disk: bool,
    uuid: [u8; 16],
    unslid_base: u64,
    dylibs: Vec<String>,
    dylib_array_record: Vec<u8>,
    other_array_record: Vec<u8>,
    payload: Vec<u8>,
    macho_offsets: Vec<u32>,
}

impl CacheFileWriter {
    pub fn new(arch_name: &str, uuid: [u8; 16], unslid_base: u64) -> Self {
        Self {
            arch_name: arch_name.to_owned(),
            uuid,
            unslid_base,
            dylibs_expected_on_disk: true,
            ..Default::default()
        }
    }

    pub fn set_dylibs_expected_on_disk(&mut self, expected: bool) {
        self.dylibs_expected_on_disk = expected;
    }

    pub fn set_production(&mut self) {
        self.cache_type = 1;
    }

    /// Appends a dylib's mach-o at the next 4K boundary and returns its
    /// cache offset, so callers can build the image records that refer
    /// to it before the array is written.
    pub fn add_dylib(&mut self, install_name: &str, macho: Vec<u8>) -> u32 {
        let pos = HEADER_SIZE + self.payload.len();
        let pad = (0x1000 - pos % 0x1000) % 0x1000;
        self.payload.resize(self.payload.len() + pad, 0);
        let offset = (HEADER_SIZE + self.payload.len()) as u32;
        self.payload.extend_from_slice(&macho);
        self.macho_offsets.push(offset);
        self.dylibs.push(install_name.to_owned());
        offset
    }

    pub fn set_dylib_image_array(&mut self, record: Vec<u8>) {
        self.dylib_array_record = record;
    }

    pub fn set_other_image_array(&mut self, record: Vec<u8>) {
        self.other_array_record = record;
    }

    fn align_payload(&mut self, alignment: usize) {
        let pos = HEADER_SIZE + self.payload.len();
        let pad = (alignment - pos % alignment) % alignment;
        self.payload.resize(self.payload.len() + pad, 0);
    }

    pub fn finish(mut self) -> Vec<u8> {
        // machos were laid out by add_dylib; now the path strings, the
        // entries table and the image arrays
        let mut path_offsets = Vec::new();
        for name in &self.dylibs {
            path_offsets.push((HEADER_SIZE + self.payload.len()) as u32);
            self.payload.extend_from_slice(name.as_bytes());
            self.payload.push(0);
        }

        self.align_payload(4);
        let entries_off = (HEADER_SIZE + self.payload.len()) as u32;
        let macho_offsets = self.macho_offsets.clone();
        for (path_off, macho_off) in path_offsets.iter().zip(&macho_offsets) {
            self.payload.extend(path_off.to_le_bytes());
            self.payload.extend(macho_off.to_le_bytes());
        }

        self.align_payload(4);
        let dylibs_array_off = (HEADER_SIZE + self.payload.len()) as u32;
        let dylibs_array_size = self.dylib_array_record.len() as u32;
        self.payload.extend_from_slice(&self.dylib_array_record);

        self.align_payload(4);
        let other_array_off = (HEADER_SIZE + self.payload.len()) as u32;
        let other_array_size = self.other_array_record.len() as u32;
        self.payload.extend_from_slice(&self.other_array_record);

        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        let mut magic = [0u8; 16];
        let tag = format!("dyld_v1 {}", self.arch_name);
        let n = tag.len().min(15);
        magic[..n].copy_from_slice(&tag.as_bytes()[..n]);
        out.extend_from_slice(&magic);
        out.extend(FORMAT_VERSION.to_le_bytes());
        out.extend(self.cache_type.to_le_bytes());
        out.extend((self.dylibs_expected_on_disk as u32).to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend_from_slice(&self.uuid);
        out.extend(self.unslid_base.to_le_bytes());
        out.extend(dylibs_array_off.to_le_bytes());
        out.extend(dylibs_array_size.to_le_bytes());
        out.extend(other_array_off.to_le_bytes());
        out.extend(if other_array_size == 0 { 0u32 } else { other_array_size }.to_le_bytes());
        out.extend(entries_off.to_le_bytes());
        out.extend((self.dylibs.len() as u32).to_le_bytes());
        debug_assert_eq!(out.len(), HEADER_SIZE);
        out.extend(self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::writer::{ImageArrayWriter, ImageWriter};
    use crate::closure::{CacheSegment, ImageFlags, ImageFlagsWord};

    fn cache_image(num: ImageNum, path: &str) -> Vec<u8> {
        let mut iw = ImageWriter::new(ImageFlagsWord {
            image_num: num,
            max_load_count: 1,
            flags: ImageFlags::IS_DYLIB
                | ImageFlags::IS_64
                | ImageFlags::IN_DYLD_CACHE
                | ImageFlags::NEVER_UNLOAD,
        });
        iw.add_path(path);
        iw.set_cache_segments(&[CacheSegment { cache_offset: 0x1000, size: 0x500, permissions: 5 }]);
        iw.finish()
    }

    #[test]
    fn cache_roundtrip() {
        let mut aw = ImageArrayWriter::new(FIRST_DYLD_CACHE_IMAGE_NUM);
        aw.add_image(cache_image(FIRST_DYLD_CACHE_IMAGE_NUM, "/usr/lib/libSystem.B.dylib"));
        aw.add_image(cache_image(FIRST_DYLD_CACHE_IMAGE_NUM + 1, "/usr/lib/libfoo.dylib"));

        let mut cw = CacheFileWriter::new("x86_64", [7u8; 16], 0x7fff_0000_0000);
        cw.add_dylib("/usr/lib/libSystem.B.dylib", vec![0u8; 64]);
        cw.add_dylib("/usr/lib/libfoo.dylib", vec![0u8; 64]);
        cw.set_dylib_image_array(aw.finish());
        let bytes = cw.finish();

        let cache = SharedCache::parse(&bytes).unwrap();
        assert_eq!(cache.uuid, [7u8; 16]);
        assert_eq!(cache.cache_type, CacheType::Development);
        assert!(cache.dylibs_expected_on_disk);
        assert_eq!(cache.unslid_base, 0x7fff_0000_0000);
        assert_eq!(cache.image_count(), 2);
        assert_eq!(
            cache.image_num_for_path("/usr/lib/libfoo.dylib"),
            Some(FIRST_DYLD_CACHE_IMAGE_NUM + 1)
        );
        assert_eq!(cache.image_num_for_path("/usr/lib/libbar.dylib"), None);
        let image = cache.image_for_num(FIRST_DYLD_CACHE_IMAGE_NUM).unwrap();
        assert!(image.in_dyld_cache());
        assert!(image.never_unload());
        assert_eq!(image.path().unwrap(), "/usr/lib/libSystem.B.dylib");
    }

    #[test]
    fn version_mismatch_is_refused() {
        let mut aw = ImageArrayWriter::new(FIRST_DYLD_CACHE_IMAGE_NUM);
        aw.add_image(cache_image(FIRST_DYLD_CACHE_IMAGE_NUM, "/usr/lib/libSystem.B.dylib"));
        let mut cw = CacheFileWriter::new("x86_64", [0u8; 16], 0);
        cw.add_dylib("/usr/lib/libSystem.B.dylib", vec![0u8; 16]);
        cw.set_dylib_image_array(aw.finish());
        let mut bytes = cw.finish();
        bytes[16] = 9; // stamp an older format version
        assert!(SharedCache::parse(&bytes).is_err());
    }
}
