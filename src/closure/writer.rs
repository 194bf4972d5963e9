//! Append-only writers for the typed-byte containers. Attributes are
//! emitted in a canonical order so identical inputs produce byte-identical
//! closures.

use crate::closure::{
    align4, patterns, AttrType, CacheSegment, ClosureFlags, DiskSegment, FileInfo, ImageFlagsWord,
    ImageNum, InterposingTuple, LinkedImage, MappingInfo, PatchEntry, PatchLocation,
    ResolvedSymbolTarget,
};
use crate::diagnostics::LoadError;

/// Builds one container record; `finish` backpatches the payload length.
#[derive(Debug, Default)]
pub struct TypedBytesWriter {
    bytes: Vec<u8>,
}

impl TypedBytesWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_record(&mut self, kind: AttrType, payload: &[u8]) {
        debug_assert!(payload.len() < 1 << 24, "attribute payload too large");
        self.bytes
            .extend(((kind as u32) | ((payload.len() as u32) << 8)).to_le_bytes());
        self.bytes.extend_from_slice(payload);
        // pad to keep every record 4-byte aligned
        self.bytes.resize(self.bytes.len() + align4(payload.len()) - payload.len(), 0);
    }

    fn add_u32(&mut self, kind: AttrType, value: u32) {
        self.add_record(kind, &value.to_le_bytes());
    }

    fn add_u64(&mut self, kind: AttrType, value: u64) {
        self.add_record(kind, &value.to_le_bytes());
    }

    fn add_u32s(&mut self, kind: AttrType, values: &[u32]) {
        let mut payload = Vec::with_capacity(values.len() * 4);
        for v in values {
            payload.extend(v.to_le_bytes());
        }
        self.add_record(kind, &payload);
    }

    fn add_u64s(&mut self, kind: AttrType, values: &[u64]) {
        let mut payload = Vec::with_capacity(values.len() * 8);
        for v in values {
            payload.extend(v.to_le_bytes());
        }
        self.add_record(kind, &payload);
    }

    /// Wraps the accumulated records into a single container record.
    fn into_container(self, kind: AttrType) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + 4);
        out.extend(((kind as u32) | ((self.bytes.len() as u32) << 8)).to_le_bytes());
        out.extend(self.bytes);
        out
    }
}

/// Writes one Image record. Call the setters in the order they are
/// declared; the canonical attribute order is what makes builds
/// reproducible.
#[derive(Debug)]
pub struct ImageWriter {
    w: TypedBytesWriter,
}

impl ImageWriter {
    pub fn new(flags: ImageFlagsWord) -> Self {
        let mut w = TypedBytesWriter::new();
        w.add_u64(AttrType::ImageFlags, flags.to_raw());
        Self { w }
    }

    pub fn add_path(&mut self, path: &str) {
        let mut payload = Vec::with_capacity(4 + path.len() + 1);
        payload.extend(crate::closure::path_hash(path).to_le_bytes());
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        self.w.add_record(AttrType::PathWithHash, &payload);
    }

    pub fn set_file_info(&mut self, info: FileInfo) {
        let mut payload = Vec::with_capacity(16);
        payload.extend(info.inode.to_le_bytes());
        payload.extend(info.mod_time.to_le_bytes());
        self.w.add_record(AttrType::FileInodeAndTime, &payload);
    }

    pub fn set_cd_hash(&mut self, hash: [u8; 20]) {
        self.w.add_record(AttrType::CdHash, &hash);
    }

    pub fn set_uuid(&mut self, uuid: [u8; 16]) {
        self.w.add_record(AttrType::Uuid, &uuid);
    }

    pub fn set_mapping_info(&mut self, info: MappingInfo) {
        let mut payload = Vec::with_capacity(8);
        payload.extend(info.total_vm_pages.to_le_bytes());
        payload.extend(info.slice_offset_4k.to_le_bytes());
        self.w.add_record(AttrType::MappingInfo, &payload);
    }

    pub fn set_disk_segments(&mut self, segments: &[DiskSegment]) {
        let raw: Vec<u64> = segments.iter().map(DiskSegment::to_raw).collect();
        self.w.add_u64s(AttrType::DiskSegment, &raw);
    }

    pub fn set_cache_segments(&mut self, segments: &[CacheSegment]) {
        let raw: Vec<u64> = segments.iter().map(CacheSegment::to_raw).collect();
        self.w.add_u64s(AttrType::CacheSegment, &raw);
    }

    pub fn set_dependents(&mut self, dependents: &[LinkedImage]) {
        let raw: Vec<u32> = dependents.iter().map(LinkedImage::to_raw).collect();
        self.w.add_u32s(AttrType::Dependents, &raw);
    }

    pub fn set_init_offsets(&mut self, offsets: &[u32]) {
        if !offsets.is_empty() {
            self.w.add_u32s(AttrType::InitOffsets, offsets);
        }
    }

    pub fn set_dof_offsets(&mut self, offsets: &[u32]) {
        if !offsets.is_empty() {
            self.w.add_u32s(AttrType::DofOffsets, offsets);
        }
    }

    pub fn set_code_signature_location(&mut self, file_offset: u32, file_size: u32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend(file_offset.to_le_bytes());
        payload.extend(file_size.to_le_bytes());
        self.w.add_record(AttrType::CodeSignLoc, &payload);
    }

    pub fn set_fairplay_range(&mut self, range: crate::closure::FairPlayRange) {
        self.w.add_u32(AttrType::FairPlayLoc, range.to_raw());
    }

    pub fn set_rebase_patterns(&mut self, patterns: &[patterns::RebasePattern]) {
        if patterns.is_empty() {
            return;
        }
        let raw: Vec<u32> = patterns.iter().map(patterns::RebasePattern::to_raw).collect();
        self.w.add_u32s(AttrType::RebaseFixups, &raw);
    }

    pub fn set_bind_patterns(&mut self, patterns: &[patterns::BindPattern]) {
        if patterns.is_empty() {
            return;
        }
        let mut raw = Vec::with_capacity(patterns.len() * 2);
        for p in patterns {
            let (target, packed) = p.to_raw();
            raw.push(target);
            raw.push(packed);
        }
        self.w.add_u64s(AttrType::BindFixups, &raw);
    }

    pub fn set_text_fixup_patterns(&mut self, patterns: &[patterns::TextFixupPattern]) {
        if patterns.is_empty() {
            return;
        }
        let mut payload = Vec::with_capacity(patterns.len() * 16);
        for p in patterns {
            payload.extend(p.target.to_raw().to_le_bytes());
            payload.extend(p.start_vm_offset.to_le_bytes());
            payload.extend(p.repeat_count.to_le_bytes());
            payload.extend(p.skip_count.to_le_bytes());
        }
        self.w.add_record(AttrType::TextFixups, &payload);
    }

    pub fn set_chained_starts(&mut self, starts: &[u64]) {
        if !starts.is_empty() {
            self.w.add_u64s(AttrType::ChainedFixupsStarts, starts);
        }
    }

    pub fn set_chained_targets(&mut self, targets: &[ResolvedSymbolTarget]) {
        if targets.is_empty() {
            return;
        }
        let raw: Vec<u64> = targets.iter().map(ResolvedSymbolTarget::to_raw).collect();
        self.w.add_u64s(AttrType::ChainedFixupsTargets, &raw);
    }

    pub fn set_override_of_cache_image(&mut self, cache_image_num: ImageNum) {
        self.w.add_u32(AttrType::ImageOverride, cache_image_num);
    }

    pub fn set_init_order(&mut self, order: &[ImageNum]) {
        if !order.is_empty() {
            self.w.add_u32s(AttrType::InitBefores, order);
        }
    }

    /// Only used when writing cache-resident images (the cache builder's
    /// side of the format).
    pub fn add_patchable_export(
        &mut self,
        cache_offset_of_impl: u32,
        locations: &[PatchLocation],
        name: &str,
    ) {
        let mut payload = Vec::with_capacity(8 + locations.len() * 8 + name.len() + 1);
        payload.extend(cache_offset_of_impl.to_le_bytes());
        payload.extend((locations.len() as u32).to_le_bytes());
        for loc in locations {
            payload.extend(loc.to_raw().to_le_bytes());
        }
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        self.w.add_record(AttrType::CachePatchInfo, &payload);
    }

    /// The finished `image` record, header included.
    pub fn finish(self) -> Vec<u8> {
        self.w.into_container(AttrType::Image)
    }
}

/// Accumulates finished image records and emits the indexed array.
#[derive(Debug)]
pub struct ImageArrayWriter {
    first_image_num: ImageNum,
    images: Vec<Vec<u8>>,
}

impl ImageArrayWriter {
    pub fn new(first_image_num: ImageNum) -> Self {
        Self { first_image_num, images: Vec::new() }
    }

    /// Images must be appended in image-number order starting at
    /// `first_image_num`.
    pub fn add_image(&mut self, image_record: Vec<u8>) {
        self.images.push(image_record);
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// The finished `imageArray` record.
    pub fn finish(self) -> Vec<u8> {
        let count = self.images.len() as u32;
        let header_len = 8 + count as usize * 4;
        let mut payload = Vec::with_capacity(header_len);
        payload.extend(self.first_image_num.to_le_bytes());
        payload.extend(count.to_le_bytes());
        let mut offset = header_len;
        for image in &self.images {
            payload.extend((offset as u32).to_le_bytes());
            offset += image.len();
        }
        for image in &self.images {
            payload.extend_from_slice(image);
        }

        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend(((AttrType::ImageArray as u32) | ((payload.len() as u32) << 8)).to_le_bytes());
        out.extend(payload);
        out
    }
}

/// Writes a `launchClosure` record. The image array goes first, then the
/// scalar attributes in declaration order.
#[derive(Debug)]
pub struct LaunchClosureWriter {
    w: TypedBytesWriter,
}

impl LaunchClosureWriter {
    pub fn new(image_array_record: &[u8]) -> Self {
        let mut w = TypedBytesWriter::new();
        w.bytes.extend_from_slice(image_array_record);
        Self { w }
    }

    pub fn set_flags(&mut self, flags: ClosureFlags) {
        self.w.add_u32(AttrType::ClosureFlags, flags.to_raw());
    }

    pub fn set_dyld_cache_uuid(&mut self, uuid: [u8; 16]) {
        self.w.add_record(AttrType::DyldCacheUuid, &uuid);
    }

    pub fn add_missing_files(&mut self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let mut payload = Vec::new();
        for p in paths {
            payload.extend_from_slice(p.as_bytes());
            payload.push(0);
        }
        self.w.add_record(AttrType::MissingFiles, &payload);
    }

    pub fn add_env_var(&mut self, key_equals_value: &str) {
        self.w.add_record(AttrType::EnvVar, key_equals_value.as_bytes());
    }

    pub fn set_top_image(&mut self, num: ImageNum) {
        self.w.add_u32(AttrType::TopImage, num);
    }

    pub fn set_lib_dyld_entry(&mut self, target: ResolvedSymbolTarget) {
        self.w.add_u64(AttrType::LibDyldEntry, target.to_raw());
    }

    pub fn set_lib_system_num(&mut self, num: ImageNum) {
        self.w.add_u32(AttrType::LibSystemNum, num);
    }

    pub fn set_boot_uuid(&mut self, uuid: &str) {
        let mut payload = vec![0u8; 40];
        let n = uuid.len().min(39);
        payload[..n].copy_from_slice(&uuid.as_bytes()[..n]);
        self.w.add_record(AttrType::BootUuid, &payload);
    }

    pub fn set_main_entry(&mut self, target: ResolvedSymbolTarget) {
        self.w.add_u64(AttrType::MainEntry, target.to_raw());
    }

    pub fn set_start_entry(&mut self, target: ResolvedSymbolTarget) {
        self.w.add_u64(AttrType::StartEntry, target.to_raw());
    }

    pub fn add_cache_overrides(&mut self, entries: &[PatchEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut payload = Vec::with_capacity(entries.len() * 16);
        for e in entries {
            payload.extend(e.overridden_dylib_in_cache.to_le_bytes());
            payload.extend(e.export_cache_offset.to_le_bytes());
            payload.extend(e.replacement.to_raw().to_le_bytes());
        }
        self.w.add_record(AttrType::CacheOverrides, &payload);
    }

    pub fn add_interpose_tuples(&mut self, tuples: &[InterposingTuple]) {
        if tuples.is_empty() {
            return;
        }
        let mut payload = Vec::with_capacity(tuples.len() * 16);
        for t in tuples {
            payload.extend(t.stock_implementation.to_raw().to_le_bytes());
            payload.extend(t.new_implementation.to_raw().to_le_bytes());
        }
        self.w.add_record(AttrType::InterposeTuples, &payload);
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.into_container(AttrType::LaunchClosure)
    }
}

/// Writes a `dlopenClosure` record: images, top image and any new cache
/// patches; everything else lives on the launch closure.
#[derive(Debug)]
pub struct DlopenClosureWriter {
    w: TypedBytesWriter,
}

impl DlopenClosureWriter {
    pub fn new(image_array_record: &[u8]) -> Self {
        let mut w = TypedBytesWriter::new();
        w.bytes.extend_from_slice(image_array_record);
        Self { w }
    }

    pub fn set_top_image(&mut self, num: ImageNum) {
        self.w.add_u32(AttrType::TopImage, num);
    }

    pub fn add_cache_overrides(&mut self, entries: &[PatchEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut payload = Vec::with_capacity(entries.len() * 16);
        for e in entries {
            payload.extend(e.overridden_dylib_in_cache.to_le_bytes());
            payload.extend(e.export_cache_offset.to_le_bytes());
            payload.extend(e.replacement.to_raw().to_le_bytes());
        }
        self.w.add_record(AttrType::CacheOverrides, &payload);
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.into_container(AttrType::DlopenClosure)
    }
}

pub(crate) fn check_image_num_range(num: ImageNum) -> Result<(), LoadError> {
    if num > 0x3F_FFFF && num != crate::closure::MISSING_WEAK_LINKED_IMAGE {
        return Err(LoadError::malformed("image number", "image number exceeds 22 bits"));
    }
    Ok(())
}
