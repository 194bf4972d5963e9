//! The runtime side: consume a launch closure, map every image not
//! already present from the shared cache, verify identity, apply the
//! recorded fixups, register tracing data and run initializers in
//! dependency order.

use std::collections::HashMap;
use std::ffi::c_char;
use std::path::Path;
use std::sync::Mutex;

use crate::closure::{
    find_image, patterns, DlopenClosure, Image, ImageArray, ImageNum, LaunchClosure, PatchEntry,
    ResolvedSymbolTarget,
};
use crate::diagnostics::{LoadError, SandboxOp};
use crate::host::{DofRegistration, FootprintSuspendGuard, Host};
use crate::mach_o::{self, chained, code_sign, Arch};
use crate::shared_cache::SharedCache;

/// Serializes cache patching across threads; patches are applied at most
/// once per closure load.
static CACHE_PATCH_LOCK: Mutex<()> = Mutex::new(());

/// Transitions are one-way; images from the shared cache enter directly
/// at `FixedUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    Reserved,
    Mapped,
    FixedUp,
    Initialized,
}

/// The per-process argc/argv/environ block handed to initializers.
#[repr(C)]
pub struct ProgramVars {
    pub mh: u64,
    pub argc: i32,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
    pub apple: *const *const c_char,
    pub prog_name: *const c_char,
}

type Initializer = unsafe extern "C" fn(
    i32,
    *const *const c_char,
    *const *const c_char,
    *const *const c_char,
    *const ProgramVars,
);

/// One mapped segment inside a reservation, for later protection
/// toggles.
#[derive(Debug, Clone, Copy)]
struct MappedSegment {
    vm_offset: u64,
    vm_size: u64,
    permissions: u8,
}

struct RuntimeImage {
    image_num: ImageNum,
    state: LoadState,
    base: u64,
    reservation_size: u64,
    slide: u64,
    is_64: bool,
    segments: Vec<MappedSegment>,
}

/// Releases address-space reservations on early exit; mapping a batch
/// either fully succeeds or leaves nothing behind.
struct ReservationBatch<'h, H: Host> {
    host: &'h H,
    reservations: Vec<(u64, u64)>,
    committed: bool,
}

impl<'h, H: Host> ReservationBatch<'h, H> {
    fn new(host: &'h H) -> Self {
        Self { host, reservations: Vec::new(), committed: false }
    }

    fn add(&mut self, addr: u64, size: u64) {
        self.reservations.push((addr, size));
    }

    fn commit(mut self) {
        self.committed = true;
        self.reservations.clear();
    }
}

impl<H: Host> Drop for ReservationBatch<'_, H> {
    fn drop(&mut self) {
        if !self.committed {
            for &(addr, size) in &self.reservations {
                self.host.release_address_space(addr, size);
            }
        }
    }
}

pub struct Loader<'a, H: Host> {
    host: &'a H,
    cache: Option<&'a SharedCache<'a>>,
    /// Where the shared cache is mapped in this process.
    cache_base: u64,
    arch: Arch,
    closure: LaunchClosure<'a>,
    arrays: Vec<ImageArray<'a>>,
    images: HashMap<ImageNum, RuntimeImage>,
    dofs: Vec<DofRegistration>,
    patches_applied: bool,
    /// Launch-closure interposing tuples resolved to runtime addresses;
    /// applied to every image a dlopen closure brings in.
    runtime_interpose: Vec<(u64, u64)>,
}

impl<'a, H: Host> Loader<'a, H> {
    pub fn new(
        host: &'a H,
        cache: Option<&'a SharedCache<'a>>,
        cache_base: u64,
        arch: Arch,
        closure: LaunchClosure<'a>,
    ) -> Result<Self, LoadError> {
        let mut arrays = vec![closure.images()?];
        if let Some(cache) = cache {
            if let Some(other) = cache.other_image_array() {
                arrays.push(other);
            }
            arrays.push(cache.image_array());
        }
        Ok(Self {
            host,
            cache,
            cache_base,
            arch,
            closure,
            arrays,
            images: HashMap::new(),
            dofs: Vec::new(),
            patches_applied: false,
            runtime_interpose: Vec::new(),
        })
    }

    /// The whole launch sequence up to (but not including) running
    /// initializers.
    pub fn prepare(&mut self) -> Result<(), LoadError> {
        self.validate_closure()?;
        self.map_all_images()?;
        self.apply_all_fixups()?;
        self.register_dofs();
        self.apply_cache_patches()?;
        self.resolve_interpose_tuples()?;
        Ok(())
    }

    /// Maps and fixes up the images of a dlopen closure built on top of
    /// this launch. Launch-closure interposing tuples apply to every
    /// newly loaded image; its cache patches are applied once.
    pub fn load_dlopen_closure(&mut self, dlopen: &DlopenClosure<'a>) -> Result<(), LoadError> {
        let array = dlopen.images()?;
        self.arrays.push(array);

        let mut to_map = Vec::new();
        array.for_each_image(&mut |image| to_map.push(image));
        let mut batch = ReservationBatch::new(self.host);
        let mut mapped = Vec::new();
        for image in &to_map {
            mapped.push(self.map_image(image, &mut batch)?);
        }
        batch.commit();
        for rt in mapped {
            self.images.insert(rt.image_num, rt);
        }

        for image in &to_map {
            let num = image.image_num()?;
            let Some(rt) = self.images.get(&num) else { continue };
            if rt.state != LoadState::Mapped {
                continue;
            }
            self.apply_image_fixups(image, rt, true)?;
            if let Some(rt) = self.images.get_mut(&num) {
                rt.state = LoadState::FixedUp;
            }
        }

        if let Some(cache) = self.cache {
            let _lock = CACHE_PATCH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            for entry in dlopen.patch_entries() {
                self.apply_one_patch(cache, &entry)?;
            }
        }
        Ok(())
    }

    /// Resolves the launch tuples once image bases are known.
    fn resolve_interpose_tuples(&mut self) -> Result<(), LoadError> {
        let mut resolved = Vec::new();
        for tuple in self.closure.interpose_tuples() {
            let stock = self.resolve_target(tuple.stock_implementation)?;
            let new = self.resolve_target(tuple.new_implementation)?;
            resolved.push((stock, new));
        }
        self.runtime_interpose = resolved;
        Ok(())
    }

    fn interpose_value(&self, value: u64) -> u64 {
        for &(stock, new) in &self.runtime_interpose {
            if value == stock {
                return new;
            }
        }
        value
    }

    // ----- validation -----

    /// A closure is only usable while the world it described still
    /// holds: same cache, env-dependent files still missing, and every
    /// on-disk image unchanged.
    pub fn validate_closure(&self) -> Result<(), LoadError> {
        if let (Some(cache), Some(expected)) = (self.cache, self.closure.dyld_cache_uuid()) {
            if cache.uuid != expected {
                return Err(LoadError::ClosureStale { reason: "built against another dyld cache".into() });
            }
        }
        for path in self.closure.must_be_missing_files() {
            if self.host.file_exists(Path::new(path)) {
                return Err(LoadError::ClosureStale { reason: format!("{path} now exists") });
            }
        }

        let launch_images = self.arrays[0];
        let mut failure = None;
        launch_images.for_each_image(&mut |image| {
            if failure.is_some() {
                return;
            }
            if let Err(e) = self.validate_image_file(&image) {
                failure = Some(e);
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn validate_image_file(&self, image: &Image<'_>) -> Result<(), LoadError> {
        let path = image.path()?;
        if let Some(expected) = image.file_info() {
            let on_disk = self.host.file_id(Path::new(path)).ok_or_else(|| {
                LoadError::FileNotFound { path: path.to_owned() }
            })?;
            if on_disk.inode != expected.inode || on_disk.mtime != expected.mod_time {
                // a root over the cache, or a rebuilt dylib; either way
                // this closure no longer describes reality
                return Err(LoadError::FileChanged { path: path.to_owned() });
            }
        } else if let Some(expected_cd) = image.cd_hash() {
            let file = self.host.load_file(Path::new(path))?;
            let slice_offset = image.slice_offset_in_file() as usize;
            let slice = file
                .content
                .get(slice_offset..)
                .ok_or(LoadError::FileChanged { path: path.to_owned() })?;
            let info = crate::mach_o::analyzer::SliceInfo::parse(slice, self.arch, None, path)
                .map_err(|_| LoadError::FileChanged { path: path.to_owned() })?;
            let current = code_sign::compute_cd_hash(slice, &info, path)?;
            if current.map(|c| c.hash) != Some(expected_cd) {
                return Err(LoadError::CodeSignatureChanged { path: path.to_owned() });
            }
        }
        Ok(())
    }

    // ----- mapping -----

    pub fn map_all_images(&mut self) -> Result<(), LoadError> {
        let launch_images = self.arrays[0];
        let mut to_map = Vec::new();
        launch_images.for_each_image(&mut |image| to_map.push(image));

        let mut batch = ReservationBatch::new(self.host);
        let mut mapped = Vec::new();
        for image in &to_map {
            mapped.push(self.map_image(image, &mut batch)?);
        }
        batch.commit();
        for rt in mapped {
            self.images.insert(rt.image_num, rt);
        }

        // cache-resident images referenced by this closure are already
        // mapped and fixed up; register them at their cache addresses
        if let Some(cache) = self.cache {
            let mut register = |num: ImageNum| {
                if self.images.contains_key(&num) {
                    return;
                }
                if let Some(entry) = cache.entry_for_num(num) {
                    self.images.insert(
                        num,
                        RuntimeImage {
                            image_num: num,
                            state: LoadState::FixedUp,
                            base: self.cache_base + entry.macho_offset as u64,
                            reservation_size: 0,
                            slide: 0,
                            is_64: true,
                            segments: Vec::new(),
                        },
                    );
                }
            };
            for image in &to_map {
                for dep in image.dependents() {
                    if dep.image_num <= crate::closure::LAST_DYLD_CACHE_IMAGE_NUM {
                        register(dep.image_num);
                    }
                }
            }
            if let Ok(top) = self.closure.top_image_num() {
                if let Some(top_image) = find_image(&self.arrays, top) {
                    for num in top_image.init_order() {
                        if num <= crate::closure::LAST_DYLD_CACHE_IMAGE_NUM {
                            register(num);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn map_image(
        &self,
        image: &Image<'_>,
        batch: &mut ReservationBatch<'_, H>,
    ) -> Result<RuntimeImage, LoadError> {
        let path = image.path()?;
        let vm_size = image.vm_size_to_map();
        if vm_size == 0 {
            return Err(LoadError::malformed("closure", "image has no mapping info"));
        }
        let base = self.host.reserve_address_space(vm_size)?;
        batch.add(base, vm_size);

        let file = self.host.open(Path::new(path))?;
        let slice_offset = image.slice_offset_in_file();
        let page = image.page_size();

        let mut segments = Vec::new();
        let mut file_cursor = 0u64;
        let mut vm_cursor = 0u64;
        for seg in image.disk_segments() {
            let file_len = seg.file_page_count as u64 * page;
            let vm_len = seg.vm_page_count as u64 * page;
            if seg.padding_not_seg {
                file_cursor += file_len;
                vm_cursor += vm_len;
                continue;
            }
            if file_len != 0 {
                self.host
                    .map_fixed(
                        &file,
                        slice_offset + file_cursor,
                        file_len.min(vm_len),
                        base + vm_cursor,
                        seg.permissions,
                    )
                    .map_err(|e| self.translate_map_error(path, e))?;
            }
            // zero-fill tails and fileSize==0 segments are covered by
            // the reserved region
            segments.push(MappedSegment {
                vm_offset: vm_cursor,
                vm_size: vm_len,
                permissions: seg.permissions,
            });
            file_cursor += file_len;
            vm_cursor += vm_len;
        }

        self.attach_signature(image, &file, path, slice_offset)?;
        if let Some(fairplay) = image.fairplay_range() {
            let start = fairplay.text_start_page as u64 * page;
            let len = fairplay.text_page_count as u64 * page;
            self.host.declare_encrypted_region(
                base + start,
                len,
                self.arch.cpu_type(),
                self.arch.cpu_subtype(),
            )?;
        }

        let image_num = image.image_num()?;
        log::debug!("mapped {path} at {base:#x} ({vm_size:#x} bytes)");
        Ok(RuntimeImage {
            image_num,
            state: LoadState::Mapped,
            base,
            reservation_size: vm_size,
            slide: base.wrapping_sub(preferred_base_of_mapped(base)),
            is_64: image.flags().contains(crate::closure::ImageFlags::IS_64),
            segments,
        })
    }

    fn translate_map_error(&self, path: &str, err: LoadError) -> LoadError {
        if let LoadError::MmapFailed { errno } = err {
            // EPERM plus a sandbox verdict means the sandbox said no
            if errno == 1 && self.host.sandbox_blocked(path, SandboxOp::FileMapExecutable) {
                return LoadError::SandboxBlocked {
                    path: path.to_owned(),
                    op: SandboxOp::FileMapExecutable,
                };
            }
        }
        err
    }

    fn attach_signature(
        &self,
        image: &Image<'_>,
        file: &H::File,
        path: &str,
        slice_offset: u64,
    ) -> Result<(), LoadError> {
        let Some(cs) = image.code_signature_location() else {
            return Ok(());
        };
        let covered = self
            .host
            .add_file_signatures(file, slice_offset, cs.file_offset, cs.file_size)
            .map_err(|e| LoadError::CodeSignatureInvalid {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        // the signature must cover the whole file up to the blob itself
        if covered < cs.file_offset as u64 {
            return Err(LoadError::CodeSignatureInvalid {
                path: path.to_owned(),
                reason: format!("signature covers only {covered:#x} bytes"),
            });
        }
        self.host
            .check_library_validation(file, slice_offset)
            .map_err(|reason| LoadError::CodeSignatureInvalid { path: path.to_owned(), reason })?;
        Ok(())
    }

    // ----- fixups -----

    pub fn apply_all_fixups(&mut self) -> Result<(), LoadError> {
        let launch_images = self.arrays[0];
        let mut images = Vec::new();
        launch_images.for_each_image(&mut |image| images.push(image));

        for image in images {
            let num = image.image_num()?;
            let overrides_cache = image.override_of_cache_image().is_some();
            {
                let rt = self
                    .images
                    .get(&num)
                    .ok_or(LoadError::malformed("loader", "fixups before mapping"))?;
                if rt.state != LoadState::Mapped {
                    continue;
                }
                // roots over cache dylibs get their dirty pages accounted
                // as untouched while we fix them up
                let _suspend = overrides_cache.then(|| FootprintSuspendGuard::new(self.host));
                self.apply_image_fixups(&image, rt, false)?;
            }
            if let Some(rt) = self.images.get_mut(&num) {
                rt.state = LoadState::FixedUp;
            }
        }
        Ok(())
    }

    fn apply_image_fixups(
        &self,
        image: &Image<'_>,
        rt: &RuntimeImage,
        interpose: bool,
    ) -> Result<(), LoadError> {
        let slide = rt.slide;
        let ptr_size: u64 = if rt.is_64 { 8 } else { 4 };

        // rebases: *loc += slide
        let rebase_patterns = image.rebase_patterns();
        let mut failure = None;
        patterns::for_each_rebase_offset(&rebase_patterns, ptr_size, &mut |offset| {
            if failure.is_some() {
                return;
            }
            if offset + ptr_size > rt.reservation_size {
                failure = Some(LoadError::malformed("fixups", "rebase outside image"));
                return;
            }
            // SAFETY: offset checked against the reservation we mapped
            unsafe {
                let loc = (rt.base + offset) as *mut u8;
                if rt.is_64 {
                    let v = (loc as *mut u64).read_unaligned().wrapping_add(slide);
                    (loc as *mut u64).write_unaligned(v);
                } else {
                    let v = (loc as *mut u32).read_unaligned().wrapping_add(slide as u32);
                    (loc as *mut u32).write_unaligned(v);
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        // binds: store the resolved address
        let bind_patterns = image.bind_patterns();
        let mut failure = None;
        patterns::for_each_bind_location(&bind_patterns, ptr_size, &mut |offset, target| {
            if failure.is_some() {
                return;
            }
            if offset + ptr_size > rt.reservation_size {
                failure = Some(LoadError::malformed("fixups", "bind outside image"));
                return;
            }
            let value = match self.resolve_target_at(target, rt, offset) {
                Ok(v) => {
                    if interpose {
                        self.interpose_value(v)
                    } else {
                        v
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    return;
                }
            };
            // SAFETY: offset checked against the reservation we mapped
            unsafe {
                let loc = (rt.base + offset) as *mut u8;
                if rt.is_64 {
                    (loc as *mut u64).write_unaligned(value);
                } else {
                    (loc as *mut u32).write_unaligned(value as u32);
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        self.apply_chained_fixups(image, rt, interpose)?;
        self.apply_text_fixups(image, rt)?;
        Ok(())
    }

    fn apply_chained_fixups(
        &self,
        image: &Image<'_>,
        rt: &RuntimeImage,
        interpose: bool,
    ) -> Result<(), LoadError> {
        let targets = image.chained_targets();
        for start in image.chained_starts() {
            let mut offset = start;
            loop {
                if offset + 8 > rt.reservation_size {
                    return Err(LoadError::malformed("fixups", "chain left the image"));
                }
                // SAFETY: offset checked against the reservation
                let loc = (rt.base + offset) as *mut u64;
                let raw = unsafe { loc.read_unaligned() };
                let stride = chained::next_stride(raw);
                let value = match chained::ChainedPtr::decode(raw) {
                    chained::ChainedPtr::Rebase { target } => target.wrapping_add(rt.slide),
                    chained::ChainedPtr::Bind { ordinal, addend } => {
                        let target = targets.get(ordinal as usize).copied().ok_or(
                            LoadError::malformed("fixups", "chained ordinal out of range"),
                        )?;
                        let mut v = self.resolve_target_at(target, rt, offset)?;
                        if interpose {
                            v = self.interpose_value(v);
                        }
                        v.wrapping_add(addend as u64)
                    }
                    chained::ChainedPtr::AuthRebase { target, diversity, addr_div, key } => self
                        .host
                        .sign_pointer(
                            rt.base + target as u64,
                            rt.base + offset,
                            key,
                            diversity,
                            addr_div,
                        ),
                    chained::ChainedPtr::AuthBind { ordinal, diversity, addr_div, key } => {
                        let target = targets.get(ordinal as usize).copied().ok_or(
                            LoadError::malformed("fixups", "chained ordinal out of range"),
                        )?;
                        let value = self.resolve_target_at(target, rt, offset)?;
                        self.host.sign_pointer(value, rt.base + offset, key, diversity, addr_div)
                    }
                };
                // SAFETY: same location as the read above
                unsafe { loc.write_unaligned(value) };
                if stride == 0 {
                    break;
                }
                offset += stride * 8;
            }
        }
        Ok(())
    }

    /// i386 text relocations: the covering segment goes writable for the
    /// duration, then its protections come back.
    fn apply_text_fixups(&self, image: &Image<'_>, rt: &RuntimeImage) -> Result<(), LoadError> {
        let fixups = image.text_fixup_patterns();
        if fixups.is_empty() {
            return Ok(());
        }
        for seg in &rt.segments {
            let covered: Vec<_> = fixups
                .iter()
                .filter(|f| {
                    (f.start_vm_offset as u64) >= seg.vm_offset
                        && (f.start_vm_offset as u64) < seg.vm_offset + seg.vm_size
                })
                .collect();
            if covered.is_empty() {
                continue;
            }
            self.host.protect(
                rt.base + seg.vm_offset,
                seg.vm_size,
                mach_o::VM_PROT_READ | mach_o::VM_PROT_WRITE,
            )?;
            let mut result = Ok(());
            for fixup in covered {
                let mut offset = fixup.start_vm_offset as u64;
                for _ in 0..fixup.repeat_count.max(1) {
                    let value = match self.resolve_target_at(fixup.target, rt, offset) {
                        Ok(v) => v,
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    };
                    // SAFETY: text fixups validated to sit inside __TEXT
                    unsafe {
                        ((rt.base + offset) as *mut u32).write_unaligned(value as u32);
                    }
                    offset += (1 + fixup.skip_count as u64) * 4;
                }
            }
            // restore before surfacing any error
            self.host.protect(rt.base + seg.vm_offset, seg.vm_size, seg.permissions)?;
            result?;
        }
        Ok(())
    }

    /// Resolves an 8-byte target to an absolute runtime address.
    fn resolve_target_at(
        &self,
        target: ResolvedSymbolTarget,
        rt: &RuntimeImage,
        offset: u64,
    ) -> Result<u64, LoadError> {
        match target {
            ResolvedSymbolTarget::Rebase => {
                // the location already holds an image-local value
                // SAFETY: caller bounds-checked offset
                let raw = unsafe { ((rt.base + offset) as *const u64).read_unaligned() };
                Ok(raw.wrapping_add(rt.slide))
            }
            ResolvedSymbolTarget::SharedCache { offset } => Ok(self.cache_base + offset),
            ResolvedSymbolTarget::Image { image_num, offset } => {
                let base = self
                    .images
                    .get(&image_num)
                    .map(|i| i.base)
                    .ok_or(LoadError::malformed("fixups", "bind names unknown image"))?;
                Ok(base + offset)
            }
            ResolvedSymbolTarget::Absolute { value } => Ok(value as u64),
        }
    }

    pub fn resolve_target(&self, target: ResolvedSymbolTarget) -> Result<u64, LoadError> {
        match target {
            ResolvedSymbolTarget::Rebase => {
                Err(LoadError::malformed("loader", "rebase target has no address"))
            }
            other => self.resolve_target_at(other, self.any_image()?, 0),
        }
    }

    fn any_image(&self) -> Result<&RuntimeImage, LoadError> {
        self.images
            .values()
            .next()
            .ok_or(LoadError::malformed("loader", "no images loaded"))
    }

    pub fn image_base(&self, num: ImageNum) -> Option<u64> {
        self.images.get(&num).map(|i| i.base)
    }

    pub fn image_state(&self, num: ImageNum) -> Option<LoadState> {
        self.images.get(&num).map(|i| i.state)
    }

    /// The address `main` (or `start`) lives at, once images are mapped.
    pub fn entry_address(&self) -> Result<u64, LoadError> {
        let target = self
            .closure
            .main_entry()
            .or_else(|| self.closure.start_entry())
            .ok_or(LoadError::malformed("closure", "no entry target"))?;
        self.resolve_target(target)
    }

    // ----- DOF registration -----

    /// Accumulates every image's DOF sections and issues one
    /// registration for the whole batch.
    pub fn register_dofs(&mut self) {
        let launch_images = self.arrays[0];
        let mut dofs = Vec::new();
        launch_images.for_each_image(&mut |image| {
            let Ok(num) = image.image_num() else { return };
            let Some(rt) = self.images.get(&num) else { return };
            for off in image.dof_offsets() {
                dofs.push(DofRegistration {
                    section_address: rt.base + off as u64,
                    image_header: rt.base,
                    short_name: image.leaf_name().to_owned(),
                });
            }
        });
        if dofs.is_empty() {
            return;
        }
        let ids = self.host.register_dof(&dofs);
        log::debug!("registered {} DOF sections: {ids:?}", dofs.len());
        self.dofs = dofs;
    }

    // ----- cache patching -----

    /// Applies the closure's patch entries to the mapped cache, exactly
    /// once, under the process-wide lock.
    pub fn apply_cache_patches(&mut self) -> Result<(), LoadError> {
        if self.patches_applied {
            return Ok(());
        }
        self.patches_applied = true;
        let entries = self.closure.patch_entries();
        if entries.is_empty() {
            return Ok(());
        }
        let Some(cache) = self.cache else {
            return Ok(());
        };
        let _lock = CACHE_PATCH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            self.apply_one_patch(cache, &entry)?;
        }
        Ok(())
    }

    fn apply_one_patch(&self, cache: &SharedCache<'_>, entry: &PatchEntry) -> Result<(), LoadError> {
        let Some(cache_image) = cache.image_for_num(entry.overridden_dylib_in_cache) else {
            log::warn!(
                "patch entry names unknown cache image {}",
                entry.overridden_dylib_in_cache
            );
            return Ok(());
        };
        let replacement = self.resolve_target(entry.replacement)?;
        let mut locations = Vec::new();
        cache_image.for_each_patchable_export(&mut |impl_off, locs, _name| {
            if impl_off == entry.export_cache_offset {
                locations.extend_from_slice(locs);
            }
        })?;
        for loc in locations {
            let addr = self.cache_base + loc.cache_offset as u64;
            let mut value = replacement.wrapping_add(loc.addend as u64);
            if loc.authenticated {
                value = self.host.sign_pointer(
                    value,
                    addr,
                    loc.key,
                    loc.discriminator,
                    loc.uses_address_diversity,
                );
            }
            // SAFETY: patch locations come from the cache's own tables,
            // which cover only its writable data region
            unsafe {
                (addr as *mut u64).write_unaligned(value);
            }
            log::debug!("patched cache location {:#x}", loc.cache_offset);
        }
        Ok(())
    }

    // ----- initializers -----

    /// Initializer addresses in the order the closure recorded: a
    /// dylib's initializers run strictly after its non-upward
    /// dependents'.
    pub fn initializers_in_order(&self) -> Result<Vec<(ImageNum, u64)>, LoadError> {
        let top_num = self.closure.top_image_num()?;
        let top = find_image(&self.arrays, top_num)
            .ok_or(LoadError::malformed("closure", "missing top image"))?;
        let mut order = top.init_order();
        if !order.contains(&top_num) {
            order.push(top_num);
        }

        let mut out = Vec::new();
        for num in order {
            let Some(image) = find_image(&self.arrays, num) else {
                continue;
            };
            let Some(base) = self.image_base(num) else {
                continue;
            };
            for off in image.init_offsets() {
                out.push((num, base + off as u64));
            }
        }
        Ok(out)
    }

    /// Runs initializers with `(argc, argv, envp, apple, vars)`.
    /// Initializers may dlopen, which re-enters the builder; no loader
    /// lock is held across these calls.
    ///
    /// # Safety
    /// Every image must be `FixedUp`, and the closure must describe real
    /// mapped code.
    pub unsafe fn run_initializers(&mut self, vars: &ProgramVars) -> Result<(), LoadError> {
        let inits = self.initializers_in_order()?;
        for (num, addr) in inits {
            if let Some(rt) = self.images.get(&num) {
                if rt.state == LoadState::Initialized {
                    continue; // dlopen of an already-loaded image
                }
                if rt.state < LoadState::FixedUp {
                    return Err(LoadError::malformed("loader", "initializer before fixups"));
                }
            }
            log::debug!("running initializer {addr:#x} of image {num:#x}");
            // SAFETY: caller guarantees the closure matches mapped code
            unsafe {
                let f: Initializer = std::mem::transmute(addr as *const ());
                f(vars.argc, vars.argv, vars.envp, vars.apple, vars);
            }
        }
        for rt in self.images.values_mut() {
            if rt.state == LoadState::FixedUp {
                rt.state = LoadState::Initialized;
            }
        }
        Ok(())
    }
}

/// Reads the preferred load address out of a mapped image's own header;
/// the slide is the delta to where it actually landed.
fn preferred_base_of_mapped(base: u64) -> u64 {
    // SAFETY: the caller just mapped __TEXT (headers included) at base
    unsafe {
        let header = std::slice::from_raw_parts(base as *const u8, 32);
        let Ok(parsed) = mach_o::MachHeader::parse(header) else {
            return 0;
        };
        let cmds = std::slice::from_raw_parts(
            (base as usize + parsed.size()) as *const u8,
            parsed.sizeofcmds as usize,
        );
        let mut iter = mach_o::LoadCommandsIter::new(cmds, parsed.ncmds);
        for lc in &mut iter {
            let is64 = lc.cmd == mach_o::LC_SEGMENT_64;
            if lc.cmd != mach_o::LC_SEGMENT && !is64 {
                continue;
            }
            if lc.bytes.get(8..15) == Some(&b"__TEXT\0"[..]) {
                let addr = if is64 {
                    mach_o::read_u64(lc.bytes, 24, "segment").unwrap_or(0)
                } else {
                    mach_o::read_u32(lc.bytes, 24, "segment").unwrap_or(0) as u64
                };
                return addr;
            }
        }
        0
    }
}
