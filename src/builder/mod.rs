//! The dependency resolver: walks the load-command graph from a main
//! executable, decides which images come from disk and which from the
//! shared cache, resolves every fixup, and serializes the result as a
//! launch closure.

mod resolver;

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::closure::writer::{
    DlopenClosureWriter, ImageArrayWriter, ImageWriter, LaunchClosureWriter,
};
use crate::closure::{
    patterns, ClosureFlags, DiskSegment, FairPlayRange, FileInfo, ImageFlags, ImageFlagsWord,
    ImageNum, InterposingTuple, LinkedImage, MappingInfo, PatchEntry, ResolvedSymbolTarget,
    FIRST_LAUNCH_CLOSURE_IMAGE_NUM, FORMAT_VERSION, MISSING_WEAK_LINKED_IMAGE,
};
use crate::diagnostics::{Diagnostics, LoadError, SandboxOp};
use crate::env::{parse_boot_args, BootArgs, DyldEnv, BOOT_ARGS_PATH, DEFAULT_DENY_LIST};
use crate::host::{Host, LoadedFile};
use crate::mach_o::analyzer::{self, EntryPoint, MachOAnalyzer, SliceInfo};
use crate::mach_o::{self, chained, code_sign, validate, Arch, LinkKind, Platform};
use crate::shared_cache::SharedCache;

pub const LIB_SYSTEM_PATH: &str = "/usr/lib/libSystem.B.dylib";
pub const LIB_DYLD_PATH: &str = "/usr/lib/system/libdyld.dylib";
const ENTRY_VECTOR_SYMBOL: &str = "__ZN5dyld318entryVectorForDyldE";

#[derive(Debug, Clone)]
pub struct ClosureBuilderOptions {
    pub arch: Arch,
    pub platform: Platform,
    pub env: DyldEnv,
    /// Paths that are never loadable, whatever the graph says.
    pub deny_list: Vec<String>,
    /// Main executables must be position independent.
    pub require_pie: bool,
    /// Boot UUID recorded on device closures.
    pub boot_uuid: Option<String>,
    /// Explicit boot-args; `None` reads `/var/db/dyld/dyld-bootargs`
    /// through the host.
    pub boot_args: Option<BootArgs>,
}

impl ClosureBuilderOptions {
    pub fn new(arch: Arch, platform: Platform) -> Self {
        Self {
            arch,
            platform,
            env: DyldEnv::new(),
            deny_list: DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            require_pie: true,
            boot_uuid: None,
            boot_args: None,
        }
    }
}

/// The trailing `Name.framework/...` portion of a framework-shaped
/// install path, used for DYLD_FRAMEWORK_PATH searches.
fn framework_partial_path(path: &str) -> Option<&str> {
    let idx = path.rfind(".framework/")?;
    let start = path[..idx].rfind('/').map(|i| i + 1).unwrap_or(0);
    Some(&path[start..])
}

/// DYLD_IMAGE_SUFFIX goes before a `.dylib` extension, else at the end.
fn add_image_suffix(path: &str, suffix: &str) -> String {
    match path.strip_suffix(".dylib") {
        Some(stem) => format!("{stem}{suffix}.dylib"),
        None => format!("{path}{suffix}"),
    }
}

/// Where a loaded image's bytes live during the build.
pub(crate) enum ImageSource {
    Disk {
        file: LoadedFile,
        slice_offset: u64,
        slice_len: u64,
    },
    Cache,
}

/// One image the builder has taken on, disk- or cache-resident. Images
/// live in an arena indexed by position; cross references use image
/// numbers, never pointers, so cyclic upward edges cost nothing.
pub(crate) struct BuilderLoadedImage {
    pub path: String,
    pub image_num: ImageNum,
    pub source: ImageSource,
    pub info: SliceInfo,
    pub dependents: Vec<LinkedImage>,
    pub dependents_resolved: bool,
    pub mark_never_unload: bool,
    pub rtld_local: bool,
    pub is_inserted: bool,
    pub override_image_num: Option<ImageNum>,
    pub cd_hash: Option<code_sign::CdHash>,
    // encoded fixups (disk images only)
    pub rebases: Vec<u64>,
    pub binds: Vec<patterns::BindFixup>,
    pub text_fixups: Vec<(u32, ResolvedSymbolTarget)>,
    pub chained_starts: Vec<u64>,
    pub chained_targets: Vec<ResolvedSymbolTarget>,
    pub init_offsets: Vec<u32>,
}

impl BuilderLoadedImage {
    pub fn in_cache(&self) -> bool {
        matches!(self.source, ImageSource::Cache)
    }
}

pub struct ClosureBuilder<'a, H: Host> {
    host: &'a H,
    cache: Option<&'a SharedCache<'a>>,
    options: ClosureBuilderOptions,
    diag: Diagnostics,
    pub(crate) images: Vec<BuilderLoadedImage>,
    next_image_num: ImageNum,
    must_be_missing: Vec<String>,
    used_at_paths: bool,
    used_fallback_paths: bool,
    interpose_tuples: Vec<InterposingTuple>,
    pub(crate) cache_patches: Vec<PatchEntry>,
}

impl<'a, H: Host> ClosureBuilder<'a, H> {
    pub fn new(
        host: &'a H,
        cache: Option<&'a SharedCache<'a>>,
        options: ClosureBuilderOptions,
    ) -> Self {
        Self {
            host,
            cache,
            options,
            diag: Diagnostics::new(),
            images: Vec::new(),
            next_image_num: FIRST_LAUNCH_CLOSURE_IMAGE_NUM,
            must_be_missing: Vec::new(),
            used_at_paths: false,
            used_fallback_paths: false,
            interpose_tuples: Vec::new(),
            cache_patches: Vec::new(),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    pub fn take_diagnostics(&mut self) -> Diagnostics {
        std::mem::take(&mut self.diag)
    }

    /// Builds a launch closure for `main_path`. The first error aborts
    /// and is returned; partially built state is discarded with the
    /// builder.
    pub fn build_launch_closure(&mut self, main_path: &Path) -> Result<Vec<u8>, LoadError> {
        let boot_args = match self.options.boot_args {
            Some(args) => args,
            None => self.read_boot_args(main_path),
        };
        if boot_args.force_dyld2 {
            return Err(LoadError::ClosureBuildDisabled {
                path: main_path.to_string_lossy().into_owned(),
            });
        }

        // Seed: inserted dylibs first, then the main executable
        let mut inserted = Vec::new();
        for insert in self.options.env.insert_libraries() {
            let idx = self.load_image_at_path(Path::new(&insert), None, true)?;
            self.images[idx].is_inserted = true;
            self.images[idx].mark_never_unload = true;
            inserted.push(idx);
        }
        let main_idx = self.load_image_at_path(main_path, None, false)?;
        let main_num = self.images[main_idx].image_num;

        let main = &self.images[main_idx];
        if !main.info.is_main_executable() {
            return Err(LoadError::malformed("closure", "top image is not an executable"));
        }
        if self.options.require_pie && !main.info.is_pie() {
            return Err(LoadError::NotPie { path: main.path.clone() });
        }

        // Breadth-first link, then inserted dylibs' own graphs
        self.recursive_load_dependents(main_idx, &mut vec![main_idx])?;
        for idx in inserted {
            self.recursive_load_dependents(idx, &mut vec![idx])?;
        }
        self.load_dangling_upward_links()?;

        self.encode_all_fixups()?;
        self.apply_interposing()?;
        self.record_override_patches(0)?;

        let init_order = self.compute_initializer_order(main_idx);
        let (lib_system_num, lib_dyld_entry) = self.resolve_lib_dyld()?;

        if self.diag.has_error() {
            return Err(self.diag.take_error().expect("has_error"));
        }

        // Serialize
        let image_array = self.serialize_image_array(main_num, &init_order)?;
        let mut cw = LaunchClosureWriter::new(&image_array);
        cw.set_flags(ClosureFlags {
            used_at_paths: self.used_at_paths,
            used_fallback_paths: self.used_fallback_paths,
            init_image_count: self.images.len() as u32,
        });
        if let Some(cache) = self.cache {
            cw.set_dyld_cache_uuid(cache.uuid);
        }
        self.must_be_missing.sort();
        self.must_be_missing.dedup();
        cw.add_missing_files(&self.must_be_missing);
        for var in self.options.env.iter_key_equals_value() {
            cw.add_env_var(&var);
        }
        cw.set_top_image(main_num);
        if let Some(entry) = lib_dyld_entry {
            cw.set_lib_dyld_entry(entry);
        }
        if let Some(num) = lib_system_num {
            cw.set_lib_system_num(num);
        }
        if let Some(uuid) = self.options.boot_uuid.clone() {
            cw.set_boot_uuid(&uuid);
        }
        match self.images[main_idx].info.entry {
            Some(EntryPoint::Main { text_offset }) => cw.set_main_entry(ResolvedSymbolTarget::Image {
                image_num: main_num,
                offset: text_offset,
            }),
            Some(EntryPoint::Start { text_offset }) => cw.set_start_entry(
                ResolvedSymbolTarget::Image { image_num: main_num, offset: text_offset },
            ),
            None => {}
        }
        self.cache_patches.dedup();
        cw.add_cache_overrides(&self.cache_patches);
        cw.add_interpose_tuples(&self.interpose_tuples);
        Ok(cw.finish())
    }

    /// Builds a dlopen closure on top of previously built state: new
    /// images continue the number sequence and only new fixups and
    /// patches are recorded.
    pub fn build_dlopen_closure(
        &mut self,
        path: &Path,
        rtld_local: bool,
    ) -> Result<Vec<u8>, LoadError> {
        let first_new = self.images.len();
        let idx = self.load_image_at_path(path, None, false)?;
        let top_num = self.images[idx].image_num;
        if idx < first_new {
            // already loaded; an empty closure tells the caller dlopen
            // is idempotent here
            let aw = ImageArrayWriter::new(self.next_image_num);
            let mut cw = DlopenClosureWriter::new(&aw.finish());
            cw.set_top_image(top_num);
            return Ok(cw.finish());
        }
        self.images[idx].rtld_local = rtld_local;
        let patches_before = self.cache_patches.len();
        self.recursive_load_dependents(idx, &mut vec![idx])?;
        self.load_dangling_upward_links()?;
        self.encode_new_fixups(first_new)?;
        self.record_override_patches(first_new)?;
        if self.diag.has_error() {
            return Err(self.diag.take_error().expect("has_error"));
        }

        let first_num = self.images[first_new].image_num;
        let mut aw = ImageArrayWriter::new(first_num);
        let new_images: Vec<usize> = (first_new..self.images.len()).collect();
        let init_order = self.compute_initializer_order(idx);
        for &i in &new_images {
            let record = self.serialize_image(i, if i == idx { Some(&init_order) } else { None })?;
            aw.add_image(record);
        }
        let mut cw = DlopenClosureWriter::new(&aw.finish());
        cw.set_top_image(top_num);
        cw.add_cache_overrides(&self.cache_patches[patches_before..]);
        Ok(cw.finish())
    }

    /// Honors the boot-args override file on hosts that carry one. A
    /// malformed or unreadable file is a warning, never a launch
    /// failure.
    fn read_boot_args(&mut self, main_path: &Path) -> BootArgs {
        let boot_args_path = Path::new(BOOT_ARGS_PATH);
        if !self.host.file_exists(boot_args_path) {
            return BootArgs::default();
        }
        let Ok(file) = self.host.load_file(boot_args_path) else {
            return BootArgs::default();
        };
        let Ok(content) = std::str::from_utf8(&file.content) else {
            self.diag.warning("ignoring dyld-bootargs: not utf-8");
            return BootArgs::default();
        };
        match parse_boot_args(content, &main_path.to_string_lossy()) {
            Ok(args) => args,
            Err(e) => {
                self.diag.warning(format!("ignoring dyld-bootargs: {e}"));
                BootArgs::default()
            }
        }
    }

    // ----- image loading -----

    /// Loads (or finds already loaded) the image at `path`, preferring
    /// the shared cache when the on-disk file does not override it.
    fn load_image_at_path(
        &mut self,
        path: &Path,
        client_idx: Option<usize>,
        never_unload: bool,
    ) -> Result<usize, LoadError> {
        let path_str = path.to_string_lossy().into_owned();
        if let Some(existing) = self.images.iter().position(|i| i.path == path_str) {
            return Ok(existing);
        }
        if self.options.deny_list.iter().any(|d| d == &path_str) {
            return Err(LoadError::LoadDenied { path: path_str });
        }

        // Shared-cache fast path
        if let Some(cache) = self.cache {
            if let Some(cache_num) = cache.image_num_for_path(&path_str) {
                let cache_image = cache
                    .image_for_num(cache_num)
                    .ok_or(LoadError::malformed("shared cache", "missing cache image"))?;
                let overridden = self.disk_overrides_cache(&path_str, &cache_image);
                if !overridden {
                    return self.add_cache_image(&path_str, cache_num);
                }
                log::debug!("using on-disk root for cached dylib {path_str}");
                let idx = self.load_disk_image(path, client_idx)?;
                self.images[idx].override_image_num = Some(cache_num);
                self.images[idx].mark_never_unload = true;
                return Ok(idx);
            }
        }

        let idx = self.load_disk_image(path, client_idx)?;
        if never_unload {
            self.images[idx].mark_never_unload = true;
        }
        Ok(idx)
    }

    /// Does a file on disk replace the cached dylib at this path?
    fn disk_overrides_cache(&self, path: &str, cache_image: &crate::closure::Image<'_>) -> bool {
        if !cache_image.overridable_dylib() {
            return false;
        }
        let Some(on_disk) = self.host.file_id(Path::new(path)) else {
            return false;
        };
        match cache_image.file_info() {
            Some(expected) => {
                on_disk.inode != expected.inode || on_disk.mtime != expected.mod_time
            }
            // iOS-style caches do not expect their dylibs on disk; any
            // file present is a root
            None => !self.cache.map(|c| c.dylibs_expected_on_disk).unwrap_or(true),
        }
    }

    fn add_cache_image(&mut self, path: &str, cache_num: ImageNum) -> Result<usize, LoadError> {
        let cache = self.cache.expect("cache image without cache");
        let bytes = cache
            .macho_bytes_for_num(cache_num)
            .ok_or(LoadError::malformed("shared cache", "image has no mach-o"))?;
        let info = SliceInfo::parse(bytes, self.options.arch, Some(self.options.platform), path)?;
        self.images.push(BuilderLoadedImage {
            path: path.to_owned(),
            image_num: cache_num,
            source: ImageSource::Cache,
            info,
            dependents: Vec::new(),
            dependents_resolved: false,
            mark_never_unload: true,
            rtld_local: false,
            is_inserted: false,
            override_image_num: None,
            cd_hash: None,
            rebases: Vec::new(),
            binds: Vec::new(),
            text_fixups: Vec::new(),
            chained_starts: Vec::new(),
            chained_targets: Vec::new(),
            init_offsets: Vec::new(),
        });
        Ok(self.images.len() - 1)
    }

    fn load_disk_image(
        &mut self,
        path: &Path,
        client_idx: Option<usize>,
    ) -> Result<usize, LoadError> {
        let path_str = path.to_string_lossy().into_owned();
        if self.host.sandbox_blocked(&path_str, SandboxOp::FileReadData) {
            return Err(LoadError::SandboxBlocked {
                path: path_str,
                op: SandboxOp::FileReadData,
            });
        }
        let file = self.host.load_file(path)?;
        let (slice_offset, slice_len) =
            analyzer::find_slice(&file.content, self.options.arch, &path_str)?;
        let slice = &file.content[slice_offset as usize..(slice_offset + slice_len) as usize];
        let info =
            SliceInfo::parse(slice, self.options.arch, Some(self.options.platform), &path_str)?;
        let analyzer = MachOAnalyzer::new(slice, &info);
        validate::validate(&analyzer, &path_str, &mut self.diag)?;
        let cd_hash = code_sign::compute_cd_hash(slice, &info, &path_str)?;

        // dylibs loaded by install name get the request path as an alias;
        // the client is only named in errors
        let _ = client_idx;

        let init_offsets = analyzer.initializer_offsets()?;
        self.images.push(BuilderLoadedImage {
            path: path_str,
            image_num: self.next_image_num,
            source: ImageSource::Disk { file, slice_offset, slice_len },
            info,
            dependents: Vec::new(),
            dependents_resolved: false,
            mark_never_unload: false,
            rtld_local: false,
            is_inserted: false,
            override_image_num: None,
            cd_hash,
            rebases: Vec::new(),
            binds: Vec::new(),
            text_fixups: Vec::new(),
            chained_starts: Vec::new(),
            chained_targets: Vec::new(),
            init_offsets,
        });
        self.next_image_num += 1;
        Ok(self.images.len() - 1)
    }

    pub(crate) fn image_bytes(&self, idx: usize) -> &[u8] {
        match &self.images[idx].source {
            ImageSource::Disk { file, slice_offset, slice_len } => {
                &file.content[*slice_offset as usize..(*slice_offset + *slice_len) as usize]
            }
            ImageSource::Cache => self
                .cache
                .and_then(|c| c.macho_bytes_for_num(self.images[idx].image_num))
                .expect("cache image bytes"),
        }
    }

    pub(crate) fn analyzer_for(&self, idx: usize) -> MachOAnalyzer<'_> {
        MachOAnalyzer::new(self.image_bytes(idx), &self.images[idx].info)
    }

    pub(crate) fn index_of_image_num(&self, num: ImageNum) -> Option<usize> {
        self.images.iter().position(|i| i.image_num == num)
    }

    // ----- dependency graph -----

    /// Breadth-first: resolve this image's dependents, then recurse into
    /// each newly named image. `chain` is the loader-path ancestry used
    /// for @rpath expansion; upward edges are deferred.
    fn recursive_load_dependents(
        &mut self,
        idx: usize,
        chain: &mut Vec<usize>,
    ) -> Result<(), LoadError> {
        if self.images[idx].dependents_resolved {
            return Ok(());
        }
        self.images[idx].dependents_resolved = true;

        let deps: Vec<analyzer::DependentDylib> = self.images[idx].info.dependents.clone();
        let mut resolved = Vec::with_capacity(deps.len());
        for dep in &deps {
            match self.load_dependent(idx, dep, chain) {
                Ok(Some(dep_idx)) => {
                    self.check_compat_version(idx, dep, dep_idx)?;
                    resolved.push(LinkedImage {
                        kind: dep.kind,
                        image_num: self.images[dep_idx].image_num,
                    });
                }
                Ok(None) => {
                    resolved.push(LinkedImage {
                        kind: LinkKind::Weak,
                        image_num: MISSING_WEAK_LINKED_IMAGE,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.images[idx].dependents = resolved.clone();

        for dep in &resolved {
            if dep.image_num == MISSING_WEAK_LINKED_IMAGE || dep.kind == LinkKind::Upward {
                continue;
            }
            let Some(dep_idx) = self.index_of_image_num(dep.image_num) else {
                continue;
            };
            chain.push(dep_idx);
            let r = self.recursive_load_dependents(dep_idx, chain);
            chain.pop();
            r?;
        }
        Ok(())
    }

    /// After the normal pass, images referenced only via upward edges
    /// still need their own dependents resolved.
    fn load_dangling_upward_links(&mut self) -> Result<(), LoadError> {
        loop {
            let Some(idx) = self.images.iter().position(|i| !i.dependents_resolved) else {
                return Ok(());
            };
            self.recursive_load_dependents(idx, &mut vec![idx])?;
        }
    }

    fn load_dependent(
        &mut self,
        client_idx: usize,
        dep: &analyzer::DependentDylib,
        chain: &[usize],
    ) -> Result<Option<usize>, LoadError> {
        let mut attempted = Vec::new();
        match self.search_dependent_path(client_idx, &dep.path, chain, &mut attempted) {
            Some(found) => {
                let idx = self.load_image_at_path(&found, Some(client_idx), false)?;
                Ok(Some(idx))
            }
            None => {
                // every probed-and-absent location keeps this closure
                // valid only while it stays absent
                self.must_be_missing.extend(attempted.iter().cloned());
                if dep.kind == LinkKind::Weak {
                    Ok(None)
                } else {
                    Err(LoadError::DependencyMissing {
                        client: self.images[client_idx].path.clone(),
                        path: dep.path.clone(),
                        attempted_paths: attempted,
                    })
                }
            }
        }
    }

    /// Path-variant search. DYLD_FRAMEWORK_PATH (for framework-shaped
    /// dependents) and DYLD_LIBRARY_PATH override by partial/leaf name,
    /// then the expanded install path, then the fallback directories.
    /// Every candidate is probed root-prefixed and suffix-substituted
    /// first (DYLD_ROOT_PATH, DYLD_IMAGE_SUFFIX).
    fn search_dependent_path(
        &mut self,
        client_idx: usize,
        dep_path: &str,
        chain: &[usize],
        attempted: &mut Vec<String>,
    ) -> Option<PathBuf> {
        let leaf = dep_path.rsplit('/').next().unwrap_or(dep_path);
        let framework_partial = framework_partial_path(dep_path);

        if let Some(partial) = framework_partial {
            for dir in self.options.env.framework_paths() {
                if let Some(found) = self.try_candidate(&format!("{dir}/{partial}"), attempted) {
                    return Some(found);
                }
            }
        }
        for dir in self.options.env.library_paths() {
            if let Some(found) = self.try_candidate(&format!("{dir}/{leaf}"), attempted) {
                return Some(found);
            }
        }

        for expanded in self.expand_dependent_path(client_idx, dep_path, chain) {
            if let Some(found) = self.try_candidate(&expanded, attempted) {
                return Some(found);
            }
        }

        if let Some(partial) = framework_partial {
            for dir in self.options.env.fallback_framework_paths() {
                if let Some(found) = self.try_candidate(&format!("{dir}/{partial}"), attempted) {
                    self.used_fallback_paths = true;
                    return Some(found);
                }
            }
        }
        for dir in self.options.env.fallback_library_paths() {
            if let Some(found) = self.try_candidate(&format!("{dir}/{leaf}"), attempted) {
                self.used_fallback_paths = true;
                return Some(found);
            }
        }
        None
    }

    /// Probes one search candidate in the order dyld would: each
    /// DYLD_ROOT_PATH prefix (absolute paths only) before the plain
    /// path, and within each the DYLD_IMAGE_SUFFIX variant before the
    /// unsuffixed one. Misses land in `attempted`.
    fn try_candidate(&self, path: &str, attempted: &mut Vec<String>) -> Option<PathBuf> {
        let suffix = self.options.env.image_suffix().map(str::to_owned);
        let mut variants = Vec::new();
        if path.starts_with('/') {
            for root in self.options.env.root_paths() {
                variants.push(format!("{root}{path}"));
            }
        }
        variants.push(path.to_owned());

        for variant in variants {
            if let Some(suffix) = &suffix {
                let with_suffix = add_image_suffix(&variant, suffix);
                if self.candidate_exists(&with_suffix) {
                    return Some(PathBuf::from(with_suffix));
                }
                attempted.push(with_suffix);
            }
            if self.candidate_exists(&variant) {
                return Some(PathBuf::from(variant));
            }
            attempted.push(variant);
        }
        None
    }

    fn candidate_exists(&self, path: &str) -> bool {
        if self.cache.is_some_and(|c| c.image_num_for_path(path).is_some()) {
            return true;
        }
        self.host.file_exists(Path::new(path))
    }

    /// Expands @executable_path, @loader_path and @rpath. The @rpath
    /// stack is the RPATHs of every ancestor in the load chain, direct
    /// parent first, main executable last.
    fn expand_dependent_path(
        &mut self,
        client_idx: usize,
        dep_path: &str,
        chain: &[usize],
    ) -> Vec<String> {
        fn dir_of(path: &str) -> &str {
            path.rsplit_once('/').map(|(d, _)| d).unwrap_or(".")
        }

        if let Some(rest) = dep_path.strip_prefix("@executable_path/") {
            self.used_at_paths = true;
            let main_dir = dir_of(&self.images[0].path).to_owned();
            let exe_dir = chain
                .first()
                .map(|&i| dir_of(&self.images[i].path).to_owned())
                .unwrap_or(main_dir);
            return vec![format!("{exe_dir}/{rest}")];
        }
        if let Some(rest) = dep_path.strip_prefix("@loader_path/") {
            self.used_at_paths = true;
            return vec![format!("{}/{rest}", dir_of(&self.images[client_idx].path))];
        }
        if let Some(rest) = dep_path.strip_prefix("@rpath/") {
            self.used_at_paths = true;
            let mut candidates = Vec::new();
            // direct parent up through the main executable
            for &ancestor in chain.iter().rev() {
                let ancestor_path = self.images[ancestor].path.clone();
                for rpath in self.images[ancestor].info.rpaths.clone() {
                    let base = if let Some(r) = rpath.strip_prefix("@loader_path/") {
                        format!("{}/{r}", dir_of(&ancestor_path))
                    } else if let Some(r) = rpath.strip_prefix("@executable_path/") {
                        let exe = chain.first().copied().unwrap_or(ancestor);
                        format!("{}/{r}", dir_of(&self.images[exe].path))
                    } else {
                        rpath.clone()
                    };
                    candidates.push(format!("{base}/{rest}"));
                }
            }
            return candidates;
        }
        vec![dep_path.to_owned()]
    }

    fn check_compat_version(
        &mut self,
        client_idx: usize,
        dep: &analyzer::DependentDylib,
        dep_idx: usize,
    ) -> Result<(), LoadError> {
        if dep.compat_version.0 == 0 {
            return Ok(()); // client does not enforce a version
        }
        match self.images[dep_idx].info.dylib_compat_version {
            Some(found) if found < dep.compat_version => Err(LoadError::CompatVersionTooOld {
                client: self.images[client_idx].path.clone(),
                dep: self.images[dep_idx].path.clone(),
                found,
                required: dep.compat_version,
            }),
            Some(_) => Ok(()),
            None => {
                self.diag.warning(format!(
                    "{} has no compatibility version, required {} by {}",
                    self.images[dep_idx].path, dep.compat_version, self.images[client_idx].path
                ));
                Ok(())
            }
        }
    }

    // ----- fixup encoding -----

    fn encode_all_fixups(&mut self) -> Result<(), LoadError> {
        self.encode_new_fixups(0)
    }

    fn encode_new_fixups(&mut self, first: usize) -> Result<(), LoadError> {
        for idx in first..self.images.len() {
            if self.images[idx].in_cache() {
                continue; // cache images carry no per-process fixups
            }
            if self.images[idx].info.uses_chained_fixups() {
                self.encode_chained_fixups(idx)?;
            } else {
                self.encode_opcode_fixups(idx)?;
            }
        }
        Ok(())
    }

    fn encode_opcode_fixups(&mut self, idx: usize) -> Result<(), LoadError> {
        struct RawBind {
            vm_offset: u64,
            kind: u8,
            lib_ordinal: i64,
            symbol: String,
            weak_import: bool,
            addend: i64,
            strong_override: bool,
        }

        let (rebases, raw_binds) = {
            let analyzer = self.analyzer_for(idx);
            let info = analyzer.info;
            let base = info.preferred_load_address();
            let seg_vm_offset = |seg_index: u32, seg_offset: u64| {
                info.segments[seg_index as usize].vm_addr - base + seg_offset
            };

            let mut rebases = Vec::new();
            let mut text_rebases = Vec::new();
            analyzer.for_each_rebase(|loc| {
                let off = seg_vm_offset(loc.segment_index, loc.segment_offset);
                if loc.kind == crate::mach_o::opcodes::REBASE_TYPE_POINTER {
                    rebases.push(off);
                } else {
                    text_rebases.push(off);
                }
                ControlFlow::Continue(())
            })?;
            if !text_rebases.is_empty() {
                // text rebases are rare (i386) and already validated to
                // live in __TEXT; they slide like pointers
                rebases.extend(text_rebases);
                rebases.sort();
            }

            let mut raw_binds = Vec::new();
            analyzer.for_each_bind(|b| {
                raw_binds.push(RawBind {
                    vm_offset: seg_vm_offset(b.segment_index, b.segment_offset),
                    kind: b.kind,
                    lib_ordinal: b.lib_ordinal,
                    symbol: b.symbol_name.to_owned(),
                    weak_import: b.weak_import,
                    addend: b.addend,
                    strong_override: false,
                });
                ControlFlow::Continue(())
            })?;
            analyzer.for_each_weak_bind(|b| {
                raw_binds.push(RawBind {
                    vm_offset: seg_vm_offset(b.segment_index, b.segment_offset),
                    kind: b.kind,
                    lib_ordinal: crate::mach_o::opcodes::BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
                    symbol: b.symbol_name.to_owned(),
                    weak_import: b.weak_import,
                    addend: b.addend,
                    strong_override: b.strong_override,
                });
                ControlFlow::Continue(())
            })?;
            (rebases, raw_binds)
        };

        self.images[idx].rebases = rebases;

        for bind in raw_binds {
            if bind.strong_override {
                self.record_strong_override_patches(idx, &bind.symbol)?;
                continue;
            }
            let target = self.resolve_bind(
                idx,
                bind.lib_ordinal,
                &bind.symbol,
                bind.weak_import,
                bind.addend,
            )?;
            match bind.kind {
                mach_o::opcodes::REBASE_TYPE_POINTER => {
                    self.images[idx]
                        .binds
                        .push(patterns::BindFixup { vm_offset: bind.vm_offset, target });
                }
                _ => {
                    self.images[idx]
                        .text_fixups
                        .push((bind.vm_offset as u32, target));
                }
            }
        }
        Ok(())
    }

    fn encode_chained_fixups(&mut self, idx: usize) -> Result<(), LoadError> {
        struct RawImport {
            lib_ordinal: i64,
            weak_import: bool,
            symbol: String,
        }

        let (starts, imports) = {
            let analyzer = self.analyzer_for(idx);
            let range = analyzer.info.linkedit.chained_fixups;
            let start = range.file_offset as usize;
            let blob = analyzer
                .data
                .get(start..start + range.size as usize)
                .ok_or(LoadError::malformed("chained fixups", "blob outside file"))?;
            let fixups = chained::ChainedFixups::parse(blob, analyzer.info)?;
            // walk every chain now so malformed chains fail the build,
            // not the launch
            for &chain_start in &fixups.starts {
                chained::walk_chain(analyzer.data, analyzer.info, chain_start, &mut |_, _, _| {
                    ControlFlow::Continue(())
                })?;
            }
            let imports: Vec<RawImport> = fixups
                .imports
                .iter()
                .map(|i| RawImport {
                    lib_ordinal: i.lib_ordinal,
                    weak_import: i.weak_import,
                    symbol: i.symbol_name.to_owned(),
                })
                .collect();
            (fixups.starts, imports)
        };

        let mut targets = Vec::with_capacity(imports.len());
        for import in &imports {
            targets.push(self.resolve_bind(
                idx,
                import.lib_ordinal,
                &import.symbol,
                import.weak_import,
                0,
            )?);
        }
        self.images[idx].chained_starts = starts;
        self.images[idx].chained_targets = targets;
        Ok(())
    }

    // ----- interposing -----

    /// Reads `__DATA,__interpose` tuples out of inserted dylibs and
    /// rewrites every already-encoded bind whose target matches a stock
    /// implementation.
    fn apply_interposing(&mut self) -> Result<(), LoadError> {
        let inserted: Vec<usize> = (0..self.images.len())
            .filter(|&i| self.images[i].is_inserted && !self.images[i].in_cache())
            .collect();
        let mut tuples = Vec::new();
        for idx in inserted {
            let Some(section) = self.images[idx].info.interpose_section().cloned() else {
                continue;
            };
            let ptr_size = self.images[idx].info.pointer_size();
            let base = self.images[idx].info.preferred_load_address();
            let sect_start = section.addr - base;
            let tuple_size = 2 * ptr_size;
            let count = section.size / tuple_size;
            for t in 0..count {
                let new_loc = sect_start + t * tuple_size;
                let stock_loc = new_loc + ptr_size;
                let new_impl = self.fixup_target_at(idx, new_loc);
                let stock_impl = self.fixup_target_at(idx, stock_loc);
                match (new_impl, stock_impl) {
                    (Some(new), Some(stock)) => tuples.push(InterposingTuple {
                        stock_implementation: stock,
                        new_implementation: new,
                    }),
                    _ => {
                        self.diag.warning(format!(
                            "ignoring malformed __interpose tuple {t} in {}",
                            self.images[idx].path
                        ));
                    }
                }
            }
        }
        if tuples.is_empty() {
            return Ok(());
        }

        for image in &mut self.images {
            for bind in &mut image.binds {
                for tuple in &tuples {
                    if bind.target == tuple.stock_implementation {
                        bind.target = tuple.new_implementation;
                    }
                }
            }
            for target in &mut image.chained_targets {
                for tuple in &tuples {
                    if *target == tuple.stock_implementation {
                        *target = tuple.new_implementation;
                    }
                }
            }
        }

        // stock implementations living in the cache need the cache
        // patched too
        for tuple in &tuples {
            if let ResolvedSymbolTarget::SharedCache { offset } = tuple.stock_implementation {
                self.add_cache_patch_for_offset(offset, tuple.new_implementation)?;
            }
        }
        self.interpose_tuples.extend(tuples);
        Ok(())
    }

    /// What the pointer at `vm_offset` in image `idx` resolves to,
    /// according to the fixups encoded so far. Rebases resolve to
    /// the image-local value stored in the file.
    fn fixup_target_at(&self, idx: usize, vm_offset: u64) -> Option<ResolvedSymbolTarget> {
        let image = &self.images[idx];
        if let Some(bind) = image.binds.iter().find(|b| b.vm_offset == vm_offset) {
            return Some(bind.target);
        }
        if image.rebases.contains(&vm_offset) {
            // read the on-disk slot to learn where it points
            let info = &image.info;
            let seg = info.segment_containing(vm_offset)?;
            let base = info.preferred_load_address();
            let file_off = (seg.file_offset + (vm_offset - (seg.vm_addr - base))) as usize;
            let bytes = self.image_bytes(idx);
            let raw = if info.pointer_size() == 8 {
                u64::from_le_bytes(bytes.get(file_off..file_off + 8)?.try_into().ok()?)
            } else {
                u32::from_le_bytes(bytes.get(file_off..file_off + 4)?.try_into().ok()?) as u64
            };
            return Some(ResolvedSymbolTarget::Image {
                image_num: image.image_num,
                offset: raw.checked_sub(base)?,
            });
        }
        None
    }

    // ----- initializer order -----

    /// Depth-first over non-upward edges; an image's initializers run
    /// strictly after all of its dependents'. Dangling upward images are
    /// appended last.
    fn compute_initializer_order(&self, top_idx: usize) -> Vec<ImageNum> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.visit_for_init(top_idx, &mut visited, &mut order);
        // inserted dylibs and upward-only images
        for idx in 0..self.images.len() {
            self.visit_for_init(idx, &mut visited, &mut order);
        }
        order
    }

    fn visit_for_init(
        &self,
        idx: usize,
        visited: &mut HashSet<ImageNum>,
        order: &mut Vec<ImageNum>,
    ) {
        let num = self.images[idx].image_num;
        if !visited.insert(num) {
            return;
        }
        for dep in &self.images[idx].dependents {
            if dep.image_num == MISSING_WEAK_LINKED_IMAGE || dep.kind == LinkKind::Upward {
                continue;
            }
            if let Some(dep_idx) = self.index_of_image_num(dep.image_num) {
                self.visit_for_init(dep_idx, visited, order);
            }
        }
        let has_inits = if self.images[idx].in_cache() {
            self.cache
                .and_then(|c| c.image_for_num(num))
                .map(|i| i.has_initializers())
                .unwrap_or(false)
        } else {
            !self.images[idx].init_offsets.is_empty()
        };
        if has_inits {
            order.push(num);
        }
    }

    // ----- libdyld entry -----

    /// Records which image is libSystem and resolves the libdyld entry
    /// vector, verifying its format version against ours.
    fn resolve_lib_dyld(&mut self) -> Result<(Option<ImageNum>, Option<ResolvedSymbolTarget>), LoadError> {
        let lib_system = self
            .images
            .iter()
            .find(|i| i.path == LIB_SYSTEM_PATH)
            .map(|i| i.image_num);
        let Some(lib_system_num) = lib_system else {
            // bare closures (tools, tests) launch without libSystem
            return Ok((None, None));
        };

        let lib_dyld_idx = self
            .images
            .iter()
            .position(|i| i.path == LIB_DYLD_PATH)
            .or_else(|| self.index_of_image_num(lib_system_num));
        let Some(idx) = lib_dyld_idx else {
            return Err(LoadError::LibDyldEntry { problem: "missing" });
        };

        let Some((target, value_offset)) = self.find_export_for_entry(idx)? else {
            return Err(LoadError::LibDyldEntry { problem: "missing entry vector" });
        };

        // the vector's first word is its binary format version
        let bytes = self.image_bytes(idx);
        let info = &self.images[idx].info;
        let base = info.preferred_load_address();
        let version = info
            .segment_containing(value_offset)
            .and_then(|seg| {
                let file_off = (seg.file_offset + (value_offset - (seg.vm_addr - base))) as usize;
                bytes.get(file_off..file_off + 4)
            })
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        match version {
            Some(v) if v == FORMAT_VERSION => Ok((Some(lib_system_num), Some(target))),
            Some(_) => Err(LoadError::LibDyldEntry { problem: "incompatible" }),
            None => Err(LoadError::LibDyldEntry { problem: "unreadable entry vector" }),
        }
    }

    fn find_export_for_entry(
        &self,
        idx: usize,
    ) -> Result<Option<(ResolvedSymbolTarget, u64)>, LoadError> {
        let analyzer = self.analyzer_for(idx);
        let Some(sym) = analyzer.find_exported_symbol(ENTRY_VECTOR_SYMBOL)? else {
            return Ok(None);
        };
        let target = self.target_for_export(idx, sym.value, 0);
        Ok(Some((target, sym.value)))
    }

    // ----- serialization -----

    fn serialize_image_array(
        &self,
        _top_num: ImageNum,
        init_order: &[ImageNum],
    ) -> Result<Vec<u8>, LoadError> {
        let mut aw = ImageArrayWriter::new(FIRST_LAUNCH_CLOSURE_IMAGE_NUM);
        let mut new_images: Vec<usize> =
            (0..self.images.len()).filter(|&i| !self.images[i].in_cache()).collect();
        new_images.sort_by_key(|&i| self.images[i].image_num);
        for idx in new_images {
            let is_top = self.images[idx].info.is_main_executable();
            let record =
                self.serialize_image(idx, if is_top { Some(init_order) } else { None })?;
            aw.add_image(record);
        }
        Ok(aw.finish())
    }

    fn serialize_image(
        &self,
        idx: usize,
        init_order: Option<&[ImageNum]>,
    ) -> Result<Vec<u8>, LoadError> {
        let image = &self.images[idx];
        let info = &image.info;
        crate::closure::writer::check_image_num_range(image.image_num)?;

        let mut flags = ImageFlags::empty();
        if info.is_64() {
            flags |= ImageFlags::IS_64;
        }
        if info.is_dylib() {
            flags |= ImageFlags::IS_DYLIB;
        }
        if info.is_bundle() {
            flags |= ImageFlags::IS_BUNDLE;
        }
        if info.is_main_executable() {
            flags |= ImageFlags::IS_EXECUTABLE;
        }
        if info.has_objc() {
            flags |= ImageFlags::HAS_OBJC;
        }
        if info.may_have_plus_loads() {
            flags |= ImageFlags::MAY_HAVE_PLUS_LOADS;
        }
        if info.exports_weak_defs() {
            flags |= ImageFlags::HAS_WEAK_DEFS;
        }
        if image.mark_never_unload || info.has_thread_local_variables() {
            flags |= ImageFlags::NEVER_UNLOAD;
        }
        if info.arch.page_size() == mach_o::PAGE_SIZE_16K {
            flags |= ImageFlags::HAS_16KB_PAGES;
        }
        if info.encryption.is_some() {
            flags |= ImageFlags::IS_ENCRYPTED;
        }

        let mut iw = ImageWriter::new(ImageFlagsWord {
            image_num: image.image_num,
            max_load_count: self.images.len() as u32,
            flags,
        });
        iw.add_path(&image.path);
        if let Some(install_name) = &info.install_name {
            if install_name != &image.path {
                iw.add_path(install_name);
            }
        }
        if let ImageSource::Disk { file, slice_offset, .. } = &image.source {
            if let Some(id) = file.file_id {
                iw.set_file_info(FileInfo { inode: id.inode, mod_time: id.mtime });
            }
            if let Some(cd) = image.cd_hash {
                iw.set_cd_hash(cd.hash);
            }
            if let Some(uuid) = info.uuid {
                iw.set_uuid(uuid);
            }
            let page_size = info.arch.page_size();
            let vm_size = info.vm_size_to_map();
            iw.set_mapping_info(MappingInfo {
                total_vm_pages: (vm_size.div_ceil(page_size)) as u32,
                slice_offset_4k: (slice_offset / mach_o::PAGE_SIZE_4K) as u32,
            });
            iw.set_disk_segments(&self.disk_segments_for(info));
        }
        iw.set_dependents(&image.dependents);
        iw.set_init_offsets(&image.init_offsets);
        iw.set_dof_offsets(&info.dof_section_offsets());
        if !info.linkedit.code_signature.is_empty() {
            iw.set_code_signature_location(
                info.linkedit.code_signature.file_offset,
                info.linkedit.code_signature.size,
            );
        }
        if let Some(enc) = info.encryption {
            let page = info.arch.page_size() as u32;
            iw.set_fairplay_range(FairPlayRange {
                text_start_page: enc.text_offset / page,
                text_page_count: enc.size.div_ceil(page),
            });
        }
        let ptr_size = info.pointer_size();
        iw.set_rebase_patterns(&patterns::compress_rebases(&image.rebases, ptr_size)?);
        iw.set_bind_patterns(&patterns::compress_binds(&image.binds, ptr_size)?);
        let text: Vec<patterns::TextFixupPattern> = image
            .text_fixups
            .iter()
            .map(|&(start, target)| patterns::TextFixupPattern {
                target,
                start_vm_offset: start,
                repeat_count: 1,
                skip_count: 0,
            })
            .collect();
        iw.set_text_fixup_patterns(&text);
        iw.set_chained_starts(&image.chained_starts);
        iw.set_chained_targets(&image.chained_targets);
        if let Some(over) = image.override_image_num {
            iw.set_override_of_cache_image(over);
        }
        if let Some(order) = init_order {
            iw.set_init_order(order);
        }
        Ok(iw.finish())
    }

    /// Page-count form of the segment table, with padding records for
    /// non-contiguous layouts.
    fn disk_segments_for(&self, info: &SliceInfo) -> Vec<DiskSegment> {
        let page = info.arch.page_size();
        let base = info.preferred_load_address();
        let mut out = Vec::new();
        let mut vm_cursor = 0u64;
        let mut file_cursor = 0u64;
        for seg in &info.segments {
            let vm_start = seg.vm_addr - base;
            let vm_gap = vm_start.saturating_sub(vm_cursor);
            let file_gap = seg.file_offset.saturating_sub(file_cursor);
            if vm_gap > 0 || file_gap > 0 {
                out.push(DiskSegment {
                    file_page_count: (file_gap / page) as u32,
                    vm_page_count: (vm_gap / page) as u32,
                    permissions: 0,
                    padding_not_seg: true,
                });
            }
            let file_pages = (seg.file_size.div_ceil(page)) as u32;
            let vm_pages = (seg.vm_size.div_ceil(page)) as u32;
            out.push(DiskSegment {
                file_page_count: file_pages,
                vm_page_count: vm_pages,
                permissions: seg.init_prot & 0x7,
                padding_not_seg: false,
            });
            vm_cursor = vm_start + vm_pages as u64 * page;
            file_cursor = seg.file_offset + file_pages as u64 * page;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_partial_paths() {
        assert_eq!(
            framework_partial_path("/System/Library/Frameworks/Foo.framework/Versions/A/Foo"),
            Some("Foo.framework/Versions/A/Foo")
        );
        assert_eq!(
            framework_partial_path("Bar.framework/Bar"),
            Some("Bar.framework/Bar")
        );
        assert_eq!(framework_partial_path("/usr/lib/libx.dylib"), None);
    }

    #[test]
    fn image_suffix_placement() {
        assert_eq!(add_image_suffix("/a/libx.dylib", "_debug"), "/a/libx_debug.dylib");
        assert_eq!(
            add_image_suffix("/F.framework/F", "_debug"),
            "/F.framework/F_debug"
        );
    }
}
