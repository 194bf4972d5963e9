//! Symbol resolution: maps `(client, ordinal, name)` to a
//! [`ResolvedSymbolTarget`], chasing re-exports and handling the special
//! self / main-executable / flat / weak-coalesce ordinals.

use crate::builder::{BuilderLoadedImage, ClosureBuilder};
use crate::closure::{ImageNum, PatchEntry, ResolvedSymbolTarget, MISSING_WEAK_LINKED_IMAGE};
use crate::diagnostics::LoadError;
use crate::host::Host;
use crate::mach_o::export_trie::ExportKind;
use crate::mach_o::opcodes::{
    BIND_SPECIAL_DYLIB_FLAT_LOOKUP, BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE, BIND_SPECIAL_DYLIB_SELF,
    BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
};
use crate::mach_o::LinkKind;

/// Where a lookup landed, before being turned into a target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FoundSymbol {
    pub image_idx: usize,
    pub value: u64,
    pub is_absolute: bool,
    pub is_weak_def: bool,
}

impl<'a, H: Host> ClosureBuilder<'a, H> {
    /// Resolves one bind. Weak imports with no definition become
    /// `Absolute{0}`; missing strong imports are fatal with full
    /// client/target/symbol context.
    pub(crate) fn resolve_bind(
        &mut self,
        client_idx: usize,
        lib_ordinal: i64,
        name: &str,
        weak_import: bool,
        addend: i64,
    ) -> Result<ResolvedSymbolTarget, LoadError> {
        let missing = |builder: &Self, target: String| LoadError::SymbolMissing {
            client: builder.images[client_idx].path.clone(),
            target,
            symbol: name.to_owned(),
        };

        if lib_ordinal >= 1 {
            let dep = self.images[client_idx]
                .dependents
                .get(lib_ordinal as usize - 1)
                .copied()
                .ok_or(LoadError::malformed("bind", "library ordinal out of range"))?;
            if dep.image_num == MISSING_WEAK_LINKED_IMAGE {
                // scenario: weak-linked dylib absent; every bind against
                // that slot resolves to NULL
                return Ok(ResolvedSymbolTarget::Absolute { value: 0 });
            }
            let dep_idx = self
                .index_of_image_num(dep.image_num)
                .ok_or(LoadError::malformed("bind", "dependent not loaded"))?;
            return match self.find_in_image(dep_idx, name, 0)? {
                Some(found) => Ok(self.found_to_target(&found, addend)),
                None if weak_import => Ok(ResolvedSymbolTarget::Absolute { value: 0 }),
                None => Err(missing(self, self.images[dep_idx].path.clone())),
            };
        }

        match lib_ordinal {
            BIND_SPECIAL_DYLIB_SELF => match self.find_in_image(client_idx, name, 0)? {
                Some(found) => Ok(self.found_to_target(&found, addend)),
                None if weak_import => Ok(ResolvedSymbolTarget::Absolute { value: 0 }),
                None => Err(missing(self, self.images[client_idx].path.clone())),
            },
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => {
                let main_idx = self
                    .images
                    .iter()
                    .position(|i| i.info.is_main_executable())
                    .ok_or(LoadError::malformed("bind", "no main executable loaded"))?;
                match self.find_in_image(main_idx, name, 0)? {
                    Some(found) => Ok(self.found_to_target(&found, addend)),
                    None if weak_import => Ok(ResolvedSymbolTarget::Absolute { value: 0 }),
                    None => Err(missing(self, self.images[main_idx].path.clone())),
                }
            }
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => match self.flat_lookup(name)? {
                Some(found) => Ok(self.found_to_target(&found, addend)),
                None if weak_import => Ok(ResolvedSymbolTarget::Absolute { value: 0 }),
                None => Err(missing(self, "flat namespace".into())),
            },
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => self.weak_coalesce(client_idx, name, weak_import, addend),
            other => Err(LoadError::malformed(
                "bind",
                format!("unknown special library ordinal {other}"),
            )),
        }
    }

    /// Looks `name` up in one image, following re-export redirections
    /// transitively. Recursion is bounded by the closure's image count,
    /// which refuses dependency cycles by construction.
    pub(crate) fn find_in_image(
        &self,
        idx: usize,
        name: &str,
        depth: usize,
    ) -> Result<Option<FoundSymbol>, LoadError> {
        if depth > self.images.len() {
            return Err(LoadError::malformed("export trie", "re-export chain too deep"));
        }
        let analyzer = self.analyzer_for(idx);
        if let Some(sym) = analyzer.find_exported_symbol(name)? {
            if let Some(re) = &sym.re_export {
                let dep = self.images[idx]
                    .dependents
                    .get(re.dependent_ordinal as usize - 1)
                    .copied();
                let Some(dep) = dep else {
                    return Ok(None);
                };
                if dep.image_num == MISSING_WEAK_LINKED_IMAGE {
                    return Ok(None);
                }
                let Some(dep_idx) = self.index_of_image_num(dep.image_num) else {
                    return Ok(None);
                };
                let imported = if re.imported_name.is_empty() { name } else { &re.imported_name };
                return self.find_in_image(dep_idx, imported, depth + 1);
            }
            return Ok(Some(FoundSymbol {
                image_idx: idx,
                value: sym.value,
                is_absolute: sym.kind == ExportKind::Absolute,
                is_weak_def: sym.is_weak_def,
            }));
        }

        // not exported here; a re-exported dependent may still provide it
        for dep in &self.images[idx].dependents {
            if dep.kind != LinkKind::ReExport || dep.image_num == MISSING_WEAK_LINKED_IMAGE {
                continue;
            }
            if let Some(dep_idx) = self.index_of_image_num(dep.image_num) {
                if let Some(found) = self.find_in_image(dep_idx, name, depth + 1)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    /// Flat namespace: every non-RTLD_LOCAL image in load order, first
    /// definition wins.
    fn flat_lookup(&self, name: &str) -> Result<Option<FoundSymbol>, LoadError> {
        for idx in 0..self.images.len() {
            if self.images[idx].rtld_local {
                continue;
            }
            if let Some(found) = self.find_in_image(idx, name, 0)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Weak-def coalescing: first strong definition wins across the
    /// weak-def images in load order, else the first weak one. A
    /// non-cache winner obligates patches for every loaded cache image
    /// that also defines the symbol.
    fn weak_coalesce(
        &mut self,
        client_idx: usize,
        name: &str,
        weak_import: bool,
        addend: i64,
    ) -> Result<ResolvedSymbolTarget, LoadError> {
        let mut first_strong: Option<FoundSymbol> = None;
        let mut first_weak: Option<FoundSymbol> = None;
        for idx in 0..self.images.len() {
            if !self.images[idx].info.exports_weak_defs() {
                continue;
            }
            if let Some(found) = self.find_in_image(idx, name, 0)? {
                if !found.is_weak_def {
                    if first_strong.is_none() {
                        first_strong = Some(found);
                        break; // strong wins outright
                    }
                } else if first_weak.is_none() {
                    first_weak = Some(found);
                }
            }
        }
        let Some(winner) = first_strong.or(first_weak) else {
            if weak_import {
                return Ok(ResolvedSymbolTarget::Absolute { value: 0 });
            }
            return Err(LoadError::SymbolMissing {
                client: self.images[client_idx].path.clone(),
                target: "weak coalesce".into(),
                symbol: name.to_owned(),
            });
        };

        let target = self.found_to_target(&winner, addend);
        if !self.images[winner.image_idx].in_cache() {
            let replacement = self.found_to_target(&winner, 0);
            self.patch_cache_definitions(name, replacement)?;
        }
        Ok(target)
    }

    /// An image with a strong definition of `name` published a
    /// non-weak-definition marker: the cache's copies must be patched.
    pub(crate) fn record_strong_override_patches(
        &mut self,
        idx: usize,
        name: &str,
    ) -> Result<(), LoadError> {
        let Some(found) = self.find_in_image(idx, name, 0)? else {
            // marker for a symbol this image doesn't actually export
            log::debug!("strong-override marker without definition: {name}");
            return Ok(());
        };
        if self.images[found.image_idx].in_cache() {
            return Ok(());
        }
        let replacement = self.found_to_target(&found, 0);
        self.patch_cache_definitions(name, replacement)
    }

    /// Adds a patch entry for every loaded cache image whose patch table
    /// carries `name`.
    fn patch_cache_definitions(
        &mut self,
        name: &str,
        replacement: ResolvedSymbolTarget,
    ) -> Result<(), LoadError> {
        let Some(cache) = self.cache else {
            return Ok(());
        };
        let mut new_patches = Vec::new();
        for image in &self.images {
            if !image.in_cache() {
                continue;
            }
            let Some(cache_image) = cache.image_for_num(image.image_num) else {
                continue;
            };
            cache_image.for_each_patchable_export(&mut |impl_off, _locs, export_name| {
                if export_name == name {
                    new_patches.push(PatchEntry {
                        overridden_dylib_in_cache: image.image_num,
                        export_cache_offset: impl_off,
                        replacement,
                    });
                }
            })?;
        }
        self.push_patches(new_patches);
        Ok(())
    }

    /// A dylib root replaces a cached dylib: every patchable export of
    /// the cached copy is redirected to the root's definition (or NULL
    /// if the root dropped the export).
    pub(crate) fn record_override_patches(&mut self, first: usize) -> Result<(), LoadError> {
        let Some(cache) = self.cache else {
            return Ok(());
        };
        for idx in first..self.images.len() {
            let Some(cache_num) = self.images[idx].override_image_num else {
                continue;
            };
            let Some(cache_image) = cache.image_for_num(cache_num) else {
                continue;
            };
            let mut exports = Vec::new();
            cache_image.for_each_patchable_export(&mut |impl_off, _locs, name| {
                exports.push((impl_off, name.to_owned()));
            })?;
            let mut new_patches = Vec::with_capacity(exports.len());
            for (impl_off, name) in exports {
                let replacement = match self.find_in_image(idx, &name, 0)? {
                    Some(found) => self.found_to_target(&found, 0),
                    None => ResolvedSymbolTarget::Absolute { value: 0 },
                };
                new_patches.push(PatchEntry {
                    overridden_dylib_in_cache: cache_num,
                    export_cache_offset: impl_off,
                    replacement,
                });
            }
            self.push_patches(new_patches);
        }
        Ok(())
    }

    /// Patch obligation for an interposed implementation living at a raw
    /// cache offset: find which cached dylib exports it.
    pub(crate) fn add_cache_patch_for_offset(
        &mut self,
        cache_offset: u64,
        replacement: ResolvedSymbolTarget,
    ) -> Result<(), LoadError> {
        let Some(cache) = self.cache else {
            return Ok(());
        };
        let array = cache.image_array();
        let first = array.first_image_num();
        for i in 0..array.image_count() {
            let num: ImageNum = first + i;
            let Some(cache_image) = array.image_for_num(num) else {
                continue;
            };
            let mut matched = false;
            cache_image.for_each_patchable_export(&mut |impl_off, _locs, _name| {
                if impl_off as u64 == cache_offset {
                    matched = true;
                }
            })?;
            if matched {
                self.push_patches(vec![PatchEntry {
                    overridden_dylib_in_cache: num,
                    export_cache_offset: cache_offset as u32,
                    replacement,
                }]);
                return Ok(());
            }
        }
        self.diag
            .warning(format!("interposed cache offset {cache_offset:#x} is not patchable"));
        Ok(())
    }

    fn push_patches(&mut self, patches: Vec<PatchEntry>) {
        for patch in patches {
            if !self.cache_patches.contains(&patch) {
                self.cache_patches.push(patch);
            }
        }
    }

    /// Converts a lookup result into the 8-byte target form.
    pub(crate) fn found_to_target(
        &self,
        found: &FoundSymbol,
        addend: i64,
    ) -> ResolvedSymbolTarget {
        if found.is_absolute {
            return ResolvedSymbolTarget::Absolute { value: found.value as i64 + addend };
        }
        self.target_for_export(found.image_idx, found.value, addend)
    }

    /// Target for a regular export at `value` (an image offset) in image
    /// `idx`: cache-relative for cached dylibs, image-relative otherwise.
    pub(crate) fn target_for_export(
        &self,
        idx: usize,
        value: u64,
        addend: i64,
    ) -> ResolvedSymbolTarget {
        let image: &BuilderLoadedImage = &self.images[idx];
        if image.in_cache() {
            let macho_offset = self
                .cache
                .and_then(|c| c.entry_for_num(image.image_num))
                .map(|e| e.macho_offset as u64)
                .unwrap_or(0);
            ResolvedSymbolTarget::SharedCache {
                offset: (macho_offset + value).wrapping_add(addend as u64),
            }
        } else {
            ResolvedSymbolTarget::Image {
                image_num: image.image_num,
                offset: value.wrapping_add(addend as u64),
            }
        }
    }
}
