//! Export trie walking. The trie is a prefix tree keyed by symbol name;
//! leaves carry `(flags, value)` and optional re-export redirection.

use crate::diagnostics::LoadError;
use crate::mach_o::leb::read_uleb128;

// usr/include/mach-o/loader.h, EXPORT_SYMBOL_FLAGS_*
pub const EXPORT_KIND_MASK: u64 = 0x03;
pub const EXPORT_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_REEXPORT: u64 = 0x08;
pub const EXPORT_STUB_AND_RESOLVER: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Regular,
    ThreadLocal,
    Absolute,
}

/// A symbol found in an export trie. `value` is an image offset for
/// regular/thread-local exports and a literal for absolute ones. A
/// re-export points at a dependent by load ordinal; the caller resolves
/// it there (possibly under a different name).
#[derive(Debug, Clone)]
pub struct ExportedSymbol {
    pub kind: ExportKind,
    pub value: u64,
    pub is_weak_def: bool,
    pub re_export: Option<ReExport>,
    /// With `STUB_AND_RESOLVER`, `value` is the stub and this is the
    /// resolver function's image offset.
    pub resolver_offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReExport {
    pub dependent_ordinal: u32,
    /// Name in the dependent; empty means "same name".
    pub imported_name: String,
}

const SITE: &str = "export trie";

/// Looks up `name`, following edges byte-wise. A legitimate trie has
/// fewer nodes than bytes, so the walk is capped at `trie.len()` steps;
/// crafted tries with empty edges and back-pointing child offsets would
/// otherwise loop forever.
pub fn find(trie: &[u8], name: &str) -> Result<Option<ExportedSymbol>, LoadError> {
    if trie.is_empty() {
        return Ok(None);
    }
    let name = name.as_bytes();
    let mut node_offset = 0usize;
    let mut matched = 0usize;
    let mut visited = 0usize;

    loop {
        visited += 1;
        if visited > trie.len() {
            return Err(LoadError::malformed(SITE, "trie walk does not terminate"));
        }
        let mut p = node_offset;
        let terminal_size = read_uleb128(trie, &mut p, SITE)?;
        if matched == name.len() {
            if terminal_size == 0 {
                return Ok(None);
            }
            return parse_terminal(trie, p).map(Some);
        }
        // skip terminal payload to reach the children
        p += terminal_size as usize;
        let child_count = *trie.get(p).ok_or(LoadError::malformed(SITE, "truncated node"))?;
        p += 1;

        let mut next = None;
        for _ in 0..child_count {
            let edge_start = p;
            let edge_end = trie[p..]
                .iter()
                .position(|&b| b == 0)
                .map(|rel| p + rel)
                .ok_or(LoadError::malformed(SITE, "edge not terminated"))?;
            let edge = &trie[edge_start..edge_end];
            p = edge_end + 1;
            let child_offset = read_uleb128(trie, &mut p, SITE)? as usize;
            if next.is_none() && name[matched..].starts_with(edge) {
                next = Some((child_offset, matched + edge.len()));
            }
        }
        match next {
            Some((child_offset, new_matched)) => {
                if child_offset >= trie.len() {
                    return Err(LoadError::malformed(SITE, "child offset outside trie"));
                }
                node_offset = child_offset;
                matched = new_matched;
            }
            None => return Ok(None),
        }
    }
}

fn parse_terminal(trie: &[u8], mut p: usize) -> Result<ExportedSymbol, LoadError> {
    let flags = read_uleb128(trie, &mut p, SITE)?;
    let kind = match flags & EXPORT_KIND_MASK {
        EXPORT_KIND_THREAD_LOCAL => ExportKind::ThreadLocal,
        EXPORT_KIND_ABSOLUTE => ExportKind::Absolute,
        _ => ExportKind::Regular,
    };
    let is_weak_def = flags & EXPORT_WEAK_DEFINITION != 0;

    if flags & EXPORT_REEXPORT != 0 {
        let ordinal = read_uleb128(trie, &mut p, SITE)? as u32;
        let name_end = trie[p..]
            .iter()
            .position(|&b| b == 0)
            .map(|rel| p + rel)
            .ok_or(LoadError::malformed(SITE, "reexport name not terminated"))?;
        let imported_name = std::str::from_utf8(&trie[p..name_end])
            .map_err(|_| LoadError::malformed(SITE, "reexport name not utf-8"))?
            .to_owned();
        return Ok(ExportedSymbol {
            kind,
            value: 0,
            is_weak_def,
            re_export: Some(ReExport { dependent_ordinal: ordinal, imported_name }),
            resolver_offset: None,
        });
    }

    let value = read_uleb128(trie, &mut p, SITE)?;
    let resolver_offset = if flags & EXPORT_STUB_AND_RESOLVER != 0 {
        Some(read_uleb128(trie, &mut p, SITE)?)
    } else {
        None
    };
    Ok(ExportedSymbol { kind, value, is_weak_def, re_export: None, resolver_offset })
}

/// Enumerates every export in the trie with its full name. Used when a
/// dylib override needs a patch entry per patchable export.
pub fn for_each_export(
    trie: &[u8],
    f: &mut impl FnMut(&str, &ExportedSymbol),
) -> Result<(), LoadError> {
    if trie.is_empty() {
        return Ok(());
    }
    let mut name = Vec::new();
    // depth bound: a legitimate trie nests no deeper than the longest name
    visit(trie, 0, &mut name, 0, f)
}

fn visit(
    trie: &[u8],
    node_offset: usize,
    name: &mut Vec<u8>,
    depth: u32,
    f: &mut impl FnMut(&str, &ExportedSymbol),
) -> Result<(), LoadError> {
    if depth > 4096 {
        return Err(LoadError::malformed(SITE, "trie too deep"));
    }
    let mut p = node_offset;
    let terminal_size = read_uleb128(trie, &mut p, SITE)?;
    if terminal_size != 0 {
        let sym = parse_terminal(trie, p)?;
        if let Ok(n) = std::str::from_utf8(name) {
            f(n, &sym);
        }
    }
    p += terminal_size as usize;
    let child_count = *trie.get(p).ok_or(LoadError::malformed(SITE, "truncated node"))?;
    p += 1;
    for _ in 0..child_count {
        let edge_end = trie[p..]
            .iter()
            .position(|&b| b == 0)
            .map(|rel| p + rel)
            .ok_or(LoadError::malformed(SITE, "edge not terminated"))?;
        let edge = trie[p..edge_end].to_vec();
        p = edge_end + 1;
        let child_offset = read_uleb128(trie, &mut p, SITE)? as usize;
        if child_offset >= trie.len() {
            return Err(LoadError::malformed(SITE, "child offset outside trie"));
        }
        name.extend_from_slice(&edge);
        visit(trie, child_offset, name, depth + 1, f)?;
        name.truncate(name.len() - edge.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal hand-assembled trie builder for tests
    pub(crate) struct TrieBuilder {
        entries: Vec<(String, u64, u64)>, // name, flags, value
    }

    impl TrieBuilder {
        pub fn new() -> Self {
            Self { entries: Vec::new() }
        }

        pub fn export(mut self, name: &str, flags: u64, value: u64) -> Self {
            self.entries.push((name.into(), flags, value));
            self
        }

        /// Flat encoding: a root with one edge per full name. Not
        /// prefix-compressed, which the format permits.
        pub fn build(self) -> Vec<u8> {
            let mut out = vec![0u8]; // root: no terminal
            out.push(self.entries.len() as u8);
            // reserve space: offsets are small, single-byte ulebs
            let mut fixups = Vec::new();
            for (name, _, _) in &self.entries {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
                fixups.push(out.len());
                out.push(0); // child offset placeholder
            }
            for (i, (_, flags, value)) in self.entries.iter().enumerate() {
                let node_off = out.len() as u8;
                out[fixups[i]] = node_off;
                let mut payload = Vec::new();
                uleb(&mut payload, *flags);
                uleb(&mut payload, *value);
                uleb(&mut out, payload.len() as u64);
                out.extend_from_slice(&payload);
                out.push(0); // no children
            }
            out
        }
    }

    fn uleb(out: &mut Vec<u8>, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn finds_regular_export() {
        let trie = TrieBuilder::new()
            .export("_malloc", EXPORT_KIND_REGULAR, 0x1000)
            .export("_free", EXPORT_KIND_REGULAR, 0x2000)
            .build();
        let sym = find(&trie, "_malloc").unwrap().unwrap();
        assert_eq!(sym.kind, ExportKind::Regular);
        assert_eq!(sym.value, 0x1000);
        assert!(!sym.is_weak_def);
        assert!(find(&trie, "_mallo").unwrap().is_none());
        assert!(find(&trie, "_realloc").unwrap().is_none());
    }

    #[test]
    fn finds_weak_def() {
        let trie = TrieBuilder::new()
            .export("_weak", EXPORT_WEAK_DEFINITION, 0x3000)
            .build();
        let sym = find(&trie, "_weak").unwrap().unwrap();
        assert!(sym.is_weak_def);
    }

    #[test]
    fn enumerates_all_exports() {
        let trie = TrieBuilder::new()
            .export("_a", 0, 1)
            .export("_b", 0, 2)
            .build();
        let mut names = Vec::new();
        for_each_export(&trie, &mut |name, _| names.push(name.to_owned())).unwrap();
        names.sort();
        assert_eq!(names, ["_a", "_b"]);
    }

    #[test]
    fn empty_trie_finds_nothing() {
        assert!(find(&[], "_x").unwrap().is_none());
    }

    #[test]
    fn self_referencing_trie_is_rejected() {
        // root: no terminal, one child with an empty edge pointing back
        // at the root; an unbounded walk would never terminate
        let trie = [0u8, 1, 0, 0];
        assert!(matches!(
            find(&trie, "_x"),
            Err(LoadError::Malformed { .. })
        ));
    }
}
