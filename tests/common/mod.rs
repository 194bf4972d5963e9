//! Shared fixtures: a synthetic mach-o assembler, a cache assembler and
//! an in-memory host, so builder and loader tests run against fully
//! controlled images.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use dyld_closure::closure::writer::{ImageArrayWriter, ImageWriter};
use dyld_closure::closure::{
    CacheSegment, FileInfo, ImageFlags, ImageFlagsWord, ImageNum, PatchLocation,
    FIRST_DYLD_CACHE_IMAGE_NUM,
};
use dyld_closure::diagnostics::{LoadError, SandboxOp};
use dyld_closure::host::{DofRegistration, FileContent, FileId, Host, LoadedFile};
use dyld_closure::shared_cache::CacheFileWriter;

pub const PAGE: u64 = 0x1000;
pub const TEXT_SIZE: u64 = 0x1000;
pub const DATA_ADDR: u64 = 0x1000;
pub const DATA_SIZE: u64 = 0x1000;
pub const LINKEDIT_ADDR: u64 = 0x2000;
pub const ENTRY_OFFSET: u64 = 0x800;

// mach-o constants the fixture needs; mirrors loader.h
const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const MH_PIE: u32 = 0x0020_0000;
const MH_DYLDLINK: u32 = 0x4;
const MH_TWOLEVEL: u32 = 0x80;
const MH_WEAK_DEFINES: u32 = 0x8000;
const MH_BINDS_TO_WEAK: u32 = 0x0001_0000;
const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
const LC_UUID: u32 = 0x1b;
const LC_BUILD_VERSION: u32 = 0x32;
const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
const LC_CODE_SIGNATURE: u32 = 0x1d;
const PLATFORM_MACOS: u32 = 1;
const SDK_10_15: u32 = 0x000A_0F00;

const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
const S_DTRACE_DOF: u32 = 0xf;

// opcode constants
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_TYPE_POINTER: u8 = 1;
const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

pub const EXPORT_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_REEXPORT: u64 = 0x08;

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

/// One export for the synthetic trie.
#[derive(Clone)]
pub enum Export {
    Regular { name: String, offset: u64, weak: bool },
    ReExport { name: String, dep_ordinal: u32, imported_name: String },
}

impl Export {
    pub fn regular(name: &str, offset: u64) -> Self {
        Self::Regular { name: name.into(), offset, weak: false }
    }

    pub fn weak(name: &str, offset: u64) -> Self {
        Self::Regular { name: name.into(), offset, weak: true }
    }

    pub fn re_export(name: &str, dep_ordinal: u32) -> Self {
        Self::ReExport { name: name.into(), dep_ordinal, imported_name: String::new() }
    }

    fn name(&self) -> &str {
        match self {
            Self::Regular { name, .. } | Self::ReExport { name, .. } => name,
        }
    }
}

/// Flat (non-prefix-compressed) export trie; the format permits it and
/// it keeps the fixture readable.
pub fn build_trie(exports: &[Export]) -> Vec<u8> {
    if exports.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u8]; // root: no terminal payload
    out.push(exports.len() as u8);
    let mut fixups = Vec::new();
    for export in exports {
        out.extend_from_slice(export.name().as_bytes());
        out.push(0);
        fixups.push(out.len());
        out.extend([0u8, 0]); // two-byte uleb placeholder for the offset
    }
    for (i, export) in exports.iter().enumerate() {
        let node_off = out.len();
        assert!(node_off < 0x3fff, "trie fixture too large");
        out[fixups[i]] = (node_off & 0x7f) as u8 | 0x80;
        out[fixups[i] + 1] = (node_off >> 7) as u8;
        let mut payload = Vec::new();
        match export {
            Export::Regular { offset, weak, .. } => {
                uleb(&mut payload, if *weak { EXPORT_WEAK_DEFINITION } else { 0 });
                uleb(&mut payload, *offset);
            }
            Export::ReExport { dep_ordinal, imported_name, .. } => {
                uleb(&mut payload, EXPORT_REEXPORT);
                uleb(&mut payload, *dep_ordinal as u64);
                payload.extend_from_slice(imported_name.as_bytes());
                payload.push(0);
            }
        }
        uleb(&mut out, payload.len() as u64);
        out.extend(payload);
        out.push(0); // no children
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Regular,
    Weak,
    ReExport,
    Upward,
}

#[derive(Clone)]
pub struct Dep {
    pub path: String,
    pub kind: DepKind,
    pub compat: u32,
    pub current: u32,
}

impl Dep {
    pub fn new(path: &str) -> Self {
        Self { path: path.into(), kind: DepKind::Regular, compat: 0x10000, current: 0x10000 }
    }

    pub fn weak(path: &str) -> Self {
        Self { kind: DepKind::Weak, ..Self::new(path) }
    }

    pub fn re_export(path: &str) -> Self {
        Self { kind: DepKind::ReExport, ..Self::new(path) }
    }

    pub fn upward(path: &str) -> Self {
        Self { kind: DepKind::Upward, ..Self::new(path) }
    }

    pub fn requiring_compat(path: &str, compat: u32) -> Self {
        Self { compat, ..Self::new(path) }
    }
}

#[derive(Clone)]
pub struct Bind {
    pub ordinal: i8, // 1-based dependent, or 0/-1/-2/-3 specials
    pub symbol: String,
    pub data_offset: u64, // offset within __DATA
    pub weak_import: bool,
}

impl Bind {
    pub fn new(ordinal: i8, symbol: &str, data_offset: u64) -> Self {
        Self { ordinal, symbol: symbol.into(), data_offset, weak_import: false }
    }

    pub fn weak_import(ordinal: i8, symbol: &str, data_offset: u64) -> Self {
        Self { weak_import: true, ..Self::new(ordinal, symbol, data_offset) }
    }
}

#[derive(Clone)]
pub struct WeakBind {
    pub symbol: String,
    pub data_offset: u64,
    pub strong_override: bool,
}

/// A section to synthesize inside __DATA.
#[derive(Clone)]
pub struct DataSection {
    pub name: String,
    pub data_offset: u64,
    pub size: u64,
    pub section_type: u32,
}

/// Synthesizes a valid 64-bit x86_64 mach-o slice with __TEXT, __DATA
/// and __LINKEDIT, classic dyld-info fixups and an export trie.
pub struct MachOBuilder {
    file_type: u32,
    install_name: Option<String>,
    compat_version: u32,
    deps: Vec<Dep>,
    rpaths: Vec<String>,
    exports: Vec<Export>,
    rebases: Vec<u64>, // offsets within __DATA
    binds: Vec<Bind>,
    weak_binds: Vec<WeakBind>,
    weak_defines: bool,
    binds_to_weak: bool,
    data_words: Vec<(u64, u64)>, // (data offset, value) initial content
    data_sections: Vec<DataSection>,
    uuid: [u8; 16],
    signed: bool,
    pie: bool,
}

impl MachOBuilder {
    pub fn executable() -> Self {
        Self::new(MH_EXECUTE)
    }

    pub fn dylib(install_name: &str) -> Self {
        let mut b = Self::new(MH_DYLIB);
        b.install_name = Some(install_name.into());
        b
    }

    fn new(file_type: u32) -> Self {
        Self {
            file_type,
            install_name: None,
            compat_version: 0x10000,
            deps: Vec::new(),
            rpaths: Vec::new(),
            exports: Vec::new(),
            rebases: Vec::new(),
            binds: Vec::new(),
            weak_binds: Vec::new(),
            weak_defines: false,
            binds_to_weak: false,
            data_words: Vec::new(),
            data_sections: Vec::new(),
            uuid: [0xAB; 16],
            signed: false,
            pie: true,
        }
    }

    pub fn compat_version(mut self, v: u32) -> Self {
        self.compat_version = v;
        self
    }

    pub fn dep(mut self, dep: Dep) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpaths.push(rpath.into());
        self
    }

    pub fn export(mut self, export: Export) -> Self {
        self.exports.push(export);
        self
    }

    pub fn rebase_at(mut self, data_offset: u64) -> Self {
        self.rebases.push(data_offset);
        self
    }

    pub fn bind(mut self, bind: Bind) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn weak_bind(mut self, symbol: &str, data_offset: u64) -> Self {
        self.weak_binds.push(WeakBind {
            symbol: symbol.into(),
            data_offset,
            strong_override: false,
        });
        self.binds_to_weak = true;
        self
    }

    pub fn strong_override(mut self, symbol: &str) -> Self {
        self.weak_binds.push(WeakBind { symbol: symbol.into(), data_offset: 0, strong_override: true });
        self
    }

    pub fn weak_defines(mut self) -> Self {
        self.weak_defines = true;
        self
    }

    pub fn data_word(mut self, data_offset: u64, value: u64) -> Self {
        self.data_words.push((data_offset, value));
        self
    }

    pub fn data_section(mut self, section: DataSection) -> Self {
        self.data_sections.push(section);
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn not_pie(mut self) -> Self {
        self.pie = false;
        self
    }

    pub fn build(self) -> Vec<u8> {
        // ----- linkedit tables -----
        let rebase_stream = self.rebase_stream();
        let bind_stream = self.bind_stream();
        let weak_stream = self.weak_bind_stream();
        let trie = build_trie(&self.exports);

        let le_base = (LINKEDIT_ADDR) as u32; // file offset == vm addr here
        let mut linkedit = Vec::new();
        let rebase_range = (le_base, rebase_stream.len() as u32);
        linkedit.extend(&rebase_stream);
        let bind_range = (le_base + linkedit.len() as u32, bind_stream.len() as u32);
        linkedit.extend(&bind_stream);
        let weak_range = (le_base + linkedit.len() as u32, weak_stream.len() as u32);
        linkedit.extend(&weak_stream);
        let export_range = (le_base + linkedit.len() as u32, trie.len() as u32);
        linkedit.extend(&trie);
        let signature = if self.signed {
            while linkedit.len() % 16 != 0 {
                linkedit.push(0);
            }
            let sig = fake_signature();
            let range = (le_base + linkedit.len() as u32, sig.len() as u32);
            linkedit.extend(&sig);
            Some(range)
        } else {
            None
        };
        assert!(linkedit.len() as u64 <= PAGE, "linkedit fixture overflow");

        // ----- load commands -----
        let mut cmds: Vec<Vec<u8>> = Vec::new();
        cmds.push(self.segment_command(
            "__TEXT",
            0,
            TEXT_SIZE,
            0,
            TEXT_SIZE,
            5,
            &[],
        ));
        let data_sections: Vec<(String, u64, u64, u32)> = self
            .data_sections
            .iter()
            .map(|s| (s.name.clone(), DATA_ADDR + s.data_offset, s.size, s.section_type))
            .collect();
        cmds.push(self.segment_command(
            "__DATA",
            DATA_ADDR,
            DATA_SIZE,
            DATA_ADDR,
            DATA_SIZE,
            3,
            &data_sections,
        ));
        cmds.push(self.segment_command(
            "__LINKEDIT",
            LINKEDIT_ADDR,
            PAGE,
            LINKEDIT_ADDR,
            linkedit.len() as u64,
            1,
            &[],
        ));

        if let Some(install_name) = &self.install_name {
            cmds.push(dylib_command(LC_ID_DYLIB, install_name, self.compat_version, 0x10000));
        }
        for dep in &self.deps {
            let cmd = match dep.kind {
                DepKind::Regular => LC_LOAD_DYLIB,
                DepKind::Weak => LC_LOAD_WEAK_DYLIB,
                DepKind::ReExport => LC_REEXPORT_DYLIB,
                DepKind::Upward => LC_LOAD_UPWARD_DYLIB,
            };
            cmds.push(dylib_command(cmd, &dep.path, dep.compat, dep.current));
        }
        for rpath in &self.rpaths {
            cmds.push(rpath_command(rpath));
        }

        let mut uuid_cmd = vec![0u8; 24];
        write_u32(&mut uuid_cmd, 0, LC_UUID);
        write_u32(&mut uuid_cmd, 4, 24);
        uuid_cmd[8..24].copy_from_slice(&self.uuid);
        cmds.push(uuid_cmd);

        let mut build_version = vec![0u8; 24];
        write_u32(&mut build_version, 0, LC_BUILD_VERSION);
        write_u32(&mut build_version, 4, 24);
        write_u32(&mut build_version, 8, PLATFORM_MACOS);
        write_u32(&mut build_version, 12, SDK_10_15); // minos
        write_u32(&mut build_version, 16, SDK_10_15); // sdk
        cmds.push(build_version);

        // dyld info
        let mut dyld_info = vec![0u8; 48];
        write_u32(&mut dyld_info, 0, LC_DYLD_INFO_ONLY);
        write_u32(&mut dyld_info, 4, 48);
        write_u32(&mut dyld_info, 8, rebase_range.0);
        write_u32(&mut dyld_info, 12, rebase_range.1);
        write_u32(&mut dyld_info, 16, bind_range.0);
        write_u32(&mut dyld_info, 20, bind_range.1);
        write_u32(&mut dyld_info, 24, weak_range.0);
        write_u32(&mut dyld_info, 28, weak_range.1);
        // no lazy binds
        write_u32(&mut dyld_info, 40, export_range.0);
        write_u32(&mut dyld_info, 44, export_range.1);
        cmds.push(dyld_info);

        if let Some((off, size)) = signature {
            let mut sig_cmd = vec![0u8; 16];
            write_u32(&mut sig_cmd, 0, LC_CODE_SIGNATURE);
            write_u32(&mut sig_cmd, 4, 16);
            write_u32(&mut sig_cmd, 8, off);
            write_u32(&mut sig_cmd, 12, size);
            cmds.push(sig_cmd);
        }

        if self.file_type == MH_EXECUTE {
            let mut main_cmd = vec![0u8; 24];
            write_u32(&mut main_cmd, 0, LC_MAIN);
            write_u32(&mut main_cmd, 4, 24);
            main_cmd[8..16].copy_from_slice(&ENTRY_OFFSET.to_le_bytes());
            cmds.push(main_cmd);
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        assert!(32 + sizeofcmds <= TEXT_SIZE as usize, "too many load commands for fixture");

        // ----- assemble -----
        let mut flags = MH_DYLDLINK | MH_TWOLEVEL;
        if self.pie && self.file_type == MH_EXECUTE {
            flags |= MH_PIE;
        }
        if self.weak_defines || self.exports.iter().any(|e| matches!(e, Export::Regular { weak: true, .. })) {
            flags |= MH_WEAK_DEFINES;
        }
        if self.binds_to_weak {
            flags |= MH_BINDS_TO_WEAK;
        }

        let total = (LINKEDIT_ADDR as usize) + linkedit.len();
        let mut out = vec![0u8; total];
        write_u32(&mut out, 0, MH_MAGIC_64);
        write_u32(&mut out, 4, 0x0100_0007); // CPU_TYPE_X86_64
        write_u32(&mut out, 8, 3); // CPU_SUBTYPE_X86_64_ALL
        write_u32(&mut out, 12, self.file_type);
        write_u32(&mut out, 16, cmds.len() as u32);
        write_u32(&mut out, 20, sizeofcmds as u32);
        write_u32(&mut out, 24, flags);
        let mut cursor = 32;
        for cmd in &cmds {
            out[cursor..cursor + cmd.len()].copy_from_slice(cmd);
            cursor += cmd.len();
        }
        for &(offset, value) in &self.data_words {
            let at = (DATA_ADDR + offset) as usize;
            out[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        out[LINKEDIT_ADDR as usize..LINKEDIT_ADDR as usize + linkedit.len()]
            .copy_from_slice(&linkedit);
        out
    }

    fn segment_command(
        &self,
        name: &str,
        vm_addr: u64,
        vm_size: u64,
        file_off: u64,
        file_size: u64,
        prot: u32,
        sections: &[(String, u64, u64, u32)],
    ) -> Vec<u8> {
        let size = 72 + sections.len() * 80;
        let mut cmd = vec![0u8; size];
        write_u32(&mut cmd, 0, LC_SEGMENT_64);
        write_u32(&mut cmd, 4, size as u32);
        cmd[8..8 + name.len().min(16)].copy_from_slice(&name.as_bytes()[..name.len().min(16)]);
        cmd[24..32].copy_from_slice(&vm_addr.to_le_bytes());
        cmd[32..40].copy_from_slice(&vm_size.to_le_bytes());
        cmd[40..48].copy_from_slice(&file_off.to_le_bytes());
        cmd[48..56].copy_from_slice(&file_size.to_le_bytes());
        write_u32(&mut cmd, 56, prot); // maxprot
        write_u32(&mut cmd, 60, prot); // initprot
        write_u32(&mut cmd, 64, sections.len() as u32);
        for (i, (sect_name, addr, sect_size, sect_flags)) in sections.iter().enumerate() {
            let s = 72 + i * 80;
            let n = sect_name.len().min(16);
            cmd[s..s + n].copy_from_slice(&sect_name.as_bytes()[..n]);
            cmd[s + 16..s + 16 + name.len().min(16)]
                .copy_from_slice(&name.as_bytes()[..name.len().min(16)]);
            cmd[s + 32..s + 40].copy_from_slice(&addr.to_le_bytes());
            cmd[s + 40..s + 48].copy_from_slice(&sect_size.to_le_bytes());
            write_u32(&mut cmd, s + 48, *addr as u32); // file offset == vmaddr here
            write_u32(&mut cmd, s + 64, *sect_flags);
        }
        cmd
    }

    fn rebase_stream(&self) -> Vec<u8> {
        if self.rebases.is_empty() {
            return Vec::new();
        }
        let mut out = vec![REBASE_OPCODE_SET_TYPE_IMM | 1];
        for &offset in &self.rebases {
            out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
            uleb(&mut out, offset);
            out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
        }
        out.push(REBASE_OPCODE_DONE);
        out
    }

    fn bind_stream(&self) -> Vec<u8> {
        if self.binds.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for bind in &self.binds {
            if bind.ordinal >= 0 {
                out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | bind.ordinal as u8);
            } else {
                out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (bind.ordinal as u8 & 0x0f));
            }
            let flags = if bind.weak_import { BIND_SYMBOL_FLAGS_WEAK_IMPORT } else { 0 };
            out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
            out.extend_from_slice(bind.symbol.as_bytes());
            out.push(0);
            out.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
            uleb(&mut out, bind.data_offset);
            out.push(BIND_OPCODE_DO_BIND);
        }
        out.push(BIND_OPCODE_DONE);
        out
    }

    fn weak_bind_stream(&self) -> Vec<u8> {
        if self.weak_binds.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for weak in &self.weak_binds {
            let flags = if weak.strong_override { BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION } else { 0 };
            out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
            out.extend_from_slice(weak.symbol.as_bytes());
            out.push(0);
            out.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
            uleb(&mut out, weak.data_offset);
            out.push(BIND_OPCODE_DO_BIND);
        }
        out.push(BIND_OPCODE_DONE);
        out
    }
}

fn write_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn dylib_command(cmd: u32, path: &str, compat: u32, current: u32) -> Vec<u8> {
    let mut size = 24 + path.len() + 1;
    size = (size + 3) & !3;
    let mut out = vec![0u8; size];
    write_u32(&mut out, 0, cmd);
    write_u32(&mut out, 4, size as u32);
    write_u32(&mut out, 8, 24); // name offset
    write_u32(&mut out, 12, 0); // timestamp
    write_u32(&mut out, 16, current);
    write_u32(&mut out, 20, compat);
    out[24..24 + path.len()].copy_from_slice(path.as_bytes());
    out
}

fn rpath_command(rpath: &str) -> Vec<u8> {
    let mut size = 12 + rpath.len() + 1;
    size = (size + 3) & !3;
    let mut out = vec![0u8; size];
    write_u32(&mut out, 0, LC_RPATH);
    write_u32(&mut out, 4, size as u32);
    write_u32(&mut out, 8, 12);
    out[12..12 + rpath.len()].copy_from_slice(rpath.as_bytes());
    out
}

/// A minimal embedded-signature super-blob with one sha256
/// CodeDirectory.
pub fn fake_signature() -> Vec<u8> {
    const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
    const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
    let mut cd = Vec::new();
    cd.extend(CSMAGIC_CODEDIRECTORY.to_be_bytes());
    cd.extend(44u32.to_be_bytes());
    cd.extend([0u8; 28]);
    cd.push(20); // hashSize
    cd.push(2); // sha256
    cd.push(0);
    cd.push(12);
    cd.extend([0u8; 4]);

    let mut blob = Vec::new();
    blob.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    blob.extend(((12 + 8 + cd.len()) as u32).to_be_bytes());
    blob.extend(1u32.to_be_bytes());
    blob.extend(0u32.to_be_bytes()); // CSSLOT_CODEDIRECTORY
    blob.extend(20u32.to_be_bytes());
    blob.extend(&cd);
    blob
}

// ----- shared cache fixture -----

pub struct TestCacheDylib {
    pub install_name: String,
    pub macho: Vec<u8>,
    /// `(export name, image offset, patch-use cache offsets)` rows for
    /// the patch table.
    pub patchable_exports: Vec<(String, u64, Vec<u32>)>,
    pub file_info: Option<(u64, u64)>,
    pub overridable: bool,
    pub has_weak_defs: bool,
    pub init_offsets: Vec<u32>,
}

impl TestCacheDylib {
    pub fn new(install_name: &str, macho: Vec<u8>) -> Self {
        Self {
            install_name: install_name.into(),
            macho,
            patchable_exports: Vec::new(),
            file_info: None,
            overridable: true,
            has_weak_defs: false,
            init_offsets: Vec::new(),
        }
    }
}

pub struct TestCache {
    pub bytes: &'static mut [u8],
    pub base: u64,
}

/// Assembles a cache whose embedded image records mirror what the cache
/// builder would produce, then leaks it so the loader can patch it in
/// place.
pub fn build_cache(uuid: [u8; 16], dylibs: Vec<TestCacheDylib>) -> TestCache {
    let mut cw = CacheFileWriter::new("x86_64", uuid, 0);
    let mut offsets = Vec::new();
    for dylib in &dylibs {
        offsets.push(cw.add_dylib(&dylib.install_name, dylib.macho.clone()));
    }
    let mut aw = ImageArrayWriter::new(FIRST_DYLD_CACHE_IMAGE_NUM);
    for (i, dylib) in dylibs.iter().enumerate() {
        let num = FIRST_DYLD_CACHE_IMAGE_NUM + i as ImageNum;
        let mut flags = ImageFlags::IS_DYLIB
            | ImageFlags::IS_64
            | ImageFlags::IN_DYLD_CACHE
            | ImageFlags::NEVER_UNLOAD;
        if dylib.overridable {
            flags |= ImageFlags::OVERRIDABLE_DYLIB;
        }
        if dylib.has_weak_defs {
            flags |= ImageFlags::HAS_WEAK_DEFS;
        }
        let mut iw = ImageWriter::new(ImageFlagsWord {
            image_num: num,
            max_load_count: dylibs.len() as u32,
            flags,
        });
        iw.add_path(&dylib.install_name);
        if let Some((inode, mtime)) = dylib.file_info {
            iw.set_file_info(FileInfo { inode, mod_time: mtime });
        }
        iw.set_cache_segments(&[CacheSegment {
            cache_offset: offsets[i],
            size: dylib.macho.len() as u32,
            permissions: 5,
        }]);
        iw.set_dependents(&[]);
        iw.set_init_offsets(&dylib.init_offsets);
        for (name, value, uses) in &dylib.patchable_exports {
            let locations: Vec<PatchLocation> = uses
                .iter()
                .map(|&cache_off| PatchLocation {
                    cache_offset: cache_off,
                    addend: 0,
                    authenticated: false,
                    uses_address_diversity: false,
                    key: 0,
                    discriminator: 0,
                })
                .collect();
            iw.add_patchable_export(offsets[i] + *value as u32, &locations, name);
        }
        aw.add_image(iw.finish());
    }
    cw.set_dylib_image_array(aw.finish());
    let bytes: &'static mut [u8] = Vec::leak(cw.finish());
    let base = bytes.as_ptr() as u64;
    TestCache { bytes, base }
}

/// Cache offset of the recorded `_malloc` use-site in the standard
/// cache: first dylib lands at 0x1000, use-site at its __DATA + 0x40.
pub const MALLOC_USE_SITE: u32 = 0x2040;

/// The standard cache most tests use: libSystem with a patchable
/// `_malloc` and the libdyld entry vector (format version word stored in
/// its __DATA).
pub fn standard_cache() -> (TestCache, u64 /* malloc cache offset */) {
    let libsystem = MachOBuilder::dylib("/usr/lib/libSystem.B.dylib")
        .export(Export::regular("_malloc", 0x900))
        .export(Export::regular("_free", 0x910))
        .export(Export::regular(
            "__ZN5dyld318entryVectorForDyldE",
            DATA_ADDR + 0x100,
        ))
        // the entry vector's first word is the closure format version
        .data_word(0x100, dyld_closure::closure::FORMAT_VERSION as u64)
        .build();
    let mut dylib = TestCacheDylib::new("/usr/lib/libSystem.B.dylib", libsystem);
    // one known use-site of _malloc, inside the cached libSystem's __DATA
    dylib.patchable_exports.push(("_malloc".into(), 0x900, vec![MALLOC_USE_SITE]));
    let cache = build_cache([0x11; 16], vec![dylib]);
    let malloc_offset =
        dyld_closure::shared_cache::SharedCache::parse(cache.bytes).unwrap().entry_for_num(1).unwrap().macho_offset
            as u64
            + 0x900;
    (cache, malloc_offset)
}

// ----- mock host -----

#[derive(Default)]
pub struct MockHost {
    files: RefCell<HashMap<String, (Vec<u8>, FileId)>>,
    next_inode: RefCell<u64>,
    reservations: RefCell<Vec<(u64, usize)>>,
    pub dof_batches: RefCell<Vec<Vec<DofRegistration>>>,
    pub footprint_depth: RefCell<i32>,
    pub sandbox_denied: RefCell<Vec<(String, SandboxOp)>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str, bytes: Vec<u8>) {
        let mut inode = self.next_inode.borrow_mut();
        *inode += 1;
        self.files
            .borrow_mut()
            .insert(path.to_owned(), (bytes, FileId { inode: *inode, mtime: 1000 + *inode }));
    }

    pub fn add_file_with_id(&self, path: &str, bytes: Vec<u8>, inode: u64, mtime: u64) {
        self.files
            .borrow_mut()
            .insert(path.to_owned(), (bytes, FileId { inode, mtime }));
    }

    pub fn touch(&self, path: &str, mtime: u64) {
        if let Some((_, id)) = self.files.borrow_mut().get_mut(path) {
            id.mtime = mtime;
        }
    }

    pub fn remove_file(&self, path: &str) {
        self.files.borrow_mut().remove(path);
    }

    pub fn deny(&self, path: &str, op: SandboxOp) {
        self.sandbox_denied.borrow_mut().push((path.to_owned(), op));
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        for &(addr, size) in self.reservations.borrow().iter() {
            // SAFETY: freeing regions allocated in reserve_address_space
            unsafe {
                let layout = std::alloc::Layout::from_size_align(size, 0x1000).unwrap();
                std::alloc::dealloc(addr as *mut u8, layout);
            }
        }
    }
}

impl Host for MockHost {
    type File = Vec<u8>;

    fn load_file(&self, path: &Path) -> Result<LoadedFile, LoadError> {
        let key = path.to_string_lossy().into_owned();
        let files = self.files.borrow();
        let (bytes, id) = files
            .get(&key)
            .ok_or(LoadError::FileNotFound { path: key.clone() })?;
        Ok(LoadedFile {
            path: key,
            content: FileContent::Owned(bytes.clone()),
            file_id: Some(*id),
        })
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.files.borrow().contains_key(&path.to_string_lossy().into_owned())
    }

    fn file_id(&self, path: &Path) -> Option<FileId> {
        self.files
            .borrow()
            .get(&path.to_string_lossy().into_owned())
            .map(|(_, id)| *id)
    }

    fn sandbox_blocked(&self, path: &str, op: SandboxOp) -> bool {
        self.sandbox_denied
            .borrow()
            .iter()
            .any(|(p, o)| p == path && *o == op)
    }

    fn open(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        let key = path.to_string_lossy().into_owned();
        self.files
            .borrow()
            .get(&key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or(LoadError::FileNotFound { path: key })
    }

    fn reserve_address_space(&self, size: u64) -> Result<u64, LoadError> {
        let size = size.max(1) as usize;
        // SAFETY: plain zeroed allocation standing in for vm_allocate
        let addr = unsafe {
            let layout = std::alloc::Layout::from_size_align(size, 0x1000).unwrap();
            std::alloc::alloc_zeroed(layout)
        };
        if addr.is_null() {
            return Err(LoadError::VmAllocateFailed { size: size as u64 });
        }
        self.reservations.borrow_mut().push((addr as u64, size));
        Ok(addr as u64)
    }

    fn release_address_space(&self, addr: u64, _size: u64) {
        let mut reservations = self.reservations.borrow_mut();
        if let Some(pos) = reservations.iter().position(|&(a, _)| a == addr) {
            let (addr, size) = reservations.remove(pos);
            // SAFETY: freeing a region from reserve_address_space
            unsafe {
                let layout = std::alloc::Layout::from_size_align(size, 0x1000).unwrap();
                std::alloc::dealloc(addr as *mut u8, layout);
            }
        }
    }

    fn map_fixed(
        &self,
        file: &Vec<u8>,
        file_offset: u64,
        len: u64,
        addr: u64,
        _prot: u8,
    ) -> Result<(), LoadError> {
        let start = file_offset as usize;
        let end = (start + len as usize).min(file.len());
        if start > file.len() {
            return Err(LoadError::MmapFailed { errno: 22 });
        }
        // SAFETY: addr lies inside a reservation handed out above
        unsafe {
            std::ptr::copy_nonoverlapping(
                file[start..end].as_ptr(),
                addr as *mut u8,
                end - start,
            );
        }
        Ok(())
    }

    fn protect(&self, _addr: u64, _len: u64, _prot: u8) -> Result<(), LoadError> {
        Ok(())
    }

    fn add_file_signatures(
        &self,
        file: &Vec<u8>,
        _slice_offset: u64,
        _cd_blob_offset: u32,
        _cd_blob_size: u32,
    ) -> Result<u64, LoadError> {
        Ok(file.len() as u64)
    }

    fn check_library_validation(&self, _file: &Vec<u8>, _slice_offset: u64) -> Result<(), String> {
        Ok(())
    }

    fn declare_encrypted_region(
        &self,
        _addr: u64,
        _size: u64,
        _cpu_type: i32,
        _cpu_subtype: i32,
    ) -> Result<(), LoadError> {
        Ok(())
    }

    fn register_dof(&self, sections: &[DofRegistration]) -> Vec<i32> {
        self.dof_batches.borrow_mut().push(sections.to_vec());
        (0..sections.len() as i32).collect()
    }

    fn footprint_suspend(&self, suspend: bool) {
        *self.footprint_depth.borrow_mut() += if suspend { 1 } else { -1 };
    }
}
