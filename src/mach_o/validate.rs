//! Structural validation of a loadable slice: segment layout, entry
//! point, linkedit ordering and the fixup state machines. Binaries signed
//! against pre-10.14 SDKs get a handful of checks relaxed to warnings.

use std::ops::ControlFlow;

use crate::diagnostics::{Diagnostics, LoadError};
use crate::mach_o::analyzer::{EntryPoint, MachOAnalyzer};
use crate::mach_o::{self, opcodes, Platform};

/// Which historically-tolerated checks were downgraded for this image.
#[derive(Debug, Default, Clone)]
pub struct ValidationResult {
    pub relaxations: Vec<&'static str>,
}

/// SDK versions (packed X.Y.Z) from which the strict linkedit checks are
/// enforced.
fn strict_sdk_floor(platform: Platform) -> u32 {
    match platform {
        Platform::MacOS | Platform::MacCatalyst => 0x000A_0E00, // 10.14
        Platform::WatchOS | Platform::WatchOSSimulator => 0x0005_0000, // 5.0
        _ => 0x000C_0000, // 12.0 for the iOS family
    }
}

pub fn validate(
    analyzer: &MachOAnalyzer<'_>,
    path: &str,
    diag: &mut Diagnostics,
) -> Result<ValidationResult, LoadError> {
    let mut result = ValidationResult::default();
    let info = analyzer.info;
    let enforce = info.sdk_version >= strict_sdk_floor(info.platform);

    validate_segments(analyzer, path)?;
    validate_entry(analyzer)?;
    validate_linkedit(analyzer, enforce, &mut result, diag)?;
    validate_fixup_locations(analyzer)?;
    Ok(result)
}

fn validate_segments(analyzer: &MachOAnalyzer<'_>, path: &str) -> Result<(), LoadError> {
    const SITE: &str = "segments";
    let info = analyzer.info;
    let file_len = analyzer.data.len() as u64;

    let text = info
        .segment("__TEXT")
        .ok_or(LoadError::malformed(SITE, "no __TEXT segment"))?;
    if text.file_offset != 0 {
        return Err(LoadError::malformed(SITE, "__TEXT does not start at file offset 0"));
    }
    if text.init_prot != mach_o::VM_PROT_READ | mach_o::VM_PROT_EXECUTE {
        return Err(LoadError::malformed(SITE, "__TEXT is not r-x"));
    }
    let header_span = info.header.size() as u64 + info.header.sizeofcmds as u64;
    if header_span > text.file_size {
        return Err(LoadError::malformed(
            SITE,
            "load commands extend beyond __TEXT",
        ));
    }

    let linkedit = info
        .segment("__LINKEDIT")
        .ok_or(LoadError::malformed(SITE, "no __LINKEDIT segment"))?;
    if linkedit.init_prot != mach_o::VM_PROT_READ {
        return Err(LoadError::malformed(SITE, "__LINKEDIT is not r--"));
    }

    for seg in &info.segments {
        // empty no-reloc segments (the historical __LLVM case) may claim
        // more file than vm
        let exempt = seg.flags & mach_o::SG_NORELOC != 0 && seg.vm_size == 0;
        if seg.file_size > seg.vm_size && !exempt {
            return Err(LoadError::malformed(
                SITE,
                format!("segment {} file size exceeds vm size", seg.name),
            ));
        }
        if seg.file_offset.checked_add(seg.file_size).is_none_or(|end| end > file_len) {
            return Err(LoadError::malformed(
                SITE,
                format!("segment {} extends past end of file ({path})", seg.name),
            ));
        }
    }

    // no overlap, in either address space
    for (i, a) in info.segments.iter().enumerate() {
        for b in info.segments.iter().skip(i + 1) {
            let vm_overlap =
                a.vm_addr < b.vm_addr + b.vm_size && b.vm_addr < a.vm_addr + a.vm_size;
            if vm_overlap && a.vm_size != 0 && b.vm_size != 0 {
                return Err(LoadError::malformed(
                    SITE,
                    format!("segments {} and {} overlap in vm", a.name, b.name),
                ));
            }
            let file_overlap = a.file_offset < b.file_offset + b.file_size
                && b.file_offset < a.file_offset + a.file_size;
            if file_overlap && a.file_size != 0 && b.file_size != 0 {
                return Err(LoadError::malformed(
                    SITE,
                    format!("segments {} and {} overlap in file", a.name, b.name),
                ));
            }
        }
    }
    Ok(())
}

fn validate_entry(analyzer: &MachOAnalyzer<'_>) -> Result<(), LoadError> {
    let info = analyzer.info;
    if !info.is_main_executable() {
        return Ok(());
    }
    let text = info.segment("__TEXT").expect("checked by validate_segments");
    match info.entry {
        Some(EntryPoint::Main { text_offset }) | Some(EntryPoint::Start { text_offset }) => {
            if text_offset >= text.vm_size {
                return Err(LoadError::malformed("entry point", "entry outside __TEXT"));
            }
        }
        None => {
            return Err(LoadError::malformed(
                "entry point",
                "executable has neither LC_MAIN nor LC_UNIXTHREAD",
            ));
        }
    }
    Ok(())
}

fn validate_linkedit(
    analyzer: &MachOAnalyzer<'_>,
    enforce: bool,
    result: &mut ValidationResult,
    diag: &mut Diagnostics,
) -> Result<(), LoadError> {
    const SITE: &str = "linkedit";
    let info = analyzer.info;
    let Some(linkedit_seg) = info.segment("__LINKEDIT") else {
        return Ok(());
    };
    let le_start = linkedit_seg.file_offset;
    let le_end = le_start + linkedit_seg.file_size;

    let relax = |result: &mut ValidationResult, diag: &mut Diagnostics, which: &'static str, msg: String| -> Result<(), LoadError> {
        if enforce {
            return Err(LoadError::malformed(SITE, msg));
        }
        diag.warning(format!("{msg} (allowed for pre-10.14 binaries)"));
        result.relaxations.push(which);
        Ok(())
    };

    // canonical content order within __LINKEDIT
    let le = &info.linkedit;
    let contents = [
        ("rebase opcodes", le.rebase_opcodes, 1u64),
        ("bind opcodes", le.bind_opcodes, 1),
        ("weak bind opcodes", le.weak_bind_opcodes, 1),
        ("lazy bind opcodes", le.lazy_bind_opcodes, 1),
        ("export trie", le.export_trie, 1),
        ("local relocations", le.local_relocs, 8),
        ("split seg info", le.split_seg_info, 1),
        ("function starts", le.function_starts, 8),
        ("data in code", le.data_in_code, 8),
        ("symbol table", le.symbol_table, 8),
        ("indirect symbol table", le.indirect_symbol_table, 4),
        ("string pool", le.string_pool, 1),
        ("code signature", le.code_signature, 16),
    ];

    let mut last_end = le_start;
    let mut last_name = "";
    for (name, range, alignment) in contents {
        if range.is_empty() {
            continue;
        }
        let start = range.file_offset as u64;
        let end = range.end();
        if start < le_start || end > le_end {
            return Err(LoadError::malformed(
                SITE,
                format!("{name} not within __LINKEDIT"),
            ));
        }
        if start % alignment != 0 {
            relax(
                result,
                diag,
                "linkeditAlignment",
                format!("{name} is not {alignment}-byte aligned"),
            )?;
        }
        if start < last_end {
            // overlap is never tolerated; mere mis-ordering was
            if end <= last_end && start >= le_start && !last_name.is_empty() {
                relax(
                    result,
                    diag,
                    "linkeditOrder",
                    format!("{name} is not in canonical order (after {last_name})"),
                )?;
                continue;
            }
            return Err(LoadError::malformed(
                SITE,
                format!("{name} overlaps {last_name}"),
            ));
        }
        last_end = end;
        last_name = name;
    }

    // images with compressed dyld info should not also carry old-style
    // local relocations
    if le.has_dyld_info && !le.local_relocs.is_empty() {
        relax(
            result,
            diag,
            "dyldInfoAndLocalRelocs",
            "image has both dyld info and local relocations".into(),
        )?;
    }
    Ok(())
}

/// Every pointer fixup must land in a writable, non-executable segment;
/// text relocations must land in `__TEXT` and are only legal on i386.
fn validate_fixup_locations(analyzer: &MachOAnalyzer<'_>) -> Result<(), LoadError> {
    let info = analyzer.info;
    let check = |segment_index: u32, kind: u8| -> Result<(), LoadError> {
        let seg = &info.segments[segment_index as usize];
        match kind {
            opcodes::REBASE_TYPE_POINTER => {
                if !seg.writable() || seg.executable() {
                    return Err(LoadError::malformed(
                        "fixups",
                        format!("pointer fixup in non-writable segment {}", seg.name),
                    ));
                }
            }
            opcodes::REBASE_TYPE_TEXT_ABSOLUTE32 | opcodes::REBASE_TYPE_TEXT_PCREL32 => {
                if info.arch != mach_o::Arch::X86 {
                    return Err(LoadError::malformed(
                        "fixups",
                        "text relocation on non-i386 architecture",
                    ));
                }
                if !seg.executable() {
                    return Err(LoadError::malformed(
                        "fixups",
                        "text relocation outside executable segment",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    };

    if info.uses_chained_fixups() {
        let range = info.linkedit.chained_fixups;
        let start = range.file_offset as usize;
        let blob = analyzer
            .data
            .get(start..start + range.size as usize)
            .ok_or(LoadError::malformed("chained fixups", "blob outside file"))?;
        let fixups = crate::mach_o::chained::ChainedFixups::parse(blob, info)?;
        for &chain_start in &fixups.starts {
            let seg = info
                .segment_containing(chain_start)
                .ok_or(LoadError::malformed("chained fixups", "start outside segments"))?;
            if !seg.writable() {
                return Err(LoadError::malformed(
                    "chained fixups",
                    format!("chain start in non-writable segment {}", seg.name),
                ));
            }
        }
    }

    let mut failure = None;
    analyzer.for_each_rebase(|loc| {
        if let Err(e) = check(loc.segment_index, loc.kind) {
            failure = Some(e);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;
    if let Some(e) = failure.take() {
        return Err(e);
    }
    analyzer.for_each_bind(|loc| {
        if loc.strong_override {
            return ControlFlow::Continue(());
        }
        if let Err(e) = check(loc.segment_index, loc.kind) {
            failure = Some(e);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;
    if let Some(e) = failure.take() {
        return Err(e);
    }
    Ok(())
}
