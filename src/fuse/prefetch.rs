//! Deterministic prefetch primitives (spec §4.5 rules 1-4): cheap,
//! synchronous parsing used to decide what else to bundle into a
//! `bulk_fetch` alongside the file a guest process actually asked for.
//!
//! This module only answers "what should be requested next" — it never
//! performs RPC itself. [`crate::fuse::mod`]'s open-path handler owns the
//! depth-limited walk and the actual `bulk_fetch` calls, since only it
//! holds the RPC client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::ContentHash;

/// Transitive `DT_NEEDED` prefetch stops after this many hops from the
/// primary target (spec §4.5 rule 1).
pub const MAX_TRANSITIVE_DEPTH: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    pub is_dynamic: bool,
    pub interpreter: Option<String>,
    pub needed: Vec<String>,
}

fn u16_le(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn u64_le(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

fn i64_le(data: &[u8], offset: usize) -> Option<i64> {
    u64_le(data, offset).map(|v| v as i64)
}

fn c_string_at(data: &[u8], offset: usize) -> Option<String> {
    let slice = data.get(offset..)?;
    let end = slice.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&slice[..end]).ok().map(|s| s.to_string())
}

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;
const DT_NULL: i64 = 0;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

struct ProgramHeader {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
}

/// Parses an ELF64 little-endian header cheaply (spec §4.5 rule 1: "parse
/// the ELF header cheaply"). Returns `None` for anything that isn't a
/// 64-bit LE ELF executable or shared object — 32-bit and big-endian
/// targets fall back to an uncached streaming open rather than a failed
/// prefetch (see DESIGN.md).
pub fn parse_elf(data: &[u8]) -> Option<ElfInfo> {
    if data.len() < 64 || &data[0..4] != b"\x7fELF" {
        return None;
    }
    let ei_class = data[4];
    let ei_data = data[5];
    if ei_class != 2 || ei_data != 1 {
        return None; // only ELFCLASS64 / ELFDATA2LSB
    }

    let e_type = u16_le(data, 16)?;
    if e_type != ET_EXEC && e_type != ET_DYN {
        return None;
    }
    let e_phoff = u64_le(data, 32)? as usize;
    let e_phentsize = u16_le(data, 54)? as usize;
    let e_phnum = u16_le(data, 56)? as usize;

    let mut headers = Vec::with_capacity(e_phnum);
    for i in 0..e_phnum {
        let base = e_phoff + i * e_phentsize;
        let p_type = u32_le(data, base)?;
        let p_offset = u64_le(data, base + 8)?;
        let p_vaddr = u64_le(data, base + 16)?;
        let p_filesz = u64_le(data, base + 32)?;
        headers.push(ProgramHeader { p_type, p_offset, p_vaddr, p_filesz });
    }

    let interpreter = headers
        .iter()
        .find(|h| h.p_type == PT_INTERP)
        .and_then(|h| c_string_at(data, h.p_offset as usize));

    let dynamic = headers.iter().find(|h| h.p_type == PT_DYNAMIC);
    let Some(dynamic) = dynamic else {
        return Some(ElfInfo { is_dynamic: false, interpreter, needed: Vec::new() });
    };

    let vaddr_to_offset = |vaddr: u64| -> Option<u64> {
        headers
            .iter()
            .find(|h| h.p_type == PT_LOAD && vaddr >= h.p_vaddr && vaddr < h.p_vaddr + h.p_filesz)
            .map(|h| h.p_offset + (vaddr - h.p_vaddr))
    };

    let mut strtab_off = None;
    let mut needed_str_offsets = Vec::new();
    let dyn_start = dynamic.p_offset as usize;
    let dyn_len = dynamic.p_filesz as usize;
    let mut cursor = dyn_start;
    while cursor + 16 <= dyn_start + dyn_len {
        let tag = i64_le(data, cursor)?;
        let val = u64_le(data, cursor + 8)?;
        if tag == DT_NULL {
            break;
        }
        if tag == DT_STRTAB {
            strtab_off = vaddr_to_offset(val);
        } else if tag == DT_NEEDED {
            needed_str_offsets.push(val);
        }
        cursor += 16;
    }

    let needed = match strtab_off {
        Some(strtab_off) => needed_str_offsets
            .into_iter()
            .filter_map(|rel| c_string_at(data, (strtab_off + rel) as usize))
            .collect(),
        None => Vec::new(),
    };

    Some(ElfInfo { is_dynamic: true, interpreter, needed })
}

/// Memoizes [`parse_elf`] results by content hash, bounded so a long
/// session's prefetch traffic doesn't grow this table without limit.
///
/// Distinct from the persistent on-disk cache: this is pure in-process
/// recall of a parse result, never written to `meta.idx`.
pub struct ElfCache {
    inner: moka::sync::Cache<ContentHash, Arc<ElfInfo>>,
}

impl ElfCache {
    pub fn new(capacity: u64) -> Self {
        ElfCache { inner: moka::sync::Cache::new(capacity) }
    }

    pub fn get_or_parse(&self, hash: ContentHash, data: &[u8]) -> Arc<ElfInfo> {
        self.inner.get_with(hash, || Arc::new(parse_elf(data).unwrap_or_default()))
    }
}

impl Default for ElfCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Spec §4.5 rule 2: first two bytes `#!` marks an interpreted script.
pub fn is_script(data: &[u8]) -> bool {
    data.starts_with(b"#!")
}

/// Extracts the interpreter path from a shebang line, trimming a single
/// leading `#!`, surrounding whitespace, and any interpreter arguments
/// (the kernel itself only ever execs the first token).
pub fn script_interpreter(data: &[u8]) -> Option<String> {
    if !is_script(data) {
        return None;
    }
    let line_end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    let line = std::str::from_utf8(&data[2..line_end]).ok()?;
    line.split_whitespace().next().map(|s| s.to_string())
}

/// Spec §4.5 rule 3: the bytecode companion of `/a/b/name.py` is
/// `/a/b/__pycache__/name.cpython-*.pyc`. Returns the directory to
/// `readdir` and the stem to match entry names against; the caller does
/// the actual glob since only it can issue the `readdir`.
pub fn pyc_companion_dir_and_stem(py_path: &Path) -> Option<(PathBuf, String)> {
    if py_path.extension().and_then(|e| e.to_str()) != Some("py") {
        return None;
    }
    let stem = py_path.file_stem()?.to_str()?.to_string();
    let dir = py_path.parent()?.join("__pycache__");
    Some((dir, stem))
}

pub fn is_pyc_companion_name(stem: &str, candidate_name: &str) -> bool {
    let prefix = format!("{stem}.cpython-");
    candidate_name.starts_with(&prefix) && candidate_name.ends_with(".pyc")
}

/// Conventional dynamic linker search path (spec §4.5 rule 1), before any
/// `/etc/ld.so.conf.d/*.conf` additions.
pub fn standard_search_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/lib"),
        PathBuf::from("/lib64"),
        PathBuf::from("/usr/lib"),
        PathBuf::from("/usr/lib64"),
    ]
}

/// Parses an `ld.so.conf`-style file: one directory per line, `#`-prefixed
/// comments and blank lines ignored, `include` directives ignored (this
/// engine does not itself expand globs across the filesystem — the caller
/// is expected to fetch and parse any matched files separately).
pub fn parse_ld_so_conf(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("include"))
        .map(PathBuf::from)
        .collect()
}

/// Candidate absolute paths for a `DT_NEEDED` library name across the
/// given search directories, in directory order.
pub fn candidate_paths(lib_name: &str, search_dirs: &[PathBuf]) -> Vec<PathBuf> {
    search_dirs.iter().map(|dir| dir.join(lib_name)).collect()
}

/// Deterministically truncates a prefetch target list to at most
/// `max_entries`, preserving input order (spec §4.5: "preferring primary
/// target then BFS order"). Returns the kept list and how many were
/// dropped, so the caller can log what was not prefetched.
pub fn truncate_entries(mut paths: Vec<PathBuf>, max_entries: usize) -> (Vec<PathBuf>, usize) {
    if paths.len() <= max_entries {
        return (paths, 0);
    }
    let dropped = paths.len() - max_entries;
    paths.truncate(max_entries);
    (paths, dropped)
}

/// Deterministically truncates fetched bulk items to a cumulative byte
/// budget, dropping from the tail once the running total would exceed
/// `max_bytes` (spec §4.5 caps, P7).
pub fn truncate_bytes<T>(items: Vec<T>, max_bytes: u64, size_of: impl Fn(&T) -> u64) -> (Vec<T>, usize) {
    let mut kept = Vec::with_capacity(items.len());
    let mut total = 0u64;
    let mut dropped = 0;
    for item in items {
        let size = size_of(&item);
        if total + size > max_bytes {
            dropped += 1;
            continue;
        }
        total += size;
        kept.push(item);
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles a minimal ELF64 ET_DYN binary with one PT_INTERP
    /// segment and one PT_DYNAMIC segment listing two DT_NEEDED entries,
    /// to exercise the parser without needing a real binary on disk.
    fn build_dynamic_elf(interp: &str, needed: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[16..18].copy_from_slice(&(ET_DYN).to_le_bytes());

        let phoff = buf.len() as u64;
        buf[32..40].copy_from_slice(&phoff.to_le_bytes());
        let phentsize = 56u16;
        buf[54..56].copy_from_slice(&phentsize.to_le_bytes());

        // string table: interpreter string (not part of strtab in a real
        // ELF layout, but this test only needs PT_INTERP's own bytes) +
        // dynstr with a leading NUL and each needed name.
        let mut interp_bytes = interp.as_bytes().to_vec();
        interp_bytes.push(0);

        let mut dynstr = vec![0u8]; // index 0 is always empty string
        let mut needed_offsets = Vec::new();
        for name in needed {
            needed_offsets.push(dynstr.len() as u64);
            dynstr.extend_from_slice(name.as_bytes());
            dynstr.push(0);
        }

        let n_phdrs = 3u16; // LOAD, INTERP, DYNAMIC
        buf[56..58].copy_from_slice(&n_phdrs.to_le_bytes());

        let phdr_table_size = n_phdrs as usize * phentsize as usize;
        let interp_offset = phoff as usize + phdr_table_size;
        let dynstr_offset = interp_offset + interp_bytes.len();
        // dynamic entries: DT_STRTAB, DT_NEEDED*, DT_NULL
        let dynamic_offset = dynstr_offset + dynstr.len();
        let dynamic_entries = 2 + needed.len();
        let dynamic_size = dynamic_entries * 16;

        // PT_LOAD covering the whole file at vaddr == file offset (0).
        write_phdr(&mut buf, phoff as usize, 0, PT_LOAD, 0, 0, (dynamic_offset + dynamic_size) as u64);
        write_phdr(&mut buf, phoff as usize, 1, PT_INTERP, interp_offset as u64, interp_offset as u64, interp_bytes.len() as u64);
        write_phdr(&mut buf, phoff as usize, 2, PT_DYNAMIC, dynamic_offset as u64, dynamic_offset as u64, dynamic_size as u64);

        buf.resize(interp_offset, 0);
        buf.extend_from_slice(&interp_bytes);
        buf.extend_from_slice(&dynstr);

        buf.extend_from_slice(&DT_STRTAB.to_le_bytes());
        buf.extend_from_slice(&(dynstr_offset as u64).to_le_bytes());
        for off in &needed_offsets {
            buf.extend_from_slice(&DT_NEEDED.to_le_bytes());
            buf.extend_from_slice(&off.to_le_bytes());
        }
        buf.extend_from_slice(&DT_NULL.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());

        buf
    }

    fn write_phdr(buf: &mut Vec<u8>, phoff: usize, index: usize, p_type: u32, offset: u64, vaddr: u64, filesz: u64) {
        let phentsize = 56usize;
        let base = phoff + index * phentsize;
        if buf.len() < base + phentsize {
            buf.resize(base + phentsize, 0);
        }
        buf[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
        buf[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
        buf[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
        buf[base + 32..base + 40].copy_from_slice(&filesz.to_le_bytes());
    }

    #[test]
    fn parses_interpreter_and_needed_libraries() {
        let data = build_dynamic_elf("/lib64/ld-linux-x86-64.so.2", &["libc.so.6", "libm.so.6"]);
        let info = parse_elf(&data).unwrap();
        assert!(info.is_dynamic);
        assert_eq!(info.interpreter.as_deref(), Some("/lib64/ld-linux-x86-64.so.2"));
        assert_eq!(info.needed, vec!["libc.so.6".to_string(), "libm.so.6".to_string()]);
    }

    #[test]
    fn rejects_non_elf_data() {
        assert!(parse_elf(b"not an elf file at all").is_none());
    }

    #[test]
    fn rejects_32_bit_elf() {
        let mut data = build_dynamic_elf("/lib/ld.so", &[]);
        data[4] = 1; // ELFCLASS32
        assert!(parse_elf(&data).is_none());
    }

    #[test]
    fn elf_cache_memoizes_by_content_hash() {
        let data = build_dynamic_elf("/lib64/ld-linux-x86-64.so.2", &["libc.so.6"]);
        let hash = ContentHash::of(&data);
        let cache = ElfCache::new(16);
        let first = cache.get_or_parse(hash, &data);
        let second = cache.get_or_parse(hash, &[]);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn script_interpreter_parses_shebang_line() {
        assert_eq!(script_interpreter(b"#!/usr/bin/env python3\nprint(1)\n").as_deref(), Some("/usr/bin/env"));
        assert_eq!(script_interpreter(b"#!/bin/sh\necho hi\n").as_deref(), Some("/bin/sh"));
        assert_eq!(script_interpreter(b"no shebang here"), None);
    }

    #[test]
    fn pyc_companion_targets_pycache_directory() {
        let (dir, stem) = pyc_companion_dir_and_stem(Path::new("/usr/lib/python3/foo.py")).unwrap();
        assert_eq!(dir, PathBuf::from("/usr/lib/python3/__pycache__"));
        assert_eq!(stem, "foo");
        assert!(is_pyc_companion_name(&stem, "foo.cpython-311.pyc"));
        assert!(!is_pyc_companion_name(&stem, "bar.cpython-311.pyc"));
    }

    #[test]
    fn ld_so_conf_parsing_skips_comments_and_includes() {
        let content = "# comment\ninclude /etc/ld.so.conf.d/*.conf\n/usr/local/lib\n\n/opt/lib\n";
        let dirs = parse_ld_so_conf(content);
        assert_eq!(dirs, vec![PathBuf::from("/usr/local/lib"), PathBuf::from("/opt/lib")]);
    }

    #[test]
    fn entry_cap_truncates_deterministically_preserving_order() {
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")];
        let (kept, dropped) = truncate_entries(paths, 2);
        assert_eq!(kept, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn byte_cap_drops_items_once_budget_is_exceeded() {
        let items = vec![10u64, 20, 5, 100];
        let (kept, dropped) = truncate_bytes(items, 25, |n| *n);
        assert_eq!(kept, vec![10, 5]);
        assert_eq!(dropped, 2);
    }
}
