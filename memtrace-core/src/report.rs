//! Binary report writer/reader (spec.md §6).
//!
//! Grounded in `original_source/src/MemTrace.cpp`'s report-writing tail (the `ofstream`
//! sequence emitting the framing tokens documented in spec.md §6) — the original writes
//! straight to an `ofstream` with raw `<<` and `write()` calls; this port uses `byteorder`
//! for the fixed-width little-endian address fields (adopted from the pack's trace-format
//! crates, see DESIGN.md / SPEC_FULL.md §10) and keeps the ASCII decimal framing fields
//! byte-for-byte compatible with the external parser's expectations.

use crate::access::{AccessRange, AccessRecord, AccessType, Discriminator};
use crate::error::{EngineError, ReportIoSnafu};
use byteorder::{WriteBytesExt, LE};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::Path;

const TOK_START: [u8; 4] = [0, 0, 0, 0];
const TOK_END_IMAGES: [u8; 4] = [0, 0, 0, 5];
const TOK_END_GROUP: [u8; 4] = [0, 0, 0, 1];
const TOK_END_FULL_SECTION: [u8; 4] = [0, 0, 0, 2];
const TOK_END_PARTIAL_GROUP: [u8; 4] = [0, 0, 0, 3];
const TOK_END_REPORT: [u8; 4] = [0, 0, 0, 4];
const TOK_PARTIAL_MARKER: [u8; 4] = [0xab, 0xcd, 0xef, 0xff];

const TAG_UNINIT_READ: u8 = 0x0a;
const TAG_OTHER: u8 = 0x0b;
const TAG_WRITE: u8 = 0x1a;
const TAG_READ: u8 = 0x1b;
const TAG_STACK: u8 = 0x1c;
const TAG_HEAP: u8 = 0x1d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegSize {
    Bits32,
    Bits64,
}

impl RegSize {
    pub fn bytes(self) -> usize {
        match self {
            RegSize::Bits32 => 4,
            RegSize::Bits64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedImage {
    pub name: String,
    pub base: u64,
}

/// The logical table the report encodes; round-tripping through `encode`/`decode` must
/// reproduce this value (L2).
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub reg_size: RegSize,
    pub images: Vec<LoadedImage>,
    pub stack_base: u64,
    pub full_overlaps: Vec<(AccessRange, Vec<AccessRecord>)>,
    pub partial_overlaps: Vec<(AccessRange, Vec<(AccessRecord, bool)>)>,
}

fn write_addr<W: Write>(w: &mut W, reg_size: RegSize, v: u64) -> io::Result<()> {
    match reg_size {
        RegSize::Bits32 => w.write_u32::<LE>(v as u32),
        RegSize::Bits64 => w.write_u64::<LE>(v),
    }
}

fn read_addr<R: Read>(r: &mut R, reg_size: RegSize) -> io::Result<u64> {
    match reg_size {
        RegSize::Bits32 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf) as u64)
        }
        RegSize::Bits64 => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        }
    }
}

fn write_field<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write!(w, "{s};")
}

fn write_entry<W: Write>(w: &mut W, reg_size: RegSize, rec: &AccessRecord) -> io::Result<()> {
    w.write_all(&[if rec.is_uninitialized_read { TAG_UNINIT_READ } else { TAG_OTHER }])?;
    write_addr(w, reg_size, rec.ip)?;
    write_addr(w, reg_size, rec.actual_ip)?;
    write_field(w, rec.disasm.as_deref().unwrap_or(""))?;

    w.write_all(&[if rec.is_write() { TAG_WRITE } else { TAG_READ }])?;
    write_field(w, &rec.range.size.to_string())?;

    w.write_all(&[match rec.discriminator {
        Discriminator::Stack => TAG_STACK,
        Discriminator::Heap => TAG_HEAP,
    }])?;
    write_field(w, &rec.sp_offset.to_string())?;
    write_field(w, &rec.bp_offset.to_string())?;

    if rec.is_uninitialized_read {
        let intervals = rec
            .uninitialized_snapshot
            .as_ref()
            .map(|s| s.compute_intervals())
            .unwrap_or_default();
        write_field(w, &intervals.len().to_string())?;
        for (lo, hi) in intervals {
            write_field(w, &lo.to_string())?;
            write_field(w, &hi.to_string())?;
        }
    }
    Ok(())
}

fn encode(report: &Report) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&TOK_START);
    write_field(&mut out, &report.reg_size.bytes().to_string()).unwrap();

    for image in &report.images {
        write_field(&mut out, &image.name).unwrap();
        write_addr(&mut out, report.reg_size, image.base).unwrap();
    }
    out.extend_from_slice(&TOK_END_IMAGES);

    write_addr(&mut out, report.reg_size, report.stack_base).unwrap();

    for (range, records) in &report.full_overlaps {
        write_addr(&mut out, report.reg_size, range.start).unwrap();
        write_field(&mut out, &range.size.to_string()).unwrap();
        for rec in records {
            write_entry(&mut out, report.reg_size, rec).unwrap();
        }
        out.extend_from_slice(&TOK_END_GROUP);
    }
    out.extend_from_slice(&TOK_END_FULL_SECTION);

    for (range, records) in &report.partial_overlaps {
        write_addr(&mut out, report.reg_size, range.start).unwrap();
        write_field(&mut out, &range.size.to_string()).unwrap();
        for (rec, is_partial) in records {
            if *is_partial {
                out.extend_from_slice(&TOK_PARTIAL_MARKER);
            }
            write_entry(&mut out, report.reg_size, rec).unwrap();
        }
        out.extend_from_slice(&TOK_END_PARTIAL_GROUP);
    }
    out.extend_from_slice(&TOK_END_REPORT);
    out
}

pub fn write_report_to(path: &Path, report: &Report) -> Result<(), EngineError> {
    let bytes = encode(report);
    std::fs::write(path, bytes).context(ReportIoSnafu { path: path.to_path_buf() })
}

/// Builds the logical `Report` from the finalized aggregator output (spec.md §6), grouping
/// full-overlap entries to those touching a confirmed uninitialized read and carrying the
/// partial-overlap section produced by [`crate::aggregator::OverlapAggregator::finalize`].
pub fn build_report(
    reg_size: RegSize,
    images: Vec<LoadedImage>,
    stack_base: u64,
    finalized: &crate::aggregator::FinalizedOverlaps,
) -> Report {
    let full_overlaps: Vec<(AccessRange, Vec<AccessRecord>)> = finalized
        .all_accesses
        .iter()
        .filter(|(_, recs)| recs.iter().any(|r| r.is_uninitialized_read))
        .map(|(range, recs)| (*range, recs.clone()))
        .collect();

    let partial_overlaps: Vec<(AccessRange, Vec<(AccessRecord, bool)>)> = finalized
        .partial_overlaps
        .iter()
        .map(|(range, recs)| {
            let tagged = recs
                .iter()
                .map(|r| {
                    let is_partial = !(r.range.start >= range.start && r.range.last_byte() <= range.last_byte());
                    (r.clone(), is_partial)
                })
                .collect();
            (*range, tagged)
        })
        .collect();

    Report {
        reg_size,
        images,
        stack_base,
        full_overlaps,
        partial_overlaps,
    }
}

// --- Decode path, used only by tests to verify the round-trip law (L2). The real consumer
// is the external binary-to-text report parser (out of scope per spec.md §1); this decoder
// exists purely so this crate's own test suite can assert encode/decode fidelity without a
// second implementation drifting out of sync.

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take4(&mut self) -> [u8; 4] {
        let out: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        out
    }

    fn take_addr(&mut self, reg_size: RegSize) -> u64 {
        let n = reg_size.bytes();
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        match reg_size {
            RegSize::Bits32 => u32::from_le_bytes(slice.try_into().unwrap()) as u64,
            RegSize::Bits64 => u64::from_le_bytes(slice.try_into().unwrap()),
        }
    }

    fn take_byte(&mut self) -> u8 {
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn take_field(&mut self) -> String {
        let start = self.pos;
        while self.buf[self.pos] != b';' {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        self.pos += 1; // skip ';'
        s
    }

    fn peek4(&self) -> Option<[u8; 4]> {
        self.buf.get(self.pos..self.pos + 4).map(|s| s.try_into().unwrap())
    }
}

fn decode_entry(c: &mut Cursor, reg_size: RegSize, order: &mut u64) -> AccessRecord {
    let is_uninit = c.take_byte() == TAG_UNINIT_READ;
    let ip = c.take_addr(reg_size);
    let actual_ip = c.take_addr(reg_size);
    let disasm = c.take_field();

    let is_write = c.take_byte() == TAG_WRITE;
    let size: u32 = c.take_field().parse().unwrap();

    let discriminator = if c.take_byte() == TAG_STACK {
        Discriminator::Stack
    } else {
        Discriminator::Heap
    };
    let sp_offset: i64 = c.take_field().parse().unwrap();
    let bp_offset: i64 = c.take_field().parse().unwrap();

    let mut snapshot = None;
    if is_uninit {
        let n: usize = c.take_field().parse().unwrap();
        let mut intervals = Vec::with_capacity(n);
        for _ in 0..n {
            let lo: u32 = c.take_field().parse().unwrap();
            let hi: u32 = c.take_field().parse().unwrap();
            intervals.push((lo, hi));
        }
        snapshot = Some(crate::shadow::BitSnapshot::from_intervals(size, &intervals));
    }

    *order += 1;
    AccessRecord {
        order: *order,
        ip,
        actual_ip,
        opcode: crate::emulator::Opcode(0),
        access_type: if is_write { AccessType::Write } else { AccessType::Read },
        range: AccessRange::new(0, size),
        sp_offset,
        bp_offset,
        disasm: if disasm.is_empty() { None } else { Some(disasm) },
        is_uninitialized_read: is_uninit,
        uninitialized_snapshot: snapshot,
        discriminator,
    }
}

pub fn decode(buf: &[u8]) -> Report {
    let mut c = Cursor::new(buf);
    assert_eq!(c.take4(), TOK_START);
    let reg_bytes: usize = c.take_field().parse().unwrap();
    let reg_size = if reg_bytes == 4 { RegSize::Bits32 } else { RegSize::Bits64 };

    let mut images = Vec::new();
    loop {
        if c.peek4() == Some(TOK_END_IMAGES) {
            c.take4();
            break;
        }
        let name = c.take_field();
        let base = c.take_addr(reg_size);
        images.push(LoadedImage { name, base });
    }

    let stack_base = c.take_addr(reg_size);

    let mut order = 0u64;
    let mut full_overlaps = Vec::new();
    loop {
        if c.peek4() == Some(TOK_END_FULL_SECTION) {
            c.take4();
            break;
        }
        let start = c.take_addr(reg_size);
        let size: u32 = c.take_field().parse().unwrap();
        let range = AccessRange::new(start, size);
        let mut records = Vec::new();
        loop {
            if c.peek4() == Some(TOK_END_GROUP) {
                c.take4();
                break;
            }
            let mut rec = decode_entry(&mut c, reg_size, &mut order);
            rec.range = range;
            records.push(rec);
        }
        full_overlaps.push((range, records));
    }

    let mut partial_overlaps = Vec::new();
    loop {
        if c.pos >= buf.len() || c.peek4() == Some(TOK_END_REPORT) {
            if c.peek4() == Some(TOK_END_REPORT) {
                c.take4();
            }
            break;
        }
        let start = c.take_addr(reg_size);
        let size: u32 = c.take_field().parse().unwrap();
        let range = AccessRange::new(start, size);
        let mut records = Vec::new();
        loop {
            if c.peek4() == Some(TOK_END_PARTIAL_GROUP) {
                c.take4();
                break;
            }
            let is_partial = if c.peek4() == Some(TOK_PARTIAL_MARKER) {
                c.take4();
                true
            } else {
                false
            };
            let mut rec = decode_entry(&mut c, reg_size, &mut order);
            rec.range = range;
            records.push((rec, is_partial));
        }
        partial_overlaps.push((range, records));
    }

    Report {
        reg_size,
        images,
        stack_base,
        full_overlaps,
        partial_overlaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::BitSnapshot;

    fn sample_record(order: u64, uninit: bool) -> AccessRecord {
        AccessRecord {
            order,
            ip: 0x400100,
            actual_ip: 0x400100,
            opcode: crate::emulator::Opcode(0),
            access_type: AccessType::Read,
            range: AccessRange::new(0x7fff0000, 16),
            sp_offset: -16,
            bp_offset: 0,
            disasm: Some("mov eax, [rsp]".to_string()),
            is_uninitialized_read: uninit,
            uninitialized_snapshot: if uninit {
                Some(BitSnapshot::from_intervals(16, &[(8, 15)]))
            } else {
                None
            },
            discriminator: Discriminator::Stack,
        }
    }

    #[test]
    fn round_trip_simple_stack_leak_report() {
        // L2.
        let report = Report {
            reg_size: RegSize::Bits64,
            images: vec![LoadedImage { name: "a.out".to_string(), base: 0x400000 }],
            stack_base: 0x7fff_0000,
            full_overlaps: vec![(AccessRange::new(0x7fff0000, 16), vec![sample_record(1, true)])],
            partial_overlaps: vec![],
        };
        let bytes = encode(&report);
        let decoded = decode(&bytes);
        assert_eq!(decoded.reg_size, report.reg_size);
        assert_eq!(decoded.stack_base, report.stack_base);
        assert_eq!(decoded.images.len(), 1);
        assert_eq!(decoded.images[0].name, "a.out");
        assert_eq!(decoded.full_overlaps.len(), 1);
        let (range, recs) = &decoded.full_overlaps[0];
        assert_eq!(*range, AccessRange::new(0x7fff0000, 16));
        assert_eq!(recs[0].disasm.as_deref(), Some("mov eax, [rsp]"));
        assert!(recs[0].is_uninitialized_read);
        assert_eq!(
            recs[0].uninitialized_snapshot.as_ref().unwrap().compute_intervals(),
            vec![(8, 15)]
        );
    }

    #[test]
    fn round_trip_with_partial_overlap_marker() {
        let report = Report {
            reg_size: RegSize::Bits32,
            images: vec![],
            stack_base: 0xffff0000,
            full_overlaps: vec![],
            partial_overlaps: vec![(
                AccessRange::new(0x2000, 8),
                vec![(sample_record(1, false), true)],
            )],
        };
        let bytes = encode(&report);
        let decoded = decode(&bytes);
        assert_eq!(decoded.reg_size, RegSize::Bits32);
        let (_, recs) = &decoded.partial_overlaps[0];
        assert!(recs[0].1);
        assert!(!recs[0].0.is_uninitialized_read);
    }
}
