//! [`SymbolResolver`] backed by the debug information of an ELF executable.
//!
//! Only the parts needed for execution control are loaded: line programs, function bounds from
//! the symbol table and `.eh_frame` for one-frame unwinding.

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::error::Error;
use crate::debugger::symbol::{CallerFrame, FrameContext, FunctionRange, LineRange, SymbolResolver};
use crate::muted_error;
use capstone::prelude::*;
use gimli::{BaseAddresses, CfaRule, EhFrame, RegisterRule, RunTimeEndian, Section, UnwindSection};
use gimli::Reader as _;
use itertools::Itertools;
use log::{debug, info};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub type EndianRcSlice = gimli::EndianRcSlice<RunTimeEndian>;

/// Function known from the ELF symbol table.
#[derive(Debug, Clone)]
struct Function {
    name: String,
    start: GlobalAddress,
    end: GlobalAddress,
}

/// Line row: address range of a single statement, `end` is the start of the next statement.
#[derive(Debug, Clone)]
struct Row {
    file: Rc<Path>,
    line: u64,
    start: GlobalAddress,
    end: GlobalAddress,
}

/// Executable section content, used for return instructions lookup.
struct Code {
    addr: GlobalAddress,
    bytes: Vec<u8>,
}

pub struct DwarfSymbols {
    functions: Vec<Function>,
    rows: Vec<Row>,
    code: Vec<Code>,
    eh_frame: EhFrame<EndianRcSlice>,
    bases: BaseAddresses,
    cs: Capstone,
    position_independent: bool,
    mapping_offset: usize,
}

fn load_section<'a: 'b, 'b, OBJ>(
    id: gimli::SectionId,
    file: &'a OBJ,
    endian: RunTimeEndian,
) -> Result<EndianRcSlice, Error>
where
    OBJ: Object<'a, 'b>,
{
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianRcSlice::new(Rc::from(&*data), endian))
}

impl DwarfSymbols {
    /// Load symbols from an executable file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(|id| load_section(id, &object, endian))?;
        let eh_frame = EhFrame::load(|id| load_section(id, &object, endian))?;

        let section_addr = |name: &str| -> Option<u64> {
            object.sections().find_map(|section| {
                if section.name().ok()? == name {
                    Some(section.address())
                } else {
                    None
                }
            })
        };
        let mut bases = BaseAddresses::default();
        if let Some(got) = section_addr(".got") {
            bases = bases.set_got(got);
        }
        if let Some(text) = section_addr(".text") {
            bases = bases.set_text(text);
        }
        if let Some(eh) = section_addr(".eh_frame") {
            bases = bases.set_eh_frame(eh);
        }
        if let Some(eh_frame_hdr) = section_addr(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(eh_frame_hdr);
        }

        let code = object
            .sections()
            .filter(|section| section.kind() == SectionKind::Text)
            .filter_map(|section| {
                let bytes = section.data().ok()?;
                Some(Code {
                    addr: GlobalAddress::from(section.address()),
                    bytes: bytes.to_vec(),
                })
            })
            .collect();

        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Att)
            .build()
            .map_err(Error::DisAsmInit)?;

        let symbols = Self {
            functions: parse_functions(&object),
            rows: parse_rows(&dwarf)?,
            code,
            eh_frame,
            bases,
            cs,
            position_independent: object.kind() == ObjectKind::Dynamic,
            mapping_offset: 0,
        };
        info!(
            target: "debugger",
            "load symbols from {path:?}: {} functions, {} line rows",
            symbols.functions.len(),
            symbols.rows.len()
        );
        Ok(symbols)
    }

    fn global(&self, addr: RelocatedAddress) -> GlobalAddress {
        addr.into_global(self.mapping_offset)
    }

    fn relocated(&self, addr: GlobalAddress) -> RelocatedAddress {
        addr.relocate(self.mapping_offset)
    }

    fn function(&self, addr: GlobalAddress) -> Option<&Function> {
        let pos = self.functions.partition_point(|f| f.start <= addr);
        let func = self.functions.get(pos.checked_sub(1)?)?;
        (addr < func.end).then_some(func)
    }

    fn row(&self, addr: GlobalAddress) -> Option<&Row> {
        let pos = self.rows.partition_point(|r| r.start <= addr);
        let row = self.rows.get(pos.checked_sub(1)?)?;
        (addr < row.end).then_some(row)
    }

    /// Addresses of function instructions with one of the given mnemonics.
    fn instructions_of(&self, function: &FunctionRange, mnemonics: &[&str]) -> Vec<RelocatedAddress> {
        let start = self.global(function.entry);
        let end = self.global(function.end);
        let Some(code) = self.function_code(start, end) else {
            return vec![];
        };
        let Some(insns) = muted_error!(self.cs.disasm_all(code, start.into()).map_err(Error::DisAsm))
        else {
            return vec![];
        };

        insns
            .as_ref()
            .iter()
            .filter(|insn| insn.mnemonic().is_some_and(|m| mnemonics.contains(&m)))
            .map(|insn| self.relocated(GlobalAddress::from(insn.address())))
            .collect()
    }

    fn function_code(&self, start: GlobalAddress, end: GlobalAddress) -> Option<&[u8]> {
        self.code.iter().find_map(|code| {
            let from = usize::from(start).checked_sub(usize::from(code.addr))?;
            let to = usize::from(end).checked_sub(usize::from(code.addr))?;
            code.bytes.get(from..to)
        })
    }
}

/// Function bounds from the symbol table, aliases at the same address are dropped.
fn parse_functions<'a: 'b, 'b, OBJ: Object<'a, 'b>>(object: &'a OBJ) -> Vec<Function> {
    object
        .symbols()
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.size() > 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            Some(Function {
                name: format!("{:#}", rustc_demangle::demangle(name)),
                start: GlobalAddress::from(symbol.address()),
                end: GlobalAddress::from(symbol.address() + symbol.size()),
            })
        })
        .sorted_by_key(|f| f.start)
        .dedup_by(|f1, f2| f1.start == f2.start)
        .collect()
}

fn parse_rows(dwarf: &gimli::Dwarf<EndianRcSlice>) -> Result<Vec<Row>, Error> {
    let mut builder = RowBuilder::default();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };

        let mut last_file: Option<(u64, Rc<Path>)> = None;

        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            let address = row.address();
            if row.end_sequence() {
                builder.end_sequence(address);
                continue;
            }

            let Some(line) = row.line().map(|l| l.get()) else {
                continue;
            };
            if !row.is_stmt() {
                continue;
            }

            let file = match &last_file {
                Some((index, path)) if *index == row.file_index() => path.clone(),
                _ => {
                    let Some(entry) = row.file(header) else {
                        continue;
                    };
                    let path: Rc<Path> =
                        Rc::from(PathBuf::from(render_file_path(&unit, entry, header, dwarf)?));
                    last_file = Some((row.file_index(), path.clone()));
                    path
                }
            };
            builder.statement(address, file, line);
        }
    }

    let result = builder.finish();
    debug!(target: "debugger", "{} line rows parsed", result.len());
    Ok(result)
}

/// Turns statement rows of line programs into address ranges.
#[derive(Default)]
struct RowBuilder {
    rows: Vec<Row>,
    /// Row in progress: start address, file and line.
    current: Option<(u64, Rc<Path>, u64)>,
}

impl RowBuilder {
    /// Each statement starts a separate range, even if it continues the previous line.
    fn statement(&mut self, address: u64, file: Rc<Path>, line: u64) {
        if let Some((start, cur_file, cur_line)) = self.current.replace((address, file, line)) {
            self.push(cur_file, cur_line, start, address);
        }
    }

    fn end_sequence(&mut self, address: u64) {
        if let Some((start, file, line)) = self.current.take() {
            self.push(file, line, start, address);
        }
    }

    fn push(&mut self, file: Rc<Path>, line: u64, start: u64, end: u64) {
        // zero length rows carry no instructions
        if start < end {
            self.rows.push(Row {
                file,
                line,
                start: GlobalAddress::from(start),
                end: GlobalAddress::from(end),
            })
        }
    }

    fn finish(mut self) -> Vec<Row> {
        self.rows.sort_by_key(|r| r.start);
        self.rows
    }
}

fn render_file_path(
    unit: &gimli::Unit<EndianRcSlice>,
    file: &gimli::FileEntry<EndianRcSlice>,
    header: &gimli::LineProgramHeader<EndianRcSlice>,
    dwarf: &gimli::Dwarf<EndianRcSlice>,
) -> Result<String, gimli::Error> {
    let mut path = match unit.comp_dir {
        Some(ref comp_dir) => comp_dir.to_string_lossy()?.into_owned(),
        None => String::new(),
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path_push(
                &mut path,
                dwarf
                    .attr_string(unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path_push(
        &mut path,
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

fn path_push(path: &mut String, p: &str) {
    if p.starts_with('/') {
        *path = p.to_string();
    } else {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        *path += p;
    }
}

impl SymbolResolver for DwarfSymbols {
    fn function_containing(&self, addr: RelocatedAddress) -> Option<FunctionRange> {
        let func = self.function(self.global(addr))?;
        Some(FunctionRange {
            entry: self.relocated(func.start),
            end: self.relocated(func.end),
            name: func.name.clone(),
        })
    }

    fn line_containing(&self, addr: RelocatedAddress) -> Option<LineRange> {
        let row = self.row(self.global(addr))?;
        Some(LineRange {
            file: row.file.to_path_buf(),
            line: row.line,
            start: self.relocated(row.start),
            end: self.relocated(row.end),
        })
    }

    fn addresses_for_line(&self, file: &Path, line: u64) -> Vec<RelocatedAddress> {
        self.rows
            .iter()
            .filter(|row| row.line == line && row.file.ends_with(file))
            .map(|row| self.relocated(row.start))
            .sorted()
            .dedup()
            .collect()
    }

    fn return_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress> {
        self.instructions_of(function, &["ret", "retq"])
    }

    fn call_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress> {
        self.instructions_of(function, &["call", "callq"])
    }

    fn unwind_frame(&self, ctx: &FrameContext) -> Option<CallerFrame> {
        let pc = self.global(ctx.registers.pc());
        let mut ucx = Box::new(gimli::UnwindContext::new());
        let row = muted_error!(self.eh_frame.unwind_info_for_address(
            &self.bases,
            &mut ucx,
            pc.into(),
            EhFrame::cie_from_offset,
        ))?;

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let value = muted_error!(ctx.registers.dwarf_value(*register))?;
                RelocatedAddress::from(value).offset(*offset as isize)
            }
            CfaRule::Expression(_) => {
                debug!(target: "debugger", "cfa expressions are not supported, pc: {pc}");
                return None;
            }
        };

        let caller_pc = match row.register(gimli::X86_64::RA) {
            RegisterRule::Offset(offset) => ctx.read_u64(cfa.offset(offset as isize))?,
            _ => return None,
        };
        if caller_pc == 0 {
            return None;
        }

        Some(CallerFrame {
            caller_pc: RelocatedAddress::from(caller_pc),
            cfa,
        })
    }

    fn relocate(&mut self, mapping_offset: usize) {
        // non PIE executables are loaded at their link addresses
        self.mapping_offset = if self.position_independent {
            mapping_offset
        } else {
            0
        };
    }
}
