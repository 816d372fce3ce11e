//! Register model, instruction set and program representation.
//!
//! Registers are u32 indices into a file of i64 words:
//!
//! | index  | meaning                         |
//! |--------|---------------------------------|
//! | 0      | null (never a valid operand)    |
//! | 1      | constant zero                   |
//! | 2      | time                            |
//! | 3      | instruction pointer (assembler sentinel only) |
//! | 4-11   | locals                          |
//! | 12-15  | inputs                          |
//! | 16-19  | outputs                         |
//! | 20-23  | statics                         |
//! | >= 24  | values (inline literals)        |
//!
//! An instruction is four machine words: opcode, two input registers, one
//! output register. Jump instructions reuse the output word for the target:
//! values in the near-jump window 12..24 encode a forward offset of 0..11;
//! a value register holds a signed displacement relative to the jump itself.

use std::io::{Read, Seek, Write};

use binrw::{binrw, BinReaderExt, BinWrite};

/// The null register; using it as an operand is a compile error.
pub const REG_NULL: u32 = 0;
/// Always reads zero.
pub const REG_ZERO: u32 = 1;
/// The time register, written by `Machine::write_time`.
pub const REG_TIME: u32 = 2;
/// Assembler sentinel for unresolved label operands.
pub const REG_IP: u32 = 3;

/// First local register.
pub const REG_LOCAL: u32 = 4;
pub const LOCAL_COUNT: u32 = 8;

/// First input register.
pub const REG_INPUT: u32 = 12;
pub const INPUT_COUNT: u32 = 4;

/// First output register.
pub const REG_OUTPUT: u32 = 16;
pub const OUTPUT_COUNT: u32 = 4;

/// First static register.
pub const REG_STATIC: u32 = 20;
pub const STATIC_COUNT: u32 = 4;

/// First value register; also the exclusive end of the near-jump window.
pub const REG_VALUE: u32 = 24;

/// Base of the near-jump window: a jump output word `w` in
/// `REG_INPUT..REG_VALUE` means "forward by `w - NEAR_JUMP_BASE`".
pub const NEAR_JUMP_BASE: u32 = REG_INPUT;

/// Widest forward distance a near jump can encode.
pub const NEAR_JUMP_MAX: u32 = REG_VALUE - NEAR_JUMP_BASE - 1;

/// Registers 0..12 are shared globals in a linked program.
pub const GLOBAL_REGS: u32 = REG_INPUT;

#[binrw]
#[brw(little, repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Terminates a run when executed; produced by dead-call compression.
    Nop = 0,
    /// Terminates a run.
    Ret = 1,
    /// Pushes RI1 onto the work-stack and continues.
    Call = 2,
    /// RO = RI1.
    Mov = 3,
    Add = 4,
    Sub = 5,
    Mul = 6,
    Div = 7,
    Shl = 8,
    Shr = 9,
    /// RO = |RI1|.
    Abs = 10,
    /// RO = RO + 1.
    Inc = 11,
    /// RO = RO - 1.
    Dec = 12,
    /// Unconditional jump; target encoded in RO.
    Jmp = 13,
    /// Jump if RI0 == RI1.
    Jeq = 14,
    /// Jump if RI0 != RI1.
    Jne = 15,
}

impl Opcode {
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jeq | Opcode::Jne)
    }
}

/// One instruction: four little-endian u32 words on the wire.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub ri0: u32,
    pub ri1: u32,
    pub ro: u32,
}

impl Instruction {
    pub const SIZE: usize = 16;

    pub fn new(op: Opcode, ri0: u32, ri1: u32, ro: u32) -> Self {
        Self { op, ri0, ri1, ro }
    }

    /// A subscription-chain stub emitted by return synthesis; the linker
    /// fills RI1.
    pub fn call_stub(register: u32) -> Self {
        Self { op: Opcode::Call, ri0: REG_NULL, ri1: 0, ro: register }
    }

    pub fn ret() -> Self {
        Self { op: Opcode::Ret, ri0: REG_NULL, ri1: 0, ro: REG_NULL }
    }

    pub fn nop() -> Self {
        Self { op: Opcode::Nop, ri0: REG_NULL, ri1: 0, ro: REG_NULL }
    }

    pub fn write_to<W: Write + Seek>(&self, writer: &mut W) -> binrw::BinResult<()> {
        self.write_le(writer)
    }

    pub fn read_from<R: Read + Seek>(reader: &mut R) -> binrw::BinResult<Self> {
        reader.read_le()
    }
}

/// An entry point: run from `address` when `register` updates. The register
/// is either the time register or an input register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub register: u32,
    pub address: u32,
}

/// A `.REG` annotation: opaque hint plus an optional symbolic name, carried
/// through the binary format and used to label register dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterHint {
    pub register: u32,
    pub hint: u32,
    pub name: Option<String>,
}

/// A `.TRANS out in` annotation: output `out` transitively depends on input
/// `in`. The linker uses these to narrow subscription deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransHint {
    pub output: u32,
    pub input: u32,
}

/// A compiled actor program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub hints: Vec<RegisterHint>,
    pub trans: Vec<TransHint>,
    pub entry_points: Vec<EntryPoint>,
    pub instructions: Vec<Instruction>,
    pub values: Vec<i64>,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hints: Vec::new(),
            trans: Vec::new(),
            entry_points: Vec::new(),
            instructions: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Input registers the program reads or enters on.
    pub fn used_inputs(&self) -> Vec<u32> {
        let mut used: Vec<u32> = self
            .entry_points
            .iter()
            .map(|e| e.register)
            .chain(self.instructions.iter().flat_map(|i| {
                let mut regs = vec![i.ri0, i.ri1];
                if !i.op.is_jump() {
                    regs.push(i.ro);
                }
                regs
            }))
            .filter(|r| (REG_INPUT..REG_INPUT + INPUT_COUNT).contains(r))
            .collect();
        used.sort_unstable();
        used.dedup();
        used
    }

    /// Output registers the program writes.
    pub fn written_outputs(&self) -> Vec<u32> {
        let mut written: Vec<u32> = self
            .instructions
            .iter()
            .filter(|i| !i.op.is_jump() && !matches!(i.op, Opcode::Call | Opcode::Ret | Opcode::Nop))
            .map(|i| i.ro)
            .filter(|r| (REG_OUTPUT..REG_OUTPUT + OUTPUT_COUNT).contains(r))
            .collect();
        written.sort_unstable();
        written.dedup();
        written
    }

    /// Static registers the program touches.
    pub fn used_statics(&self) -> Vec<u32> {
        let mut used: Vec<u32> = self
            .instructions
            .iter()
            .flat_map(|i| {
                let mut regs = vec![i.ri0, i.ri1];
                if !i.op.is_jump() {
                    regs.push(i.ro);
                }
                regs
            })
            .filter(|r| (REG_STATIC..REG_STATIC + STATIC_COUNT).contains(r))
            .collect();
        used.sort_unstable();
        used.dedup();
        used
    }

    /// Which inputs feed `output`, per the `.TRANS` hints. An output with no
    /// hints is assumed to depend on every input.
    pub fn trans_inputs(&self, output: u32) -> Option<Vec<u32>> {
        let inputs: Vec<u32> = self
            .trans
            .iter()
            .filter(|t| t.output == output)
            .map(|t| t.input)
            .collect();
        if inputs.is_empty() {
            None
        } else {
            Some(inputs)
        }
    }
}
