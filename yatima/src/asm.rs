//! The Yatima assembler.
//!
//! Source is line-oriented: `;` starts a comment, whitespace separates
//! tokens. A single `:name` token defines a label at the next instruction;
//! `.`-tokens are directives; anything else up to five tokens is an
//! instruction.
//!
//! Directives: `.ACTOR name`, `.AEND`, `.ENTRY reg…`, `.REG reg hint [name]`,
//! `.TRANS out in`. Register operands are aliases (`%a`/`%b` first inputs,
//! `%c` first output, `%l0..7`, `%s0..3`, `%t`, `0` the constant zero) or
//! bare identifiers that allocate locals on first appearance. Integer
//! literals (decimal or 0x-hex) are interned into the program value table
//! and referenced as value registers.
//!
//! When a section closes (`.ENTRY` or `.AEND`), a block of CALL stubs is
//! synthesized: one per entry register, one per output written in the
//! section, followed by RET. The stubs carry empty targets; the linker
//! threads them into subscription chains.

use std::collections::HashMap;
use std::io::BufRead;

use tracing::trace;

use crate::error::{CompileError, CompileErrorKind};
use crate::isa::{
    EntryPoint, Instruction, Opcode, Program, RegisterHint, TransHint, INPUT_COUNT, LOCAL_COUNT,
    NEAR_JUMP_BASE, NEAR_JUMP_MAX, REG_INPUT, REG_IP, REG_LOCAL, REG_OUTPUT, REG_STATIC,
    REG_TIME, REG_VALUE, REG_ZERO, STATIC_COUNT,
};

/// Compile a source stream into its actor programs. The first error wins.
pub fn compile<R: BufRead>(reader: R) -> Result<Vec<Program>, CompileError> {
    let mut asm = Assembler { programs: Vec::new(), current: None };
    for (number, line) in reader.lines().enumerate() {
        let number = number as u32 + 1;
        let line = line.map_err(|e| {
            CompileError::new(number, CompileErrorKind::External, e.to_string())
        })?;
        asm.line(number, &line)?;
    }
    if let Some(open) = &asm.current {
        return Err(CompileError::new(
            0,
            CompileErrorKind::WrongDirective,
            format!("actor {:?} not closed with .AEND", open.program.name),
        ));
    }
    Ok(asm.programs)
}

/// Compile a source string.
pub fn compile_str(source: &str) -> Result<Vec<Program>, CompileError> {
    compile(source.as_bytes())
}

struct Assembler {
    programs: Vec<Program>,
    current: Option<Builder>,
}

struct Builder {
    program: Program,
    labels: HashMap<String, u32>,
    label_refs: Vec<(usize, String, u32)>,
    named_locals: HashMap<String, u32>,
    next_local: u32,
    section: Section,
}

#[derive(Default)]
struct Section {
    /// Entry registers of the open section; empty means no section yet.
    entries: Vec<u32>,
    /// Output registers written inside the section.
    outputs: Vec<u32>,
    has_code: bool,
}

impl Assembler {
    fn line(&mut self, number: u32, raw: &str) -> Result<(), CompileError> {
        let text = raw.split(';').next().unwrap_or("");
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens[0].starts_with('.') {
            return self.directive(number, &tokens);
        }
        let builder = self.current.as_mut().ok_or_else(|| {
            CompileError::new(number, CompileErrorKind::WrongDirective, "code outside .ACTOR")
        })?;
        match tokens.len() {
            1 => builder.label(number, tokens[0]),
            2..=5 => builder.instruction(number, &tokens),
            n => Err(CompileError::new(
                number,
                CompileErrorKind::TokenCount,
                format!("{n} tokens on one line"),
            )),
        }
    }

    fn directive(&mut self, number: u32, tokens: &[&str]) -> Result<(), CompileError> {
        match tokens[0] {
            ".ACTOR" => {
                if tokens.len() != 2 {
                    return Err(CompileError::new(
                        number,
                        CompileErrorKind::TokenCount,
                        ".ACTOR takes a name",
                    ));
                }
                if self.current.is_some() {
                    return Err(CompileError::new(
                        number,
                        CompileErrorKind::WrongDirective,
                        ".ACTOR inside an open actor",
                    ));
                }
                self.current = Some(Builder::new(tokens[1]));
                Ok(())
            }
            ".AEND" => {
                let mut builder = self.current.take().ok_or_else(|| {
                    CompileError::new(
                        number,
                        CompileErrorKind::WrongDirective,
                        ".AEND without .ACTOR",
                    )
                })?;
                builder.end_section();
                builder.resolve_labels()?;
                trace!(
                    name = %builder.program.name,
                    instructions = builder.program.instructions.len(),
                    "assembled actor"
                );
                self.programs.push(builder.program);
                Ok(())
            }
            other => {
                let builder = self.current.as_mut().ok_or_else(|| {
                    CompileError::new(
                        number,
                        CompileErrorKind::WrongDirective,
                        format!("{other} outside .ACTOR"),
                    )
                })?;
                builder.inner_directive(number, tokens)
            }
        }
    }
}

impl Builder {
    fn new(name: &str) -> Self {
        Self {
            program: Program::new(name),
            labels: HashMap::new(),
            label_refs: Vec::new(),
            named_locals: HashMap::new(),
            next_local: REG_LOCAL,
            section: Section::default(),
        }
    }

    fn inner_directive(&mut self, number: u32, tokens: &[&str]) -> Result<(), CompileError> {
        match tokens[0] {
            ".ENTRY" => {
                if tokens.len() < 2 {
                    return Err(CompileError::new(
                        number,
                        CompileErrorKind::TokenCount,
                        ".ENTRY needs at least one register",
                    ));
                }
                self.end_section();
                let address = self.program.instructions.len() as u32;
                let mut entries = Vec::new();
                for token in &tokens[1..] {
                    let register = self.register(number, token)?;
                    let is_input =
                        (REG_INPUT..REG_INPUT + INPUT_COUNT).contains(&register);
                    if register != REG_TIME && !is_input {
                        return Err(CompileError::new(
                            number,
                            CompileErrorKind::WrongRegister,
                            format!("{token} is not an entry register"),
                        ));
                    }
                    self.program.entry_points.push(EntryPoint { register, address });
                    entries.push(register);
                }
                entries.sort_unstable();
                entries.dedup();
                self.section.entries = entries;
                Ok(())
            }
            ".REG" => {
                if !(3..=4).contains(&tokens.len()) {
                    return Err(CompileError::new(
                        number,
                        CompileErrorKind::TokenCount,
                        ".REG takes a register, a hint and an optional name",
                    ));
                }
                let register = self.register(number, tokens[1])?;
                let hint = parse_int(tokens[2]).ok_or_else(|| {
                    CompileError::new(
                        number,
                        CompileErrorKind::InvalidConstant,
                        format!("bad hint {:?}", tokens[2]),
                    )
                })? as u32;
                self.program.hints.push(RegisterHint {
                    register,
                    hint,
                    name: tokens.get(3).map(|s| s.to_string()),
                });
                Ok(())
            }
            ".TRANS" => {
                if tokens.len() != 3 {
                    return Err(CompileError::new(
                        number,
                        CompileErrorKind::TokenCount,
                        ".TRANS takes two registers",
                    ));
                }
                let output = self.register(number, tokens[1])?;
                let input = self.register(number, tokens[2])?;
                self.program.trans.push(TransHint { output, input });
                Ok(())
            }
            other => Err(CompileError::new(
                number,
                CompileErrorKind::WrongDirective,
                format!("unknown directive {other}"),
            )),
        }
    }

    fn label(&mut self, number: u32, token: &str) -> Result<(), CompileError> {
        let Some(name) = token.strip_prefix(':') else {
            return Err(CompileError::new(
                number,
                CompileErrorKind::TokenCount,
                format!("lone token {token:?} is neither label nor instruction"),
            ));
        };
        if name.is_empty() {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongRegister,
                "empty label name",
            ));
        }
        let address = self.program.instructions.len() as u32;
        if self.labels.insert(name.to_string(), address).is_some() {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongDirective,
                format!("label :{name} redefined"),
            ));
        }
        Ok(())
    }

    fn instruction(&mut self, number: u32, tokens: &[&str]) -> Result<(), CompileError> {
        // Code before any .ENTRY opens an implicit time-tick section.
        if self.section.entries.is_empty() && !self.section.has_code {
            let address = self.program.instructions.len() as u32;
            self.program.entry_points.push(EntryPoint { register: REG_TIME, address });
            self.section.entries = vec![REG_TIME];
        }
        self.section.has_code = true;

        let instr = match tokens {
            [ro, "++"] => {
                let ro = self.writable(number, ro)?;
                Instruction::new(Opcode::Inc, 0, 0, ro)
            }
            [ro, "--"] => {
                let ro = self.writable(number, ro)?;
                Instruction::new(Opcode::Dec, 0, 0, ro)
            }
            [target, "go"] => self.jump(number, Opcode::Jmp, 0, 0, target)?,
            [ro, "=", src] => {
                let ro = self.writable(number, ro)?;
                let src = self.register(number, src)?;
                Instruction::new(Opcode::Mov, 0, src, ro)
            }
            [ro, "=", "abs", src] => {
                let ro = self.writable(number, ro)?;
                let src = self.register(number, src)?;
                Instruction::new(Opcode::Abs, 0, src, ro)
            }
            [ro, "=", a, op, b] => {
                let opcode = match *op {
                    "+" => Opcode::Add,
                    "-" => Opcode::Sub,
                    "*" => Opcode::Mul,
                    "/" => Opcode::Div,
                    "<<" => Opcode::Shl,
                    ">>" => Opcode::Shr,
                    other => {
                        return Err(CompileError::new(
                            number,
                            CompileErrorKind::UnknownInstruction,
                            format!("unknown operator {other:?}"),
                        ))
                    }
                };
                let ro = self.writable(number, ro)?;
                let ri0 = self.register(number, a)?;
                let ri1 = self.register(number, b)?;
                Instruction::new(opcode, ri0, ri1, ro)
            }
            [target, "if", a, "==", b] => {
                let ri0 = self.register(number, a)?;
                let ri1 = self.register(number, b)?;
                self.jump(number, Opcode::Jeq, ri0, ri1, target)?
            }
            [target, "if", a, "!=", b] => {
                let ri0 = self.register(number, a)?;
                let ri1 = self.register(number, b)?;
                self.jump(number, Opcode::Jne, ri0, ri1, target)?
            }
            _ => {
                return Err(CompileError::new(
                    number,
                    CompileErrorKind::UnknownInstruction,
                    format!("unrecognized instruction {:?}", tokens.join(" ")),
                ))
            }
        };

        if !instr.op.is_jump()
            && !matches!(instr.op, Opcode::Call)
            && (REG_OUTPUT..REG_OUTPUT + crate::isa::OUTPUT_COUNT).contains(&instr.ro)
            && !self.section.outputs.contains(&instr.ro)
        {
            self.section.outputs.push(instr.ro);
        }
        self.program.instructions.push(instr);
        Ok(())
    }

    fn jump(
        &mut self,
        number: u32,
        op: Opcode,
        ri0: u32,
        ri1: u32,
        target: &str,
    ) -> Result<Instruction, CompileError> {
        let Some(name) = target.strip_prefix(':') else {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongRegister,
                format!("jump target {target:?} is not a label"),
            ));
        };
        // The instruction-pointer register marks the slot until .AEND
        // resolution replaces it with a near offset or a value register.
        let index = self.program.instructions.len();
        self.label_refs.push((index, name.to_string(), number));
        Ok(Instruction::new(op, ri0, ri1, REG_IP))
    }

    /// Parse a register operand.
    fn register(&mut self, number: u32, token: &str) -> Result<u32, CompileError> {
        match token {
            "%a" => return Ok(REG_INPUT),
            "%b" => return Ok(REG_INPUT + 1),
            "%c" => return Ok(REG_OUTPUT),
            "%t" => return Ok(REG_TIME),
            "0" => return Ok(REG_ZERO),
            _ => {}
        }
        if let Some(rest) = token.strip_prefix("%l") {
            return match rest.parse::<u32>() {
                Ok(n) if n < LOCAL_COUNT => Ok(REG_LOCAL + n),
                _ => Err(CompileError::new(
                    number,
                    CompileErrorKind::WrongRegister,
                    format!("bad local {token}"),
                )),
            };
        }
        if let Some(rest) = token.strip_prefix("%s") {
            return match rest.parse::<u32>() {
                Ok(n) if n < STATIC_COUNT => Ok(REG_STATIC + n),
                _ => Err(CompileError::new(
                    number,
                    CompileErrorKind::WrongRegister,
                    format!("bad static {token}"),
                )),
            };
        }
        if token.starts_with('%') || token.starts_with(':') {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongRegister,
                format!("bad register {token}"),
            ));
        }
        if let Some(value) = parse_int(token) {
            return Ok(REG_VALUE + self.intern(value));
        }
        if token.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
            return Err(CompileError::new(
                number,
                CompileErrorKind::InvalidConstant,
                format!("bad constant {token:?}"),
            ));
        }
        // A bare identifier names a local, allocated on first appearance.
        if let Some(&register) = self.named_locals.get(token) {
            return Ok(register);
        }
        if self.next_local >= REG_LOCAL + LOCAL_COUNT {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongRegister,
                format!("no local left for {token:?}"),
            ));
        }
        let register = self.next_local;
        self.next_local += 1;
        self.named_locals.insert(token.to_string(), register);
        Ok(register)
    }

    /// Parse a register that may be written.
    fn writable(&mut self, number: u32, token: &str) -> Result<u32, CompileError> {
        let register = self.register(number, token)?;
        let writable = (REG_LOCAL..REG_STATIC + STATIC_COUNT).contains(&register);
        if !writable {
            return Err(CompileError::new(
                number,
                CompileErrorKind::WrongRegister,
                format!("{token} is not writable"),
            ));
        }
        Ok(register)
    }

    fn intern(&mut self, value: i64) -> u32 {
        if let Some(at) = self.program.values.iter().position(|&v| v == value) {
            return at as u32;
        }
        self.program.values.push(value);
        self.program.values.len() as u32 - 1
    }

    /// Close the open section: one CALL stub per entry register, then one
    /// per written output register, then RET.
    fn end_section(&mut self) {
        if self.section.entries.is_empty() && !self.section.has_code {
            return;
        }
        for &register in &self.section.entries {
            self.program.instructions.push(Instruction::call_stub(register));
        }
        self.section.outputs.sort_unstable();
        for &register in &self.section.outputs {
            self.program.instructions.push(Instruction::call_stub(register));
        }
        self.program.instructions.push(Instruction::ret());
        self.section = Section::default();
    }

    fn resolve_labels(&mut self) -> Result<(), CompileError> {
        for (index, name, number) in std::mem::take(&mut self.label_refs) {
            let target = *self.labels.get(&name).ok_or_else(|| {
                CompileError::new(
                    number,
                    CompileErrorKind::UnknownLabel,
                    format!("unknown label :{name}"),
                )
            })?;
            let distance = target as i64 - index as i64;
            let ro = if (0..=NEAR_JUMP_MAX as i64).contains(&distance) {
                NEAR_JUMP_BASE + distance as u32
            } else {
                // Too far for the near window: the displacement goes into
                // the value table.
                let slot = self.intern(distance);
                REG_VALUE + slot
            };
            self.program.instructions[index].ro = ro;
        }
        Ok(())
    }
}

fn parse_int(token: &str) -> Option<i64> {
    let (negative, rest) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
        rest.parse::<i64>().ok()?
    } else {
        return None;
    };
    Some(if negative { -value } else { value })
}
