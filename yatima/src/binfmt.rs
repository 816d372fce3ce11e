//! The self-describing binary container.
//!
//! A file is a stream of 16-byte records. The first record is the header
//! directive: its type field is the magic `YAB0` and its length is the
//! number of records that follow. After all records comes the string pool:
//! NUL-terminated byte strings referenced by byte offset.
//!
//! Block directives carry `length > 0` covering the records that follow.
//! A program section:
//!
//! ```text
//! PROGRAM(name, index)          length = records up to PROGRAM-END
//!   REGISTER-HINT(reg, hint)
//!   REGISTER-NAME(reg, name)
//!   TRANS-HINT(out, in)
//!   ENTRY-POINT(reg, address)
//!   VALUES(count)               length = payload records, 2 x i64 each
//!   PROGRAM-BODY(count)         length = count, raw instruction records
//! PROGRAM-END
//! ```
//!
//! Models (`MODEL`, `PIN-CLUSTER`, `PIN-GROUP`, `PIN`, `ACTOR-INSTANCE`,
//! `ACTOR-INPUT`) and linked programs (`LINKED-PROGRAM`,
//! `LINKED-REGISTERS`, `LINKED-ENTRY-POINT`, then `VALUES` and
//! `PROGRAM-BODY`) use analogous blocks. An `ACTOR-INPUT` packs its pin as
//! `cluster << 22 | group << 11 | pin`.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, Write};

use binrw::{binrw, BinReaderExt, BinWrite};

use crate::error::BinError;
use crate::isa::{EntryPoint, Instruction, Program, RegisterHint, TransHint};
use crate::linker::{LinkedProgram, LinkedRegister, RegKind};
use crate::model::{ActorInstance, PinCluster, PinGroup, PinIndex, TimeMode};

/// File magic, `YAB0` little-endian.
pub const BIN_MAGIC: u32 = u32::from_le_bytes(*b"YAB0");

/// Record size: every directive and every payload record is 16 bytes.
pub const RECORD_SIZE: usize = 16;

const DT_PROGRAM: u32 = 1;
const DT_PROGRAM_BODY: u32 = 2;
const DT_PROGRAM_END: u32 = 3;
const DT_VALUES: u32 = 4;
const DT_REGISTER_HINT: u32 = 5;
const DT_REGISTER_NAME: u32 = 6;
const DT_TRANS_HINT: u32 = 7;
const DT_ENTRY_POINT: u32 = 8;
const DT_MODEL: u32 = 9;
const DT_PIN_CLUSTER: u32 = 10;
const DT_PIN_GROUP: u32 = 11;
const DT_PIN: u32 = 12;
const DT_ACTOR_INSTANCE: u32 = 13;
const DT_ACTOR_INPUT: u32 = 14;
const DT_LINKED_PROGRAM: u32 = 15;
const DT_LINKED_REGISTERS: u32 = 16;
const DT_LINKED_ENTRY_POINT: u32 = 17;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub dtype: u32,
    pub p0: u32,
    pub p1: u32,
    pub length: u32,
}

impl Directive {
    fn new(dtype: u32, p0: u32, p1: u32, length: u32) -> Self {
        Self { dtype, p0, p1, length }
    }

    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        let mut cursor = Cursor::new(&mut bytes[..]);
        self.write_le(&mut cursor).expect("fixed-size record");
        bytes
    }

    fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut cursor = Cursor::new(&bytes[..]);
        cursor.read_le().expect("fixed-size record")
    }
}

/// A model as stored on disk: everything but the library.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub clusters: Vec<PinCluster>,
    pub actors: Vec<ActorInstance>,
}

/// The decoded contents of a container file.
#[derive(Debug, Default)]
pub struct BinaryFile {
    pub programs: Vec<Program>,
    pub models: Vec<ModelSpec>,
    pub linked: Vec<LinkedProgram>,
}

impl BinaryFile {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---- writing ----

struct Writer {
    records: Vec<[u8; RECORD_SIZE]>,
    pool: Vec<u8>,
    interned: HashMap<String, u32>,
}

impl Writer {
    fn new() -> Self {
        Self { records: Vec::new(), pool: Vec::new(), interned: HashMap::new() }
    }

    fn string(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.interned.get(s) {
            return offset;
        }
        let offset = self.pool.len() as u32;
        self.pool.extend_from_slice(s.as_bytes());
        self.pool.push(0);
        self.interned.insert(s.to_string(), offset);
        offset
    }

    fn push(&mut self, directive: Directive) {
        self.records.push(directive.to_bytes());
    }

    fn push_raw(&mut self, bytes: [u8; RECORD_SIZE]) {
        self.records.push(bytes);
    }

    fn values_block(&mut self, values: &[i64]) {
        if values.is_empty() {
            return;
        }
        let payload = values.len().div_ceil(2) as u32;
        self.push(Directive::new(DT_VALUES, values.len() as u32, 0, payload));
        for pair in values.chunks(2) {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes[..8].copy_from_slice(&pair[0].to_le_bytes());
            if let Some(second) = pair.get(1) {
                bytes[8..].copy_from_slice(&second.to_le_bytes());
            }
            self.push_raw(bytes);
        }
    }

    fn body_block(&mut self, instructions: &[Instruction]) {
        let count = instructions.len() as u32;
        self.push(Directive::new(DT_PROGRAM_BODY, count, 0, count));
        for instr in instructions {
            let mut bytes = [0u8; RECORD_SIZE];
            let mut cursor = Cursor::new(&mut bytes[..]);
            instr.write_to(&mut cursor).expect("fixed-size record");
            self.push_raw(bytes);
        }
    }

    fn program(&mut self, index: u32, program: &Program) {
        let name = self.string(&program.name);
        let block_start = self.records.len();
        self.push(Directive::new(DT_PROGRAM, name, index, 0));

        for hint in &program.hints {
            self.push(Directive::new(DT_REGISTER_HINT, hint.register, hint.hint, 0));
            if let Some(hint_name) = &hint.name {
                let offset = self.string(hint_name);
                self.push(Directive::new(DT_REGISTER_NAME, hint.register, offset, 0));
            }
        }
        for trans in &program.trans {
            self.push(Directive::new(DT_TRANS_HINT, trans.output, trans.input, 0));
        }
        for entry in &program.entry_points {
            self.push(Directive::new(DT_ENTRY_POINT, entry.register, entry.address, 0));
        }
        self.values_block(&program.values);
        self.body_block(&program.instructions);
        self.push(Directive::new(DT_PROGRAM_END, 0, 0, 0));

        let length = (self.records.len() - block_start - 1) as u32;
        self.records[block_start] = Directive::new(DT_PROGRAM, name, index, length).to_bytes();
    }

    fn model(&mut self, spec: &ModelSpec) -> Result<(), BinError> {
        let block_start = self.records.len();
        self.push(Directive::new(DT_MODEL, 0, spec.actors.len() as u32, 0));

        for (index, cluster) in spec.clusters.iter().enumerate() {
            let name = self.string(&cluster.name);
            self.push(Directive::new(DT_PIN_CLUSTER, index as u32 + 1, name, 0));
            for group in &cluster.groups {
                let group_name = self.string(&group.name);
                self.push(Directive::new(DT_PIN_GROUP, index as u32 + 1, group_name, 0));
                for pin in 0..group.pins {
                    self.push(Directive::new(DT_PIN, pin, 0, 0));
                }
            }
        }
        for actor in &spec.actors {
            let mode = time_mode_code(actor.time_mode);
            self.push(Directive::new(DT_ACTOR_INSTANCE, actor.program as u32, mode, 0));
            for (slot, pin) in actor.inputs.iter().enumerate() {
                self.push(Directive::new(DT_ACTOR_INPUT, slot as u32, pack_pin(pin)?, 0));
            }
        }

        let length = (self.records.len() - block_start - 1) as u32;
        self.records[block_start] =
            Directive::new(DT_MODEL, 0, spec.actors.len() as u32, length).to_bytes();
        Ok(())
    }

    fn linked(&mut self, linked: &LinkedProgram) -> Result<(), BinError> {
        let block_start = self.records.len();
        self.push(Directive::new(
            DT_LINKED_PROGRAM,
            linked.value_base,
            linked.input_count,
            0,
        ));

        let count = linked.registers.len() as u32;
        self.push(Directive::new(DT_LINKED_REGISTERS, count, 0, count));
        for register in &linked.registers {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes[..4].copy_from_slice(&register.pin.cluster.to_le_bytes());
            bytes[4..8].copy_from_slice(&register.pin.group.to_le_bytes());
            bytes[8..12].copy_from_slice(&register.pin.pin.to_le_bytes());
            bytes[12..].copy_from_slice(&reg_kind_code(register.kind).to_le_bytes());
            self.push_raw(bytes);
        }
        for entry in &linked.entry_points {
            self.push(Directive::new(DT_LINKED_ENTRY_POINT, entry.register, entry.address, 0));
        }
        self.values_block(&linked.values);
        self.body_block(&linked.instructions);
        self.push(Directive::new(DT_PROGRAM_END, 0, 0, 0));

        let length = (self.records.len() - block_start - 1) as u32;
        self.records[block_start] = Directive::new(
            DT_LINKED_PROGRAM,
            linked.value_base,
            linked.input_count,
            length,
        )
        .to_bytes();
        Ok(())
    }
}

fn pack_pin(pin: &PinIndex) -> Result<u32, BinError> {
    if pin.cluster >= 1 << 10 || pin.group >= 1 << 11 || pin.pin >= 1 << 11 {
        return Err(BinError::Format(format!("pin {pin} exceeds the packed encoding")));
    }
    Ok(pin.cluster << 22 | pin.group << 11 | pin.pin)
}

fn unpack_pin(packed: u32) -> PinIndex {
    PinIndex::new(packed >> 22, (packed >> 11) & 0x7FF, packed & 0x7FF)
}

fn time_mode_code(mode: TimeMode) -> u32 {
    match mode {
        TimeMode::None => 0,
        TimeMode::Window => 1,
        TimeMode::End => 2,
    }
}

fn time_mode_from(code: u32) -> Result<TimeMode, BinError> {
    Ok(match code {
        0 => TimeMode::None,
        1 => TimeMode::Window,
        2 => TimeMode::End,
        other => return Err(BinError::Format(format!("unknown time mode {other}"))),
    })
}

fn reg_kind_code(kind: RegKind) -> u32 {
    match kind {
        RegKind::Input => 0,
        RegKind::Static => 1,
        RegKind::Value => 2,
        RegKind::Pad => 3,
    }
}

fn reg_kind_from(code: u32) -> Result<RegKind, BinError> {
    Ok(match code {
        0 => RegKind::Input,
        1 => RegKind::Static,
        2 => RegKind::Value,
        3 => RegKind::Pad,
        other => return Err(BinError::Format(format!("unknown register kind {other}"))),
    })
}

/// Write a container file: header directive, records, string pool.
pub fn write_file<W: Write + Seek>(writer: &mut W, file: &BinaryFile) -> Result<(), BinError> {
    let mut out = Writer::new();
    for (index, program) in file.programs.iter().enumerate() {
        out.program(index as u32, program);
    }
    for model in &file.models {
        out.model(model)?;
    }
    for linked in &file.linked {
        out.linked(linked)?;
    }

    let header = Directive::new(BIN_MAGIC, 0, 0, out.records.len() as u32);
    writer.write_all(&header.to_bytes())?;
    for record in &out.records {
        writer.write_all(record)?;
    }
    writer.write_all(&out.pool)?;
    Ok(())
}

/// Write just a program list.
pub fn write_programs<W: Write + Seek>(
    writer: &mut W,
    programs: &[Program],
) -> Result<(), BinError> {
    let file = BinaryFile {
        programs: programs.to_vec(),
        models: Vec::new(),
        linked: Vec::new(),
    };
    write_file(writer, &file)
}

// ---- reading ----

struct Reader {
    records: Vec<[u8; RECORD_SIZE]>,
    pool: Vec<u8>,
    at: usize,
}

impl Reader {
    fn string(&self, offset: u32) -> Result<String, BinError> {
        let start = offset as usize;
        if start >= self.pool.len() {
            return Err(BinError::Format(format!("string offset {offset} past the pool")));
        }
        let end = self.pool[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| BinError::Format("unterminated string".into()))?;
        Ok(String::from_utf8_lossy(&self.pool[start..end]).into_owned())
    }

    fn next(&mut self) -> Option<Directive> {
        let record = self.records.get(self.at)?;
        self.at += 1;
        Some(Directive::from_bytes(record))
    }

    fn next_raw(&mut self) -> Result<[u8; RECORD_SIZE], BinError> {
        let record = self
            .records
            .get(self.at)
            .copied()
            .ok_or_else(|| BinError::Format("truncated record stream".into()))?;
        self.at += 1;
        Ok(record)
    }

    fn read_values(&mut self, directive: Directive) -> Result<Vec<i64>, BinError> {
        let count = directive.p0 as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..directive.length {
            let bytes = self.next_raw()?;
            values.push(i64::from_le_bytes(bytes[..8].try_into().unwrap()));
            if values.len() < count {
                values.push(i64::from_le_bytes(bytes[8..].try_into().unwrap()));
            }
        }
        if values.len() != count {
            return Err(BinError::Format(format!(
                "VALUES declared {count}, payload held {}",
                values.len()
            )));
        }
        Ok(values)
    }

    fn read_body(&mut self, directive: Directive) -> Result<Vec<Instruction>, BinError> {
        let mut instructions = Vec::with_capacity(directive.length as usize);
        for _ in 0..directive.length {
            let bytes = self.next_raw()?;
            let mut cursor = Cursor::new(&bytes[..]);
            instructions.push(Instruction::read_from(&mut cursor)?);
        }
        Ok(instructions)
    }

    fn read_program(&mut self, header: Directive) -> Result<Program, BinError> {
        let mut program = Program::new(self.string(header.p0)?);
        loop {
            let directive = self
                .next()
                .ok_or_else(|| BinError::Format("program block not closed".into()))?;
            match directive.dtype {
                DT_REGISTER_HINT => program.hints.push(RegisterHint {
                    register: directive.p0,
                    hint: directive.p1,
                    name: None,
                }),
                DT_REGISTER_NAME => {
                    let name = self.string(directive.p1)?;
                    match program.hints.iter_mut().rev().find(|h| h.register == directive.p0) {
                        Some(hint) => hint.name = Some(name),
                        None => program.hints.push(RegisterHint {
                            register: directive.p0,
                            hint: 0,
                            name: Some(name),
                        }),
                    }
                }
                DT_TRANS_HINT => program
                    .trans
                    .push(TransHint { output: directive.p0, input: directive.p1 }),
                DT_ENTRY_POINT => program
                    .entry_points
                    .push(EntryPoint { register: directive.p0, address: directive.p1 }),
                DT_VALUES => program.values = self.read_values(directive)?,
                DT_PROGRAM_BODY => program.instructions = self.read_body(directive)?,
                DT_PROGRAM_END => return Ok(program),
                other => {
                    return Err(BinError::Format(format!(
                        "unexpected directive {other} inside a program block"
                    )))
                }
            }
        }
    }

    fn read_model(&mut self, header: Directive) -> Result<ModelSpec, BinError> {
        let mut spec = ModelSpec { clusters: Vec::new(), actors: Vec::new() };
        let end = self.at + header.length as usize;
        while self.at < end {
            let directive = self
                .next()
                .ok_or_else(|| BinError::Format("model block truncated".into()))?;
            match directive.dtype {
                DT_PIN_CLUSTER => {
                    spec.clusters.push(PinCluster {
                        name: self.string(directive.p1)?,
                        groups: Vec::new(),
                    });
                }
                DT_PIN_GROUP => {
                    let cluster = spec
                        .clusters
                        .last_mut()
                        .ok_or_else(|| BinError::Format("PIN-GROUP before PIN-CLUSTER".into()))?;
                    cluster.groups.push(PinGroup {
                        name: self.string(directive.p1)?,
                        pins: 0,
                    });
                }
                DT_PIN => {
                    let group = spec
                        .clusters
                        .last_mut()
                        .and_then(|c| c.groups.last_mut())
                        .ok_or_else(|| BinError::Format("PIN before PIN-GROUP".into()))?;
                    group.pins += 1;
                }
                DT_ACTOR_INSTANCE => {
                    spec.actors.push(ActorInstance {
                        program: directive.p0 as usize,
                        time_mode: time_mode_from(directive.p1)?,
                        inputs: Vec::new(),
                    });
                }
                DT_ACTOR_INPUT => {
                    let actor = spec
                        .actors
                        .last_mut()
                        .ok_or_else(|| BinError::Format("ACTOR-INPUT before ACTOR-INSTANCE".into()))?;
                    if directive.p0 as usize != actor.inputs.len() {
                        return Err(BinError::Format(format!(
                            "actor input slot {} out of order",
                            directive.p0
                        )));
                    }
                    actor.inputs.push(unpack_pin(directive.p1));
                }
                other => {
                    return Err(BinError::Format(format!(
                        "unexpected directive {other} inside a model block"
                    )))
                }
            }
        }
        Ok(spec)
    }

    fn read_linked(&mut self, header: Directive) -> Result<LinkedProgram, BinError> {
        let mut registers: Vec<LinkedRegister> = Vec::new();
        let mut entry_points = Vec::new();
        let mut values = Vec::new();
        let mut instructions = Vec::new();
        loop {
            let directive = self
                .next()
                .ok_or_else(|| BinError::Format("linked block not closed".into()))?;
            match directive.dtype {
                DT_LINKED_REGISTERS => {
                    for _ in 0..directive.length {
                        let bytes = self.next_raw()?;
                        let pin = PinIndex::new(
                            u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
                            u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
                        );
                        let kind =
                            reg_kind_from(u32::from_le_bytes(bytes[12..].try_into().unwrap()))?;
                        registers.push(LinkedRegister { pin, kind });
                    }
                }
                DT_LINKED_ENTRY_POINT => entry_points
                    .push(EntryPoint { register: directive.p0, address: directive.p1 }),
                DT_VALUES => values = self.read_values(directive)?,
                DT_PROGRAM_BODY => instructions = self.read_body(directive)?,
                DT_PROGRAM_END => break,
                other => {
                    return Err(BinError::Format(format!(
                        "unexpected directive {other} inside a linked block"
                    )))
                }
            }
        }
        Ok(LinkedProgram {
            instructions,
            registers,
            entry_points,
            values,
            value_base: header.p0,
            input_count: header.p1,
            // Derived debug info; not part of the stored form.
            actor_addresses: Vec::new(),
        })
    }
}

/// Read a container file.
pub fn read_file<R: Read + Seek>(reader: &mut R) -> Result<BinaryFile, BinError> {
    let mut header_bytes = [0u8; RECORD_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = Directive::from_bytes(&header_bytes);
    if header.dtype != BIN_MAGIC {
        return Err(BinError::Format(format!("bad magic 0x{:08x}", header.dtype)));
    }

    let mut records = Vec::with_capacity(header.length as usize);
    for _ in 0..header.length {
        let mut bytes = [0u8; RECORD_SIZE];
        reader.read_exact(&mut bytes)?;
        records.push(bytes);
    }
    // The string pool sits past the directive region.
    let mut pool = Vec::new();
    reader.read_to_end(&mut pool)?;

    let mut stream = Reader { records, pool, at: 0 };
    let mut file = BinaryFile::new();
    while let Some(directive) = stream.next() {
        match directive.dtype {
            DT_PROGRAM => {
                let program = stream.read_program(directive)?;
                file.programs.push(program);
            }
            DT_MODEL => {
                let model = stream.read_model(directive)?;
                file.models.push(model);
            }
            DT_LINKED_PROGRAM => {
                let linked = stream.read_linked(directive)?;
                file.linked.push(linked);
            }
            other => {
                return Err(BinError::Format(format!(
                    "unexpected top-level directive {other}"
                )))
            }
        }
    }
    Ok(file)
}

/// Read only the programs of a container file.
pub fn read_programs<R: Read + Seek>(reader: &mut R) -> Result<Vec<Program>, BinError> {
    Ok(read_file(reader)?.programs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::compile_str;
    use crate::model::{Library, Model};

    fn sample_programs() -> Vec<Program> {
        compile_str(
            ".ACTOR plus\n\
             .REG %s0 1 carry\n\
             .TRANS %c %a\n\
             .ENTRY %a %b\n\
             %c = %a + %b\n\
             .AEND\n\
             .ACTOR scale\n\
             .ENTRY %a\n\
             %c = %a * 1000\n\
             .AEND\n",
        )
        .unwrap()
    }

    #[test]
    fn test_program_roundtrip() {
        let programs = sample_programs();
        let mut cursor = Cursor::new(Vec::new());
        write_programs(&mut cursor, &programs).unwrap();

        // Header magic spelled out; the string pool follows the records.
        let bytes = cursor.get_ref();
        assert_eq!(&bytes[..4], b"YAB0");
        let declared = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        assert!(bytes.len() > (declared + 1) * RECORD_SIZE);

        cursor.set_position(0);
        let back = read_programs(&mut cursor).unwrap();
        assert_eq!(back, programs);
    }

    #[test]
    fn test_model_roundtrip() {
        let library = Library::from_programs(sample_programs());
        let mut model = Model::new(library);
        let cluster = model.add_cluster("sensors");
        model.add_group(cluster, "pair", 2).unwrap();
        let plus = model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
            )
            .unwrap();
        let out = model.actor_output(plus, 0);
        model.add_actor("scale", TimeMode::Window, &[out]).unwrap();

        let file = BinaryFile {
            programs: sample_programs(),
            models: vec![ModelSpec {
                clusters: model.clusters().to_vec(),
                actors: model.actors().to_vec(),
            }],
            linked: Vec::new(),
        };
        let mut cursor = Cursor::new(Vec::new());
        write_file(&mut cursor, &file).unwrap();
        cursor.set_position(0);
        let back = read_file(&mut cursor).unwrap();

        assert_eq!(back.models.len(), 1);
        let spec = &back.models[0];
        assert_eq!(spec.clusters.len(), 1);
        assert_eq!(spec.clusters[0].groups[0].pins, 2);
        assert_eq!(spec.actors.len(), 2);
        assert_eq!(spec.actors[1].inputs, vec![PinIndex::new(0, 0, 0)]);
        assert_eq!(spec.actors[1].time_mode, TimeMode::Window);

        // The spec rebuilds into a linkable model.
        let library = Library::from_programs(back.programs);
        let rebuilt =
            Model::from_parts(library, spec.clusters.clone(), spec.actors.clone()).unwrap();
        rebuilt.link().unwrap();
    }

    #[test]
    fn test_linked_roundtrip() {
        let library = Library::from_programs(sample_programs());
        let mut model = Model::new(library);
        let cluster = model.add_cluster("sensors");
        model.add_group(cluster, "pair", 2).unwrap();
        model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
            )
            .unwrap();
        let linked = model.link().unwrap();

        let file = BinaryFile {
            programs: Vec::new(),
            models: Vec::new(),
            linked: vec![linked.clone()],
        };
        let mut cursor = Cursor::new(Vec::new());
        write_file(&mut cursor, &file).unwrap();
        cursor.set_position(0);
        let back = read_file(&mut cursor).unwrap();

        let restored = &back.linked[0];
        assert_eq!(restored.instructions, linked.instructions);
        assert_eq!(restored.registers, linked.registers);
        assert_eq!(restored.entry_points, linked.entry_points);
        assert_eq!(restored.values, linked.values);
        assert_eq!(restored.value_base, linked.value_base);
        assert_eq!(restored.input_count, linked.input_count);

        // The restored form still executes.
        let mut machine = restored.new_machine();
        machine.write_input(0, 2).unwrap();
        machine.write_input(1, 3).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(5));
    }

    #[test]
    fn test_bad_magic() {
        let mut cursor = Cursor::new(vec![0u8; 32]);
        assert!(matches!(read_file(&mut cursor), Err(BinError::Format(_))));
    }

    #[test]
    fn test_values_padding() {
        let mut program = Program::new("odd");
        program.values = vec![1, 2, 3];
        let mut cursor = Cursor::new(Vec::new());
        write_programs(&mut cursor, &[program.clone()]).unwrap();
        cursor.set_position(0);
        let back = read_programs(&mut cursor).unwrap();
        assert_eq!(back[0].values, vec![1, 2, 3]);
    }
}
