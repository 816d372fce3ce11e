//! The linker: merges a model into one flat register-file program.
//!
//! Steps:
//! 1. Validate the dependency closure (cycles are rejected) and allocate the
//!    global register file: globals 0..12, external input pins sorted by
//!    (cluster, group, pin), per-actor outputs and statics, zero-pin padding
//!    up to the value base, then per-program value blocks shared across
//!    instances.
//! 2. Emit the call vector: CALL window tick, CALL end tick, one CALL per
//!    external input register, RET. Each slot heads a subscription chain.
//! 3. Append every actor's instructions in dependency order, remapping local
//!    register indices to the global allocation (near-jump words are kept
//!    verbatim).
//! 4. Thread the CALL stubs: output stubs become chain heads for fan-out,
//!    entry stubs continue the chain that triggered the section by writing
//!    the subscriber's address into the prior tail's RI1.
//! 5. Deduplicate subscriptions by transitive (cluster, group) sets,
//!    preferring the candidate with the larger set; `.TRANS` hints narrow
//!    what flows through a producer output.
//! 6. Compress dead calls: zero-target CALLs become NOPs, live CALLs pack to
//!    the front of the block, a single CALL to the next instruction
//!    collapses the whole block; a final sweep drops NOPs and rewrites every
//!    held address through the compaction map.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::error::LinkError;
use crate::isa::{
    EntryPoint, Instruction, Opcode, Program, GLOBAL_REGS, REG_INPUT, REG_OUTPUT, REG_STATIC,
    REG_TIME, REG_VALUE, STATIC_COUNT,
};
use crate::machine::Machine;
use crate::model::{Model, PinIndex, TimeMode};

/// Hard limit on the global register file.
pub const REGISTER_LIMIT: usize = u16::MAX as usize;

/// Statics occupy internal pin slots after the four outputs.
const STATIC_PIN_BASE: u32 = 4;

/// What a mapped register carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegKind {
    Input,
    Static,
    Value,
    Pad,
}

/// One slot of the pin-to-register map; global register index is
/// `GLOBAL_REGS + position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkedRegister {
    pub pin: PinIndex,
    pub kind: RegKind,
}

/// The linked, executable form of a model.
#[derive(Debug, Clone)]
pub struct LinkedProgram {
    pub instructions: Vec<Instruction>,
    /// First inputs, then outputs/statics, padding, then values.
    pub registers: Vec<LinkedRegister>,
    /// One entry per call-vector slot: the chain head address (0 = none).
    pub entry_points: Vec<EntryPoint>,
    pub values: Vec<i64>,
    /// Global register index of the first value register.
    pub value_base: u32,
    /// External input pins, in register order.
    pub input_count: u32,
    /// First instruction of each actor after compaction.
    pub actor_addresses: Vec<u32>,
}

impl LinkedProgram {
    pub fn new_machine(&self) -> Machine<'_> {
        Machine::new(self)
    }

    /// The global register a pin landed on.
    pub fn register_for_pin(&self, pin: PinIndex) -> Option<u32> {
        self.registers
            .iter()
            .position(|r| r.kind != RegKind::Pad && r.pin == pin)
            .map(|i| GLOBAL_REGS + i as u32)
    }
}

impl Model {
    /// Link this model; every pin must already be bound.
    pub fn link(&self) -> Result<LinkedProgram, LinkError> {
        Linker::new(self)?.run()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChainKey {
    Window,
    End,
    Reg(u32),
}

struct Candidate {
    key: ChainKey,
    entry: u32,
    stub: usize,
    groups: BTreeSet<(u32, u32)>,
}

struct ActorAlloc {
    outputs: BTreeMap<u32, u32>,
    statics: BTreeMap<u32, u32>,
}

struct Linker<'m> {
    model: &'m Model,
    order: Vec<usize>,
    input_reg: BTreeMap<PinIndex, u32>,
    registers: Vec<LinkedRegister>,
    allocs: Vec<ActorAlloc>,
    value_base: u32,
    program_value_base: HashMap<usize, u32>,
    values: Vec<i64>,
}

impl<'m> Linker<'m> {
    fn new(model: &'m Model) -> Result<Self, LinkError> {
        let order = toposort(model)?;
        let mut linker = Linker {
            model,
            order,
            input_reg: BTreeMap::new(),
            registers: Vec::new(),
            allocs: Vec::new(),
            value_base: 0,
            program_value_base: HashMap::new(),
            values: Vec::new(),
        };
        linker.allocate()?;
        Ok(linker)
    }

    fn program_of(&self, actor: usize) -> &Program {
        let index = self.model.actors()[actor].program;
        self.model
            .library()
            .program(index)
            .expect("actor references a validated program")
    }

    /// Step 1: the global register file.
    fn allocate(&mut self) -> Result<(), LinkError> {
        // External inputs, sorted by (cluster, group, pin).
        let external: BTreeSet<PinIndex> = self
            .model
            .actors()
            .iter()
            .flat_map(|a| a.inputs.iter())
            .filter(|p| !p.is_internal())
            .copied()
            .collect();
        for pin in external {
            let register = GLOBAL_REGS + self.registers.len() as u32;
            self.input_reg.insert(pin, register);
            self.registers.push(LinkedRegister { pin, kind: RegKind::Input });
        }

        // Outputs and statics, per actor.
        for (index, _) in self.model.actors().iter().enumerate() {
            let program = self.program_of(index);
            let output_regs = touched(program, REG_OUTPUT, REG_STATIC);
            let static_regs = touched(program, REG_STATIC, REG_STATIC + STATIC_COUNT);
            let mut alloc = ActorAlloc { outputs: BTreeMap::new(), statics: BTreeMap::new() };
            for register in output_regs {
                let global = GLOBAL_REGS + self.registers.len() as u32;
                alloc.outputs.insert(register, global);
                self.registers.push(LinkedRegister {
                    pin: PinIndex::new(0, index as u32, register - REG_OUTPUT),
                    kind: RegKind::Static,
                });
            }
            for register in static_regs {
                let global = GLOBAL_REGS + self.registers.len() as u32;
                alloc.statics.insert(register, global);
                self.registers.push(LinkedRegister {
                    pin: PinIndex::new(
                        0,
                        index as u32,
                        STATIC_PIN_BASE + (register - REG_STATIC),
                    ),
                    kind: RegKind::Static,
                });
            }
            self.allocs.push(alloc);
        }

        // Pad with zero pins so near-jump words below REG_VALUE stay
        // unambiguous in the linked program.
        while GLOBAL_REGS + (self.registers.len() as u32) < REG_VALUE {
            self.registers.push(LinkedRegister { pin: PinIndex::ZERO, kind: RegKind::Pad });
        }
        self.value_base = GLOBAL_REGS + self.registers.len() as u32;

        // Per-program value blocks, shared across instances of a program.
        let mut used_programs: Vec<usize> =
            self.model.actors().iter().map(|a| a.program).collect();
        used_programs.sort_unstable();
        used_programs.dedup();
        for program_index in used_programs {
            let program = self.model.library().program(program_index).unwrap();
            let base = self.value_base + self.values.len() as u32;
            self.program_value_base.insert(program_index, base);
            for &value in &program.values {
                self.values.push(value);
                self.registers.push(LinkedRegister { pin: PinIndex::ZERO, kind: RegKind::Value });
            }
        }

        let total = GLOBAL_REGS as usize + self.registers.len();
        if total > REGISTER_LIMIT {
            return Err(LinkError::TooManyVariables { needed: total, limit: REGISTER_LIMIT });
        }
        debug!(
            inputs = self.input_reg.len(),
            registers = self.registers.len(),
            value_base = self.value_base,
            "allocated register file"
        );
        Ok(())
    }

    fn remap(&self, actor: usize, register: u32) -> Result<u32, LinkError> {
        if register < REG_INPUT {
            return Ok(register);
        }
        let instance = &self.model.actors()[actor];
        if register < REG_OUTPUT {
            let slot = (register - REG_INPUT) as usize;
            let pin = *instance
                .inputs
                .get(slot)
                .ok_or(LinkError::UnboundPin { actor, input: slot as u32 })?;
            return self.input_register(actor, pin);
        }
        if register < REG_STATIC {
            return Ok(self.allocs[actor].outputs[&register]);
        }
        if register < REG_VALUE {
            return Ok(self.allocs[actor].statics[&register]);
        }
        let base = self.program_value_base[&instance.program];
        Ok(base + (register - REG_VALUE))
    }

    /// The global register behind a bound input pin.
    fn input_register(&self, actor: usize, pin: PinIndex) -> Result<u32, LinkError> {
        if !pin.is_internal() {
            return Ok(self.input_reg[&pin]);
        }
        let producer = pin.group as usize;
        let register = REG_OUTPUT + pin.pin;
        let written = self.program_of(producer).written_outputs();
        if !written.contains(&register) {
            return Err(LinkError::NotWritable { actor, producer, pin: pin.pin });
        }
        Ok(self.allocs[producer].outputs[&register])
    }

    fn run(self) -> Result<LinkedProgram, LinkError> {
        let actors = self.model.actors();

        // Step 2: the call vector.
        let mut instructions = vec![
            Instruction::new(Opcode::Call, 0, 0, REG_TIME),
            Instruction::new(Opcode::Call, 0, 0, REG_TIME),
        ];
        let mut tails: HashMap<ChainKey, Vec<usize>> = HashMap::new();
        tails.insert(ChainKey::Window, vec![0]);
        tails.insert(ChainKey::End, vec![1]);
        let input_regs: Vec<(PinIndex, u32)> =
            self.input_reg.iter().map(|(p, r)| (*p, *r)).collect();
        for (_, register) in &input_regs {
            tails.insert(ChainKey::Reg(*register), vec![instructions.len()]);
            instructions.push(Instruction::new(Opcode::Call, 0, 0, *register));
        }
        instructions.push(Instruction::ret());

        // Transitive (cluster, group) sets per actor output, in dependency
        // order, for subscription deduplication.
        let mut out_groups: Vec<BTreeMap<u32, BTreeSet<(u32, u32)>>> =
            (0..actors.len()).map(|_| BTreeMap::new()).collect();

        let mut actor_addresses = vec![0u32; actors.len()];
        let mut stub_blocks: Vec<(usize, usize)> = Vec::new();

        for &actor in &self.order.clone() {
            let program = self.program_of(actor).clone();
            let instance = &actors[actor];
            let base = instructions.len();
            actor_addresses[actor] = base as u32;

            // Step 3: emission with operand remapping.
            for instr in &program.instructions {
                let mut out = *instr;
                out.ri0 = self.remap(actor, instr.ri0)?;
                if instr.op == Opcode::Call {
                    out.ri1 = instr.ri1; // chain placeholder, threaded below
                } else {
                    out.ri1 = self.remap(actor, instr.ri1)?;
                }
                // Near-jump words stay verbatim; everything else remaps.
                if !instr.op.is_jump() || instr.ro >= REG_VALUE {
                    out.ro = self.remap(actor, instr.ro)?;
                }
                instructions.push(out);
            }

            // Locate this actor's stub blocks (a run of CALLs before each
            // RET; RET only comes from return synthesis).
            let mut blocks = Vec::new();
            let mut at = 0usize;
            while at < program.instructions.len() {
                if program.instructions[at].op == Opcode::Ret {
                    let mut start = at;
                    while start > 0 && program.instructions[start - 1].op == Opcode::Call {
                        start -= 1;
                    }
                    blocks.push((base + start, base + at));
                }
                at += 1;
            }
            stub_blocks.extend(&blocks);

            // Transitive group sets for this actor's outputs.
            for &output in &program.written_outputs() {
                let slots: Vec<usize> = match program.trans_inputs(output) {
                    Some(inputs) => inputs
                        .iter()
                        .map(|r| (r - REG_INPUT) as usize)
                        .filter(|s| *s < instance.inputs.len())
                        .collect(),
                    None => (0..instance.inputs.len()).collect(),
                };
                let mut set = BTreeSet::new();
                for slot in slots {
                    set.extend(groups_of_slot(&out_groups, instance, slot));
                }
                out_groups[actor].insert(output - REG_OUTPUT, set);
            }

            // Step 4+5: subscriptions, deduplicated by group set.
            let mut candidates = Vec::new();
            for entry in &program.entry_points {
                let key = if entry.register == REG_TIME {
                    match instance.time_mode {
                        TimeMode::Window => ChainKey::Window,
                        TimeMode::End => ChainKey::End,
                        TimeMode::None => continue,
                    }
                } else {
                    let slot = (entry.register - REG_INPUT) as usize;
                    let pin = instance.inputs[slot];
                    ChainKey::Reg(self.input_register(actor, pin)?)
                };
                let groups = if entry.register == REG_TIME {
                    BTreeSet::new()
                } else {
                    groups_of_slot(
                        &out_groups,
                        instance,
                        (entry.register - REG_INPUT) as usize,
                    )
                };
                let stub = find_stub(&program, entry, &blocks, base).ok_or_else(|| {
                    LinkError::InvalidPin(format!(
                        "program {:?} has no chain stub for entry register {}",
                        program.name, entry.register
                    ))
                })?;
                candidates.push(Candidate {
                    key,
                    entry: base as u32 + entry.address,
                    stub,
                    groups,
                });
            }
            candidates.sort_by(|a, b| b.groups.len().cmp(&a.groups.len()));

            let mut covered: BTreeSet<(u32, u32)> = BTreeSet::new();
            for candidate in candidates {
                if !candidate.groups.is_empty() && candidate.groups.is_subset(&covered) {
                    debug!(actor, key = ?candidate.key, "subscription deduplicated");
                    continue;
                }
                covered.extend(candidate.groups.iter().copied());
                let prior = tails.insert(candidate.key, vec![candidate.stub]);
                for tail in prior.unwrap_or_default() {
                    instructions[tail].ri1 = candidate.entry;
                }
            }

            // This actor's output stubs head the fan-out chains.
            for (start, ret) in &blocks {
                for index in *start..*ret {
                    let ro = instructions[index].ro;
                    if self.allocs[actor].outputs.values().any(|&g| g == ro) {
                        tails.entry(ChainKey::Reg(ro)).or_default().push(index);
                    }
                }
            }
        }

        // Step 6: dead-call compression.
        compress_blocks(&mut instructions, &stub_blocks);
        let map = compaction_map(&instructions);
        let mut compact: Vec<Instruction> = instructions
            .iter()
            .filter(|i| i.op != Opcode::Nop)
            .copied()
            .collect();
        for instr in &mut compact {
            if instr.op == Opcode::Call && instr.ri1 != 0 {
                instr.ri1 = map[instr.ri1 as usize];
            }
        }
        for address in &mut actor_addresses {
            *address = map[*address as usize];
        }

        let entry_points: Vec<EntryPoint> = (0..2 + input_regs.len())
            .map(|slot| EntryPoint {
                register: if slot < 2 { REG_TIME } else { input_regs[slot - 2].1 },
                address: compact[slot].ri1,
            })
            .collect();

        debug!(
            instructions = compact.len(),
            values = self.values.len(),
            "linked model"
        );
        Ok(LinkedProgram {
            instructions: compact,
            registers: self.registers,
            entry_points,
            values: self.values,
            value_base: self.value_base,
            input_count: input_regs.len() as u32,
            actor_addresses,
        })
    }
}

/// The (cluster, group) pairs feeding input `slot` of `instance`.
fn groups_of_slot(
    out_groups: &[BTreeMap<u32, BTreeSet<(u32, u32)>>],
    instance: &crate::model::ActorInstance,
    slot: usize,
) -> BTreeSet<(u32, u32)> {
    let pin = instance.inputs[slot];
    if pin.is_internal() {
        out_groups[pin.group as usize]
            .get(&pin.pin)
            .cloned()
            .unwrap_or_default()
    } else {
        BTreeSet::from([(pin.cluster, pin.group)])
    }
}

/// Registers in `[from, to)` appearing anywhere in the program.
fn touched(program: &Program, from: u32, to: u32) -> Vec<u32> {
    let mut regs: Vec<u32> = program
        .instructions
        .iter()
        .flat_map(|i| {
            let mut r = vec![i.ri0, i.ri1];
            if !i.op.is_jump() {
                r.push(i.ro);
            }
            r
        })
        .filter(|r| (from..to).contains(r))
        .collect();
    regs.sort_unstable();
    regs.dedup();
    regs
}

/// The stub carrying `entry.register` inside the section starting at
/// `entry.address`; returns its global instruction index.
fn find_stub(
    program: &Program,
    entry: &EntryPoint,
    blocks: &[(usize, usize)],
    base: usize,
) -> Option<usize> {
    // The section's block is the first one at or after the entry address.
    let section_start = base + entry.address as usize;
    let (start, ret) = blocks.iter().find(|(_, ret)| *ret >= section_start)?;
    (*start..*ret).find(|&index| {
        let local = index - base;
        program.instructions[local].op == Opcode::Call
            && program.instructions[local].ro == entry.register
    })
}

/// Sweep each stub block in place: dead CALLs become NOPs, live CALLs pack
/// to the front, RET slides in; a single live CALL to the next instruction
/// collapses the block entirely.
fn compress_blocks(instructions: &mut [Instruction], blocks: &[(usize, usize)]) {
    for &(start, ret) in blocks {
        let live: Vec<Instruction> = instructions[start..ret]
            .iter()
            .filter(|i| i.op == Opcode::Call && i.ri1 != 0)
            .copied()
            .collect();
        if live.len() == 1
            && live[0].ri1 as usize == ret + 1
            && ret + 1 < instructions.len()
        {
            for slot in &mut instructions[start..=ret] {
                *slot = Instruction::nop();
            }
            continue;
        }
        let mut at = start;
        for instr in live {
            instructions[at] = instr;
            at += 1;
        }
        instructions[at] = Instruction::ret();
        at += 1;
        while at <= ret {
            instructions[at] = Instruction::nop();
            at += 1;
        }
    }
}

/// Old address -> new address once NOPs are dropped; removed slots map to
/// the next surviving instruction.
fn compaction_map(instructions: &[Instruction]) -> Vec<u32> {
    let mut map = vec![0u32; instructions.len() + 1];
    let mut next = 0u32;
    for (index, instr) in instructions.iter().enumerate() {
        map[index] = next;
        if instr.op != Opcode::Nop {
            next += 1;
        }
    }
    map[instructions.len()] = next;
    map
}

/// Kahn's algorithm over internal-pin edges; rejects cycles before linking.
fn toposort(model: &Model) -> Result<Vec<usize>, LinkError> {
    let actors = model.actors();
    let n = actors.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (index, actor) in actors.iter().enumerate() {
        let mut producers: Vec<usize> = actor
            .inputs
            .iter()
            .filter(|p| p.is_internal())
            .map(|p| p.group as usize)
            .collect();
        producers.sort_unstable();
        producers.dedup();
        for producer in producers {
            if producer >= n {
                return Err(LinkError::InvalidPin(format!(
                    "actor {index} reads output of missing actor {producer}"
                )));
            }
            dependents[producer].push(index);
            indegree[index] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(actor) = ready.pop() {
        order.push(actor);
        for &next in &dependents[actor] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }
    if order.len() != n {
        let stuck: Vec<usize> = (0..n).filter(|&i| indegree[i] > 0).collect();
        return Err(LinkError::DependencyCycle(stuck));
    }
    // Prefer declaration order among independent actors.
    order.sort_by_key(|&a| {
        let mut depth = 0usize;
        let mut frontier = vec![a];
        let mut seen = BTreeSet::new();
        while let Some(current) = frontier.pop() {
            for pin in actors[current].inputs.iter().filter(|p| p.is_internal()) {
                if seen.insert(pin.group) {
                    depth += 1;
                    frontier.push(pin.group as usize);
                }
            }
        }
        (depth, a)
    });
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::compile_str;
    use crate::model::Library;

    fn model_with(source: &str) -> (Model, u32) {
        let library = Library::from_programs(compile_str(source).unwrap());
        let mut model = Model::new(library);
        let cluster = model.add_cluster("in");
        model.add_group(cluster, "g0", 2).unwrap();
        model.add_group(cluster, "g1", 2).unwrap();
        (model, cluster)
    }

    const PLUS: &str = ".ACTOR plus\n.ENTRY %a %b\n%c = %a + %b\n.AEND\n";

    #[test]
    fn test_call_vector_layout() {
        let (mut model, cluster) = model_with(PLUS);
        model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
            )
            .unwrap();
        let linked = model.link().unwrap();

        // CALL window, CALL end, CALL per input, RET.
        assert_eq!(linked.input_count, 2);
        assert_eq!(linked.instructions[0].op, Opcode::Call);
        assert_eq!(linked.instructions[1].op, Opcode::Call);
        assert_eq!(linked.instructions[2].op, Opcode::Call);
        assert_eq!(linked.instructions[3].op, Opcode::Call);
        assert_eq!(linked.instructions[4].op, Opcode::Ret);

        // Both pins land in one group: only the first input carries the
        // subscription, the second was deduplicated.
        let body = linked.actor_addresses[0];
        assert_eq!(linked.instructions[2].ri1, body);
        assert_eq!(linked.instructions[3].ri1, 0);

        // Entry points mirror the call vector.
        assert_eq!(linked.entry_points.len(), 4);
        assert_eq!(linked.entry_points[2].address, body);
        assert_eq!(linked.entry_points[3].address, 0);
    }

    #[test]
    fn test_register_allocation_order() {
        let (mut model, cluster) = model_with(PLUS);
        model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 1, 1), PinIndex::new(cluster, 0, 0)],
            )
            .unwrap();
        let linked = model.link().unwrap();

        // External pins sorted by (cluster, group, pin): g0.0 before g1.1.
        assert_eq!(linked.registers[0].pin, PinIndex::new(cluster, 0, 0));
        assert_eq!(linked.registers[1].pin, PinIndex::new(cluster, 1, 1));
        assert_eq!(linked.registers[0].kind, RegKind::Input);

        // Output register follows, then padding up to the value base.
        assert_eq!(linked.registers[2].kind, RegKind::Static);
        assert_eq!(linked.value_base, REG_VALUE);
        assert_eq!(
            GLOBAL_REGS + linked.registers.len() as u32,
            linked.value_base + linked.values.len() as u32
        );
        assert!(linked.registers[3..].iter().all(|r| r.kind == RegKind::Pad));
    }

    #[test]
    fn test_dependency_order_and_collapse() {
        let source = "\
.ACTOR source\n.ENTRY %a\n%c = %a * 2\n.AEND\n\
.ACTOR sink\n.ENTRY %a\n%c = %a + 1\n.AEND\n";
        let (mut model, cluster) = model_with(source);
        // Declare the consumer first; dependency order must still emit the
        // producer first.
        let library_order = {
            let source_pin = PinIndex::new(0, 1, 0);
            let sink = model.add_actor("sink", TimeMode::None, &[source_pin]).unwrap();
            let source = model
                .add_actor("source", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
                .unwrap();
            (sink, source)
        };
        let (sink, source) = library_order;
        let linked = model.link().unwrap();
        assert!(
            linked.actor_addresses[sink] > linked.actor_addresses[source],
            "consumer must follow its producer"
        );

        // The producer's single-subscriber stub block collapsed: its body
        // falls straight through into the consumer.
        let mut machine = linked.new_machine();
        machine.write_input(0, 10).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, source as u32, 0)), Some(20));
        assert_eq!(machine.read_pin(PinIndex::new(0, sink as u32, 0)), Some(21));
        // No NOPs survive compaction.
        assert!(linked.instructions.iter().all(|i| i.op != Opcode::Nop));
    }

    #[test]
    fn test_cycle_rejected() {
        let source = "\
.ACTOR a\n.ENTRY %a\n%c = %a + 1\n.AEND\n\
.ACTOR b\n.ENTRY %a\n%c = %a + 1\n.AEND\n";
        let (mut model, _) = model_with(source);
        model.add_actor("a", TimeMode::None, &[PinIndex::new(0, 1, 0)]).unwrap();
        model.add_actor("b", TimeMode::None, &[PinIndex::new(0, 0, 0)]).unwrap();
        assert!(matches!(model.link(), Err(LinkError::DependencyCycle(_))));
    }

    #[test]
    fn test_not_writable_output() {
        let source = "\
.ACTOR silent\n.ENTRY %a\n%s0 = %a\n.AEND\n\
.ACTOR sink\n.ENTRY %a\n%c = %a\n.AEND\n";
        let (mut model, cluster) = model_with(source);
        model
            .add_actor("silent", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
            .unwrap();
        // silent never writes output 0.
        model.add_actor("sink", TimeMode::None, &[PinIndex::new(0, 0, 0)]).unwrap();
        assert!(matches!(
            model.link(),
            Err(LinkError::NotWritable { actor: 1, producer: 0, pin: 0 })
        ));
    }

    #[test]
    fn test_dedup_prefers_longer_group_path() {
        // mix reads g0 and g1; sink reads mix's output and g0 directly.
        // The direct g0 subscription is reachable through mix, so only the
        // internal path survives.
        let source = "\
.ACTOR mix\n.ENTRY %a %b\n%c = %a + %b\n.AEND\n\
.ACTOR sink\n.ENTRY %a %b\n%c = %a - %b\n.AEND\n";
        let (mut model, cluster) = model_with(source);
        let mix = model
            .add_actor(
                "mix",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 1, 0)],
            )
            .unwrap();
        let sink = model
            .add_actor(
                "sink",
                TimeMode::None,
                &[model.actor_output(mix, 0), PinIndex::new(cluster, 0, 1)],
            )
            .unwrap();
        let linked = model.link().unwrap();

        // Input register of pin (1,0,1): its call-vector slot carries no
        // chain, since the sink reaches group g0 through mix.
        let pin_reg = linked.register_for_pin(PinIndex::new(cluster, 0, 1)).unwrap();
        let slot = linked
            .instructions
            .iter()
            .take_while(|i| i.op == Opcode::Call)
            .position(|i| i.ro == pin_reg)
            .unwrap();
        assert_eq!(linked.instructions[slot].ri1, 0, "direct subscription not deduplicated");

        // One update still reaches the sink exactly once through the chain.
        let mut machine = linked.new_machine();
        machine.write_input(0, 8).unwrap(); // (1,0,0) -> mix
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, sink as u32, 0)), Some(8));
    }

    #[test]
    fn test_values_shared_per_program() {
        let source = ".ACTOR scale\n.ENTRY %a\n%c = %a * 1000\n.AEND\n";
        let (mut model, cluster) = model_with(source);
        model
            .add_actor("scale", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
            .unwrap();
        model
            .add_actor("scale", TimeMode::None, &[PinIndex::new(cluster, 0, 1)])
            .unwrap();
        let linked = model.link().unwrap();

        // Two instances, one shared value block.
        assert_eq!(linked.values, vec![1000]);

        let mut machine = linked.new_machine();
        machine.write_input(0, 3).unwrap();
        machine.write_input(1, 4).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(3000));
        assert_eq!(machine.read_pin(PinIndex::new(0, 1, 0)), Some(4000));
    }

    #[test]
    fn test_statics_are_per_actor() {
        let source = ".ACTOR acc\n.ENTRY %a\n%s0 = %s0 + %a\n%c = %s0\n.AEND\n";
        let (mut model, cluster) = model_with(source);
        model
            .add_actor("acc", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
            .unwrap();
        model
            .add_actor("acc", TimeMode::None, &[PinIndex::new(cluster, 1, 0)])
            .unwrap();
        let linked = model.link().unwrap();

        let mut machine = linked.new_machine();
        machine.write_input(0, 5).unwrap();
        machine.run();
        machine.write_input(0, 5).unwrap();
        machine.run();
        machine.write_input(1, 1).unwrap();
        machine.run();
        // Each instance accumulates in its own static register.
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(10));
        assert_eq!(machine.read_pin(PinIndex::new(0, 1, 0)), Some(1));
    }
}
