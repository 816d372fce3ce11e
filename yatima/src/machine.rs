//! The interpreter.
//!
//! A machine holds the register file of a linked program (globals, mapped
//! pins, values pre-copied into the tail) and a LIFO work-stack of pending
//! instruction addresses. Writing an input or the time register enqueues the
//! matching subscription-chain head; `run` drains the stack.
//!
//! Execution is total: arithmetic wraps, division by zero yields zero, shift
//! counts are masked, writes to the fixed registers 0..4 are ignored, and a
//! jump outside the instruction list ends the run. Effects of a single
//! `write_input` are visible before the next call; callers that need a
//! consistent snapshot per tick must drain `run` between writes.

use serde::Serialize;

use crate::error::MachineError;
use crate::isa::{Opcode, GLOBAL_REGS, NEAR_JUMP_BASE, REG_LOCAL, REG_TIME, REG_VALUE};
use crate::linker::{LinkedProgram, RegKind};
use crate::model::TimeMode;

pub struct Machine<'p> {
    program: &'p LinkedProgram,
    regs: Vec<i64>,
    stack: Vec<u32>,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p LinkedProgram) -> Self {
        let mut regs = vec![0i64; GLOBAL_REGS as usize + program.registers.len()];
        for (index, &value) in program.values.iter().enumerate() {
            regs[program.value_base as usize + index] = value;
        }
        Self { program, regs, stack: Vec::new() }
    }

    /// Write external input `pin` and enqueue its subscription chain.
    pub fn write_input(&mut self, pin: u32, value: i64) -> Result<(), MachineError> {
        if pin >= self.program.input_count {
            return Err(MachineError::BadPin { pin, count: self.program.input_count });
        }
        self.regs[(GLOBAL_REGS + pin) as usize] = value;
        // Slots 0 and 1 are the time ticks; inputs start at slot 2.
        let head = self.program.instructions[pin as usize + 2].ri1;
        self.enqueue(head);
        Ok(())
    }

    /// Write the time register and enqueue the window or end tick chain.
    pub fn write_time(&mut self, value: i64, mode: TimeMode) {
        self.regs[REG_TIME as usize] = value;
        match mode {
            TimeMode::Window => self.enqueue(self.program.instructions[0].ri1),
            TimeMode::End => self.enqueue(self.program.instructions[1].ri1),
            TimeMode::None => {}
        }
    }

    fn enqueue(&mut self, address: u32) {
        // Zero means "no subscriber"; anything past the instruction list
        // would violate the work-stack invariant.
        if address != 0 && (address as usize) < self.program.instructions.len() {
            self.stack.push(address);
        }
    }

    /// Drain the work-stack.
    pub fn run(&mut self) {
        while let Some(address) = self.stack.pop() {
            self.run_at(address);
        }
    }

    fn run_at(&mut self, start: u32) {
        let mut at = start as usize;
        while let Some(instr) = self.program.instructions.get(at).copied() {
            match instr.op {
                Opcode::Nop | Opcode::Ret => return,
                Opcode::Call => {
                    self.enqueue(instr.ri1);
                    at += 1;
                }
                Opcode::Mov => {
                    self.set(instr.ro, self.get(instr.ri1));
                    at += 1;
                }
                Opcode::Add => {
                    self.set(instr.ro, self.get(instr.ri0).wrapping_add(self.get(instr.ri1)));
                    at += 1;
                }
                Opcode::Sub => {
                    self.set(instr.ro, self.get(instr.ri0).wrapping_sub(self.get(instr.ri1)));
                    at += 1;
                }
                Opcode::Mul => {
                    self.set(instr.ro, self.get(instr.ri0).wrapping_mul(self.get(instr.ri1)));
                    at += 1;
                }
                Opcode::Div => {
                    let value = self.get(instr.ri0).checked_div(self.get(instr.ri1)).unwrap_or(0);
                    self.set(instr.ro, value);
                    at += 1;
                }
                Opcode::Shl => {
                    let by = self.get(instr.ri1) as u32;
                    self.set(instr.ro, self.get(instr.ri0).wrapping_shl(by));
                    at += 1;
                }
                Opcode::Shr => {
                    let by = self.get(instr.ri1) as u32;
                    self.set(instr.ro, self.get(instr.ri0).wrapping_shr(by));
                    at += 1;
                }
                Opcode::Abs => {
                    self.set(instr.ro, self.get(instr.ri1).wrapping_abs());
                    at += 1;
                }
                Opcode::Inc => {
                    self.set(instr.ro, self.get(instr.ro).wrapping_add(1));
                    at += 1;
                }
                Opcode::Dec => {
                    self.set(instr.ro, self.get(instr.ro).wrapping_sub(1));
                    at += 1;
                }
                Opcode::Jmp => match self.jump_target(at, instr.ro) {
                    Some(target) => at = target,
                    None => return,
                },
                Opcode::Jeq => {
                    if self.get(instr.ri0) == self.get(instr.ri1) {
                        match self.jump_target(at, instr.ro) {
                            Some(target) => at = target,
                            None => return,
                        }
                    } else {
                        at += 1;
                    }
                }
                Opcode::Jne => {
                    if self.get(instr.ri0) != self.get(instr.ri1) {
                        match self.jump_target(at, instr.ro) {
                            Some(target) => at = target,
                            None => return,
                        }
                    } else {
                        at += 1;
                    }
                }
            }
        }
    }

    /// RO of a jump encodes the target: below the value base it is a near
    /// forward offset, otherwise a value register holding a displacement
    /// relative to the jump itself.
    fn jump_target(&self, at: usize, ro: u32) -> Option<usize> {
        let displacement = if ro < REG_VALUE {
            ro as i64 - NEAR_JUMP_BASE as i64
        } else {
            self.get(ro)
        };
        let target = at as i64 + displacement;
        if target < 0 || target as usize >= self.program.instructions.len() {
            return None;
        }
        Some(target as usize)
    }

    fn get(&self, register: u32) -> i64 {
        self.regs.get(register as usize).copied().unwrap_or(0)
    }

    fn set(&mut self, register: u32, value: i64) {
        // Null, zero, time and the ip sentinel are not writable from code.
        if register >= REG_LOCAL && (register as usize) < self.regs.len() {
            self.regs[register as usize] = value;
        }
    }

    /// Read any register of the file.
    pub fn read_register(&self, register: u32) -> i64 {
        self.get(register)
    }

    /// Read the register a pin landed on.
    pub fn read_pin(&self, pin: crate::model::PinIndex) -> Option<i64> {
        self.program.register_for_pin(pin).map(|r| self.get(r))
    }

    /// Pending addresses, most recent first.
    pub fn pending(&self) -> &[u32] {
        &self.stack
    }

    /// A labeled snapshot of the register file.
    pub fn dump_registers(&self) -> RegisterDump {
        let mut registers = Vec::with_capacity(self.regs.len());
        for (index, &value) in self.regs.iter().enumerate() {
            let name = match index as u32 {
                0 => "null".into(),
                1 => "zero".into(),
                2 => "time".into(),
                3 => "ip".into(),
                r if r < GLOBAL_REGS => format!("l{}", r - REG_LOCAL),
                r => {
                    let mapped = &self.program.registers[(r - GLOBAL_REGS) as usize];
                    match mapped.kind {
                        RegKind::Input => format!("in:{}", mapped.pin),
                        RegKind::Static if mapped.pin.pin < 4 => {
                            format!("actor{}:out{}", mapped.pin.group, mapped.pin.pin)
                        }
                        RegKind::Static => {
                            format!("actor{}:s{}", mapped.pin.group, mapped.pin.pin - 4)
                        }
                        RegKind::Value => format!("val{}", r - self.program.value_base),
                        RegKind::Pad => "pad".into(),
                    }
                }
            };
            registers.push(DumpEntry { index: index as u32, name, value });
        }
        RegisterDump { registers }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterDump {
    pub registers: Vec<DumpEntry>,
}

#[derive(Debug, Serialize)]
pub struct DumpEntry {
    pub index: u32,
    pub name: String,
    pub value: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::compile_str;
    use crate::model::{Library, Model, PinIndex};

    fn linked(source: &str, wire: impl FnOnce(&mut Model)) -> LinkedProgram {
        let library = Library::from_programs(compile_str(source).unwrap());
        let mut model = Model::new(library);
        wire(&mut model);
        model.link().unwrap()
    }

    #[test]
    fn test_summator() {
        let linked = linked(
            ".ACTOR plus\n.ENTRY %a %b\n%c = %a + %b\n.AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "pair", 2).unwrap();
                model
                    .add_actor(
                        "plus",
                        TimeMode::None,
                        &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
                    )
                    .unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_input(0, 10).unwrap();
        machine.write_input(1, 21).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(31));
        assert!(machine.pending().is_empty());
    }

    #[test]
    fn test_bad_pin() {
        let linked = linked(
            ".ACTOR id\n.ENTRY %a\n%c = %a\n.AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "g", 1).unwrap();
                model
                    .add_actor("id", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
                    .unwrap();
            },
        );
        let mut machine = linked.new_machine();
        assert!(matches!(
            machine.write_input(3, 1),
            Err(MachineError::BadPin { pin: 3, count: 1 })
        ));
    }

    #[test]
    fn test_countdown_loop() {
        // Backward far jump, inc/dec, conditional.
        let linked = linked(
            ".ACTOR count\n\
             .ENTRY %a\n\
             n = %a\n\
             %s0 = 0\n\
             :loop\n\
             %s0 ++\n\
             n --\n\
             :loop if n != 0\n\
             %c = %s0\n\
             .AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "g", 1).unwrap();
                model
                    .add_actor("count", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
                    .unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_input(0, 5).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(5));
    }

    #[test]
    fn test_forward_near_jump() {
        // Default the output to 42 when the input is zero.
        let linked = linked(
            ".ACTOR defaulted\n\
             .ENTRY %a\n\
             %c = %a\n\
             :done if %a != 0\n\
             %c = 42\n\
             :done\n\
             %s0 ++\n\
             .AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "g", 1).unwrap();
                model
                    .add_actor("defaulted", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
                    .unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_input(0, 0).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(42));

        machine.write_input(0, 7).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(7));
    }

    #[test]
    fn test_time_tick_chain() {
        let linked = linked(
            ".ACTOR tick\n\
             %s0 ++\n\
             %c = %s0\n\
             .AEND\n",
            |model| {
                model.add_actor("tick", TimeMode::Window, &[]).unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_time(100, TimeMode::Window);
        machine.run();
        machine.write_time(200, TimeMode::Window);
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(2));

        // The end tick has no subscriber.
        machine.write_time(300, TimeMode::End);
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(2));
        assert_eq!(machine.read_register(REG_TIME), 300);
    }

    #[test]
    fn test_actor_chain_fanout() {
        // source doubles its input; sink adds 1 to the source's output.
        let linked = linked(
            ".ACTOR double\n.ENTRY %a\n%c = %a * 2\n.AEND\n\
             .ACTOR incr\n.ENTRY %a\n%c = %a + 1\n.AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "g", 1).unwrap();
                let source = model
                    .add_actor("double", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
                    .unwrap();
                let output = model.actor_output(source, 0);
                model.add_actor("incr", TimeMode::None, &[output]).unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_input(0, 20).unwrap();
        machine.run();
        assert_eq!(machine.read_pin(PinIndex::new(0, 0, 0)), Some(40));
        assert_eq!(machine.read_pin(PinIndex::new(0, 1, 0)), Some(41));
    }

    #[test]
    fn test_dump_registers() {
        let linked = linked(
            ".ACTOR plus\n.ENTRY %a %b\n%c = %a + %b\n.AEND\n",
            |model| {
                let cluster = model.add_cluster("in");
                model.add_group(cluster, "pair", 2).unwrap();
                model
                    .add_actor(
                        "plus",
                        TimeMode::None,
                        &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
                    )
                    .unwrap();
            },
        );

        let mut machine = linked.new_machine();
        machine.write_input(0, 3).unwrap();
        machine.write_input(1, 4).unwrap();
        machine.run();

        let dump = machine.dump_registers();
        assert_eq!(dump.registers[0].name, "null");
        let out = dump
            .registers
            .iter()
            .find(|r| r.name == "actor0:out0")
            .unwrap();
        assert_eq!(out.value, 7);

        let json = serde_json::to_string(&dump).unwrap();
        assert!(json.contains("actor0:out0"));
    }
}
