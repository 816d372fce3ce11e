//! Program library, pins, and the actor model.
//!
//! A `Library` owns compiled programs. A `Model` wires actor instances
//! together through typed pins: pin clusters (ids starting at 1) describe
//! external inputs as named groups of pins; cluster 0 is reserved for
//! internal wiring, where pin `(0, actor, slot)` is output `slot` of
//! `actor`. Statics piggyback on the same namespace at slots 4..8.

use std::io::BufRead;

use serde::Serialize;

use crate::asm;
use crate::error::{CompileError, LinkError};
use crate::isa::{Program, INPUT_COUNT, OUTPUT_COUNT, REG_INPUT};

/// A typed endpoint: `(cluster, group, pin)`. Cluster 0 means "internal
/// actor output"; a non-zero cluster is an external input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PinIndex {
    pub cluster: u32,
    pub group: u32,
    pub pin: u32,
}

impl PinIndex {
    pub const ZERO: PinIndex = PinIndex { cluster: 0, group: 0, pin: 0 };

    pub fn new(cluster: u32, group: u32, pin: u32) -> Self {
        Self { cluster, group, pin }
    }

    /// An internal pin references another actor's output.
    pub fn is_internal(&self) -> bool {
        self.cluster == 0
    }
}

impl std::fmt::Display for PinIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.cluster, self.group, self.pin)
    }
}

/// When an actor reacts to the time tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeMode {
    None,
    Window,
    End,
}

/// A library of compiled actor programs.
#[derive(Debug, Default)]
pub struct Library {
    programs: Vec<Program>,
}

impl Library {
    pub fn new() -> Self {
        Self { programs: Vec::new() }
    }

    pub fn from_programs(programs: Vec<Program>) -> Self {
        Self { programs }
    }

    /// Compile a source stream and add its programs; returns how many were
    /// added.
    pub fn compile<R: BufRead>(&mut self, reader: R) -> Result<usize, CompileError> {
        let programs = asm::compile(reader)?;
        let added = programs.len();
        self.programs.extend(programs);
        Ok(added)
    }

    pub fn add(&mut self, program: Program) -> usize {
        self.programs.push(program);
        self.programs.len() - 1
    }

    pub fn find_program(&self, name: &str) -> Option<(usize, &Program)> {
        self.programs
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name)
    }

    pub fn program(&self, index: usize) -> Option<&Program> {
        self.programs.get(index)
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// A named group of external input pins updating together.
#[derive(Debug, Clone, Serialize)]
pub struct PinGroup {
    pub name: String,
    pub pins: u32,
}

/// A cluster of pin groups, e.g. one upstream data source.
#[derive(Debug, Clone, Serialize)]
pub struct PinCluster {
    pub name: String,
    pub groups: Vec<PinGroup>,
}

/// One actor in a model: a program, its time mode, and the pins bound to
/// its input registers in slot order.
#[derive(Debug, Clone)]
pub struct ActorInstance {
    pub program: usize,
    pub time_mode: TimeMode,
    pub inputs: Vec<PinIndex>,
}

/// A model: a library plus pin clusters and actor instances, ready for the
/// linker.
pub struct Model {
    library: Library,
    clusters: Vec<PinCluster>,
    actors: Vec<ActorInstance>,
}

impl Model {
    pub fn new(library: Library) -> Self {
        Self { library, clusters: Vec::new(), actors: Vec::new() }
    }

    /// Add an external input cluster; cluster ids start at 1.
    pub fn add_cluster(&mut self, name: impl Into<String>) -> u32 {
        self.clusters.push(PinCluster { name: name.into(), groups: Vec::new() });
        self.clusters.len() as u32
    }

    /// Add a pin group to a cluster; returns the group index.
    pub fn add_group(
        &mut self,
        cluster: u32,
        name: impl Into<String>,
        pins: u32,
    ) -> Result<u32, LinkError> {
        let slot = cluster
            .checked_sub(1)
            .and_then(|c| self.clusters.get_mut(c as usize))
            .ok_or_else(|| LinkError::InvalidPin(format!("no cluster {cluster}")))?;
        slot.groups.push(PinGroup { name: name.into(), pins });
        Ok(slot.groups.len() as u32 - 1)
    }

    /// The pin naming output `slot` of `actor`, for wiring actors together.
    pub fn actor_output(&self, actor: usize, slot: u32) -> PinIndex {
        PinIndex::new(0, actor as u32, slot)
    }

    /// Instantiate `program_name` with its input registers bound to `inputs`
    /// in slot order. Every input the program reads must be bound.
    pub fn add_actor(
        &mut self,
        program_name: &str,
        time_mode: TimeMode,
        inputs: &[PinIndex],
    ) -> Result<usize, LinkError> {
        let (program_index, program) = self
            .library
            .find_program(program_name)
            .ok_or_else(|| LinkError::MissingProgram(program_name.into()))?;
        if inputs.len() > INPUT_COUNT as usize {
            return Err(LinkError::InvalidPin(format!(
                "{} inputs bound, registers hold {INPUT_COUNT}",
                inputs.len()
            )));
        }

        let actor = self.actors.len();
        for register in program.used_inputs() {
            let slot = register - REG_INPUT;
            if slot as usize >= inputs.len() {
                return Err(LinkError::UnboundPin { actor, input: slot });
            }
        }
        for pin in inputs {
            self.check_pin(pin)?;
        }

        self.actors.push(ActorInstance {
            program: program_index,
            time_mode,
            inputs: inputs.to_vec(),
        });
        Ok(actor)
    }

    fn check_pin(&self, pin: &PinIndex) -> Result<(), LinkError> {
        if pin.is_internal() {
            // Forward references are allowed here; the linker's dependency
            // pass settles ordering and rejects cycles.
            if pin.pin >= OUTPUT_COUNT {
                return Err(LinkError::InvalidPin(format!(
                    "internal pin {pin} exceeds the {OUTPUT_COUNT} output slots"
                )));
            }
            return Ok(());
        }
        let cluster = self
            .clusters
            .get(pin.cluster as usize - 1)
            .ok_or_else(|| LinkError::InvalidPin(format!("no cluster for pin {pin}")))?;
        let group = cluster
            .groups
            .get(pin.group as usize)
            .ok_or_else(|| LinkError::InvalidPin(format!("no group for pin {pin}")))?;
        if pin.pin >= group.pins {
            return Err(LinkError::InvalidPin(format!(
                "pin {pin} exceeds group width {}",
                group.pins
            )));
        }
        Ok(())
    }

    /// Rebuild a model from stored parts, e.g. the binary container format.
    /// Runs the same pin and binding validation as incremental construction.
    pub fn from_parts(
        library: Library,
        clusters: Vec<PinCluster>,
        actors: Vec<ActorInstance>,
    ) -> Result<Self, LinkError> {
        let mut model = Model { library, clusters, actors: Vec::new() };
        for (index, actor) in actors.into_iter().enumerate() {
            let program = model
                .library
                .program(actor.program)
                .ok_or_else(|| LinkError::MissingProgram(format!("#{}", actor.program)))?;
            for register in program.used_inputs() {
                let slot = register - REG_INPUT;
                if slot as usize >= actor.inputs.len() {
                    return Err(LinkError::UnboundPin { actor: index, input: slot });
                }
            }
            for pin in &actor.inputs {
                model.check_pin(pin)?;
            }
            model.actors.push(actor);
        }
        Ok(model)
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn clusters(&self) -> &[PinCluster] {
        &self.clusters
    }

    pub fn actors(&self) -> &[ActorInstance] {
        &self.actors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::compile_str;

    fn plus_library() -> Library {
        let programs =
            compile_str(".ACTOR plus\n.ENTRY %a %b\n%c = %a + %b\n.AEND\n").unwrap();
        Library::from_programs(programs)
    }

    #[test]
    fn test_find_program() {
        let library = plus_library();
        assert_eq!(library.find_program("plus").unwrap().0, 0);
        assert!(library.find_program("minus").is_none());
    }

    #[test]
    fn test_add_actor_binds_pins() {
        let mut model = Model::new(plus_library());
        let cluster = model.add_cluster("sensors");
        model.add_group(cluster, "pair", 2).unwrap();

        let actor = model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 1)],
            )
            .unwrap();
        assert_eq!(actor, 0);
        assert_eq!(model.actors()[0].inputs.len(), 2);
    }

    #[test]
    fn test_unbound_pin_rejected() {
        let mut model = Model::new(plus_library());
        let cluster = model.add_cluster("sensors");
        model.add_group(cluster, "pair", 2).unwrap();

        // The program reads %a and %b; binding only one pin is an error.
        let err = model
            .add_actor("plus", TimeMode::None, &[PinIndex::new(cluster, 0, 0)])
            .unwrap_err();
        assert!(matches!(err, LinkError::UnboundPin { actor: 0, input: 1 }));
    }

    #[test]
    fn test_missing_program() {
        let mut model = Model::new(plus_library());
        let err = model.add_actor("gone", TimeMode::None, &[]).unwrap_err();
        assert!(matches!(err, LinkError::MissingProgram(_)));
    }

    #[test]
    fn test_invalid_pin() {
        let mut model = Model::new(plus_library());
        let cluster = model.add_cluster("sensors");
        model.add_group(cluster, "pair", 1).unwrap();
        let err = model
            .add_actor(
                "plus",
                TimeMode::None,
                &[PinIndex::new(cluster, 0, 0), PinIndex::new(cluster, 0, 7)],
            )
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidPin(_)));
    }
}
