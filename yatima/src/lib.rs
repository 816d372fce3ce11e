//! yatima: a small actor-based virtual machine.
//!
//! Programs are written in a line-oriented assembly, compiled into register
//! programs, wired together as actor instances through typed pins, and
//! linked into one flat register-file program whose call vector dispatches
//! input updates along subscription chains. A machine interprets the linked
//! program with a work-stack of pending addresses. A self-describing binary
//! container stores programs, models and linked programs.

pub mod asm;
pub mod binfmt;
pub mod error;
pub mod isa;
pub mod linker;
pub mod machine;
pub mod model;

// Re-exports for convenience
pub use asm::{compile, compile_str};
pub use binfmt::{read_file, read_programs, write_file, write_programs, BinaryFile, ModelSpec};
pub use error::{BinError, CompileError, CompileErrorKind, LinkError, MachineError};
pub use isa::{EntryPoint, Instruction, Opcode, Program};
pub use linker::{LinkedProgram, LinkedRegister, RegKind};
pub use machine::{Machine, RegisterDump};
pub use model::{ActorInstance, Library, Model, PinCluster, PinGroup, PinIndex, TimeMode};
