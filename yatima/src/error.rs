//! Error types for the Yatima VM

use thiserror::Error;

/// What went wrong on a source line. The first error wins; compilation
/// halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    TokenCount,
    WrongDirective,
    WrongRegister,
    UnknownInstruction,
    UnknownLabel,
    InvalidConstant,
    External,
}

#[derive(Error, Debug)]
#[error("line {line}: {kind:?}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub kind: CompileErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self { line, kind, message: message.into() }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no program named {0:?} in the library")]
    MissingProgram(String),

    #[error("actor {actor} input {input} is not bound to a pin")]
    UnboundPin { actor: usize, input: u32 },

    #[error("actor dependency cycle through {0:?}")]
    DependencyCycle(Vec<usize>),

    #[error("register file needs {needed} registers, limit is {limit}")]
    TooManyVariables { needed: usize, limit: usize },

    #[error("actor {actor} reads output {pin} of actor {producer}, which never writes it")]
    NotWritable { actor: usize, producer: usize, pin: u32 },

    #[error("invalid pin {0}")]
    InvalidPin(String),
}

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("input pin {pin} out of range (program has {count} inputs)")]
    BadPin { pin: u32, count: u32 },
}

/// Binary container format errors.
#[derive(Error, Debug)]
pub enum BinError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),
}

impl From<binrw::Error> for BinError {
    fn from(e: binrw::Error) -> Self {
        BinError::Format(e.to_string())
    }
}
