pub mod cache;
pub mod classify;
pub mod codegen;
pub mod enqueue;
mod env;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod profiles;
pub mod profiling;
pub mod runtime;
pub mod statement;

pub use cache::{CompiledProgram, ProgramCache};
pub use codegen::{GeneratedProgram, Generator};
pub use enqueue::Enqueuer;
pub use error::{GeneratorError, GeneratorResult};
pub use statement::{Numeric, Op, Operand, Statement};
