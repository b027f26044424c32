//! Turns validated statement batches into OpenCL program plans.
//!
//! Generation is a pure function of the batch structure and the active
//! profiles. The batch is partitioned into chunks of consecutive statements
//! sharing a family and element type; each chunk contributes one template
//! instantiation (one kernel, or two for split reductions) to a single
//! program. The program's signature doubles as the cache key, so everything
//! that influences the emitted source must flow into it and nothing else
//! may.

mod axpy;
mod gemm;
mod reduction;
mod utils;

use std::collections::HashMap;
use std::ops::Range;

use serde::Serialize;
use smallvec::SmallVec;

use crate::classify::{classify, Family};
use crate::error::{GeneratorError, GeneratorResult};
use crate::mapping::{ArgSlot, Binding, BoundOperand, OperandMap, Side};
use crate::profiles::ProfileSet;
use crate::statement::{Numeric, Op, Operand, Statement};

use utils::{device_type, push_block, sanitize_identifier};

/// How the launch grid is derived when a kernel is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GridRecipe {
    /// Grid fixed by the profile. One-dimensional kernels use `[n, 1]`.
    Fixed {
        global: [usize; 2],
        local: [usize; 2],
    },
    /// Tiled product grid: one work item per `ms x ns` register block,
    /// sized against the output matrix at enqueue.
    ProductTiles {
        ms: usize,
        ns: usize,
        local: [usize; 2],
    },
}

/// One kernel of a generated program.
#[derive(Debug, Clone, Serialize)]
pub struct KernelPlan {
    pub entry: String,
    pub family: Family,
    /// Statements of the batch this kernel executes.
    pub statements: Range<usize>,
    /// Argument layout, resolved against a fresh batch at enqueue.
    pub slots: SmallVec<[ArgSlot; 8]>,
    pub grid: GridRecipe,
    /// Reduction partial buffer, in elements, shared by a kernel pair.
    pub scratch_elems: Option<usize>,
    /// SIMD width baked into the source. Vector length arguments are
    /// resolved in SIMD units, and wide kernels only accept contiguous
    /// operands.
    pub simd_width: usize,
}

/// A complete generated program: source plus the per-kernel launch plans.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedProgram {
    pub name: String,
    pub signature: String,
    pub source: String,
    pub kernels: Vec<KernelPlan>,
}

/// Maximal run of consecutive statements with one family and element type.
/// Products never fuse; each one forms its own chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub(crate) family: Family,
    pub(crate) numeric: Numeric,
    pub(crate) range: Range<usize>,
}

pub(crate) fn partition(statements: &[Statement]) -> GeneratorResult<Vec<Chunk>> {
    let mut chunks: Vec<Chunk> = Vec::new();
    for (index, statement) in statements.iter().enumerate() {
        let family = classify(statement)?;
        let numeric = statement.numeric();
        let fused = match chunks.last_mut() {
            Some(last)
                if last.family == family
                    && last.numeric == numeric
                    && family != Family::MatrixProduct
                    && last.range.end == index =>
            {
                last.range.end = index + 1;
                true
            }
            _ => false,
        };
        if !fused {
            chunks.push(Chunk {
                family,
                numeric,
                range: index..index + 1,
            });
        }
    }
    Ok(chunks)
}

/// Generates programs and signatures for statement batches.
#[derive(Debug, Clone)]
pub struct Generator {
    profiles: ProfileSet,
}

impl Default for Generator {
    fn default() -> Self {
        Generator::new()
    }
}

impl Generator {
    pub fn new() -> Self {
        Generator {
            profiles: *ProfileSet::builtin(),
        }
    }

    pub fn with_profiles(profiles: ProfileSet) -> Self {
        Generator { profiles }
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    /// Structural signature of a batch. Batches with equal signatures share
    /// one compiled program.
    pub fn signature(&self, statements: &[Statement]) -> GeneratorResult<String> {
        let map = OperandMap::build(statements);
        let chunks = partition(statements)?;
        Ok(self.signature_for(&chunks, &map))
    }

    fn signature_for(&self, chunks: &[Chunk], map: &OperandMap) -> String {
        let mut signature = String::new();
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                signature.push('|');
            }
            signature.push_str(chunk.family.code());
            signature.push_str(&self.profile_repr(chunk.family));
            signature.push(':');
            signature.push_str(&map.range_fingerprint(chunk.range.clone()));
        }
        signature
    }

    fn profile_repr(&self, family: Family) -> String {
        match family {
            // The scalar fallback has no tunables.
            Family::ScalarAxpy => String::new(),
            Family::VectorAxpy => self.profiles.vector_axpy.repr(),
            Family::MatrixAxpy => self.profiles.matrix_axpy.repr(),
            Family::ScalarReduction => self.profiles.scalar_reduction.repr(),
            Family::VectorReduction => self.profiles.vector_reduction.repr(),
            Family::MatrixProduct => self.profiles.matrix_product.repr(),
        }
    }

    /// Generates one program covering the whole batch.
    pub fn generate(&self, statements: &[Statement]) -> GeneratorResult<GeneratedProgram> {
        if statements.is_empty() {
            return Err(GeneratorError::unsupported("empty statement batch"));
        }
        let map = OperandMap::build(statements);
        let chunks = partition(statements)?;
        let signature = self.signature_for(&chunks, &map);

        let mut source = String::new();
        push_block(
            &mut source,
            0,
            r#"
                #if defined(cl_khr_fp64)
                #pragma OPENCL EXTENSION cl_khr_fp64 : enable
                #elif defined(cl_amd_fp64)
                #pragma OPENCL EXTENSION cl_amd_fp64 : enable
                #endif
            "#,
        );

        let mut kernels: Vec<KernelPlan> = Vec::new();
        for chunk in &chunks {
            let entry_base = kernels.len();
            let plans = match chunk.family {
                Family::ScalarAxpy => {
                    axpy::generate_scalar(&mut source, entry_base, statements, chunk, &map)?
                }
                Family::VectorAxpy => axpy::generate_vector(
                    &mut source,
                    entry_base,
                    statements,
                    chunk,
                    &map,
                    &self.profiles.vector_axpy,
                )?,
                Family::MatrixAxpy => axpy::generate_matrix(
                    &mut source,
                    entry_base,
                    statements,
                    chunk,
                    &map,
                    &self.profiles.matrix_axpy,
                )?,
                Family::ScalarReduction => reduction::generate_scalar(
                    &mut source,
                    entry_base,
                    statements,
                    chunk,
                    &map,
                    &self.profiles.scalar_reduction,
                )?,
                Family::VectorReduction => reduction::generate_vector(
                    &mut source,
                    entry_base,
                    statements,
                    chunk,
                    &map,
                    &self.profiles.vector_reduction,
                )?,
                Family::MatrixProduct => gemm::generate(
                    &mut source,
                    entry_base,
                    statements,
                    chunk,
                    &map,
                    &self.profiles.matrix_product,
                )?,
            };
            kernels.extend(plans);
        }

        Ok(GeneratedProgram {
            name: sanitize_identifier(&signature),
            signature,
            source,
            kernels,
        })
    }
}

fn entry_name(index: usize) -> String {
    format!("kernel_{index}")
}

/// Emits the expression a statement assigns, recursing through subtree
/// references. `substitutions` short-circuits marker nodes to the name of
/// their accumulated value; `leaf` renders a leaf occurrence at
/// `(node, side)`.
fn emit_assigned_value(
    statement: &Statement,
    substitutions: &HashMap<usize, String>,
    leaf: &mut dyn FnMut(usize, Side) -> GeneratorResult<String>,
) -> GeneratorResult<String> {
    emit_operand(statement, 0, Side::Rhs, &statement.root().rhs, substitutions, leaf)
}

fn emit_node(
    statement: &Statement,
    index: usize,
    substitutions: &HashMap<usize, String>,
    leaf: &mut dyn FnMut(usize, Side) -> GeneratorResult<String>,
) -> GeneratorResult<String> {
    if let Some(replacement) = substitutions.get(&index) {
        return Ok(replacement.clone());
    }
    let node = statement.node(index);
    let symbol = match node.op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mult => "*",
        Op::Div => "/",
        other => {
            return Err(GeneratorError::unsupported(format!(
                "operation `{}` inside an elementwise expression",
                other.token()
            )))
        }
    };
    let lhs = emit_operand(statement, index, Side::Lhs, &node.lhs, substitutions, leaf)?;
    let rhs = emit_operand(statement, index, Side::Rhs, &node.rhs, substitutions, leaf)?;
    Ok(format!("({lhs} {symbol} {rhs})"))
}

fn emit_operand(
    statement: &Statement,
    index: usize,
    side: Side,
    operand: &Operand,
    substitutions: &HashMap<usize, String>,
    leaf: &mut dyn FnMut(usize, Side) -> GeneratorResult<String>,
) -> GeneratorResult<String> {
    match operand {
        Operand::Node(target) => emit_node(statement, *target, substitutions, leaf),
        Operand::Empty => Err(GeneratorError::mismatch(
            "empty operand reached expression emission",
        )),
        _ => leaf(index, side),
    }
}

/// Wide kernels address vectors in SIMD units, so every vector binding of
/// the chunk must be a plain contiguous view.
fn ensure_contiguous_vectors(
    map: &OperandMap,
    bindings: &[usize],
    width: usize,
    repr: &str,
) -> GeneratorResult<()> {
    if width == 1 {
        return Ok(());
    }
    for &index in bindings {
        if let BoundOperand::Vector(view) = &map.binding(index).operand {
            if view.start != 0 || view.stride != 1 {
                return Err(GeneratorError::invalid_profile(
                    repr,
                    "SIMD width beyond 1 requires contiguous vectors",
                ));
            }
        }
    }
    Ok(())
}

/// Binding indices referenced by a statement range, first-seen order.
fn chunk_bindings(
    map: &OperandMap,
    statements: &[Statement],
    range: Range<usize>,
) -> Vec<usize> {
    let mut seen: Vec<usize> = Vec::new();
    for stmt_index in range {
        for (node_index, _) in statements[stmt_index].nodes().iter().enumerate() {
            for side in [Side::Lhs, Side::Rhs] {
                if let Some(binding) = map.binding_index(stmt_index, node_index, side) {
                    if !seen.contains(&binding) {
                        seen.push(binding);
                    }
                }
            }
        }
    }
    seen
}

/// Appends the kernel parameters and argument slots for one binding.
///
/// Vectors contribute a pointer plus start and stride arguments; the
/// pointer adopts the SIMD width, which the width-1 constraints elsewhere
/// keep honest. Matrices contribute a bare pointer, their geometry travels
/// through the size arguments.
fn append_binding_args(
    params: &mut Vec<String>,
    slots: &mut SmallVec<[ArgSlot; 8]>,
    index: usize,
    binding: &Binding,
    numeric: Numeric,
    width: usize,
) {
    let name = &binding.name;
    match &binding.operand {
        BoundOperand::Vector(view) => {
            let pointee = device_type(view.numeric, width);
            params.push(format!("__global {pointee}* {name}"));
            params.push(format!("unsigned int {name}_start"));
            params.push(format!("unsigned int {name}_inc"));
            slots.push(ArgSlot::BufferPtr { binding: index });
            slots.push(ArgSlot::VectorStart { binding: index });
            slots.push(ArgSlot::VectorStride { binding: index });
        }
        BoundOperand::Matrix(view) => {
            let pointee = device_type(view.numeric, 1);
            params.push(format!("__global {pointee}* {name}"));
            slots.push(ArgSlot::BufferPtr { binding: index });
        }
        BoundOperand::DeviceScalar { numeric, .. } => {
            let pointee = device_type(*numeric, 1);
            params.push(format!("__global {pointee}* {name}"));
            slots.push(ArgSlot::BufferPtr { binding: index });
        }
        // Host scalars are typed after the chunk they feed.
        BoundOperand::HostScalar(_) => {
            params.push(format!("{} {name}", device_type(numeric, 1)));
            slots.push(ArgSlot::HostScalar { binding: index });
        }
    }
}
