//! Obtains compiled programs and submits statement batches to a runtime.
//!
//! [`Enqueuer::obtain`] resolves a batch to a compiled program through the
//! shared cache, compiling at most once per signature. [`Enqueuer::submit`]
//! replays a program against a fresh batch: the signature recheck pins the
//! batch to the program's structure, then every recorded argument slot is
//! resolved against the live operand bindings. Sizes, starts, strides, and
//! scalar values are free to differ from the generating batch; structure is
//! not.

use std::ops::Range;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::cache::{CompiledProgram, ProgramCache};
use crate::classify::Family;
use crate::codegen::{GeneratedProgram, Generator, GridRecipe, KernelPlan};
use crate::env;
use crate::error::{GeneratorError, GeneratorResult};
use crate::mapping::{ArgSlot, BoundOperand, OperandMap, SizeDim};
use crate::profiling;
use crate::runtime::{KernelArg, KernelRuntime, Temporary, WorkGrid};
use crate::statement::{MatrixView, Numeric, Op, Operand, Statement, VectorView};

/// Compiles statement batches through a [`KernelRuntime`] and launches them.
pub struct Enqueuer<R: KernelRuntime> {
    runtime: R,
    generator: Generator,
    cache: ProgramCache<R::Program>,
}

impl<R: KernelRuntime> Enqueuer<R> {
    pub fn new(runtime: R) -> Self {
        Enqueuer::with_generator(runtime, Generator::new())
    }

    pub fn with_generator(runtime: R, generator: Generator) -> Self {
        Enqueuer {
            runtime,
            generator,
            cache: ProgramCache::new(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn cache(&self) -> &ProgramCache<R::Program> {
        &self.cache
    }

    /// Obtains the compiled program for a batch and submits the batch to it.
    pub fn execute(&self, statements: &[Statement]) -> GeneratorResult<()> {
        let program = self.obtain(statements)?;
        self.submit(&program, statements)
    }

    /// Resolves a batch to its compiled program, generating and compiling on
    /// the first encounter of the signature.
    pub fn obtain(
        &self,
        statements: &[Statement],
    ) -> GeneratorResult<Arc<CompiledProgram<R::Program>>> {
        let signature = self.generator.signature(statements)?;
        self.cache.get_or_compile(&signature, || {
            let generated = self.generator.generate(statements)?;
            dump_program(&generated);
            let handle = self
                .runtime
                .compile_program(&generated.name, &generated.source)?;
            Ok(CompiledProgram {
                name: generated.name,
                signature: generated.signature,
                handle,
                kernels: generated.kernels,
            })
        })
    }

    /// Launches every kernel of `program` against `statements`.
    ///
    /// The batch must share the program's signature; beyond that, each slot
    /// is resolved against the fresh bindings and each grid against the
    /// fresh shapes. Reduction scratch stays allocated until the whole batch
    /// is queued, since launches may still be in flight when this returns;
    /// the runtime defers the actual reclamation until queued work drains.
    pub fn submit(
        &self,
        program: &CompiledProgram<R::Program>,
        statements: &[Statement],
    ) -> GeneratorResult<()> {
        let signature = self.generator.signature(statements)?;
        if signature != program.signature {
            return Err(GeneratorError::mismatch(
                "statement batch does not match the program it is submitted to",
            ));
        }
        let map = OperandMap::build(statements);

        let mut scratch: Vec<(Range<usize>, usize, Temporary<'_, R>)> = Vec::new();
        for plan in &program.kernels {
            let dims = chunk_dims(plan, statements)?;
            ensure_wide_operands(plan, &map)?;

            // A reduction pair shares the buffer its first kernel filled.
            let scratch_view = match plan.scratch_elems {
                None => None,
                Some(elems) => {
                    let shared = scratch
                        .last()
                        .is_some_and(|(range, size, _)| *range == plan.statements && *size == elems);
                    if !shared {
                        let numeric = statements[plan.statements.start].numeric();
                        let temporary = Temporary::allocate(&self.runtime, numeric, elems)?;
                        scratch.push((plan.statements.clone(), elems, temporary));
                    }
                    scratch.last().map(|(_, _, temporary)| *temporary.view())
                }
            };

            let args = build_args(plan, &map, statements, &dims, scratch_view)?;
            let grid = self.resolve_grid(plan, &dims)?;
            {
                let _scope = profiling::launch_scope("enqueue.kernel");
                self.runtime
                    .launch(&program.handle, &plan.entry, grid, &args)?;
            }
        }

        for (_, _, temporary) in scratch {
            temporary.release()?;
        }
        Ok(())
    }

    /// Work grid for one kernel. The tiled recipe reads `kl` off the active
    /// profile rather than the plan; the signature recheck in [`submit`]
    /// already pinned the active profile to the one the program was
    /// generated with.
    ///
    /// [`submit`]: Enqueuer::submit
    fn resolve_grid(&self, plan: &KernelPlan, dims: &ChunkDims) -> GeneratorResult<WorkGrid> {
        match &plan.grid {
            GridRecipe::Fixed { global, local } => Ok(WorkGrid {
                global: *global,
                local: *local,
            }),
            GridRecipe::ProductTiles { ms, ns, local } => {
                let &ChunkDims::Product { m, n, k } = dims else {
                    return Err(GeneratorError::mismatch(
                        "tiled grid recipe outside a product kernel",
                    ));
                };
                let profile = &self.generator.profiles().matrix_product;
                let checks = [
                    (m, profile.ml, "row count"),
                    (n, profile.nl, "column count"),
                    (k, profile.kl, "inner dimension"),
                ];
                for (value, tile, label) in checks {
                    if value == 0 || value % tile != 0 {
                        return Err(GeneratorError::unsupported(format!(
                            "product {label} {value} is not a nonzero multiple of the tile size {tile}"
                        )));
                    }
                    if value % plan.simd_width != 0 {
                        return Err(GeneratorError::unsupported(format!(
                            "product {label} {value} is not a multiple of the SIMD width {}",
                            plan.simd_width
                        )));
                    }
                }
                Ok(WorkGrid {
                    global: [m / ms, n / ns],
                    local: *local,
                })
            }
        }
    }
}

/// Writes the generated source (and its plan metadata) for offline
/// inspection. Failures are swallowed, dumping never fails a call.
fn dump_program(program: &GeneratedProgram) {
    let Some(dir) = env::dump_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(dir);
    let _ = std::fs::write(dir.join(format!("{}.cl", program.name)), &program.source);
    if let Ok(meta) = serde_json::to_string_pretty(program) {
        let _ = std::fs::write(dir.join(format!("{}.json", program.name)), meta);
    }
}

/// Shapes a kernel's size arguments and grid are resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkDims {
    None,
    Vector { len: usize },
    Matrix { rows: usize, cols: usize },
    Product { m: usize, n: usize, k: usize },
}

fn chunk_dims(plan: &KernelPlan, statements: &[Statement]) -> GeneratorResult<ChunkDims> {
    let range = plan.statements.clone();
    match plan.family {
        Family::ScalarAxpy => Ok(ChunkDims::None),
        Family::VectorAxpy | Family::ScalarReduction => Ok(ChunkDims::Vector {
            len: common_vector_len(statements, range)?,
        }),
        Family::MatrixAxpy => {
            let (rows, cols) = common_matrix_shape(statements, range)?;
            Ok(ChunkDims::Matrix { rows, cols })
        }
        Family::VectorReduction => {
            let (rows, cols) = row_reduction_shape(statements, range)?;
            Ok(ChunkDims::Matrix { rows, cols })
        }
        Family::MatrixProduct => {
            let (m, n, k) = product_dims(statements, range)?;
            Ok(ChunkDims::Product { m, n, k })
        }
    }
}

/// Every vector operand of the range must share one length; kernels walk all
/// of them with a single index.
fn common_vector_len(statements: &[Statement], range: Range<usize>) -> GeneratorResult<usize> {
    let mut len: Option<usize> = None;
    for statement in &statements[range] {
        for node in statement.nodes() {
            for operand in [&node.lhs, &node.rhs] {
                if let Operand::Vector(view) = operand {
                    match len {
                        Some(existing) if existing != view.len => {
                            return Err(GeneratorError::unsupported(
                                "vector operands of one fused kernel differ in length",
                            ))
                        }
                        _ => len = Some(view.len),
                    }
                }
            }
        }
    }
    len.ok_or_else(|| {
        GeneratorError::mismatch("vector kernel over a batch without vector operands")
    })
}

fn common_matrix_shape(
    statements: &[Statement],
    range: Range<usize>,
) -> GeneratorResult<(usize, usize)> {
    let mut shape: Option<(usize, usize)> = None;
    for statement in &statements[range] {
        for node in statement.nodes() {
            for operand in [&node.lhs, &node.rhs] {
                if let Operand::Matrix(view) = operand {
                    let dims = (view.rows, view.cols);
                    match shape {
                        Some(existing) if existing != dims => {
                            return Err(GeneratorError::unsupported(
                                "matrix operands of one fused kernel differ in shape",
                            ))
                        }
                        _ => shape = Some(dims),
                    }
                }
            }
        }
    }
    shape.ok_or_else(|| {
        GeneratorError::mismatch("matrix kernel over a batch without matrix operands")
    })
}

/// Logical shape of the reduced matrices, after transposition. Vectors read
/// per row must have the row count, vectors read per column the column
/// count.
fn row_reduction_shape(
    statements: &[Statement],
    range: Range<usize>,
) -> GeneratorResult<(usize, usize)> {
    let mut shape: Option<(usize, usize)> = None;
    for statement in &statements[range] {
        let marker = statement
            .nodes()
            .iter()
            .position(|node| node.op == Op::MatVecProd)
            .ok_or_else(|| {
                GeneratorError::mismatch("row reduction chunk without a product node")
            })?;
        let (view, transposed) = marker_matrix(statement, marker)?;
        let dims = if transposed {
            (view.cols, view.rows)
        } else {
            (view.rows, view.cols)
        };
        if let Some(existing) = shape {
            if existing != dims {
                return Err(GeneratorError::unsupported(
                    "row reductions fused into one kernel differ in matrix shape",
                ));
            }
        }
        shape = Some(dims);

        let (rows, cols) = dims;
        let root = statement.root();
        expect_vector_lens(statement, &root.lhs, Some(marker), rows, "the reduced rows")?;
        expect_vector_lens(statement, &root.rhs, Some(marker), rows, "the reduced rows")?;
        expect_vector_lens(
            statement,
            &statement.node(marker).rhs,
            None,
            cols,
            "the reduced columns",
        )?;
    }
    shape.ok_or_else(|| GeneratorError::mismatch("row reduction chunk resolved no shape"))
}

fn marker_matrix(statement: &Statement, marker: usize) -> GeneratorResult<(MatrixView, bool)> {
    match &statement.node(marker).lhs {
        Operand::Matrix(view) => Ok((*view, false)),
        Operand::Node(target) if statement.node(*target).op == Op::Trans => {
            match &statement.node(*target).lhs {
                Operand::Matrix(view) => Ok((*view, true)),
                _ => Err(GeneratorError::unsupported(
                    "transpose of a non-matrix in a matrix-vector product",
                )),
            }
        }
        _ => Err(GeneratorError::unsupported(
            "matrix-vector product without a matrix left operand",
        )),
    }
}

/// Checks every vector in the subtree against `expected`, stopping at the
/// `skip` node (the reduction marker, whose inside follows other rules).
fn expect_vector_lens(
    statement: &Statement,
    operand: &Operand,
    skip: Option<usize>,
    expected: usize,
    what: &str,
) -> GeneratorResult<()> {
    match operand {
        Operand::Vector(view) if view.len != expected => {
            Err(GeneratorError::unsupported(format!(
                "vector length {} where {what} need {expected}",
                view.len
            )))
        }
        Operand::Node(target) if Some(*target) != skip => {
            let node = statement.node(*target);
            expect_vector_lens(statement, &node.lhs, skip, expected, what)?;
            expect_vector_lens(statement, &node.rhs, skip, expected, what)
        }
        _ => Ok(()),
    }
}

fn product_dims(
    statements: &[Statement],
    range: Range<usize>,
) -> GeneratorResult<(usize, usize, usize)> {
    let statement = &statements[range.start];
    let marker = statement
        .nodes()
        .iter()
        .position(|node| node.op == Op::MatMatProd)
        .ok_or_else(|| GeneratorError::mismatch("product chunk without a product node"))?;
    let target = match statement.target() {
        Operand::Matrix(view) => *view,
        _ => return Err(GeneratorError::mismatch("product target is not a matrix")),
    };
    let node = statement.node(marker);
    let (lhs_rows, lhs_cols) = product_side_dims(statement, &node.lhs)?;
    let (rhs_rows, rhs_cols) = product_side_dims(statement, &node.rhs)?;
    if lhs_cols != rhs_rows {
        return Err(GeneratorError::unsupported(
            "product operands disagree on the inner dimension",
        ));
    }
    if target.rows != lhs_rows || target.cols != rhs_cols {
        return Err(GeneratorError::unsupported(
            "product result shape does not match its operands",
        ));
    }
    Ok((target.rows, target.cols, lhs_cols))
}

/// Logical (post-transpose) dimensions of one product operand.
fn product_side_dims(statement: &Statement, operand: &Operand) -> GeneratorResult<(usize, usize)> {
    match operand {
        Operand::Matrix(view) => Ok((view.rows, view.cols)),
        Operand::Node(target) if statement.node(*target).op == Op::Trans => {
            match &statement.node(*target).lhs {
                Operand::Matrix(view) => Ok((view.cols, view.rows)),
                _ => Err(GeneratorError::unsupported(
                    "transpose of a non-matrix in a matrix product",
                )),
            }
        }
        _ => Err(GeneratorError::unsupported(
            "matrix product operands must be matrices",
        )),
    }
}

/// Fingerprints do not cover starts and strides, so a cached wide plan can
/// meet a strided fresh batch; reject it the way generation would have.
fn ensure_wide_operands(plan: &KernelPlan, map: &OperandMap) -> GeneratorResult<()> {
    if plan.simd_width == 1 {
        return Ok(());
    }
    for slot in &plan.slots {
        if let ArgSlot::BufferPtr { binding } = slot {
            if let BoundOperand::Vector(view) = &map.binding(*binding).operand {
                if view.start != 0 || view.stride != 1 {
                    return Err(GeneratorError::unsupported(
                        "strided vector submitted to a SIMD-wide kernel",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn build_args(
    plan: &KernelPlan,
    map: &OperandMap,
    statements: &[Statement],
    dims: &ChunkDims,
    scratch: Option<VectorView>,
) -> GeneratorResult<SmallVec<[KernelArg; 8]>> {
    let numeric = statements[plan.statements.start].numeric();
    let mut args: SmallVec<[KernelArg; 8]> = SmallVec::with_capacity(plan.slots.len());
    for slot in &plan.slots {
        let arg = match slot {
            ArgSlot::Size { name, dim } => {
                KernelArg::Uint(size_value(name, *dim, dims, plan.simd_width)?)
            }
            ArgSlot::BufferPtr { binding } => match &map.binding(*binding).operand {
                BoundOperand::Vector(view) => KernelArg::Buffer(view.buffer),
                BoundOperand::Matrix(view) => KernelArg::Buffer(view.buffer),
                BoundOperand::DeviceScalar { buffer, .. } => KernelArg::Buffer(*buffer),
                BoundOperand::HostScalar(_) => {
                    return Err(GeneratorError::mismatch(
                        "pointer slot bound to a host scalar",
                    ))
                }
            },
            ArgSlot::VectorStart { binding } => match &map.binding(*binding).operand {
                BoundOperand::Vector(view) => {
                    KernelArg::Uint(to_u32(view.start, "vector start")?)
                }
                _ => return Err(GeneratorError::mismatch("start slot bound to a non-vector")),
            },
            ArgSlot::VectorStride { binding } => match &map.binding(*binding).operand {
                BoundOperand::Vector(view) => {
                    KernelArg::Uint(to_u32(view.stride, "vector stride")?)
                }
                _ => {
                    return Err(GeneratorError::mismatch("stride slot bound to a non-vector"))
                }
            },
            ArgSlot::HostScalar { binding } => match &map.binding(*binding).operand {
                BoundOperand::HostScalar(value) => match numeric {
                    Numeric::F32 => KernelArg::F32(*value as f32),
                    Numeric::F64 => KernelArg::F64(*value),
                },
                _ => {
                    return Err(GeneratorError::mismatch("value slot bound to a non-scalar"))
                }
            },
            ArgSlot::Scratch => {
                let view = scratch.ok_or_else(|| {
                    GeneratorError::mismatch("scratch slot without an allocated buffer")
                })?;
                KernelArg::Buffer(view.buffer)
            }
        };
        args.push(arg);
    }
    Ok(args)
}

/// Value of one size argument. Vector lengths travel in SIMD units; matrix
/// and product dimensions travel as element counts, their kernels divide
/// internally.
fn size_value(
    name: &str,
    dim: SizeDim,
    dims: &ChunkDims,
    simd_width: usize,
) -> GeneratorResult<u32> {
    let value = match (dim, dims) {
        (SizeDim::VectorLen, ChunkDims::Vector { len }) => {
            if len % simd_width != 0 {
                return Err(GeneratorError::unsupported(format!(
                    "vector length {len} is not a multiple of the SIMD width {simd_width}"
                )));
            }
            len / simd_width
        }
        (SizeDim::Rows, ChunkDims::Matrix { rows, .. }) => *rows,
        (SizeDim::Cols, ChunkDims::Matrix { cols, .. }) => *cols,
        (SizeDim::Rows, ChunkDims::Product { m, .. }) => *m,
        (SizeDim::Cols, ChunkDims::Product { n, .. }) => *n,
        (SizeDim::Inner, ChunkDims::Product { k, .. }) => *k,
        _ => {
            return Err(GeneratorError::mismatch(format!(
                "size argument `{name}` has no dimension in this kernel family"
            )))
        }
    };
    to_u32(value, "size argument")
}

fn to_u32(value: usize, what: &str) -> GeneratorResult<u32> {
    u32::try_from(value).map_err(|_| {
        GeneratorError::unsupported(format!(
            "{what} {value} exceeds the 32-bit kernel argument range"
        ))
    })
}
