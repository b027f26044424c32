//! Reduction kernel templates.
//!
//! Scalar reductions split into two launches: a wide accumulation pass that
//! leaves one partial per work group in a scratch buffer, and a single-group
//! pass that folds the partials and evaluates the statement around the
//! reduced value. With one work group the split collapses into a single
//! kernel and no scratch.
//!
//! Row-wise reductions (matrix-vector products) run one kernel: each work
//! group covers a block of result rows, with a lane dimension cooperating on
//! the inner loop. The outer row loop advances by whole group blocks so
//! every work item reaches each barrier.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::classify::Family;
use crate::error::{GeneratorError, GeneratorResult};
use crate::mapping::{ArgSlot, BoundOperand, OperandMap, Side, SizeDim};
use crate::profiles::{ScalarReductionProfile, VectorReductionProfile};
use crate::statement::{MatrixLayout, Op, Operand, Statement};

use super::utils::{close_strided_loop, device_type, lane_sum, open_strided_loop, push_line};
use super::{
    append_binding_args, chunk_bindings, emit_assigned_value, emit_operand,
    ensure_contiguous_vectors, entry_name, Chunk, GridRecipe, KernelPlan,
};

/// The marker node of a reduction statement. The classifier guarantees
/// exactly one per statement in these families.
fn marker_node(statement: &Statement) -> GeneratorResult<usize> {
    statement
        .nodes()
        .iter()
        .position(|node| node.op.is_reduction_marker())
        .ok_or_else(|| GeneratorError::mismatch("reduction chunk without a marker node"))
}

/// Node indices of the subtree rooted at `root`, including `root`.
fn subtree_nodes(statement: &Statement, root: usize) -> Vec<usize> {
    let mut stack = vec![root];
    let mut nodes = Vec::new();
    while let Some(index) = stack.pop() {
        nodes.push(index);
        let node = statement.node(index);
        for operand in [&node.lhs, &node.rhs] {
            if let Operand::Node(target) = operand {
                stack.push(*target);
            }
        }
    }
    nodes
}

/// Splits a chunk's bindings into those referenced under marker subtrees
/// and those referenced outside them, both in first-seen order. A binding
/// used on both sides appears in both lists.
fn split_bindings(
    map: &OperandMap,
    statements: &[Statement],
    range: std::ops::Range<usize>,
) -> GeneratorResult<(Vec<usize>, Vec<usize>)> {
    let mut inner: Vec<usize> = Vec::new();
    let mut outer: Vec<usize> = Vec::new();
    for stmt_index in range {
        let statement = &statements[stmt_index];
        let marker = marker_node(statement)?;
        let covered = subtree_nodes(statement, marker);
        for (node_index, _) in statement.nodes().iter().enumerate() {
            let bucket: &mut Vec<usize> = if covered.contains(&node_index) {
                &mut inner
            } else {
                &mut outer
            };
            for side in [Side::Lhs, Side::Rhs] {
                if let Some(binding) = map.binding_index(stmt_index, node_index, side) {
                    if !bucket.contains(&binding) {
                        bucket.push(binding);
                    }
                }
            }
        }
    }
    Ok((inner, outer))
}

fn scratch_index(marker: usize, groups: usize, within: &str) -> String {
    if marker == 0 {
        format!("scratch0[{within}]")
    } else {
        format!("scratch0[{} + {within}]", marker * groups)
    }
}

fn scaled(expr: &str, factor: usize) -> String {
    if factor == 1 {
        expr.to_owned()
    } else {
        format!("{expr}*{factor}")
    }
}

pub(super) fn generate_scalar(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
    profile: &ScalarReductionProfile,
) -> GeneratorResult<Vec<KernelPlan>> {
    let width = profile.simd_width;
    let gs = profile.group_size;
    let groups = profile.num_groups;
    let single = groups == 1;
    let scalar_ty = device_type(chunk.numeric, 1);
    let acc_ty = device_type(chunk.numeric, width);

    let all = chunk_bindings(map, statements, chunk.range.clone());
    ensure_contiguous_vectors(map, &all, width, &profile.repr())?;
    let (inner, outer) = split_bindings(map, statements, chunk.range.clone())?;

    let markers: Vec<(usize, usize)> = chunk
        .range
        .clone()
        .map(|stmt| marker_node(&statements[stmt]).map(|node| (stmt, node)))
        .collect::<GeneratorResult<_>>()?;
    let scratch_elems = groups * markers.len();

    let element_leaf = |stmt: usize, node: usize, side: Side| -> GeneratorResult<String> {
        let index = map
            .binding_index(stmt, node, side)
            .ok_or_else(|| GeneratorError::mismatch("leaf occurrence missing from the operand map"))?;
        let binding = map.binding(index);
        let name = &binding.name;
        match &binding.operand {
            BoundOperand::Vector(_) => {
                if width > 1 {
                    Ok(format!("{name}[i]"))
                } else {
                    Ok(format!("{name}[i*{name}_inc + {name}_start]"))
                }
            }
            BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
            BoundOperand::HostScalar(_) => Ok(name.clone()),
            BoundOperand::Matrix(_) => Err(GeneratorError::unsupported(
                "matrix operand inside an inner product",
            )),
        }
    };

    // Accumulation kernel. With a single work group it also finalizes.
    let entry0 = entry_name(entry_base);
    let mut params = vec!["unsigned int N".to_owned()];
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    slots.push(ArgSlot::Size {
        name: "N".to_owned(),
        dim: SizeDim::VectorLen,
    });
    if !single {
        params.push(format!("__global {scalar_ty}* scratch0"));
        slots.push(ArgSlot::Scratch);
    }
    let declared = if single { &all } else { &inner };
    for &index in declared {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, width);
    }

    push_line(source, 0, &format!("__kernel void {entry0}({})", params.join(", ")));
    push_line(source, 0, "{");
    push_line(source, 1, "unsigned int lid = get_local_id(0);");
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 1, &format!("{acc_ty} acc{m} = 0;"));
    }
    open_strided_loop(source, 1, "i", "N", 0, profile.global_decomposition);
    for (m, &(stmt, marker)) in markers.iter().enumerate() {
        let node = statements[stmt].node(marker);
        let subs = HashMap::new();
        let mut leaf = |n: usize, s: Side| element_leaf(stmt, n, s);
        let lhs = emit_operand(&statements[stmt], marker, Side::Lhs, &node.lhs, &subs, &mut leaf)?;
        let rhs = emit_operand(&statements[stmt], marker, Side::Rhs, &node.rhs, &subs, &mut leaf)?;
        push_line(source, 2, &format!("acc{m} += ({lhs} * {rhs});"));
    }
    close_strided_loop(source, 1);
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 1, &format!("__local {scalar_ty} buf{m}[{gs}];"));
        push_line(
            source,
            1,
            &format!("buf{m}[lid] = {};", lane_sum(&format!("acc{m}"), width)),
        );
    }
    emit_tree_reduce(source, 1, gs, markers.len(), "lid");
    push_line(source, 1, "if (lid == 0)");
    push_line(source, 1, "{");
    if single {
        emit_finalize_lines(source, 2, statements, &markers, map)?;
    } else {
        for (m, _) in markers.iter().enumerate() {
            let target = scratch_index(m, groups, "get_group_id(0)");
            push_line(source, 2, &format!("{target} = buf{m}[0];"));
        }
    }
    push_line(source, 1, "}");
    push_line(source, 0, "}");
    source.push('\n');

    let mut plans = vec![KernelPlan {
        entry: entry0,
        family: Family::ScalarReduction,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [gs * groups, 1],
            local: [gs, 1],
        },
        scratch_elems: (!single).then_some(scratch_elems),
        simd_width: width,
    }];
    if single {
        return Ok(plans);
    }

    // Folding kernel: one group combines the partials and evaluates the
    // statements around them.
    let entry1 = entry_name(entry_base + 1);
    let mut params = vec![format!("__global {scalar_ty}* scratch0")];
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    slots.push(ArgSlot::Scratch);
    for &index in &outer {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, 1);
    }

    push_line(source, 0, &format!("__kernel void {entry1}({})", params.join(", ")));
    push_line(source, 0, "{");
    push_line(source, 1, "unsigned int lid = get_local_id(0);");
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 1, &format!("{scalar_ty} acc{m} = 0;"));
    }
    push_line(
        source,
        1,
        &format!("for (unsigned int i = lid; i < {groups}; i += {gs})"),
    );
    push_line(source, 1, "{");
    for (m, _) in markers.iter().enumerate() {
        let partial = scratch_index(m, groups, "i");
        push_line(source, 2, &format!("acc{m} += {partial};"));
    }
    push_line(source, 1, "}");
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 1, &format!("__local {scalar_ty} buf{m}[{gs}];"));
        push_line(source, 1, &format!("buf{m}[lid] = acc{m};"));
    }
    emit_tree_reduce(source, 1, gs, markers.len(), "lid");
    push_line(source, 1, "if (lid == 0)");
    push_line(source, 1, "{");
    emit_finalize_lines(source, 2, statements, &markers, map)?;
    push_line(source, 1, "}");
    push_line(source, 0, "}");
    source.push('\n');

    plans.push(KernelPlan {
        entry: entry1,
        family: Family::ScalarReduction,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [gs, 1],
            local: [gs, 1],
        },
        scratch_elems: Some(scratch_elems),
        simd_width: 1,
    });
    Ok(plans)
}

/// In-group tree reduction over `buf0..buf{markers}`.
fn emit_tree_reduce(source: &mut String, indent: usize, gs: usize, markers: usize, lid: &str) {
    push_line(
        source,
        indent,
        &format!("for (unsigned int stride = {}; stride > 0; stride >>= 1)", gs / 2),
    );
    push_line(source, indent, "{");
    push_line(source, indent + 1, "barrier(CLK_LOCAL_MEM_FENCE);");
    push_line(source, indent + 1, &format!("if ({lid} < stride)"));
    push_line(source, indent + 1, "{");
    for m in 0..markers {
        push_line(
            source,
            indent + 2,
            &format!("buf{m}[{lid}] += buf{m}[{lid} + stride];"),
        );
    }
    push_line(source, indent + 1, "}");
    push_line(source, indent, "}");
}

/// Statement lines around reduced values, `buf{m}[0]` standing in for each
/// marker subtree.
fn emit_finalize_lines(
    source: &mut String,
    indent: usize,
    statements: &[Statement],
    markers: &[(usize, usize)],
    map: &OperandMap,
) -> GeneratorResult<()> {
    for (m, &(stmt, marker)) in markers.iter().enumerate() {
        let statement = &statements[stmt];
        let mut subs = HashMap::new();
        subs.insert(marker, format!("buf{m}[0]"));
        let mut leaf = |node: usize, side: Side| -> GeneratorResult<String> {
            let index = map.binding_index(stmt, node, side).ok_or_else(|| {
                GeneratorError::mismatch("leaf occurrence missing from the operand map")
            })?;
            let binding = map.binding(index);
            let name = &binding.name;
            match &binding.operand {
                BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
                BoundOperand::HostScalar(_) => Ok(name.clone()),
                BoundOperand::Vector(_) | BoundOperand::Matrix(_) => Err(
                    GeneratorError::unsupported("non-scalar operand outside an inner product"),
                ),
            }
        };
        let target = leaf(0, Side::Lhs)?;
        let value = emit_assigned_value(statement, &subs, &mut leaf)?;
        push_line(
            source,
            indent,
            &format!("{target} {} {value};", statement.root().op.token()),
        );
    }
    Ok(())
}

pub(super) fn generate_vector(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
    profile: &VectorReductionProfile,
) -> GeneratorResult<Vec<KernelPlan>> {
    let rows = profile.rows_per_group;
    let lanes = profile.lanes;
    let groups = profile.num_groups;
    let pitch = lanes + 1;
    let scalar_ty = device_type(chunk.numeric, 1);

    let all = chunk_bindings(map, statements, chunk.range.clone());
    let markers: Vec<(usize, usize)> = chunk
        .range
        .clone()
        .map(|stmt| marker_node(&statements[stmt]).map(|node| (stmt, node)))
        .collect::<GeneratorResult<_>>()?;

    let entry = entry_name(entry_base);
    let mut params = vec!["unsigned int M".to_owned(), "unsigned int N".to_owned()];
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    slots.push(ArgSlot::Size {
        name: "M".to_owned(),
        dim: SizeDim::Rows,
    });
    slots.push(ArgSlot::Size {
        name: "N".to_owned(),
        dim: SizeDim::Cols,
    });
    for &index in &all {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, 1);
    }

    push_line(source, 0, &format!("__kernel void {entry}({})", params.join(", ")));
    push_line(source, 0, "{");
    push_line(source, 1, "unsigned int lid0 = get_local_id(0);");
    push_line(source, 1, "unsigned int lid1 = get_local_id(1);");
    for (m, _) in markers.iter().enumerate() {
        push_line(
            source,
            1,
            &format!("__local {scalar_ty} buf{m}[{}];", rows * pitch),
        );
    }
    // Whole group blocks per iteration keep the barrier count uniform.
    push_line(
        source,
        1,
        &format!(
            "for (unsigned int rb = {}; rb < M; rb += {})",
            scaled("get_group_id(0)", rows),
            scaled("get_num_groups(0)", rows)
        ),
    );
    push_line(source, 1, "{");
    push_line(source, 2, "unsigned int r = rb + lid0;");
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 2, &format!("{scalar_ty} acc{m} = 0;"));
    }
    push_line(source, 2, "if (r < M)");
    push_line(source, 2, "{");
    push_line(
        source,
        3,
        &format!("for (unsigned int c = lid1; c < N; c += {lanes})"),
    );
    push_line(source, 3, "{");
    for (m, &(stmt, marker)) in markers.iter().enumerate() {
        let matrix = marker_matrix_access(map, statements, stmt, marker)?;
        let node = statements[stmt].node(marker);
        let subs = HashMap::new();
        let mut leaf = |n: usize, s: Side| column_leaf(map, stmt, n, s);
        let rhs = emit_operand(&statements[stmt], marker, Side::Rhs, &node.rhs, &subs, &mut leaf)?;
        push_line(source, 4, &format!("acc{m} += ({matrix} * {rhs});"));
    }
    push_line(source, 3, "}");
    push_line(source, 2, "}");
    for (m, _) in markers.iter().enumerate() {
        push_line(source, 2, &format!("buf{m}[lid0*{pitch} + lid1] = acc{m};"));
    }
    push_line(
        source,
        2,
        &format!("for (unsigned int stride = {}; stride > 0; stride >>= 1)", lanes / 2),
    );
    push_line(source, 2, "{");
    push_line(source, 3, "barrier(CLK_LOCAL_MEM_FENCE);");
    push_line(source, 3, "if (lid1 < stride)");
    push_line(source, 3, "{");
    for (m, _) in markers.iter().enumerate() {
        push_line(
            source,
            4,
            &format!("buf{m}[lid0*{pitch} + lid1] += buf{m}[lid0*{pitch} + lid1 + stride];"),
        );
    }
    push_line(source, 3, "}");
    push_line(source, 2, "}");
    push_line(source, 2, "barrier(CLK_LOCAL_MEM_FENCE);");
    push_line(source, 2, "if (lid1 == 0 && r < M)");
    push_line(source, 2, "{");
    for (m, &(stmt, marker)) in markers.iter().enumerate() {
        let statement = &statements[stmt];
        let mut subs = HashMap::new();
        subs.insert(marker, format!("buf{m}[lid0*{pitch}]"));
        let mut leaf = |n: usize, s: Side| row_leaf(map, stmt, n, s);
        let target = leaf(0, Side::Lhs)?;
        let value = emit_assigned_value(statement, &subs, &mut leaf)?;
        push_line(
            source,
            3,
            &format!("{target} {} {value};", statement.root().op.token()),
        );
    }
    push_line(source, 2, "}");
    // The next block overwrites the staging buffers.
    push_line(source, 2, "barrier(CLK_LOCAL_MEM_FENCE);");
    push_line(source, 1, "}");
    push_line(source, 0, "}");
    source.push('\n');

    Ok(vec![KernelPlan {
        entry,
        family: Family::VectorReduction,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [rows * groups, lanes],
            local: [rows, lanes],
        },
        scratch_elems: None,
        simd_width: 1,
    }])
}

/// Element access for the reduced matrix at logical row `r`, column `c`.
/// Transposition swaps the stored coordinates; the stored leading dimension
/// is whichever of M and N counts its stored rows or columns.
fn marker_matrix_access(
    map: &OperandMap,
    statements: &[Statement],
    stmt: usize,
    marker: usize,
) -> GeneratorResult<String> {
    let statement = &statements[stmt];
    let node = statement.node(marker);
    let (bind_node, transposed) = match &node.lhs {
        Operand::Matrix(_) => (marker, false),
        Operand::Node(target) if statement.node(*target).op == Op::Trans => {
            match &statement.node(*target).lhs {
                Operand::Matrix(_) => (*target, true),
                _ => {
                    return Err(GeneratorError::unsupported(
                        "transpose of a non-matrix in a matrix-vector product",
                    ))
                }
            }
        }
        _ => {
            return Err(GeneratorError::unsupported(
                "matrix-vector product requires a matrix left operand",
            ))
        }
    };
    let index = map
        .binding_index(stmt, bind_node, Side::Lhs)
        .ok_or_else(|| GeneratorError::mismatch("marker matrix missing from the operand map"))?;
    let binding = map.binding(index);
    let layout = match &binding.operand {
        BoundOperand::Matrix(view) => view.layout,
        _ => return Err(GeneratorError::mismatch("marker matrix bound to a non-matrix")),
    };
    let name = &binding.name;
    Ok(match (layout, transposed) {
        (MatrixLayout::RowMajor, false) => format!("{name}[r*N + c]"),
        (MatrixLayout::RowMajor, true) => format!("{name}[c*M + r]"),
        (MatrixLayout::ColMajor, false) => format!("{name}[r + c*M]"),
        (MatrixLayout::ColMajor, true) => format!("{name}[c + r*N]"),
    })
}

/// Leaf access inside a marker's right side, indexed by the inner column.
fn column_leaf(
    map: &OperandMap,
    stmt: usize,
    node: usize,
    side: Side,
) -> GeneratorResult<String> {
    let index = map
        .binding_index(stmt, node, side)
        .ok_or_else(|| GeneratorError::mismatch("leaf occurrence missing from the operand map"))?;
    let binding = map.binding(index);
    let name = &binding.name;
    match &binding.operand {
        BoundOperand::Vector(_) => Ok(format!("{name}[c*{name}_inc + {name}_start]")),
        BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
        BoundOperand::HostScalar(_) => Ok(name.clone()),
        BoundOperand::Matrix(_) => Err(GeneratorError::unsupported(
            "matrix operand on the vector side of a matrix-vector product",
        )),
    }
}

/// Leaf access outside the marker, indexed by the result row.
fn row_leaf(map: &OperandMap, stmt: usize, node: usize, side: Side) -> GeneratorResult<String> {
    let index = map
        .binding_index(stmt, node, side)
        .ok_or_else(|| GeneratorError::mismatch("leaf occurrence missing from the operand map"))?;
    let binding = map.binding(index);
    let name = &binding.name;
    match &binding.operand {
        BoundOperand::Vector(_) => Ok(format!("{name}[r*{name}_inc + {name}_start]")),
        BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
        BoundOperand::HostScalar(_) => Ok(name.clone()),
        BoundOperand::Matrix(_) => Err(GeneratorError::unsupported(
            "matrix operand outside a matrix-vector product",
        )),
    }
}
