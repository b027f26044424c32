//! Elementwise kernel templates.
//!
//! One kernel per chunk. Every statement of the chunk becomes one line of
//! the shared loop body, so fused statements read their inputs once per
//! index without intermediate buffers. Work decomposition follows the
//! profile: a grid-sized stride, or one contiguous block per work item.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::classify::Family;
use crate::error::{GeneratorError, GeneratorResult};
use crate::mapping::{ArgSlot, BoundOperand, OperandMap, Side, SizeDim};
use crate::profiles::{MatrixAxpyProfile, VectorAxpyProfile};
use crate::statement::{MatrixLayout, Statement};

use super::utils::{close_strided_loop, open_strided_loop, push_block, push_line};
use super::{
    append_binding_args, chunk_bindings, emit_assigned_value, ensure_contiguous_vectors,
    entry_name, Chunk, GridRecipe, KernelPlan,
};

pub(super) fn generate_vector(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
    profile: &VectorAxpyProfile,
) -> GeneratorResult<Vec<KernelPlan>> {
    let width = profile.simd_width;
    let bindings = chunk_bindings(map, statements, chunk.range.clone());
    ensure_contiguous_vectors(map, &bindings, width, &profile.repr())?;

    let mut params = vec!["unsigned int N".to_owned()];
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    slots.push(ArgSlot::Size {
        name: "N".to_owned(),
        dim: SizeDim::VectorLen,
    });
    for &index in &bindings {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, width);
    }

    let entry = entry_name(entry_base);
    push_line(source, 0, &format!("__kernel void {entry}({})", params.join(", ")));
    push_line(source, 0, "{");
    open_strided_loop(source, 1, "i", "N", 0, profile.global_decomposition);

    for stmt_index in chunk.range.clone() {
        let statement = &statements[stmt_index];
        let mut leaf = |node: usize, side: Side| {
            vector_leaf(map, stmt_index, node, side, width)
        };
        let target = leaf(0, Side::Lhs)?;
        let value = emit_assigned_value(statement, &HashMap::new(), &mut leaf)?;
        push_line(
            source,
            2,
            &format!("{target} {} {value};", statement.root().op.token()),
        );
    }

    close_strided_loop(source, 1);
    push_line(source, 0, "}");
    source.push('\n');

    Ok(vec![KernelPlan {
        entry,
        family: Family::VectorAxpy,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [profile.global_size(), 1],
            local: [profile.local_size(), 1],
        },
        scratch_elems: None,
        simd_width: width,
    }])
}

fn vector_leaf(
    map: &OperandMap,
    stmt_index: usize,
    node: usize,
    side: Side,
    width: usize,
) -> GeneratorResult<String> {
    let index = map
        .binding_index(stmt_index, node, side)
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
            "matrix operand in a vector elementwise statement",
        )),
    }
}

pub(super) fn generate_matrix(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
    profile: &MatrixAxpyProfile,
) -> GeneratorResult<Vec<KernelPlan>> {
    if profile.simd_width > 1 {
        return Err(GeneratorError::invalid_profile(
            profile.repr(),
            "matrix elementwise kernels support SIMD width 1 only",
        ));
    }
    let bindings = chunk_bindings(map, statements, chunk.range.clone());

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
    for &index in &bindings {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, 1);
    }

    let entry = entry_name(entry_base);
    push_line(source, 0, &format!("__kernel void {entry}({})", params.join(", ")));
    push_line(source, 0, "{");
    open_strided_loop(source, 1, "i", "M", 0, profile.global_decomposition);
    open_strided_loop(source, 2, "j", "N", 1, profile.global_decomposition);

    for stmt_index in chunk.range.clone() {
        let statement = &statements[stmt_index];
        let mut leaf = |node: usize, side: Side| matrix_leaf(map, stmt_index, node, side);
        let target = leaf(0, Side::Lhs)?;
        let value = emit_assigned_value(statement, &HashMap::new(), &mut leaf)?;
        push_line(
            source,
            3,
            &format!("{target} {} {value};", statement.root().op.token()),
        );
    }

    close_strided_loop(source, 2);
    close_strided_loop(source, 1);
    push_line(source, 0, "}");
    source.push('\n');

    let (local_rows, local_cols) = profile.local_sizes();
    let (global_rows, global_cols) = profile.global_sizes();
    Ok(vec![KernelPlan {
        entry,
        family: Family::MatrixAxpy,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [global_rows, global_cols],
            local: [local_rows, local_cols],
        },
        scratch_elems: None,
        simd_width: 1,
    }])
}

fn matrix_leaf(
    map: &OperandMap,
    stmt_index: usize,
    node: usize,
    side: Side,
) -> GeneratorResult<String> {
    let index = map
        .binding_index(stmt_index, node, side)
        .ok_or_else(|| GeneratorError::mismatch("leaf occurrence missing from the operand map"))?;
    let binding = map.binding(index);
    let name = &binding.name;
    match &binding.operand {
        // Operands conform to the target shape, so the shared M/N size
        // arguments serve as every operand's strides.
        BoundOperand::Matrix(view) => match view.layout {
            MatrixLayout::RowMajor => Ok(format!("{name}[i*N + j]")),
            MatrixLayout::ColMajor => Ok(format!("{name}[i + j*M]")),
        },
        BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
        BoundOperand::HostScalar(_) => Ok(name.clone()),
        BoundOperand::Vector(_) => Err(GeneratorError::unsupported(
            "vector operand in a matrix elementwise statement",
        )),
    }
}

/// Scalar assignments run on one work item; the grid exists only to satisfy
/// the launch interface.
pub(super) fn generate_scalar(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
) -> GeneratorResult<Vec<KernelPlan>> {
    let bindings = chunk_bindings(map, statements, chunk.range.clone());
    let mut params = Vec::new();
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    for &index in &bindings {
        append_binding_args(&mut params, &mut slots, index, map.binding(index), chunk.numeric, 1);
    }

    let entry = entry_name(entry_base);
    push_line(source, 0, &format!("__kernel void {entry}({})", params.join(", ")));
    push_block(
        source,
        0,
        r#"
            {
              if (get_global_id(0) == 0)
              {
        "#,
    );

    for stmt_index in chunk.range.clone() {
        let statement = &statements[stmt_index];
        let mut leaf = |node: usize, side: Side| scalar_leaf(map, stmt_index, node, side);
        let target = leaf(0, Side::Lhs)?;
        let value = emit_assigned_value(statement, &HashMap::new(), &mut leaf)?;
        push_line(
            source,
            2,
            &format!("{target} {} {value};", statement.root().op.token()),
        );
    }

    push_block(
        source,
        0,
        r#"
              }
            }
        "#,
    );
    source.push('\n');

    Ok(vec![KernelPlan {
        entry,
        family: Family::ScalarAxpy,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::Fixed {
            global: [1, 1],
            local: [1, 1],
        },
        scratch_elems: None,
        simd_width: 1,
    }])
}

fn scalar_leaf(
    map: &OperandMap,
    stmt_index: usize,
    node: usize,
    side: Side,
) -> GeneratorResult<String> {
    let index = map
        .binding_index(stmt_index, node, side)
        .ok_or_else(|| GeneratorError::mismatch("leaf occurrence missing from the operand map"))?;
    let binding = map.binding(index);
    let name = &binding.name;
    match &binding.operand {
        BoundOperand::DeviceScalar { .. } => Ok(format!("*{name}")),
        BoundOperand::HostScalar(_) => Ok(name.clone()),
        BoundOperand::Vector(_) | BoundOperand::Matrix(_) => Err(GeneratorError::unsupported(
            "non-scalar operand in a scalar statement",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Generator;
    use crate::profiles::ProfileSet;
    use crate::statement::{BufferId, Numeric, Op, Operand, StatementNode, VectorView};

    fn vector(id: u64) -> Operand {
        VectorView::contiguous(BufferId(id), Numeric::F32, 64).into()
    }

    fn saxpy(target: u64) -> Statement {
        Statement::new(vec![
            StatementNode::new(Op::Assign, vector(target), Operand::Node(1)),
            StatementNode::new(Op::Add, Operand::Node(2), vector(2)),
            StatementNode::new(Op::Mult, vector(1), Operand::HostScalar(2.0)),
        ])
        .unwrap()
    }

    #[test]
    fn vector_kernel_strides_and_offsets_every_access() {
        let program = Generator::new().generate(&[saxpy(0)]).unwrap();
        assert_eq!(program.kernels.len(), 1);
        let source = &program.source;
        assert!(source.contains("__kernel void kernel_0(unsigned int N"));
        // Bindings number in arena-walk order: target, then the addend seen
        // at node 1, then the scaled vector and its coefficient at node 2.
        assert!(source.contains("v0[i*v0_inc + v0_start] = ((v2[i*v2_inc + v2_start] * h3) + v1[i*v1_inc + v1_start]);"));
        assert!(source.contains("i += get_global_size(0)"));
    }

    #[test]
    fn fused_statements_share_one_loop() {
        let program = Generator::new().generate(&[saxpy(0), saxpy(5)]).unwrap();
        assert_eq!(program.kernels.len(), 1);
        assert_eq!(program.source.matches("for (unsigned int i").count(), 1);
        assert_eq!(program.kernels[0].statements, 0..2);
    }

    #[test]
    fn compound_roots_keep_their_operator() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::AddAssign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::Mult, vector(1), Operand::HostScalar(3.0)),
        ])
        .unwrap();
        let program = Generator::new().generate(&[statement]).unwrap();
        assert!(program.source.contains("v0[i*v0_inc + v0_start] += (v1[i*v1_inc + v1_start] * h2);"));
    }

    #[test]
    fn wide_kernel_uses_vector_loads() {
        let mut profiles = *ProfileSet::builtin();
        profiles.vector_axpy = VectorAxpyProfile::new(4, 64, 32, true).unwrap();
        let program = Generator::with_profiles(profiles).generate(&[saxpy(0)]).unwrap();
        assert!(program.source.contains("__global float4* v0"));
        assert!(program.source.contains("v0[i]"));
        assert_eq!(program.kernels[0].simd_width, 4);
    }

    #[test]
    fn wide_kernel_rejects_strided_views() {
        let mut profiles = *ProfileSet::builtin();
        profiles.vector_axpy = VectorAxpyProfile::new(4, 64, 32, true).unwrap();
        let slice = VectorView::slice(BufferId(1), Numeric::F32, 0, 2, 32);
        let statement = Statement::new(vec![StatementNode::new(
            Op::Assign,
            vector(0),
            slice.into(),
        )])
        .unwrap();
        let err = Generator::with_profiles(profiles)
            .generate(&[statement])
            .unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidProfile { .. }));
    }

    #[test]
    fn block_decomposition_emits_span_loop() {
        let mut profiles = *ProfileSet::builtin();
        profiles.vector_axpy = VectorAxpyProfile::new(1, 128, 128, false).unwrap();
        let program = Generator::with_profiles(profiles).generate(&[saxpy(0)]).unwrap();
        assert!(program.source.contains("span_i"));
        assert!(program.source.contains("min(first_i + span_i, N)"));
    }

    #[test]
    fn matrix_kernel_respects_per_operand_layout() {
        use crate::statement::{MatrixLayout, MatrixView};
        let target = MatrixView::new(BufferId(0), Numeric::F32, 8, 8, MatrixLayout::RowMajor);
        let source_m = MatrixView::new(BufferId(1), Numeric::F32, 8, 8, MatrixLayout::ColMajor);
        let statement = Statement::new(vec![StatementNode::new(
            Op::Assign,
            target.into(),
            source_m.into(),
        )])
        .unwrap();
        let program = Generator::new().generate(&[statement]).unwrap();
        assert!(program.source.contains("m0[i*N + j] = m1[i + j*M];"));
    }

    #[test]
    fn scalar_chunk_runs_on_one_work_item() {
        let target = Operand::DeviceScalar {
            buffer: BufferId(0),
            numeric: Numeric::F32,
        };
        let source_s = Operand::DeviceScalar {
            buffer: BufferId(1),
            numeric: Numeric::F32,
        };
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, target, Operand::Node(1)),
            StatementNode::new(Op::Mult, source_s, Operand::HostScalar(0.5)),
        ])
        .unwrap();
        let program = Generator::new().generate(&[statement]).unwrap();
        assert!(program.source.contains("if (get_global_id(0) == 0)"));
        assert!(program.source.contains("*s0 = (*s1 * h2);"));
        assert!(matches!(
            program.kernels[0].grid,
            GridRecipe::Fixed { global: [1, 1], .. }
        ));
    }
}
