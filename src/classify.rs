//! Maps statements to the kernel family that executes them.
//!
//! The family is a function of the assignment target's kind and the number
//! of reduction markers in the tree: zero markers make an elementwise
//! (axpy-style) kernel, exactly one marker makes a reduction or a product.
//! Anything else has no template and is rejected up front.

use serde::Serialize;

use crate::error::{GeneratorError, GeneratorResult};
use crate::statement::{Op, Operand, Statement};

/// Kernel family. Statements of the same family that arrive in one batch
/// are fused into a single kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    ScalarAxpy,
    VectorAxpy,
    MatrixAxpy,
    ScalarReduction,
    VectorReduction,
    MatrixProduct,
}

impl Family {
    /// Short code prefixing program signatures.
    pub fn code(self) -> &'static str {
        match self {
            Family::ScalarAxpy => "sa",
            Family::VectorAxpy => "va",
            Family::MatrixAxpy => "ma",
            Family::ScalarReduction => "sr",
            Family::VectorReduction => "vr",
            Family::MatrixProduct => "mp",
        }
    }

    pub fn is_reduction(self) -> bool {
        matches!(self, Family::ScalarReduction | Family::VectorReduction)
    }
}

/// Indices of reduction-marker nodes, in arena order.
pub fn reduction_nodes(statement: &Statement) -> Vec<usize> {
    statement
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, node)| node.op.is_reduction_marker())
        .map(|(index, _)| index)
        .collect()
}

/// Determines the family of a single statement.
///
/// The marker kind must agree with the target kind: an inner product feeds a
/// scalar, a matrix-vector product feeds a vector, a matrix-matrix product
/// feeds a matrix. Transposes are meaningful only inside a matrix product.
pub fn classify(statement: &Statement) -> GeneratorResult<Family> {
    let markers = reduction_nodes(statement);
    if markers.len() > 1 {
        return Err(GeneratorError::unsupported(format!(
            "statement carries {} reduction operations, at most one is supported",
            markers.len()
        )));
    }

    let family = match (statement.target(), markers.first()) {
        (Operand::DeviceScalar { .. }, None) => Family::ScalarAxpy,
        (Operand::Vector(_), None) => Family::VectorAxpy,
        (Operand::Matrix(_), None) => Family::MatrixAxpy,
        (target, Some(&marker)) => {
            let op = statement.node(marker).op;
            match (target, op) {
                (Operand::DeviceScalar { .. }, Op::InnerProd) => Family::ScalarReduction,
                (Operand::Vector(_), Op::MatVecProd) => Family::VectorReduction,
                (Operand::Matrix(_), Op::MatMatProd) => Family::MatrixProduct,
                (_, op) => {
                    return Err(GeneratorError::unsupported(format!(
                        "reduction `{}` does not match the assignment target",
                        op.token()
                    )))
                }
            }
        }
        // Statement construction already rules these out.
        (_, None) => {
            return Err(GeneratorError::unsupported(
                "assignment target must be a device scalar, vector, or matrix",
            ))
        }
    };

    let transpose_ok = matches!(family, Family::MatrixProduct | Family::VectorReduction);
    if !transpose_ok && statement.count_op(Op::Trans) > 0 {
        return Err(GeneratorError::unsupported(
            "transpose outside a matrix or matrix-vector product",
        ));
    }

    Ok(family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{BufferId, MatrixLayout, MatrixView, Numeric, StatementNode, VectorView};

    fn vector(id: u64) -> Operand {
        VectorView::contiguous(BufferId(id), Numeric::F32, 64).into()
    }

    fn matrix(id: u64) -> Operand {
        MatrixView::new(BufferId(id), Numeric::F32, 16, 16, MatrixLayout::RowMajor).into()
    }

    fn scalar(id: u64) -> Operand {
        Operand::DeviceScalar {
            buffer: BufferId(id),
            numeric: Numeric::F32,
        }
    }

    #[test]
    fn vector_sum_is_vector_axpy() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::Add, vector(1), vector(2)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::VectorAxpy);
    }

    #[test]
    fn matrix_sum_is_matrix_axpy() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, matrix(0), Operand::Node(1)),
            StatementNode::new(Op::Add, matrix(1), matrix(2)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::MatrixAxpy);
    }

    #[test]
    fn scalar_target_without_marker_is_scalar_axpy() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, scalar(0), Operand::Node(1)),
            StatementNode::new(Op::Mult, scalar(1), Operand::HostScalar(2.0)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::ScalarAxpy);
    }

    #[test]
    fn inner_product_is_scalar_reduction() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, scalar(0), Operand::Node(1)),
            StatementNode::new(Op::InnerProd, vector(1), vector(2)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::ScalarReduction);
    }

    #[test]
    fn matrix_vector_product_is_vector_reduction() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::MatVecProd, matrix(1), vector(2)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::VectorReduction);
    }

    #[test]
    fn matrix_matrix_product_is_matrix_product() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, matrix(0), Operand::Node(1)),
            StatementNode::new(Op::MatMatProd, matrix(1), matrix(2)),
        ])
        .unwrap();
        assert_eq!(classify(&statement).unwrap(), Family::MatrixProduct);
    }

    #[test]
    fn marker_target_mismatch_is_rejected() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::InnerProd, vector(1), vector(2)),
        ])
        .unwrap();
        assert!(classify(&statement).is_err());
    }

    #[test]
    fn two_markers_are_rejected() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, scalar(0), Operand::Node(1)),
            StatementNode::new(Op::Add, Operand::Node(2), Operand::Node(3)),
            StatementNode::new(Op::InnerProd, vector(1), vector(2)),
            StatementNode::new(Op::InnerProd, vector(3), vector(4)),
        ])
        .unwrap();
        let err = classify(&statement).unwrap_err();
        assert!(matches!(err, GeneratorError::UnsupportedShape { .. }));
    }

    #[test]
    fn transpose_outside_product_is_rejected() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, matrix(0), Operand::Node(1)),
            StatementNode::new(Op::Add, Operand::Node(2), matrix(1)),
            StatementNode::unary(Op::Trans, matrix(2)),
        ])
        .unwrap();
        assert!(classify(&statement).is_err());
    }
}
