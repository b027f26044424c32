//! Symbolic operand binding and structural fingerprints.
//!
//! Before any source is generated, every leaf operand in a batch is bound to
//! a symbolic name in first-seen order. Two occurrences of the same device
//! object share one binding, so `x = y + y` passes `y` once; host scalars
//! are bound per occurrence because their values travel by value.
//!
//! The same walk produces one structural fingerprint per statement. The
//! fingerprint encodes operations, operand kinds, matrix layouts, and the
//! binding indices, and deliberately nothing else: sizes, starts, strides,
//! and scalar values are runtime arguments, so batches differing only in
//! those share a compiled program. Binding indices keep aliasing visible,
//! `x = y + y` and `x = y + z` must not collide.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::statement::{BufferId, MatrixLayout, MatrixView, Numeric, Operand, Statement, VectorView};

/// Which side of a node an occurrence sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Lhs,
    Rhs,
}

/// Leaf operand kinds a binding can carry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundOperand {
    Vector(VectorView),
    Matrix(MatrixView),
    DeviceScalar { buffer: BufferId, numeric: Numeric },
    HostScalar(f64),
}

/// One symbolic binding: the kernel-side name and the operand it currently
/// resolves to. Plans reference bindings by index so a cached program can be
/// re-run against a fresh batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub operand: BoundOperand,
}

/// Deduplication key. Vector and matrix keys are the full view, not just the
/// buffer, so two windows of one buffer never alias a start or stride
/// argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BindingKey {
    Vector(VectorView),
    Matrix(MatrixView),
    Scalar(BufferId),
}

/// Bindings and fingerprints for a whole batch.
#[derive(Debug, Clone)]
pub struct OperandMap {
    bindings: Vec<Binding>,
    occurrences: HashMap<(usize, usize, Side), usize>,
    statement_fingerprints: Vec<String>,
}

impl OperandMap {
    pub fn build(statements: &[Statement]) -> OperandMap {
        let mut map = OperandMap {
            bindings: Vec::new(),
            occurrences: HashMap::new(),
            statement_fingerprints: Vec::with_capacity(statements.len()),
        };
        let mut keys: HashMap<BindingKey, usize> = HashMap::new();

        for (stmt_index, statement) in statements.iter().enumerate() {
            let mut fingerprint = String::new();
            fingerprint.push(statement.numeric().code());
            fingerprint.push(':');
            for (node_index, node) in statement.nodes().iter().enumerate() {
                fingerprint.push_str(node.op.token());
                fingerprint.push('(');
                for (side, operand) in [(Side::Lhs, &node.lhs), (Side::Rhs, &node.rhs)] {
                    let code =
                        map.bind_operand(&mut keys, stmt_index, node_index, side, operand);
                    fingerprint.push_str(&code);
                    if side == Side::Lhs {
                        fingerprint.push(',');
                    }
                }
                fingerprint.push(')');
            }
            map.statement_fingerprints.push(fingerprint);
        }
        map
    }

    fn bind_operand(
        &mut self,
        keys: &mut HashMap<BindingKey, usize>,
        stmt_index: usize,
        node_index: usize,
        side: Side,
        operand: &Operand,
    ) -> String {
        let (key, bound) = match operand {
            Operand::Node(target) => return format!("#{target}"),
            Operand::Empty => return "_".to_owned(),
            Operand::Vector(view) => (Some(BindingKey::Vector(*view)), BoundOperand::Vector(*view)),
            Operand::Matrix(view) => (Some(BindingKey::Matrix(*view)), BoundOperand::Matrix(*view)),
            Operand::DeviceScalar { buffer, numeric } => (
                Some(BindingKey::Scalar(*buffer)),
                BoundOperand::DeviceScalar {
                    buffer: *buffer,
                    numeric: *numeric,
                },
            ),
            Operand::HostScalar(value) => (None, BoundOperand::HostScalar(*value)),
        };

        let index = match key.and_then(|key| keys.get(&key).copied()) {
            Some(existing) => existing,
            None => {
                let index = self.bindings.len();
                let name = match &bound {
                    BoundOperand::Vector(_) => format!("v{index}"),
                    BoundOperand::Matrix(_) => format!("m{index}"),
                    BoundOperand::DeviceScalar { .. } => format!("s{index}"),
                    BoundOperand::HostScalar(_) => format!("h{index}"),
                };
                self.bindings.push(Binding {
                    name,
                    operand: bound,
                });
                if let Some(key) = key {
                    keys.insert(key, index);
                }
                index
            }
        };
        self.occurrences.insert((stmt_index, node_index, side), index);

        match &self.bindings[index].operand {
            BoundOperand::Vector(_) => format!("v{index}"),
            BoundOperand::Matrix(view) => match view.layout {
                MatrixLayout::RowMajor => format!("mr{index}"),
                MatrixLayout::ColMajor => format!("mc{index}"),
            },
            BoundOperand::DeviceScalar { .. } => format!("s{index}"),
            // The value stays out of the fingerprint so changing a
            // coefficient never recompiles.
            BoundOperand::HostScalar(_) => "h".to_owned(),
        }
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn binding(&self, index: usize) -> &Binding {
        &self.bindings[index]
    }

    /// Binding index of the leaf at `(statement, node, side)`.
    pub fn binding_index(&self, statement: usize, node: usize, side: Side) -> Option<usize> {
        self.occurrences.get(&(statement, node, side)).copied()
    }

    /// Kernel-side name of the leaf at `(statement, node, side)`.
    pub fn name_of(&self, statement: usize, node: usize, side: Side) -> Option<&str> {
        self.binding_index(statement, node, side)
            .map(|index| self.bindings[index].name.as_str())
    }

    pub fn statement_fingerprint(&self, statement: usize) -> &str {
        &self.statement_fingerprints[statement]
    }

    /// Joined fingerprints for a contiguous statement range.
    pub fn range_fingerprint(&self, range: std::ops::Range<usize>) -> String {
        let mut joined = String::new();
        for (offset, fingerprint) in self.statement_fingerprints[range].iter().enumerate() {
            if offset > 0 {
                joined.push(';');
            }
            let _ = write!(joined, "{fingerprint}");
        }
        joined
    }
}

/// What a size argument measures, resolved against the batch at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeDim {
    /// Element count of the chunk's vector targets.
    VectorLen,
    /// Row count of the reduced or produced matrix shape.
    Rows,
    /// Column count of the reduced or produced matrix shape.
    Cols,
    /// Shared dimension of a matrix product.
    Inner,
}

/// One kernel argument of a plan, resolved against a fresh batch when the
/// kernel is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ArgSlot {
    /// Size argument, passed before all operand arguments.
    Size { name: String, dim: SizeDim },
    /// Device pointer of the bound operand.
    BufferPtr { binding: usize },
    /// Start offset of a bound vector.
    VectorStart { binding: usize },
    /// Stride of a bound vector.
    VectorStride { binding: usize },
    /// Host scalar passed by value.
    HostScalar { binding: usize },
    /// Per-launch scratch buffer for reduction partials.
    Scratch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{Op, StatementNode};

    fn vector(id: u64) -> Operand {
        VectorView::contiguous(BufferId(id), Numeric::F32, 64).into()
    }

    fn assign_sum(target: u64, a: u64, b: u64) -> Statement {
        Statement::new(vec![
            StatementNode::new(Op::Assign, vector(target), Operand::Node(1)),
            StatementNode::new(Op::Add, vector(a), vector(b)),
        ])
        .unwrap()
    }

    #[test]
    fn repeated_operand_binds_once() {
        let map = OperandMap::build(&[assign_sum(0, 1, 1)]);
        assert_eq!(map.bindings().len(), 2);
        assert_eq!(map.statement_fingerprint(0), "f:=(v0,#1)+(v1,v1)");
    }

    #[test]
    fn aliasing_changes_the_fingerprint() {
        let aliased = OperandMap::build(&[assign_sum(0, 1, 1)]);
        let distinct = OperandMap::build(&[assign_sum(0, 1, 2)]);
        assert_ne!(
            aliased.statement_fingerprint(0),
            distinct.statement_fingerprint(0)
        );
    }

    #[test]
    fn bindings_are_shared_across_statements() {
        let map = OperandMap::build(&[assign_sum(0, 1, 2), assign_sum(3, 1, 2)]);
        // x, y, z, then only the second target is new.
        assert_eq!(map.bindings().len(), 4);
        assert_eq!(map.statement_fingerprint(1), "f:=(v3,#1)+(v1,v2)");
    }

    #[test]
    fn host_scalar_values_stay_out_of_the_fingerprint() {
        let scaled = |value: f64| {
            Statement::new(vec![
                StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
                StatementNode::new(Op::Mult, vector(1), Operand::HostScalar(value)),
            ])
            .unwrap()
        };
        let a = OperandMap::build(&[scaled(2.0)]);
        let b = OperandMap::build(&[scaled(-7.5)]);
        assert_eq!(a.statement_fingerprint(0), b.statement_fingerprint(0));
        assert_eq!(a.statement_fingerprint(0), "f:=(v0,#1)*(v1,h)");
    }

    #[test]
    fn host_scalars_bind_per_occurrence() {
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::Add, Operand::Node(2), Operand::Node(3)),
            StatementNode::new(Op::Mult, vector(1), Operand::HostScalar(2.0)),
            StatementNode::new(Op::Mult, vector(2), Operand::HostScalar(2.0)),
        ])
        .unwrap();
        let map = OperandMap::build(&[statement]);
        let host = map
            .bindings()
            .iter()
            .filter(|binding| matches!(binding.operand, BoundOperand::HostScalar(_)))
            .count();
        assert_eq!(host, 2);
    }

    #[test]
    fn distinct_windows_of_one_buffer_bind_separately() {
        let range = VectorView::range(BufferId(1), Numeric::F32, 8, 32);
        let slice = VectorView::slice(BufferId(1), Numeric::F32, 0, 2, 32);
        let statement = Statement::new(vec![
            StatementNode::new(Op::Assign, vector(0), Operand::Node(1)),
            StatementNode::new(Op::Add, range.into(), slice.into()),
        ])
        .unwrap();
        let map = OperandMap::build(&[statement]);
        assert_eq!(map.bindings().len(), 3);
    }

    #[test]
    fn layout_is_part_of_the_fingerprint() {
        let with_layout = |layout: MatrixLayout| {
            let target = MatrixView::new(BufferId(0), Numeric::F32, 8, 8, layout);
            let source = MatrixView::new(BufferId(1), Numeric::F32, 8, 8, layout);
            let statement = Statement::new(vec![StatementNode::new(
                Op::Assign,
                target.into(),
                source.into(),
            )])
            .unwrap();
            let map = OperandMap::build(&[statement]);
            map.statement_fingerprint(0).to_owned()
        };
        assert_ne!(
            with_layout(MatrixLayout::RowMajor),
            with_layout(MatrixLayout::ColMajor)
        );
    }

    #[test]
    fn occurrence_lookup_points_at_the_shared_binding() {
        let map = OperandMap::build(&[assign_sum(0, 1, 1)]);
        let lhs = map.binding_index(0, 1, Side::Lhs).unwrap();
        let rhs = map.binding_index(0, 1, Side::Rhs).unwrap();
        assert_eq!(lhs, rhs);
        assert_eq!(map.name_of(0, 0, Side::Lhs), Some("v0"));
    }
}
