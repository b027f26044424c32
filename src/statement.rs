//! Flat-arena encoding of one arithmetic assignment.
//!
//! A [`Statement`] is an ordered sequence of [`StatementNode`]s forming a DAG:
//! node 0 is the root assignment, and composite operands refer to later nodes
//! by index. The encoding is deliberately flat (no owning pointers) so that
//! traversals stay cache-friendly and fingerprinting is a linear walk.
//!
//! ```text
//!   v1 = beta * (v1 - alpha * v2)
//!
//!   [0] Assign   lhs = Vector(v1)   rhs = Node(1)
//!   [1] Mult     lhs = Node(2)      rhs = HostScalar(beta)
//!   [2] Sub      lhs = Vector(v1)   rhs = Node(3)
//!   [3] Mult     lhs = Vector(v2)   rhs = HostScalar(alpha)
//! ```
//!
//! All index invariants are checked once, in [`Statement::new`]; downstream
//! passes may index the arena without re-validating.

use serde::{Deserialize, Serialize};

use crate::error::{GeneratorError, GeneratorResult};

/// Element type shared by every operand of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Numeric {
    F32,
    F64,
}

impl Numeric {
    /// Type name used in emitted kernel source.
    pub fn kernel_type(self) -> &'static str {
        match self {
            Numeric::F32 => "float",
            Numeric::F64 => "double",
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            Numeric::F32 => 4,
            Numeric::F64 => 8,
        }
    }

    /// Single-letter code used in structural fingerprints.
    pub fn code(self) -> char {
        match self {
            Numeric::F32 => 'f',
            Numeric::F64 => 'd',
        }
    }
}

/// Identifies a device buffer owned by the external runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Dense storage order of a matrix operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixLayout {
    RowMajor,
    ColMajor,
}

/// Strided window over a vector buffer.
///
/// A range is a view with `stride == 1` and nonzero `start`; a slice has
/// `stride > 1`. Plain vectors are `start == 0, stride == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorView {
    pub buffer: BufferId,
    pub numeric: Numeric,
    pub start: usize,
    pub stride: usize,
    pub len: usize,
}

impl VectorView {
    pub fn contiguous(buffer: BufferId, numeric: Numeric, len: usize) -> Self {
        VectorView {
            buffer,
            numeric,
            start: 0,
            stride: 1,
            len,
        }
    }

    pub fn range(buffer: BufferId, numeric: Numeric, start: usize, len: usize) -> Self {
        VectorView {
            buffer,
            numeric,
            start,
            stride: 1,
            len,
        }
    }

    pub fn slice(
        buffer: BufferId,
        numeric: Numeric,
        start: usize,
        stride: usize,
        len: usize,
    ) -> Self {
        VectorView {
            buffer,
            numeric,
            start,
            stride,
            len,
        }
    }
}

/// Dense matrix operand. Storage is unpadded: the leading dimension equals
/// the row or column count given by `layout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixView {
    pub buffer: BufferId,
    pub numeric: Numeric,
    pub rows: usize,
    pub cols: usize,
    pub layout: MatrixLayout,
}

impl MatrixView {
    pub fn new(
        buffer: BufferId,
        numeric: Numeric,
        rows: usize,
        cols: usize,
        layout: MatrixLayout,
    ) -> Self {
        MatrixView {
            buffer,
            numeric,
            rows,
            cols,
            layout,
        }
    }
}

/// One side of a statement node.
///
/// The union is closed: every consumer matches exhaustively, so adding a
/// variant is a compile-visible change across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Immediate scalar passed by value at enqueue time.
    HostScalar(f64),
    /// Scalar living in a device buffer.
    DeviceScalar { buffer: BufferId, numeric: Numeric },
    Vector(VectorView),
    Matrix(MatrixView),
    /// Reference to a later node in the same statement.
    Node(usize),
    /// Placeholder for the unused side of a unary node.
    Empty,
}

impl Operand {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Operand::Node(_) | Operand::Empty)
    }

    /// Element type of a leaf operand; `None` for host scalars (which adopt
    /// the statement's type), subtree references, and empty sides.
    pub fn numeric(&self) -> Option<Numeric> {
        match self {
            Operand::DeviceScalar { numeric, .. } => Some(*numeric),
            Operand::Vector(v) => Some(v.numeric),
            Operand::Matrix(m) => Some(m.numeric),
            Operand::HostScalar(_) | Operand::Node(_) | Operand::Empty => None,
        }
    }
}

impl From<VectorView> for Operand {
    fn from(view: VectorView) -> Self {
        Operand::Vector(view)
    }
}

impl From<MatrixView> for Operand {
    fn from(view: MatrixView) -> Self {
        Operand::Matrix(view)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::HostScalar(value)
    }
}

/// Operation carried by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// `target = rhs`, root only.
    Assign,
    /// `target += rhs`, root only.
    AddAssign,
    /// `target -= rhs`, root only.
    SubAssign,
    Add,
    Sub,
    /// Multiplication by a scalar. Construction keeps the vector/matrix side
    /// on the left, so `alpha * v` and `v * alpha` share one shape.
    Mult,
    /// Division by a scalar.
    Div,
    /// Unary transpose of a matrix operand (uses `lhs` only).
    Trans,
    /// Reduction marker for scalar targets.
    InnerProd,
    /// Reduction marker for vector targets.
    MatVecProd,
    /// Reduction marker for matrix targets.
    MatMatProd,
}

impl Op {
    pub fn is_assignment(self) -> bool {
        matches!(self, Op::Assign | Op::AddAssign | Op::SubAssign)
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Op::Trans)
    }

    /// Reduction markers split a statement into a parallel accumulation and
    /// a finalization part.
    pub fn is_reduction_marker(self) -> bool {
        matches!(self, Op::InnerProd | Op::MatVecProd | Op::MatMatProd)
    }

    /// Token used in structural fingerprints and error messages.
    pub fn token(self) -> &'static str {
        match self {
            Op::Assign => "=",
            Op::AddAssign => "+=",
            Op::SubAssign => "-=",
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mult => "*",
            Op::Div => "/",
            Op::Trans => "'",
            Op::InnerProd => "ip",
            Op::MatVecProd => "mv",
            Op::MatMatProd => "mm",
        }
    }
}

/// One node of the flat statement arena.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatementNode {
    pub op: Op,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl StatementNode {
    pub fn new(op: Op, lhs: Operand, rhs: Operand) -> Self {
        StatementNode { op, lhs, rhs }
    }

    /// Unary node; the right side stays empty.
    pub fn unary(op: Op, lhs: Operand) -> Self {
        StatementNode {
            op,
            lhs,
            rhs: Operand::Empty,
        }
    }
}

/// A validated assignment statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    nodes: Vec<StatementNode>,
    numeric: Numeric,
}

impl Statement {
    /// Validates and wraps a node sequence.
    ///
    /// Scalar multiplications normalize first: a scalar on the left of a
    /// `Mult` swaps to the right, so `alpha * v` and `v * alpha` share one
    /// shape. Checked invariants: the arena is non-empty; node 0 carries the
    /// only assignment operation and its left side is an addressable target;
    /// every subtree reference points to a strictly later in-bounds node
    /// (which rules out cycles); unary nodes have an empty right side and
    /// binary nodes do not; all typed leaves agree on one element type.
    pub fn new(mut nodes: Vec<StatementNode>) -> GeneratorResult<Self> {
        for node in &mut nodes {
            let scalar_left = matches!(
                node.lhs,
                Operand::HostScalar(_) | Operand::DeviceScalar { .. }
            );
            let tensor_right = matches!(
                node.rhs,
                Operand::Vector(_) | Operand::Matrix(_) | Operand::Node(_)
            );
            if node.op == Op::Mult && scalar_left && tensor_right {
                std::mem::swap(&mut node.lhs, &mut node.rhs);
            }
        }

        let root = nodes
            .first()
            .ok_or_else(|| GeneratorError::unsupported("empty statement"))?;
        if !root.op.is_assignment() {
            return Err(GeneratorError::unsupported(format!(
                "root operation `{}` is not an assignment",
                root.op.token()
            )));
        }
        let numeric = match &root.lhs {
            Operand::DeviceScalar { numeric, .. } => *numeric,
            Operand::Vector(v) => v.numeric,
            Operand::Matrix(m) => m.numeric,
            Operand::HostScalar(_) | Operand::Node(_) | Operand::Empty => {
                return Err(GeneratorError::unsupported(
                    "assignment target must be a device scalar, vector, or matrix",
                ))
            }
        };

        for (index, node) in nodes.iter().enumerate() {
            if index > 0 && node.op.is_assignment() {
                return Err(GeneratorError::unsupported(format!(
                    "assignment `{}` below the root at node {index}",
                    node.op.token()
                )));
            }
            if node.op.is_unary() {
                if node.rhs != Operand::Empty {
                    return Err(GeneratorError::unsupported(format!(
                        "unary `{}` at node {index} carries a right operand",
                        node.op.token()
                    )));
                }
            } else if node.rhs == Operand::Empty {
                return Err(GeneratorError::unsupported(format!(
                    "binary `{}` at node {index} is missing its right operand",
                    node.op.token()
                )));
            }
            if node.lhs == Operand::Empty {
                return Err(GeneratorError::unsupported(format!(
                    "node {index} has an empty left operand"
                )));
            }
            for operand in [&node.lhs, &node.rhs] {
                match operand {
                    Operand::Node(target) => {
                        if *target <= index || *target >= nodes.len() {
                            return Err(GeneratorError::unsupported(format!(
                                "node {index} references node {target}, which is not a later node"
                            )));
                        }
                    }
                    other => {
                        if let Some(leaf_numeric) = other.numeric() {
                            if leaf_numeric != numeric {
                                return Err(GeneratorError::unsupported(
                                    "operands mix f32 and f64 element types",
                                ));
                            }
                        }
                    }
                }
            }
        }

        Ok(Statement { nodes, numeric })
    }

    pub fn nodes(&self) -> &[StatementNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &StatementNode {
        &self.nodes[index]
    }

    pub fn root(&self) -> &StatementNode {
        &self.nodes[0]
    }

    /// The assignment target (always a leaf, by construction).
    pub fn target(&self) -> &Operand {
        &self.nodes[0].lhs
    }

    /// Element type of the statement, taken from the target.
    pub fn numeric(&self) -> Numeric {
        self.numeric
    }

    /// Number of nodes whose operation equals `op`.
    pub fn count_op(&self, op: Op) -> usize {
        self.nodes.iter().filter(|node| node.op == op).count()
    }
}
