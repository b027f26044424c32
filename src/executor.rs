//! Composite fallback: runs one vector statement as a short sequence of
//! stock fused primitives.
//!
//! Statements kept off the generation path decompose recursively: a two-term
//! sum or difference dispatches one fused call, scalar scalings fold into
//! that call's coefficients, and any deeper subtree lands in a transient
//! vector first. Every transient is owned by a drop guard, so a failure in
//! the middle of the recursion still releases it.

use crate::error::{GeneratorError, GeneratorResult};
use crate::runtime::{Coeff, Temporary, VectorPrimitives};
use crate::statement::{Op, Operand, Statement, StatementNode, VectorView};

/// Runs `statement` against the fused primitives.
///
/// The target must be a vector; the right side may nest sums, differences,
/// and scalar scalings to any depth. Anything else comes back as
/// [`GeneratorError::UnsupportedShape`].
pub fn execute<P: VectorPrimitives + ?Sized>(
    primitives: &P,
    statement: &Statement,
) -> GeneratorResult<()> {
    let target = match statement.target() {
        Operand::Vector(view) => *view,
        _ => {
            return Err(GeneratorError::unsupported(
                "composite execution supports vector targets only",
            ))
        }
    };
    let root = statement.root();
    match root.op {
        Op::Assign => assign_operand(primitives, statement, &target, &root.rhs),
        Op::AddAssign => accumulate_operand(primitives, statement, &target, &root.rhs, false),
        Op::SubAssign => accumulate_operand(primitives, statement, &target, &root.rhs, true),
        other => Err(GeneratorError::mismatch(format!(
            "composite root `{}` is not an assignment",
            other.token()
        ))),
    }
}

/// One side of a fused call: the vector it reads and the coefficient applied
/// to it, plus the guard when the vector is a transient.
struct ResolvedSide<'a, P: VectorPrimitives + ?Sized> {
    coeff: Coeff,
    view: VectorView,
    guard: Option<Temporary<'a, P>>,
}

impl<'a, P: VectorPrimitives + ?Sized> ResolvedSide<'a, P> {
    fn release(self) -> GeneratorResult<()> {
        match self.guard {
            Some(temporary) => temporary.release(),
            None => Ok(()),
        }
    }

    /// Propagates `result`, releasing the transient eagerly on success and
    /// through its drop guard on failure.
    fn release_after(self, result: GeneratorResult<()>) -> GeneratorResult<()> {
        match result {
            Ok(()) => self.release(),
            Err(err) => Err(err),
        }
    }
}

/// `target = operand`.
fn assign_operand<P: VectorPrimitives + ?Sized>(
    primitives: &P,
    statement: &Statement,
    target: &VectorView,
    operand: &Operand,
) -> GeneratorResult<()> {
    match operand {
        Operand::Vector(view) => primitives.av(target, Coeff::unit(), view),
        Operand::Node(index) => assign_node(primitives, statement, target, *index),
        Operand::HostScalar(_) | Operand::DeviceScalar { .. } => Err(GeneratorError::unsupported(
            "scalar assigned to a vector target",
        )),
        Operand::Matrix(_) => Err(GeneratorError::unsupported(
            "matrix assigned to a vector target",
        )),
        Operand::Empty => Err(GeneratorError::mismatch(
            "empty right side in a composite assignment",
        )),
    }
}

/// `target = subtree at index`.
fn assign_node<P: VectorPrimitives + ?Sized>(
    primitives: &P,
    statement: &Statement,
    target: &VectorView,
    index: usize,
) -> GeneratorResult<()> {
    let node = statement.node(index);
    match node.op {
        Op::Add | Op::Sub => combine(primitives, statement, target, node, false, false),
        Op::Mult | Op::Div => {
            let side = resolve_node(primitives, statement, index)?;
            let outcome = primitives.av(target, side.coeff, &side.view);
            side.release_after(outcome)
        }
        other => Err(GeneratorError::unsupported(format!(
            "operation `{}` in a fused vector expression",
            other.token()
        ))),
    }
}

/// `target += operand` (or `-=` when `negate` is set).
fn accumulate_operand<P: VectorPrimitives + ?Sized>(
    primitives: &P,
    statement: &Statement,
    target: &VectorView,
    operand: &Operand,
    negate: bool,
) -> GeneratorResult<()> {
    match operand {
        // target = 1*target + (+-1)*v; the primitives take the aliasing.
        Operand::Vector(view) => {
            let coeff = if negate {
                Coeff::unit().flipped()
            } else {
                Coeff::unit()
            };
            primitives.avbv(target, Coeff::unit(), target, coeff, view)
        }
        Operand::Node(index) => {
            let node = statement.node(*index);
            match node.op {
                Op::Add | Op::Sub => combine(primitives, statement, target, node, negate, true),
                Op::Mult | Op::Div => {
                    let side = resolve_node(primitives, statement, *index)?;
                    let coeff = if negate { side.coeff.flipped() } else { side.coeff };
                    let outcome = primitives.avbv(target, Coeff::unit(), target, coeff, &side.view);
                    side.release_after(outcome)
                }
                other => Err(GeneratorError::unsupported(format!(
                    "operation `{}` in a fused vector accumulation",
                    other.token()
                ))),
            }
        }
        Operand::HostScalar(_) | Operand::DeviceScalar { .. } => Err(GeneratorError::unsupported(
            "scalar accumulated into a vector target",
        )),
        Operand::Matrix(_) => Err(GeneratorError::unsupported(
            "matrix accumulated into a vector target",
        )),
        Operand::Empty => Err(GeneratorError::mismatch(
            "empty right side in a composite accumulation",
        )),
    }
}

/// Dispatches one fused call for a sum or difference node. `negate` flips
/// both sides (a subtracted accumulation), `accumulate` adds into the target
/// instead of overwriting it.
fn combine<P: VectorPrimitives + ?Sized>(
    primitives: &P,
    statement: &Statement,
    target: &VectorView,
    node: &StatementNode,
    negate: bool,
    accumulate: bool,
) -> GeneratorResult<()> {
    let lhs = resolve_side(primitives, statement, &node.lhs)?;
    let rhs = match resolve_side(primitives, statement, &node.rhs) {
        Ok(side) => side,
        // The left guard drops here and releases its transient.
        Err(err) => return Err(err),
    };

    let mut alpha = lhs.coeff;
    let mut beta = rhs.coeff;
    if node.op == Op::Sub {
        beta = beta.flipped();
    }
    if negate {
        alpha = alpha.flipped();
        beta = beta.flipped();
    }

    let outcome = if accumulate {
        primitives.avbv_v(target, alpha, &lhs.view, beta, &rhs.view)
    } else {
        primitives.avbv(target, alpha, &lhs.view, beta, &rhs.view)
    };
    match outcome {
        Ok(()) => {
            lhs.release()?;
            rhs.release()
        }
        Err(err) => Err(err),
    }
}

/// Resolves one operand of a sum or difference to a coefficient and a view.
fn resolve_side<'a, P: VectorPrimitives + ?Sized>(
    primitives: &'a P,
    statement: &Statement,
    operand: &Operand,
) -> GeneratorResult<ResolvedSide<'a, P>> {
    match operand {
        Operand::Vector(view) => Ok(ResolvedSide {
            coeff: Coeff::unit(),
            view: *view,
            guard: None,
        }),
        Operand::Node(index) => resolve_node(primitives, statement, *index),
        Operand::HostScalar(_) | Operand::DeviceScalar { .. } => Err(GeneratorError::unsupported(
            "scalar where the expression needs a vector",
        )),
        Operand::Matrix(_) => Err(GeneratorError::unsupported(
            "matrix operand in a vector expression",
        )),
        Operand::Empty => Err(GeneratorError::mismatch(
            "empty operand in a vector expression",
        )),
    }
}

fn resolve_node<'a, P: VectorPrimitives + ?Sized>(
    primitives: &'a P,
    statement: &Statement,
    index: usize,
) -> GeneratorResult<ResolvedSide<'a, P>> {
    let node = statement.node(index);
    match node.op {
        Op::Mult | Op::Div => {
            let coeff = scalar_coeff(&node.rhs, node.op == Op::Div)?;
            match &node.lhs {
                Operand::Vector(view) => Ok(ResolvedSide {
                    coeff,
                    view: *view,
                    guard: None,
                }),
                // A scaled subtree is evaluated first; the scale rides along
                // as the coefficient of the transient.
                Operand::Node(inner) => {
                    let materialized = materialize(primitives, statement, *inner)?;
                    Ok(ResolvedSide {
                        coeff,
                        view: materialized.view,
                        guard: materialized.guard,
                    })
                }
                _ => Err(GeneratorError::unsupported(
                    "vector scaling needs a vector left operand",
                )),
            }
        }
        Op::Add | Op::Sub => materialize(primitives, statement, index),
        other => Err(GeneratorError::unsupported(format!(
            "operation `{}` in a fused vector expression",
            other.token()
        ))),
    }
}

/// Scalar factor of a `Mult`/`Div` node.
fn scalar_coeff(operand: &Operand, divide: bool) -> GeneratorResult<Coeff> {
    let coeff = match operand {
        Operand::HostScalar(value) => Coeff::host(*value),
        Operand::DeviceScalar { buffer, .. } => Coeff::device(*buffer),
        _ => {
            return Err(GeneratorError::unsupported(
                "vector scaling needs a scalar right operand",
            ))
        }
    };
    Ok(if divide { coeff.dividing() } else { coeff })
}

/// Evaluates the subtree at `index` into a fresh transient vector.
fn materialize<'a, P: VectorPrimitives + ?Sized>(
    primitives: &'a P,
    statement: &Statement,
    index: usize,
) -> GeneratorResult<ResolvedSide<'a, P>> {
    let len = subtree_vector_len(statement, index).ok_or_else(|| {
        GeneratorError::unsupported("vector subexpression contains no vector operand")
    })?;
    let temporary = Temporary::allocate(primitives, statement.numeric(), len)?;
    let view = *temporary.view();
    match assign_node(primitives, statement, &view, index) {
        Ok(()) => Ok(ResolvedSide {
            coeff: Coeff::unit(),
            view,
            guard: Some(temporary),
        }),
        // The transient drops with the guard.
        Err(err) => Err(err),
    }
}

/// Length of the first vector reachable from the subtree at `index`.
fn subtree_vector_len(statement: &Statement, index: usize) -> Option<usize> {
    let node = statement.node(index);
    for operand in [&node.lhs, &node.rhs] {
        match operand {
            Operand::Vector(view) => return Some(view.len),
            Operand::Node(target) => {
                if let Some(len) = subtree_vector_len(statement, *target) {
                    return Some(len);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::runtime::BufferAlloc;
    use crate::statement::{BufferId, MatrixLayout, MatrixView, Numeric};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Call {
        Av {
            target: BufferId,
            alpha: Coeff,
            x: BufferId,
        },
        Avbv {
            target: BufferId,
            alpha: Coeff,
            x: BufferId,
            beta: Coeff,
            y: BufferId,
        },
        AvbvV {
            target: BufferId,
            alpha: Coeff,
            x: BufferId,
            beta: Coeff,
            y: BufferId,
        },
    }

    /// Records dispatches and tracks transient buffers; optionally fails the
    /// n-th primitive call.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        next_buffer: Mutex<u64>,
        live: Mutex<Vec<BufferId>>,
        released: Mutex<Vec<BufferId>>,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn failing_at(call: usize) -> Self {
            Recorder {
                fail_at: Some(call),
                ..Recorder::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn live(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        fn released(&self) -> Vec<BufferId> {
            self.released.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> GeneratorResult<()> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            if self.fail_at == Some(calls.len()) {
                return Err(GeneratorError::mismatch("injected primitive failure"));
            }
            Ok(())
        }
    }

    impl BufferAlloc for Recorder {
        fn allocate_vector(&self, _numeric: Numeric, _len: usize) -> GeneratorResult<BufferId> {
            let mut next = self.next_buffer.lock().unwrap();
            *next += 1;
            let id = BufferId(1000 + *next);
            self.live.lock().unwrap().push(id);
            Ok(id)
        }

        fn release_vector(&self, buffer: BufferId) -> GeneratorResult<()> {
            let mut live = self.live.lock().unwrap();
            match live.iter().position(|id| *id == buffer) {
                Some(index) => {
                    live.remove(index);
                    self.released.lock().unwrap().push(buffer);
                    Ok(())
                }
                None => Err(GeneratorError::mismatch("released a buffer that is not live")),
            }
        }
    }

    impl VectorPrimitives for Recorder {
        fn av(&self, target: &VectorView, alpha: Coeff, x: &VectorView) -> GeneratorResult<()> {
            self.record(Call::Av {
                target: target.buffer,
                alpha,
                x: x.buffer,
            })
        }

        fn avbv(
            &self,
            target: &VectorView,
            alpha: Coeff,
            x: &VectorView,
            beta: Coeff,
            y: &VectorView,
        ) -> GeneratorResult<()> {
            self.record(Call::Avbv {
                target: target.buffer,
                alpha,
                x: x.buffer,
                beta,
                y: y.buffer,
            })
        }

        fn avbv_v(
            &self,
            target: &VectorView,
            alpha: Coeff,
            x: &VectorView,
            beta: Coeff,
            y: &VectorView,
        ) -> GeneratorResult<()> {
            self.record(Call::AvbvV {
                target: target.buffer,
                alpha,
                x: x.buffer,
                beta,
                y: y.buffer,
            })
        }
    }

    fn vec_op(id: u64) -> Operand {
        VectorView::contiguous(BufferId(id), Numeric::F32, 32).into()
    }

    fn stmt(nodes: Vec<StatementNode>) -> Statement {
        Statement::new(nodes).unwrap()
    }

    #[test]
    fn plain_copy_is_a_unit_av() {
        let recorder = Recorder::default();
        let statement = stmt(vec![StatementNode::new(Op::Assign, vec_op(0), vec_op(1))]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Av {
                target: BufferId(0),
                alpha: Coeff::unit(),
                x: BufferId(1),
            }]
        );
        assert_eq!(recorder.live(), 0);
    }

    #[test]
    fn two_term_sum_dispatches_one_fused_call() {
        let recorder = Recorder::default();
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Add, vec_op(1), vec_op(2)),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Avbv {
                target: BufferId(0),
                alpha: Coeff::unit(),
                x: BufferId(1),
                beta: Coeff::unit(),
                y: BufferId(2),
            }]
        );
        assert_eq!(recorder.live(), 0);
    }

    #[test]
    fn scaled_difference_folds_both_coefficients() {
        let recorder = Recorder::default();
        // x = 2*u - v/4
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Sub, Operand::Node(2), Operand::Node(3)),
            StatementNode::new(Op::Mult, vec_op(1), 2.0.into()),
            StatementNode::new(Op::Div, vec_op(2), 4.0.into()),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Avbv {
                target: BufferId(0),
                alpha: Coeff::host(2.0),
                x: BufferId(1),
                beta: Coeff::host(4.0).dividing().flipped(),
                y: BufferId(2),
            }]
        );
    }

    #[test]
    fn device_scalar_coefficient_travels_by_buffer() {
        let recorder = Recorder::default();
        // x = u * s with s on the device
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(
                Op::Mult,
                vec_op(1),
                Operand::DeviceScalar {
                    buffer: BufferId(9),
                    numeric: Numeric::F32,
                },
            ),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Av {
                target: BufferId(0),
                alpha: Coeff::device(BufferId(9)),
                x: BufferId(1),
            }]
        );
    }

    #[test]
    fn scaled_subtree_lands_in_a_transient() {
        let recorder = Recorder::default();
        // x = (u + v) * 2
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Mult, Operand::Node(2), 2.0.into()),
            StatementNode::new(Op::Add, vec_op(1), vec_op(2)),
        ]);
        execute(&recorder, &statement).unwrap();
        let transient = BufferId(1001);
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Avbv {
                    target: transient,
                    alpha: Coeff::unit(),
                    x: BufferId(1),
                    beta: Coeff::unit(),
                    y: BufferId(2),
                },
                Call::Av {
                    target: BufferId(0),
                    alpha: Coeff::host(2.0),
                    x: transient,
                },
            ]
        );
        assert_eq!(recorder.released(), vec![transient]);
        assert_eq!(recorder.live(), 0);
    }

    #[test]
    fn accumulation_reuses_the_target() {
        let recorder = Recorder::default();
        // x += 3*u
        let statement = stmt(vec![
            StatementNode::new(Op::AddAssign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Mult, vec_op(1), 3.0.into()),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Avbv {
                target: BufferId(0),
                alpha: Coeff::unit(),
                x: BufferId(0),
                beta: Coeff::host(3.0),
                y: BufferId(1),
            }]
        );
    }

    #[test]
    fn subtracting_accumulation_flips_both_sides() {
        let recorder = Recorder::default();
        // x -= u + v
        let statement = stmt(vec![
            StatementNode::new(Op::SubAssign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Add, vec_op(1), vec_op(2)),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::AvbvV {
                target: BufferId(0),
                alpha: Coeff::unit().flipped(),
                x: BufferId(1),
                beta: Coeff::unit().flipped(),
                y: BufferId(2),
            }]
        );
    }

    #[test]
    fn subtracting_a_difference_restores_the_sign() {
        let recorder = Recorder::default();
        // x -= u - v, so v comes back positive
        let statement = stmt(vec![
            StatementNode::new(Op::SubAssign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Sub, vec_op(1), vec_op(2)),
        ]);
        execute(&recorder, &statement).unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::AvbvV {
                target: BufferId(0),
                alpha: Coeff::unit().flipped(),
                x: BufferId(1),
                beta: Coeff::unit(),
                y: BufferId(2),
            }]
        );
    }

    #[test]
    fn nested_transients_release_inside_out() {
        let recorder = Recorder::default();
        // x = ((u + v)*2 + w) - u/4
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Sub, Operand::Node(2), Operand::Node(5)),
            StatementNode::new(Op::Add, Operand::Node(3), vec_op(3)),
            StatementNode::new(Op::Mult, Operand::Node(4), 2.0.into()),
            StatementNode::new(Op::Add, vec_op(1), vec_op(2)),
            StatementNode::new(Op::Div, vec_op(1), 4.0.into()),
        ]);
        execute(&recorder, &statement).unwrap();

        let outer = BufferId(1001);
        let inner = BufferId(1002);
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Avbv {
                    target: inner,
                    alpha: Coeff::unit(),
                    x: BufferId(1),
                    beta: Coeff::unit(),
                    y: BufferId(2),
                },
                Call::Avbv {
                    target: outer,
                    alpha: Coeff::host(2.0),
                    x: inner,
                    beta: Coeff::unit(),
                    y: BufferId(3),
                },
                Call::Avbv {
                    target: BufferId(0),
                    alpha: Coeff::unit(),
                    x: outer,
                    beta: Coeff::host(4.0).dividing().flipped(),
                    y: BufferId(1),
                },
            ]
        );
        assert_eq!(recorder.released(), vec![inner, outer]);
        assert_eq!(recorder.live(), 0);
    }

    #[test]
    fn failed_dispatch_still_releases_the_transient() {
        let recorder = Recorder::failing_at(2);
        // x = (u + v) * 2; the second call (the av into x) fails
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::Mult, Operand::Node(2), 2.0.into()),
            StatementNode::new(Op::Add, vec_op(1), vec_op(2)),
        ]);
        let err = execute(&recorder, &statement).unwrap_err();
        assert!(matches!(err, GeneratorError::InternalMismatch { .. }));
        assert_eq!(recorder.released(), vec![BufferId(1001)]);
        assert_eq!(recorder.live(), 0);
    }

    #[test]
    fn rejects_non_vector_targets() {
        let recorder = Recorder::default();
        let matrix = MatrixView::new(BufferId(0), Numeric::F32, 4, 4, MatrixLayout::RowMajor);
        let statement = stmt(vec![StatementNode::new(
            Op::Assign,
            matrix.into(),
            MatrixView::new(BufferId(1), Numeric::F32, 4, 4, MatrixLayout::RowMajor).into(),
        )]);
        let err = execute(&recorder, &statement).unwrap_err();
        assert!(matches!(err, GeneratorError::UnsupportedShape { .. }));
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn rejects_reduction_markers() {
        let recorder = Recorder::default();
        let statement = stmt(vec![
            StatementNode::new(Op::Assign, vec_op(0), Operand::Node(1)),
            StatementNode::new(Op::InnerProd, vec_op(1), vec_op(2)),
        ]);
        let err = execute(&recorder, &statement).unwrap_err();
        assert!(matches!(err, GeneratorError::UnsupportedShape { .. }));
        assert!(recorder.calls().is_empty());
    }
}
