//! Tiled matrix-product template.
//!
//! One statement per kernel. Each work group computes an `ml x nl` tile of
//! the result, stepping over the shared dimension in `kl` slices; each work
//! item owns an `ms x ns` register block and consumes `ks` slice elements
//! per inner iteration. Operands are either streamed (per-work-item global
//! pointers walking the packed storage axis in SIMD units) or staged through
//! local memory by the whole group.
//!
//! All indexing happens in stored coordinates: a transposed operand swaps
//! its row and column meaning once, up front, and every later formula reads
//! storage order directly. SIMD packing follows the storage layout, row
//! major along stored columns, column major along stored rows.

use smallvec::SmallVec;

use crate::classify::Family;
use crate::error::{GeneratorError, GeneratorResult};
use crate::mapping::{ArgSlot, BoundOperand, OperandMap, Side, SizeDim};
use crate::profiles::MatrixProductProfile;
use crate::statement::{MatrixLayout, Op, Operand, Statement};

use super::utils::{device_type, lane_suffix, push_line};
use super::{entry_name, Chunk, GridRecipe, KernelPlan};

/// Register coordinates of stored element `(a, b)` under `layout`:
/// `(p, q, lane)` with the packed axis divided into SIMD units.
pub(crate) fn register_of(
    layout: MatrixLayout,
    a: usize,
    b: usize,
    width: usize,
) -> (usize, usize, usize) {
    match layout {
        MatrixLayout::RowMajor => (a, b / width, b % width),
        MatrixLayout::ColMajor => (a / width, b, a % width),
    }
}

/// One product operand in stored coordinates.
struct MatOperand {
    tag: &'static str,
    name: String,
    layout: MatrixLayout,
    transposed: bool,
    shared: bool,
    /// Grid dimension indexing this operand's non-shared axis.
    grid_dim: usize,
    /// Small and large block extents along the non-shared axis (`ms`/`ml`
    /// for the left operand, `ns`/`nl` for the right).
    other: usize,
    other_large: usize,
    other_sym: char,
    k_small: usize,
    k_large: usize,
}

impl MatOperand {
    fn stored_syms(&self) -> (char, char) {
        let base = if self.tag == "lhs" {
            (self.other_sym, 'K')
        } else {
            ('K', self.other_sym)
        };
        if self.transposed {
            (base.1, base.0)
        } else {
            base
        }
    }

    fn stored_small(&self) -> (usize, usize) {
        let base = if self.tag == "lhs" {
            (self.other, self.k_small)
        } else {
            (self.k_small, self.other)
        };
        if self.transposed {
            (base.1, base.0)
        } else {
            base
        }
    }

    fn stored_large(&self) -> (usize, usize) {
        let base = if self.tag == "lhs" {
            (self.other_large, self.k_large)
        } else {
            (self.k_large, self.other_large)
        };
        if self.transposed {
            (base.1, base.0)
        } else {
            base
        }
    }

    /// Whether the packed storage axis is the shared dimension.
    fn packed_is_k(&self) -> bool {
        let (rows, cols) = self.stored_syms();
        match self.layout {
            MatrixLayout::RowMajor => cols == 'K',
            MatrixLayout::ColMajor => rows == 'K',
        }
    }

    /// Stored small coordinates of the logical element `(other_off, k_off)`.
    fn stored_coords(&self, other_off: usize, k_off: usize) -> (usize, usize) {
        let base = if self.tag == "lhs" {
            (other_off, k_off)
        } else {
            (k_off, other_off)
        };
        if self.transposed {
            (base.1, base.0)
        } else {
            base
        }
    }

    /// Register expression for the logical element, lane-extracted for
    /// streamed operands and a plain scalar for staged ones.
    fn elem(&self, other_off: usize, k_off: usize, width: usize) -> String {
        let (a, b) = self.stored_coords(other_off, k_off);
        if self.shared {
            format!("val_{}_{}_{}", self.tag, a, b)
        } else {
            let (p, q, lane) = register_of(self.layout, a, b, width);
            format!("val_{}_{}_{}{}", self.tag, p, q, lane_suffix(width, lane))
        }
    }

    /// Whole-register expression covering all lanes of the packed axis at
    /// the given base coordinates.
    fn whole_register(&self, other_base: usize, k_off: usize, width: usize) -> String {
        let (a, b) = self.stored_coords(other_base, k_off);
        let (p, q, _) = register_of(self.layout, a, b, width);
        format!("val_{}_{}_{}", self.tag, p, q)
    }
}

fn exact_div(
    value: usize,
    width: usize,
    what: &str,
    repr: &str,
) -> GeneratorResult<usize> {
    if value % width != 0 {
        return Err(GeneratorError::invalid_profile(
            repr,
            format!("{what} ({value}) must be divisible by the SIMD width {width}"),
        ));
    }
    Ok(value / width)
}

fn sym_div(sym: char, width: usize) -> String {
    if width == 1 {
        sym.to_string()
    } else {
        format!("({sym}/{width})")
    }
}

/// Small block extents in SIMD units. The packed axis of a streamed operand
/// shrinks by the width; staged operands keep scalar registers.
fn transformed_small(x: &MatOperand, width: usize, repr: &str) -> GeneratorResult<(usize, usize)> {
    let (s1, s2) = x.stored_small();
    if x.shared {
        return Ok((s1, s2));
    }
    match x.layout {
        MatrixLayout::RowMajor => Ok((s1, exact_div(s2, width, "streamed small block", repr)?)),
        MatrixLayout::ColMajor => Ok((exact_div(s1, width, "streamed small block", repr)?, s2)),
    }
}

/// Large block extents in SIMD units, for the cooperative fetch bounds.
fn transformed_large(x: &MatOperand, width: usize, repr: &str) -> GeneratorResult<(usize, usize)> {
    let (l1, l2) = x.stored_large();
    match x.layout {
        MatrixLayout::RowMajor => Ok((l1, exact_div(l2, width, "staged large block", repr)?)),
        MatrixLayout::ColMajor => Ok((exact_div(l1, width, "staged large block", repr)?, l2)),
    }
}

fn collapses(x: &MatOperand, res_layout: MatrixLayout, width: usize) -> bool {
    if width == 1 || x.shared || x.packed_is_k() {
        return false;
    }
    match res_layout {
        MatrixLayout::RowMajor => x.tag == "rhs",
        MatrixLayout::ColMajor => x.tag == "lhs",
    }
}

struct ProductShape {
    res_name: String,
    res_layout: MatrixLayout,
    res_index: usize,
    lhs_index: usize,
    rhs_index: usize,
    lhs: MatOperand,
    rhs: MatOperand,
}

/// Resolves the statement into the three operand descriptors, rejecting
/// every shape the template cannot express.
fn resolve_shape(
    statement: &Statement,
    stmt_index: usize,
    map: &OperandMap,
    profile: &MatrixProductProfile,
) -> GeneratorResult<ProductShape> {
    if statement.root().op != Op::Assign {
        return Err(GeneratorError::unsupported(
            "matrix product supports plain assignment only",
        ));
    }
    let marker = statement
        .nodes()
        .iter()
        .position(|node| node.op == Op::MatMatProd)
        .ok_or_else(|| GeneratorError::mismatch("product chunk without a product node"))?;
    if statement.root().rhs != Operand::Node(marker) {
        return Err(GeneratorError::unsupported(
            "matrix product must form the entire right side",
        ));
    }

    let res_index = map
        .binding_index(stmt_index, 0, Side::Lhs)
        .ok_or_else(|| GeneratorError::mismatch("product target missing from the operand map"))?;
    let res_binding = map.binding(res_index);
    let res_layout = match &res_binding.operand {
        BoundOperand::Matrix(view) => view.layout,
        _ => return Err(GeneratorError::mismatch("product target bound to a non-matrix")),
    };

    let side_operand = |side: Side| -> GeneratorResult<(usize, String, MatrixLayout, bool)> {
        let operand = match side {
            Side::Lhs => &statement.node(marker).lhs,
            Side::Rhs => &statement.node(marker).rhs,
        };
        let (node, transposed) = match operand {
            Operand::Matrix(_) => (marker, false),
            Operand::Node(target) if statement.node(*target).op == Op::Trans => {
                match &statement.node(*target).lhs {
                    Operand::Matrix(_) => (*target, true),
                    _ => {
                        return Err(GeneratorError::unsupported(
                            "transpose of a non-matrix in a matrix product",
                        ))
                    }
                }
            }
            _ => {
                return Err(GeneratorError::unsupported(
                    "matrix product operands must be matrices",
                ))
            }
        };
        let lookup_side = if node == marker { side } else { Side::Lhs };
        let index = map
            .binding_index(stmt_index, node, lookup_side)
            .ok_or_else(|| GeneratorError::mismatch("product operand missing from the operand map"))?;
        let binding = map.binding(index);
        match &binding.operand {
            BoundOperand::Matrix(view) => {
                Ok((index, binding.name.clone(), view.layout, transposed))
            }
            _ => Err(GeneratorError::mismatch("product operand bound to a non-matrix")),
        }
    };

    let (lhs_index, lhs_name, lhs_layout, lhs_transposed) = side_operand(Side::Lhs)?;
    let (rhs_index, rhs_name, rhs_layout, rhs_transposed) = side_operand(Side::Rhs)?;

    Ok(ProductShape {
        res_name: res_binding.name.clone(),
        res_layout,
        res_index,
        lhs_index,
        rhs_index,
        lhs: MatOperand {
            tag: "lhs",
            name: lhs_name,
            layout: lhs_layout,
            transposed: lhs_transposed,
            shared: profile.use_lhs_shared,
            grid_dim: 0,
            other: profile.ms,
            other_large: profile.ml,
            other_sym: 'M',
            k_small: profile.ks,
            k_large: profile.kl,
        },
        rhs: MatOperand {
            tag: "rhs",
            name: rhs_name,
            layout: rhs_layout,
            transposed: rhs_transposed,
            shared: profile.use_rhs_shared,
            grid_dim: 1,
            other: profile.ns,
            other_large: profile.nl,
            other_sym: 'N',
            k_small: profile.ks,
            k_large: profile.kl,
        },
    })
}

fn emit_streamed_pointers(
    source: &mut String,
    x: &MatOperand,
    width: usize,
    vt: &str,
    repr: &str,
) -> GeneratorResult<()> {
    let (rows_sym, cols_sym) = x.stored_syms();
    let (s1t, s2t) = transformed_small(x, width, repr)?;
    let name = &x.name;
    let tag = x.tag;
    let off = format!("get_global_id({})*{}", x.grid_dim, x.other);
    match x.layout {
        MatrixLayout::RowMajor => {
            let scv = sym_div(cols_sym, width);
            for p in 0..s1t {
                let init = if rows_sym != 'K' {
                    format!("{name} + ({off} + {p})*{scv}")
                } else {
                    let osv = x.other / width;
                    format!("{name} + {p}*{scv} + get_global_id({})*{osv}", x.grid_dim)
                };
                push_line(source, 1, &format!("__global {vt}* ptr_{tag}_{p} = {init};"));
            }
        }
        MatrixLayout::ColMajor => {
            let srv = sym_div(rows_sym, width);
            for q in 0..s2t {
                let init = if cols_sym != 'K' {
                    format!("{name} + ({off} + {q})*{srv}")
                } else {
                    let osv = x.other / width;
                    format!("{name} + get_global_id({})*{osv} + {q}*{srv}", x.grid_dim)
                };
                push_line(source, 1, &format!("__global {vt}* ptr_{tag}_{q} = {init};"));
            }
        }
    }
    Ok(())
}

fn emit_staging_decls(
    source: &mut String,
    x: &MatOperand,
    width: usize,
    t: &str,
) -> GeneratorResult<()> {
    let (l1, l2) = x.stored_large();
    let (rows_sym, cols_sym) = x.stored_syms();
    let tag = x.tag;
    push_line(
        source,
        1,
        &format!("__local {t} {tag}_buf[{}];", (l1 + 1) * (l2 + 1)),
    );
    let group_off = format!("get_group_id({})*{}", x.grid_dim, x.other_large);
    let init = match x.layout {
        MatrixLayout::RowMajor => {
            if rows_sym != 'K' {
                format!("({group_off})*{}", sym_div(cols_sym, width))
            } else {
                format!("get_group_id({})*{}", x.grid_dim, x.other_large / width)
            }
        }
        MatrixLayout::ColMajor => {
            if cols_sym != 'K' {
                format!("({group_off})*{}", sym_div(rows_sym, width))
            } else {
                format!("get_group_id({})*{}", x.grid_dim, x.other_large / width)
            }
        }
    };
    push_line(source, 1, &format!("unsigned int offset_{tag} = {init};"));
    Ok(())
}

fn emit_staged_fetch(
    source: &mut String,
    x: &MatOperand,
    width: usize,
    t: &str,
    vt: &str,
    repr: &str,
) -> GeneratorResult<()> {
    let (rows_sym, cols_sym) = x.stored_syms();
    let (f1, f2) = transformed_large(x, width, repr)?;
    let (_, l2) = x.stored_large();
    let pitch = l2 + 1;
    let tag = x.tag;
    let name = &x.name;
    push_line(
        source,
        2,
        &format!("for (unsigned int i = get_local_id(0); i < {f1}; i += get_local_size(0))"),
    );
    push_line(source, 2, "{");
    push_line(
        source,
        3,
        &format!("for (unsigned int j = get_local_id(1); j < {f2}; j += get_local_size(1))"),
    );
    push_line(source, 3, "{");
    match x.layout {
        MatrixLayout::RowMajor => {
            let scv = sym_div(cols_sym, width);
            push_line(
                source,
                4,
                &format!("{vt} val = {name}[offset_{tag} + i*{scv} + j];"),
            );
            if width == 1 {
                push_line(source, 4, &format!("{tag}_buf[i*{pitch} + j] = val;"));
            } else {
                push_line(
                    source,
                    4,
                    &format!("__local {t}* ptr = {tag}_buf + i*{pitch} + j*{width};"),
                );
                for lane in 0..width {
                    push_line(source, 4, &format!("*ptr++ = val{};", lane_suffix(width, lane)));
                }
            }
        }
        MatrixLayout::ColMajor => {
            let srv = sym_div(rows_sym, width);
            push_line(
                source,
                4,
                &format!("{vt} val = {name}[offset_{tag} + i + j*{srv}];"),
            );
            if width == 1 {
                push_line(source, 4, &format!("{tag}_buf[i*{pitch} + j] = val;"));
            } else {
                push_line(
                    source,
                    4,
                    &format!("__local {t}* ptr = {tag}_buf + (i*{width})*{pitch} + j;"),
                );
                for lane in 0..width {
                    push_line(source, 4, &format!("*ptr = val{};", lane_suffix(width, lane)));
                    push_line(source, 4, &format!("ptr += {pitch};"));
                }
            }
        }
    }
    push_line(source, 3, "}");
    push_line(source, 2, "}");
    Ok(())
}

/// Per-sub-chunk register loads. Streamed pointers walk the packed axis and
/// jump to the next slice when that axis is not the shared one; staged
/// operands index the local tile directly.
fn emit_register_fetch(
    source: &mut String,
    x: &MatOperand,
    width: usize,
    t: &str,
    vt: &str,
    ks: usize,
    repr: &str,
) -> GeneratorResult<()> {
    let tag = x.tag;
    if x.shared {
        let (s1, s2) = x.stored_small();
        let (_, l2) = x.stored_large();
        let pitch = l2 + 1;
        let local = format!("get_local_id({})*{}", x.grid_dim, x.other);
        let (row0, col0) = if (x.tag == "lhs") != x.transposed {
            (local, format!("bs*{ks}"))
        } else {
            (format!("bs*{ks}"), local)
        };
        for p in 0..s1 {
            for q in 0..s2 {
                push_line(
                    source,
                    3,
                    &format!(
                        "{t} val_{tag}_{p}_{q} = {tag}_buf[({row0} + {p})*{pitch} + {col0} + {q}];"
                    ),
                );
            }
        }
        return Ok(());
    }

    let (s1t, s2t) = transformed_small(x, width, repr)?;
    let (rows_sym, cols_sym) = x.stored_syms();
    match x.layout {
        MatrixLayout::RowMajor => {
            for p in 0..s1t {
                for q in 0..s2t {
                    push_line(
                        source,
                        3,
                        &format!("{vt} val_{tag}_{p}_{q} = *ptr_{tag}_{p}++;"),
                    );
                }
            }
            if !x.packed_is_k() {
                let scv = sym_div(cols_sym, width);
                for p in 0..s1t {
                    push_line(source, 3, &format!("ptr_{tag}_{p} += {ks}*{scv} - {s2t};"));
                }
            }
        }
        MatrixLayout::ColMajor => {
            for q in 0..s2t {
                for p in 0..s1t {
                    push_line(
                        source,
                        3,
                        &format!("{vt} val_{tag}_{p}_{q} = *ptr_{tag}_{q}++;"),
                    );
                }
            }
            if !x.packed_is_k() {
                let srv = sym_div(rows_sym, width);
                for q in 0..s2t {
                    push_line(source, 3, &format!("ptr_{tag}_{q} += {ks}*{srv} - {s1t};"));
                }
            }
        }
    }
    Ok(())
}

pub(super) fn generate(
    source: &mut String,
    entry_base: usize,
    statements: &[Statement],
    chunk: &Chunk,
    map: &OperandMap,
    profile: &MatrixProductProfile,
) -> GeneratorResult<Vec<KernelPlan>> {
    let stmt_index = chunk.range.start;
    let statement = &statements[stmt_index];
    let shape = resolve_shape(statement, stmt_index, map, profile)?;
    let repr = profile.repr();

    let v = profile.simd_width;
    let (ms, ks, ns) = (profile.ms, profile.ks, profile.ns);
    let (ml, kl, nl) = (profile.ml, profile.kl, profile.nl);
    let t = device_type(chunk.numeric, 1);
    let vt = device_type(chunk.numeric, v);

    // Result register block in SIMD units.
    let (res_s1, res_s2) = match shape.res_layout {
        MatrixLayout::RowMajor => (ms, exact_div(ns, v, "result small block", &repr)?),
        MatrixLayout::ColMajor => (exact_div(ms, v, "result small block", &repr)?, ns),
    };

    let entry = entry_name(entry_base);
    let params = format!(
        "unsigned int M, unsigned int N, unsigned int K, __global {vt}* {}, __global {vt}* {}, __global {vt}* {}",
        shape.res_name, shape.lhs.name, shape.rhs.name
    );
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::new();
    slots.push(ArgSlot::Size {
        name: "M".to_owned(),
        dim: SizeDim::Rows,
    });
    slots.push(ArgSlot::Size {
        name: "N".to_owned(),
        dim: SizeDim::Cols,
    });
    slots.push(ArgSlot::Size {
        name: "K".to_owned(),
        dim: SizeDim::Inner,
    });
    for binding in [shape.res_index, shape.lhs_index, shape.rhs_index] {
        slots.push(ArgSlot::BufferPtr { binding });
    }

    push_line(source, 0, &format!("__kernel void {entry}({params})"));
    push_line(source, 0, "{");

    for m in 0..res_s1 {
        for n in 0..res_s2 {
            push_line(source, 1, &format!("{vt} acc_{m}_{n} = 0;"));
        }
    }
    let res_init = match shape.res_layout {
        MatrixLayout::RowMajor => format!(
            "get_global_id(0)*{ms}*{} + get_global_id(1)*{}",
            sym_div('N', v),
            ns / v
        ),
        MatrixLayout::ColMajor => format!(
            "get_global_id(0)*{} + get_global_id(1)*{ns}*{}",
            ms / v,
            sym_div('M', v)
        ),
    };
    push_line(
        source,
        1,
        &format!("__global {vt}* res_ptr = {} + {res_init};", shape.res_name),
    );

    for x in [&shape.rhs, &shape.lhs] {
        if x.shared {
            emit_staging_decls(source, x, v, &t)?;
        } else {
            emit_streamed_pointers(source, x, v, &vt, &repr)?;
        }
    }

    push_line(source, 1, &format!("for (unsigned int bl = 0; bl < K/{kl}; bl++)"));
    push_line(source, 1, "{");
    let any_shared = shape.lhs.shared || shape.rhs.shared;
    if any_shared {
        push_line(source, 2, "barrier(CLK_LOCAL_MEM_FENCE);");
        for x in [&shape.rhs, &shape.lhs] {
            if x.shared {
                emit_staged_fetch(source, x, v, &t, &vt, &repr)?;
            }
        }
        push_line(source, 2, "barrier(CLK_LOCAL_MEM_FENCE);");
    }
    if profile.unroll > 1 {
        push_line(source, 2, &format!("#pragma unroll {}", profile.unroll));
    }
    push_line(
        source,
        2,
        &format!("for (unsigned int bs = 0; bs < {}; bs++)", kl / ks),
    );
    push_line(source, 2, "{");
    for x in [&shape.rhs, &shape.lhs] {
        emit_register_fetch(source, x, v, &t, &vt, ks, &repr)?;
    }

    let rhs_collapses = collapses(&shape.rhs, shape.res_layout, v);
    let lhs_collapses = collapses(&shape.lhs, shape.res_layout, v);
    for kk in 0..ks {
        for n in 0..res_s2 {
            for m in 0..res_s1 {
                match shape.res_layout {
                    MatrixLayout::RowMajor => {
                        if rhs_collapses {
                            let lhs = shape.lhs.elem(m, kk, v);
                            let rhs = shape.rhs.whole_register(n * v, kk, v);
                            push_line(source, 3, &format!("acc_{m}_{n} += {lhs} * {rhs};"));
                        } else {
                            for lane in 0..v {
                                let lhs = shape.lhs.elem(m, kk, v);
                                let rhs = shape.rhs.elem(n * v + lane, kk, v);
                                push_line(
                                    source,
                                    3,
                                    &format!(
                                        "acc_{m}_{n}{} += {lhs} * {rhs};",
                                        lane_suffix(v, lane)
                                    ),
                                );
                            }
                        }
                    }
                    MatrixLayout::ColMajor => {
                        if lhs_collapses {
                            let lhs = shape.lhs.whole_register(m * v, kk, v);
                            let rhs = shape.rhs.elem(n, kk, v);
                            push_line(source, 3, &format!("acc_{m}_{n} += {lhs} * {rhs};"));
                        } else {
                            for lane in 0..v {
                                let lhs = shape.lhs.elem(m * v + lane, kk, v);
                                let rhs = shape.rhs.elem(n, kk, v);
                                push_line(
                                    source,
                                    3,
                                    &format!(
                                        "acc_{m}_{n}{} += {lhs} * {rhs};",
                                        lane_suffix(v, lane)
                                    ),
                                );
                            }
                        }
                    }
                }
            }
        }
    }
    push_line(source, 2, "}");
    for x in [&shape.rhs, &shape.lhs] {
        if x.shared {
            let (rows_sym, cols_sym) = x.stored_syms();
            let advance = if x.packed_is_k() {
                format!("{}", kl / v)
            } else {
                let sym = match x.layout {
                    MatrixLayout::RowMajor => cols_sym,
                    MatrixLayout::ColMajor => rows_sym,
                };
                format!("{kl}*{}", sym_div(sym, v))
            };
            push_line(source, 2, &format!("offset_{} += {advance};", x.tag));
        }
    }
    push_line(source, 1, "}");

    match shape.res_layout {
        MatrixLayout::RowMajor => {
            for m in 0..res_s1 {
                for n in 0..res_s2 {
                    push_line(source, 1, &format!("*res_ptr++ = acc_{m}_{n};"));
                }
                push_line(
                    source,
                    1,
                    &format!("res_ptr += {} - {};", sym_div('N', v), res_s2),
                );
            }
        }
        MatrixLayout::ColMajor => {
            for n in 0..res_s2 {
                for m in 0..res_s1 {
                    push_line(source, 1, &format!("*res_ptr++ = acc_{m}_{n};"));
                }
                push_line(
                    source,
                    1,
                    &format!("res_ptr += {} - {};", sym_div('M', v), res_s1),
                );
            }
        }
    }
    push_line(source, 0, "}");
    source.push('\n');

    Ok(vec![KernelPlan {
        entry,
        family: Family::MatrixProduct,
        statements: chunk.range.clone(),
        slots,
        grid: GridRecipe::ProductTiles {
            ms,
            ns,
            local: [ml / ms, nl / ns],
        },
        scratch_elems: None,
        simd_width: v,
    }])
}
