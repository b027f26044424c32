//! Small helpers shared by the kernel templates.
//!
//! Source is accumulated into a plain `String`. `push_block` lets templates
//! be written as raw-string literals indented to match the surrounding Rust:
//! the common leading indentation is stripped and the block is re-indented
//! to the requested level.

use crate::statement::Numeric;

pub(super) fn push_line(source: &mut String, indent: usize, line: &str) {
    push_block(source, indent, line);
}

pub(super) fn push_block(source: &mut String, indent: usize, block: &str) {
    let mut lines: Vec<&str> = block.split('\n').collect();
    if lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let common = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let pad = "  ".repeat(indent);
    for line in lines {
        let stripped = if line.len() >= common { &line[common..] } else { line.trim_start() };
        if stripped.is_empty() {
            source.push('\n');
        } else {
            source.push_str(&pad);
            source.push_str(stripped);
            source.push('\n');
        }
    }
}

/// Collapses a signature into a legal program/kernel identifier.
pub(super) fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Element or SIMD-vector type for kernel source, `float` / `float4` style.
pub(super) fn device_type(numeric: Numeric, width: usize) -> String {
    if width == 1 {
        numeric.kernel_type().to_owned()
    } else {
        format!("{}{}", numeric.kernel_type(), width)
    }
}

/// Component accessor for SIMD lane `lane`, empty for scalar width.
pub(super) fn lane_suffix(width: usize, lane: usize) -> String {
    if width == 1 {
        String::new()
    } else {
        format!(".s{lane:x}")
    }
}

/// Sum of all lanes of a SIMD accumulator, or the accumulator itself for
/// scalar width.
pub(super) fn lane_sum(name: &str, width: usize) -> String {
    if width == 1 {
        return name.to_owned();
    }
    let parts: Vec<String> = (0..width).map(|lane| format!("{name}.s{lane:x}")).collect();
    format!("({})", parts.join(" + "))
}

/// Opens one level of the work-decomposition loop over `bound`, indexing
/// with `var` along grid dimension `dim`. The caller closes it with
/// [`close_strided_loop`] at the same indent.
pub(super) fn open_strided_loop(
    source: &mut String,
    indent: usize,
    var: &str,
    bound: &str,
    dim: usize,
    global_decomposition: bool,
) {
    if global_decomposition {
        push_line(
            source,
            indent,
            &format!(
                "for (unsigned int {var} = get_global_id({dim}); {var} < {bound}; {var} += get_global_size({dim}))"
            ),
        );
        push_line(source, indent, "{");
    } else {
        push_block(
            source,
            indent,
            &format!(
                r#"
                    unsigned int span_{var} = ({bound} + get_global_size({dim}) - 1) / get_global_size({dim});
                    unsigned int first_{var} = get_global_id({dim}) * span_{var};
                    unsigned int bound_{var} = min(first_{var} + span_{var}, {bound});
                    for (unsigned int {var} = first_{var}; {var} < bound_{var}; {var}++)
                    {{
                "#
            ),
        );
    }
}

pub(super) fn close_strided_loop(source: &mut String, indent: usize) {
    push_line(source, indent, "}");
}
