//! Tuning profiles for the kernel templates.
//!
//! A profile fixes everything about a kernel that is independent of the
//! statement: SIMD width, work-group geometry, blocking sizes, shared-memory
//! staging. Profiles take part in program signatures, so two batches with
//! identical structure but different profiles compile separately.
//!
//! Constructors validate the structural constraints a template relies on
//! (power-of-two reduction sizes, small blocks dividing large blocks).
//! Constraints that also depend on the operands, such as SIMD width against
//! a matrix layout, are checked at generation time instead.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{GeneratorError, GeneratorResult};

fn is_pow2(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

fn check_width(repr: &str, width: usize) -> GeneratorResult<()> {
    if !is_pow2(width) || width > 16 {
        return Err(GeneratorError::invalid_profile(
            repr,
            format!("SIMD width {width} must be a power of two at most 16"),
        ));
    }
    Ok(())
}

/// Profile for elementwise vector kernels (and the scalar fallback, which
/// runs a single work item regardless of the sizes below).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorAxpyProfile {
    pub simd_width: usize,
    pub group_size: usize,
    pub num_groups: usize,
    /// `true` spreads iterations with a grid-sized stride, `false` gives
    /// each work item a contiguous block.
    pub global_decomposition: bool,
}

impl VectorAxpyProfile {
    pub fn new(
        simd_width: usize,
        group_size: usize,
        num_groups: usize,
        global_decomposition: bool,
    ) -> GeneratorResult<Self> {
        let profile = VectorAxpyProfile {
            simd_width,
            group_size,
            num_groups,
            global_decomposition,
        };
        check_width(&profile.repr(), simd_width)?;
        if group_size == 0 || num_groups == 0 {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "group size and group count must be nonzero",
            ));
        }
        Ok(profile)
    }

    pub fn repr(&self) -> String {
        format!(
            "{},{},{},{}",
            self.simd_width, self.group_size, self.num_groups, self.global_decomposition as u8
        )
    }

    pub fn local_size(&self) -> usize {
        self.group_size
    }

    pub fn global_size(&self) -> usize {
        self.group_size * self.num_groups
    }
}

impl Default for VectorAxpyProfile {
    fn default() -> Self {
        VectorAxpyProfile {
            simd_width: 1,
            group_size: 128,
            num_groups: 128,
            global_decomposition: true,
        }
    }
}

/// Profile for elementwise matrix kernels, a two-dimensional grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixAxpyProfile {
    pub simd_width: usize,
    pub local_size_row: usize,
    pub local_size_col: usize,
    pub num_groups_row: usize,
    pub num_groups_col: usize,
    pub global_decomposition: bool,
}

impl MatrixAxpyProfile {
    pub fn new(
        simd_width: usize,
        local_size_row: usize,
        local_size_col: usize,
        num_groups_row: usize,
        num_groups_col: usize,
        global_decomposition: bool,
    ) -> GeneratorResult<Self> {
        let profile = MatrixAxpyProfile {
            simd_width,
            local_size_row,
            local_size_col,
            num_groups_row,
            num_groups_col,
            global_decomposition,
        };
        check_width(&profile.repr(), simd_width)?;
        if local_size_row == 0 || local_size_col == 0 || num_groups_row == 0 || num_groups_col == 0
        {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "work-group geometry must be nonzero",
            ));
        }
        Ok(profile)
    }

    pub fn repr(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.simd_width,
            self.local_size_row,
            self.local_size_col,
            self.num_groups_row,
            self.num_groups_col,
            self.global_decomposition as u8
        )
    }

    pub fn local_sizes(&self) -> (usize, usize) {
        (self.local_size_row, self.local_size_col)
    }

    pub fn global_sizes(&self) -> (usize, usize) {
        (
            self.local_size_row * self.num_groups_row,
            self.local_size_col * self.num_groups_col,
        )
    }
}

impl Default for MatrixAxpyProfile {
    fn default() -> Self {
        MatrixAxpyProfile {
            simd_width: 1,
            local_size_row: 16,
            local_size_col: 16,
            num_groups_row: 16,
            num_groups_col: 16,
            global_decomposition: true,
        }
    }
}

/// Profile for scalar reductions. The group size must be a power of two so
/// the in-group tree reduction halves cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarReductionProfile {
    pub simd_width: usize,
    pub group_size: usize,
    pub num_groups: usize,
    pub global_decomposition: bool,
}

impl ScalarReductionProfile {
    pub fn new(
        simd_width: usize,
        group_size: usize,
        num_groups: usize,
        global_decomposition: bool,
    ) -> GeneratorResult<Self> {
        let profile = ScalarReductionProfile {
            simd_width,
            group_size,
            num_groups,
            global_decomposition,
        };
        check_width(&profile.repr(), simd_width)?;
        if !is_pow2(group_size) {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                format!("group size {group_size} must be a power of two"),
            ));
        }
        if num_groups == 0 {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "group count must be nonzero",
            ));
        }
        Ok(profile)
    }

    pub fn repr(&self) -> String {
        format!(
            "{},{},{},{}",
            self.simd_width, self.group_size, self.num_groups, self.global_decomposition as u8
        )
    }

    pub fn local_size(&self) -> usize {
        self.group_size
    }

    pub fn global_size(&self) -> usize {
        self.group_size * self.num_groups
    }
}

impl Default for ScalarReductionProfile {
    fn default() -> Self {
        ScalarReductionProfile {
            simd_width: 1,
            group_size: 128,
            num_groups: 128,
            global_decomposition: true,
        }
    }
}

/// Profile for row-wise reductions (matrix-vector products).
///
/// Work groups are `rows_per_group x lanes`: each of the `rows_per_group`
/// rows is reduced cooperatively by `lanes` work items. `lanes` must be a
/// power of two for the tree step, and the template assumes scalar loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorReductionProfile {
    pub simd_width: usize,
    pub rows_per_group: usize,
    pub lanes: usize,
    pub num_groups: usize,
}

impl VectorReductionProfile {
    pub fn new(
        simd_width: usize,
        rows_per_group: usize,
        lanes: usize,
        num_groups: usize,
    ) -> GeneratorResult<Self> {
        let profile = VectorReductionProfile {
            simd_width,
            rows_per_group,
            lanes,
            num_groups,
        };
        if simd_width != 1 {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "row-wise reduction supports SIMD width 1 only",
            ));
        }
        if !is_pow2(lanes) {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                format!("lane count {lanes} must be a power of two"),
            ));
        }
        if rows_per_group == 0 || num_groups == 0 {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "row block and group count must be nonzero",
            ));
        }
        Ok(profile)
    }

    pub fn repr(&self) -> String {
        format!(
            "{},{},{},{}",
            self.simd_width, self.rows_per_group, self.lanes, self.num_groups
        )
    }

    pub fn local_sizes(&self) -> (usize, usize) {
        (self.rows_per_group, self.lanes)
    }

    pub fn global_sizes(&self) -> (usize, usize) {
        (self.rows_per_group * self.num_groups, self.lanes)
    }
}

impl Default for VectorReductionProfile {
    fn default() -> Self {
        VectorReductionProfile {
            simd_width: 1,
            rows_per_group: 1,
            lanes: 256,
            num_groups: 32,
        }
    }
}

/// Profile for the tiled matrix-product kernel.
///
/// Each work group computes an `ml x nl` tile of the result, stepping
/// through the shared dimension in slices of `kl`; each work item owns an
/// `ms x ns` register block and consumes `ks` slice elements per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixProductProfile {
    pub simd_width: usize,
    pub ml: usize,
    pub kl: usize,
    pub nl: usize,
    pub ms: usize,
    pub ks: usize,
    pub ns: usize,
    pub use_lhs_shared: bool,
    pub use_rhs_shared: bool,
    pub unroll: usize,
}

impl MatrixProductProfile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        simd_width: usize,
        ml: usize,
        kl: usize,
        nl: usize,
        ms: usize,
        ks: usize,
        ns: usize,
        use_lhs_shared: bool,
        use_rhs_shared: bool,
        unroll: usize,
    ) -> GeneratorResult<Self> {
        let profile = MatrixProductProfile {
            simd_width,
            ml,
            kl,
            nl,
            ms,
            ks,
            ns,
            use_lhs_shared,
            use_rhs_shared,
            unroll,
        };
        check_width(&profile.repr(), simd_width)?;
        for (small, large, name) in [(ms, ml, "mS/mL"), (ks, kl, "kS/kL"), (ns, nl, "nS/nL")] {
            if small == 0 || large == 0 || large % small != 0 {
                return Err(GeneratorError::invalid_profile(
                    profile.repr(),
                    format!("{name} must be nonzero with the small block dividing the large one"),
                ));
            }
        }
        if unroll == 0 {
            return Err(GeneratorError::invalid_profile(
                profile.repr(),
                "unroll factor must be at least 1",
            ));
        }
        Ok(profile)
    }

    pub fn repr(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.simd_width,
            self.ml,
            self.kl,
            self.nl,
            self.ms,
            self.ks,
            self.ns,
            self.use_lhs_shared as u8,
            self.use_rhs_shared as u8,
            self.unroll
        )
    }

    /// Work-group shape: one work item per register block of the tile.
    pub fn local_sizes(&self) -> (usize, usize) {
        (self.ml / self.ms, self.nl / self.ns)
    }

    /// Local memory the staging buffers occupy, in bytes. Tiles are padded
    /// by one element per row to break bank conflicts.
    pub fn lmem_used(&self, element_size: usize) -> usize {
        let mut bytes = 0;
        if self.use_lhs_shared {
            bytes += (self.ml + 1) * (self.kl + 1) * element_size;
        }
        if self.use_rhs_shared {
            bytes += (self.kl + 1) * (self.nl + 1) * element_size;
        }
        bytes
    }
}

impl Default for MatrixProductProfile {
    fn default() -> Self {
        MatrixProductProfile {
            simd_width: 4,
            ml: 16,
            kl: 32,
            nl: 64,
            ms: 4,
            ks: 2,
            ns: 8,
            use_lhs_shared: true,
            use_rhs_shared: false,
            unroll: 1,
        }
    }
}

/// One profile per kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileSet {
    pub vector_axpy: VectorAxpyProfile,
    pub matrix_axpy: MatrixAxpyProfile,
    pub scalar_reduction: ScalarReductionProfile,
    pub vector_reduction: VectorReductionProfile,
    pub matrix_product: MatrixProductProfile,
}

static BUILTIN: Lazy<ProfileSet> = Lazy::new(ProfileSet::default);

impl ProfileSet {
    /// The built-in defaults, shared so callers can borrow without cloning.
    pub fn builtin() -> &'static ProfileSet {
        &BUILTIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_their_own_validation() {
        let set = ProfileSet::default();
        assert!(VectorAxpyProfile::new(
            set.vector_axpy.simd_width,
            set.vector_axpy.group_size,
            set.vector_axpy.num_groups,
            set.vector_axpy.global_decomposition,
        )
        .is_ok());
        assert!(ScalarReductionProfile::new(1, 128, 128, true).is_ok());
        assert!(VectorReductionProfile::new(1, 1, 256, 32).is_ok());
        assert!(MatrixProductProfile::new(4, 16, 32, 64, 4, 2, 8, true, false, 1).is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_width() {
        let err = VectorAxpyProfile::new(3, 128, 128, true).unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidProfile { .. }));
    }

    #[test]
    fn rejects_non_power_of_two_reduction_group() {
        assert!(ScalarReductionProfile::new(1, 96, 128, true).is_err());
        assert!(VectorReductionProfile::new(1, 1, 96, 32).is_err());
    }

    #[test]
    fn rejects_wide_row_reduction() {
        assert!(VectorReductionProfile::new(2, 1, 256, 32).is_err());
    }

    #[test]
    fn rejects_small_block_not_dividing_large() {
        assert!(MatrixProductProfile::new(1, 16, 32, 64, 5, 2, 8, true, false, 1).is_err());
        assert!(MatrixProductProfile::new(1, 16, 32, 64, 4, 3, 8, true, false, 1).is_err());
    }

    #[test]
    fn product_geometry() {
        let profile = MatrixProductProfile::default();
        assert_eq!(profile.local_sizes(), (4, 8));
        assert_eq!(profile.lmem_used(4), 17 * 33 * 4);
        let both = MatrixProductProfile::new(1, 16, 32, 64, 4, 2, 8, true, true, 1).unwrap();
        assert_eq!(both.lmem_used(8), (17 * 33 + 33 * 65) * 8);
    }
}
