//! Trait seams to the external device runtime.
//!
//! The generator never talks to a device directly. Compiling source,
//! launching kernels, allocating transient vectors, and the fused vector
//! primitives all go through the traits here, so a host-backed
//! implementation can stand in for a real device in tests.
//!
//! Launches are asynchronous: every submitting method may return before the
//! work completes, and result visibility requires a synchronization point
//! the implementation provides. Releasing a buffer that queued work still
//! references takes effect once that work has drained.

use crate::error::GeneratorResult;
use crate::statement::{BufferId, Numeric, VectorView};

/// Launch geometry, in work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGrid {
    pub global: [usize; 2],
    pub local: [usize; 2],
}

/// One kernel argument, bound in declaration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Size, start, or stride scalar.
    Uint(u32),
    F32(f32),
    F64(f64),
    Buffer(BufferId),
}

/// Scalar operand of a fused vector primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarOperand {
    Host(f64),
    Device(BufferId),
}

/// Coefficient applied to one side of a fused vector primitive.
///
/// The applied factor is `value`, negated when `flip_sign` is set, dividing
/// instead of multiplying when `divide` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coeff {
    pub value: ScalarOperand,
    pub divide: bool,
    pub flip_sign: bool,
}

impl Coeff {
    /// The neutral coefficient, multiplying by one.
    pub fn unit() -> Self {
        Coeff::host(1.0)
    }

    pub fn host(value: f64) -> Self {
        Coeff {
            value: ScalarOperand::Host(value),
            divide: false,
            flip_sign: false,
        }
    }

    pub fn device(buffer: BufferId) -> Self {
        Coeff {
            value: ScalarOperand::Device(buffer),
            divide: false,
            flip_sign: false,
        }
    }

    pub fn dividing(mut self) -> Self {
        self.divide = true;
        self
    }

    /// Toggles the sign, so flipping twice is the identity.
    pub fn flipped(mut self) -> Self {
        self.flip_sign = !self.flip_sign;
        self
    }

    /// The multiplier this coefficient applies, given its resolved scalar.
    pub fn factor(&self, resolved: f64) -> f64 {
        let signed = if self.flip_sign { -resolved } else { resolved };
        if self.divide {
            1.0 / signed
        } else {
            signed
        }
    }
}

/// Allocation of transient device vectors.
pub trait BufferAlloc: Send + Sync {
    /// Allocates an uninitialized vector of `len` elements.
    fn allocate_vector(&self, numeric: Numeric, len: usize) -> GeneratorResult<BufferId>;

    fn release_vector(&self, buffer: BufferId) -> GeneratorResult<()>;
}

/// Compilation and launch of generated programs.
pub trait KernelRuntime: BufferAlloc {
    /// Compiled program object, shared freely across threads.
    type Program: Clone + Send + Sync + 'static;

    /// Compiles `source` under `name`. Called at most once per program by
    /// the cache layer; implementations need no deduplication of their own.
    fn compile_program(&self, name: &str, source: &str) -> GeneratorResult<Self::Program>;

    /// Queues `entry` with `args` bound in declaration order.
    fn launch(
        &self,
        program: &Self::Program,
        entry: &str,
        grid: WorkGrid,
        args: &[KernelArg],
    ) -> GeneratorResult<()>;
}

/// The fused vector primitives the composite executor dispatches to.
///
/// Views may overlap, including the target aliasing an input; every element
/// of the target depends only on the same logical index of the inputs, and
/// implementations must finish reading an index before writing it.
pub trait VectorPrimitives: BufferAlloc {
    /// `target = alpha * x`.
    fn av(&self, target: &VectorView, alpha: Coeff, x: &VectorView) -> GeneratorResult<()>;

    /// `target = alpha * x + beta * y`.
    fn avbv(
        &self,
        target: &VectorView,
        alpha: Coeff,
        x: &VectorView,
        beta: Coeff,
        y: &VectorView,
    ) -> GeneratorResult<()>;

    /// `target += alpha * x + beta * y`.
    fn avbv_v(
        &self,
        target: &VectorView,
        alpha: Coeff,
        x: &VectorView,
        beta: Coeff,
        y: &VectorView,
    ) -> GeneratorResult<()>;
}

/// Guard owning one transient vector.
///
/// The buffer is released exactly once: eagerly through [`release`], which
/// surfaces the runtime's error, or on drop along unwinding and early-return
/// paths.
///
/// [`release`]: Temporary::release
pub struct Temporary<'a, A: BufferAlloc + ?Sized> {
    alloc: &'a A,
    view: VectorView,
    released: bool,
}

impl<'a, A: BufferAlloc + ?Sized> Temporary<'a, A> {
    pub fn allocate(alloc: &'a A, numeric: Numeric, len: usize) -> GeneratorResult<Self> {
        let buffer = alloc.allocate_vector(numeric, len)?;
        Ok(Temporary {
            alloc,
            view: VectorView::contiguous(buffer, numeric, len),
            released: false,
        })
    }

    pub fn view(&self) -> &VectorView {
        &self.view
    }

    pub fn release(mut self) -> GeneratorResult<()> {
        self.released = true;
        self.alloc.release_vector(self.view.buffer)
    }
}

impl<A: BufferAlloc + ?Sized> Drop for Temporary<'_, A> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.alloc.release_vector(self.view.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::GeneratorError;

    #[derive(Default)]
    struct CountingAlloc {
        allocated: Mutex<Vec<BufferId>>,
        released: Mutex<Vec<BufferId>>,
        fail_allocation: bool,
    }

    impl BufferAlloc for CountingAlloc {
        fn allocate_vector(&self, _numeric: Numeric, _len: usize) -> GeneratorResult<BufferId> {
            if self.fail_allocation {
                return Err(GeneratorError::unsupported("allocation refused"));
            }
            let mut allocated = self.allocated.lock().unwrap();
            let buffer = BufferId(allocated.len() as u64 + 100);
            allocated.push(buffer);
            Ok(buffer)
        }

        fn release_vector(&self, buffer: BufferId) -> GeneratorResult<()> {
            self.released.lock().unwrap().push(buffer);
            Ok(())
        }
    }

    #[test]
    fn factor_applies_flip_then_divide() {
        assert_eq!(Coeff::host(4.0).factor(4.0), 4.0);
        assert_eq!(Coeff::host(4.0).flipped().factor(4.0), -4.0);
        assert_eq!(Coeff::host(4.0).dividing().factor(4.0), 0.25);
        assert_eq!(Coeff::host(4.0).dividing().flipped().factor(4.0), -0.25);
        assert_eq!(Coeff::unit().flipped().flipped().factor(1.0), 1.0);
    }

    #[test]
    fn dropped_temporary_releases_its_buffer() {
        let alloc = CountingAlloc::default();
        {
            let tmp = Temporary::allocate(&alloc, Numeric::F32, 16).unwrap();
            assert_eq!(tmp.view().len, 16);
            assert_eq!(tmp.view().stride, 1);
        }
        assert_eq!(alloc.released.lock().unwrap().len(), 1);
        assert_eq!(
            alloc.allocated.lock().unwrap()[0],
            alloc.released.lock().unwrap()[0]
        );
    }

    #[test]
    fn explicit_release_happens_once() {
        let alloc = CountingAlloc::default();
        let tmp = Temporary::allocate(&alloc, Numeric::F64, 8).unwrap();
        tmp.release().unwrap();
        assert_eq!(alloc.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_allocation_releases_nothing() {
        let alloc = CountingAlloc {
            fail_allocation: true,
            ..CountingAlloc::default()
        };
        assert!(Temporary::allocate(&alloc, Numeric::F32, 16).is_err());
        assert!(alloc.released.lock().unwrap().is_empty());
    }
}
