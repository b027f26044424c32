use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tilefuse::runtime::{BufferAlloc, KernelArg, KernelRuntime, WorkGrid};
use tilefuse::statement::{BufferId, StatementNode, VectorView};
use tilefuse::{Enqueuer, GeneratorResult, Numeric, Op, Operand, Statement};

/// Discards launches; a compiled program is its own source text.
#[derive(Default)]
struct NullRuntime {
    next_buffer: AtomicU64,
}

impl BufferAlloc for NullRuntime {
    fn allocate_vector(&self, _numeric: Numeric, _len: usize) -> GeneratorResult<BufferId> {
        let n = self.next_buffer.fetch_add(1, Ordering::Relaxed);
        Ok(BufferId(7_000 + n))
    }

    fn release_vector(&self, _buffer: BufferId) -> GeneratorResult<()> {
        Ok(())
    }
}

impl KernelRuntime for NullRuntime {
    type Program = String;

    fn compile_program(&self, _name: &str, source: &str) -> GeneratorResult<Self::Program> {
        Ok(source.to_owned())
    }

    fn launch(
        &self,
        _program: &Self::Program,
        _entry: &str,
        _grid: WorkGrid,
        _args: &[KernelArg],
    ) -> GeneratorResult<()> {
        Ok(())
    }
}

fn vector(id: u64) -> Operand {
    VectorView::contiguous(BufferId(id), Numeric::F32, 256).into()
}

fn dot(target: u64, a: u64, b: u64) -> Statement {
    let scalar = Operand::DeviceScalar {
        buffer: BufferId(target),
        numeric: Numeric::F32,
    };
    Statement::new(vec![
        StatementNode::new(Op::Assign, scalar, Operand::Node(1)),
        StatementNode::new(Op::InnerProd, vector(a), vector(b)),
    ])
    .expect("inner product builds")
}

// The dump directory is read once per process, so this binary holds the one
// test that sets it.
#[test]
fn dumped_programs_land_beside_their_plans() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("tilefuse-dump-{}", std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::env::set_var("TILEFUSE_DUMP_DIR", &dir);

    let enqueuer = Enqueuer::new(NullRuntime::default());
    let batch = [dot(0, 1, 2)];
    let program = enqueuer.obtain(&batch)?;

    let source_path = dir.join(format!("{}.cl", program.name));
    let source = std::fs::read_to_string(&source_path)
        .with_context(|| format!("dumped source at {}", source_path.display()))?;
    assert_eq!(source, program.handle);
    assert!(source.starts_with("#if defined(cl_khr_fp64)"));

    let meta_path = dir.join(format!("{}.json", program.name));
    let meta: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
    assert_eq!(meta["name"], program.name.as_str());
    assert_eq!(meta["signature"], program.signature.as_str());
    assert_eq!(meta["source"], source.as_str());
    let kernels = meta["kernels"].as_array().context("kernel plans array")?;
    assert_eq!(kernels.len(), 2);
    assert_eq!(kernels[0]["entry"], "kernel_0");
    assert_eq!(kernels[0]["family"], "ScalarReduction");
    assert_eq!(kernels[0]["scratch_elems"], 128);
    assert_eq!(kernels[0]["simd_width"], 1);
    assert_eq!(kernels[1]["entry"], "kernel_1");
    assert_eq!(kernels[1]["statements"]["start"], 0);
    assert_eq!(kernels[1]["statements"]["end"], 1);

    // A repeat obtain is served from the cache and dumps nothing new.
    let again = enqueuer.obtain(&batch)?;
    assert!(Arc::ptr_eq(&program, &again));
    assert_eq!(std::fs::read_dir(&dir)?.count(), 2);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
