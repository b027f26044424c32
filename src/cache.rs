//! Process-wide reuse of compiled programs, keyed by signature.
//!
//! The signature is a pure function of batch structure, element type, and the
//! profiles that shaped the source, so equal signatures mean byte-identical
//! source and interchangeable argument layouts. Concurrent misses on one key
//! are serialized through a per-key gate; losers pick up the winner's entry
//! instead of compiling again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::codegen::KernelPlan;
use crate::env;
use crate::error::{GeneratorError, GeneratorResult};
use crate::profiling;

/// A program the runtime has accepted, together with the launch plans that
/// were recorded when its source was generated.
#[derive(Debug, Clone)]
pub struct CompiledProgram<P> {
    pub name: String,
    pub signature: String,
    pub handle: P,
    pub kernels: Vec<KernelPlan>,
}

/// Signature-keyed compiled program cache.
pub struct ProgramCache<P> {
    programs: Mutex<HashMap<String, Arc<CompiledProgram<P>>>>,
    compile_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        ProgramCache::new()
    }
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        ProgramCache {
            programs: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached program for `signature`, or runs `build` and caches
    /// its result. A failed build caches nothing; the next call retries.
    pub fn get_or_compile<F>(
        &self,
        signature: &str,
        build: F,
    ) -> GeneratorResult<Arc<CompiledProgram<P>>>
    where
        F: FnOnce() -> GeneratorResult<CompiledProgram<P>>,
    {
        if env::program_cache_disabled() {
            let built = {
                let _scope = profiling::compile_scope("program_cache.build");
                build()?
            };
            return Ok(Arc::new(built));
        }

        if let Some(found) = self
            .programs
            .lock()
            .expect("program cache poisoned")
            .get(signature)
            .cloned()
        {
            profiling::cache_event("program_cache.hit_mem");
            return Ok(found);
        }
        profiling::cache_event("program_cache.miss_mem");

        let gate = {
            let mut guard = self
                .compile_gates
                .lock()
                .expect("compile gate cache poisoned");
            guard
                .entry(signature.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _gate_lock = gate.lock().expect("compile gate poisoned");

        if let Some(found) = self
            .programs
            .lock()
            .expect("program cache poisoned")
            .get(signature)
            .cloned()
        {
            profiling::cache_event("program_cache.hit_mem");
            return Ok(found);
        }

        let built = {
            let _scope = profiling::compile_scope("program_cache.build");
            build()?
        };
        if built.signature != signature {
            return Err(GeneratorError::mismatch(
                "compiled program signature differs from its cache key",
            ));
        }

        let compiled = Arc::new(built);
        self.programs
            .lock()
            .expect("program cache poisoned")
            .insert(signature.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.programs.lock().expect("program cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
