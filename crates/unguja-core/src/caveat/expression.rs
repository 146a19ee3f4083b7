//! Compiled caveat expressions and the bounded program cache.

use std::sync::Arc;

use cel_interpreter::{Context, Program, Value};
use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};

/// A caveat's pre-compiled boolean expression.
pub struct CompiledCaveat {
    source: String,
    program: Program,
}

impl std::fmt::Debug for CompiledCaveat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCaveat")
            .field("source", &self.source)
            .finish()
    }
}

impl CompiledCaveat {
    /// Compiles serialized expression bytes.
    ///
    /// The underlying parser can panic on some malformed input; the panic
    /// is caught and reported as a compilation error.
    pub fn compile(caveat_name: &str, serialized: &[u8]) -> CoreResult<Self> {
        let source =
            String::from_utf8(serialized.to_vec()).map_err(|_| CoreError::CaveatCompilation {
                caveat: caveat_name.to_string(),
                message: "expression bytes are not valid UTF-8".to_string(),
            })?;

        let compiled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Program::compile(&source)
        }));

        let program = match compiled {
            Ok(Ok(program)) => program,
            Ok(Err(e)) => {
                return Err(CoreError::CaveatCompilation {
                    caveat: caveat_name.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_panic) => {
                return Err(CoreError::CaveatCompilation {
                    caveat: caveat_name.to_string(),
                    message: "parser encountered an internal error".to_string(),
                });
            }
        };

        Ok(Self { source, program })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Executes the program against the given variable bindings and
    /// requires a boolean result.
    pub fn evaluate_bool(
        &self,
        caveat_name: &str,
        bindings: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<bool, String> {
        let mut ctx = Context::default();
        for (name, value) in bindings {
            // Binding names come from a map, so duplicates cannot occur.
            if ctx.add_variable(name.as_str(), value).is_err() {
                return Err(format!("duplicate binding '{name}'"));
            }
        }

        match self.program.execute(&ctx) {
            Ok(Value::Bool(result)) => Ok(result),
            Ok(other) => Err(format!(
                "caveat '{caveat_name}' returned {other:?}, expected a boolean"
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Bounded cache of compiled caveat programs, keyed by expression source.
///
/// Compilation dominates evaluation for short caveats, and the same few
/// expressions are evaluated on every caveated edge, so a small cache has
/// a high hit rate.
#[derive(Debug)]
pub struct CaveatProgramCache {
    programs: DashMap<String, Arc<CompiledCaveat>>,
    max_entries: usize,
}

impl CaveatProgramCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            programs: DashMap::new(),
            max_entries,
        }
    }

    /// Returns the compiled program for a caveat, compiling and caching on
    /// miss. When the cache is full an arbitrary entry is dropped; the
    /// cache is a throughput optimization, not a correctness requirement.
    pub fn get_or_compile(
        &self,
        caveat_name: &str,
        serialized: &[u8],
    ) -> CoreResult<Arc<CompiledCaveat>> {
        let key = String::from_utf8_lossy(serialized).into_owned();
        if let Some(cached) = self.programs.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let compiled = Arc::new(CompiledCaveat::compile(caveat_name, serialized)?);
        if self.programs.len() >= self.max_entries {
            let victim = self.programs.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.programs.remove(&victim);
            }
        }
        self.programs.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

impl Default for CaveatProgramCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_evaluates_boolean_expressions() {
        let compiled = CompiledCaveat::compile("check", b"value > 10").unwrap();
        assert!(compiled
            .evaluate_bool("check", [("value".to_string(), Value::Int(11))])
            .unwrap());
        assert!(!compiled
            .evaluate_bool("check", [("value".to_string(), Value::Int(9))])
            .unwrap());
    }

    #[test]
    fn rejects_invalid_expressions() {
        assert!(CompiledCaveat::compile("broken", b"value >").is_err());
    }

    #[test]
    fn non_boolean_results_are_errors() {
        let compiled = CompiledCaveat::compile("check", b"value + 1").unwrap();
        assert!(compiled
            .evaluate_bool("check", [("value".to_string(), Value::Int(1))])
            .is_err());
    }

    #[test]
    fn cache_reuses_compiled_programs() {
        let cache = CaveatProgramCache::new(8);
        let a = cache.get_or_compile("check", b"value > 10").unwrap();
        let b = cache.get_or_compile("check", b"value > 10").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_stays_bounded() {
        let cache = CaveatProgramCache::new(2);
        cache.get_or_compile("a", b"x > 1").unwrap();
        cache.get_or_compile("b", b"x > 2").unwrap();
        cache.get_or_compile("c", b"x > 3").unwrap();
        assert!(cache.len() <= 2);
    }
}
