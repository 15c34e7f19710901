use std::path::PathBuf;
use std::sync::Mutex;

use wasmtime::{Engine, Instance, Memory, Module, Store, TypedFunc};

use super::hash::{deepseek_hash_v1, le_limbs};
use crate::util::now_unix;

const ALGORITHM: &str = "DeepSeekHashV1";

/// Backend selection, process-wide. `python` is a historical alias for the
/// native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverMode {
    Wasm,
    Native,
}

impl SolverMode {
    pub fn parse(mode: &str) -> Self {
        match mode.trim().to_lowercase().as_str() {
            "native" | "python" => SolverMode::Native,
            _ => SolverMode::Wasm,
        }
    }
}

/// Difficulty target: a digest is accepted when its little-endian value is
/// strictly below `2^256 / difficulty`.
enum Target {
    /// difficulty 1 — every digest passes.
    Unbounded,
    Limit([u64; 4]),
}

fn target_from_difficulty(difficulty: i64) -> Option<Target> {
    if difficulty <= 0 {
        return None;
    }
    if difficulty == 1 {
        return Some(Target::Unbounded);
    }
    // Schoolbook division of 2^256 (limb 4 = 1) by the difficulty.
    let d = difficulty as u128;
    let mut quotient = [0u64; 5];
    let mut rem: u128 = 0;
    let numerator = [0u64, 0, 0, 0, 1];
    for i in (0..5).rev() {
        let cur = (rem << 64) | numerator[i] as u128;
        quotient[i] = (cur / d) as u64;
        rem = cur % d;
    }
    Some(Target::Limit([
        quotient[0],
        quotient[1],
        quotient[2],
        quotient[3],
    ]))
}

fn below_target(digest: &[u8; 32], target: &Target) -> bool {
    let limit = match target {
        Target::Unbounded => return true,
        Target::Limit(limit) => limit,
    };
    let value = le_limbs(digest);
    for i in (0..4).rev() {
        if value[i] < limit[i] {
            return true;
        }
        if value[i] > limit[i] {
            return false;
        }
    }
    false
}

struct WasmBackend {
    store: Store<()>,
    memory: Memory,
    add_stack: TypedFunc<i32, i32>,
    alloc: TypedFunc<(i32, i32), i32>,
    solve: TypedFunc<(i32, i32, i32, i32, i32, f64), ()>,
}

impl WasmBackend {
    fn load(path: &PathBuf) -> wasmtime::Result<Self> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path)?;
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[])?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| wasmtime::Error::msg("wasm memory export not found"))?;
        let add_stack =
            instance.get_typed_func::<i32, i32>(&mut store, "__wbindgen_add_to_stack_pointer")?;
        let alloc = instance.get_typed_func::<(i32, i32), i32>(&mut store, "__wbindgen_export_0")?;
        let solve = instance
            .get_typed_func::<(i32, i32, i32, i32, i32, f64), ()>(&mut store, "wasm_solve")?;
        Ok(Self {
            store,
            memory,
            add_stack,
            alloc,
            solve,
        })
    }

    fn write_string(&mut self, text: &str) -> wasmtime::Result<(i32, i32)> {
        let bytes = text.as_bytes();
        let ptr = self.alloc.call(&mut self.store, (bytes.len() as i32, 1))?;
        self.memory.write(&mut self.store, ptr as usize, bytes)?;
        Ok((ptr, bytes.len() as i32))
    }

    /// Run the module once. `Ok(None)` is a definitive solver failure
    /// (status flag 0); `Err` means the runtime itself misbehaved.
    fn solve(&mut self, challenge: &str, prefix: &str, difficulty: i64) -> wasmtime::Result<Option<i64>> {
        let ret_ptr = self.add_stack.call(&mut self.store, -16)?;
        let result = self.solve_at(ret_ptr, challenge, prefix, difficulty);
        // Restore the module's shadow stack regardless of the call outcome.
        let _ = self.add_stack.call(&mut self.store, 16);
        result
    }

    fn solve_at(
        &mut self,
        ret_ptr: i32,
        challenge: &str,
        prefix: &str,
        difficulty: i64,
    ) -> wasmtime::Result<Option<i64>> {
        let (challenge_ptr, challenge_len) = self.write_string(challenge)?;
        let (prefix_ptr, prefix_len) = self.write_string(prefix)?;
        self.solve.call(
            &mut self.store,
            (
                ret_ptr,
                challenge_ptr,
                challenge_len,
                prefix_ptr,
                prefix_len,
                difficulty as f64,
            ),
        )?;

        let mut status = [0u8; 4];
        self.memory.read(&self.store, ret_ptr as usize, &mut status)?;
        if i32::from_le_bytes(status) == 0 {
            return Ok(None);
        }
        let mut value = [0u8; 8];
        self.memory
            .read(&self.store, ret_ptr as usize + 8, &mut value)?;
        Ok(Some(f64::from_le_bytes(value) as i64))
    }
}

/// Nonce search over the DeepSeekHashV1 digest, with a wasm-bindgen module
/// backend and a pure-Rust fallback. The wasm runtime is initialized lazily
/// under the lock; any wasm failure falls back to the native search for that
/// solve.
pub struct PowSolver {
    mode: SolverMode,
    wasm_path: PathBuf,
    wasm: Mutex<Option<WasmBackend>>,
}

impl PowSolver {
    pub fn new(mode: &str, wasm_path: &str) -> Self {
        let wasm_path = if wasm_path.trim().is_empty() {
            PathBuf::from("../sha3_wasm_bg.7b9ca65ddd.wasm")
        } else {
            PathBuf::from(wasm_path.trim())
        };
        Self {
            mode: SolverMode::parse(mode),
            wasm_path,
            wasm: Mutex::new(None),
        }
    }

    /// Best-effort backend initialization. Failure must not abort startup.
    pub fn warmup(&self) -> wasmtime::Result<()> {
        match self.mode {
            SolverMode::Native => Ok(()),
            SolverMode::Wasm => {
                let mut guard = self.wasm.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(WasmBackend::load(&self.wasm_path)?);
                }
                Ok(())
            }
        }
    }

    /// Find the first nonce whose digest beats the difficulty target.
    /// Returns `None` for an unknown algorithm, a non-positive difficulty,
    /// or an expired challenge.
    pub fn solve(
        &self,
        algorithm: &str,
        challenge: &str,
        salt: &str,
        difficulty: i64,
        expire_at: i64,
    ) -> Option<i64> {
        match self.mode {
            SolverMode::Native => self.solve_native(algorithm, challenge, salt, difficulty, expire_at),
            SolverMode::Wasm => self.solve_wasm(algorithm, challenge, salt, difficulty, expire_at),
        }
    }

    fn solve_native(
        &self,
        algorithm: &str,
        challenge: &str,
        salt: &str,
        difficulty: i64,
        expire_at: i64,
    ) -> Option<i64> {
        if algorithm.trim() != ALGORITHM {
            return None;
        }
        let target = target_from_difficulty(difficulty)?;
        let base = format!("{challenge}{salt}_{expire_at}_");
        let mut nonce: i64 = 0;
        loop {
            if expire_at > 0 && now_unix() >= expire_at {
                return None;
            }
            let digest = deepseek_hash_v1(format!("{base}{nonce}").as_bytes());
            if below_target(&digest, &target) {
                return Some(nonce);
            }
            nonce += 1;
        }
    }

    fn solve_wasm(
        &self,
        algorithm: &str,
        challenge: &str,
        salt: &str,
        difficulty: i64,
        expire_at: i64,
    ) -> Option<i64> {
        if algorithm.trim() != ALGORITHM {
            return None;
        }
        let prefix = format!("{salt}_{expire_at}_");

        let mut guard = self.wasm.lock().unwrap();
        if guard.is_none() {
            match WasmBackend::load(&self.wasm_path) {
                Ok(backend) => *guard = Some(backend),
                Err(e) => {
                    tracing::warn!(error = %e, "wasm solver unavailable, using native backend");
                    drop(guard);
                    return self.solve_native(algorithm, challenge, salt, difficulty, expire_at);
                }
            }
        }
        let backend = guard.as_mut().unwrap();
        match backend.solve(challenge, &prefix, difficulty) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "wasm solve failed, using native backend");
                drop(guard);
                self.solve_native(algorithm, challenge, salt, difficulty, expire_at)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Far enough out that the tests never race the expiry check.
    const EXPIRE_AT: i64 = 1893456000;

    fn native() -> PowSolver {
        PowSolver::new("native", "")
    }

    #[test]
    fn difficulty_one_accepts_the_first_nonce() {
        let solver = native();
        assert_eq!(
            solver.solve(ALGORITHM, "c3f1aa8d", "9d2e", 1, EXPIRE_AT),
            Some(0)
        );
    }

    #[test]
    fn known_challenge_yields_known_nonce() {
        let solver = native();
        assert_eq!(
            solver.solve(ALGORITHM, "c3f1aa8d", "9d2e", 1000, EXPIRE_AT),
            Some(915)
        );
        assert_eq!(
            solver.solve(ALGORITHM, "c3f1aa8d", "9d2e", 4, EXPIRE_AT),
            Some(3)
        );
    }

    #[test]
    fn solution_satisfies_target_inequality() {
        let solver = native();
        let nonce = solver
            .solve(ALGORITHM, "c3f1aa8d", "9d2e", 1000, EXPIRE_AT)
            .unwrap();
        let digest = deepseek_hash_v1(format!("c3f1aa8d9d2e_{EXPIRE_AT}_{nonce}").as_bytes());
        let target = target_from_difficulty(1000).unwrap();
        assert!(below_target(&digest, &target));
    }

    #[test]
    fn expired_challenge_aborts() {
        let solver = native();
        assert_eq!(solver.solve(ALGORITHM, "c", "s", 1_000_000, 1), None);
    }

    #[test]
    fn unknown_algorithm_is_unsolvable() {
        let solver = native();
        assert_eq!(solver.solve("SHA3-256", "c", "s", 1, EXPIRE_AT), None);
    }

    #[test]
    fn non_positive_difficulty_is_unsolvable() {
        let solver = native();
        assert_eq!(solver.solve(ALGORITHM, "c", "s", 0, EXPIRE_AT), None);
        assert_eq!(solver.solve(ALGORITHM, "c", "s", -3, EXPIRE_AT), None);
    }

    #[test]
    fn missing_wasm_module_falls_back_to_native() {
        let solver = PowSolver::new("wasm", "/nonexistent/solver.wasm");
        assert!(solver.warmup().is_err());
        assert_eq!(
            solver.solve(ALGORITHM, "c3f1aa8d", "9d2e", 4, EXPIRE_AT),
            Some(3)
        );
    }

    #[test]
    fn python_mode_aliases_native() {
        assert_eq!(SolverMode::parse("python"), SolverMode::Native);
        assert_eq!(SolverMode::parse("native"), SolverMode::Native);
        assert_eq!(SolverMode::parse(""), SolverMode::Wasm);
        assert_eq!(SolverMode::parse("wasm"), SolverMode::Wasm);
    }

    #[test]
    fn target_division_matches_reference_values() {
        // floor(2^256 / 2) = 1 << 255.
        match target_from_difficulty(2).unwrap() {
            Target::Limit(limbs) => assert_eq!(limbs, [0, 0, 0, 1u64 << 63]),
            Target::Unbounded => panic!("expected a bounded target"),
        }
    }
}
