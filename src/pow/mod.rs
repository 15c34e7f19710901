pub mod cache;
pub mod hash;
pub mod solver;

pub use cache::AnswerCache;
pub use hash::{deepseek_hash_v1, hash_key};
pub use solver::{PowSolver, SolverMode};
