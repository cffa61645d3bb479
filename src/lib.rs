//! Kumade core library.
//!
//! An incremental build engine built around a small expression algebra:
//! rule producers describe computations whose dependency sets may only be
//! discovered mid-build, the evaluator walks those expressions lazily and
//! memoizes shared sub-computations, and the scheduler drives independent
//! subtrees concurrently under a configured parallelism bound.

pub mod alias;
pub mod cli;
pub mod errors;
pub mod eval;
pub mod exec;
pub mod expr;
pub mod graph;
pub mod memo;
pub mod path;
pub mod rulefile;
pub mod runner;
pub mod schedule;
