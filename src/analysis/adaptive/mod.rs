// src/analysis/adaptive/mod.rs
//
// Self-calibrating tunables shared by the speed estimator and the pipeline.
//
//   feed_* observations → CalibrationEngine → improve_and_persist()
//                                  │                     │
//                                  └─ CalibrationSource ─┴→ CalibrationStore

pub mod engine;
pub mod store;
pub mod tunables;

pub use engine::{CalibrationEngine, CalibrationSource, CycleReport, DEFAULT_CYCLE_EVERY_FRAMES};
pub use store::{CalibrationStore, JsonFileStore, MemoryStore};
pub use tunables::{CalibrationState, TunableRange};
