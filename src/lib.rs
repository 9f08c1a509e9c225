//! Short-range particle simulation on a uniform cell grid, runnable serially, on shared
//! memory threads, or as message-passing ranks that own horizontal bands of the grid.

pub mod distributed;
pub mod dump;
pub mod grid;
pub mod locked_grid;
pub mod partial_grid;
pub mod particle;
pub mod physics;
pub mod report;
pub mod shared_state;
pub mod simulation;
pub mod threaded;

pub use dump::DumpWriter;
pub use grid::{Grid, GridError};
pub use particle::{Particle, ParticleStore};
pub use report::RunReport;
pub use simulation::{run, run_with_store, RunSummary, SerialSimulation};
