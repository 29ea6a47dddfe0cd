//! Stimulus staging, compilation to sequencer delta tables, and commit.

pub mod commit;
pub mod compiler;
pub mod controller;
pub mod descriptor;
pub mod library;
pub mod state;
pub mod step;

pub use commit::{commit_to_device, CommitMode};
pub use compiler::{build_delta_table, DeltaTable, DeviceProgram, StimulusProgram};
pub use controller::StimulusController;
pub use descriptor::StimulusDescriptor;
pub use library::{StimulusLibrary, StimulusSet};
pub use state::StimulusState;
pub use step::{choose_step_size, LossyAmplitude, StepReport, StepSize};
