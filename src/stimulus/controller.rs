use log::{info, warn};
use std::sync::{Arc, Mutex};

use super::commit::{commit_to_device, CommitMode};
use super::compiler::{build_delta_table, StimulusProgram};
use super::descriptor::StimulusDescriptor;
use super::library::{StimulusLibrary, StimulusSet};
use super::state::StimulusState;
use super::step::{choose_step_size, StepReport};
use crate::error::{DaqError, DaqResult};
use crate::hal::registers::rhs2116;
use crate::hal::{ChannelMap, OniContext};

struct Staged {
    set: StimulusSet,
    program: StimulusProgram,
}

/// Stages, commits and tracks the stimulus loaded on the chips.
///
/// Staging validates and compiles without touching hardware. Committing
/// writes the staged program, interns it in the library and publishes its id
/// (inactive) through [`StimulusState`]. Triggering marks it active on the
/// ingestion path until its last table event has played out.
pub struct StimulusController {
    device_order: Vec<u32>,
    mode: CommitMode,
    atomic: bool,
    staged: Option<Staged>,
    committed: StimulusProgram,
    committed_id: i32,
    library: Arc<Mutex<StimulusLibrary>>,
    state: Arc<StimulusState>,
}

impl StimulusController {
    pub fn new(device_order: Vec<u32>, mode: CommitMode, atomic: bool, state: Arc<StimulusState>) -> Self {
        Self {
            committed: StimulusProgram::empty(&device_order),
            device_order,
            mode,
            atomic,
            staged: None,
            committed_id: -1,
            library: Arc::new(Mutex::new(StimulusLibrary::new())),
            state,
        }
    }

    pub fn library(&self) -> Arc<Mutex<StimulusLibrary>> {
        self.library.clone()
    }

    pub fn state(&self) -> Arc<StimulusState> {
        self.state.clone()
    }

    pub fn set_mode(&mut self, mode: CommitMode, atomic: bool) {
        self.mode = mode;
        self.atomic = atomic;
    }

    /// Program currently on the hardware, as far as this controller knows
    pub fn committed(&self) -> &StimulusProgram {
        &self.committed
    }

    pub fn committed_id(&self) -> i32 {
        self.committed_id
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Quantize, validate and compile one descriptor per logical electrode
    pub fn stage(&mut self, mut descriptors: Vec<StimulusDescriptor>, map: &ChannelMap) -> DaqResult<StepReport> {
        let report = choose_step_size(&mut descriptors)?;
        let program = build_delta_table(&descriptors, report.step, map, &self.device_order)?;

        for lossy in &report.lossy {
            warn!(
                "Probe {} {} amplitude {:.3} µA will be delivered as {:.3} µA",
                lossy.probe,
                if lossy.anodic { "anodic" } else { "cathodic" },
                lossy.requested_ua,
                lossy.actual_ua
            );
        }

        self.staged = Some(Staged {
            set: StimulusSet {
                step: report.step,
                descriptors,
            },
            program,
        });
        Ok(report)
    }

    /// Write the staged program; returns its library id (-1 for an empty one)
    pub fn commit(&mut self, ctx: &dyn OniContext) -> DaqResult<i32> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| DaqError::InvalidState("no stimulus staged".to_string()))?;

        if let Err(fault) = commit_to_device(ctx, &staged.program, self.mode, self.atomic) {
            self.committed = StimulusProgram::empty(&self.device_order);
            self.committed_id = -1;
            self.state.clear();
            return Err(fault.into());
        }

        let id = if staged.program.is_empty() {
            -1
        } else {
            self.library
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .intern(&staged.set)
        };

        info!("Committed stimulus set {} (step {} nA)", id, staged.set.step.nanoamps());
        self.committed = staged.program.clone();
        self.committed_id = id;
        self.state.set(false, id);
        Ok(id)
    }

    /// Fire the committed stimulus on every chip
    pub fn trigger(&self, ctx: &dyn OniContext) -> DaqResult<()> {
        if self.committed.is_empty() {
            return Err(DaqError::InvalidState("no stimulus committed".to_string()));
        }
        for device in &self.device_order {
            ctx.write_register(*device, rhs2116::TRIGGER, 1)?;
        }
        self.state
            .activate_for(self.committed_id, self.committed.duration_samples());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use crate::hal::mock::SimulatedOni;

    fn controller() -> StimulusController {
        StimulusController::new(vec![256], CommitMode::Verified, true, Arc::new(StimulusState::new()))
    }

    fn descriptors() -> Vec<StimulusDescriptor> {
        let mut set = vec![StimulusDescriptor::default(); 16];
        set[0] = StimulusDescriptor::biphasic(18.1, 99.3, 10, 1, 0);
        set
    }

    #[test]
    fn test_stage_then_commit() {
        let oni = SimulatedOni::with_headstage(1);
        let mut ctl = controller();

        let report = ctl.stage(descriptors(), &ChannelMap::identity(16)).unwrap();
        assert_eq!(report.step.nanoamps(), 500);
        assert_eq!(oni.write_count(), 0);

        assert_eq!(ctl.commit(&oni).unwrap(), 0);
        assert_eq!(ctl.state().snapshot(), (false, -1));
        assert_eq!(ctl.state().id(), 0);
        assert!(!ctl.committed().is_empty());

        // recommitting the same set reuses its id
        ctl.stage(descriptors(), &ChannelMap::identity(16)).unwrap();
        assert_eq!(ctl.commit(&oni).unwrap(), 0);
        assert_eq!(ctl.library().lock().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_without_stage() {
        let oni = SimulatedOni::with_headstage(1);
        assert!(matches!(controller().commit(&oni), Err(DaqError::InvalidState(_))));
    }

    #[test]
    fn test_invalid_stage_writes_nothing() {
        let oni = SimulatedOni::with_headstage(1);
        let mut ctl = controller();
        let mut set = descriptors();
        set[1].cathodic_width_samples = 3;

        let err = ctl.stage(set, &ChannelMap::identity(16)).unwrap_err();
        assert!(matches!(
            err,
            DaqError::Configuration(ConfigurationError::InvalidDescriptor { probe: 1, .. })
        ));
        assert!(!ctl.has_staged());
        assert_eq!(oni.write_count(), 0);
    }

    #[test]
    fn test_failed_commit_resets_cache() {
        let oni = SimulatedOni::with_headstage(1);
        let mut ctl = controller();
        ctl.stage(descriptors(), &ChannelMap::identity(16)).unwrap();
        ctl.commit(&oni).unwrap();

        oni.corrupt_readback(256, rhs2116::DELTAPOLEN);
        let mut other = descriptors();
        other[2] = StimulusDescriptor::biphasic(5.0, 5.0, 4, 1, 0);
        ctl.stage(other, &ChannelMap::identity(16)).unwrap();

        assert!(matches!(ctl.commit(&oni), Err(DaqError::HardwareIo(_))));
        assert!(ctl.committed().is_empty());
        assert_eq!(ctl.committed_id(), -1);
        assert_eq!(ctl.state().snapshot(), (false, -1));
    }

    #[test]
    fn test_trigger_requires_commit() {
        let oni = SimulatedOni::with_headstage(1);
        let mut ctl = controller();
        assert!(ctl.trigger(&oni).is_err());

        ctl.stage(descriptors(), &ChannelMap::identity(16)).unwrap();
        ctl.commit(&oni).unwrap();
        ctl.trigger(&oni).unwrap();
        assert_eq!(oni.register(256, rhs2116::TRIGGER), Some(1));
    }

    #[test]
    fn test_trigger_activates_for_program_length() {
        let oni = SimulatedOni::with_headstage(1);
        let mut ctl = controller();
        ctl.stage(descriptors(), &ChannelMap::identity(16)).unwrap();
        ctl.commit(&oni).unwrap();
        assert_eq!(ctl.state().snapshot(), (false, -1));

        ctl.trigger(&oni).unwrap();
        assert_eq!(ctl.state().snapshot(), (true, 0));

        // two 10-sample phases, no dwell
        let state = ctl.state();
        let active = (0..30).filter(|_| state.next_sample().0).count();
        assert_eq!(active, 20);
        assert_eq!(state.snapshot(), (false, -1));
    }
}
