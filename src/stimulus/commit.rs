use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use super::compiler::StimulusProgram;
use crate::error::HardwareFault;
use crate::hal::registers::rhs2116;
use crate::hal::{OniContext, RHS2116_CHANNELS};

/// How register writes are checked during a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Read back and compare every write
    #[default]
    Verified,
    /// Only check the sequencer error status once all writes are done
    Silent,
}

struct RegisterWriter<'a> {
    ctx: &'a dyn OniContext,
    mode: CommitMode,
    writes: usize,
}

impl<'a> RegisterWriter<'a> {
    fn write(&mut self, device: u32, address: u32, value: u32) -> Result<(), HardwareFault> {
        self.ctx.write_register(device, address, value)?;
        self.writes += 1;

        if self.mode == CommitMode::Verified {
            let actual = self.ctx.read_register(device, address)?;
            if actual != value {
                return Err(HardwareFault::VerifyMismatch {
                    device,
                    address,
                    expected: value,
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn write_program(w: &mut RegisterWriter<'_>, program: &StimulusProgram) -> Result<(), HardwareFault> {
    let (sel1, sel2, sel3) = program.step.sel();
    let (pbias, nbias) = program.step.bias();

    for dev in &program.devices {
        let idx = dev.device_index;
        w.write(idx, rhs2116::STEPSZ, rhs2116::pack_step_size(sel1, sel2, sel3))?;
        w.write(idx, rhs2116::STIMBIAS, rhs2116::pack_stim_bias(pbias, nbias))?;

        for ch in 0..RHS2116_CHANNELS {
            w.write(idx, rhs2116::neg_register(ch), rhs2116::pack_magnitude(dev.negative_steps[ch]))?;
            w.write(idx, rhs2116::pos_register(ch), rhs2116::pack_magnitude(dev.positive_steps[ch]))?;
        }

        w.write(idx, rhs2116::NUMDELTAS, dev.table.len() as u32)?;
        for (i, (time, bits)) in dev.table.iter().enumerate() {
            w.write(idx, rhs2116::DELTAIDXTIME, rhs2116::pack_delta_idx_time(i as u32, time))?;
            w.write(idx, rhs2116::DELTAPOLEN, bits)?;
        }
    }
    Ok(())
}

fn set_armed(w: &mut RegisterWriter<'_>, program: &StimulusProgram, armed: bool) -> Result<(), HardwareFault> {
    for dev in &program.devices {
        w.write(dev.device_index, rhs2116::STIM_ARM, armed as u32)?;
    }
    Ok(())
}

fn check_sequencer(ctx: &dyn OniContext, program: &StimulusProgram) -> Result<(), HardwareFault> {
    for dev in &program.devices {
        let status = ctx.read_register(dev.device_index, rhs2116::SEQERROR)?;
        if status != 0 {
            return Err(HardwareFault::BadStatus {
                device: dev.device_index,
                status,
            });
        }
    }
    Ok(())
}

fn try_commit(
    ctx: &dyn OniContext,
    program: &StimulusProgram,
    mode: CommitMode,
    atomic: bool,
) -> Result<usize, HardwareFault> {
    let mut w = RegisterWriter { ctx, mode, writes: 0 };

    if atomic {
        set_armed(&mut w, program, false)?;
    }
    write_program(&mut w, program)?;

    if mode == CommitMode::Silent {
        check_sequencer(ctx, program)?;
    }
    if atomic {
        set_armed(&mut w, program, true)?;
    }
    Ok(w.writes)
}

/// Write a compiled program to its chips.
///
/// Order per chip: step size, bias, magnitudes, table size, then each
/// (index/time, polarity/enable) pair ascending by time. With `atomic` the
/// trigger is disarmed first and re-armed only after every write succeeded.
///
/// On any fault an empty stimulus is written on a best-effort basis so no
/// partial table is left armed; the first fault is returned.
pub fn commit_to_device(
    ctx: &dyn OniContext,
    program: &StimulusProgram,
    mode: CommitMode,
    atomic: bool,
) -> Result<usize, HardwareFault> {
    match try_commit(ctx, program, mode, atomic) {
        Ok(writes) => {
            debug!("Committed stimulus with {} register writes ({:?})", writes, mode);
            Ok(writes)
        }
        Err(fault) => {
            error!("Stimulus commit failed: {}", fault);
            let order: Vec<u32> = program.devices.iter().map(|d| d.device_index).collect();
            let empty = StimulusProgram::empty(&order);
            let mut w = RegisterWriter {
                ctx,
                mode: CommitMode::Silent,
                writes: 0,
            };
            if let Err(cleanup) = write_program(&mut w, &empty) {
                warn!("Could not clear stimulus after failed commit: {}", cleanup);
            }
            Err(fault)
        }
    }
}
