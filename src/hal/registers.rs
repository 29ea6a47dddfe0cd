//! Register addresses and packing for the devices this system programs.
//!
//! Every multi-field register is packed and unpacked explicitly on plain
//! integers. Bit positions are documented next to each function.

/// RHS2116 chip and stimulator-sequencer registers
pub mod rhs2116 {
    /// Chip: stimulation enable word A (0xAAAA when armed)
    pub const STIMENA_A: u32 = 0x20;
    /// Chip: stimulation enable word B (0x00FF when armed)
    pub const STIMENA_B: u32 = 0x21;
    /// Chip: stimulation current step size
    pub const STEPSZ: u32 = 0x22;
    /// Chip: stimulation DAC bias currents
    pub const STIMBIAS: u32 = 0x23;
    /// Chip: first cathodic (negative) current magnitude register
    pub const NEG_BASE: u32 = 0x40;
    /// Chip: first anodic (positive) current magnitude register
    pub const POS_BASE: u32 = 0x60;

    /// Sequencer: enables frame streaming
    pub const ENABLE: u32 = 0x8000;
    /// Sequencer: capacity of the delta table (read only)
    pub const MAXDELTAS: u32 = 0x8001;
    /// Sequencer: number of valid delta table entries
    pub const NUMDELTAS: u32 = 0x8002;
    /// Sequencer: delta entry index and time, see [`pack_delta_idx_time`]
    pub const DELTAIDXTIME: u32 = 0x8003;
    /// Sequencer: delta entry polarity/enable bits for the last index
    pub const DELTAPOLEN: u32 = 0x8004;
    /// Sequencer: nonzero when the last table upload was inconsistent
    pub const SEQERROR: u32 = 0x8005;
    /// Sequencer: write 1 to fire the stored stimulus
    pub const TRIGGER: u32 = 0x8006;
    /// Sequencer: 1 arms the trigger input, 0 holds the sequencer idle
    pub const STIM_ARM: u32 = 0x8008;

    pub const STIMENA_A_ARMED: u32 = 0xAAAA;
    pub const STIMENA_B_ARMED: u32 = 0x00FF;

    /// Default trim placed in the upper byte of magnitude registers
    pub const MAGNITUDE_TRIM: u32 = 0x80;

    /// Hardware delta table limit
    pub const MAX_DELTA_KEYS: usize = 255;

    pub fn neg_register(channel: usize) -> u32 {
        NEG_BASE + channel as u32
    }

    pub fn pos_register(channel: usize) -> u32 {
        POS_BASE + channel as u32
    }

    /// STEPSZ: sel1 in bits [6:0], sel2 in bits [12:7], sel3 in bits [14:13]
    pub fn pack_step_size(sel1: u8, sel2: u8, sel3: u8) -> u32 {
        (sel1 as u32 & 0x7F) | ((sel2 as u32 & 0x3F) << 7) | ((sel3 as u32 & 0x3) << 13)
    }

    pub fn unpack_step_size(value: u32) -> (u8, u8, u8) {
        (
            (value & 0x7F) as u8,
            ((value >> 7) & 0x3F) as u8,
            ((value >> 13) & 0x3) as u8,
        )
    }

    /// STIMBIAS: nbias in bits [3:0], pbias in bits [7:4]
    pub fn pack_stim_bias(pbias: u8, nbias: u8) -> u32 {
        (nbias as u32 & 0xF) | ((pbias as u32 & 0xF) << 4)
    }

    pub fn unpack_stim_bias(value: u32) -> (u8, u8) {
        (((value >> 4) & 0xF) as u8, (value & 0xF) as u8)
    }

    /// Magnitude registers: trim in bits [15:8], step count in bits [7:0]
    pub fn pack_magnitude(steps: u8) -> u32 {
        (MAGNITUDE_TRIM << 8) | steps as u32
    }

    pub fn unpack_magnitude(value: u32) -> u8 {
        (value & 0xFF) as u8
    }

    /// DELTAIDXTIME: entry index in bits [31:22], time in bits [21:0]
    pub fn pack_delta_idx_time(index: u32, time: u32) -> u32 {
        (index << 22) | (time & 0x3F_FFFF)
    }

    pub fn unpack_delta_idx_time(value: u32) -> (u32, u32) {
        (value >> 22, value & 0x3F_FFFF)
    }

    /// Largest time offset representable in a delta entry
    pub const MAX_DELTA_TIME: u32 = 0x3F_FFFF;

    /// DELTAPOLEN: polarity of channel `ch` in bit `ch`, enable in bit `16 + ch`
    pub fn pol_en_bits(channel: usize, enable: bool, anodic: bool) -> u32 {
        let mut bits = 0;
        if enable {
            bits |= 1 << (16 + channel);
        }
        if anodic {
            bits |= 1 << channel;
        }
        bits
    }
}

/// Heartbeat device registers
pub mod heartbeat {
    pub const ENABLE: u32 = 0;
    /// Divider applied to the base clock
    pub const CLK_DIV: u32 = 1;
    /// Base clock in Hz (read only)
    pub const CLK_HZ: u32 = 2;
}

/// FMC host link registers
pub mod fmc {
    pub const ENABLE: u32 = 0;
    /// Port voltage in units of 0.1 V
    pub const PORT_VOLTAGE: u32 = 3;
    /// Nonzero once the serializer link is locked
    pub const LINK_STATE: u32 = 5;

    pub fn pack_port_voltage(volts: f32) -> u32 {
        (volts * 10.0).round().max(0.0) as u32
    }
}
