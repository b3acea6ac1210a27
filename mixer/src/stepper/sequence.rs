//! Half-step coil tables for the 4-coil unipolar dispensers

/// Micro-steps in one full half-step cycle
pub const PHASES_PER_STEP: usize = 8;

/// Coil levels for one phase, coil 1 to coil 4
pub type Phase = [u8; 4];

/// Plunger towards the limit switch
pub const DISPENSE_SEQUENCE: [Phase; PHASES_PER_STEP] = [
    [1, 0, 0, 1],
    [0, 0, 0, 1],
    [0, 0, 1, 1],
    [0, 0, 1, 0],
    [0, 1, 1, 0],
    [0, 1, 0, 0],
    [1, 1, 0, 0],
    [1, 0, 0, 0],
];

/// Plunger away from the limit switch, [`DISPENSE_SEQUENCE`] reversed
pub const EXTRACT_SEQUENCE: [Phase; PHASES_PER_STEP] = [
    [1, 0, 0, 0],
    [1, 1, 0, 0],
    [0, 1, 0, 0],
    [0, 1, 1, 0],
    [0, 0, 1, 0],
    [0, 0, 1, 1],
    [0, 0, 0, 1],
    [1, 0, 0, 1],
];

/// Plunger travel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dispense,
    Extract,
}

impl Direction {
    pub fn sequence(self) -> &'static [Phase; PHASES_PER_STEP] {
        match self {
            Direction::Dispense => &DISPENSE_SEQUENCE,
            Direction::Extract => &EXTRACT_SEQUENCE,
        }
    }

    /// Only dispensing runs towards the switch
    pub fn checks_switch(self) -> bool {
        matches!(self, Direction::Dispense)
    }
}
