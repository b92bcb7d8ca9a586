// Payload acceptance policies
//
// Whether a received packet must be checked against the hardware's sequence
// field before it is committed depends on the FPGA firmware, so the check is a
// pluggable policy rather than hard-wired:
// - AcceptAll: commit every packet the transport delivers
// - SequenceField: require the sequence word to advance by the requested value

use crate::wire::{SEQUENCE_FLAG_WORD, SEQUENCE_ROLLOVER, SEQUENCE_WORD};
use serde::{Deserialize, Serialize};

/// Serializable selection of a validator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationPolicy {
    #[default]
    AcceptAll,

    SequenceField {
        /// Word index of the sequence counter
        #[serde(default = "default_sequence_index")]
        index: usize,
        /// Expected advance per packet; 0 means the requested transfer value
        #[serde(default)]
        step: u32,
        /// Counter modulus
        #[serde(default = "default_rollover")]
        rollover: u32,
        /// Word index of a marker that bypasses the check when equal to 1
        #[serde(default = "default_flag_index")]
        flag_index: usize,
    },
}

fn default_sequence_index() -> usize {
    SEQUENCE_WORD
}

fn default_rollover() -> u32 {
    SEQUENCE_ROLLOVER
}

fn default_flag_index() -> usize {
    SEQUENCE_FLAG_WORD
}

impl ValidationPolicy {
    pub fn sequence_field() -> Self {
        ValidationPolicy::SequenceField {
            index: default_sequence_index(),
            step: 0,
            rollover: default_rollover(),
            flag_index: default_flag_index(),
        }
    }
}

/// Decides whether a received packet may be committed
pub trait PacketValidator: Send {
    /// `Err` carries a human-readable reason for the rejection
    fn accept(&mut self, words: &[u32]) -> Result<(), String>;

    /// Forget any history, e.g. after a new initiation command
    fn reset(&mut self) {}
}

pub struct AcceptAll;

impl PacketValidator for AcceptAll {
    fn accept(&mut self, _words: &[u32]) -> Result<(), String> {
        Ok(())
    }
}

pub struct SequenceValidator {
    index: usize,
    step: u32,
    rollover: u32,
    flag_index: usize,
    previous: Option<u32>,
}

impl SequenceValidator {
    pub fn new(index: usize, step: u32, rollover: u32, flag_index: usize) -> Self {
        Self {
            index,
            step,
            rollover,
            flag_index,
            previous: None,
        }
    }
}

impl PacketValidator for SequenceValidator {
    fn accept(&mut self, words: &[u32]) -> Result<(), String> {
        let current = *words.get(self.index).ok_or_else(|| {
            format!(
                "packet of {} words has no sequence word {}",
                words.len(),
                self.index
            )
        })?;

        let flagged = words.get(self.flag_index) == Some(&1);
        let accepted = match self.previous {
            None => true,
            Some(previous) => {
                flagged
                    || current.wrapping_sub(previous) == self.step
                    || previous.wrapping_sub(current)
                        == self.rollover.wrapping_sub(self.step.wrapping_mul(2))
            }
        };

        if !accepted {
            return Err(format!(
                "sequence mismatch: word[{}]=0x{:08x}, previous=0x{:08x}",
                self.index,
                current,
                self.previous.unwrap_or_default()
            ));
        }

        self.previous = Some(current);
        Ok(())
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

/// Build the validator for a policy; `requested` fills in a zero step
pub fn create_validator(policy: &ValidationPolicy, requested: u32) -> Box<dyn PacketValidator> {
    match *policy {
        ValidationPolicy::AcceptAll => Box::new(AcceptAll),
        ValidationPolicy::SequenceField {
            index,
            step,
            rollover,
            flag_index,
        } => {
            let step = if step == 0 { requested } else { step };
            Box::new(SequenceValidator::new(index, step, rollover, flag_index))
        }
    }
}
