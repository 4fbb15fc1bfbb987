// Reference Padding Programs — loader-provided policies behind the
// opaque executor contract
//
// The executor treats program bytecode as a black box; this loader
// interprets the blob's leading tag byte and instantiates one of two
// reference programs. A deployment with a real bytecode VM plugs in
// its own ProgramLoader and none of this module is involved.

use crate::executor::{
    ExecutorError, PaddingProgram, ProgramAction, ProgramLoader, ProgramOutcome, StatusSnapshot,
    UnitStores,
};
use crate::runtime::UnitCategory;
use rand::Rng;

/// Tag byte selecting the uniform cover program
pub const PROGRAM_UNIFORM_COVER: u8 = 0x01;

/// Tag byte selecting the rotation schedule program
pub const PROGRAM_ROTATION: u8 = 0x02;

/// Histogram key the rotation program counts ticks under
const HIST_KEY_TICKS: u64 = 0;

/// Histogram key the cover program counts refills under
const HIST_KEY_REFILLS: u64 = 1;

/// Uniform cover traffic: one dummy per tick at a jittered offset
///
/// Offsets are drawn in batches into the unit's data stream; when the
/// stream runs dry the program refills it before scheduling further
/// injections, as the store contract requires.
pub struct UniformCoverProgram {
    min_gap_ms: u64,
    max_gap_ms: u64,
    refill_batch: usize,
}

impl UniformCoverProgram {
    pub fn new(min_gap_ms: u64, max_gap_ms: u64, refill_batch: usize) -> Self {
        Self {
            min_gap_ms,
            max_gap_ms,
            refill_batch: refill_batch.max(1),
        }
    }

    fn draw_offsets(&self) -> Vec<u64> {
        let mut rng = rand::thread_rng();
        (0..self.refill_batch)
            .map(|_| rng.gen_range(self.min_gap_ms..=self.max_gap_ms))
            .collect()
    }
}

impl PaddingProgram for UniformCoverProgram {
    fn invoke(&mut self, _status: &StatusSnapshot, stores: &mut UnitStores) -> ProgramOutcome {
        if stores.stream.is_exhausted() {
            let offsets = self.draw_offsets();
            stores.stream.refill(&offsets);
            stores.histogram.increment(HIST_KEY_REFILLS);
        }
        match stores.stream.next() {
            Some(offset_ms) => ProgramOutcome {
                action: ProgramAction::ScheduleDummy { offset_ms },
                next_tick_delay_ms: Some(offset_ms.max(self.min_gap_ms)),
            },
            // Refill produced nothing; idle out one interval
            None => ProgramOutcome {
                action: ProgramAction::Idle,
                next_tick_delay_ms: None,
            },
        }
    }
}

/// Rotation schedule: switch the active padding unit every N ticks
///
/// Counts its own invocations in the histogram and alternates between
/// two configured padding units, exercising the schedule half of the
/// program contract.
pub struct RotationScheduleProgram {
    rotate_after_ticks: u64,
    uuid_a: u8,
    uuid_b: u8,
}

impl RotationScheduleProgram {
    pub fn new(rotate_after_ticks: u64, uuid_a: u8, uuid_b: u8) -> Self {
        Self {
            rotate_after_ticks: rotate_after_ticks.max(1),
            uuid_a,
            uuid_b,
        }
    }
}

impl PaddingProgram for RotationScheduleProgram {
    fn invoke(&mut self, status: &StatusSnapshot, stores: &mut UnitStores) -> ProgramOutcome {
        stores.histogram.increment(HIST_KEY_TICKS);
        if stores.histogram.get(HIST_KEY_TICKS) < self.rotate_after_ticks {
            return ProgramOutcome {
                action: ProgramAction::Idle,
                next_tick_delay_ms: None,
            };
        }
        stores.histogram.reset();

        let next = if status.current_unit == Some(self.uuid_a) {
            self.uuid_b
        } else {
            self.uuid_a
        };
        ProgramOutcome {
            action: ProgramAction::ActivateUnit { uuid: next },
            next_tick_delay_ms: None,
        }
    }
}

/// Loader for the built-in reference programs
///
/// Blob layouts:
/// - `[0x01][min_gap u16 LE][max_gap u16 LE][batch u8]` — uniform cover
/// - `[0x02][rotate_after u16 LE][uuid_a u8][uuid_b u8]` — rotation
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinLoader;

impl ProgramLoader for BuiltinLoader {
    fn load(
        &self,
        category: UnitCategory,
        bytecode: &[u8],
    ) -> Result<Box<dyn PaddingProgram>, ExecutorError> {
        let tag = *bytecode.first().ok_or(ExecutorError::EmptyBytecode)?;
        match tag {
            PROGRAM_UNIFORM_COVER => {
                if category != UnitCategory::Padding {
                    return Err(ExecutorError::CategoryMismatch(tag, category));
                }
                if bytecode.len() < 6 {
                    return Err(ExecutorError::BadOperand(
                        "uniform cover blob needs 6 bytes".to_string(),
                    ));
                }
                let min_gap = u16::from_le_bytes([bytecode[1], bytecode[2]]) as u64;
                let max_gap = u16::from_le_bytes([bytecode[3], bytecode[4]]) as u64;
                if min_gap > max_gap {
                    return Err(ExecutorError::BadOperand(format!(
                        "min gap {} exceeds max gap {}",
                        min_gap, max_gap
                    )));
                }
                Ok(Box::new(UniformCoverProgram::new(
                    min_gap,
                    max_gap,
                    bytecode[5] as usize,
                )))
            }
            PROGRAM_ROTATION => {
                if category != UnitCategory::Schedule {
                    return Err(ExecutorError::CategoryMismatch(tag, category));
                }
                if bytecode.len() < 5 {
                    return Err(ExecutorError::BadOperand(
                        "rotation blob needs 5 bytes".to_string(),
                    ));
                }
                let rotate_after = u16::from_le_bytes([bytecode[1], bytecode[2]]) as u64;
                Ok(Box::new(RotationScheduleProgram::new(
                    rotate_after,
                    bytecode[3],
                    bytecode[4],
                )))
            }
            other => Err(ExecutorError::UnknownProgram(other)),
        }
    }
}

/// Convenience blob builder for the uniform cover program
pub fn uniform_cover_blob(min_gap_ms: u16, max_gap_ms: u16, batch: u8) -> Vec<u8> {
    let mut blob = vec![PROGRAM_UNIFORM_COVER];
    blob.extend_from_slice(&min_gap_ms.to_le_bytes());
    blob.extend_from_slice(&max_gap_ms.to_le_bytes());
    blob.push(batch);
    blob
}

/// Convenience blob builder for the rotation schedule program
pub fn rotation_blob(rotate_after: u16, uuid_a: u8, uuid_b: u8) -> Vec<u8> {
    let mut blob = vec![PROGRAM_ROTATION];
    blob.extend_from_slice(&rotate_after.to_le_bytes());
    blob.push(uuid_a);
    blob.push(uuid_b);
    blob
}
