/*!
Guest stack traces.

A trace is the current eip followed by the return addresses found by walking
the guest's frame-pointer chain. Traces feed the within-function predicates
of the preemption-point registry and are snapshotted into choice-tree nodes
so a schedule can be explained after the fact.
*/

use crate::machine::{self, Cpu, WORD_SIZE};
use crate::opts::GuestLayout;

/// Upper bound on the frame walk; a corrupt ebp chain must not hang us.
const MAX_FRAMES: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackTrace {
    frames: Vec<u32>,
}

impl StackTrace {
    pub fn from_frames(frames: Vec<u32>) -> Self {
        StackTrace { frames }
    }

    #[inline]
    pub fn frames(&self) -> &[u32] {
        &self.frames
    }

    #[inline]
    pub fn eip(&self) -> Option<u32> {
        self.frames.first().copied()
    }

    /// Whether any frame of this trace lies inside [start, end].
    pub fn within_function(&self, func_start: u32, func_end: u32) -> bool {
        self.frames
            .iter()
            .any(|&addr| addr >= func_start && addr <= func_end)
    }
}

/// Capture the current guest stack by walking the ebp chain.
///
/// Frames stop at the first null or untranslatable frame pointer. The walk
/// reads through the machine facade, so a half-built stack in early boot
/// degrades to a short trace instead of a fault.
pub fn stack_trace<C: Cpu>(cpu: &C, layout: &GuestLayout) -> StackTrace {
    let mut frames = vec![cpu.reg(machine::Reg::Eip)];
    let mut ebp = cpu.reg(machine::Reg::Ebp);
    while ebp != 0 && frames.len() < MAX_FRAMES {
        let Some(ret) = machine::try_read_mem(cpu, layout, ebp.wrapping_add(WORD_SIZE), WORD_SIZE)
        else {
            break;
        };
        if ret == 0 {
            break;
        }
        frames.push(ret);
        let Some(next) = machine::try_read_mem(cpu, layout, ebp, WORD_SIZE) else {
            break;
        };
        if next <= ebp {
            // Frame chain must move up the stack; anything else is garbage.
            break;
        }
        ebp = next;
    }
    StackTrace::from_frames(frames)
}
