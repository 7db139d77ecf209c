//! The generated frame layout and the walker over live frames.
//!
//! On entry to a generated method the stack holds, from low to high
//! addresses: the return address, then three caller-pushed linkage cells
//! (thread pointer, method reference, previous-frame pointer), then the
//! parameters. The prologue pushes the caller's base pointer and adopts the
//! stack pointer, so from the method's base the cells sit at the fixed
//! offsets below. Non-parameter locals and the operand stack grow downward
//! from the base.
//!
//! A *frame token* is the value the `caller` trampoline publishes in the
//! thread: it points `FRAME_FOOTPRINT + BYTES_PER_WORD` above the stack
//! pointer at the moment a generated method calls into the runtime. Four
//! words below it is the interrupted method's return address into its own
//! code (the native IP used for handler lookup); five words below is the
//! word where the callee's prologue saved that method's base pointer. The
//! previous-frame cell of each frame holds the token of its caller, so the
//! same arithmetic walks the whole chain. The chain ends with a null token
//! at the outermost host entry.

use crate::{BYTES_PER_WORD};
use super::machine::{Method};

pub const FRAME_THREAD: usize = BYTES_PER_WORD * 2;
pub const FRAME_METHOD: usize = BYTES_PER_WORD * 3;
pub const FRAME_NEXT: usize = BYTES_PER_WORD * 4;
pub const FRAME_FOOTPRINT: usize = BYTES_PER_WORD * 3;

/// A frame token; see the module documentation.
pub type Frame = *mut usize;

const FOOTPRINT_WORDS: isize = (FRAME_FOOTPRINT / BYTES_PER_WORD) as isize;

/// The interrupted method's saved base pointer.
pub unsafe fn frame_base(frame: Frame) -> *mut usize {
    *frame.offset(-FOOTPRINT_WORDS - 2) as *mut usize
}

pub fn frame_valid(frame: Frame) -> bool {
    !frame.is_null()
}

/// The caller's frame token, from the previous-frame linkage cell.
pub unsafe fn frame_next(frame: Frame) -> Frame {
    *frame_base(frame).add(FRAME_NEXT / BYTES_PER_WORD) as Frame
}

pub unsafe fn frame_method(frame: Frame) -> *mut Method {
    *frame_base(frame).add(FRAME_METHOD / BYTES_PER_WORD) as *mut Method
}

/// The native IP at which the frame's method is suspended: its return
/// address into its own code, saved by the call that left the method.
pub unsafe fn frame_address(frame: Frame) -> *const u8 {
    *frame.offset(-FOOTPRINT_WORDS - 1) as *const u8
}

/// The return address out of this frame, into the frame's caller.
pub unsafe fn frame_return_address(frame: Frame) -> *const u8 {
    *frame_base(frame).add(1) as *const u8
}

/// Native-IP offset of `address` within `method`'s compiled code.
pub unsafe fn address_offset(method: *mut Method, address: *const u8) -> usize {
    let compiled = (*method).compiled;
    address as usize - (*compiled).body() as usize
}

//-----------------------------------------------------------------------------

/// Maps logical local index `v` to a byte offset from the frame base.
/// `parameter_footprint` is in bytes. Parameters were pushed by the caller
/// and sit above the linkage cells in reverse index order; non-parameter
/// locals sit below the base.
pub fn local_offset(v: i32, parameter_footprint: i32) -> i32 {
    let word = BYTES_PER_WORD as i32;
    let v = v * word;
    if v < parameter_footprint {
        (parameter_footprint - v - word) + (word * 2) + FRAME_FOOTPRINT as i32
    } else {
        -(v + word - parameter_footprint)
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const W: i32 = BYTES_PER_WORD as i32;

    #[test]
    fn parameter_locals_descend_from_the_top() {
        // Three parameter slots: local 0 highest, contiguous downward.
        let footprint = 3 * W;
        assert_eq!(local_offset(0, footprint), 7 * W);
        assert_eq!(local_offset(1, footprint), 6 * W);
        assert_eq!(local_offset(2, footprint), 5 * W);
    }

    #[test]
    fn non_parameter_locals_grow_downward() {
        let footprint = 2 * W;
        // First non-parameter local is the word just below the saved base.
        assert_eq!(local_offset(2, footprint), -W);
        assert_eq!(local_offset(3, footprint), -2 * W);
        // With no parameters at all.
        assert_eq!(local_offset(0, 0), -W);
    }

    #[test]
    fn linkage_cells_sit_between_return_address_and_parameters() {
        let footprint = 1 * W;
        // The single parameter lives just above the previous-frame cell.
        assert_eq!(local_offset(0, footprint), FRAME_NEXT as i32 + W);
    }

    #[test]
    fn walker_arithmetic() {
        // Fabricate the memory around one suspended frame:
        //   stack[0]  saved base pointer (written by the runtime callee)
        //   stack[1]  return address into the method
        //   token = &stack[5]
        // and the method's own frame records at base:
        //   base[1]   return address out of the method
        //   base[3]   method
        //   base[4]   previous frame token
        let method = 0x1234 as *mut Method;
        let mut base = [0usize; 5];
        base[1] = 0xBEEF;
        base[3] = method as usize;
        base[4] = 0; // outermost

        let mut stack = [0usize; 5];
        stack[0] = base.as_mut_ptr() as usize;
        stack[1] = 0xCAFE;
        let token: Frame = unsafe { stack.as_mut_ptr().add(5) };

        unsafe {
            assert!(frame_valid(token));
            assert_eq!(frame_base(token), base.as_mut_ptr());
            assert_eq!(frame_address(token) as usize, 0xCAFE);
            assert_eq!(frame_method(token), method);
            assert_eq!(frame_return_address(token) as usize, 0xBEEF);
            assert!(!frame_valid(frame_next(token)));
        }
    }
}
