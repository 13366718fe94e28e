// AAPCS64. Callee-saved state is x19-x28, the frame pointer x29, the link
// register x30 and the low halves of v8-v15 (d8-d15). sp must always be 16
// byte aligned.
use std::arch::naked_asm;
use std::ffi::c_void;

use super::{fiber_exit, Entry};

pub const STACK_ALIGNMENT: usize = 16;

const FRAME_WORDS: usize = 20;
const X19: usize = 0;
const X20: usize = 1;
const LR: usize = 11;

/// Writes the initial frame for `entry(arg)` below `floor` and returns the stack
/// pointer to hand to [swap].
///
/// # Safety
///
/// At least 160 bytes below `floor` must be writable.
pub unsafe fn init(floor: *mut u8, entry: Entry, arg: *mut c_void) -> *mut u8 {
    let floor = (floor as usize & !(STACK_ALIGNMENT - 1)) as *mut usize;
    let sp = floor.sub(FRAME_WORDS);
    for slot in 0..FRAME_WORDS {
        *sp.add(slot) = 0;
    }
    *sp.add(X19) = entry as usize;
    *sp.add(X20) = arg as usize;
    // x29 stays 0 so frame pointer walks stop at the trampoline.
    *sp.add(LR) = trampoline as usize;
    sp as *mut u8
}

#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // The entry returned. There is nothing to return to.
        "bl {exit}",
        "brk #0x1",
        exit = sym fiber_exit,
    )
}

/// Saves the callee-saved registers of the running context, stores its stack pointer
/// in `out_sp` and resumes the context suspended at `in_sp`.
///
/// # Safety
///
/// `in_sp` must be a stack pointer produced by [init] or stored by an earlier `swap`,
/// and the stack behind it must still be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(_out_sp: *mut *mut u8, _in_sp: *mut u8) {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        // Pivot.
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    )
}
