// x86_64 System V. Callee-saved state is rbx, rbp, r12-r15, the MXCSR control
// bits and the x87 control word. The ABI requires (rsp + 8) to be 16 byte
// aligned at function entry.
use std::arch::naked_asm;
use std::ffi::c_void;

use super::{fiber_exit, Entry};

pub const STACK_ALIGNMENT: usize = 16;

// MXCSR 0x1f80 in the low half, x87 control word 0x037f in the high half.
const INITIAL_FPU_STATE: usize = 0x037f_0000_1f80;

/// Writes the initial frame for `entry(arg)` below `floor` and returns the stack
/// pointer to hand to [swap].
///
/// # Safety
///
/// At least 80 bytes below `floor` must be writable.
pub unsafe fn init(floor: *mut u8, entry: Entry, arg: *mut c_void) -> *mut u8 {
    unsafe fn push(mut sp: *mut usize, val: usize) -> *mut usize {
        sp = sp.offset(-1);
        *sp = val;
        sp
    }

    let mut sp = (floor as usize & !(STACK_ALIGNMENT - 1)) as *mut usize;
    sp = push(sp, 0); // alignment
    sp = push(sp, 0); // return address of the trampoline, terminates backtraces
    sp = push(sp, trampoline as usize);
    sp = push(sp, 0); // rbp
    sp = push(sp, 0); // rbx
    sp = push(sp, entry as usize); // r12
    sp = push(sp, arg as usize); // r13
    sp = push(sp, 0); // r14
    sp = push(sp, 0); // r15
    sp = push(sp, INITIAL_FPU_STATE);
    sp as *mut u8
}

// Entered through the `ret` of the first `swap`, with rsp 16 byte aligned.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // The entry returned. There is nothing to return to.
        "call {exit}",
        "ud2",
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
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        // Pivot.
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}
