//! The method compiler: walks a method's bytecode and emits its native
//! translation, together with the shared trampolines the runtime needs.
//!
//! The translation preserves the abstract operand-stack effect of every
//! instruction. The operand stack is the machine stack; each push/pop of
//! the abstract machine maps to a real push/pop. `rax`, `rcx`, `rdx`,
//! `rbx` and `rsi` are scratch; `rdi` holds a pointer to the method's
//! constant-pool array between runtime calls and is lazily reloaded after
//! anything that may clobber it.
//!
//! Longs and doubles occupy two stack slots. On 32-bit the slots hold the
//! low and high words (low on top) and arithmetic uses carry-propagating
//! instruction pairs; on 64-bit one slot carries the value and the slot
//! above it is padding, so slot indexing stays uniform across builds.

use std::mem::offset_of;

use log::debug;

use crate::{BYTES_PER_WORD, log_bytes_per_word};
use super::buffer::{Buffer, VecU8};
use super::bytecode::{self, op, read_i16, read_i32, read_u8, read_u16};
use super::compiled::{Compiled, COMPILED_BODY};
use super::frame::{local_offset, FRAME_FOOTPRINT, FRAME_METHOD, FRAME_THREAD};
use super::machine::{
    self, make_word_array, thread_frame_offset, Class, Code, Machine, Method, PoolEntry, Thread,
    ARRAY_BODY, INT_VALUE, LONG_VALUE, WEAK_REFERENCE_FLAG,
};
use super::runtime;
use super::x86::{Assembler, Condition, Label, Register, Width};
use Register::*;

const WORD: usize = BYTES_PER_WORD;

const METHOD_CODE: usize = offset_of!(Method, code);
const METHOD_COMPILED: usize = offset_of!(Method, compiled);
const CLASS_VTABLE: usize = offset_of!(Class, virtual_table);

/// x86-64 System V argument registers. The runtime-helper calling sequences
/// use the first three; full FFI marshalling goes through
/// `runtime::system_call` instead.
fn gp_register(index: usize) -> Register {
    match index {
        0 => Rdi,
        1 => Rsi,
        2 => Rdx,
        3 => Rcx,
        4 => R8,
        5 => R9,
        _ => panic!("no argument register {}", index),
    }
}

//-----------------------------------------------------------------------------

/// Per-compilation state: the assembler (code and jumps buffers), the
/// bytecode-IP → native-IP map as two parallel buffers in ascending
/// insertion order, the native line-number and handler tables under
/// construction, and the constant pool of object references the emitted
/// code will load through the pool register.
pub struct Compiler {
    t: *mut Thread,
    pub asm: Assembler,
    pool_register_clobbered: bool,
    java_ips: VecU8,
    machine_ips: VecU8,
    line_numbers: VecU8,
    exception_handlers: VecU8,
    pool: VecU8,
}

impl Compiler {
    pub fn new(t: *mut Thread) -> Self {
        Compiler {
            t,
            asm: Assembler::new(),
            pool_register_clobbered: true,
            java_ips: VecU8::new(1024),
            machine_ips: VecU8::new(1024),
            line_numbers: VecU8::new(256),
            exception_handlers: VecU8::new(256),
            pool: VecU8::new(256),
        }
    }

    fn thread(&mut self) -> &mut Thread {
        unsafe { &mut *self.t }
    }

    fn machine(&self) -> &Machine {
        unsafe { (*self.t).machine() }
    }

    // Long helpers. Two slots per value; see the module documentation.

    fn push_long_imm(&mut self, v: u64) {
        if WORD == 8 {
            self.asm.push_address(v as usize);
            self.asm.sub_imm(8, Rsp);
        } else {
            self.asm.push_imm((v >> 32) as i32);
            self.asm.push_imm(v as i32);
        }
    }

    /// 64-bit only: value from `reg`, padding slot on top.
    fn push_long_reg(&mut self, reg: Register) {
        assert_eq!(WORD, 8);
        self.asm.push(reg);
        self.asm.sub_imm(8, Rsp);
    }

    /// 32-bit only.
    fn push_long_pair(&mut self, low: Register, high: Register) {
        assert_eq!(WORD, 4);
        self.asm.push(high);
        self.asm.push(low);
    }

    /// 64-bit only: drops the padding slot, pops the value.
    fn pop_long_reg(&mut self, reg: Register) {
        assert_eq!(WORD, 8);
        self.asm.add_imm(8, Rsp);
        self.asm.pop(reg);
    }

    /// 32-bit only.
    fn pop_long_pair(&mut self, low: Register, high: Register) {
        assert_eq!(WORD, 4);
        self.asm.pop(low);
        self.asm.pop(high);
    }

    fn load_long(&mut self, index: i32, parameter_footprint: i32) {
        if WORD == 8 {
            self.asm.push_mem(Rbp, local_offset(index, parameter_footprint));
            self.asm.sub_imm(8, Rsp);
        } else {
            self.asm.push_mem(Rbp, local_offset(index + 1, parameter_footprint));
            self.asm.push_mem(Rbp, local_offset(index, parameter_footprint));
        }
    }

    fn store_long(&mut self, index: i32, parameter_footprint: i32) {
        if WORD == 8 {
            self.asm.add_imm(8, Rsp);
            self.asm.pop_mem(Rbp, local_offset(index, parameter_footprint));
        } else {
            self.asm.pop_mem(Rbp, local_offset(index, parameter_footprint));
            self.asm.pop_mem(Rbp, local_offset(index + 1, parameter_footprint));
        }
    }

    /// Pushes a call's return value (in `rax`, or `rax:rdx` for two-word
    /// longs on 32-bit) according to the callee's return type code.
    fn push_return_value(&mut self, code: u8) {
        match code {
            bytecode::BYTE_FIELD
            | bytecode::BOOLEAN_FIELD
            | bytecode::CHAR_FIELD
            | bytecode::SHORT_FIELD
            | bytecode::FLOAT_FIELD
            | bytecode::INT_FIELD
            | bytecode::OBJECT_FIELD => {
                self.asm.push(Rax);
            }
            bytecode::LONG_FIELD | bytecode::DOUBLE_FIELD => {
                if WORD == 8 {
                    self.push_long_reg(Rax);
                } else {
                    self.push_long_pair(Rax, Rdx);
                }
            }
            bytecode::VOID_FIELD => {}
            _ => panic!("bad return code {}", code),
        }
    }

    // The constant pool and the pool register.

    /// Appends `o` to the embedded pool without touching the code buffer.
    /// Returns the element index.
    fn pool_append(&mut self, o: usize) -> usize {
        self.pool.append_address(o);
        self.pool.len() / WORD - 1
    }

    /// Appends `o` to the embedded pool and returns its byte offset within
    /// the pool array object, for a pool-register-relative load. Reloads
    /// the pool register first if an intervening call may have clobbered
    /// it.
    fn pool_reference(&mut self, o: usize) -> i32 {
        if self.pool_register_clobbered {
            self.asm.load(Rbp, FRAME_METHOD as i32, Rdi);
            self.asm.load(Rdi, METHOD_CODE as i32, Rdi);
            self.pool_register_clobbered = false;
        }
        self.pool_append(o);
        (self.pool.len() + WORD) as i32
    }

    /// The pool as a heap array object, or null if no constants were
    /// embedded.
    pub fn make_pool(&mut self) -> machine::Object {
        if self.pool.is_empty() {
            return std::ptr::null_mut();
        }
        unsafe {
            let array = make_word_array(self.machine(), self.pool.len() / WORD);
            std::ptr::copy_nonoverlapping(
                self.pool.as_ptr(),
                machine::array_body(array),
                self.pool.len(),
            );
            array
        }
    }

    // Runtime-helper calling sequences. The helper address goes in `rbx`;
    // the `caller` trampoline publishes the frame and tail-jumps to it.

    fn call_address(&mut self, function: usize) {
        self.asm.const_(function, Rax);
        self.asm.call(Rax);
        self.pool_register_clobbered = true;
    }

    /// Like [`call_address`](Compiler::call_address) but with the target
    /// immediate on a word boundary, so the call site can later be
    /// repointed atomically.
    fn call_aligned_address(&mut self, function: usize) {
        self.asm.aligned_const_(function, Rax);
        self.asm.call(Rax);
        self.pool_register_clobbered = true;
    }

    fn caller_code(&mut self) -> usize {
        unsafe { (*runtime::caller(self.thread())).body() as usize }
    }

    fn compile_call2(&mut self, function: usize, arg_count: usize) {
        if WORD == 4 {
            self.asm.push_mem(Rbp, FRAME_THREAD as i32);
        } else {
            self.asm.load(Rbp, FRAME_THREAD as i32, gp_register(0));
        }

        self.asm.const_(function, Rbx);

        let caller = self.caller_code();
        self.call_address(caller);

        if WORD == 4 {
            self.asm.add_imm((WORD * arg_count) as i32, Rsp);
        }
    }

    fn compile_call_0(&mut self, function: usize) {
        self.compile_call2(function, 1);
    }

    fn compile_call_obj(&mut self, function: usize, arg1: usize) {
        let reference = self.pool_reference(arg1);
        if WORD == 4 {
            self.asm.push_mem(Rdi, reference);
        } else {
            self.asm.load(Rdi, reference, gp_register(1));
        }
        self.compile_call2(function, 2);
    }

    fn compile_call_reg(&mut self, function: usize, arg1: Register) {
        if WORD == 4 {
            self.asm.push(arg1);
        } else {
            self.asm.mov(arg1, gp_register(1));
        }
        self.compile_call2(function, 2);
    }

    fn compile_call_obj_reg(&mut self, function: usize, arg1: usize, arg2: Register) {
        let reference = self.pool_reference(arg1);
        if WORD == 4 {
            self.asm.push(arg2);
            self.asm.push_mem(Rdi, reference);
        } else {
            self.asm.mov(arg2, gp_register(2));
            self.asm.load(Rdi, reference, gp_register(1));
        }
        self.compile_call2(function, 3);
    }

    fn compile_call_ptr_reg(&mut self, function: usize, arg1: usize, arg2: Register) {
        if WORD == 4 {
            self.asm.push(arg2);
            self.asm.push_address(arg1);
        } else {
            self.asm.mov(arg2, gp_register(2));
            self.asm.const_(arg1, gp_register(1));
        }
        self.compile_call2(function, 3);
    }

    fn compile_call_reg_reg(&mut self, function: usize, arg1: Register, arg2: Register) {
        if WORD == 4 {
            self.asm.push(arg2);
            self.asm.push(arg1);
        } else {
            self.asm.mov(arg2, gp_register(2));
            self.asm.mov(arg1, gp_register(1));
        }
        self.compile_call2(function, 3);
    }

    /// Emits a direct call: the three linkage pushes, an aligned call to
    /// the target's current compiled body (initially the shared stub), the
    /// stack adjustment, and the return-value push.
    fn compile_direct_invoke(&mut self, target: *mut Method) {
        let (footprint, return_code, body) = unsafe {
            let t = &*target;
            (
                FRAME_FOOTPRINT + t.parameter_footprint * WORD,
                t.return_code,
                (*t.compiled).body() as usize,
            )
        };

        let target_ref = self.pool_reference(target as usize);
        self.asm.push(Rsp);
        self.asm.push_mem(Rdi, target_ref);
        self.asm.push_mem(Rbp, FRAME_THREAD as i32);

        self.call_aligned_address(body);

        self.asm.add_imm(footprint as i32, Rsp);

        self.push_return_value(return_code);
    }

    /// Bounds check shared by the array access translations: index in
    /// `rcx`, array in `rax`, length scratch in `length`. Branches to
    /// `out_of_bounds` on failure and leaves `rax` pointing at element 0,
    /// `rcx` a normalised element index.
    fn array_check(&mut self, length: Register, out_of_bounds: &mut Label) {
        self.asm.cmp4_imm(0, Rcx);
        self.asm.jump_if(Condition::L, out_of_bounds);

        self.asm.load(Rax, WORD as i32, length);
        self.asm.cmp4(length, Rcx);
        self.asm.jump_if(Condition::GE, out_of_bounds);

        self.asm.add_imm(ARRAY_BODY as i32, Rax);
        if WORD == 8 {
            // The index was checked as a 32-bit value; clear whatever the
            // upper half holds before it scales into an address.
            self.asm.mov4(Rcx, Rcx);
        }
    }

    //-------------------------------------------------------------------------

    /// Translates `method`'s bytecode. On a resolution failure the pending
    /// exception is set and `None` returned; nothing is installed.
    pub fn compile(&mut self, method: *mut Method) -> Option<*mut Compiled> {
        let (code, parameter_footprint) = unsafe {
            let m = &*method;
            (&*m.bytecode, (m.parameter_footprint * WORD) as i32)
        };
        let local_footprint = (code.max_locals * WORD) as i32;

        self.asm.push(Rbp);
        self.asm.mov(Rsp, Rbp);

        if local_footprint > parameter_footprint {
            // reserve space for non-parameter locals
            self.asm.sub_imm(local_footprint - parameter_footprint, Rsp);
        }

        let mut line_number_index =
            if code.line_numbers.is_empty() { None } else { Some(0) };

        let body = &code.body;
        let pool = &code.pool;
        let mut ip = 0;
        while ip < body.len() {
            self.java_ips.append2(ip as u16);
            self.machine_ips.append4(self.asm.code.len() as u32);

            if let Some(index) = line_number_index {
                let entry = code.line_numbers[index];
                if entry.ip as usize == ip {
                    self.line_numbers.append4(self.asm.code.len() as u32);
                    self.line_numbers.append4(u32::from(entry.line));
                    line_number_index = if index + 1 < code.line_numbers.len() {
                        Some(index + 1)
                    } else {
                        None
                    };
                }
            }

            let instruction = read_u8(body, &mut ip);

            match instruction {
                op::AALOAD
                | op::BALOAD
                | op::CALOAD
                | op::DALOAD
                | op::FALOAD
                | op::IALOAD
                | op::LALOAD
                | op::SALOAD => {
                    let mut next = Label::new();
                    let mut out_of_bounds = Label::new();

                    self.asm.pop(Rcx);
                    self.asm.pop(Rax);

                    self.array_check(Rdx, &mut out_of_bounds);

                    match instruction {
                        op::AALOAD => {
                            self.asm.shl_imm(log_bytes_per_word(), Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.push_mem(Rax, 0);
                        }
                        op::FALOAD | op::IALOAD => {
                            self.asm.shl_imm(2, Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.push4(Rax, 0);
                        }
                        op::BALOAD => {
                            self.asm.add(Rcx, Rax);
                            self.asm.load_narrow(Width::S8, Rax, 0, Rax);
                            self.asm.push(Rax);
                        }
                        op::CALOAD => {
                            self.asm.shl_imm(1, Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.load_narrow(Width::U16, Rax, 0, Rax);
                            self.asm.push(Rax);
                        }
                        op::SALOAD => {
                            self.asm.shl_imm(1, Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.load_narrow(Width::S16, Rax, 0, Rax);
                            self.asm.push(Rax);
                        }
                        op::DALOAD | op::LALOAD => {
                            self.asm.shl_imm(3, Rcx);
                            self.asm.add(Rcx, Rax);
                            if WORD == 8 {
                                self.asm.push_mem(Rax, 0);
                                self.asm.sub_imm(8, Rsp);
                            } else {
                                self.asm.push4(Rax, 4);
                                self.asm.push4(Rax, 0);
                            }
                        }
                        _ => unreachable!(),
                    }

                    self.asm.jmp(&mut next);

                    out_of_bounds.mark(&mut self.asm.code);
                    let class = self.machine().types.array_index_out_of_bounds_exception;
                    self.compile_call_obj(runtime::throw_new as usize, class.0 as usize);

                    next.mark(&mut self.asm.code);
                }

                op::AASTORE
                | op::BASTORE
                | op::CASTORE
                | op::DASTORE
                | op::FASTORE
                | op::IASTORE
                | op::LASTORE
                | op::SASTORE => {
                    let mut next = Label::new();
                    let mut out_of_bounds = Label::new();

                    if instruction == op::DASTORE || instruction == op::LASTORE {
                        if WORD == 8 {
                            self.asm.add_imm(8, Rsp);
                            self.asm.pop(Rbx);
                        } else {
                            self.asm.pop(Rbx);
                            self.asm.pop(Rdx);
                        }
                    } else {
                        self.asm.pop(Rbx);
                    }
                    self.asm.pop(Rcx);
                    self.asm.pop(Rax);

                    self.array_check(Rsi, &mut out_of_bounds);

                    match instruction {
                        op::AASTORE => {
                            self.asm.shl_imm(log_bytes_per_word(), Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.store(Rbx, Rax, 0);
                        }
                        op::FASTORE | op::IASTORE => {
                            self.asm.shl_imm(2, Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.store4(Rbx, Rax, 0);
                        }
                        op::BASTORE => {
                            self.asm.add(Rcx, Rax);
                            self.asm.store1(Rbx, Rax, 0);
                        }
                        op::CASTORE | op::SASTORE => {
                            self.asm.shl_imm(1, Rcx);
                            self.asm.add(Rcx, Rax);
                            self.asm.store2(Rbx, Rax, 0);
                        }
                        op::DASTORE | op::LASTORE => {
                            self.asm.shl_imm(3, Rcx);
                            self.asm.add(Rcx, Rax);
                            if WORD == 8 {
                                self.asm.store(Rbx, Rax, 0);
                            } else {
                                self.asm.store4(Rbx, Rax, 0);
                                self.asm.store4(Rdx, Rax, 4);
                            }
                        }
                        _ => unreachable!(),
                    }

                    self.asm.jmp(&mut next);

                    out_of_bounds.mark(&mut self.asm.code);
                    let class = self.machine().types.array_index_out_of_bounds_exception;
                    self.compile_call_obj(runtime::throw_new as usize, class.0 as usize);

                    next.mark(&mut self.asm.code);
                }

                op::ACONST_NULL => {
                    self.asm.push_imm(0);
                }

                op::ALOAD | op::ILOAD | op::FLOAD => {
                    let index = read_u8(body, &mut ip) as i32;
                    self.asm.push_mem(Rbp, local_offset(index, parameter_footprint));
                }

                op::ALOAD_0 | op::ILOAD_0 | op::FLOAD_0 => {
                    self.asm.push_mem(Rbp, local_offset(0, parameter_footprint));
                }
                op::ALOAD_1 | op::ILOAD_1 | op::FLOAD_1 => {
                    self.asm.push_mem(Rbp, local_offset(1, parameter_footprint));
                }
                op::ALOAD_2 | op::ILOAD_2 | op::FLOAD_2 => {
                    self.asm.push_mem(Rbp, local_offset(2, parameter_footprint));
                }
                op::ALOAD_3 | op::ILOAD_3 | op::FLOAD_3 => {
                    self.asm.push_mem(Rbp, local_offset(3, parameter_footprint));
                }

                op::ANEWARRAY => {
                    let index = read_u16(body, &mut ip);
                    let class =
                        unsafe { machine::resolve_class(self.thread(), pool, index as usize - 1)? };

                    let mut nonnegative = Label::new();

                    self.asm.pop(Rax);
                    self.asm.cmp4_imm(0, Rax);
                    self.asm.jump_if(Condition::GE, &mut nonnegative);

                    let exception = self.machine().types.negative_array_size_exception;
                    self.compile_call_obj(runtime::throw_new as usize, exception.0 as usize);

                    nonnegative.mark(&mut self.asm.code);
                    self.compile_call_obj_reg(
                        runtime::make_blank_object_array as usize,
                        class as usize,
                        Rax,
                    );
                    self.asm.push(Rax);
                }

                op::ARETURN | op::IRETURN | op::FRETURN => {
                    self.asm.pop(Rax);
                    self.asm.mov(Rbp, Rsp);
                    self.asm.pop(Rbp);
                    self.asm.ret();
                }

                op::LRETURN | op::DRETURN => {
                    if WORD == 8 {
                        self.pop_long_reg(Rax);
                    } else {
                        self.pop_long_pair(Rax, Rdx);
                    }
                    self.asm.mov(Rbp, Rsp);
                    self.asm.pop(Rbp);
                    self.asm.ret();
                }

                op::ARRAYLENGTH => {
                    self.asm.pop(Rax);
                    self.asm.push_mem(Rax, WORD as i32);
                }

                op::ASTORE | op::ISTORE | op::FSTORE => {
                    let index = read_u8(body, &mut ip) as i32;
                    self.asm.pop_mem(Rbp, local_offset(index, parameter_footprint));
                }

                op::ASTORE_0 | op::ISTORE_0 | op::FSTORE_0 => {
                    self.asm.pop_mem(Rbp, local_offset(0, parameter_footprint));
                }
                op::ASTORE_1 | op::ISTORE_1 | op::FSTORE_1 => {
                    self.asm.pop_mem(Rbp, local_offset(1, parameter_footprint));
                }
                op::ASTORE_2 | op::ISTORE_2 | op::FSTORE_2 => {
                    self.asm.pop_mem(Rbp, local_offset(2, parameter_footprint));
                }
                op::ASTORE_3 | op::ISTORE_3 | op::FSTORE_3 => {
                    self.asm.pop_mem(Rbp, local_offset(3, parameter_footprint));
                }

                op::ATHROW => {
                    self.asm.pop(Rax);
                    self.compile_call_reg(runtime::throw_ as usize, Rax);
                }

                op::BIPUSH => {
                    let v = read_u8(body, &mut ip) as i8;
                    self.asm.push_imm(v as i32);
                }

                op::CHECKCAST => {
                    let index = read_u16(body, &mut ip);
                    let class =
                        unsafe { machine::resolve_class(self.thread(), pool, index as usize - 1)? };

                    let mut next = Label::new();

                    self.asm.load(Rsp, 0, Rax);
                    self.asm.cmp_imm(0, Rax);
                    self.asm.jump_if(Condition::Z, &mut next);

                    let class_ref = self.pool_reference(class as usize);
                    self.asm.load(Rdi, class_ref, Rcx);
                    self.asm.load(Rax, 0, Rax);
                    self.asm.cmp(Rcx, Rax);
                    self.asm.jump_if(Condition::Z, &mut next);

                    self.compile_call_reg_reg(runtime::is_assignable_from as usize, Rcx, Rax);
                    self.asm.cmp4_imm(0, Rax);
                    self.asm.jump_if(Condition::NZ, &mut next);

                    let exception = self.machine().types.class_cast_exception;
                    self.compile_call_obj(runtime::throw_new as usize, exception.0 as usize);

                    next.mark(&mut self.asm.code);
                }

                op::DUP => {
                    self.asm.push_mem(Rsp, 0);
                }

                op::GETFIELD => {
                    let index = read_u16(body, &mut ip);
                    let field =
                        unsafe { machine::resolve_field(self.thread(), pool, index as usize - 1)? };
                    let (field_code, offset) = unsafe { ((*field).code, (*field).offset as i32) };

                    self.asm.pop(Rax);

                    match field_code {
                        bytecode::BYTE_FIELD | bytecode::BOOLEAN_FIELD => {
                            self.asm.load_narrow(Width::S8, Rax, offset, Rax);
                            self.asm.push(Rax);
                        }
                        bytecode::CHAR_FIELD => {
                            self.asm.load_narrow(Width::U16, Rax, offset, Rax);
                            self.asm.push(Rax);
                        }
                        bytecode::SHORT_FIELD => {
                            self.asm.load_narrow(Width::S16, Rax, offset, Rax);
                            self.asm.push(Rax);
                        }
                        bytecode::FLOAT_FIELD | bytecode::INT_FIELD => {
                            self.asm.push4(Rax, offset);
                        }
                        bytecode::DOUBLE_FIELD | bytecode::LONG_FIELD => {
                            if WORD == 8 {
                                self.asm.push_mem(Rax, offset);
                                self.asm.sub_imm(8, Rsp);
                            } else {
                                self.asm.push4(Rax, offset + 4);
                                self.asm.push4(Rax, offset);
                            }
                        }
                        bytecode::OBJECT_FIELD => {
                            self.asm.push_mem(Rax, offset);
                        }
                        _ => panic!("bad field code {}", field_code),
                    }
                }

                op::GETSTATIC => {
                    let index = read_u16(body, &mut ip);
                    let field =
                        unsafe { machine::resolve_field(self.thread(), pool, index as usize - 1)? };
                    let (field_code, offset, field_class) =
                        unsafe { ((*field).code, (*field).offset, (*field).class) };

                    runtime::init_class(self.thread(), field_class);
                    if !self.thread().exception.is_null() {
                        return None;
                    }

                    let table = unsafe { (*field_class).static_table };

                    let table_ref = self.pool_reference(table as usize);
                    self.asm.load(Rdi, table_ref, Rax);
                    self.asm.add_imm((offset * WORD + ARRAY_BODY) as i32, Rax);
                    // The cell holds null until the first store.
                    self.asm.load(Rax, 0, Rax);

                    match field_code {
                        bytecode::BYTE_FIELD
                        | bytecode::BOOLEAN_FIELD
                        | bytecode::CHAR_FIELD
                        | bytecode::SHORT_FIELD
                        | bytecode::FLOAT_FIELD
                        | bytecode::INT_FIELD => {
                            let mut zero = Label::new();
                            let mut next = Label::new();

                            self.asm.cmp_imm(0, Rax);
                            self.asm.jump_if(Condition::Z, &mut zero);

                            self.asm.push4(Rax, INT_VALUE as i32);
                            self.asm.jmp(&mut next);

                            zero.mark(&mut self.asm.code);
                            self.asm.push_imm(0);

                            next.mark(&mut self.asm.code);
                        }
                        bytecode::DOUBLE_FIELD | bytecode::LONG_FIELD => {
                            let mut zero = Label::new();
                            let mut next = Label::new();

                            self.asm.cmp_imm(0, Rax);
                            self.asm.jump_if(Condition::Z, &mut zero);

                            if WORD == 8 {
                                self.asm.push_mem(Rax, LONG_VALUE as i32);
                                self.asm.sub_imm(8, Rsp);
                            } else {
                                self.asm.push4(Rax, LONG_VALUE as i32 + 4);
                                self.asm.push4(Rax, LONG_VALUE as i32);
                            }
                            self.asm.jmp(&mut next);

                            zero.mark(&mut self.asm.code);
                            self.asm.push_imm(0);
                            self.asm.push_imm(0);

                            next.mark(&mut self.asm.code);
                        }
                        bytecode::OBJECT_FIELD => {
                            self.asm.push(Rax);
                        }
                        _ => panic!("bad field code {}", field_code),
                    }
                }

                op::GOTO => {
                    let offset = read_i16(body, &mut ip) as i32;
                    self.asm.jmp_ip((ip as i32 - 3 + offset) as u16);
                }

                op::GOTO_W => {
                    let offset = read_i32(body, &mut ip);
                    self.asm.jmp_ip((ip as i32 - 5 + offset) as u16);
                }

                op::I2B => {
                    self.asm.load(Rsp, 0, Rax);
                    self.asm.widen(Width::S8, Rax, Rax);
                    self.asm.store(Rax, Rsp, 0);
                }

                op::I2C => {
                    self.asm.load(Rsp, 0, Rax);
                    self.asm.widen(Width::U16, Rax, Rax);
                    self.asm.store(Rax, Rsp, 0);
                }

                op::I2S => {
                    self.asm.load(Rsp, 0, Rax);
                    self.asm.widen(Width::S16, Rax, Rax);
                    self.asm.store(Rax, Rsp, 0);
                }

                op::I2L => {
                    if WORD == 8 {
                        self.asm.load(Rsp, 0, Rax);
                        self.asm.movsxd(Rax, Rax);
                        self.asm.store(Rax, Rsp, 0);
                        self.asm.sub_imm(8, Rsp);
                    } else {
                        self.asm.pop(Rax);
                        self.asm.cdq();
                        self.push_long_pair(Rax, Rdx);
                    }
                }

                op::IADD => {
                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.add(Rax, Rcx);
                    self.asm.push(Rcx);
                }

                op::ICONST_M1 => self.asm.push_imm(-1),
                op::ICONST_0 => self.asm.push_imm(0),
                op::ICONST_1 => self.asm.push_imm(1),
                op::ICONST_2 => self.asm.push_imm(2),
                op::ICONST_3 => self.asm.push_imm(3),
                op::ICONST_4 => self.asm.push_imm(4),
                op::ICONST_5 => self.asm.push_imm(5),

                op::IF_ACMPEQ | op::IF_ACMPNE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u16;

                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.cmp(Rax, Rcx);
                    let cc = if instruction == op::IF_ACMPEQ { Condition::Z } else { Condition::NZ };
                    self.asm.jump_if_ip(cc, target);
                }

                op::IF_ICMPEQ
                | op::IF_ICMPNE
                | op::IF_ICMPLT
                | op::IF_ICMPGE
                | op::IF_ICMPGT
                | op::IF_ICMPLE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u16;

                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.cmp4(Rax, Rcx);
                    let cc = match instruction {
                        op::IF_ICMPEQ => Condition::Z,
                        op::IF_ICMPNE => Condition::NZ,
                        op::IF_ICMPLT => Condition::L,
                        op::IF_ICMPGE => Condition::GE,
                        op::IF_ICMPGT => Condition::G,
                        op::IF_ICMPLE => Condition::LE,
                        _ => unreachable!(),
                    };
                    self.asm.jump_if_ip(cc, target);
                }

                op::IFEQ | op::IFNE | op::IFLT | op::IFGE | op::IFGT | op::IFLE => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u16;

                    self.asm.pop(Rax);
                    self.asm.cmp4_imm(0, Rax);
                    let cc = match instruction {
                        op::IFEQ => Condition::Z,
                        op::IFNE => Condition::NZ,
                        op::IFLT => Condition::L,
                        op::IFGE => Condition::GE,
                        op::IFGT => Condition::G,
                        op::IFLE => Condition::LE,
                        _ => unreachable!(),
                    };
                    self.asm.jump_if_ip(cc, target);
                }

                op::IFNULL | op::IFNONNULL => {
                    let offset = read_i16(body, &mut ip) as i32;
                    let target = (ip as i32 - 3 + offset) as u16;

                    self.asm.pop(Rax);
                    self.asm.cmp_imm(0, Rax);
                    let cc = if instruction == op::IFNULL { Condition::Z } else { Condition::NZ };
                    self.asm.jump_if_ip(cc, target);
                }

                op::IINC => {
                    let index = read_u8(body, &mut ip) as i32;
                    let c = read_u8(body, &mut ip) as i8;

                    self.asm.add_imm_mem(
                        c as i32,
                        Rbp,
                        local_offset(index, parameter_footprint),
                    );
                }

                op::IMUL => {
                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.imul(Rcx);
                    self.asm.push(Rax);
                }

                op::IDIV | op::IREM => {
                    let mut nonzero = Label::new();
                    let mut negate = Label::new();
                    let mut next = Label::new();

                    self.asm.pop(Rcx);
                    self.asm.pop(Rax);

                    self.asm.cmp4_imm(0, Rcx);
                    self.asm.jump_if(Condition::NZ, &mut nonzero);

                    let exception = self.machine().types.arithmetic_exception;
                    self.compile_call_obj(runtime::throw_new as usize, exception.0 as usize);

                    nonzero.mark(&mut self.asm.code);
                    // A -1 divisor goes through negation: the hardware
                    // divide would fault on the minimum dividend.
                    self.asm.cmp4_imm(-1, Rcx);
                    self.asm.jump_if(Condition::Z, &mut negate);

                    self.asm.cdq();
                    self.asm.idiv4(Rcx);
                    self.asm.push(if instruction == op::IDIV { Rax } else { Rdx });
                    self.asm.jmp(&mut next);

                    negate.mark(&mut self.asm.code);
                    if instruction == op::IDIV {
                        self.asm.neg(Rax);
                        self.asm.push(Rax);
                    } else {
                        self.asm.push_imm(0);
                    }

                    next.mark(&mut self.asm.code);
                }

                op::INEG => {
                    self.asm.neg_mem(Rsp, 0);
                }

                op::IAND => {
                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.and_(Rax, Rcx);
                    self.asm.push(Rcx);
                }

                op::IOR => {
                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.or_(Rax, Rcx);
                    self.asm.push(Rcx);
                }

                op::IXOR => {
                    self.asm.pop(Rax);
                    self.asm.pop(Rcx);
                    self.asm.xor_(Rax, Rcx);
                    self.asm.push(Rcx);
                }

                op::INSTANCEOF => {
                    let index = read_u16(body, &mut ip);
                    let class =
                        unsafe { machine::resolve_class(self.thread(), pool, index as usize - 1)? };

                    let mut call = Label::new();
                    let mut zero = Label::new();
                    let mut next = Label::new();

                    self.asm.pop(Rax);
                    self.asm.cmp_imm(0, Rax);
                    self.asm.jump_if(Condition::Z, &mut zero);

                    let class_ref = self.pool_reference(class as usize);
                    self.asm.load(Rdi, class_ref, Rcx);
                    self.asm.load(Rax, 0, Rax);
                    self.asm.cmp(Rcx, Rax);
                    self.asm.jump_if(Condition::NZ, &mut call);

                    self.asm.push_imm(1);
                    self.asm.jmp(&mut next);

                    call.mark(&mut self.asm.code);
                    self.compile_call_reg_reg(runtime::is_assignable_from as usize, Rcx, Rax);
                    self.asm.push(Rax);
                    self.asm.jmp(&mut next);

                    zero.mark(&mut self.asm.code);
                    self.asm.push_imm(0);

                    next.mark(&mut self.asm.code);
                }

                op::INVOKESPECIAL => {
                    let index = read_u16(body, &mut ip);
                    let target =
                        unsafe { machine::resolve_method(self.thread(), pool, index as usize - 1)? };
                    self.compile_direct_invoke(target);
                }

                op::INVOKESTATIC => {
                    let index = read_u16(body, &mut ip);
                    let target =
                        unsafe { machine::resolve_method(self.thread(), pool, index as usize - 1)? };

                    runtime::init_class(self.thread(), unsafe { (*target).class });
                    if !self.thread().exception.is_null() {
                        return None;
                    }

                    self.compile_direct_invoke(target);
                }

                op::INVOKEVIRTUAL => {
                    let index = read_u16(body, &mut ip);
                    let target =
                        unsafe { machine::resolve_method(self.thread(), pool, index as usize - 1)? };
                    let (target_footprint, vtable_index, return_code) = unsafe {
                        let t = &*target;
                        (t.parameter_footprint * WORD, t.offset as usize, t.return_code)
                    };

                    let instance = (target_footprint - WORD) as i32;
                    let footprint = FRAME_FOOTPRINT + target_footprint;
                    let offset = (ARRAY_BODY + vtable_index * WORD) as i32;

                    self.asm.load(Rsp, instance, Rax); // load instance
                    self.asm.load(Rax, 0, Rax); // load class
                    self.asm.load(Rax, CLASS_VTABLE as i32, Rax); // load vtable
                    self.asm.load(Rax, offset, Rax); // load method

                    self.asm.push(Rsp);
                    self.asm.push(Rax);
                    self.asm.push_mem(Rbp, FRAME_THREAD as i32);

                    self.asm.load(Rax, METHOD_COMPILED as i32, Rax); // load artifact
                    self.asm.add_imm(COMPILED_BODY as i32, Rax);
                    self.asm.call(Rax);
                    self.pool_register_clobbered = true;

                    self.asm.add_imm(footprint as i32, Rsp); // pop arguments

                    self.push_return_value(return_code);
                }

                op::ISUB => {
                    self.asm.pop(Rax);
                    self.asm.sub_mem(Rax, Rsp, 0);
                }

                op::L2I => {
                    if WORD == 8 {
                        self.asm.add_imm(WORD as i32, Rsp);
                    } else {
                        self.asm.pop(Rax);
                        self.asm.store(Rax, Rsp, 0);
                    }
                }

                op::LADD => {
                    if WORD == 8 {
                        self.asm.add_imm(8, Rsp);
                        self.asm.pop(Rax);
                        self.asm.add_mem(Rax, Rsp, WORD as i32);
                    } else {
                        self.pop_long_pair(Rax, Rdx);
                        self.asm.add_mem(Rax, Rsp, 0);
                        self.asm.adc_mem(Rdx, Rsp, WORD as i32);
                    }
                }

                op::LDC | op::LDC_W => {
                    let index = if instruction == op::LDC {
                        read_u8(body, &mut ip) as u16
                    } else {
                        read_u16(body, &mut ip)
                    };

                    match pool[index as usize - 1] {
                        PoolEntry::Int(v) => {
                            self.asm.push_imm(v);
                        }
                        PoolEntry::Float(v) => {
                            self.asm.push_imm(v.to_bits() as i32);
                        }
                        PoolEntry::Str(s) => {
                            let reference = self.pool_reference(s.0 as usize);
                            self.asm.push_mem(Rdi, reference);
                        }
                        PoolEntry::Class(c) => {
                            let reference = self.pool_reference(c.0 as usize);
                            self.asm.push_mem(Rdi, reference);
                        }
                        _ => panic!("bad ldc pool entry {}", index),
                    }
                }

                op::LDC2_W => {
                    let index = read_u16(body, &mut ip);

                    match pool[index as usize - 1] {
                        PoolEntry::Long(v) => {
                            self.push_long_imm(v as u64);
                        }
                        PoolEntry::Double(v) => {
                            self.push_long_imm(v.to_bits());
                        }
                        _ => panic!("bad ldc2_w pool entry {}", index),
                    }
                }

                op::LCONST_0 => self.push_long_imm(0),
                op::LCONST_1 => self.push_long_imm(1),

                op::LCMP => {
                    let mut next = Label::new();
                    let mut less = Label::new();
                    let mut greater = Label::new();

                    if WORD == 8 {
                        self.pop_long_reg(Rax);
                        self.pop_long_reg(Rcx);

                        self.asm.cmp(Rax, Rcx);
                        self.asm.jump_if(Condition::L, &mut less);
                        self.asm.jump_if(Condition::G, &mut greater);

                        self.asm.push_imm(0);
                        self.asm.jmp(&mut next);

                        less.mark(&mut self.asm.code);
                        self.asm.push_imm(-1);
                        self.asm.jmp(&mut next);

                        greater.mark(&mut self.asm.code);
                        self.asm.push_imm(1);

                        next.mark(&mut self.asm.code);
                    } else {
                        self.pop_long_pair(Rax, Rdx);
                        self.pop_long_pair(Rcx, Rbx);

                        self.asm.cmp4(Rdx, Rbx);
                        self.asm.jump_if(Condition::L, &mut less);
                        self.asm.jump_if(Condition::G, &mut greater);

                        self.asm.cmp4(Rax, Rcx);
                        self.asm.jump_if(Condition::B, &mut less);
                        self.asm.jump_if(Condition::A, &mut greater);

                        self.asm.push_imm(0);
                        self.asm.jmp(&mut next);

                        less.mark(&mut self.asm.code);
                        self.asm.push_imm(-1);
                        self.asm.jmp(&mut next);

                        greater.mark(&mut self.asm.code);
                        self.asm.push_imm(1);

                        next.mark(&mut self.asm.code);
                    }
                }

                op::LDIV | op::LREM => {
                    if WORD == 8 {
                        let mut nonzero = Label::new();
                        let mut negate = Label::new();
                        let mut next = Label::new();

                        self.pop_long_reg(Rcx);
                        self.pop_long_reg(Rax);

                        self.asm.cmp_imm(0, Rcx);
                        self.asm.jump_if(Condition::NZ, &mut nonzero);

                        let exception = self.machine().types.arithmetic_exception;
                        self.compile_call_obj(runtime::throw_new as usize, exception.0 as usize);

                        nonzero.mark(&mut self.asm.code);
                        // A -1 divisor goes through negation: the hardware
                        // divide would fault on the minimum dividend.
                        self.asm.cmp_imm(-1, Rcx);
                        self.asm.jump_if(Condition::Z, &mut negate);

                        self.asm.cqo();
                        self.asm.idiv(Rcx);
                        self.push_long_reg(if instruction == op::LDIV { Rax } else { Rdx });
                        self.asm.jmp(&mut next);

                        negate.mark(&mut self.asm.code);
                        if instruction == op::LDIV {
                            self.asm.neg(Rax);
                            self.push_long_reg(Rax);
                        } else {
                            self.push_long_imm(0);
                        }

                        next.mark(&mut self.asm.code);
                    } else {
                        let helper = if instruction == op::LDIV {
                            runtime::divide_long as usize
                        } else {
                            runtime::modulo_long as usize
                        };
                        self.compile_call_0(helper);
                        self.asm.add_imm(8, Rsp);
                        self.asm.store(Rax, Rsp, 0);
                        self.asm.store(Rdx, Rsp, WORD as i32);
                    }
                }

                op::LLOAD => {
                    let index = read_u8(body, &mut ip) as i32;
                    self.load_long(index, parameter_footprint);
                }
                op::LLOAD_0 => self.load_long(0, parameter_footprint),
                op::LLOAD_1 => self.load_long(1, parameter_footprint),
                op::LLOAD_2 => self.load_long(2, parameter_footprint),
                op::LLOAD_3 => self.load_long(3, parameter_footprint),

                op::LMUL => {
                    if WORD == 8 {
                        self.pop_long_reg(Rax);
                        self.pop_long_reg(Rcx);
                        self.asm.imul(Rcx);
                        self.push_long_reg(Rax);
                    } else {
                        // Three-multiplication long multiply: cross terms
                        // into the high word, unsigned low*low for the rest.
                        self.asm.load(Rsp, 4, Rcx);
                        self.asm.imul4_mem(Rsp, 8, Rcx);
                        self.asm.load(Rsp, 12, Rax);
                        self.asm.imul4_mem(Rsp, 0, Rax);
                        self.asm.add(Rax, Rcx);
                        self.asm.load(Rsp, 8, Rax);
                        self.asm.mul_mem(Rsp, 0);
                        self.asm.add(Rcx, Rdx);

                        self.asm.add_imm(8, Rsp);
                        self.asm.store(Rax, Rsp, 0);
                        self.asm.store(Rdx, Rsp, 4);
                    }
                }

                op::LNEG => {
                    if WORD == 8 {
                        self.asm.neg_mem(Rsp, 8);
                    } else {
                        self.asm.load(Rsp, 0, Rax);
                        self.asm.load(Rsp, 4, Rdx);
                        self.asm.neg(Rax);
                        self.asm.adc_imm(0, Rdx);
                        self.asm.neg(Rdx);

                        self.asm.store(Rax, Rsp, 0);
                        self.asm.store(Rdx, Rsp, 4);
                    }
                }

                op::LSTORE => {
                    let index = read_u8(body, &mut ip) as i32;
                    self.store_long(index, parameter_footprint);
                }
                op::LSTORE_0 => self.store_long(0, parameter_footprint),
                op::LSTORE_1 => self.store_long(1, parameter_footprint),
                op::LSTORE_2 => self.store_long(2, parameter_footprint),
                op::LSTORE_3 => self.store_long(3, parameter_footprint),

                op::LSUB => {
                    if WORD == 8 {
                        self.asm.add_imm(8, Rsp);
                        self.asm.pop(Rax);
                        self.asm.sub_mem(Rax, Rsp, WORD as i32);
                    } else {
                        self.pop_long_pair(Rax, Rdx);
                        self.asm.sub_mem(Rax, Rsp, 0);
                        self.asm.sbb_mem(Rdx, Rsp, WORD as i32);
                    }
                }

                op::NEW => {
                    let index = read_u16(body, &mut ip);
                    let class =
                        unsafe { machine::resolve_class(self.thread(), pool, index as usize - 1)? };

                    runtime::init_class(self.thread(), class);
                    if !self.thread().exception.is_null() {
                        return None;
                    }

                    if unsafe { (*class).vm_flags } & WEAK_REFERENCE_FLAG != 0 {
                        self.compile_call_obj(
                            runtime::make_new_weak_reference as usize,
                            class as usize,
                        );
                    } else {
                        self.compile_call_obj(runtime::make_new as usize, class as usize);
                    }

                    self.asm.push(Rax);
                }

                op::NEWARRAY => {
                    let element_type = read_u8(body, &mut ip);

                    let mut nonnegative = Label::new();

                    self.asm.pop(Rax);
                    self.asm.cmp4_imm(0, Rax);
                    self.asm.jump_if(Condition::GE, &mut nonnegative);

                    let exception = self.machine().types.negative_array_size_exception;
                    self.compile_call_obj(runtime::throw_new as usize, exception.0 as usize);

                    nonnegative.mark(&mut self.asm.code);

                    let constructor: runtime::ArrayConstructor = match element_type {
                        bytecode::T_BOOLEAN => runtime::make_boolean_array,
                        bytecode::T_CHAR => runtime::make_char_array,
                        bytecode::T_FLOAT => runtime::make_float_array,
                        bytecode::T_DOUBLE => runtime::make_double_array,
                        bytecode::T_BYTE => runtime::make_byte_array,
                        bytecode::T_SHORT => runtime::make_short_array,
                        bytecode::T_INT => runtime::make_int_array,
                        bytecode::T_LONG => runtime::make_long_array,
                        _ => panic!("bad array type {}", element_type),
                    };

                    self.compile_call_ptr_reg(
                        runtime::make_blank_array as usize,
                        constructor as usize,
                        Rax,
                    );
                    self.asm.push(Rax);
                }

                op::NOP => {}

                op::POP => {
                    self.asm.add_imm(WORD as i32, Rsp);
                }

                op::PUTFIELD => {
                    let index = read_u16(body, &mut ip);
                    let field =
                        unsafe { machine::resolve_field(self.thread(), pool, index as usize - 1)? };
                    let (field_code, offset) = unsafe { ((*field).code, (*field).offset as i32) };

                    match field_code {
                        bytecode::BYTE_FIELD
                        | bytecode::BOOLEAN_FIELD
                        | bytecode::CHAR_FIELD
                        | bytecode::SHORT_FIELD
                        | bytecode::FLOAT_FIELD
                        | bytecode::INT_FIELD => {
                            self.asm.pop(Rcx);
                            self.asm.pop(Rax);
                            match field_code {
                                bytecode::BYTE_FIELD | bytecode::BOOLEAN_FIELD => {
                                    self.asm.store1(Rcx, Rax, offset);
                                }
                                bytecode::CHAR_FIELD | bytecode::SHORT_FIELD => {
                                    self.asm.store2(Rcx, Rax, offset);
                                }
                                _ => {
                                    self.asm.store4(Rcx, Rax, offset);
                                }
                            }
                        }
                        bytecode::DOUBLE_FIELD | bytecode::LONG_FIELD => {
                            if WORD == 8 {
                                self.asm.add_imm(8, Rsp);
                                self.asm.pop(Rcx);
                                self.asm.pop(Rax);
                                self.asm.store(Rcx, Rax, offset);
                            } else {
                                self.asm.pop(Rcx);
                                self.asm.pop(Rdx);
                                self.asm.pop(Rax);
                                self.asm.store4(Rcx, Rax, offset);
                                self.asm.store4(Rdx, Rax, offset + 4);
                            }
                        }
                        bytecode::OBJECT_FIELD => {
                            self.asm.pop(Rcx);
                            self.asm.pop(Rax);
                            self.asm.store(Rcx, Rax, offset);
                        }
                        _ => panic!("bad field code {}", field_code),
                    }
                }

                op::PUTSTATIC => {
                    let index = read_u16(body, &mut ip);
                    let field =
                        unsafe { machine::resolve_field(self.thread(), pool, index as usize - 1)? };
                    let (field_code, offset, field_class) =
                        unsafe { ((*field).code, (*field).offset, (*field).class) };

                    runtime::init_class(self.thread(), field_class);
                    if !self.thread().exception.is_null() {
                        return None;
                    }

                    let table = unsafe { (*field_class).static_table };

                    let table_ref = self.pool_reference(table as usize);
                    self.asm.load(Rdi, table_ref, Rax);
                    self.asm.add_imm((offset * WORD + ARRAY_BODY) as i32, Rax);

                    match field_code {
                        bytecode::BYTE_FIELD
                        | bytecode::BOOLEAN_FIELD
                        | bytecode::CHAR_FIELD
                        | bytecode::SHORT_FIELD
                        | bytecode::FLOAT_FIELD
                        | bytecode::INT_FIELD => {
                            // A fresh box is filled from the stack, then
                            // published into the cell with one word store.
                            self.asm.push(Rax);
                            let int_class = self.machine().types.int.0;
                            self.compile_call_obj(runtime::make_new as usize, int_class as usize);
                            self.asm.pop(Rcx);
                            self.asm.pop4(Rax, INT_VALUE as i32);
                            self.asm.store(Rax, Rcx, 0);
                        }
                        bytecode::DOUBLE_FIELD | bytecode::LONG_FIELD => {
                            self.asm.push(Rax);
                            let long_class = self.machine().types.long.0;
                            self.compile_call_obj(runtime::make_new as usize, long_class as usize);
                            self.asm.pop(Rcx);
                            if WORD == 8 {
                                self.asm.add_imm(8, Rsp);
                                self.asm.pop(Rdx);
                                self.asm.store(Rdx, Rax, LONG_VALUE as i32);
                            } else {
                                self.asm.pop4(Rax, LONG_VALUE as i32);
                                self.asm.pop4(Rax, LONG_VALUE as i32 + 4);
                            }
                            self.asm.store(Rax, Rcx, 0);
                        }
                        bytecode::OBJECT_FIELD => {
                            self.asm.pop_mem(Rax, 0);
                        }
                        _ => panic!("bad field code {}", field_code),
                    }
                }

                op::RETURN => {
                    self.asm.mov(Rbp, Rsp);
                    self.asm.pop(Rbp);
                    self.asm.ret();
                }

                op::SIPUSH => {
                    let v = read_i16(body, &mut ip);
                    self.asm.push_imm(v as i32);
                }

                _ => panic!("cannot compile opcode {:#04x}", instruction),
            }
        }

        self.resolve_jumps();
        self.build_exception_handler_table(code)?;

        Some(self.finish(Some(method)))
    }

    //-------------------------------------------------------------------------

    /// Binary search of the bytecode-IP → native-IP map. The keys ascend in
    /// insertion order, so the parallel buffers are searchable in place.
    pub fn machine_ip_for_java_ip(&self, java_ip: u16) -> u32 {
        let mut bottom = 0;
        let mut top = self.java_ips.len() / 2;
        while top > bottom {
            let middle = bottom + (top - bottom) / 2;
            let k = self.java_ips.get2(middle * 2);
            if java_ip < k {
                top = middle;
            } else if java_ip > k {
                bottom = middle + 1;
            } else {
                return self.machine_ips.get4(middle * 4);
            }
        }
        panic!("no native translation for bytecode ip {}", java_ip);
    }

    /// Patches every displacement recorded in the jumps buffer against the
    /// now-complete bytecode-IP → native-IP map.
    fn resolve_jumps(&mut self) {
        for i in (0..self.asm.jumps.len()).step_by(8) {
            let java_ip = self.asm.jumps.get4(i) as u16;
            let offset = self.asm.jumps.get4(i + 4);

            let target = self.machine_ip_for_java_ip(java_ip);
            self.asm.code.set4(offset as usize, target.wrapping_sub(offset + 4));
        }
    }

    /// Translates the bytecode handler table into native IPs, resolving
    /// each catch type to a slot in the embedded pool (0 = catch-all).
    fn build_exception_handler_table(&mut self, code: &Code) -> Option<()> {
        for i in 0..code.exception_handlers.len() {
            let handler = code.exception_handlers[i];

            let start = self.machine_ip_for_java_ip(handler.start);
            let end = self.machine_ip_for_java_ip(handler.end);
            let entry = self.machine_ip_for_java_ip(handler.ip);

            let catch_type = if handler.catch_type != 0 {
                let class = unsafe {
                    machine::resolve_class(
                        &mut *self.t,
                        &code.pool,
                        handler.catch_type as usize - 1,
                    )?
                };
                self.pool_append(class as usize) as u32 + 1
            } else {
                0
            };

            self.exception_handlers.append4(start);
            self.exception_handlers.append4(end);
            self.exception_handlers.append4(entry);
            self.exception_handlers.append4(catch_type);
        }
        Some(())
    }

    /// Copies the buffers into a fresh executable artifact.
    fn finish(&mut self, method: Option<*mut Method>) -> *mut Compiled {
        let (max_locals, max_stack) = match method {
            Some(method) => unsafe {
                let code = &*(*method).bytecode;
                (code.max_locals, code.max_stack)
            },
            None => (0, 0),
        };
        Compiled::new(
            max_locals,
            max_stack,
            &self.asm.code,
            &self.line_numbers,
            &self.exception_handlers,
        )
    }

    //-------------------------------------------------------------------------
    // The shared trampolines.

    /// The initial body of every bytecode method: compiles the method on
    /// first call, then tail-jumps into the fresh code.
    pub fn compile_stub(&mut self) -> *mut Compiled {
        self.asm.push(Rbp);
        self.asm.mov(Rsp, Rbp);

        if WORD == 4 {
            self.asm.push_mem(Rbp, FRAME_METHOD as i32);
            self.asm.push_mem(Rbp, FRAME_THREAD as i32);
        } else {
            self.asm.load(Rbp, FRAME_METHOD as i32, gp_register(1));
            self.asm.load(Rbp, FRAME_THREAD as i32, gp_register(0));
        }

        self.asm.const_(runtime::compile_method as usize, Rbx);
        let caller = self.caller_code();
        self.call_address(caller);

        if WORD == 4 {
            self.asm.add_imm((WORD * 2) as i32, Rsp);
        }

        self.asm.load(Rbp, FRAME_METHOD as i32, Rax);
        self.asm.load(Rax, METHOD_COMPILED as i32, Rax); // load the new artifact

        self.asm.mov(Rbp, Rsp);
        self.asm.pop(Rbp);

        self.asm.add_imm(COMPILED_BODY as i32, Rax);
        self.asm.jmp_reg(Rax); // enter the new code

        debug!("compiled method stub");
        self.finish(None)
    }

    /// The body of native methods: marshals into the host ABI via the
    /// runtime, then returns the result the runtime produced.
    pub fn compile_native_invoker(&mut self) -> *mut Compiled {
        self.asm.push(Rbp);
        self.asm.mov(Rsp, Rbp);

        if WORD == 4 {
            self.asm.push_mem(Rbp, FRAME_METHOD as i32);
            self.asm.push_mem(Rbp, FRAME_THREAD as i32);
        } else {
            self.asm.load(Rbp, FRAME_METHOD as i32, gp_register(1));
            self.asm.load(Rbp, FRAME_THREAD as i32, gp_register(0));
        }

        self.asm.const_(runtime::invoke_native as usize, Rbx);
        let caller = self.caller_code();
        self.call_address(caller);

        if WORD == 4 {
            self.asm.add_imm((WORD * 2) as i32, Rsp);
        }

        self.asm.mov(Rbp, Rsp);
        self.asm.pop(Rbp);
        self.asm.ret();

        debug!("compiled native invoker");
        self.finish(None)
    }

    /// Publishes the thread's current-frame pointer, then tail-jumps to the
    /// runtime routine in `rbx`. Every generated-to-runtime transition goes
    /// through here; it is the sole writer of the thread's frame pointer.
    /// The published token assumes the routine saves the frame pointer in
    /// its prologue (see `.cargo/config.toml`).
    // TODO: realign the stack for the host ABI before entering the runtime
    // routine; generated frames only guarantee word alignment.
    pub fn compile_caller(&mut self) -> *mut Compiled {
        let frame_offset = thread_frame_offset(self.t) as i32;

        self.asm.load(Rbp, FRAME_THREAD as i32, Rdi);
        self.asm.lea(Rsp, (FRAME_FOOTPRINT + WORD) as i32, Rcx);
        self.asm.store(Rcx, Rdi, frame_offset); // set thread frame to current

        self.asm.jmp_reg(Rbx);

        debug!("compiled caller thunk");
        self.finish(None)
    }

    /// The host entry: lays the marshalled argument array out on the stack
    /// in the generated ABI's order and calls the method body.
    ///
    /// Called as `extern "C" fn(code, args, size_bytes, return_type) -> u64`.
    /// The array holds `[thread, method, previous frame, this?, args...]`;
    /// the linkage cells land adjacent to the return address and the
    /// parameters above them in reverse index order, which is the frame
    /// layout every generated method expects.
    pub fn compile_vm_invoke(&mut self) -> *mut Compiled {
        self.asm.push(Rbp);
        self.asm.mov(Rsp, Rbp);
        self.asm.push(Rbx);

        if WORD == 8 {
            self.asm.mov(Rdi, Rbx); // code
            self.asm.mov(Rsi, Rax); // argument array
            self.asm.mov(Rdx, Rcx); // size in bytes
        } else {
            self.asm.load(Rbp, 2 * WORD as i32, Rbx);
            self.asm.load(Rbp, 3 * WORD as i32, Rax);
            self.asm.load(Rbp, 4 * WORD as i32, Rcx);
        }

        self.asm.add(Rax, Rcx); // end of array
        self.asm.lea(Rax, 3 * WORD as i32, Rdx); // first parameter

        let mut top = Label::new();
        let mut done = Label::new();

        top.mark(&mut self.asm.code);
        self.asm.cmp(Rdx, Rcx);
        self.asm.jump_if(Condition::LE, &mut done);
        self.asm.push_mem(Rdx, 0);
        self.asm.add_imm(WORD as i32, Rdx);
        self.asm.jmp(&mut top);

        done.mark(&mut self.asm.code);
        self.asm.push_mem(Rax, 2 * WORD as i32); // previous frame
        self.asm.push_mem(Rax, WORD as i32); // method
        self.asm.push_mem(Rax, 0); // thread

        self.asm.call(Rbx);

        self.asm.load(Rbp, -(WORD as i32), Rbx);
        self.asm.mov(Rbp, Rsp);
        self.asm.pop(Rbp);
        self.asm.ret();

        debug!("compiled host entry");
        self.finish(None)
    }

    /// `extern "C" fn(address, base, stack) -> !`: installs the given frame
    /// and jumps. The unwinder uses this to resume at a handler or to
    /// return across a native frame.
    pub fn compile_vm_jump(&mut self) -> *mut Compiled {
        if WORD == 8 {
            self.asm.mov(Rsi, Rbp);
            self.asm.mov(Rdx, Rsp);
            self.asm.jmp_reg(Rdi);
        } else {
            self.asm.load(Rsp, WORD as i32, Rcx);
            self.asm.load(Rsp, 2 * WORD as i32, Rbp);
            self.asm.load(Rsp, 3 * WORD as i32, Rsp);
            self.asm.jmp_reg(Rcx);
        }

        debug!("compiled unwind jump");
        self.finish(None)
    }
}

//-----------------------------------------------------------------------------
