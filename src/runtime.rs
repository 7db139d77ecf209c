//! The runtime half of the processor: the routines generated code calls
//! into (exception throwing, allocation, native dispatch, first-call
//! compilation), the unwinder that walks generated frames, the call-site
//! patcher, and the host-side entry with its argument marshalling.
//!
//! Routines entered from generated code are `extern "C"`; control reaches
//! them through the `caller` trampoline, which publishes the thread's
//! current-frame pointer first, so any of them may throw by storing a
//! pending exception and calling [`unwind`].

use std::mem::transmute;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::BYTES_PER_WORD;
use super::bytecode::{
    self, field_type, MethodSpecIterator, ACC_NATIVE, ACC_STATIC, INT64_TYPE, POINTER_TYPE,
};
use super::compiled::{Compiled, NativeExceptionHandler};
use super::compiler::Compiler;
use super::frame::{
    address_offset, frame_address, frame_base, frame_method, frame_next, frame_return_address,
    frame_valid, Frame, FRAME_FOOTPRINT,
};
use super::machine::{
    self, instance_of, make_exception, make_instance, make_pointer, make_string, method_virtual,
    object_class, pointer_value, Class, CompiledRef, Method, Object, Reference, Thread,
    ThreadState, INIT_FLAG, NEED_INIT_FLAG,
};
use super::x86::{Assembler, Register};

const WORD: usize = BYTES_PER_WORD;

/// A typed array allocator, as passed to [`make_blank_array`].
pub type ArrayConstructor = extern "C" fn(*mut Thread, usize) -> Object;

type VmInvoke = extern "C" fn(usize, *const usize, usize, u32) -> u64;
type VmJump = extern "C" fn(usize, usize, usize) -> !;

//-----------------------------------------------------------------------------
// The shared generated artifacts, built once per VM.

pub fn method_stub(t: &mut Thread) -> *const Compiled {
    let machine = unsafe { &*t.machine };
    machine
        .method_stub
        .get_or_init(|| CompiledRef(Compiler::new(t).compile_stub()))
        .0
}

pub fn native_invoker(t: &mut Thread) -> *const Compiled {
    let machine = unsafe { &*t.machine };
    machine
        .native_invoker
        .get_or_init(|| CompiledRef(Compiler::new(t).compile_native_invoker()))
        .0
}

pub fn caller(t: &mut Thread) -> *const Compiled {
    let machine = unsafe { &*t.machine };
    machine
        .caller
        .get_or_init(|| CompiledRef(Compiler::new(t).compile_caller()))
        .0
}

fn vm_invoke_fn(t: &mut Thread) -> VmInvoke {
    let machine = unsafe { &*t.machine };
    let compiled = machine
        .vm_invoke
        .get_or_init(|| CompiledRef(Compiler::new(t).compile_vm_invoke()))
        .0;
    unsafe { transmute((*compiled).body()) }
}

fn vm_jump_fn(t: &mut Thread) -> VmJump {
    let machine = unsafe { &*t.machine };
    let compiled = machine
        .vm_jump
        .get_or_init(|| CompiledRef(Compiler::new(t).compile_vm_jump()))
        .0;
    unsafe { transmute((*compiled).body()) }
}

//-----------------------------------------------------------------------------
// Unwinding.

/// Searches `frame`'s method for a handler covering the frame's suspended
/// native IP and matching the pending exception's class. The `- 1` accounts
/// for the saved return address pointing past the throwing call.
unsafe fn find_exception_handler(
    t: &mut Thread,
    frame: Frame,
) -> Option<&'static NativeExceptionHandler> {
    let method = frame_method(frame);
    let compiled = &*(*method).compiled;
    let offset = address_offset(method, frame_address(frame)) as u32;

    for i in 0..compiled.exception_handler_count() {
        let handler: &NativeExceptionHandler = &*(compiled.exception_handler(i) as *const _);
        let ip = offset.wrapping_sub(1);

        if ip >= handler.start && ip < handler.end {
            let catch_type = if handler.catch_type != 0 {
                let pool = (*method).code;
                machine::array_get_word(pool, handler.catch_type as usize - 1) as *mut Class
            } else {
                ptr::null_mut()
            };

            if catch_type.is_null() || instance_of(catch_type, t.exception) {
                trace!(
                    "handler match for {} in {}: start {} end {} entry {}",
                    offset,
                    (*method).name,
                    handler.start,
                    handler.end,
                    handler.ip,
                );
                return Some(handler);
            }
        }
    }

    None
}

/// Walks the thread's frame chain looking for a handler for the pending
/// exception. On a match, resets the current frame, rebuilds the operand
/// stack with the exception on top, and resumes at the handler's native
/// entry. Frames belonging to native methods are skipped; crossing one (or
/// running out of frames) jumps back over it into the host entry, which
/// observes the still-pending exception. A verified method always finds a
/// handler or an exit, so falling off the chain is fatal.
pub extern "C" fn unwind(t: *mut Thread) -> ! {
    unsafe {
        let t = &mut *t;
        let vm_jump = vm_jump_fn(t);

        let mut frame = t.frame as Frame;
        while frame_valid(frame) {
            let method = frame_method(frame);

            if (*method).flags & ACC_NATIVE == 0 {
                if let Some(handler) = find_exception_handler(t, frame) {
                    let compiled = &*(*method).compiled;
                    t.frame = frame;

                    let mut stack = frame_base(frame);

                    let parameter_footprint = (*method).parameter_footprint;
                    let local_footprint = compiled.max_locals;
                    if local_footprint > parameter_footprint {
                        stack = stack.sub(local_footprint - parameter_footprint);
                    }

                    stack = stack.sub(1);
                    *stack = t.exception as usize;
                    t.exception = ptr::null_mut();

                    vm_jump(
                        compiled.body().add(handler.ip as usize) as usize,
                        frame_base(frame) as usize,
                        stack as usize,
                    );
                }
            }

            let next = frame_next(frame);
            if !frame_valid(next) || (*frame_method(next)).flags & ACC_NATIVE != 0 {
                t.frame = next;
                vm_jump(
                    frame_return_address(frame) as usize,
                    *frame_base(frame),
                    frame_base(frame).add(2) as usize,
                );
            }

            frame = next;
        }
        // Unreachable for verified code.
        std::process::abort();
    }
}

/// Makes a fresh instance of `class` the pending exception and unwinds.
pub extern "C" fn throw_new(t: *mut Thread, class: *mut Class) -> ! {
    unsafe {
        let t = &mut *t;
        t.exception = make_exception(t.machine(), class, ptr::null_mut());
        unwind(t)
    }
}

/// Makes `o` the pending exception (null becomes a `NullPointerException`)
/// and unwinds.
pub extern "C" fn throw_(t: *mut Thread, o: Object) -> ! {
    unsafe {
        let t = &mut *t;
        if !o.is_null() {
            t.exception = o;
        } else {
            let class = t.machine().types.null_pointer_exception.0;
            t.exception = make_exception(t.machine(), class, ptr::null_mut());
        }
        unwind(t)
    }
}

//-----------------------------------------------------------------------------
// Helpers called from generated code. Two-word operands arrive in operand-
// stack order, so the divisor (topmost) comes before the dividend.

pub extern "C" fn divide_long(t: *mut Thread, divisor: i64, dividend: i64) -> i64 {
    if divisor == 0 {
        unsafe { throw_new(t, (*(*t).machine).types.arithmetic_exception.0) }
    }
    dividend.wrapping_div(divisor)
}

pub extern "C" fn modulo_long(t: *mut Thread, divisor: i64, dividend: i64) -> i64 {
    if divisor == 0 {
        unsafe { throw_new(t, (*(*t).machine).types.arithmetic_exception.0) }
    }
    dividend.wrapping_rem(divisor)
}

pub extern "C" fn make_new(t: *mut Thread, class: *mut Class) -> Object {
    let _ = t;
    unsafe { make_instance(class) }
}

/// Weak references are allocated like ordinary instances; the collector
/// that would treat them specially is another subsystem.
pub extern "C" fn make_new_weak_reference(t: *mut Thread, class: *mut Class) -> Object {
    make_new(t, class)
}

pub extern "C" fn is_assignable_from(t: *mut Thread, a: *mut Class, b: *mut Class) -> usize {
    let _ = t;
    unsafe { machine::is_assignable_from(a, b) as usize }
}

pub extern "C" fn make_blank_object_array(t: *mut Thread, class: *mut Class, length: usize) -> Object {
    unsafe { machine::make_object_array((*t).machine(), class, length as u32 as usize) }
}

/// Dispatches to the typed constructor selected at compile time. The length
/// arrives as an untruncated stack slot.
pub extern "C" fn make_blank_array(
    t: *mut Thread,
    constructor: usize,
    length: usize,
) -> Object {
    let constructor: ArrayConstructor = unsafe { transmute(constructor) };
    constructor(t, length as u32 as usize)
}

pub extern "C" fn make_boolean_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_boolean_array((*t).machine(), length) }
}

pub extern "C" fn make_char_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_char_array((*t).machine(), length) }
}

pub extern "C" fn make_float_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_float_array((*t).machine(), length) }
}

pub extern "C" fn make_double_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_double_array((*t).machine(), length) }
}

pub extern "C" fn make_byte_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_byte_array((*t).machine(), length) }
}

pub extern "C" fn make_short_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_short_array((*t).machine(), length) }
}

pub extern "C" fn make_int_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_int_array((*t).machine(), length) }
}

pub extern "C" fn make_long_array(t: *mut Thread, length: usize) -> Object {
    unsafe { machine::make_long_array((*t).machine(), length) }
}

//-----------------------------------------------------------------------------
// Native dispatch.

/// The generic FFI bridge: all arguments are word-sized integer-class
/// values (pointers, widened integers, raw float bits), which is the
/// marshalling [`invoke_native2`] produces.
unsafe fn system_call(function: usize, args: &[usize]) -> u64 {
    match args.len() {
        1 => transmute::<usize, extern "C" fn(usize) -> u64>(function)(args[0]),
        2 => transmute::<usize, extern "C" fn(usize, usize) -> u64>(function)(args[0], args[1]),
        3 => transmute::<usize, extern "C" fn(usize, usize, usize) -> u64>(function)(
            args[0], args[1], args[2],
        ),
        4 => transmute::<usize, extern "C" fn(usize, usize, usize, usize) -> u64>(function)(
            args[0], args[1], args[2], args[3],
        ),
        5 => transmute::<usize, extern "C" fn(usize, usize, usize, usize, usize) -> u64>(function)(
            args[0], args[1], args[2], args[3], args[4],
        ),
        6 => transmute::<usize, extern "C" fn(usize, usize, usize, usize, usize, usize) -> u64>(
            function,
        )(args[0], args[1], args[2], args[3], args[4], args[5]),
        7 => transmute::<
            usize,
            extern "C" fn(usize, usize, usize, usize, usize, usize, usize) -> u64,
        >(function)(
            args[0], args[1], args[2], args[3], args[4], args[5], args[6],
        ),
        8 => transmute::<
            usize,
            extern "C" fn(usize, usize, usize, usize, usize, usize, usize, usize) -> u64,
        >(function)(
            args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
        ),
        n => panic!("cannot marshal {} native arguments", n),
    }
}

/// Resolves the method's symbol on first call, reads the arguments out of
/// the caller's frame (objects are passed by reference, JNI style), and
/// calls the native function with the thread idle so other threads may
/// collect.
unsafe fn invoke_native2(t: &mut Thread, method: *mut Method) -> u64 {
    let machine = &*t.machine;

    if object_class((*method).code) == machine.types.byte_array.0 {
        match machine::resolve_native_method(t, method) {
            Some(function) => {
                let p = make_pointer(machine, function);
                (*method).code = p;
            }
            None => {
                let bytes = (*method).code;
                let symbol = std::slice::from_raw_parts(
                    machine::array_body(bytes),
                    machine::array_length(bytes),
                );
                let message =
                    make_string(machine, std::str::from_utf8(symbol).unwrap_or("?"));
                t.exception = make_exception(
                    machine,
                    machine.types.unsatisfied_link_error.0,
                    message,
                );
                return 0;
            }
        }
    }

    let is_static = (*method).flags & ACC_STATIC != 0;
    let parameter_footprint = (*method).parameter_footprint;

    let mut args: Vec<usize> = Vec::with_capacity(parameter_footprint + 2);
    args.push(t as *mut Thread as usize);

    // Address of the first logical local: `this` for instance methods, the
    // first declared parameter otherwise.
    let mut sp = frame_base(t.frame as Frame)
        .add(parameter_footprint + 1 + FRAME_FOOTPRINT / WORD);

    let mut class = (*method).class;
    if is_static {
        args.push(ptr::addr_of_mut!(class) as usize);
    } else {
        args.push(sp as usize);
        sp = sp.sub(1);
    }

    let spec = (*method).spec.clone();
    for descriptor in MethodSpecIterator::new(&spec) {
        let type_ = field_type(bytecode::field_code_for_descriptor(descriptor));
        match type_ {
            INT64_TYPE | bytecode::DOUBLE_TYPE => {
                if WORD == 8 {
                    args.push(*sp);
                } else {
                    let low = *sp as u64;
                    let high = *sp.sub(1) as u64;
                    args.push(low as usize);
                    args.push(high as usize);
                }
                sp = sp.sub(2);
            }
            POINTER_TYPE => {
                args.push(sp as usize);
                sp = sp.sub(1);
            }
            _ => {
                args.push(*sp);
                sp = sp.sub(1);
            }
        }
    }

    let function = pointer_value((*method).code);
    let return_type = field_type((*method).return_code);

    debug!("invoke native method {}.{}", (*(*method).class).name, (*method).name);

    t.state = ThreadState::Idle;
    let result = system_call(function, &args);
    t.state = ThreadState::Active;

    debug!("return from native method {}.{}", (*(*method).class).name, (*method).name);

    if t.exception.is_null() && return_type == POINTER_TYPE && result != 0 {
        *(result as usize as *const usize) as u64
    } else {
        result
    }
}

pub extern "C" fn invoke_native(t: *mut Thread, method: *mut Method) -> u64 {
    unsafe {
        let t = &mut *t;
        let result = invoke_native2(t, method);
        if !t.exception.is_null() {
            unwind(t)
        }
        result
    }
}

//-----------------------------------------------------------------------------
// First-call compilation and call-site patching.

unsafe fn compile_method2(t: &mut Thread, method: *mut Method) {
    let stub = method_stub(t);
    if (*method).compiled != stub {
        return;
    }

    let machine = &*t.machine;
    let _guard = machine.class_lock.acquire();

    if (*method).compiled == stub {
        debug!("compiling {}.{}", (*(*method).class).name, (*method).name);

        let mut compiler = Compiler::new(t);
        if let Some(code) = compiler.compile(method) {
            debug!(
                "compiled {}.{} to {:p}..{:p}",
                (*(*method).class).name,
                (*method).name,
                (*code).body(),
                (*code).body().add((*code).code_length),
            );

            // The pool must be visible before the code that loads it.
            (*method).code = compiler.make_pool();
            (*method).compiled = code;
        }
        // On failure the stub stays installed and the pending exception
        // propagates; a later call will retry.
    }
}

/// After a first compilation, tries to repoint the calling instruction at
/// the fresh code. The stub frame's return address is the direct call site
/// in the compiled caller; if the bytes before it are exactly the
/// load-stub-address-and-call sequence, the word-aligned immediate is
/// overwritten atomically. Anything else (an indirect call, the host
/// entry) fails the comparison and is left alone.
unsafe fn update_caller(t: &mut Thread, method: *mut Method) {
    let stub = (*method_stub(t)).body() as usize;

    let mut a = Assembler::new();
    a.const_(stub, Register::Rax);
    let offset = a.code.len() - WORD;
    a.call(Register::Rax);

    let length = a.code.len();
    let call_site = (frame_return_address(t.frame as Frame) as *const u8).sub(length);
    let actual = std::slice::from_raw_parts(call_site, length);

    if actual == &a.code[..] {
        let patch = call_site.add(offset) as usize;
        // The aligned emission guarantees an atomic store.
        assert_eq!(patch % WORD, 0);

        let new_target = (*(*method).compiled).body() as usize;
        (*(patch as *const AtomicUsize)).store(new_target, Ordering::Release);

        trace!("patched call site {:#x} for {}", patch, (*method).name);
    }
}

/// First-call entry, reached from the method stub through `caller`.
pub extern "C" fn compile_method(t: *mut Thread, method: *mut Method) {
    unsafe {
        let t = &mut *t;
        compile_method2(t, method);

        if !t.exception.is_null() {
            unwind(t)
        } else if !method_virtual(method) {
            update_caller(t, method);
        }
    }
}

//-----------------------------------------------------------------------------
// Class initialization.

/// Runs the class initializer at most once, under the class lock. A failed
/// initializer is wrapped in an `ExceptionInInitializerError`.
pub fn init_class(t: &mut Thread, class: *mut Class) {
    unsafe {
        let machine = &*t.machine;
        let _guard = machine.class_lock.acquire();

        let flags = (*class).vm_flags;
        if flags & NEED_INIT_FLAG != 0 && flags & INIT_FLAG == 0 {
            (*class).vm_flags |= INIT_FLAG;

            let initializer = (*class).initializer;
            if !initializer.is_null() {
                let mut list = ArgumentList::new(t, ptr::null_mut(), "()V", &[]);
                invoke(t, initializer, &mut list);
            }

            if !t.exception.is_null() {
                t.exception = make_exception(
                    machine,
                    machine.types.exception_in_initializer_error.0,
                    t.exception,
                );
            }

            (*class).vm_flags &= !(NEED_INIT_FLAG | INIT_FLAG);
        }
    }
}

//-----------------------------------------------------------------------------
// Local references.

pub fn make_local_reference(t: &mut Thread, o: Object) -> *mut Object {
    if o.is_null() {
        return ptr::null_mut();
    }
    let r = Box::into_raw(Box::new(Reference {target: o, next: t.reference}));
    t.reference = r;
    unsafe { ptr::addr_of_mut!((*r).target) }
}

pub fn dispose_local_reference(t: &mut Thread, r: *mut Object) {
    if r.is_null() {
        return;
    }
    // `target` is the Reference's first field.
    let r = r as *mut Reference;
    unsafe {
        let mut link = &mut t.reference;
        while !(*link).is_null() {
            if *link == r {
                *link = (*r).next;
                drop(Box::from_raw(r));
                return;
            }
            link = &mut (**link).next;
        }
    }
}

//-----------------------------------------------------------------------------
// Host-side invocation.

/// A host-side argument or result.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Object),
    /// A JNI-style local reference: dereferenced when marshalled.
    ObjectRef(*mut Object),
}

/**
 * The marshalled argument vector for one invocation, with a parallel mask
 * marking which slots hold object references (for the collector's benefit
 * while the call is live). Slots 0..3 are the thread pointer, the method
 * (filled in by [`invoke`]) and the previous frame; `this` and the
 * declared arguments follow, longs and doubles taking two slots.
 *
 * Lists form a chain through the owning thread, pushed for the duration of
 * each `invoke`.
 */
pub struct ArgumentList {
    next: *mut core::ffi::c_void,
    pub array: Vec<usize>,
    pub object_mask: Vec<bool>,
}

impl ArgumentList {
    pub fn new(t: &mut Thread, this: Object, spec: &str, arguments: &[Value]) -> ArgumentList {
        let mut list = ArgumentList {
            next: ptr::null_mut(),
            array: Vec::new(),
            object_mask: Vec::new(),
        };

        list.add_int(t as *mut Thread as usize);
        list.add_object(ptr::null_mut()); // space for the method
        list.add_int(t.frame as usize);

        if !this.is_null() {
            list.add_object(this);
        }

        let mut arguments = arguments.iter();
        for descriptor in MethodSpecIterator::new(spec) {
            let value = *arguments.next().expect("too few arguments");
            match (descriptor.as_bytes()[0], value) {
                (b'L' | b'[', Value::Object(o)) => list.add_object(o),
                (b'L' | b'[', Value::ObjectRef(r)) => {
                    list.add_object(if r.is_null() { ptr::null_mut() } else { unsafe { *r } })
                }
                (b'J', Value::Long(v)) => list.add_long(v as u64),
                (b'D', Value::Double(v)) => list.add_long(v.to_bits()),
                (b'F', Value::Float(v)) => list.add_int(v.to_bits() as usize),
                (_, Value::Int(v)) => list.add_int(v as u32 as usize),
                (d, v) => panic!("argument {:?} does not match descriptor {:?}", v, d as char),
            }
        }
        assert!(arguments.next().is_none(), "too many arguments");

        list
    }

    /// Builds the list from an object array of boxed values.
    pub fn from_object_array(
        t: &mut Thread,
        this: Object,
        spec: &str,
        arguments: Object,
    ) -> ArgumentList {
        let mut list = ArgumentList {
            next: ptr::null_mut(),
            array: Vec::new(),
            object_mask: Vec::new(),
        };

        list.add_int(t as *mut Thread as usize);
        list.add_object(ptr::null_mut()); // space for the method
        list.add_int(t.frame as usize);

        if !this.is_null() {
            list.add_object(this);
        }

        let mut index = 0;
        for descriptor in MethodSpecIterator::new(spec) {
            let element = unsafe { machine::array_get_word(arguments, index) as Object };
            index += 1;
            match descriptor.as_bytes()[0] {
                b'L' | b'[' => list.add_object(element),
                b'J' | b'D' => list.add_long(unsafe { machine::long_value(element) } as u64),
                _ => list.add_int(unsafe { machine::int_value(element) } as u32 as usize),
            }
        }

        list
    }

    fn add_object(&mut self, o: Object) {
        self.array.push(o as usize);
        self.object_mask.push(true);
    }

    fn add_int(&mut self, v: usize) {
        self.array.push(v);
        self.object_mask.push(false);
    }

    fn add_long(&mut self, v: u64) {
        if WORD == 8 {
            self.array.push(v as usize);
            self.array.push(0);
        } else {
            self.array.push((v & 0xFFFF_FFFF) as usize);
            self.array.push((v >> 32) as usize);
        }
        self.object_mask.push(false);
        self.object_mask.push(false);
    }
}

/// Calls `method` through the host entry trampoline and boxes the result.
/// Returns `None`, with the pending exception still set, if the call
/// unwound out of the outermost generated frame.
pub fn invoke(t: &mut Thread, method: *mut Method, arguments: &mut ArgumentList) -> Option<Object> {
    unsafe {
        arguments.array[1] = method as usize;

        arguments.next = t.argument_list;
        t.argument_list = arguments as *mut ArgumentList as *mut core::ffi::c_void;

        let return_code = (*method).return_code;
        let return_type = field_type(return_code);

        let saved_frame = t.frame;
        let saved_reference = t.reference;

        let code = (*(*method).compiled).body() as usize;
        let entry = vm_invoke_fn(t);
        let result = entry(
            code,
            arguments.array.as_ptr(),
            arguments.array.len() * WORD,
            u32::from(return_type),
        );

        while t.reference != saved_reference {
            let r = t.reference;
            t.reference = (*r).next;
            drop(Box::from_raw(r));
        }
        t.frame = saved_frame;
        t.argument_list = arguments.next;

        if !t.exception.is_null() {
            return None;
        }

        let machine = &*t.machine;
        Some(match return_code {
            bytecode::BYTE_FIELD
            | bytecode::BOOLEAN_FIELD
            | bytecode::CHAR_FIELD
            | bytecode::SHORT_FIELD
            | bytecode::FLOAT_FIELD
            | bytecode::INT_FIELD => machine::make_int(machine, result as u32 as i32),
            bytecode::LONG_FIELD | bytecode::DOUBLE_FIELD => {
                machine::make_long(machine, result as i64)
            }
            bytecode::OBJECT_FIELD => {
                // Compiled code returns the reference itself; the native
                // path already dereferenced any local-reference cell.
                result as usize as Object
            }
            bytecode::VOID_FIELD => ptr::null_mut(),
            other => panic!("bad return code {}", other),
        })
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::*;
    use crate::buffer::{Buffer, ExecBlock};
    use crate::machine::{
        class_set_virtual_table, Code, ExceptionHandler, Machine, MethodBody, ObjectRef,
        PoolEntry,
    };

    fn setup() -> (Box<Machine>, Box<Thread>) {
        let machine = Machine::new();
        let thread = Thread::new(&machine);
        (machine, thread)
    }

    fn code(body: Vec<u8>, max_stack: usize, max_locals: usize) -> Code {
        Code {
            max_stack,
            max_locals,
            body,
            pool: Vec::new(),
            exception_handlers: Vec::new(),
            line_numbers: Vec::new(),
        }
    }

    fn static_method(
        machine: &Machine,
        t: &mut Thread,
        name: &str,
        spec: &str,
        code: Code,
    ) -> *mut Method {
        let class = machine::Class::new(name, machine.types.object.0, 0);
        let stub = method_stub(t);
        Method::new(machine, class, name, spec, ACC_STATIC, 0, MethodBody::Bytecode(code), stub)
    }

    fn invoke_static(t: &mut Thread, method: *mut Method, args: &[Value]) -> Option<Object> {
        let spec = unsafe { (*method).spec.clone() };
        let mut list = ArgumentList::new(t, ptr::null_mut(), &spec, args);
        invoke(t, method, &mut list)
    }

    #[test]
    fn argument_list_layout() {
        let (machine, mut t) = setup();
        let _ = &machine;
        let list = ArgumentList::new(
            &mut t,
            ptr::null_mut(),
            "(IJLjava/lang/Object;)V",
            &[
                Value::Int(-1),
                Value::Long(0x1_0000_0001),
                Value::Object(ptr::null_mut()),
            ],
        );

        // thread, method, frame, int, long (two slots), object
        assert_eq!(list.array.len(), 7);
        assert_eq!(list.object_mask.len(), 7);
        assert_eq!(list.array[1], 0);
        assert_eq!(list.array[3], 0xFFFF_FFFF);
        if WORD == 8 {
            assert_eq!(list.array[4], 0x1_0000_0001);
            assert_eq!(list.array[5], 0);
        } else {
            assert_eq!(list.array[4], 1);
            assert_eq!(list.array[5], 1);
        }
        assert_eq!(
            list.object_mask,
            vec![false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn local_references_dispose_in_any_order() {
        let (machine, mut t) = setup();
        let (a, b) = unsafe {
            (machine::make_int(&machine, 1), machine::make_int(&machine, 2))
        };
        let ra = make_local_reference(&mut t, a);
        let rb = make_local_reference(&mut t, b);
        assert!(make_local_reference(&mut t, ptr::null_mut()).is_null());

        dispose_local_reference(&mut t, ra);
        dispose_local_reference(&mut t, rb);
        assert!(t.reference.is_null());
    }

    /// The patcher rewrites exactly the load-stub-and-call pattern, through
    /// a word-aligned store, and nothing else.
    #[test]
    fn call_site_patching() {
        let (machine, mut t) = setup();
        let _ = &machine;

        let stub = method_stub(&mut t);
        let stub_body = unsafe { (*stub).body() } as usize;

        // Fabricate a compiled caller containing a direct call to the stub.
        let mut a = Assembler::new();
        a.aligned_const_(stub_body, Register::Rax);
        a.call(Register::Rax);
        let block = ExecBlock::new(a.code.len()).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(a.code.as_ptr(), block.as_ptr(), a.code.len());
        }
        let return_address = unsafe { block.as_ptr().add(a.code.len()) };

        // Fabricate the stub frame the patcher walks: base[1] is the return
        // address into the caller.
        let mut base = [0usize; 2];
        base[1] = return_address as usize;
        let mut stack = [0usize; 5];
        stack[0] = base.as_mut_ptr() as usize;
        t.frame = unsafe { stack.as_mut_ptr().add(5) };

        // A freshly compiled method to patch in.
        let method = static_method(
            &machine,
            &mut t,
            "patchee",
            "()I",
            code(vec![ICONST_0, IRETURN], 1, 0),
        );
        let mut compiler = Compiler::new(&mut *t);
        let compiled = compiler.compile(method).unwrap();
        unsafe {
            (*method).compiled = compiled;
        }

        unsafe {
            update_caller(&mut t, method);
        }

        let patched = unsafe {
            let immediate = return_address.sub(2 /* call */ + WORD);
            assert_eq!(immediate as usize % WORD, 0);
            *(immediate as *const usize)
        };
        assert_eq!(patched, unsafe { (*compiled).body() } as usize);

        // A non-matching site is left untouched.
        let mut b = Assembler::new();
        b.call(Register::Rax);
        let block2 = ExecBlock::new(b.code.len() + 32).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(b.code.as_ptr(), block2.as_ptr().add(16), b.code.len());
            base[1] = block2.as_ptr().add(16 + b.code.len()) as usize;
            let before: Vec<u8> =
                std::slice::from_raw_parts(block2.as_ptr(), block2.len()).to_vec();
            update_caller(&mut t, method);
            let after = std::slice::from_raw_parts(block2.as_ptr(), block2.len());
            assert_eq!(&before[..], after);
        }
    }

    //-------------------------------------------------------------------------
    // End-to-end scenarios. These execute generated code.

    #[cfg(target_arch = "x86_64")]
    mod e2e {
        use super::*;

        #[test]
        fn integer_addition() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "add",
                "(II)I",
                code(vec![ILOAD_0, ILOAD_1, IADD, IRETURN], 2, 2),
            );

            let r = invoke_static(&mut t, method, &[Value::Int(2), Value::Int(3)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 5);

            // Two's-complement wrap-around.
            let r =
                invoke_static(&mut t, method, &[Value::Int(i32::MAX), Value::Int(1)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, i32::MIN);
        }

        #[test]
        fn factorial_loop() {
            let (machine, mut t) = setup();
            let body = vec![
                ICONST_1, ISTORE_1, // result = 1
                ILOAD_0, ICONST_1, IF_ICMPLE, 0, 13, // while n > 1
                ILOAD_1, ILOAD_0, IMUL, ISTORE_1, // result *= n
                IINC, 0, 0xFF, // n -= 1
                GOTO, 0xFF, 0xF4, // loop
                ILOAD_1, IRETURN,
            ];
            let method =
                static_method(&machine, &mut t, "factorial", "(I)I", code(body, 2, 2));

            let r = invoke_static(&mut t, method, &[Value::Int(5)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 120);

            let r = invoke_static(&mut t, method, &[Value::Int(1)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 1);
        }

        #[test]
        fn long_division() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "div",
                "(JJ)J",
                code(vec![LLOAD_0, LLOAD_2, LDIV, LRETURN], 4, 4),
            );

            let r =
                invoke_static(&mut t, method, &[Value::Long(10), Value::Long(3)]).unwrap();
            assert_eq!(unsafe { machine::long_value(r) }, 3);

            // Truncated toward zero.
            let r =
                invoke_static(&mut t, method, &[Value::Long(-9), Value::Long(2)]).unwrap();
            assert_eq!(unsafe { machine::long_value(r) }, -4);

            // Dividing the minimum value by -1 wraps instead of faulting.
            let r = invoke_static(
                &mut t,
                method,
                &[Value::Long(i64::MIN), Value::Long(-1)],
            )
            .unwrap();
            assert_eq!(unsafe { machine::long_value(r) }, i64::MIN);
        }

        #[test]
        fn long_arithmetic() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "mix",
                "(JJ)J",
                // (a - b) * (a + b)
                code(
                    vec![
                        LLOAD_0, LLOAD_2, LSUB, LLOAD_0, LLOAD_2, LADD, LMUL, LRETURN,
                    ],
                    8,
                    4,
                ),
            );

            let r =
                invoke_static(&mut t, method, &[Value::Long(7), Value::Long(5)]).unwrap();
            assert_eq!(unsafe { machine::long_value(r) }, 24);
        }

        #[test]
        fn long_compare() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "cmp",
                "(JJ)I",
                code(vec![LLOAD_0, LLOAD_2, LCMP, IRETURN], 4, 4),
            );

            for (a, b, expected) in [
                (1i64, 2i64, -1i32),
                (2, 1, 1),
                (5, 5, 0),
                (-1, 1, -1),
                (i64::MAX, i64::MIN, 1),
            ] {
                let r =
                    invoke_static(&mut t, method, &[Value::Long(a), Value::Long(b)]).unwrap();
                assert_eq!(unsafe { machine::int_value(r) }, expected, "{} <=> {}", a, b);
            }
        }

        #[test]
        fn array_bounds() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "get",
                "([II)I",
                code(vec![ALOAD_0, ILOAD_1, IALOAD, IRETURN], 2, 2),
            );

            let array = unsafe {
                let a = machine::make_int_array(&machine, 3);
                let body = machine::array_body(a) as *mut i32;
                for (i, v) in [10, 20, 30].into_iter().enumerate() {
                    *body.add(i) = v;
                }
                a
            };

            let r = invoke_static(
                &mut t,
                method,
                &[Value::Object(array), Value::Int(1)],
            )
            .unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 20);

            // Out of bounds: the invocation unwinds and the pending
            // exception is an ArrayIndexOutOfBoundsException.
            let r = invoke_static(&mut t, method, &[Value::Object(array), Value::Int(5)]);
            assert!(r.is_none());
            let exception = t.exception;
            t.exception = ptr::null_mut();
            assert_eq!(
                unsafe { machine::object_class(exception) },
                machine.types.array_index_out_of_bounds_exception.0,
            );

            let r = invoke_static(&mut t, method, &[Value::Object(array), Value::Int(-1)]);
            assert!(r.is_none());
            t.exception = ptr::null_mut();
        }

        #[test]
        fn array_store_and_length() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "fill",
                "([I)I",
                // a[1] = 42; return a.length
                code(
                    vec![
                        ALOAD_0, ICONST_1, BIPUSH, 42, IASTORE, ALOAD_0, ARRAYLENGTH, IRETURN,
                    ],
                    3,
                    1,
                ),
            );

            let array = unsafe { machine::make_int_array(&machine, 4) };
            let r = invoke_static(&mut t, method, &[Value::Object(array)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 4);
            unsafe {
                let body = machine::array_body(array) as *const i32;
                assert_eq!(*body.add(1), 42);
            }
        }

        #[test]
        fn virtual_dispatch() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);

            let class_a = machine::Class::new("A", machine.types.object.0, 0);
            let method_a = Method::new(
                &machine,
                class_a,
                "f",
                "()I",
                0,
                0,
                MethodBody::Bytecode(code(vec![ICONST_1, IRETURN], 1, 1)),
                stub,
            );
            unsafe {
                class_set_virtual_table(&machine, class_a, &[method_a]);
            }

            let class_b = machine::Class::new("B", class_a, 0);
            let method_b = Method::new(
                &machine,
                class_b,
                "f",
                "()I",
                0,
                0,
                MethodBody::Bytecode(code(vec![ICONST_2, IRETURN], 1, 1)),
                stub,
            );
            unsafe {
                class_set_virtual_table(&machine, class_b, &[method_b]);
            }

            // static int call(A a) { return a.f(); }
            let caller_class = machine::Class::new("C", machine.types.object.0, 0);
            let caller = Method::new(
                &machine,
                caller_class,
                "call",
                "(LA;)I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 4,
                    max_locals: 1,
                    body: vec![ALOAD_0, INVOKEVIRTUAL, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Method(machine::MethodRef(method_a))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let a = unsafe { machine::make_instance(class_a) };
            let b = unsafe { machine::make_instance(class_b) };

            let r = invoke_static(&mut t, caller, &[Value::Object(a)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 1);

            let r = invoke_static(&mut t, caller, &[Value::Object(b)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 2);
        }

        /// m1 calls m2 calls m3; m3 throws; m1 catches everything. The two
        /// inner frames are discarded, the exception lands on m1's operand
        /// stack, and execution resumes at the handler.
        #[test]
        fn exception_across_frames() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);
            let class = machine::Class::new("M", machine.types.object.0, 0);

            let m3 = Method::new(
                &machine,
                class,
                "m3",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![NEW, 0, 1, ATHROW],
                    pool: vec![PoolEntry::Class(machine.types.array_index_out_of_bounds_exception)],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let m2 = Method::new(
                &machine,
                class,
                "m2",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![INVOKESTATIC, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Method(machine::MethodRef(m3))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let m1 = Method::new(
                &machine,
                class,
                "m1",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![INVOKESTATIC, 0, 1, IRETURN, POP, ICONST_2, IRETURN],
                    pool: vec![PoolEntry::Method(machine::MethodRef(m2))],
                    exception_handlers: vec![ExceptionHandler {
                        start: 0,
                        end: 3,
                        ip: 4,
                        catch_type: 0,
                    }],
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let r = invoke_static(&mut t, m1, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 2);
            assert!(t.exception.is_null());
            assert!(t.frame.is_null());
        }

        /// Handlers are consulted in declaration order and filtered by
        /// catch type; a non-matching handler never fires.
        #[test]
        fn handler_selection_by_type() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);
            let class = machine::Class::new("H", machine.types.object.0, 0);

            let thrower = Method::new(
                &machine,
                class,
                "thrower",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![NEW, 0, 1, ATHROW],
                    pool: vec![PoolEntry::Class(machine.types.array_index_out_of_bounds_exception)],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            // First handler catches only ClassCastException, second is a
            // catch-all; entry code distinguishes them by return value.
            let catcher = Method::new(
                &machine,
                class,
                "catcher",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![
                        INVOKESTATIC, 0, 1, // 0
                        IRETURN,           // 3
                        POP, ICONST_1, IRETURN, // 4..6: ClassCastException
                        POP, ICONST_2, IRETURN, // 7..9: anything
                    ],
                    pool: vec![
                        PoolEntry::Method(machine::MethodRef(thrower)),
                        PoolEntry::Class(machine.types.class_cast_exception),
                    ],
                    exception_handlers: vec![
                        ExceptionHandler {start: 0, end: 3, ip: 4, catch_type: 2},
                        ExceptionHandler {start: 0, end: 3, ip: 7, catch_type: 0},
                    ],
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let r = invoke_static(&mut t, catcher, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 2);
            assert!(t.exception.is_null());
        }

        #[test]
        fn checkcast_and_instanceof() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "test",
                "(Ljava/lang/Object;)I",
                Code {
                    max_stack: 2,
                    max_locals: 1,
                    body: vec![ALOAD_0, INSTANCEOF, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Class(machine.types.throwable)],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                },
            );

            let throwable = unsafe {
                make_exception(&machine, machine.types.class_cast_exception.0, ptr::null_mut())
            };
            let plain = unsafe { machine::make_int(&machine, 0) };

            let r = invoke_static(&mut t, method, &[Value::Object(throwable)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 1);

            let r = invoke_static(&mut t, method, &[Value::Object(plain)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 0);

            let r = invoke_static(&mut t, method, &[Value::Object(ptr::null_mut())]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 0);
        }

        #[test]
        fn static_fields_round_trip() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);

            let class = machine::Class::new("S", machine.types.object.0, 0);
            unsafe {
                machine::class_set_static_table(&machine, class, 2);
            }
            let field = Box::into_raw(Box::new(machine::Field {
                code: bytecode::INT_FIELD,
                flags: ACC_STATIC,
                offset: 0,
                class,
            }));

            // static int roundTrip(int v) { S.x = v; return S.x; }
            let method = Method::new(
                &machine,
                class,
                "roundTrip",
                "(I)I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 1,
                    body: vec![ILOAD_0, PUTSTATIC, 0, 1, GETSTATIC, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Field(machine::FieldRef(field))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let r = invoke_static(&mut t, method, &[Value::Int(77)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 77);
        }

        /// An unread static slot yields the null-cell default, not a
        /// crash: the emitted sequence checks the cell before unboxing.
        #[test]
        fn getstatic_null_cell_reads_zero() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);

            let class = machine::Class::new("Z", machine.types.object.0, 0);
            unsafe {
                machine::class_set_static_table(&machine, class, 1);
            }
            let field = Box::into_raw(Box::new(machine::Field {
                code: bytecode::INT_FIELD,
                flags: ACC_STATIC,
                offset: 0,
                class,
            }));

            let method = Method::new(
                &machine,
                class,
                "read",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 1,
                    max_locals: 0,
                    body: vec![GETSTATIC, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Field(machine::FieldRef(field))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let r = invoke_static(&mut t, method, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 0);
        }

        #[test]
        fn instance_fields() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);

            let class = machine::Class::new("P", machine.types.object.0, 1);
            let field = Box::into_raw(Box::new(machine::Field {
                code: bytecode::INT_FIELD,
                flags: 0,
                offset: WORD, // first field word
                class,
            }));

            // static int bump(P p) { p.x = p.x is unreadable before a write,
            // so: p.x = 41; return p.x + 1; }
            let method = Method::new(
                &machine,
                class,
                "bump",
                "(LP;)I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 3,
                    max_locals: 1,
                    body: vec![
                        ALOAD_0, BIPUSH, 41, PUTFIELD, 0, 1, ALOAD_0, GETFIELD, 0, 1, ICONST_1,
                        IADD, IRETURN,
                    ],
                    pool: vec![PoolEntry::Field(machine::FieldRef(field))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let p = unsafe { machine::make_instance(class) };
            let r = invoke_static(&mut t, method, &[Value::Object(p)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 42);
        }

        #[test]
        fn object_allocation_and_arrays() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "alloc",
                "(I)I",
                // return new int[n].length
                code(vec![ILOAD_0, NEWARRAY, bytecode::T_INT, ARRAYLENGTH, IRETURN], 2, 1),
            );

            let r = invoke_static(&mut t, method, &[Value::Int(9)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 9);

            // A negative length unwinds with NegativeArraySizeException.
            let r = invoke_static(&mut t, method, &[Value::Int(-3)]);
            assert!(r.is_none());
            let exception = t.exception;
            t.exception = ptr::null_mut();
            assert_eq!(
                unsafe { machine::object_class(exception) },
                machine.types.negative_array_size_exception.0,
            );
        }

        #[test]
        fn division_by_zero_throws() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "div",
                "(II)I",
                code(vec![ILOAD_0, ILOAD_1, IDIV, IRETURN], 2, 2),
            );

            let r = invoke_static(&mut t, method, &[Value::Int(7), Value::Int(2)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 3);

            let r = invoke_static(&mut t, method, &[Value::Int(7), Value::Int(0)]);
            assert!(r.is_none());
            let exception = t.exception;
            t.exception = ptr::null_mut();
            assert_eq!(
                unsafe { machine::object_class(exception) },
                machine.types.arithmetic_exception.0,
            );

            // Dividing the minimum value by -1 wraps instead of faulting.
            let r = invoke_static(
                &mut t,
                method,
                &[Value::Int(i32::MIN), Value::Int(-1)],
            )
            .unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, i32::MIN);

            let rem = static_method(
                &machine,
                &mut t,
                "rem",
                "(II)I",
                code(vec![ILOAD_0, ILOAD_1, IREM, IRETURN], 2, 2),
            );

            let r = invoke_static(&mut t, rem, &[Value::Int(7), Value::Int(2)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 1);

            let r = invoke_static(
                &mut t,
                rem,
                &[Value::Int(i32::MIN), Value::Int(-1)],
            )
            .unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 0);
        }

        #[test]
        fn string_constants() {
            let (machine, mut t) = setup();
            let s = unsafe { make_string(&machine, "hello") };
            let method = static_method(
                &machine,
                &mut t,
                "constant",
                "()I",
                Code {
                    max_stack: 1,
                    max_locals: 0,
                    body: vec![LDC, 1, INSTANCEOF, 0, 2, IRETURN],
                    pool: vec![
                        PoolEntry::Str(ObjectRef(s)),
                        PoolEntry::Class(machine.types.string),
                    ],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                },
            );

            let r = invoke_static(&mut t, method, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 1);

            // The constant was embedded in the method's pool array.
            unsafe {
                let pool = (*method).code;
                assert!(!pool.is_null());
                let embedded = machine::array_get_word(pool, 0) as Object;
                assert_eq!(machine::string_text(embedded), "hello");
            }
        }

        #[test]
        fn native_method_missing_symbol() {
            let (machine, mut t) = setup();
            let invoker = native_invoker(&mut t);
            let class = machine::Class::new("N", machine.types.object.0, 0);
            let method = Method::new(
                &machine,
                class,
                "missing",
                "()V",
                ACC_STATIC,
                0,
                MethodBody::Native("Java_N_missing".to_owned()),
                invoker,
            );

            let r = invoke_static(&mut t, method, &[]);
            assert!(r.is_none());
            let exception = t.exception;
            t.exception = ptr::null_mut();
            unsafe {
                assert_eq!(
                    machine::object_class(exception),
                    machine.types.unsatisfied_link_error.0,
                );
                assert_eq!(
                    machine::throwable_message(exception).as_deref(),
                    Some("Java_N_missing"),
                );
            }
        }

        extern "C" fn native_sum(_t: *mut Thread, _class: usize, a: usize, b: usize) -> u64 {
            ((a as u32).wrapping_add(b as u32)) as u64
        }

        #[test]
        fn native_method_dispatch() {
            let (machine, mut t) = setup();
            machine.register_native("Java_N_sum", native_sum as usize);

            let invoker = native_invoker(&mut t);
            let class = machine::Class::new("N", machine.types.object.0, 0);
            let method = Method::new(
                &machine,
                class,
                "sum",
                "(II)I",
                ACC_STATIC,
                0,
                MethodBody::Native("Java_N_sum".to_owned()),
                invoker,
            );

            let r = invoke_static(&mut t, method, &[Value::Int(3), Value::Int(4)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 7);
        }

        /// Once the callee is compiled, its non-virtual call site is
        /// rewritten to bypass the stub: the fresh body address appears,
        /// word-aligned, inside the caller's code.
        #[test]
        fn direct_call_sites_are_patched() {
            let (machine, mut t) = setup();
            let stub = method_stub(&mut t);
            let class = machine::Class::new("D", machine.types.object.0, 0);

            let inner = Method::new(
                &machine,
                class,
                "inner",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(code(vec![BIPUSH, 17, IRETURN], 1, 0)),
                stub,
            );

            let outer = Method::new(
                &machine,
                class,
                "outer",
                "()I",
                ACC_STATIC,
                0,
                MethodBody::Bytecode(Code {
                    max_stack: 2,
                    max_locals: 0,
                    body: vec![INVOKESTATIC, 0, 1, IRETURN],
                    pool: vec![PoolEntry::Method(machine::MethodRef(inner))],
                    exception_handlers: Vec::new(),
                    line_numbers: Vec::new(),
                }),
                stub,
            );

            let r = invoke_static(&mut t, outer, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 17);

            unsafe {
                assert_ne!((*inner).compiled, stub);
                assert_ne!((*outer).compiled, stub);

                // The inner body address is patched into the outer code at
                // a word-aligned offset.
                let inner_body = (*(*inner).compiled).body() as usize;
                let outer_compiled = &*(*outer).compiled;
                let outer_code = std::slice::from_raw_parts(
                    outer_compiled.body(),
                    outer_compiled.code_length,
                );
                let needle = inner_body.to_ne_bytes();
                let position = outer_code
                    .windows(WORD)
                    .position(|w| w == needle)
                    .expect("call site was not patched");
                assert_eq!((outer_compiled.body() as usize + position) % WORD, 0);
            }

            let r = invoke_static(&mut t, outer, &[]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 17);
        }

        /// Two racing first calls compile the method exactly once; the
        /// loser adopts the winner's artifact under the class lock.
        #[test]
        fn concurrent_first_calls() {
            let (machine, mut t0) = setup();
            let method = static_method(
                &machine,
                &mut t0,
                "add",
                "(II)I",
                code(vec![ILOAD_0, ILOAD_1, IADD, IRETURN], 2, 2),
            );
            let method = machine::MethodRef(method);
            let machine = &*machine;

            std::thread::scope(|scope| {
                let mut workers = Vec::new();
                for _ in 0..2 {
                    let method = method;
                    workers.push(scope.spawn(move || {
                        let method = method;
                        let mut t = Thread::new(machine);
                        let r = invoke_static(
                            &mut t,
                            method.0,
                            &[Value::Int(20), Value::Int(22)],
                        )
                        .unwrap();
                        unsafe { machine::int_value(r) }
                    }));
                }
                for worker in workers {
                    assert_eq!(worker.join().unwrap(), 42);
                }
            });

            let stub = method_stub(&mut t0);
            let compiled = unsafe { (*method.0).compiled };
            assert_ne!(compiled, stub);

            // A later call sees the same artifact.
            let r = invoke_static(&mut t0, method.0, &[Value::Int(1), Value::Int(2)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, 3);
            assert_eq!(unsafe { (*method.0).compiled }, compiled);
        }

        #[test]
        fn conversions_and_bitwise() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "mangle",
                "(I)I",
                // return (byte)(v ^ 0x1FF)
                code(
                    vec![ILOAD_0, SIPUSH, 0x01, 0xFF, IXOR, I2B, IRETURN],
                    2,
                    1,
                ),
            );

            // (byte)(0 ^ 0x1FF) = (byte)0xFF = -1
            let r = invoke_static(&mut t, method, &[Value::Int(0)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, -1);

            // (byte)(0x123 ^ 0x1FF) = (byte)0xDC = -36
            let r = invoke_static(&mut t, method, &[Value::Int(0x123)]).unwrap();
            assert_eq!(unsafe { machine::int_value(r) }, -36);
        }

        #[test]
        fn int_to_long_and_back() {
            let (machine, mut t) = setup();
            let method = static_method(
                &machine,
                &mut t,
                "widen",
                "(I)J",
                code(vec![ILOAD_0, I2L, LRETURN], 2, 1),
            );

            let r = invoke_static(&mut t, method, &[Value::Int(-5)]).unwrap();
            assert_eq!(unsafe { machine::long_value(r) }, -5);
        }
    }
}
