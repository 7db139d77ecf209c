//! The object model and per-VM state the generated code runs against.
//!
//! Everything the emitted code dereferences is laid out in words, with fixed
//! offsets: instances are `[class, fields...]`, arrays are
//! `[class, length, elements...]`, and boxed primitives carry their value at
//! word 1. The `#[repr(C)]` structures below have their generated-code-
//! visible fields first; the translator bakes their offsets into emitted
//! instruction sequences.
//!
//! This is deliberately the smallest model that lets compiled methods run:
//! no garbage collector (allocations live for the life of the VM), no class
//! loading from class files (hosts and tests register pre-linked classes,
//! methods and constant pools directly).

use std::alloc::{alloc_zeroed, Layout};
use std::collections::HashMap;
use std::ptr;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;

use crate::{BYTES_PER_WORD, pad};
use super::bytecode::{self, field_code_for_descriptor, parameter_count, parameter_footprint};
use super::compiled::Compiled;

/// A reference to a heap object: a pointer to its class word.
pub type Object = *mut usize;

/// Arrays store their length at word 1; elements start here.
pub const ARRAY_BODY: usize = 2 * BYTES_PER_WORD;
/// Boxed `Int` value offset.
pub const INT_VALUE: usize = BYTES_PER_WORD;
/// Boxed `Long` value offset (two words on 32-bit).
pub const LONG_VALUE: usize = BYTES_PER_WORD;

// Class vm flags.
pub const NEED_INIT_FLAG: usize = 1 << 0;
pub const INIT_FLAG: usize = 1 << 1;
pub const WEAK_REFERENCE_FLAG: usize = 1 << 2;

//-----------------------------------------------------------------------------

/// A class. The fields up to and including `initializer` are fixed-layout;
/// `virtual_table` in particular is read by emitted `invokevirtual`
/// sequences.
#[repr(C)]
pub struct Class {
    pub vm_flags: usize,
    pub super_class: *mut Class,
    /// Array object of `*mut Method` words, indexed by vtable offset.
    pub virtual_table: Object,
    /// Array object of boxed-value cells, indexed by static field offset.
    pub static_table: Object,
    pub initializer: *mut Method,
    pub name: String,
    /// Declared methods, for by-name resolution from the host.
    pub methods: Vec<*mut Method>,
    /// Instance fields, in words, excluding the class word.
    pub instance_words: usize,
}

impl Class {
    pub fn new(name: &str, super_class: *mut Class, instance_words: usize) -> *mut Class {
        Box::into_raw(Box::new(Class {
            vm_flags: 0,
            super_class,
            virtual_table: ptr::null_mut(),
            static_table: ptr::null_mut(),
            initializer: ptr::null_mut(),
            name: name.to_owned(),
            methods: Vec::new(),
            instance_words,
        }))
    }
}

/// A method. `code` and `compiled` are read by emitted call sequences:
/// `code` holds the runtime-visible companion object (the constant-pool
/// array once compiled, the symbol byte array and later the resolved
/// pointer box for natives), `compiled` the compiled artifact (initially
/// the shared stub). The class-file `Code` record lives Rust-side in
/// `bytecode`.
#[repr(C)]
pub struct Method {
    pub code: Object,
    pub compiled: *const Compiled,
    pub bytecode: *const Code,
    pub class: *mut Class,
    pub flags: u16,
    /// Index into the declaring class's virtual table.
    pub offset: u16,
    pub return_code: u8,
    pub parameter_footprint: usize,
    pub parameter_count: usize,
    pub name: String,
    pub spec: String,
}

/// What a method's body is when it is registered.
pub enum MethodBody {
    Bytecode(Code),
    /// The name of the native symbol to resolve on first call.
    Native(String),
}

/// Is this method dispatched through the virtual table? Non-virtual call
/// sites are eligible for direct-call patching.
pub fn method_virtual(method: *const Method) -> bool {
    let flags = unsafe { (*method).flags };
    flags & (bytecode::ACC_STATIC | bytecode::ACC_PRIVATE) == 0
}

/// A field. `offset` is a byte offset into the instance for instance
/// fields, and a slot index into the class's static table for statics.
pub struct Field {
    pub code: u8,
    pub flags: u16,
    pub offset: usize,
    pub class: *mut Class,
}

/// The class-file `Code` attribute, pre-linked: the constant pool holds
/// resolved references, not symbolic ones.
pub struct Code {
    pub max_stack: usize,
    pub max_locals: usize,
    pub body: Vec<u8>,
    pub pool: Vec<PoolEntry>,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
}

/// A bytecode-level exception handler; `catch_type` is a 1-based pool index
/// of the catch class, 0 for a catch-all.
#[derive(Clone, Copy)]
pub struct ExceptionHandler {
    pub start: u16,
    pub end: u16,
    pub ip: u16,
    pub catch_type: u16,
}

#[derive(Clone, Copy)]
pub struct LineNumber {
    pub ip: u16,
    pub line: u16,
}

#[derive(Clone, Copy)]
pub enum PoolEntry {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Str(ObjectRef),
    Class(ClassRef),
    Method(MethodRef),
    Field(FieldRef),
}

// Shareable raw-pointer wrappers. The underlying objects are immutable
// after registration (or mutated only under the class lock).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRef(pub *mut Class);
unsafe impl Send for ClassRef {}
unsafe impl Sync for ClassRef {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRef(pub *mut Method);
unsafe impl Send for MethodRef {}
unsafe impl Sync for MethodRef {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef(pub *mut Field);
unsafe impl Send for FieldRef {}
unsafe impl Sync for FieldRef {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef(pub Object);
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledRef(pub *const Compiled);
unsafe impl Send for CompiledRef {}
unsafe impl Sync for CompiledRef {}

//-----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ThreadState {
    Active = 0,
    Idle = 1,
    Exclusive = 2,
}

/// A JNI-style local reference, linked into its thread's list so the
/// reference survives until explicitly disposed (or until the `invoke` that
/// created it returns).
pub struct Reference {
    pub target: Object,
    pub next: *mut Reference,
}

/// Per-thread VM state. `frame` is written by the `caller` trampoline (its
/// offset within the struct is baked into that trampoline) and read by the
/// unwinder; it is the head of the chain of live generated frames.
#[repr(C)]
pub struct Thread {
    pub frame: *mut usize,
    pub exception: Object,
    pub machine: *const Machine,
    /// Head of the argument-list chain (see `runtime::ArgumentList`).
    pub argument_list: *mut core::ffi::c_void,
    pub reference: *mut Reference,
    pub state: ThreadState,
}

impl Thread {
    pub fn new(machine: &Machine) -> Box<Thread> {
        Box::new(Thread {
            frame: ptr::null_mut(),
            exception: ptr::null_mut(),
            machine,
            argument_list: ptr::null_mut(),
            reference: ptr::null_mut(),
            state: ThreadState::Active,
        })
    }

    pub fn machine(&self) -> &Machine {
        unsafe { &*self.machine }
    }
}

/// The byte offset of the current-frame pointer within [`Thread`], baked
/// into the `caller` trampoline.
pub fn thread_frame_offset(t: *const Thread) -> usize {
    unsafe { ptr::addr_of!((*t).frame) as usize - t as usize }
}

//-----------------------------------------------------------------------------

/// A recursive lock. Class initialization runs arbitrary bytecode while
/// holding the class lock, and that bytecode can re-enter the compiler,
/// which takes the class lock again on the same thread.
pub struct Monitor {
    state: Mutex<(Option<ThreadId>, usize)>,
    condvar: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            state: Mutex::new((None, 0)),
            condvar: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> MonitorGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.0 {
                None => {
                    *state = (Some(me), 1);
                    break;
                }
                Some(owner) if owner == me => {
                    state.1 += 1;
                    break;
                }
                Some(_) => {
                    state = self.condvar.wait(state).unwrap();
                }
            }
        }
        MonitorGuard {monitor: self}
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.0, Some(std::thread::current().id()));
        state.1 -= 1;
        if state.1 == 0 {
            state.0 = None;
            self.condvar.notify_one();
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::new()
    }
}

pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.release();
    }
}

//-----------------------------------------------------------------------------

/// The well-known classes.
pub struct Types {
    pub object: ClassRef,
    pub throwable: ClassRef,
    pub int: ClassRef,
    pub long: ClassRef,
    pub pointer: ClassRef,
    pub string: ClassRef,
    pub boolean_array: ClassRef,
    pub char_array: ClassRef,
    pub float_array: ClassRef,
    pub double_array: ClassRef,
    pub byte_array: ClassRef,
    pub short_array: ClassRef,
    pub int_array: ClassRef,
    pub long_array: ClassRef,
    pub object_array: ClassRef,
    pub array_index_out_of_bounds_exception: ClassRef,
    pub negative_array_size_exception: ClassRef,
    pub class_cast_exception: ClassRef,
    pub null_pointer_exception: ClassRef,
    pub arithmetic_exception: ClassRef,
    pub unsatisfied_link_error: ClassRef,
    pub exception_in_initializer_error: ClassRef,
    pub no_such_method_error: ClassRef,
}

/// Per-VM state shared by all threads.
pub struct Machine {
    pub classes: Mutex<IndexMap<String, ClassRef>>,
    pub types: Types,
    /// Guards compilation and class initialization.
    pub class_lock: Monitor,
    /// Native symbol registry consulted by `resolve_native_method`.
    pub natives: Mutex<HashMap<String, usize>>,
    // The generated trampolines, built lazily, once per VM.
    pub method_stub: OnceCell<CompiledRef>,
    pub native_invoker: OnceCell<CompiledRef>,
    pub caller: OnceCell<CompiledRef>,
    pub vm_invoke: OnceCell<CompiledRef>,
    pub vm_jump: OnceCell<CompiledRef>,
}

impl Machine {
    pub fn new() -> Box<Machine> {
        let object = Class::new("java/lang/Object", ptr::null_mut(), 0);
        let throwable = Class::new("java/lang/Throwable", object, 1);
        let exception = |name: &str| Class::new(name, throwable, 1);

        let types = Types {
            object: ClassRef(object),
            throwable: ClassRef(throwable),
            int: ClassRef(Class::new("java/lang/Integer", object, 1)),
            long: ClassRef(Class::new("java/lang/Long", object, 2)),
            pointer: ClassRef(Class::new("vm/Pointer", object, 1)),
            string: ClassRef(Class::new("java/lang/String", object, 1)),
            boolean_array: ClassRef(Class::new("[Z", object, 0)),
            char_array: ClassRef(Class::new("[C", object, 0)),
            float_array: ClassRef(Class::new("[F", object, 0)),
            double_array: ClassRef(Class::new("[D", object, 0)),
            byte_array: ClassRef(Class::new("[B", object, 0)),
            short_array: ClassRef(Class::new("[S", object, 0)),
            int_array: ClassRef(Class::new("[I", object, 0)),
            long_array: ClassRef(Class::new("[J", object, 0)),
            object_array: ClassRef(Class::new("[Ljava/lang/Object;", object, 0)),
            array_index_out_of_bounds_exception:
                ClassRef(exception("java/lang/ArrayIndexOutOfBoundsException")),
            negative_array_size_exception:
                ClassRef(exception("java/lang/NegativeArraySizeException")),
            class_cast_exception: ClassRef(exception("java/lang/ClassCastException")),
            null_pointer_exception: ClassRef(exception("java/lang/NullPointerException")),
            arithmetic_exception: ClassRef(exception("java/lang/ArithmeticException")),
            unsatisfied_link_error: ClassRef(exception("java/lang/UnsatisfiedLinkError")),
            exception_in_initializer_error:
                ClassRef(exception("java/lang/ExceptionInInitializerError")),
            no_such_method_error: ClassRef(exception("java/lang/NoSuchMethodError")),
        };

        let machine = Box::new(Machine {
            classes: Mutex::new(IndexMap::new()),
            types,
            class_lock: Monitor::new(),
            natives: Mutex::new(HashMap::new()),
            method_stub: OnceCell::new(),
            native_invoker: OnceCell::new(),
            caller: OnceCell::new(),
            vm_invoke: OnceCell::new(),
            vm_jump: OnceCell::new(),
        });

        for &class in &[
            machine.types.object,
            machine.types.throwable,
            machine.types.int,
            machine.types.long,
            machine.types.string,
            machine.types.array_index_out_of_bounds_exception,
            machine.types.negative_array_size_exception,
            machine.types.class_cast_exception,
            machine.types.null_pointer_exception,
            machine.types.arithmetic_exception,
            machine.types.unsatisfied_link_error,
            machine.types.exception_in_initializer_error,
            machine.types.no_such_method_error,
        ] {
            machine.register_class(class);
        }

        machine
    }

    pub fn register_class(&self, class: ClassRef) {
        let name = unsafe { (*class.0).name.clone() };
        self.classes.lock().unwrap().insert(name, class);
    }

    pub fn find_class(&self, name: &str) -> Option<ClassRef> {
        self.classes.lock().unwrap().get(name).copied()
    }

    pub fn register_native(&self, symbol: &str, function: usize) {
        self.natives.lock().unwrap().insert(symbol.to_owned(), function);
    }
}

//-----------------------------------------------------------------------------
// Object accessors.

pub unsafe fn object_class(o: Object) -> *mut Class {
    *o as *mut Class
}

pub unsafe fn array_length(o: Object) -> usize {
    *o.add(1)
}

/// Address of element 0 of an array object.
pub unsafe fn array_body(o: Object) -> *mut u8 {
    (o as *mut u8).add(ARRAY_BODY)
}

pub unsafe fn array_get_word(o: Object, index: usize) -> usize {
    debug_assert!(index < array_length(o));
    *o.add(2 + index)
}

pub unsafe fn array_set_word(o: Object, index: usize, v: usize) {
    debug_assert!(index < array_length(o));
    *o.add(2 + index) = v;
}

pub unsafe fn int_value(o: Object) -> i32 {
    *o.add(1) as i32
}

pub unsafe fn long_value(o: Object) -> i64 {
    if BYTES_PER_WORD == 8 {
        *o.add(1) as i64
    } else {
        let low = *o.add(1) as u64;
        let high = *o.add(2) as u64;
        ((high << 32) | low) as i64
    }
}

pub unsafe fn pointer_value(o: Object) -> usize {
    *o.add(1)
}

/// The text of a string object (word 1 is its byte array).
pub unsafe fn string_text(o: Object) -> String {
    let bytes = *o.add(1) as Object;
    let len = array_length(bytes);
    let slice = std::slice::from_raw_parts(array_body(bytes), len);
    String::from_utf8_lossy(slice).into_owned()
}

/// The message of a throwable (word 1), if any.
pub unsafe fn throwable_message(o: Object) -> Option<String> {
    let message = *o.add(1) as Object;
    if message.is_null() {
        None
    } else {
        Some(string_text(message))
    }
}

//-----------------------------------------------------------------------------
// Allocation. Objects are allocated zeroed and never freed: the collector
// is another subsystem, and this model's objects live for the VM's life.

unsafe fn allocate_words(words: usize) -> Object {
    let layout = Layout::from_size_align(words * BYTES_PER_WORD, BYTES_PER_WORD).unwrap();
    let p = alloc_zeroed(layout) as Object;
    assert!(!p.is_null(), "out of memory");
    p
}

unsafe fn allocate_array(class: ClassRef, length: usize, element_size: usize) -> Object {
    let words = 2 + pad(length * element_size) / BYTES_PER_WORD;
    let o = allocate_words(words);
    *o = class.0 as usize;
    *o.add(1) = length;
    o
}

pub unsafe fn make_instance(class: *mut Class) -> Object {
    let o = allocate_words(1 + (*class).instance_words);
    *o = class as usize;
    o
}

pub unsafe fn make_int(machine: &Machine, v: i32) -> Object {
    let o = make_instance(machine.types.int.0);
    *o.add(1) = v as u32 as usize;
    o
}

pub unsafe fn make_long(machine: &Machine, v: i64) -> Object {
    let o = make_instance(machine.types.long.0);
    if BYTES_PER_WORD == 8 {
        *o.add(1) = v as usize;
    } else {
        *o.add(1) = (v as u64 & 0xFFFF_FFFF) as usize;
        *o.add(2) = ((v as u64) >> 32) as usize;
    }
    o
}

pub unsafe fn make_pointer(machine: &Machine, p: usize) -> Object {
    let o = make_instance(machine.types.pointer.0);
    *o.add(1) = p;
    o
}

pub unsafe fn make_byte_array_from(machine: &Machine, bytes: &[u8]) -> Object {
    let o = allocate_array(machine.types.byte_array, bytes.len(), 1);
    ptr::copy_nonoverlapping(bytes.as_ptr(), array_body(o), bytes.len());
    o
}

pub unsafe fn make_string(machine: &Machine, text: &str) -> Object {
    let o = make_instance(machine.types.string.0);
    *o.add(1) = make_byte_array_from(machine, text.as_bytes()) as usize;
    o
}

pub unsafe fn make_exception(machine: &Machine, class: *mut Class, message: Object) -> Object {
    let _ = machine;
    let o = make_instance(class);
    *o.add(1) = message as usize;
    o
}

/// A plain word array, used for embedded constant pools.
pub unsafe fn make_word_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.object_array, length, BYTES_PER_WORD)
}

pub unsafe fn make_object_array(machine: &Machine, _element: *mut Class, length: usize) -> Object {
    allocate_array(machine.types.object_array, length, BYTES_PER_WORD)
}

pub unsafe fn make_boolean_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.boolean_array, length, 1)
}

pub unsafe fn make_byte_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.byte_array, length, 1)
}

pub unsafe fn make_char_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.char_array, length, 2)
}

pub unsafe fn make_short_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.short_array, length, 2)
}

pub unsafe fn make_int_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.int_array, length, 4)
}

pub unsafe fn make_float_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.float_array, length, 4)
}

pub unsafe fn make_long_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.long_array, length, 8)
}

pub unsafe fn make_double_array(machine: &Machine, length: usize) -> Object {
    allocate_array(machine.types.double_array, length, 8)
}

//-----------------------------------------------------------------------------
// Assignability.

/// Is `b` the same class as `a` or a subclass of it?
pub unsafe fn is_assignable_from(a: *mut Class, b: *mut Class) -> bool {
    let mut c = b;
    while !c.is_null() {
        if c == a {
            return true;
        }
        c = (*c).super_class;
    }
    false
}

/// Is `o` an instance of `class`? Null is not an instance of anything.
pub unsafe fn instance_of(class: *mut Class, o: Object) -> bool {
    !o.is_null() && is_assignable_from(class, object_class(o))
}

//-----------------------------------------------------------------------------
// Pre-linked constant pool resolution. On failure the pending exception is
// set and `None` returned; the compiler abandons the method.

unsafe fn resolution_error(t: &mut Thread, what: &str, index: usize) {
    let machine = &*t.machine;
    let message = make_string(machine, &format!("bad constant pool entry {} ({})", index, what));
    t.exception = make_exception(machine, machine.types.null_pointer_exception.0, message);
}

pub unsafe fn resolve_class(t: &mut Thread, pool: &[PoolEntry], index: usize) -> Option<*mut Class> {
    match pool.get(index) {
        Some(&PoolEntry::Class(class)) => Some(class.0),
        _ => {
            resolution_error(t, "class", index);
            None
        }
    }
}

pub unsafe fn resolve_method(t: &mut Thread, pool: &[PoolEntry], index: usize) -> Option<*mut Method> {
    match pool.get(index) {
        Some(&PoolEntry::Method(method)) => Some(method.0),
        _ => {
            resolution_error(t, "method", index);
            None
        }
    }
}

pub unsafe fn resolve_field(t: &mut Thread, pool: &[PoolEntry], index: usize) -> Option<*mut Field> {
    match pool.get(index) {
        Some(&PoolEntry::Field(field)) => Some(field.0),
        _ => {
            resolution_error(t, "field", index);
            None
        }
    }
}

/// Looks the method's native symbol up in the machine's registry. The
/// symbol is the text of the method's `code` byte array.
pub unsafe fn resolve_native_method(t: &mut Thread, method: *mut Method) -> Option<usize> {
    let bytes = (*method).code;
    let len = array_length(bytes);
    let slice = std::slice::from_raw_parts(array_body(bytes), len);
    let symbol = std::str::from_utf8(slice).ok()?;
    t.machine().natives.lock().unwrap().get(symbol).copied()
}

//-----------------------------------------------------------------------------
// Method and class registration.

impl Method {
    /// Creates a method and adds it to its class's method list. The caller
    /// supplies the shared stub (or native invoker) as the initial compiled
    /// body and is responsible for rebuilding the class's virtual table.
    pub fn new(
        machine: &Machine,
        class: *mut Class,
        name: &str,
        spec: &str,
        flags: u16,
        vtable_index: u16,
        body: MethodBody,
        initial_compiled: *const Compiled,
    ) -> *mut Method {
        let is_static = flags & bytecode::ACC_STATIC != 0;
        let return_code = {
            let it = bytecode::MethodSpecIterator::new(spec);
            field_code_for_descriptor(it.return_descriptor())
        };
        let (code, bytecode_ptr, flags) = match body {
            MethodBody::Bytecode(code) => {
                (ptr::null_mut(), Box::into_raw(Box::new(code)) as *const Code, flags)
            }
            MethodBody::Native(symbol) => {
                let symbol_array = unsafe { make_byte_array_from(machine, symbol.as_bytes()) };
                (symbol_array, ptr::null(), flags | bytecode::ACC_NATIVE)
            }
        };
        let method = Box::into_raw(Box::new(Method {
            code,
            compiled: initial_compiled,
            bytecode: bytecode_ptr,
            class,
            flags,
            offset: vtable_index,
            return_code,
            parameter_footprint: parameter_footprint(spec, is_static),
            parameter_count: parameter_count(spec),
            name: name.to_owned(),
            spec: spec.to_owned(),
        }));
        unsafe {
            (*class).methods.push(method);
        }
        method
    }
}

/// (Re)builds a class's virtual table from a slice of methods, indexed by
/// their vtable offsets.
pub unsafe fn class_set_virtual_table(machine: &Machine, class: *mut Class, methods: &[*mut Method]) {
    let table = make_word_array(machine, methods.len());
    for (i, &m) in methods.iter().enumerate() {
        array_set_word(table, i, m as usize);
    }
    (*class).virtual_table = table;
}

/// Gives a class a static table of `slots` empty boxed-value cells.
pub unsafe fn class_set_static_table(machine: &Machine, class: *mut Class, slots: usize) {
    (*class).static_table = make_word_array(machine, slots);
}

//-----------------------------------------------------------------------------
