//! The capability set the rest of the VM sees: thread construction, the
//! shared stubs, frame queries, line numbers, local references, and the
//! invocation entry points.

use std::ptr;

use super::bytecode::{self, ACC_NATIVE, ACC_STATIC};
use super::compiled::Compiled;
use super::frame::{self, Frame};
use super::machine::{
    self, make_exception, make_string, Class, Machine, Method, Object, Thread,
};
use super::runtime::{self, ArgumentList, Value};

/// Reported as the line of any native frame.
pub const NATIVE_LINE: i32 = -2;
/// Reported when a method carries no line-number table.
pub const UNKNOWN_LINE: i32 = -1;

pub trait Processor {
    fn make_thread(&self) -> Box<Thread>;

    /// The shared lazy-compilation stub installed as every bytecode
    /// method's initial body.
    fn method_stub(&self, t: &mut Thread) -> *const Compiled;

    /// The shared body of native methods.
    fn native_invoker(&self, t: &mut Thread) -> *const Compiled;

    fn parameter_footprint(&self, spec: &str, is_static: bool) -> usize;

    fn init_class(&self, t: &mut Thread, class: *mut Class);

    /// Stack scan for the collector; unimplemented in this build.
    fn visit_objects(&self, t: &mut Thread);

    fn frame_start(&self, t: &Thread) -> Frame;
    fn frame_next(&self, frame: Frame) -> Frame;
    fn frame_valid(&self, frame: Frame) -> bool;
    fn frame_method(&self, frame: Frame) -> *mut Method;
    /// The frame's suspended native IP, as an offset into its method's
    /// compiled code.
    fn frame_ip(&self, frame: Frame) -> usize;

    /// The source line for `ip` within `method`, via binary search of the
    /// compiled line-number table.
    fn line_number(&self, method: *mut Method, ip: usize) -> i32;

    fn make_local_reference(&self, t: &mut Thread, o: Object) -> *mut Object;
    fn dispose_local_reference(&self, t: &mut Thread, r: *mut Object);

    /// Invokes with arguments taken from an object array of boxed values.
    fn invoke_array(
        &self,
        t: &mut Thread,
        method: *mut Method,
        this: Object,
        arguments: Object,
    ) -> Option<Object>;

    /// Invokes with host-side argument values.
    fn invoke_list(
        &self,
        t: &mut Thread,
        method: *mut Method,
        this: Object,
        arguments: &[Value],
    ) -> Option<Object>;

    /// Resolves `class_name.method_name` with descriptor `spec` through the
    /// class registry, then invokes it.
    fn invoke_by_name(
        &self,
        t: &mut Thread,
        class_name: &str,
        method_name: &str,
        spec: &str,
        this: Object,
        arguments: &[Value],
    ) -> Option<Object>;
}

//-----------------------------------------------------------------------------

/// The just-in-time compiling processor. Owns the per-VM machine state;
/// threads hold a pointer back to it.
pub struct JitProcessor {
    pub machine: Box<Machine>,
}

impl JitProcessor {
    pub fn new() -> Self {
        JitProcessor {machine: Machine::new()}
    }

    fn check_invocation(&self, t: &Thread, method: *mut Method, this: Object) {
        let _ = t;
        let is_static = unsafe { (*method).flags } & ACC_STATIC != 0;
        assert!(is_static == this.is_null(), "receiver does not match method kind");
    }

    fn resolve_by_name(
        &self,
        t: &mut Thread,
        class_name: &str,
        method_name: &str,
        spec: &str,
    ) -> Option<*mut Method> {
        let found = self.machine.find_class(class_name).and_then(|class| unsafe {
            let mut class = class.0;
            while !class.is_null() {
                for &method in &(*class).methods {
                    if (*method).name == method_name && (*method).spec == spec {
                        return Some(method);
                    }
                }
                class = (*class).super_class;
            }
            None
        });

        if found.is_none() {
            unsafe {
                let message = make_string(
                    &self.machine,
                    &format!("{}.{}{}", class_name, method_name, spec),
                );
                t.exception = make_exception(
                    &self.machine,
                    self.machine.types.no_such_method_error.0,
                    message,
                );
            }
        }
        found
    }
}

impl Default for JitProcessor {
    fn default() -> Self {
        JitProcessor::new()
    }
}

impl Processor for JitProcessor {
    fn make_thread(&self) -> Box<Thread> {
        Thread::new(&self.machine)
    }

    fn method_stub(&self, t: &mut Thread) -> *const Compiled {
        runtime::method_stub(t)
    }

    fn native_invoker(&self, t: &mut Thread) -> *const Compiled {
        runtime::native_invoker(t)
    }

    fn parameter_footprint(&self, spec: &str, is_static: bool) -> usize {
        bytecode::parameter_footprint(spec, is_static)
    }

    fn init_class(&self, t: &mut Thread, class: *mut Class) {
        runtime::init_class(t, class);
    }

    fn visit_objects(&self, _t: &mut Thread) {
        unimplemented!();
    }

    fn frame_start(&self, t: &Thread) -> Frame {
        t.frame
    }

    fn frame_next(&self, frame: Frame) -> Frame {
        unsafe { frame::frame_next(frame) }
    }

    fn frame_valid(&self, frame: Frame) -> bool {
        frame::frame_valid(frame)
    }

    fn frame_method(&self, frame: Frame) -> *mut Method {
        unsafe { frame::frame_method(frame) }
    }

    fn frame_ip(&self, frame: Frame) -> usize {
        unsafe { frame::address_offset(frame::frame_method(frame), frame::frame_address(frame)) }
    }

    fn line_number(&self, method: *mut Method, ip: usize) -> i32 {
        unsafe {
            if (*method).flags & ACC_NATIVE != 0 {
                return NATIVE_LINE;
            }

            let compiled = &*(*method).compiled;
            let count = compiled.line_number_count();
            if count == 0 {
                return UNKNOWN_LINE;
            }

            let ip = ip as u32;
            let mut bottom = 0;
            let mut top = count;
            while top > bottom {
                let middle = bottom + (top - bottom) / 2;
                let entry = compiled.line_number(middle);

                if ip >= entry.ip
                    && (middle + 1 == count || ip < compiled.line_number(middle + 1).ip)
                {
                    return entry.line as i32;
                } else if ip < entry.ip {
                    top = middle;
                } else {
                    bottom = middle + 1;
                }
            }

            panic!("no line number entry for ip {}", ip);
        }
    }

    fn make_local_reference(&self, t: &mut Thread, o: Object) -> *mut Object {
        runtime::make_local_reference(t, o)
    }

    fn dispose_local_reference(&self, t: &mut Thread, r: *mut Object) {
        runtime::dispose_local_reference(t, r);
    }

    fn invoke_array(
        &self,
        t: &mut Thread,
        method: *mut Method,
        this: Object,
        arguments: Object,
    ) -> Option<Object> {
        self.check_invocation(t, method, this);
        let spec = unsafe { (*method).spec.clone() };
        let mut list = ArgumentList::from_object_array(t, this, &spec, arguments);
        runtime::invoke(t, method, &mut list)
    }

    fn invoke_list(
        &self,
        t: &mut Thread,
        method: *mut Method,
        this: Object,
        arguments: &[Value],
    ) -> Option<Object> {
        self.check_invocation(t, method, this);
        let spec = unsafe { (*method).spec.clone() };
        let mut list = ArgumentList::new(t, this, &spec, arguments);
        runtime::invoke(t, method, &mut list)
    }

    fn invoke_by_name(
        &self,
        t: &mut Thread,
        class_name: &str,
        method_name: &str,
        spec: &str,
        this: Object,
        arguments: &[Value],
    ) -> Option<Object> {
        let method = self.resolve_by_name(t, class_name, method_name, spec)?;
        self.invoke_list(t, method, this, arguments)
    }
}

//-----------------------------------------------------------------------------
