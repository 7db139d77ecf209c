//! The compiled artifact: one contiguous executable allocation holding a
//! fixed header, the native code body, the native line-number table, and
//! the native exception-handler table, each region padded to a word
//! boundary. The artifact's address is what a method's `compiled` field
//! points at; the body address is what call sites jump to.

use std::mem::size_of;
use std::ptr;

use crate::{pad};
use super::buffer::{ExecBlock};

/// The fixed header. The code body follows immediately, so its offset from
/// the artifact is [`COMPILED_BODY`], which emitted call sequences add to a
/// loaded `compiled` pointer.
#[repr(C)]
pub struct Compiled {
    pub max_locals: usize,
    pub max_stack: usize,
    pub code_length: usize,
    /// In bytes.
    pub line_number_table_length: usize,
    /// In bytes.
    pub exception_handler_table_length: usize,
}

/// Byte offset of the code body within the artifact.
pub const COMPILED_BODY: usize = size_of::<Compiled>();

/// One line-number table entry: native IP → source line.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeLineNumber {
    pub ip: u32,
    pub line: u32,
}

/// One handler table entry, all fields native IPs except `catch_type`,
/// which is a 1-based slot in the method's constant-pool array, 0 for a
/// catch-all.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub ip: u32,
    pub catch_type: u32,
}

impl Compiled {
    /// Copies the emitted code and side tables into a fresh executable
    /// allocation. The artifact lives for the life of the VM.
    pub fn new(
        max_locals: usize,
        max_stack: usize,
        code: &[u8],
        line_numbers: &[u8],
        exception_handlers: &[u8],
    ) -> *mut Compiled {
        let size = COMPILED_BODY
            + pad(code.len())
            + pad(line_numbers.len())
            + pad(exception_handlers.len());
        let block = ExecBlock::new(size).expect("cannot map executable memory");
        let base = block.into_raw();
        unsafe {
            let header = base as *mut Compiled;
            ptr::write(header, Compiled {
                max_locals,
                max_stack,
                code_length: code.len(),
                line_number_table_length: line_numbers.len(),
                exception_handler_table_length: exception_handlers.len(),
            });
            let body = base.add(COMPILED_BODY);
            ptr::copy_nonoverlapping(code.as_ptr(), body, code.len());
            ptr::copy_nonoverlapping(
                line_numbers.as_ptr(),
                body.add(pad(code.len())),
                line_numbers.len(),
            );
            ptr::copy_nonoverlapping(
                exception_handlers.as_ptr(),
                body.add(pad(code.len()) + pad(line_numbers.len())),
                exception_handlers.len(),
            );
            header
        }
    }

    /// The entry address of the native code.
    pub fn body(&self) -> *const u8 {
        unsafe { (self as *const Compiled as *const u8).add(COMPILED_BODY) }
    }

    pub fn line_number_count(&self) -> usize {
        self.line_number_table_length / size_of::<NativeLineNumber>()
    }

    pub fn line_number(&self, index: usize) -> &NativeLineNumber {
        assert!(index < self.line_number_count());
        unsafe {
            let table = self.body().add(pad(self.code_length)) as *const NativeLineNumber;
            &*table.add(index)
        }
    }

    pub fn exception_handler_count(&self) -> usize {
        self.exception_handler_table_length / size_of::<NativeExceptionHandler>()
    }

    pub fn exception_handler(&self, index: usize) -> &NativeExceptionHandler {
        assert!(index < self.exception_handler_count());
        unsafe {
            let table = self
                .body()
                .add(pad(self.code_length) + pad(self.line_number_table_length))
                as *const NativeExceptionHandler;
            &*table.add(index)
        }
    }
}

//-----------------------------------------------------------------------------
