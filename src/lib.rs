//! A baseline just-in-time compiler for JVM class-file bytecode.
//!
//! Bytecode methods are translated to native x86 / x86-64 code on first
//! call. The operand stack is the machine stack, locals live at fixed
//! offsets from the frame base pointer, and generated frames form a linked
//! chain rooted in the owning thread so that exceptions can unwind across
//! them. There are no optimisation passes: one bytecode instruction becomes
//! one fixed sequence of machine instructions.

pub mod buffer;

pub mod x86;

pub mod bytecode;

pub mod machine;

pub mod compiled;

pub mod frame;

pub mod compiler;

pub mod runtime;

pub mod processor;

/// The native word size. All stack slots, frame cells and pool entries are
/// this wide; the encoder emits a REX prefix exactly when it is 8.
pub const BYTES_PER_WORD: usize = std::mem::size_of::<usize>();

/// Rounds `n` up to a multiple of the word size.
pub const fn pad(n: usize) -> usize {
    (n + BYTES_PER_WORD - 1) & !(BYTES_PER_WORD - 1)
}

/// log2 of the word size, used to scale array indices.
pub const fn log_bytes_per_word() -> u8 {
    if BYTES_PER_WORD == 8 { 3 } else { 2 }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(pad(0), 0);
        assert_eq!(pad(1), BYTES_PER_WORD);
        assert_eq!(pad(BYTES_PER_WORD), BYTES_PER_WORD);
        assert_eq!(pad(BYTES_PER_WORD + 1), 2 * BYTES_PER_WORD);
    }

    #[test]
    fn word_log() {
        assert_eq!(1 << log_bytes_per_word(), BYTES_PER_WORD);
    }
}
