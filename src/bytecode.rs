//! Class-file constants: opcode numbers, primitive type tags, field type
//! codes, and iteration over method descriptor strings.

/// The JVM opcode numbers the translator understands, by their class-file
/// values.
pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_4: u8 = 0x07;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const LCONST_1: u8 = 0x0A;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1A;
    pub const ILOAD_1: u8 = 0x1B;
    pub const ILOAD_2: u8 = 0x1C;
    pub const ILOAD_3: u8 = 0x1D;
    pub const LLOAD_0: u8 = 0x1E;
    pub const LLOAD_1: u8 = 0x1F;
    pub const LLOAD_2: u8 = 0x20;
    pub const LLOAD_3: u8 = 0x21;
    pub const FLOAD_0: u8 = 0x22;
    pub const FLOAD_1: u8 = 0x23;
    pub const FLOAD_2: u8 = 0x24;
    pub const FLOAD_3: u8 = 0x25;
    pub const ALOAD_0: u8 = 0x2A;
    pub const ALOAD_1: u8 = 0x2B;
    pub const ALOAD_2: u8 = 0x2C;
    pub const ALOAD_3: u8 = 0x2D;
    pub const IALOAD: u8 = 0x2E;
    pub const LALOAD: u8 = 0x2F;
    pub const FALOAD: u8 = 0x30;
    pub const DALOAD: u8 = 0x31;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const CALOAD: u8 = 0x34;
    pub const SALOAD: u8 = 0x35;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const ASTORE: u8 = 0x3A;
    pub const ISTORE_0: u8 = 0x3B;
    pub const ISTORE_1: u8 = 0x3C;
    pub const ISTORE_2: u8 = 0x3D;
    pub const ISTORE_3: u8 = 0x3E;
    pub const LSTORE_0: u8 = 0x3F;
    pub const LSTORE_1: u8 = 0x40;
    pub const LSTORE_2: u8 = 0x41;
    pub const LSTORE_3: u8 = 0x42;
    pub const FSTORE_0: u8 = 0x43;
    pub const FSTORE_1: u8 = 0x44;
    pub const FSTORE_2: u8 = 0x45;
    pub const FSTORE_3: u8 = 0x46;
    pub const ASTORE_0: u8 = 0x4B;
    pub const ASTORE_1: u8 = 0x4C;
    pub const ASTORE_2: u8 = 0x4D;
    pub const ASTORE_3: u8 = 0x4E;
    pub const IASTORE: u8 = 0x4F;
    pub const LASTORE: u8 = 0x50;
    pub const FASTORE: u8 = 0x51;
    pub const DASTORE: u8 = 0x52;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const CASTORE: u8 = 0x55;
    pub const SASTORE: u8 = 0x56;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const IADD: u8 = 0x60;
    pub const LADD: u8 = 0x61;
    pub const ISUB: u8 = 0x64;
    pub const LSUB: u8 = 0x65;
    pub const IMUL: u8 = 0x68;
    pub const LMUL: u8 = 0x69;
    pub const IDIV: u8 = 0x6C;
    pub const LDIV: u8 = 0x6D;
    pub const IREM: u8 = 0x70;
    pub const LREM: u8 = 0x71;
    pub const INEG: u8 = 0x74;
    pub const LNEG: u8 = 0x75;
    pub const IAND: u8 = 0x7E;
    pub const IOR: u8 = 0x80;
    pub const IXOR: u8 = 0x82;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const L2I: u8 = 0x88;
    pub const I2B: u8 = 0x91;
    pub const I2C: u8 = 0x92;
    pub const I2S: u8 = 0x93;
    pub const LCMP: u8 = 0x94;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9A;
    pub const IFLT: u8 = 0x9B;
    pub const IFGE: u8 = 0x9C;
    pub const IFGT: u8 = 0x9D;
    pub const IFLE: u8 = 0x9E;
    pub const IF_ICMPEQ: u8 = 0x9F;
    pub const IF_ICMPNE: u8 = 0xA0;
    pub const IF_ICMPLT: u8 = 0xA1;
    pub const IF_ICMPGE: u8 = 0xA2;
    pub const IF_ICMPGT: u8 = 0xA3;
    pub const IF_ICMPLE: u8 = 0xA4;
    pub const IF_ACMPEQ: u8 = 0xA5;
    pub const IF_ACMPNE: u8 = 0xA6;
    pub const GOTO: u8 = 0xA7;
    pub const IRETURN: u8 = 0xAC;
    pub const LRETURN: u8 = 0xAD;
    pub const FRETURN: u8 = 0xAE;
    pub const DRETURN: u8 = 0xAF;
    pub const ARETURN: u8 = 0xB0;
    pub const RETURN: u8 = 0xB1;
    pub const GETSTATIC: u8 = 0xB2;
    pub const PUTSTATIC: u8 = 0xB3;
    pub const GETFIELD: u8 = 0xB4;
    pub const PUTFIELD: u8 = 0xB5;
    pub const INVOKEVIRTUAL: u8 = 0xB6;
    pub const INVOKESPECIAL: u8 = 0xB7;
    pub const INVOKESTATIC: u8 = 0xB8;
    pub const NEW: u8 = 0xBB;
    pub const NEWARRAY: u8 = 0xBC;
    pub const ANEWARRAY: u8 = 0xBD;
    pub const ARRAYLENGTH: u8 = 0xBE;
    pub const ATHROW: u8 = 0xBF;
    pub const CHECKCAST: u8 = 0xC0;
    pub const INSTANCEOF: u8 = 0xC1;
    pub const IFNULL: u8 = 0xC6;
    pub const IFNONNULL: u8 = 0xC7;
    pub const GOTO_W: u8 = 0xC8;
}

/// `newarray` element type tags.
pub const T_BOOLEAN: u8 = 4;
pub const T_CHAR: u8 = 5;
pub const T_FLOAT: u8 = 6;
pub const T_DOUBLE: u8 = 7;
pub const T_BYTE: u8 = 8;
pub const T_SHORT: u8 = 9;
pub const T_INT: u8 = 10;
pub const T_LONG: u8 = 11;

// Method access flags.
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;

// Field type codes, used for field accesses and return values.
pub const VOID_FIELD: u8 = 0;
pub const BYTE_FIELD: u8 = 1;
pub const BOOLEAN_FIELD: u8 = 2;
pub const CHAR_FIELD: u8 = 3;
pub const SHORT_FIELD: u8 = 4;
pub const FLOAT_FIELD: u8 = 5;
pub const INT_FIELD: u8 = 6;
pub const LONG_FIELD: u8 = 7;
pub const DOUBLE_FIELD: u8 = 8;
pub const OBJECT_FIELD: u8 = 9;

// Native calling-convention type codes, derived from field codes when
// marshalling arguments for the FFI helper.
pub const VOID_TYPE: u8 = 0;
pub const INT8_TYPE: u8 = 1;
pub const INT16_TYPE: u8 = 2;
pub const INT32_TYPE: u8 = 3;
pub const INT64_TYPE: u8 = 4;
pub const FLOAT_TYPE: u8 = 5;
pub const DOUBLE_TYPE: u8 = 6;
pub const POINTER_TYPE: u8 = 7;

/// Maps a field type code to its native calling-convention type.
pub fn field_type(field_code: u8) -> u8 {
    match field_code {
        VOID_FIELD => VOID_TYPE,
        BYTE_FIELD | BOOLEAN_FIELD => INT8_TYPE,
        CHAR_FIELD | SHORT_FIELD => INT16_TYPE,
        INT_FIELD => INT32_TYPE,
        LONG_FIELD => INT64_TYPE,
        FLOAT_FIELD => FLOAT_TYPE,
        DOUBLE_FIELD => DOUBLE_TYPE,
        OBJECT_FIELD => POINTER_TYPE,
        _ => panic!("bad field code {}", field_code),
    }
}

/// Maps the first character of a type descriptor to a field type code.
pub fn field_code_for_descriptor(descriptor: &str) -> u8 {
    match descriptor.as_bytes()[0] {
        b'B' => BYTE_FIELD,
        b'Z' => BOOLEAN_FIELD,
        b'C' => CHAR_FIELD,
        b'S' => SHORT_FIELD,
        b'F' => FLOAT_FIELD,
        b'I' => INT_FIELD,
        b'J' => LONG_FIELD,
        b'D' => DOUBLE_FIELD,
        b'L' | b'[' => OBJECT_FIELD,
        b'V' => VOID_FIELD,
        c => panic!("bad type descriptor {:?}", c as char),
    }
}

//-----------------------------------------------------------------------------

// Operand readers. Each advances `ip` past the operand it reads.

pub fn read_u8(code: &[u8], ip: &mut usize) -> u8 {
    let v = code[*ip];
    *ip += 1;
    v
}

pub fn read_u16(code: &[u8], ip: &mut usize) -> u16 {
    let v = (u16::from(code[*ip]) << 8) | u16::from(code[*ip + 1]);
    *ip += 2;
    v
}

pub fn read_i16(code: &[u8], ip: &mut usize) -> i16 {
    read_u16(code, ip) as i16
}

pub fn read_i32(code: &[u8], ip: &mut usize) -> i32 {
    let v = (u32::from(code[*ip]) << 24)
        | (u32::from(code[*ip + 1]) << 16)
        | (u32::from(code[*ip + 2]) << 8)
        | u32::from(code[*ip + 3]);
    *ip += 4;
    v as i32
}

//-----------------------------------------------------------------------------

/**
 * Iterates over the parameter type descriptors of a method descriptor such
 * as `(I[JLjava/lang/Object;)V`, yielding one `&str` per parameter.
 */
pub struct MethodSpecIterator<'a> {
    spec: &'a str,
    position: usize,
}

impl<'a> MethodSpecIterator<'a> {
    /// `spec` must start with `'('`.
    pub fn new(spec: &'a str) -> Self {
        assert!(spec.starts_with('('));
        MethodSpecIterator {spec, position: 1}
    }

    /// The descriptor after the closing `')'`.
    pub fn return_descriptor(&self) -> &'a str {
        let close = self.spec.find(')').expect("no ')' in method descriptor");
        &self.spec[close + 1..]
    }

    fn descriptor_end(&self, start: usize) -> usize {
        let bytes = self.spec.as_bytes();
        let mut i = start;
        while bytes[i] == b'[' {
            i += 1;
        }
        if bytes[i] == b'L' {
            while bytes[i] != b';' {
                i += 1;
            }
        }
        i + 1
    }
}

impl<'a> Iterator for MethodSpecIterator<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.spec.as_bytes()[self.position] == b')' {
            return None;
        }
        let end = self.descriptor_end(self.position);
        let item = &self.spec[self.position..end];
        self.position = end;
        Some(item)
    }
}

/// The number of stack slots a method's parameters occupy: one per
/// parameter, two for `J`/`D`, plus one for `this` unless the method is
/// static. Slot width is the native word.
pub fn parameter_footprint(spec: &str, is_static: bool) -> usize {
    let mut footprint = 0;
    for descriptor in MethodSpecIterator::new(spec) {
        footprint += match descriptor.as_bytes()[0] {
            b'J' | b'D' => 2,
            _ => 1,
        };
    }
    if !is_static {
        footprint += 1;
    }
    footprint
}

/// The number of declared parameters, ignoring `this`.
pub fn parameter_count(spec: &str) -> usize {
    MethodSpecIterator::new(spec).count()
}

//-----------------------------------------------------------------------------
