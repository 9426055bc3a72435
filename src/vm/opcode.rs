//! Instruction encoding (spec.md §4.5/§6): one byte opcode followed by
//! operands whose widths depend on the opcode, little-endian throughout.
//!
//! A "register reference" is a 1-byte unsigned index relative to the current
//! frame's `sp`; a "string reference" is a 4-byte unsigned offset into the
//! module's strings blob.

pub type Reg = u8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    ConstInt8(Reg, i8),
    ConstInt32(Reg, i32),
    ConstInt64(Reg, i64),
    ConstNum(Reg, f64),
    ConstPrimitive(Reg, u8),
    ConstString(Reg, u32),

    Add(Reg, Reg, Reg),
    Sub(Reg, Reg, Reg),
    Mul(Reg, Reg, Reg),
    Pow(Reg, Reg, Reg),
    DivFloor(Reg, Reg, Reg),
    Div(Reg, Reg, Reg),
    Mod(Reg, Reg, Reg),

    BitNot(Reg, Reg),
    BitAnd(Reg, Reg, Reg),
    BitOr(Reg, Reg, Reg),
    BitXor(Reg, Reg, Reg),

    /// Materializes a `range(start, end)` value with an implicit step of 1.
    /// spec.md's grammar only ever produces the binary `...` form (no step
    /// literal syntax), and §4.5's opcode list has no dedicated range
    /// constructor, so this fills that gap for the compiler (see DESIGN.md).
    BuildRange(Reg, Reg, Reg),

    BoolNot(Reg, Reg),
    BoolAnd(Reg, Reg, Reg),
    BoolOr(Reg, Reg, Reg),

    LShift(Reg, Reg, Reg),
    RShift(Reg, Reg, Reg),

    Equal(Reg, Reg, Reg),
    NotEqual(Reg, Reg, Reg),
    LessThan(Reg, Reg, Reg),
    LessThanEqual(Reg, Reg, Reg),
    GreaterThan(Reg, Reg, Reg),
    GreaterThanEqual(Reg, Reg, Reg),
    In(Reg, Reg, Reg),

    Move(Reg, Reg),
    Copy(Reg, Reg),
    Negate(Reg, Reg),

    Try(Reg, Reg),

    Jump(i32),
    JumpTrue(Reg, u32),
    JumpFalse(Reg, u32),
    JumpNone(Reg, u32),
    JumpNotError(Reg, u32),

    IterInit(Reg, Reg),
    IterNext(Reg, Reg),

    BuildError(Reg, Reg),
    UnwrapError(Reg, Reg),

    Import(Reg, u32),
    BuildNative(Reg, u32),

    BuildTuple(Reg, Reg, u16),
    BuildList(Reg, Reg, u16),
    BuildMap(Reg, Reg, u16),

    BuildFn(Reg, u8, u8, u32),
    LoadCapture(Reg, u8),
    StoreCapture(Reg, Reg, u8),

    Get(Reg, Reg, Reg),
    Set(Reg, Reg, Reg),

    As(Reg, Reg, u8),
    Is(Reg, Reg, u8),

    Call(Reg, Reg, Reg, u16),
    Return(Reg),
    ReturnNone,

    LoadThis(Reg),
    Discard(Reg),
    LineInfo(u32),
}

macro_rules! tags {
    ($($name:ident = $value:expr,)*) => {
        $(const $name: u8 = $value;)*
    };
}

tags! {
    T_CONST_INT8 = 0,
    T_CONST_INT32 = 1,
    T_CONST_INT64 = 2,
    T_CONST_NUM = 3,
    T_CONST_PRIMITIVE = 4,
    T_CONST_STRING = 5,
    T_ADD = 6,
    T_SUB = 7,
    T_MUL = 8,
    T_POW = 9,
    T_DIV_FLOOR = 10,
    T_DIV = 11,
    T_MOD = 12,
    T_BIT_NOT = 13,
    T_BIT_AND = 14,
    T_BIT_OR = 15,
    T_BIT_XOR = 16,
    T_BOOL_NOT = 17,
    T_BOOL_AND = 18,
    T_BOOL_OR = 19,
    T_LSHIFT = 20,
    T_RSHIFT = 21,
    T_EQUAL = 22,
    T_NOT_EQUAL = 23,
    T_LESS_THAN = 24,
    T_LESS_THAN_EQUAL = 25,
    T_GREATER_THAN = 26,
    T_GREATER_THAN_EQUAL = 27,
    T_IN = 28,
    T_MOVE = 29,
    T_COPY = 30,
    T_NEGATE = 31,
    T_TRY = 32,
    T_JUMP = 33,
    T_JUMP_TRUE = 34,
    T_JUMP_FALSE = 35,
    T_JUMP_NONE = 36,
    T_JUMP_NOT_ERROR = 37,
    T_ITER_INIT = 38,
    T_ITER_NEXT = 39,
    T_BUILD_ERROR = 40,
    T_UNWRAP_ERROR = 41,
    T_IMPORT = 42,
    T_BUILD_NATIVE = 43,
    T_BUILD_TUPLE = 44,
    T_BUILD_LIST = 45,
    T_BUILD_MAP = 46,
    T_BUILD_FN = 47,
    T_LOAD_CAPTURE = 48,
    T_STORE_CAPTURE = 49,
    T_GET = 50,
    T_SET = 51,
    T_AS = 52,
    T_IS = 53,
    T_CALL = 54,
    T_RETURN = 55,
    T_RETURN_NONE = 56,
    T_LOAD_THIS = 57,
    T_DISCARD = 58,
    T_LINE_INFO = 59,
    T_BUILD_RANGE = 60,
}

/// A byte-code encoding/decoding failure: an operand ran past the end of the
/// code stream or an opcode byte has no meaning (spec.md §4.5 "Unknown
/// opcode is a fatal `MalformedByteCode`").
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError(pub String);

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.code.get(self.pos).ok_or_else(|| DecodeError("truncated instruction".into()))?;
        self.pos += 1;
        Ok(b)
    }
    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self.code.get(self.pos..end).ok_or_else(|| DecodeError("truncated instruction".into()))?;
        self.pos = end;
        Ok(slice.try_into().unwrap())
    }
    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.bytes::<2>()?))
    }
    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.bytes::<4>()?))
    }
    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.bytes::<4>()?))
    }
    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.bytes::<8>()?))
    }
    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.bytes::<8>()?))
    }
    fn reg(&mut self) -> Result<Reg, DecodeError> {
        self.u8()
    }
}

/// Decodes one instruction starting at `ip`, returning it and the offset of
/// the next instruction.
pub fn decode(code: &[u8], ip: usize) -> Result<(Op, usize), DecodeError> {
    let mut r = Reader { code, pos: ip };
    let tag = r.u8()?;
    let op = match tag {
        T_CONST_INT8 => Op::ConstInt8(r.reg()?, r.i8()?),
        T_CONST_INT32 => Op::ConstInt32(r.reg()?, r.i32()?),
        T_CONST_INT64 => Op::ConstInt64(r.reg()?, r.i64()?),
        T_CONST_NUM => Op::ConstNum(r.reg()?, r.f64()?),
        T_CONST_PRIMITIVE => Op::ConstPrimitive(r.reg()?, r.u8()?),
        T_CONST_STRING => Op::ConstString(r.reg()?, r.u32()?),
        T_ADD => Op::Add(r.reg()?, r.reg()?, r.reg()?),
        T_SUB => Op::Sub(r.reg()?, r.reg()?, r.reg()?),
        T_MUL => Op::Mul(r.reg()?, r.reg()?, r.reg()?),
        T_POW => Op::Pow(r.reg()?, r.reg()?, r.reg()?),
        T_DIV_FLOOR => Op::DivFloor(r.reg()?, r.reg()?, r.reg()?),
        T_DIV => Op::Div(r.reg()?, r.reg()?, r.reg()?),
        T_MOD => Op::Mod(r.reg()?, r.reg()?, r.reg()?),
        T_BIT_NOT => Op::BitNot(r.reg()?, r.reg()?),
        T_BIT_AND => Op::BitAnd(r.reg()?, r.reg()?, r.reg()?),
        T_BIT_OR => Op::BitOr(r.reg()?, r.reg()?, r.reg()?),
        T_BIT_XOR => Op::BitXor(r.reg()?, r.reg()?, r.reg()?),
        T_BUILD_RANGE => Op::BuildRange(r.reg()?, r.reg()?, r.reg()?),
        T_BOOL_NOT => Op::BoolNot(r.reg()?, r.reg()?),
        T_BOOL_AND => Op::BoolAnd(r.reg()?, r.reg()?, r.reg()?),
        T_BOOL_OR => Op::BoolOr(r.reg()?, r.reg()?, r.reg()?),
        T_LSHIFT => Op::LShift(r.reg()?, r.reg()?, r.reg()?),
        T_RSHIFT => Op::RShift(r.reg()?, r.reg()?, r.reg()?),
        T_EQUAL => Op::Equal(r.reg()?, r.reg()?, r.reg()?),
        T_NOT_EQUAL => Op::NotEqual(r.reg()?, r.reg()?, r.reg()?),
        T_LESS_THAN => Op::LessThan(r.reg()?, r.reg()?, r.reg()?),
        T_LESS_THAN_EQUAL => Op::LessThanEqual(r.reg()?, r.reg()?, r.reg()?),
        T_GREATER_THAN => Op::GreaterThan(r.reg()?, r.reg()?, r.reg()?),
        T_GREATER_THAN_EQUAL => Op::GreaterThanEqual(r.reg()?, r.reg()?, r.reg()?),
        T_IN => Op::In(r.reg()?, r.reg()?, r.reg()?),
        T_MOVE => Op::Move(r.reg()?, r.reg()?),
        T_COPY => Op::Copy(r.reg()?, r.reg()?),
        T_NEGATE => Op::Negate(r.reg()?, r.reg()?),
        T_TRY => Op::Try(r.reg()?, r.reg()?),
        T_JUMP => Op::Jump(r.i32()?),
        T_JUMP_TRUE => Op::JumpTrue(r.reg()?, r.u32()?),
        T_JUMP_FALSE => Op::JumpFalse(r.reg()?, r.u32()?),
        T_JUMP_NONE => Op::JumpNone(r.reg()?, r.u32()?),
        T_JUMP_NOT_ERROR => Op::JumpNotError(r.reg()?, r.u32()?),
        T_ITER_INIT => Op::IterInit(r.reg()?, r.reg()?),
        T_ITER_NEXT => Op::IterNext(r.reg()?, r.reg()?),
        T_BUILD_ERROR => Op::BuildError(r.reg()?, r.reg()?),
        T_UNWRAP_ERROR => Op::UnwrapError(r.reg()?, r.reg()?),
        T_IMPORT => Op::Import(r.reg()?, r.u32()?),
        T_BUILD_NATIVE => Op::BuildNative(r.reg()?, r.u32()?),
        T_BUILD_TUPLE => Op::BuildTuple(r.reg()?, r.reg()?, r.u16()?),
        T_BUILD_LIST => Op::BuildList(r.reg()?, r.reg()?, r.u16()?),
        T_BUILD_MAP => Op::BuildMap(r.reg()?, r.reg()?, r.u16()?),
        T_BUILD_FN => Op::BuildFn(r.reg()?, r.u8()?, r.u8()?, r.u32()?),
        T_LOAD_CAPTURE => Op::LoadCapture(r.reg()?, r.u8()?),
        T_STORE_CAPTURE => Op::StoreCapture(r.reg()?, r.reg()?, r.u8()?),
        T_GET => Op::Get(r.reg()?, r.reg()?, r.reg()?),
        T_SET => Op::Set(r.reg()?, r.reg()?, r.reg()?),
        T_AS => Op::As(r.reg()?, r.reg()?, r.u8()?),
        T_IS => Op::Is(r.reg()?, r.reg()?, r.u8()?),
        T_CALL => Op::Call(r.reg()?, r.reg()?, r.reg()?, r.u16()?),
        T_RETURN => Op::Return(r.reg()?),
        T_RETURN_NONE => Op::ReturnNone,
        T_LOAD_THIS => Op::LoadThis(r.reg()?),
        T_DISCARD => Op::Discard(r.reg()?),
        T_LINE_INFO => Op::LineInfo(r.u32()?),
        other => return Err(DecodeError(format!("unknown opcode byte {other}"))),
    };
    Ok((op, r.pos))
}

/// Appends `op`'s encoding to `out`. The compiler is the only caller.
pub fn encode(op: Op, out: &mut Vec<u8>) {
    match op {
        Op::ConstInt8(a, v) => {
            out.push(T_CONST_INT8);
            out.push(a);
            out.push(v as u8);
        }
        Op::ConstInt32(a, v) => {
            out.push(T_CONST_INT32);
            out.push(a);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Op::ConstInt64(a, v) => {
            out.push(T_CONST_INT64);
            out.push(a);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Op::ConstNum(a, v) => {
            out.push(T_CONST_NUM);
            out.push(a);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Op::ConstPrimitive(a, v) => {
            out.push(T_CONST_PRIMITIVE);
            out.push(a);
            out.push(v);
        }
        Op::ConstString(a, v) => {
            out.push(T_CONST_STRING);
            out.push(a);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Op::Add(a, b, c) => push3(out, T_ADD, a, b, c),
        Op::Sub(a, b, c) => push3(out, T_SUB, a, b, c),
        Op::Mul(a, b, c) => push3(out, T_MUL, a, b, c),
        Op::Pow(a, b, c) => push3(out, T_POW, a, b, c),
        Op::DivFloor(a, b, c) => push3(out, T_DIV_FLOOR, a, b, c),
        Op::Div(a, b, c) => push3(out, T_DIV, a, b, c),
        Op::Mod(a, b, c) => push3(out, T_MOD, a, b, c),
        Op::BitNot(a, b) => push2(out, T_BIT_NOT, a, b),
        Op::BitAnd(a, b, c) => push3(out, T_BIT_AND, a, b, c),
        Op::BitOr(a, b, c) => push3(out, T_BIT_OR, a, b, c),
        Op::BitXor(a, b, c) => push3(out, T_BIT_XOR, a, b, c),
        Op::BuildRange(a, b, c) => push3(out, T_BUILD_RANGE, a, b, c),
        Op::BoolNot(a, b) => push2(out, T_BOOL_NOT, a, b),
        Op::BoolAnd(a, b, c) => push3(out, T_BOOL_AND, a, b, c),
        Op::BoolOr(a, b, c) => push3(out, T_BOOL_OR, a, b, c),
        Op::LShift(a, b, c) => push3(out, T_LSHIFT, a, b, c),
        Op::RShift(a, b, c) => push3(out, T_RSHIFT, a, b, c),
        Op::Equal(a, b, c) => push3(out, T_EQUAL, a, b, c),
        Op::NotEqual(a, b, c) => push3(out, T_NOT_EQUAL, a, b, c),
        Op::LessThan(a, b, c) => push3(out, T_LESS_THAN, a, b, c),
        Op::LessThanEqual(a, b, c) => push3(out, T_LESS_THAN_EQUAL, a, b, c),
        Op::GreaterThan(a, b, c) => push3(out, T_GREATER_THAN, a, b, c),
        Op::GreaterThanEqual(a, b, c) => push3(out, T_GREATER_THAN_EQUAL, a, b, c),
        Op::In(a, b, c) => push3(out, T_IN, a, b, c),
        Op::Move(a, b) => push2(out, T_MOVE, a, b),
        Op::Copy(a, b) => push2(out, T_COPY, a, b),
        Op::Negate(a, b) => push2(out, T_NEGATE, a, b),
        Op::Try(a, b) => push2(out, T_TRY, a, b),
        Op::Jump(offset) => {
            out.push(T_JUMP);
            out.extend_from_slice(&offset.to_le_bytes());
        }
        Op::JumpTrue(a, target) => push_reg_u32(out, T_JUMP_TRUE, a, target),
        Op::JumpFalse(a, target) => push_reg_u32(out, T_JUMP_FALSE, a, target),
        Op::JumpNone(a, target) => push_reg_u32(out, T_JUMP_NONE, a, target),
        Op::JumpNotError(a, target) => push_reg_u32(out, T_JUMP_NOT_ERROR, a, target),
        Op::IterInit(a, b) => push2(out, T_ITER_INIT, a, b),
        Op::IterNext(a, b) => push2(out, T_ITER_NEXT, a, b),
        Op::BuildError(a, b) => push2(out, T_BUILD_ERROR, a, b),
        Op::UnwrapError(a, b) => push2(out, T_UNWRAP_ERROR, a, b),
        Op::Import(a, strref) => push_reg_u32(out, T_IMPORT, a, strref),
        Op::BuildNative(a, strref) => push_reg_u32(out, T_BUILD_NATIVE, a, strref),
        Op::BuildTuple(a, base, count) => push_reg_reg_u16(out, T_BUILD_TUPLE, a, base, count),
        Op::BuildList(a, base, count) => push_reg_reg_u16(out, T_BUILD_LIST, a, base, count),
        Op::BuildMap(a, base, count) => push_reg_reg_u16(out, T_BUILD_MAP, a, base, count),
        Op::BuildFn(a, arg_count, capture_count, entry) => {
            out.push(T_BUILD_FN);
            out.push(a);
            out.push(arg_count);
            out.push(capture_count);
            out.extend_from_slice(&entry.to_le_bytes());
        }
        Op::LoadCapture(a, n) => {
            out.push(T_LOAD_CAPTURE);
            out.push(a);
            out.push(n);
        }
        Op::StoreCapture(target, value, n) => {
            out.push(T_STORE_CAPTURE);
            out.push(target);
            out.push(value);
            out.push(n);
        }
        Op::Get(a, b, c) => push3(out, T_GET, a, b, c),
        Op::Set(a, b, c) => push3(out, T_SET, a, b, c),
        Op::As(a, b, type_id) => {
            out.push(T_AS);
            out.push(a);
            out.push(b);
            out.push(type_id);
        }
        Op::Is(a, b, type_id) => {
            out.push(T_IS);
            out.push(a);
            out.push(b);
            out.push(type_id);
        }
        Op::Call(ret, func, arg_base, arg_count) => {
            out.push(T_CALL);
            out.push(ret);
            out.push(func);
            out.push(arg_base);
            out.extend_from_slice(&arg_count.to_le_bytes());
        }
        Op::Return(a) => {
            out.push(T_RETURN);
            out.push(a);
        }
        Op::ReturnNone => out.push(T_RETURN_NONE),
        Op::LoadThis(a) => {
            out.push(T_LOAD_THIS);
            out.push(a);
        }
        Op::Discard(a) => {
            out.push(T_DISCARD);
            out.push(a);
        }
        Op::LineInfo(line) => {
            out.push(T_LINE_INFO);
            out.extend_from_slice(&line.to_le_bytes());
        }
    }
}

fn push2(out: &mut Vec<u8>, tag: u8, a: Reg, b: Reg) {
    out.push(tag);
    out.push(a);
    out.push(b);
}

fn push3(out: &mut Vec<u8>, tag: u8, a: Reg, b: Reg, c: Reg) {
    out.push(tag);
    out.push(a);
    out.push(b);
    out.push(c);
}

fn push_reg_u32(out: &mut Vec<u8>, tag: u8, a: Reg, value: u32) {
    out.push(tag);
    out.push(a);
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_reg_reg_u16(out: &mut Vec<u8>, tag: u8, a: Reg, b: Reg, value: u16) {
    out.push(tag);
    out.push(a);
    out.push(b);
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_operand_width() {
        let ops = [
            Op::ConstInt64(3, -7),
            Op::ConstNum(1, 2.5),
            Op::Jump(-12),
            Op::Call(0, 1, 2, 300),
            Op::BuildFn(5, 2, 1, 0xdead_beef),
        ];
        for op in ops {
            let mut bytes = Vec::new();
            encode(op, &mut bytes);
            let (decoded, end) = decode(&bytes, 0).unwrap();
            assert_eq!(decoded, op);
            assert_eq!(end, bytes.len());
        }
    }

    #[test]
    fn unknown_opcode_byte_is_a_decode_error() {
        let bytes = [250u8];
        assert!(decode(&bytes, 0).is_err());
    }
}
