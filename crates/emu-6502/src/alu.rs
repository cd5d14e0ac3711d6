//! Arithmetic/logic unit.
//!
//! Stateless per call: each function takes its operands, computes the result
//! byte, and updates only the flags that operation defines (N/Z/C/V for
//! arithmetic, N/Z/C for shifts, N/Z for logic). Flags an operation does not
//! name keep their prior value. Carry-in, where relevant, is the current C
//! flag; the D flag is the caller's concern and arrives as `decimal`.
//!
//! Binary add/subtract run in a 9-bit unsigned domain for carry and an
//! independent signed domain for overflow. Decimal (BCD) mode decodes each
//! operand as two packed decimal digits, works on the 0-99 values, and
//! re-encodes; the overflow flag is left untouched in decimal mode, matching
//! the original hardware's undefined V.

use crate::Status;
use crate::flags::{C, N, V, Z};

/// Decode a packed BCD byte into its decimal value.
const fn from_bcd(value: u8) -> u16 {
    (value >> 4) as u16 * 10 + (value & 0x0F) as u16
}

/// Encode a decimal value 0-99 as packed BCD.
const fn to_bcd(value: u16) -> u8 {
    ((value / 10) << 4) as u8 | (value % 10) as u8
}

/// Add with carry. Binary or decimal according to `decimal`.
pub fn add(p: &mut Status, a: u8, b: u8, decimal: bool) -> u8 {
    let carry_in = u16::from(p.is_set(C));

    let result = if decimal {
        let sum = from_bcd(a) + from_bcd(b) + carry_in;
        p.set_if(C, sum > 99);
        to_bcd(sum % 100)
    } else {
        let sum = u16::from(a) + u16::from(b) + carry_in;
        p.set_if(C, sum > 0xFF);
        let signed = i16::from(a as i8) + i16::from(b as i8) + carry_in as i16;
        p.set_if(V, !(-128..=127).contains(&signed));
        sum as u8
    };

    p.update_nz(result);
    result
}

/// Subtract with borrow (borrow = 1 - carry). Binary or decimal.
pub fn sub(p: &mut Status, a: u8, b: u8, decimal: bool) -> u8 {
    let borrow = u16::from(!p.is_set(C));

    let result = if decimal {
        let da = from_bcd(a);
        let db = from_bcd(b) + borrow;
        if da >= db {
            p.set(C);
            to_bcd(da - db)
        } else {
            p.clear(C);
            to_bcd(da + 100 - db)
        }
    } else {
        p.set_if(C, u16::from(a) >= u16::from(b) + borrow);
        let signed = i16::from(a as i8) - i16::from(b as i8) - borrow as i16;
        p.set_if(V, !(-128..=127).contains(&signed));
        a.wrapping_sub(b).wrapping_sub(borrow as u8)
    };

    p.update_nz(result);
    result
}

/// Unsigned compare: carry when `a >= b`, N/Z from the difference's low
/// byte. Never touches overflow.
pub fn cmp(p: &mut Status, a: u8, b: u8) {
    p.set_if(C, a >= b);
    p.update_nz(a.wrapping_sub(b));
}

/// Bitwise AND; N/Z only.
pub fn and(p: &mut Status, a: u8, b: u8) -> u8 {
    let result = a & b;
    p.update_nz(result);
    result
}

/// Bitwise OR; N/Z only.
pub fn ora(p: &mut Status, a: u8, b: u8) -> u8 {
    let result = a | b;
    p.update_nz(result);
    result
}

/// Bitwise exclusive OR; N/Z only.
pub fn eor(p: &mut Status, a: u8, b: u8) -> u8 {
    let result = a ^ b;
    p.update_nz(result);
    result
}

/// Shift left; carry takes the bit shifted off the top.
pub fn shl(p: &mut Status, value: u8) -> u8 {
    p.set_if(C, value & 0x80 != 0);
    let result = value << 1;
    p.update_nz(result);
    result
}

/// Shift right; carry takes the bit shifted off the bottom.
pub fn shr(p: &mut Status, value: u8) -> u8 {
    p.set_if(C, value & 0x01 != 0);
    let result = value >> 1;
    p.update_nz(result);
    result
}

/// Rotate left through carry.
pub fn rol(p: &mut Status, value: u8) -> u8 {
    let carry_in = u8::from(p.is_set(C));
    p.set_if(C, value & 0x80 != 0);
    let result = (value << 1) | carry_in;
    p.update_nz(result);
    result
}

/// Rotate right through carry.
pub fn ror(p: &mut Status, value: u8) -> u8 {
    let carry_in = u8::from(p.is_set(C));
    p.set_if(C, value & 0x01 != 0);
    let result = (value >> 1) | (carry_in << 7);
    p.update_nz(result);
    result
}
