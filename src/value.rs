use crate::{*, error::*, util::*};
use std::{fmt, borrow::Cow};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Signed,
    Unsigned,
    Float,
}

// Addresses a typed piece of a variable: (name, byte offset, byte width) plus optional declared scalar type.
// No pointers here, just name + offset, so it stays valid across cycles even if the variable's image is rebuilt.
// Offset and width are signed because they come out of expression arithmetic; nonsense values are rejected by span().
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ref {
    pub name: String,
    pub offset: i64,
    pub width: i64,
    pub kind: Option<ScalarKind>,
    pub bits: Option<u32>,
}

impl Ref {
    pub fn new(name: &str, offset: i64, width: i64) -> Self { Self {name: name.to_string(), offset, width, kind: None, bits: None} }
    pub fn typed(name: &str, offset: i64, width: i64, kind: ScalarKind) -> Self { Self {name: name.to_string(), offset, width, kind: Some(kind), bits: None} }
    pub fn with_bits(mut self, bits: u32) -> Self { self.bits = Some(bits); self }

    // Declared bit width if any, otherwise the byte width. Clamped to what fits in the formatter's integers.
    pub fn bit_width(&self) -> u32 {
        match self.bits {
            Some(b) if b > 0 => b.min(128),
            _ if self.width > 0 => (self.width.min(16) * 8) as u32,
            _ => 64,
        }
    }

    pub fn span(&self) -> Result<(usize, usize)> {
        if self.offset < 0 {
            return err!(Usage, "negative offset {} in {}", self.offset, self.name);
        }
        if self.width <= 0 {
            return err!(Usage, "non-positive width {} in {}", self.width, self.name);
        }
        let offset = usize::try_from(self.offset)?;
        let width = usize::try_from(self.width)?;
        if offset.checked_add(width).is_none() {
            return err!(Usage, "offset {} + width {} overflows in {}", offset, width, self.name);
        }
        Ok((offset, width))
    }
}

// Result of decoding bytes. Each variant has exactly one decode rule (see decode()); no implicit conversions between them.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    Int(i64), // 1, 2 or 4 bytes, sign- or zero-extended
    Wide(i128), // 8 bytes; i128 so that both i64 and u64 fit
    Float(f64),
    Text(String),
    Bytes(Vec<u8>), // width/kind combination we don't know how to interpret
}

impl DecodedValue {
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int(x) => Some(*x as i128),
            Self::Wide(x) => Some(*x),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(x) => Some(*x as f64),
            Self::Wide(x) => Some(*x as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Self::Bytes(b) => Some(Cow::Borrowed(b.as_slice())),
            Self::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool { match self { Self::Int(_) | Self::Wide(_) | Self::Float(_) => true, _ => false } }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(x) => write!(f, "{}", x),
            Self::Wide(x) => write!(f, "{}", x),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Text(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "[{}]", hex_bytes(b, " ", false)),
        }
    }
}

// Interprets little-endian bytes according to the declared kind.
pub fn decode(bytes: &[u8], kind: Option<ScalarKind>) -> DecodedValue {
    let mut a = [0u8; 8];
    let n = bytes.len();
    if n <= 8 {
        a[..n].copy_from_slice(bytes);
    }
    let x = u64::from_le_bytes(a);
    match (n, kind) {
        (2, Some(ScalarKind::Float)) => DecodedValue::Float(f16_to_f64(x as u16)),
        (4, Some(ScalarKind::Float)) => DecodedValue::Float(f32::from_bits(x as u32) as f64),
        (8, Some(ScalarKind::Float)) => DecodedValue::Float(f64::from_bits(x)),
        (1 | 2 | 4, Some(ScalarKind::Signed)) => {
            // Sign-extend.
            let shift = 64 - n as u32 * 8;
            DecodedValue::Int(((x << shift) as i64) >> shift)
        }
        (1 | 2 | 4, None | Some(ScalarKind::Unsigned)) => DecodedValue::Int(x as i64),
        (8, Some(ScalarKind::Signed)) => DecodedValue::Wide(x as i64 as i128),
        (8, None | Some(ScalarKind::Unsigned)) => DecodedValue::Wide(x as i128),
        _ => DecodedValue::Bytes(bytes.to_vec()),
    }
}

// IEEE-754 binary16 -> f64. Exact: every half value is representable as double.
pub fn f16_to_f64(h: u16) -> f64 {
    let negative = h & 0x8000 != 0;
    let exp = ((h >> 10) & 0x1f) as i32;
    let frac = (h & 0x3ff) as f64;
    let magnitude = match exp {
        0 => frac * 2f64.powi(-24), // zero or subnormal
        0x1f => if frac == 0.0 {f64::INFINITY} else {f64::NAN},
        _ => (1.0 + frac / 1024.0) * 2f64.powi(exp - 15),
    };
    if negative {-magnitude} else {magnitude}
}

// f64 -> IEEE-754 binary16, round to nearest even. Overflow goes to infinity, tiny values to (signed) zero.
pub fn f64_to_f16(v: f64) -> u16 {
    let bits = (v as f32).to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let man = bits & 0x7f_ffff;
    if exp == 0xff {
        return sign | 0x7c00 | if man != 0 {0x200} else {0};
    }
    let e = exp - 127 + 15;
    if e >= 0x1f {
        return sign | 0x7c00;
    }
    let round = |h: u32, rem: u32, halfway: u32| -> u32 {
        if rem > halfway || (rem == halfway && h & 1 == 1) {h + 1} else {h}
    };
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = man | 0x80_0000;
        let shift = (14 - e) as u32;
        let h = round(m >> shift, m & ((1 << shift) - 1), 1 << (shift - 1));
        return sign | h as u16;
    }
    // Carry out of the mantissa bumps the exponent, possibly to infinity; both are correct.
    let h = round(((e as u32) << 10) | (man >> 13), man & 0x1fff, 0x1000);
    sign | h as u16
}

// Values coming from the caller to be stored. encode() turns them into exactly `width` little-endian bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum InputValue {
    Bool(bool),
    Int(i64),
    Wide(i128),
    Float(f64),
    Bytes(Vec<u8>),
}

impl InputValue {
    pub fn encode(&self, width: usize, kind: Option<ScalarKind>) -> Vec<u8> {
        match self {
            &Self::Bool(b) => encode_int(b as i128, width),
            &Self::Int(x) => encode_int(x as i128, width),
            &Self::Wide(x) => encode_int(x, width),
            &Self::Float(f) => match (kind, width) {
                (Some(ScalarKind::Float), 2) => f64_to_f16(f).to_le_bytes().to_vec(),
                (Some(ScalarKind::Float), 4) => (f as f32).to_le_bytes().to_vec(),
                (Some(ScalarKind::Float), 8) => f.to_le_bytes().to_vec(),
                // Saturating; NaN becomes 0.
                _ => encode_int(f.trunc() as i128, width),
            }
            Self::Bytes(b) => {
                let mut res = vec![0u8; width];
                let n = b.len().min(width);
                res[..n].copy_from_slice(&b[..n]);
                res
            }
        }
    }
}

fn encode_int(x: i128, width: usize) -> Vec<u8> {
    let mut res = vec![if x < 0 {0xff} else {0}; width];
    let le = x.to_le_bytes();
    let n = width.min(le.len());
    res[..n].copy_from_slice(&le[..n]);
    res
}
