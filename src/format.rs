use crate::{*, error::*, value::*, util::*, procfs::*, settings::*};
use bitflags::*;
use std::{fmt::Write, net::{Ipv4Addr, Ipv6Addr}};

// printf-style rendering of decoded values, printk-flavored:
//   %d %i  signed decimal (truncated to the operand's bit width, then sign-extended)
//   %u     unsigned decimal
//   %x %X  0x + hex, zero-padded to the bit width
//   %s     text, up to the first NUL
//   %ps    name of the symbol at the address
//   %pS    symbol+0xoffset, plus source location if known
//   %E     enumerand name
//   %pI4   192.168.0.1
//   %pI6c  compressed IPv6
//   %pM    1E-30-6C-A2-45-5F
//   %pz    NUL-terminated string at the address
//   %pw    same for UTF-16
//   %ph    hex dump of memory at the address
//   %v     whatever fits the value's type best
//   %%     percent sign
// Formatting never fails. Anything that can't be rendered becomes a <...> placeholder in the output.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Specifier {
    Signed,
    Unsigned,
    Hex,
    HexUpper,
    Text,
    SymbolName,
    SymbolSource,
    Enum,
    Ipv4,
    Ipv6,
    Mac,
    NarrowString,
    WideString,
    Blob,
    Default,
    Percent,
}

bitflags! { pub struct SpecifierFlags: u8 {
    const NUMERIC = 0x1;
    const TEXT = 0x2;
    // Output depends on target state (symbols, memory, enum tables), not only on the value.
    const ADDRESS_DEPENDENT = 0x4;
    // Doesn't consume a value.
    const LITERAL = 0x8;
}}

const DIRECTIVES: [(&str, Specifier); 17] = [
    // Longest first where one is a prefix of another.
    ("%pI6c", Specifier::Ipv6),
    ("%pI4", Specifier::Ipv4),
    ("%ps", Specifier::SymbolName),
    ("%pS", Specifier::SymbolSource),
    ("%pM", Specifier::Mac),
    ("%pz", Specifier::NarrowString),
    ("%pw", Specifier::WideString),
    ("%ph", Specifier::Blob),
    ("%d", Specifier::Signed),
    ("%i", Specifier::Signed),
    ("%u", Specifier::Unsigned),
    ("%x", Specifier::Hex),
    ("%X", Specifier::HexUpper),
    ("%s", Specifier::Text),
    ("%E", Specifier::Enum),
    ("%v", Specifier::Default),
    ("%%", Specifier::Percent),
];

impl Specifier {
    // Exact match of a whole directive, e.g. "%pI4".
    pub fn parse(s: &str) -> Option<Specifier> {
        DIRECTIVES.iter().find(|(d, _)| *d == s).map(|(_, spec)| *spec)
    }

    // Longest directive at the start of `s`. On failure, returns the length of the unrecognized directive.
    fn parse_prefix(s: &str) -> std::result::Result<(Specifier, usize), usize> {
        if let Some((d, spec)) = DIRECTIVES.iter().find(|(d, _)| s.starts_with(d)) {
            return Ok((*spec, d.len()));
        }
        let mut it = s.char_indices().skip(1);
        let mut len = match it.next() {
            None => return Err(s.len()),
            Some((i, c)) => i + c.len_utf8(),
        };
        if s[..len].ends_with('p') {
            if let Some((i, c)) = it.next() {
                len = i + c.len_utf8();
            }
        }
        Err(len)
    }

    pub fn flags(self) -> SpecifierFlags {
        use Specifier::*;
        match self {
            Signed | Unsigned | Hex | HexUpper | Default => SpecifierFlags::NUMERIC,
            Text | Ipv4 | Ipv6 | Mac => SpecifierFlags::TEXT,
            SymbolName | SymbolSource | Enum | NarrowString | WideString | Blob => SpecifierFlags::ADDRESS_DEPENDENT,
            Percent => SpecifierFlags::LITERAL,
        }
    }

    pub fn is_address_dependent(self) -> bool { self.flags().contains(SpecifierFlags::ADDRESS_DEPENDENT) }
}

// What the address-dependent specifiers need from the session.
pub trait FormatEnv {
    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo>;
    fn enum_name(&mut self, r: &Ref, value: i128) -> Option<String>;
    // Returns bytes without the terminator, and whether the terminator was found within `limit` units.
    fn read_string(&mut self, addr: usize, unit: usize, limit: usize) -> Result<(Vec<u8>, bool)>;
    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>>;
}

// For formatting without a target: address-dependent specifiers render placeholders.
pub struct NoTarget;

impl FormatEnv for NoTarget {
    fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> { err!(NoSymbol, "no target") }
    fn enum_name(&mut self, r: &Ref, value: i128) -> Option<String> { None }
    fn read_string(&mut self, addr: usize, unit: usize, limit: usize) -> Result<(Vec<u8>, bool)> { err!(Fetch, "no target") }
    fn read_memory(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> { err!(Fetch, "no target") }
}

pub fn format_printf(spec: &str, value: &DecodedValue, r: &Ref, env: &mut dyn FormatEnv, settings: &Settings) -> String {
    match Specifier::parse(spec) {
        Some(s) => format_value(s, value, r, env, settings),
        None => format!("<unknown specifier {}>", spec),
    }
}

pub fn format_value(spec: Specifier, value: &DecodedValue, r: &Ref, env: &mut dyn FormatEnv, settings: &Settings) -> String {
    let bits = r.bit_width();
    match spec {
        Specifier::Percent => "%".to_string(),
        Specifier::Signed => match integer_of(value) {
            Some(x) => format!("{}", sign_extend(x, bits)),
            None => not_a_number(value),
        }
        Specifier::Unsigned => match integer_of(value) {
            Some(x) => format!("{}", truncate(x, bits)),
            None => not_a_number(value),
        }
        Specifier::Hex | Specifier::HexUpper => match integer_of(value) {
            Some(x) => {
                let digits = ((bits + 3) / 4) as usize;
                if spec == Specifier::Hex {
                    format!("0x{:01$x}", truncate(x, bits), digits)
                } else {
                    format!("0x{:01$X}", truncate(x, bits), digits)
                }
            }
            None => not_a_number(value),
        }
        Specifier::Text => match value {
            DecodedValue::Text(s) => until_nul(s.as_bytes()),
            DecodedValue::Bytes(b) => until_nul(b),
            v => format!("{}", v),
        }
        Specifier::Default => match value {
            DecodedValue::Float(f) => format!("{:.*}", settings.float_precision, f),
            DecodedValue::Text(s) => s.clone(),
            DecodedValue::Bytes(b) => format!("[{}]", hex_bytes(b, " ", false)),
            v => format!("{}", v),
        }
        Specifier::Ipv4 => match fixed_bytes::<4>(value, r) {
            Some(b) => Ipv4Addr::from(b).to_string(),
            None => "<bad IPv4 address>".to_string(),
        }
        Specifier::Ipv6 => match fixed_bytes::<16>(value, r) {
            Some(b) => Ipv6Addr::from(b).to_string(),
            None => "<bad IPv6 address>".to_string(),
        }
        Specifier::Mac => match fixed_bytes::<6>(value, r) {
            Some(b) => hex_bytes(&b, "-", true),
            None => "<bad MAC address>".to_string(),
        }
        Specifier::Enum => match integer_of(value) {
            Some(x) => match env.enum_name(r, x) {
                Some(name) => name,
                None => format!("<{} not in enum>", x),
            }
            None => not_a_number(value),
        }
        Specifier::SymbolName | Specifier::SymbolSource => {
            let addr = match address_of(value) {
                Some(a) => a,
                None => return "<bad address>".to_string(),
            };
            match env.symbol_at(addr) {
                Ok(s) if spec == Specifier::SymbolName => s.name,
                Ok(s) => {
                    let mut out = format!("{}+0x{:x}", s.name, s.offset);
                    if let Some(src) = &s.source {
                        write!(out, " ({})", src).unwrap();
                    }
                    out
                }
                Err(_) => format!("0x{:x}", addr),
            }
        }
        Specifier::NarrowString | Specifier::WideString => {
            let addr = match address_of(value) {
                Some(0) => return "<null>".to_string(),
                Some(a) => a,
                None => return "<bad address>".to_string(),
            };
            let unit = if spec == Specifier::WideString {2} else {1};
            match env.read_string(addr, unit, settings.max_string_len) {
                Ok((bytes, terminated)) => {
                    let mut s = if unit == 1 {
                        String::from_utf8_lossy(&bytes).into_owned()
                    } else {
                        let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
                        String::from_utf16_lossy(&units)
                    };
                    if !terminated {
                        s.push_str("...");
                    }
                    s
                }
                Err(e) => format!("<{}>", e),
            }
        }
        Specifier::Blob => {
            if let DecodedValue::Bytes(b) = value {
                return hex_bytes(&b[..b.len().min(settings.max_blob_len)], " ", false);
            }
            let addr = match address_of(value) {
                Some(a) => a,
                None => return "<bad address>".to_string(),
            };
            match env.read_memory(addr, settings.max_blob_len) {
                Ok(b) => hex_bytes(&b, " ", false),
                Err(e) => format!("<{}>", e),
            }
        }
    }
}

// Renders a whole format string. Each directive except %% consumes the next value; a missing value renders as a placeholder.
pub fn format_template(fmt: &str, values: &[(DecodedValue, Ref)], env: &mut dyn FormatEnv, settings: &Settings) -> String {
    let mut out = String::new();
    let mut rest = fmt;
    let mut next = values.iter();
    while let Some(p) = rest.find('%') {
        out.push_str(&rest[..p]);
        rest = &rest[p..];
        let (spec, len) = match Specifier::parse_prefix(rest) {
            Ok(x) => x,
            Err(len) => {
                out.push_str(&format!("<unknown specifier {}>", &rest[..len]));
                next.next();
                rest = &rest[len..];
                continue;
            }
        };
        rest = &rest[len..];
        if spec == Specifier::Percent {
            out.push('%');
            continue;
        }
        match next.next() {
            Some((v, r)) => out.push_str(&format_value(spec, v, r, env, settings)),
            None => out.push_str("<missing value>"),
        }
    }
    out.push_str(rest);
    out
}

fn not_a_number(value: &DecodedValue) -> String {
    match value {
        DecodedValue::Text(_) => "<not a number: text>".to_string(),
        _ => "<not a number>".to_string(),
    }
}

// Little-endian byte blobs of up to 16 bytes count as integers; the rest have to be numeric already.
fn integer_of(value: &DecodedValue) -> Option<i128> {
    match value {
        DecodedValue::Bytes(b) if !b.is_empty() && b.len() <= 16 => {
            let mut a = [0u8; 16];
            a[..b.len()].copy_from_slice(b);
            Some(i128::from_le_bytes(a))
        }
        v => v.as_i128(),
    }
}

fn address_of(value: &DecodedValue) -> Option<usize> {
    let x = integer_of(value)?;
    usize::try_from(x as u64 as u128).ok()
}

fn truncate(x: i128, bits: u32) -> u128 {
    if bits >= 128 { x as u128 } else { x as u128 & ((1u128 << bits) - 1) }
}

fn sign_extend(x: i128, bits: u32) -> i128 {
    if bits >= 128 || bits == 0 {
        return x;
    }
    let shift = 128 - bits;
    (x << shift) >> shift
}

fn until_nul(b: &[u8]) -> String {
    let end = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

// Network addresses are stored in memory order, so an integer operand contributes its little-endian bytes.
fn fixed_bytes<const N: usize>(value: &DecodedValue, r: &Ref) -> Option<[u8; N]> {
    let bytes: Vec<u8> = match value {
        DecodedValue::Bytes(b) => b.clone(),
        DecodedValue::Int(_) | DecodedValue::Wide(_) => {
            let x = value.as_i128()?;
            let width = if r.width > 0 { (r.width as usize).min(16) } else { 16 };
            x.to_le_bytes()[..width].to_vec()
        }
        _ => return None,
    };
    bytes.get(..N)?.try_into().ok()
}
