//! Distribution-key hashing, bit-for-bit compatible with the backend's
//! `hash_<type>` functions.
//!
//! The backend routes rows by the same functions when it validates
//! constraints locally, so any divergence here silently corrupts placement.
//! The core is Bob Jenkins' 2006 lookup3 hash exactly as the backend ships
//! it (`hash_any` / `hash_uint32`); the per-type wrappers reproduce each
//! type's preprocessing: int8 folds its halves, floats widen to f64 and
//! collapse ±0, bpchar ignores trailing spaces, numeric hashes its base-10000
//! digit array with the weight XORed in.
//!
//! Multi-byte loads use little-endian order, matching the byte order of the
//! cluster this coordinator is built for; mixed-endian clusters are outside
//! the support matrix (the backend's own hash_any has the same property).

use trellis_errors::{internal, internal_err, FabricError, FabricResult};

const USECS_PER_DAY: i64 = 86_400_000_000;
const DAYS_PER_MONTH: i64 = 30;

#[inline(always)]
fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

#[inline(always)]
#[allow(clippy::many_single_char_names)]
fn mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(c);
    a ^= rot(c, 4);
    c = c.wrapping_add(b);
    b = b.wrapping_sub(a);
    b ^= rot(a, 6);
    a = a.wrapping_add(c);
    c = c.wrapping_sub(b);
    c ^= rot(b, 8);
    b = b.wrapping_add(a);
    a = a.wrapping_sub(c);
    a ^= rot(c, 16);
    c = c.wrapping_add(b);
    b = b.wrapping_sub(a);
    b ^= rot(a, 19);
    a = a.wrapping_add(c);
    c = c.wrapping_sub(b);
    c ^= rot(b, 4);
    b = b.wrapping_add(a);
    (a, b, c)
}

#[inline(always)]
#[allow(clippy::many_single_char_names)]
fn finalize(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(rot(b, 14));
    a ^= c;
    a = a.wrapping_sub(rot(c, 11));
    b ^= a;
    b = b.wrapping_sub(rot(a, 25));
    c ^= b;
    c = c.wrapping_sub(rot(b, 16));
    a ^= c;
    a = a.wrapping_sub(rot(c, 4));
    b ^= a;
    b = b.wrapping_sub(rot(a, 14));
    c ^= b;
    c = c.wrapping_sub(rot(b, 24));
    c
}

fn load_u32(k: &[u8]) -> u32 {
    u32::from_le_bytes([k[0], k[1], k[2], k[3]])
}

/// The backend's `hash_any` over an arbitrary byte string.
pub fn hash_bytes(data: &[u8]) -> u32 {
    let seed = 0x9e3779b9u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(3923095);
    let mut a = seed;
    let mut b = seed;
    let mut c = seed;

    let mut k = data;
    while k.len() >= 12 {
        a = a.wrapping_add(load_u32(&k[0..4]));
        b = b.wrapping_add(load_u32(&k[4..8]));
        c = c.wrapping_add(load_u32(&k[8..12]));
        (a, b, c) = mix(a, b, c);
        k = &k[12..];
    }

    // the trailing block feeds a, b, c low-to-high, mirroring the
    // fall-through switch in the original
    if k.len() >= 9 {
        c = c.wrapping_add(partial_word(&k[8..]));
    }
    if k.len() >= 5 {
        b = b.wrapping_add(partial_word(&k[4..k.len().min(8)]));
    }
    if !k.is_empty() {
        a = a.wrapping_add(partial_word(&k[..k.len().min(4)]));
    }
    finalize(a, b, c)
}

fn partial_word(k: &[u8]) -> u32 {
    let mut w = 0u32;
    for (i, &byte) in k.iter().take(4).enumerate() {
        w = w.wrapping_add((byte as u32) << (8 * i));
    }
    w
}

/// The backend's `hash_uint32`: a four-byte key skips the block loop.
pub fn hash_u32(k: u32) -> u32 {
    let seed = 0x9e3779b9u32.wrapping_add(4).wrapping_add(3923095);
    finalize(seed.wrapping_add(k), seed, seed)
}

/// The backend's `hashint8`: fold the halves so that values fitting in 32
/// bits hash identically to their int4 representation.
pub fn hash_i64(v: i64) -> u32 {
    let lo = v as u32;
    let hi = (v >> 32) as u32;
    let folded = if v >= 0 { lo ^ hi } else { lo ^ !hi };
    hash_u32(folded)
}

/// The backend's `hashfloat8` (and, after widening, `hashfloat4`): ±0 hash
/// to 0 so that `-0.0 = 0.0` holds through the hash.
pub fn hash_f64(v: f64) -> u32 {
    if v == 0.0 {
        return 0;
    }
    hash_bytes(&v.to_le_bytes())
}

/// The backend's `hash_numeric` over a decimal text literal: the base-10000
/// digit array with leading and trailing zero groups stripped, XORed with
/// the weight. The scale and the sign do not participate; `NaN` hashes to 0
/// and zero hashes to `0xFFFFFFFF`.
pub fn hash_numeric(literal: &str) -> FabricResult<u32> {
    let s = literal.trim();
    if s.eq_ignore_ascii_case("nan") {
        return Ok(0);
    }
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        internal!("invalid numeric literal {literal:?}");
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        internal!("invalid numeric literal {literal:?}");
    }

    let int_part = int_part.trim_start_matches('0');

    // align decimal digits into base-10000 groups relative to the decimal
    // point; `weight` is the exponent (in groups) of the leading group
    let mut weight: i32;
    let mut aligned = String::new();
    if int_part.is_empty() {
        weight = -1;
        aligned.push_str(frac_part);
    } else {
        weight = (int_part.len() as i32 - 1) / 4;
        let pad = (weight as usize + 1) * 4 - int_part.len();
        for _ in 0..pad {
            aligned.push('0');
        }
        aligned.push_str(int_part);
        aligned.push_str(frac_part);
    }
    while aligned.len() % 4 != 0 {
        aligned.push('0');
    }

    let mut digits: Vec<i16> = aligned
        .as_bytes()
        .chunks(4)
        .map(|group| {
            group
                .iter()
                .fold(0i16, |acc, &d| acc * 10 + (d - b'0') as i16)
        })
        .collect();

    while digits.first() == Some(&0) {
        digits.remove(0);
        weight -= 1;
    }
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        return Ok(u32::MAX);
    }

    let mut bytes = Vec::with_capacity(digits.len() * 2);
    for d in &digits {
        bytes.extend_from_slice(&d.to_le_bytes());
    }
    Ok(hash_bytes(&bytes) ^ (weight as u32))
}

/// Declared type of a distribution key. The set mirrors the backend's
/// hash-operator classes; anything else is rejected at locator construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Bool,
    Char,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Text,
    VarChar,
    BpChar,
    Name,
    Bytea,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Interval,
    Money,
    Numeric,
    Uuid,
}

impl KeyType {
    /// Whether the modulo strategy's raw unsigned interpretation exists for
    /// this type (1-, 2- or 4-byte integral values).
    pub fn supports_modulo(self) -> bool {
        matches!(
            self,
            KeyType::Bool | KeyType::Char | KeyType::Int2 | KeyType::Int4 | KeyType::Oid | KeyType::Date
        )
    }
}

/// A distribution-key value, already evaluated by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bool(bool),
    Char(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// Days since the backend epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    TimeTz {
        usecs: i64,
        zone_secs: i32,
    },
    /// Microseconds since the backend epoch; also timestamptz.
    Timestamp(i64),
    Interval {
        months: i32,
        days: i32,
        usecs: i64,
    },
    /// Cents, or whatever the fractional base unit is.
    Money(i64),
    /// Decimal literal, e.g. `-12.340`.
    Numeric(String),
    Uuid([u8; 16]),
}

fn type_mismatch(ty: KeyType, v: &Datum) -> FabricError {
    internal_err!("key value {v:?} does not match declared type {ty:?}")
}

/// `hash_for_type`: the fixed mapping from declared type to backend hash
/// function. Returns an error if the datum's shape does not match the
/// declared type.
pub fn hash_for_type(ty: KeyType, v: &Datum) -> FabricResult<u32> {
    let h = match (ty, v) {
        (KeyType::Bool, Datum::Bool(b)) => hash_u32(*b as u32),
        (KeyType::Char, Datum::Char(c)) => hash_u32(*c as i32 as u32),
        (KeyType::Int2, Datum::Int2(v)) => hash_u32(*v as i32 as u32),
        (KeyType::Int4, Datum::Int4(v)) => hash_u32(*v as u32),
        (KeyType::Int8, Datum::Int8(v)) => hash_i64(*v),
        (KeyType::Oid, Datum::Oid(v)) => hash_u32(*v),
        (KeyType::Float4, Datum::Float4(v)) => hash_f64(*v as f64),
        (KeyType::Float8, Datum::Float8(v)) => hash_f64(*v),
        (KeyType::Text | KeyType::VarChar | KeyType::Name, Datum::Text(s)) => {
            hash_bytes(s.as_bytes())
        }
        (KeyType::BpChar, Datum::Text(s)) => hash_bytes(s.trim_end_matches(' ').as_bytes()),
        (KeyType::Bytea, Datum::Bytea(b)) => hash_bytes(b),
        (KeyType::Date, Datum::Date(d)) => hash_u32(*d as u32),
        (KeyType::Time, Datum::Time(t)) => hash_i64(*t),
        (KeyType::TimeTz, Datum::TimeTz { usecs, zone_secs }) => {
            hash_i64(*usecs) ^ hash_u32(*zone_secs as u32)
        }
        (KeyType::Timestamp | KeyType::TimestampTz, Datum::Timestamp(t)) => hash_i64(*t),
        (KeyType::Interval, Datum::Interval { months, days, usecs }) => {
            let span = usecs
                .wrapping_add((*days as i64).wrapping_mul(USECS_PER_DAY))
                .wrapping_add(
                    (*months as i64).wrapping_mul(DAYS_PER_MONTH.wrapping_mul(USECS_PER_DAY)),
                );
            hash_i64(span)
        }
        (KeyType::Money, Datum::Money(v)) => hash_i64(*v),
        (KeyType::Numeric, Datum::Numeric(s)) => hash_numeric(s)?,
        (KeyType::Uuid, Datum::Uuid(b)) => hash_bytes(b),
        (ty, v) => return Err(type_mismatch(ty, v)),
    };
    Ok(h)
}

/// The raw 1/2/4-byte unsigned interpretation used by the modulo strategy
/// instead of a hash.
pub fn unsigned_for_type(ty: KeyType, v: &Datum) -> FabricResult<u32> {
    let raw = match (ty, v) {
        (KeyType::Bool, Datum::Bool(b)) => *b as u32,
        (KeyType::Char, Datum::Char(c)) => *c as u8 as u32,
        (KeyType::Int2, Datum::Int2(v)) => *v as u16 as u32,
        (KeyType::Int4, Datum::Int4(v)) => *v as u32,
        (KeyType::Oid, Datum::Oid(v)) => *v,
        (KeyType::Date, Datum::Date(d)) => *d as u32,
        (ty, v) if !ty.supports_modulo() => {
            return Err(FabricError::Config(format!(
                "type {ty:?} cannot be distributed by modulo (value {v:?})"
            )))
        }
        (ty, v) => return Err(type_mismatch(ty, v)),
    };
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // expectations computed with the backend's own hashfunc.c algorithm
    #[test]
    fn hash_u32_vectors() {
        assert_eq!(hash_u32(0), 0xEFBEC0AF);
        assert_eq!(hash_u32(1), 0x8E731746);
        assert_eq!(hash_u32(7), 0xC5A8CBFF);
        assert_eq!(hash_u32(42), 0x59FCFEC8);
        assert_eq!(hash_u32(0x12345678), 0x7A8C8417);
    }

    #[test]
    fn hash_i64_vectors() {
        // values within 32 bits agree with their int4 hash
        assert_eq!(hash_i64(42), hash_u32(42));
        assert_eq!(hash_i64(0x1122334455667788), 0x78D08208);
        assert_eq!(hash_i64(-1), 0x16FE094A);
        assert_eq!(hash_i64(-42), 0xE2F1733B);
    }

    #[test]
    fn hash_bytes_vectors() {
        assert_eq!(hash_bytes(b""), 0xA7EA466D);
        assert_eq!(hash_bytes(b"abc"), 0xD12FEB97);
        assert_eq!(hash_bytes(b"hello"), 0x90859829);
        assert_eq!(hash_bytes(b"postgres"), 0xDC6E191C);
        assert_eq!(hash_bytes(b"hello world"), 0xA76E285F);
        // crosses the 12-byte block boundary
        assert_eq!(hash_bytes(b"aaaaaaaaaaaaa"), 0xCD122C6C);
        assert_eq!(hash_bytes(b"abcdefghijklmnopqrstuvwxyz"), 0x0A00E7BB);
        // exact block multiples still mix the full block
        assert_eq!(hash_bytes(b"hello world!"), 0x5374AEDF);
        assert_eq!(hash_bytes(&[b'a'; 24]), 0x78ADE20C);
    }

    #[test]
    fn hash_f64_vectors() {
        assert_eq!(hash_f64(0.0), 0);
        assert_eq!(hash_f64(-0.0), 0);
        assert_eq!(hash_f64(1.5), 0x259A2972);
        assert_eq!(hash_f64(-2.25), 0x496F63A1);
        assert_eq!(hash_f64(42.0), 0x1F09CE44);
        // float4 keys widen before hashing
        assert_eq!(
            hash_for_type(KeyType::Float4, &Datum::Float4(1.5)).unwrap(),
            hash_f64(1.5)
        );
    }

    #[test]
    fn hash_numeric_vectors() {
        assert_eq!(hash_numeric("0").unwrap(), 0xFFFFFFFF);
        assert_eq!(hash_numeric("0.000").unwrap(), 0xFFFFFFFF);
        assert_eq!(hash_numeric("42").unwrap(), 0xD59957FB);
        // trailing zeros don't change the digit array
        assert_eq!(hash_numeric("42.000").unwrap(), 0xD59957FB);
        assert_eq!(hash_numeric("123456.789").unwrap(), 0xA9931A0F);
        // sign does not participate
        assert_eq!(hash_numeric("-1.5").unwrap(), 0x294DD9D6);
        assert_eq!(hash_numeric("1.5").unwrap(), 0x294DD9D6);
        assert_eq!(hash_numeric("0.0001").unwrap(), 0xB1081CB7);
        assert_eq!(hash_numeric("NaN").unwrap(), 0);
        assert!(hash_numeric("12a").is_err());
        assert!(hash_numeric(".").is_err());
    }

    #[test]
    fn bpchar_ignores_trailing_spaces() {
        let padded = hash_for_type(KeyType::BpChar, &Datum::Text("abc   ".into())).unwrap();
        let bare = hash_for_type(KeyType::BpChar, &Datum::Text("abc".into())).unwrap();
        assert_eq!(padded, bare);
        assert_eq!(bare, hash_bytes(b"abc"));
        // text keys keep their spaces
        let text = hash_for_type(KeyType::Text, &Datum::Text("abc   ".into())).unwrap();
        assert_ne!(text, bare);
    }

    #[test]
    fn uuid_hashes_raw_bytes() {
        let uuid: [u8; 16] = core::array::from_fn(|i| i as u8);
        assert_eq!(
            hash_for_type(KeyType::Uuid, &Datum::Uuid(uuid)).unwrap(),
            0xB02600F0
        );
    }

    #[test]
    fn mismatched_datum_is_rejected() {
        assert!(hash_for_type(KeyType::Int4, &Datum::Text("42".into())).is_err());
        assert!(unsigned_for_type(KeyType::Int4, &Datum::Int8(42)).is_err());
    }

    #[test]
    fn modulo_interpretation_is_unsigned() {
        assert_eq!(
            unsigned_for_type(KeyType::Int2, &Datum::Int2(-1)).unwrap(),
            0xFFFF
        );
        assert_eq!(
            unsigned_for_type(KeyType::Int4, &Datum::Int4(-1)).unwrap(),
            0xFFFFFFFF
        );
        assert_eq!(unsigned_for_type(KeyType::Bool, &Datum::Bool(true)).unwrap(), 1);
        assert!(unsigned_for_type(KeyType::Float8, &Datum::Float8(1.0)).is_err());
        assert!(unsigned_for_type(KeyType::Text, &Datum::Text("x".into())).is_err());
    }

    proptest! {
        #[test]
        fn hashing_is_deterministic(data: Vec<u8>) {
            prop_assert_eq!(hash_bytes(&data), hash_bytes(&data));
        }

        #[test]
        fn int8_folding_matches_int4_for_small_values(v: i32) {
            // the backend guarantees cross-width agreement for in-range values
            prop_assert_eq!(hash_i64(v as i64), hash_u32(v as u32));
        }

        #[test]
        fn numeric_trailing_zeros_are_insignificant(n in 0u64..1_000_000_000) {
            let plain = hash_numeric(&n.to_string()).unwrap();
            let padded = hash_numeric(&format!("{n}.0000")).unwrap();
            prop_assert_eq!(plain, padded);
        }
    }
}
