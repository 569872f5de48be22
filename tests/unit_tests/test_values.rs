// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{NaiveDate, TimeDelta};
use hex_literal::hex;
use s7_client_rs::{
    error::S7Error,
    values::{S7Timer, S7Value, TagType, decode_value, encode_value},
};

fn round_trip(ty: TagType, value: S7Value) {
    let bytes = encode_value(ty, 1, &value).unwrap_or_else(|e| panic!("encode: {e}"));
    assert_eq!(bytes.len(), ty.wire_bytes(1) as usize);
    let back = decode_value(ty, 1, &bytes, 0).unwrap_or_else(|e| panic!("decode: {e}"));
    assert_eq!(back, value);
}

#[test]
fn scalar_round_trips() {
    round_trip(TagType::Byte, S7Value::Byte(0xA5));
    round_trip(TagType::Word, S7Value::Word(0xBEEF));
    round_trip(TagType::Int, S7Value::Int(-12345));
    round_trip(TagType::DWord, S7Value::DWord(0xDEAD_BEEF));
    round_trip(TagType::DInt, S7Value::DInt(-7_654_321));
    round_trip(TagType::Real, S7Value::Real(-3.75));
    round_trip(TagType::LReal, S7Value::LReal(6.02214076e23));
    round_trip(TagType::Counter, S7Value::Counter(999));
    round_trip(
        TagType::Timer,
        S7Value::Timer(S7Timer::new(2, 123).expect("timer")),
    );
    round_trip(
        TagType::TimeSpan,
        S7Value::TimeSpan(TimeDelta::milliseconds(-5_000)),
    );
    round_trip(
        TagType::S7String { max_len: 10 },
        S7Value::S7String("pump-1".to_string()),
    );
}

#[test]
fn big_endian_layouts() {
    assert_eq!(
        encode_value(TagType::Word, 1, &S7Value::Word(0x1234)).expect("encode"),
        hex!("12 34")
    );
    assert_eq!(
        encode_value(TagType::DInt, 1, &S7Value::DInt(-2)).expect("encode"),
        hex!("FF FF FF FE")
    );
    // IEEE-754 big-endian single: 1.0 = 0x3F800000.
    assert_eq!(
        encode_value(TagType::Real, 1, &S7Value::Real(1.0)).expect("encode"),
        hex!("3F 80 00 00")
    );
}

#[test]
fn bool_selects_bit() {
    let v = decode_value(TagType::Bool, 1, &[0b0000_1000], 3).expect("decode");
    assert_eq!(v, S7Value::Bool(true));
    let v = decode_value(TagType::Bool, 1, &[0b0000_1000], 2).expect("decode");
    assert_eq!(v, S7Value::Bool(false));
    // Bit-transport responses deliver the bit in the low position.
    let v = decode_value(TagType::Bool, 1, &[0x01], 0).expect("decode");
    assert_eq!(v, S7Value::Bool(true));
}

#[test]
fn date_time_bcd_scenario() {
    // 2024-12-31 23:59:58.123 is a Tuesday (weekday nibble 3).
    let dt = NaiveDate::from_ymd_opt(2024, 12, 31)
        .and_then(|d| d.and_hms_milli_opt(23, 59, 58, 123))
        .expect("datetime");
    let bytes =
        encode_value(TagType::DateTime, 1, &S7Value::DateTime(dt)).expect("encode");
    assert_eq!(bytes, hex!("24 12 31 23 59 58 12 33"));

    let back = decode_value(TagType::DateTime, 1, &bytes, 0).expect("decode");
    assert_eq!(back, S7Value::DateTime(dt));
}

#[test]
fn date_time_century_rule() {
    // Years 90..=99 are 19xx.
    let dt = NaiveDate::from_ymd_opt(1995, 6, 1)
        .and_then(|d| d.and_hms_milli_opt(12, 0, 0, 0))
        .expect("datetime");
    round_trip(TagType::DateTime, S7Value::DateTime(dt));

    let dt = NaiveDate::from_ymd_opt(2089, 1, 2)
        .and_then(|d| d.and_hms_milli_opt(3, 4, 5, 999))
        .expect("datetime");
    round_trip(TagType::DateTime, S7Value::DateTime(dt));
}

#[test]
fn date_time_out_of_domain() {
    let dt = NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_milli_opt(0, 0, 0, 0))
        .expect("datetime");
    assert!(matches!(
        encode_value(TagType::DateTime, 1, &S7Value::DateTime(dt)),
        Err(S7Error::ValueOutOfRange { .. })
    ));
}

#[test]
fn counter_bcd_layout() {
    assert_eq!(
        encode_value(TagType::Counter, 1, &S7Value::Counter(999)).expect("encode"),
        hex!("09 99")
    );
    assert_eq!(
        encode_value(TagType::Counter, 1, &S7Value::Counter(42)).expect("encode"),
        hex!("00 42")
    );
    assert!(matches!(
        encode_value(TagType::Counter, 1, &S7Value::Counter(1000)),
        Err(S7Error::ValueOutOfRange { .. })
    ));
    // Non-BCD wire bytes are data errors.
    assert!(matches!(
        decode_value(TagType::Counter, 1, &hex!("0A 99"), 0),
        Err(S7Error::MalformedFrame(_))
    ));
}

#[test]
fn timer_base_and_value() {
    let t = S7Timer::new(1, 450).expect("timer");
    let bytes = encode_value(TagType::Timer, 1, &S7Value::Timer(t)).expect("encode");
    assert_eq!(bytes, hex!("14 50"));
    assert!((t.seconds() - 45.0).abs() < 1e-9);

    assert!(S7Timer::new(4, 0).is_err());
    assert!(S7Timer::new(0, 1000).is_err());
}

#[test]
fn string_layout_and_bounds() {
    let bytes = encode_value(
        TagType::S7String { max_len: 8 },
        1,
        &S7Value::S7String("ab".to_string()),
    )
    .expect("encode");
    assert_eq!(bytes, hex!("08 02 61 62 00 00 00 00 00 00"));

    assert!(matches!(
        encode_value(
            TagType::S7String { max_len: 4 },
            1,
            &S7Value::S7String("too long".to_string()),
        ),
        Err(S7Error::ValueOutOfRange { .. })
    ));

    // Current length claims beyond max are clamped on decode.
    let v = decode_value(TagType::S7String { max_len: 4 }, 1, &hex!("04 09 41 42 43 44"), 0)
        .expect("decode");
    assert_eq!(v, S7Value::S7String("ABCD".to_string()));
}

#[test]
fn array_round_trips() {
    for n in [1u16, 2, 7, 64] {
        let values: Vec<S7Value> = (0..n).map(|i| S7Value::Word(i * 3 + 1)).collect();
        let wrapped = if n == 1 {
            values[0].clone()
        } else {
            S7Value::Array(values)
        };
        let bytes = encode_value(TagType::Word, n, &wrapped).expect("encode");
        assert_eq!(bytes.len(), (2 * n) as usize);
        let back = decode_value(TagType::Word, n, &bytes, 0).expect("decode");
        assert_eq!(back, wrapped);
    }
}

#[test]
fn bool_array_packing() {
    let bits: Vec<S7Value> = (0..10).map(|i| S7Value::Bool(i % 3 == 0)).collect();
    let wrapped = S7Value::Array(bits);
    let bytes = encode_value(TagType::Bool, 10, &wrapped).expect("encode");
    // Ten bits pack into two bytes, LSB-first.
    assert_eq!(bytes.len(), 2);
    assert_eq!(bytes[0], 0b0100_1001);
    assert_eq!(bytes[1], 0b0000_0010);
    let back = decode_value(TagType::Bool, 10, &bytes, 0).expect("decode");
    assert_eq!(back, wrapped);
}

#[test]
fn type_mismatch_is_detected() {
    assert!(matches!(
        encode_value(TagType::Word, 1, &S7Value::Byte(1)),
        Err(S7Error::TypeMismatch { .. })
    ));
    assert!(matches!(
        encode_value(TagType::Word, 4, &S7Value::Word(1)),
        Err(S7Error::TypeMismatch { .. })
    ));
    // Wrong element count inside the array.
    assert!(matches!(
        encode_value(TagType::Word, 4, &S7Value::Array(vec![S7Value::Word(1)])),
        Err(S7Error::ValueOutOfRange { .. })
    ));
}

#[test]
fn short_wire_data() {
    assert!(matches!(
        decode_value(TagType::DWord, 1, &[0x01, 0x02], 0),
        Err(S7Error::ShortFrame { .. })
    ));
}
