use valise::bit::{BitLayout, BitValues};
use valise::error::{DeclarationError, Error, ErrorKind};
use valise::field::{Condition, FieldKind, LengthAdjust, SizeRef};
use valise::scalar::Scalar;
use valise::structure::Structure;
use valise::value::{Record, Value};

fn echo() -> Structure {
    Structure::builder("echo")
        .field("frame_type", FieldKind::scalar(Scalar::u8()))
        .field("len", FieldKind::length(Scalar::u16()))
        .field("payload", FieldKind::sized_payload("len"))
        .build()
        .unwrap()
}

fn pair() -> Structure {
    Structure::builder("pair")
        .field("a", FieldKind::scalar(Scalar::u8()))
        .field("b", FieldKind::scalar(Scalar::u8()))
        .build()
        .unwrap()
}

fn arm_a() -> Structure {
    Structure::builder("a").field("x", FieldKind::scalar(Scalar::u16())).build().unwrap()
}

fn arm_b() -> Structure {
    Structure::builder("b")
        .field("y", FieldKind::scalar(Scalar::u8()))
        .field("z", FieldKind::scalar(Scalar::u8()))
        .build()
        .unwrap()
}

fn dispatch_frame() -> Structure {
    Structure::builder("dispatch_frame")
        .field("magic", FieldKind::magic(b"\xAA\x55"))
        .field("kind", FieldKind::dispatch(Scalar::u8()))
        .field("body", FieldKind::target("kind", [(1, arm_a()), (2, arm_b())]))
        .build()
        .unwrap()
}

#[test]
fn length_prefixed_echo_round_trips() -> Result<(), Error> {
    let echo = echo();
    let mut frame =
        Record::new(&echo).with("frame_type", 0x10u8)?.with("payload", &b"hi"[..])?;
    let wire = echo.pack(&mut frame)?;
    assert_eq!(wire, [0x10, 0x00, 0x02, 0x68, 0x69]);
    assert_eq!(frame.uint("len"), Some(2));
    assert_eq!(echo.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn packing_is_deterministic() -> Result<(), Error> {
    let echo = echo();
    let mut frame =
        Record::new(&echo).with("frame_type", 0x10u8)?.with("payload", &b"hello"[..])?;
    let first = echo.pack(&mut frame)?;
    let second = echo.pack(&mut frame)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn bit_record_field_packs_most_significant_first() -> Result<(), Error> {
    let flags = BitLayout::builder("flags", 16)
        .number("a", 4)
        .number("b", 3)
        .flag("c_flag")
        .number("d", 8)
        .build()?;
    let status =
        Structure::builder("status").field("flags", FieldKind::bits(flags.clone())).build()?;

    let values = BitValues::new(&flags)
        .with("a", 0xA)?
        .with("b", 0x5)?
        .with_flag("c_flag", true)?
        .with("d", 0x7F)?;
    let mut frame = Record::new(&status).with("flags", values)?;
    let wire = status.pack(&mut frame)?;
    assert_eq!(wire, [0xAB, 0x7F]);
    assert_eq!(status.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn dispatch_selects_arm_by_key() -> Result<(), Error> {
    let frame = dispatch_frame();
    let parsed = frame.unpack(&[0xAA, 0x55, 0x01, 0x00, 0x2A])?;
    assert_eq!(parsed.uint("kind"), Some(1));
    let body = parsed.record("body").expect("body decodes as a record");
    assert_eq!(body.layout().name(), "a");
    assert_eq!(body.uint("x"), Some(42));
    Ok(())
}

#[test]
fn dispatch_key_is_derived_from_the_body_on_pack() -> Result<(), Error> {
    let frame = dispatch_frame();
    let body = Record::new(&arm_b()).with("y", 7u8)?.with("z", 8u8)?;
    let mut record = Record::new(&frame).with("body", body)?;
    let wire = frame.pack(&mut record)?;
    assert_eq!(wire, [0xAA, 0x55, 0x02, 0x07, 0x08]);
    assert_eq!(record.uint("kind"), Some(2));
    assert_eq!(frame.unpack(&wire)?, record);
    Ok(())
}

#[test]
fn unknown_dispatch_key_is_rejected() {
    let err = dispatch_frame().unpack(&[0xAA, 0x55, 0x03, 0x00, 0x2A]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::UnknownDispatch(3));
    assert_eq!(err.path(), "body");
    assert_eq!(err.offset(), 3);
}

#[test]
fn fallback_arm_catches_unknown_keys() -> Result<(), Error> {
    let raw = Structure::builder("raw").field("blob", FieldKind::payload()).build()?;
    let frame = Structure::builder("dispatch_frame")
        .field("magic", FieldKind::magic(b"\xAA\x55"))
        .field("kind", FieldKind::dispatch(Scalar::u8()))
        .field(
            "body",
            FieldKind::Target {
                select: "kind".into(),
                size: SizeRef::Greedy,
                arms: vec![(1, arm_a())],
                fallback: Some(raw),
            },
        )
        .build()?;
    let parsed = frame.unpack(&[0xAA, 0x55, 0x09, 0x01, 0x02, 0x03])?;
    let body = parsed.record("body").expect("body decodes via the fallback");
    assert_eq!(body.layout().name(), "raw");
    assert_eq!(body.bytes("blob"), Some(&[0x01, 0x02, 0x03][..]));
    Ok(())
}

#[test]
fn greedy_tail_is_pinned_by_the_fixed_trailer() -> Result<(), Error> {
    let tailed = Structure::builder("tailed")
        .field("hdr", FieldKind::scalar(Scalar::u8()))
        .field("tail", FieldKind::payload())
        .field("trailer", FieldKind::scalar(Scalar::u16()))
        .build()?;

    let parsed = tailed.unpack(&[0x01, 0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34])?;
    assert_eq!(parsed.uint("hdr"), Some(1));
    assert_eq!(parsed.bytes("tail"), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
    assert_eq!(parsed.uint("trailer"), Some(0x1234));

    // nothing left over for the trailer
    let err = tailed.unpack(&[0x01, 0xDE]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::GreedyUnderflow { missing: 1 });
    assert_eq!(err.path(), "tail");

    // header plus trailer exactly leaves an empty tail
    let parsed = tailed.unpack(&[0x01, 0x12, 0x34])?;
    assert_eq!(parsed.bytes("tail"), Some(&[][..]));
    Ok(())
}

#[test]
fn counted_array_round_trips() -> Result<(), Error> {
    let pair = pair();
    let list = Structure::builder("list")
        .field("n", FieldKind::count(Scalar::u8()))
        .field("arr", FieldKind::counted_array(pair.clone(), "n"))
        .build()?;

    let first = Record::new(&pair).with("a", 1u8)?.with("b", 2u8)?;
    let second = Record::new(&pair).with("a", 3u8)?.with("b", 4u8)?;
    let mut frame = Record::new(&list).with("arr", vec![first, second])?;
    let wire = list.pack(&mut frame)?;
    assert_eq!(wire, [0x02, 0x01, 0x02, 0x03, 0x04]);
    assert_eq!(frame.uint("n"), Some(2));
    assert_eq!(list.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn sized_array_rejects_a_partial_trailing_element() -> Result<(), Error> {
    let list = Structure::builder("list")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("arr", FieldKind::sized_array(pair(), "len"))
        .build()?;

    let err = list.unpack(&[0x03, 0x01, 0x02, 0x03]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::ArrayElementUnderflow { leftover: 1 });
    assert_eq!(err.path(), "arr[1]");

    let parsed = list.unpack(&[0x00])?;
    assert_eq!(parsed.array("arr"), Some(&[][..]));
    Ok(())
}

#[test]
fn sized_substructure_must_fill_its_region() -> Result<(), Error> {
    let framed = Structure::builder("framed")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("body", FieldKind::sized_substruct(pair(), "len"))
        .build()?;

    let parsed = framed.unpack(&[0x02, 0x07, 0x08])?;
    let body = parsed.record("body").expect("body decodes as a record");
    assert_eq!(body.uint("a"), Some(7));
    assert_eq!(body.uint("b"), Some(8));

    let err = framed.unpack(&[0x03, 0x07, 0x08, 0x09]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::LengthInconsistency { declared: 3, actual: 2 });
    assert_eq!(err.path(), "body");
    Ok(())
}

#[test]
fn adjusted_length_covers_extra_header_bytes() -> Result<(), Error> {
    let framed = Structure::builder("framed")
        .field("len", FieldKind::adjusted_length(Scalar::u8(), LengthAdjust::offset(1)))
        .field("body", FieldKind::sized_payload("len"))
        .build()?;

    let mut frame = Record::new(&framed).with("body", &b"abc"[..])?;
    let wire = framed.pack(&mut frame)?;
    assert_eq!(wire, [0x04, b'a', b'b', b'c']);
    assert_eq!(framed.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn scaled_length_rejects_unaligned_payloads() -> Result<(), Error> {
    let framed = Structure::builder("framed")
        .field("len", FieldKind::adjusted_length(Scalar::u8(), LengthAdjust::scaled(4)))
        .field("body", FieldKind::sized_payload("len"))
        .build()?;

    let mut aligned = Record::new(&framed).with("body", vec![0u8; 8])?;
    assert_eq!(framed.pack(&mut aligned)?, [0x02, 0, 0, 0, 0, 0, 0, 0, 0]);

    let mut unaligned = Record::new(&framed).with("body", vec![0u8; 3])?;
    let err = framed.pack(&mut unaligned).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::LengthInconsistency { declared: 0, actual: 3 });
    Ok(())
}

#[test]
fn bit_record_member_provides_a_length() -> Result<(), Error> {
    let hdr = BitLayout::builder("hdr", 8).number("ver", 4).number("len", 4).build()?;
    let small = Structure::builder("small")
        .field("hdr", FieldKind::bits(hdr.clone()))
        .field("body", FieldKind::sized_payload("hdr.len"))
        .build()?;

    let mut frame = Record::new(&small)
        .with("hdr", BitValues::new(&hdr).with("ver", 1)?)?
        .with("body", &b"hi"[..])?;
    let wire = small.pack(&mut frame)?;
    assert_eq!(wire, [0x12, 0x68, 0x69]);
    assert_eq!(frame.bits("hdr").and_then(|bits| bits.get("len")), Some(2));
    assert_eq!(small.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn conditional_field_is_skipped_when_absent() -> Result<(), Error> {
    let optional = Structure::builder("optional")
        .field("flags", FieldKind::scalar(Scalar::u8()))
        .field(
            "ext",
            FieldKind::conditional(
                Condition::new(["flags"], |frame| frame.uint("flags") == Some(1)),
                FieldKind::scalar(Scalar::u16()),
            ),
        )
        .field("end", FieldKind::scalar(Scalar::u8()))
        .build()?;

    let present = optional.unpack(&[0x01, 0x00, 0x2A, 0x99])?;
    assert_eq!(present.uint("ext"), Some(42));
    assert_eq!(present.uint("end"), Some(0x99));

    let absent = optional.unpack(&[0x00, 0x99])?;
    assert_eq!(absent.get("ext"), None);
    assert_eq!(absent.uint("end"), Some(0x99));

    let mut frame = Record::new(&optional).with("flags", 0u8)?.with("end", 0x99u8)?;
    assert_eq!(optional.pack(&mut frame)?, [0x00, 0x99]);
    Ok(())
}

#[test]
fn derived_field_mirrors_its_source() -> Result<(), Error> {
    let sequenced = Structure::builder("sequenced")
        .field("seq", FieldKind::scalar(Scalar::u8()))
        .field(
            "ack",
            FieldKind::derived("seq", |seq| Value::UInt(seq.as_uint().unwrap_or(0) + 1)),
        )
        .build()?;

    let mut frame = Record::new(&sequenced).with("seq", 4u8)?;
    let wire = sequenced.pack(&mut frame)?;
    assert_eq!(wire, [0x04, 0x05]);
    assert_eq!(frame.uint("ack"), Some(5));
    assert_eq!(sequenced.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn derived_field_may_echo_a_length_provider() -> Result<(), Error> {
    let framed = Structure::builder("framed")
        .field("len", FieldKind::length(Scalar::u16()))
        .field("len_echo", FieldKind::derived("len", |len| len.clone()))
        .field("body", FieldKind::sized_payload("len"))
        .build()?;

    let mut frame = Record::new(&framed).with("body", &b"hi"[..])?;
    let wire = framed.pack(&mut frame)?;
    assert_eq!(wire, [0x00, 0x02, 0x00, 0x02, 0x68, 0x69]);
    assert_eq!(frame.uint("len_echo"), Some(2));
    assert_eq!(framed.unpack(&wire)?, frame);
    Ok(())
}

#[test]
fn derived_sources_must_carry_a_scalar() {
    let err = Structure::builder("mirrored")
        .field("blob", FieldKind::bytes(4))
        .field("echo", FieldKind::derived("blob", |blob| blob.clone()))
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::DerivedSource("blob".into()))
    );
}

#[test]
fn magic_mismatch_reports_path_and_offset() {
    let err = dispatch_frame().unpack(&[0x00, 0x55, 0x01, 0x00, 0x2A]).unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::MagicMismatch { expected: vec![0xAA, 0x55], got: vec![0x00, 0x55] }
    );
    assert_eq!(err.path(), "magic");
    assert_eq!(err.offset(), 0);
}

#[test]
fn unset_required_field_names_its_path() -> Result<(), Error> {
    let echo = echo();
    let mut frame = Record::new(&echo).with("frame_type", 0x10u8)?;
    let err = echo.pack(&mut frame).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::UnsetField);
    assert_eq!(err.path(), "payload");
    Ok(())
}

#[test]
fn nested_errors_carry_dotted_paths() -> Result<(), Error> {
    let list = Structure::builder("list")
        .field("n", FieldKind::count(Scalar::u8()))
        .field("arr", FieldKind::counted_array(pair(), "n"))
        .build()?;

    let partial = Record::new(&pair()).with("a", 1u8)?;
    let mut frame = Record::new(&list).with("arr", vec![partial])?;
    let err = list.pack(&mut frame).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::UnsetField);
    assert_eq!(err.path(), "arr[0].b");
    Ok(())
}

#[test]
fn top_level_unpack_rejects_trailing_bytes() -> Result<(), Error> {
    let echo = echo();
    let err = echo.unpack(&[0x10, 0x00, 0x02, 0x68, 0x69, 0xFF]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::LengthInconsistency { declared: 6, actual: 5 });

    let (frame, consumed) = echo.unpack_partial(&[0x10, 0x00, 0x02, 0x68, 0x69, 0xFF])?;
    assert_eq!(consumed, 5);
    assert_eq!(frame.bytes("payload"), Some(&b"hi"[..]));
    Ok(())
}

#[test]
fn short_buffer_reports_needed_and_available() {
    let err = echo().unpack(&[0x10, 0x00]).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::ShortBuffer { needed: 2, available: 1 });
    assert_eq!(err.path(), "len");
    assert_eq!(err.offset(), 1);
}

#[test]
fn duplicate_greedy_fields_are_rejected() {
    let err = Structure::builder("twice")
        .field("first", FieldKind::payload())
        .field("second", FieldKind::payload())
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::DuplicateGreedy("second".into()))
    );
}

#[test]
fn dangling_and_conflicting_providers_are_rejected() {
    let err = Structure::builder("dangling")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("tail", FieldKind::payload())
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::DanglingProvider("len".into()))
    );

    let err = Structure::builder("conflicted")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("first", FieldKind::sized_payload("len"))
        .field("second", FieldKind::sized_payload("len"))
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::ProviderConflict("len".into()))
    );
}

#[test]
fn providers_must_precede_their_consumers() {
    let err = Structure::builder("backwards")
        .field("body", FieldKind::sized_payload("len"))
        .field("len", FieldKind::length(Scalar::u8()))
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::ForwardProvider("len".into()))
    );
}

#[test]
fn variable_width_fields_after_the_greedy_slot_are_rejected() {
    let err = Structure::builder("unpinned")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("tail", FieldKind::payload())
        .field("body", FieldKind::sized_payload("len"))
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::VariableSuffix("body".into()))
    );
}

#[test]
fn count_provider_does_not_size_payloads() {
    let err = Structure::builder("mismatched")
        .field("n", FieldKind::count(Scalar::u8()))
        .field("body", FieldKind::sized_payload("n"))
        .build()
        .unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Declaration(DeclarationError::ProviderMode("n".into())));
}

#[test]
fn conditions_may_only_read_earlier_fields() {
    let err = Structure::builder("forward")
        .field(
            "ext",
            FieldKind::conditional(
                Condition::new(["flags"], |frame| frame.uint("flags") == Some(1)),
                FieldKind::scalar(Scalar::u8()),
            ),
        )
        .field("flags", FieldKind::scalar(Scalar::u8()))
        .build()
        .unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Declaration(DeclarationError::ForwardInput("flags".into()))
    );
}

#[test]
fn greedy_payload_nested_in_a_bounded_region_round_trips() -> Result<(), Error> {
    // the enclosing region is length-bounded, so the inner greedy tail is
    // pinned by it
    let inner = Structure::builder("inner")
        .field("kind", FieldKind::scalar(Scalar::u8()))
        .field("rest", FieldKind::payload())
        .build()?;
    let outer = Structure::builder("outer")
        .field("len", FieldKind::length(Scalar::u8()))
        .field("body", FieldKind::sized_substruct(inner.clone(), "len"))
        .field("crc", FieldKind::scalar(Scalar::u8()))
        .build()?;

    let body = Record::new(&inner).with("kind", 7u8)?.with("rest", &b"xyz"[..])?;
    let mut frame = Record::new(&outer).with("body", body)?.with("crc", 0xEEu8)?;
    let wire = outer.pack(&mut frame)?;
    assert_eq!(wire, [0x04, 0x07, b'x', b'y', b'z', 0xEE]);
    assert_eq!(outer.unpack(&wire)?, frame);
    Ok(())
}
