use tutti::{Arg, ArgReader, Msg, MsgBuilder, VecArg};

fn build(args: &[Arg]) -> Msg {
    Msg::build("/svc/x", 0.0, false, args).unwrap()
}

#[test]
fn scalar_roundtrip() {
    let args = [
        Arg::Int32(-7),
        Arg::Int64(1 << 40),
        Arg::Float(2.5),
        Arg::Double(-0.125),
        Arg::Time(12.0),
        Arg::Str("hello".into()),
        Arg::Symbol("sym".into()),
        Arg::Char('Q'),
        Arg::Blob(vec![1, 2, 3, 4, 5]),
        Arg::Midi(0x00903C7F),
        Arg::Bool(true),
        Arg::True,
        Arg::False,
        Arg::Nil,
        Arg::Infinitum,
    ];
    let msg = build(&args);
    assert_eq!(msg.data.types(), "ihfdtsScbmBTFNI");
    let mut r = ArgReader::new(&msg.data);
    for (want, expected) in "ihfdtsScbmBTFNI".chars().zip(args.iter()) {
        assert_eq!(&r.get_next(want).unwrap(), expected);
    }
}

#[test]
fn address_and_service_accessors() {
    let msg = Msg::build("/synth/lfo/freq", 1.25, true, &[Arg::Float(440.0)]).unwrap();
    assert_eq!(msg.data.address(), "/synth/lfo/freq");
    assert_eq!(msg.data.service(), "synth");
    assert_eq!(msg.data.timestamp(), 1.25);
    assert!(!msg.data.is_bundle());
}

#[test]
fn strings_pad_to_word_boundary() {
    for s in ["", "a", "ab", "abc", "abcd", "abcde"] {
        let msg = build(&[Arg::Str(s.into()), Arg::Int32(9)]);
        let mut r = ArgReader::new(&msg.data);
        assert_eq!(r.get_next('s').unwrap(), Arg::Str(s.into()));
        // the int after the padded string must still be intact
        assert_eq!(r.get_next('i').unwrap(), Arg::Int32(9));
    }
}

#[test]
fn blob_lengths_and_padding() {
    for n in [0usize, 1, 3, 4, 5, 8, 13] {
        let payload: Vec<u8> = (0..n as u8).collect();
        let msg = build(&[Arg::Blob(payload.clone()), Arg::Int32(1)]);
        let mut r = ArgReader::new(&msg.data);
        assert_eq!(r.get_next('b').unwrap(), Arg::Blob(payload));
        assert_eq!(r.get_next('i').unwrap(), Arg::Int32(1));
    }
}

#[test]
fn numeric_coercion_matrix() {
    let msg = build(&[Arg::Int32(42)]);
    let mut r = ArgReader::new(&msg.data);
    assert_eq!(r.get_next('h').unwrap(), Arg::Int64(42));

    let msg = build(&[Arg::Int32(42)]);
    assert_eq!(
        ArgReader::new(&msg.data).get_next('d').unwrap(),
        Arg::Double(42.0)
    );
    assert_eq!(
        ArgReader::new(&msg.data).get_next('f').unwrap(),
        Arg::Float(42.0)
    );
    assert_eq!(
        ArgReader::new(&msg.data).get_next('B').unwrap(),
        Arg::Bool(true)
    );
    assert_eq!(ArgReader::new(&msg.data).get_next('T').unwrap(), Arg::True);

    let msg = build(&[Arg::Double(3.9)]);
    assert_eq!(
        ArgReader::new(&msg.data).get_next('i').unwrap(),
        Arg::Int32(3)
    );
    assert_eq!(
        ArgReader::new(&msg.data).get_next('t').unwrap(),
        Arg::Time(3.9)
    );

    let msg = build(&[Arg::Int32(0)]);
    assert_eq!(ArgReader::new(&msg.data).get_next('F').unwrap(), Arg::False);
    assert!(ArgReader::new(&msg.data).get_next('T').is_err());

    let msg = build(&[Arg::True]);
    assert_eq!(
        ArgReader::new(&msg.data).get_next('i').unwrap(),
        Arg::Int32(1)
    );

    let msg = build(&[Arg::Bool(false)]);
    assert_eq!(
        ArgReader::new(&msg.data).get_next('h').unwrap(),
        Arg::Int64(0)
    );
}

#[test]
fn mismatch_poisons_reader() {
    let msg = build(&[Arg::Str("x".into()), Arg::Int32(3)]);
    let mut r = ArgReader::new(&msg.data);
    assert!(r.get_next('i').is_err());
    // after one failure every subsequent call fails too
    assert!(r.get_next('i').is_err());
    assert!(r.get_next('s').is_err());
}

#[test]
fn vector_roundtrip_all_element_types() {
    let vs = [
        VecArg::Int32(vec![1, -2, 3]),
        VecArg::Int64(vec![1 << 35, 2]),
        VecArg::Float(vec![0.5, -0.25]),
        VecArg::Double(vec![1e10, -2.5]),
    ];
    for v in vs {
        let msg = build(&[Arg::Vector(v.clone()), Arg::Int32(7)]);
        let mut r = ArgReader::new(&msg.data);
        assert_eq!(r.get_next('v').unwrap(), Arg::Vector(v));
        assert_eq!(r.get_next('i').unwrap(), Arg::Int32(7));
    }
}

#[test]
fn vector_extracts_as_array() {
    let msg = build(&[Arg::Vector(VecArg::Int32(vec![10, 20, 30]))]);
    let mut r = ArgReader::new(&msg.data);
    assert_eq!(r.get_next('[').unwrap(), Arg::ArrayStart);
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(10));
    // elements coerce individually
    assert_eq!(r.get_next('d').unwrap(), Arg::Double(20.0));
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(30));
    assert_eq!(r.get_next(']').unwrap(), Arg::ArrayEnd);
}

#[test]
fn array_extracts_as_vector() {
    let msg = build(&[
        Arg::ArrayStart,
        Arg::Int32(1),
        Arg::Float(2.0),
        Arg::Double(3.0),
        Arg::ArrayEnd,
    ]);
    let mut r = ArgReader::new(&msg.data);
    // vector type follows the first array element (i)
    match r.get_next('v').unwrap() {
        Arg::Vector(VecArg::Int32(v)) => assert_eq!(v, vec![1, 2, 3]),
        other => panic!("expected int vector, got {other:?}"),
    }
}

#[test]
fn get_vector_coerces_array_elements() {
    let msg = build(&[
        Arg::ArrayStart,
        Arg::Int32(1),
        Arg::Int32(2),
        Arg::ArrayEnd,
    ]);
    let mut r = ArgReader::new(&msg.data);
    assert_eq!(r.get_vector('d').unwrap(), VecArg::Double(vec![1.0, 2.0]));
}

#[test]
fn array_sentinels_roundtrip() {
    let msg = build(&[
        Arg::ArrayStart,
        Arg::Int32(5),
        Arg::ArrayEnd,
        Arg::Str("after".into()),
    ]);
    let mut r = ArgReader::new(&msg.data);
    assert_eq!(r.get_next('[').unwrap(), Arg::ArrayStart);
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(5));
    assert_eq!(r.get_next(']').unwrap(), Arg::ArrayEnd);
    assert_eq!(r.get_next('s').unwrap(), Arg::Str("after".into()));
}

#[test]
fn builder_rejects_mixing_bundle_and_args() {
    let inner = build(&[Arg::Int32(1)]);
    let mut b = MsgBuilder::new();
    b.start();
    b.add_i32(1).unwrap();
    assert!(b.add_message(&inner).is_err());

    let mut b = MsgBuilder::new();
    b.start();
    b.add_message(&inner).unwrap();
    assert!(b.add_i32(1).is_err());
}

#[test]
fn bundle_build_and_walk() {
    let m1 = Msg::build("/drum/hit", 10.0, false, &[Arg::Int32(1)]).unwrap();
    let m2 = Msg::build("/drum/off", 10.5, false, &[Arg::Int32(2)]).unwrap();
    let mut b = MsgBuilder::new();
    b.start();
    b.add_message(&m1).unwrap();
    b.add_message(&m2).unwrap();
    let bundle = b.finish_service(9.5, "drum", "", true).unwrap();
    assert!(bundle.data.is_bundle());
    assert_eq!(bundle.data.address(), "#drum");
    assert_eq!(bundle.data.timestamp(), 9.5);

    let elems: Vec<_> = bundle
        .data
        .bundle_elements()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(elems.len(), 2);
    assert_eq!(elems[0].address(), "/drum/hit");
    assert_eq!(elems[0].timestamp(), 10.0);
    assert_eq!(elems[1].address(), "/drum/off");
    let mut r = ArgReader::new(&elems[1]);
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(2));
}

#[test]
fn builder_is_reusable_after_finish() {
    let mut b = MsgBuilder::new();
    b.start();
    b.add_i32(1).unwrap();
    let first = b.finish(0.0, "/a/b", false).unwrap();
    b.start();
    b.add_str("two").unwrap();
    let second = b.finish(0.0, "/c/d", false).unwrap();
    assert_eq!(first.data.types(), "i");
    assert_eq!(second.data.types(), "s");
    assert_eq!(second.data.address(), "/c/d");
}

#[test]
fn typed_getters() {
    let msg = build(&[
        Arg::Int32(3),
        Arg::Str("s".into()),
        Arg::Bool(true),
        Arg::Double(0.5),
    ]);
    let mut r = ArgReader::new(&msg.data);
    assert_eq!(r.get_i32().unwrap(), 3);
    assert_eq!(r.get_str().unwrap(), "s");
    assert!(r.get_bool().unwrap());
    assert_eq!(r.get_f64().unwrap(), 0.5);
}
