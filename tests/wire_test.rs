use tutti::{Arg, ArgReader, Msg, MsgBuilder, VecArg};

#[test]
fn frame_roundtrip_preserves_message() {
    let msg = Msg::build(
        "/mix/gain",
        2.75,
        true,
        &[
            Arg::Int32(-1),
            Arg::Int64(1 << 50),
            Arg::Float(0.5),
            Arg::Double(1e-9),
            Arg::Str("label".into()),
            Arg::Blob(vec![9, 8, 7]),
            Arg::Vector(VecArg::Double(vec![1.0, 2.0])),
            Arg::True,
        ],
    )
    .unwrap();
    let frame = msg.to_wire().unwrap();
    let back = Msg::from_wire(&frame).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn frame_layout_is_big_endian() {
    let msg = Msg::build("/a/b", 1.5, true, &[Arg::Int32(0x01020304)]).unwrap();
    let frame = msg.to_wire().unwrap();
    // length counts everything after itself
    let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    assert_eq!(len + 4, frame.len());
    // flags: tcp bit
    assert_eq!(u32::from_be_bytes(frame[4..8].try_into().unwrap()), 1);
    // timestamp in network order
    assert_eq!(&frame[8..16], &1.5f64.to_be_bytes());
    // the int argument lands at the end, in network order
    assert_eq!(&frame[frame.len() - 4..], &[0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn udp_class_message_has_clear_flag() {
    let msg = Msg::build("/a/b", 0.0, false, &[]).unwrap();
    let frame = msg.to_wire().unwrap();
    assert_eq!(u32::from_be_bytes(frame[4..8].try_into().unwrap()), 0);
    assert!(!Msg::from_wire(&frame).unwrap().tcp);
}

#[test]
fn vector_elements_are_swapped() {
    let msg = Msg::build(
        "/v/x",
        0.0,
        false,
        &[Arg::Vector(VecArg::Int32(vec![1, 2]))],
    )
    .unwrap();
    let frame = msg.to_wire().unwrap();
    // the two trailing words are the elements in network order
    let n = frame.len();
    assert_eq!(&frame[n - 8..n - 4], &[0, 0, 0, 1]);
    assert_eq!(&frame[n - 4..], &[0, 0, 0, 2]);
    let back = Msg::from_wire(&frame).unwrap();
    let mut r = ArgReader::new(&back.data);
    assert_eq!(r.get_next('v').unwrap(), Arg::Vector(VecArg::Int32(vec![1, 2])));
}

#[test]
fn bundle_roundtrips_recursively() {
    let leaf = Msg::build("/s/leaf", 3.0, false, &[Arg::Int32(11)]).unwrap();
    let mut b = MsgBuilder::new();
    b.start();
    b.add_message(&leaf).unwrap();
    let inner = b.finish_service(2.0, "s", "", false).unwrap();

    b.start();
    b.add_message(&inner).unwrap();
    b.add_message(&leaf).unwrap();
    let outer = b.finish_service(1.0, "s", "", true).unwrap();

    let frame = outer.to_wire().unwrap();
    let back = Msg::from_wire(&frame).unwrap();
    assert_eq!(back, outer);

    let elems: Vec<_> = back.data.bundle_elements().map(|e| e.unwrap()).collect();
    assert_eq!(elems.len(), 2);
    assert!(elems[0].is_bundle());
    let inner_elems: Vec<_> = elems[0].bundle_elements().map(|e| e.unwrap()).collect();
    assert_eq!(inner_elems[0].address(), "/s/leaf");
    let mut r = ArgReader::new(&inner_elems[0]);
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(11));
}

#[test]
fn malformed_frames_are_rejected() {
    let msg = Msg::build("/a/b", 0.0, false, &[Arg::Str("x".into())]).unwrap();
    let mut frame = msg.to_wire().unwrap();

    // truncation
    assert!(Msg::from_wire(&frame[..frame.len() - 2]).is_err());

    // wrong length word
    let bad_len = (frame.len() as u32).to_be_bytes();
    frame[0..4].copy_from_slice(&bad_len);
    assert!(Msg::from_wire(&frame).is_err());

    // too short to hold a header at all
    assert!(Msg::from_wire(&[0u8; 6]).is_err());
}

#[test]
fn unknown_type_character_is_rejected() {
    let msg = Msg::build("/a/b", 0.0, false, &[Arg::Int32(1)]).unwrap();
    let mut frame = msg.to_wire().unwrap();
    // the type string ",i" sits right after the padded address "/a/b"
    let types_at = 8 + 8 + 8;
    assert_eq!(frame[types_at], b',');
    assert_eq!(frame[types_at + 1], b'i');
    frame[types_at + 1] = b'z';
    assert!(Msg::from_wire(&frame).is_err());
}

#[test]
fn zero_length_blob_and_empty_vector_survive_the_wire() {
    let msg = Msg::build(
        "/e/z",
        0.0,
        false,
        &[
            Arg::Blob(Vec::new()),
            Arg::Vector(VecArg::Float(Vec::new())),
            Arg::Int32(5),
        ],
    )
    .unwrap();
    let back = Msg::from_wire(&msg.to_wire().unwrap()).unwrap();
    let mut r = ArgReader::new(&back.data);
    assert_eq!(r.get_next('b').unwrap(), Arg::Blob(Vec::new()));
    assert_eq!(
        r.get_next('v').unwrap(),
        Arg::Vector(VecArg::Float(Vec::new()))
    );
    assert_eq!(r.get_next('i').unwrap(), Arg::Int32(5));
}
