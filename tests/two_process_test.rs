//! End-to-end behavior between two ensemble members in one test process,
//! bootstrapped through the hub path (broadcast discovery stays off so the
//! tests are self-contained on any network).

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tutti::{Arg, CanSend, Ensemble, Options, Status, TapMode};

/// The pair tests each open real sockets; run them one at a time.
fn net_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| {
        // `RUST_LOG=tutti=debug cargo test` shows the protocol chatter
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Mutex::new(())
    })
}

fn pair(ensemble: &str) -> (Ensemble, Ensemble) {
    let a = Options::new(ensemble).discovery(false).build().unwrap();
    let b = Options::new(ensemble).discovery(false).build().unwrap();
    (a, b)
}

fn poll_until(
    a: &mut Ensemble,
    b: &mut Ensemble,
    secs: f64,
    mut done: impl FnMut(&mut Ensemble, &mut Ensemble) -> bool,
) -> bool {
    let start = Instant::now();
    loop {
        a.poll().unwrap();
        b.poll().unwrap();
        if done(a, b) {
            return true;
        }
        if start.elapsed().as_secs_f64() > secs {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn hub_discovery_messaging_clock_and_taps() {
    let _guard = net_lock().lock().unwrap_or_else(|e| e.into_inner());
    let (mut a, mut b) = pair("test");

    a.service_new("server").unwrap();
    let hello: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let hello = hello.clone();
        a.method_new("/server/hi", Some("s"), false, move |_, _, r| {
            hello.borrow_mut().push(r.get_str()?);
            Ok(())
        })
        .unwrap();
    }

    b.service_new("client").unwrap();
    b.service_new("sub").unwrap();
    let tapped: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let tapped = tapped.clone();
        b.method_new("/sub/hi", Some("s"), false, move |_, _, r| {
            tapped.borrow_mut().push(r.get_str()?);
            Ok(())
        })
        .unwrap();
    }

    // regardless of process-name ordering, hub() from either side must end
    // with both directories agreeing
    b.hub(IpAddr::V4(a.local_ip()), a.local_tcp_port()).unwrap();
    assert!(
        poll_until(&mut a, &mut b, 5.0, |a, b| {
            a.status("client").is_ok() && a.status("sub").is_ok() && b.status("server").is_ok()
        }),
        "hub handshake did not complete"
    );

    // plain remote delivery
    b.send_cmd("/server/hi", 0.0, &[Arg::Str("hello".into())])
        .unwrap();
    assert!(
        poll_until(&mut a, &mut b, 5.0, |_, _| hello.borrow().len() == 1),
        "message was not delivered"
    );
    assert_eq!(hello.borrow()[0], "hello");

    // tap: copies of everything accepted by `server` go to `sub` on b
    b.tap("server", "sub", TapMode::Keep).unwrap();
    assert!(poll_until(&mut a, &mut b, 5.0, |a, _| {
        a.services_list()
            .iter()
            .any(|s| s.service == "server" && s.tapper.as_deref() == Some("sub"))
    }));
    b.send_cmd("/server/hi", 0.0, &[Arg::Str("copy me".into())])
        .unwrap();
    assert!(
        poll_until(&mut a, &mut b, 5.0, |_, _| tapped.borrow().len() == 1),
        "tap copy did not arrive"
    );
    assert_eq!(tapped.borrow()[0], "copy me");
    assert_eq!(hello.borrow().len(), 2);

    // clock: a becomes the reference, b must reach synchronized status
    a.clock_set().unwrap();
    assert!(
        poll_until(&mut a, &mut b, 5.0, |_, b| {
            matches!(b.status("server"), Ok(Status::Remote))
        }),
        "follower never synchronized"
    );
    let ta = a.time_get().unwrap();
    let tb = b.time_get().unwrap();
    assert!(
        (ta - tb).abs() < 0.010,
        "clocks disagree by {} s",
        (ta - tb).abs()
    );
    let (mean, min) = b.roundtrip().unwrap();
    assert!(min >= 0.0 && mean >= min);

    // properties replicate to the peer of the providing process
    b.set_property("client", "color", "blue").unwrap();
    assert!(poll_until(&mut a, &mut b, 5.0, |a, _| {
        a.property("client", "color").as_deref() == Some("blue")
    }));

    // teardown cascades: drop b, a must forget its services
    drop(b);
    let start = Instant::now();
    while start.elapsed().as_secs_f64() < 5.0 {
        a.poll().unwrap();
        if a.status("client").is_err() && a.status("sub").is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(a.status("client").is_err(), "stale service after hang-up");
}

#[test]
fn backpressure_blocks_then_drains_in_order() {
    let _guard = net_lock().lock().unwrap_or_else(|e| e.into_inner());
    let (mut a, mut b) = pair("testbp");

    a.service_new("sink").unwrap();
    let seen: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        a.method_new("/sink/put", Some("ib"), false, move |_, _, r| {
            let n = r.get_i32()?;
            let _payload = r.get_blob()?;
            seen.borrow_mut().push(n);
            Ok(())
        })
        .unwrap();
    }

    b.hub(IpAddr::V4(a.local_ip()), a.local_tcp_port()).unwrap();
    assert!(poll_until(&mut a, &mut b, 5.0, |_, b| b
        .status("sink")
        .is_ok()));

    // the receiver stops polling; fill its stream until writes queue up
    let payload = vec![0u8; 16 * 1024];
    let mut sent = 0i32;
    let mut saw_blocked = false;
    for i in 0..2000 {
        b.send_cmd(
            "/sink/put",
            0.0,
            &[Arg::Int32(i), Arg::Blob(payload.clone())],
        )
        .unwrap();
        sent = i + 1;
        b.poll().unwrap();
        if matches!(b.can_send("sink"), Ok(CanSend::Blocked)) {
            saw_blocked = true;
            break;
        }
    }
    assert!(saw_blocked, "queue never reported Blocked");

    // once the receiver drains, everything arrives, in order, no loss
    assert!(
        poll_until(&mut a, &mut b, 30.0, |_, _| seen.borrow().len()
            == sent as usize),
        "only {} of {} messages arrived",
        seen.borrow().len(),
        sent
    );
    let expected: Vec<i32> = (0..sent).collect();
    assert_eq!(seen.borrow().as_slice(), expected.as_slice());
    assert!(matches!(b.can_send("sink"), Ok(CanSend::Ready)));
}
