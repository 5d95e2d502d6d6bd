//! Dispatcher behavior within a single process: tree and full-path routing,
//! wildcards, taps, handler replacement, scheduling, and drop warnings.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tutti::error::Error;
use tutti::{Arg, CanSend, Ensemble, ManualTimeProvider, Options, Status, TapMode};

fn quiet(tp: &Arc<ManualTimeProvider>) -> Ensemble {
    Options::new("test")
        .discovery(false)
        .time_provider(tp.clone())
        .build()
        .expect("join failed")
}

fn collector() -> (Rc<RefCell<Vec<i32>>>, impl Fn(i32) + Clone) {
    let seen: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let push = {
        let seen = seen.clone();
        move |v: i32| seen.borrow_mut().push(v)
    };
    (seen, push)
}

#[test]
fn handler_receives_argument() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("server").unwrap();
    let got: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = got.clone();
    ens.method_new("/server/hi", Some("s"), false, move |_, _, r| {
        sink.borrow_mut().push(r.get_str()?);
        Ok(())
    })
    .unwrap();
    ens.send("/server/hi", 0.0, &[Arg::Str("hello".into())])
        .unwrap();
    assert_eq!(got.borrow().as_slice(), ["hello"]);
}

#[test]
fn wildcard_addresses_walk_the_tree() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("synth").unwrap();
    let (seen, push) = collector();
    for (i, leaf) in ["freq", "amp", "phase"].iter().enumerate() {
        let push = push.clone();
        let i = i as i32;
        ens.method_new(&format!("/synth/lfo/{leaf}"), None, false, move |_, _, _| {
            push(i);
            Ok(())
        })
        .unwrap();
    }
    ens.send("/synth/lfo/*", 0.0, &[]).unwrap();
    let mut hits = seen.borrow().clone();
    hits.sort();
    assert_eq!(hits, [0, 1, 2]);

    seen.borrow_mut().clear();
    ens.send("/synth/lfo/{amp,phase}", 0.0, &[]).unwrap();
    assert_eq!(seen.borrow().len(), 2);

    seen.borrow_mut().clear();
    ens.send("/synth/lfo/[f]req", 0.0, &[]).unwrap();
    assert_eq!(seen.borrow().as_slice(), [0]);
}

#[test]
fn bang_prefix_uses_full_path_table() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("s").unwrap();
    let (seen, push) = collector();
    ens.method_new("/s/a/b", Some("i"), false, move |_, _, r| {
        push(r.get_i32()?);
        Ok(())
    })
    .unwrap();
    ens.send("!s/a/b", 0.0, &[Arg::Int32(42)]).unwrap();
    assert_eq!(seen.borrow().as_slice(), [42]);
}

#[test]
fn whole_service_handler_and_tree_replace_each_other() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("svc").unwrap();
    let (seen, push) = collector();
    {
        let push = push.clone();
        ens.method_new("/svc", None, false, move |_, _, _| {
            push(1);
            Ok(())
        })
        .unwrap();
    }
    ens.send("/svc/anything/at/all", 0.0, &[]).unwrap();
    ens.send("/svc", 0.0, &[]).unwrap();
    assert_eq!(seen.borrow().as_slice(), [1, 1]);

    // replace the whole-service handler with a tree leaf
    seen.borrow_mut().clear();
    {
        let push = push.clone();
        ens.method_new("/svc/leaf", None, false, move |_, _, _| {
            push(2);
            Ok(())
        })
        .unwrap();
    }
    ens.send("/svc/leaf", 0.0, &[]).unwrap();
    assert_eq!(seen.borrow().as_slice(), [2]);
    // the old catch-all is gone
    let warned = Rc::new(RefCell::new(Vec::new()));
    let w = warned.clone();
    ens.set_drop_warning(move |why, _| w.borrow_mut().push(why.to_owned()));
    ens.send("/svc/anything", 0.0, &[]).unwrap();
    assert_eq!(warned.borrow().len(), 1);
}

#[test]
fn drop_warning_strings_are_literal() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    let warned: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let w = warned.clone();
    ens.set_drop_warning(move |why, _| w.borrow_mut().push(why.to_owned()));

    let err = ens
        .send("/nosuchservice", 0.0, &[Arg::Int32(1)])
        .unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound));
    assert_eq!(
        warned.borrow().as_slice(),
        ["dropping message because service was not found"]
    );

    warned.borrow_mut().clear();
    ens.service_new("server").unwrap();
    ens.method_new("/server/hi", Some("i"), false, |_, _, _| Ok(()))
        .unwrap();
    ens.send("/server/hi", 0.0, &[Arg::Float(3.3)]).unwrap();
    assert_eq!(
        warned.borrow().as_slice(),
        ["dropping message because of type mismatch"]
    );
}

#[test]
fn coercing_handler_accepts_compatible_types() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("server").unwrap();
    let (seen, push) = collector();
    ens.method_new("/server/n", Some("i"), true, move |_, _, r| {
        push(r.get_i32()?);
        Ok(())
    })
    .unwrap();
    ens.send("/server/n", 0.0, &[Arg::Float(41.9)]).unwrap();
    assert_eq!(seen.borrow().as_slice(), [41]);
}

#[test]
fn timestamped_send_without_clock_is_refused() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("later").unwrap();
    ens.method_new("/later/x", None, false, |_, _, _| Ok(()))
        .unwrap();
    let warned = Rc::new(RefCell::new(0usize));
    let w = warned.clone();
    ens.set_drop_warning(move |_, _| *w.borrow_mut() += 1);
    let err = ens.send("/later/x", 5.0, &[]).unwrap_err();
    assert!(matches!(err, Error::NoClock));
    assert_eq!(*warned.borrow(), 1);
}

#[test]
fn scheduled_messages_fire_in_timestamp_order() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.clock_set().unwrap();
    ens.service_new("later").unwrap();
    let (seen, push) = collector();
    ens.method_new("/later/x", Some("i"), false, move |_, _, r| {
        push(r.get_i32()?);
        Ok(())
    })
    .unwrap();
    ens.send("/later/x", 0.30, &[Arg::Int32(3)]).unwrap();
    ens.send("/later/x", 0.10, &[Arg::Int32(1)]).unwrap();
    ens.send("/later/x", 0.20, &[Arg::Int32(2)]).unwrap();
    ens.poll().unwrap();
    assert!(seen.borrow().is_empty());

    tp.set_time(0.15);
    ens.poll().unwrap();
    assert_eq!(seen.borrow().as_slice(), [1]);

    tp.set_time(5.0); // larger than one wheel revolution
    ens.poll().unwrap();
    assert_eq!(seen.borrow().as_slice(), [1, 2, 3]);
}

#[test]
fn global_time_never_regresses_for_reference() {
    let tp = Arc::new(ManualTimeProvider::new(10.0));
    let mut ens = quiet(&tp);
    ens.clock_set().unwrap();
    let mut last = ens.time_get().unwrap();
    for dt in [0.001, 0.5, 0.0, 2.0] {
        tp.advance(dt);
        let now = ens.time_get().unwrap();
        assert!(now >= last);
        last = now;
    }
}

#[test]
fn sends_from_handlers_are_queued_not_reentered() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("chain").unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        ens.method_new("/chain/first", None, false, move |e, _, _| {
            order.borrow_mut().push("first-begin");
            e.send("/chain/second", 0.0, &[])?;
            // the nested send must not have delivered yet
            order.borrow_mut().push("first-end");
            Ok(())
        })
        .unwrap();
    }
    {
        let order = order.clone();
        ens.method_new("/chain/second", None, false, move |_, _, _| {
            order.borrow_mut().push("second");
            Ok(())
        })
        .unwrap();
    }
    ens.send("/chain/first", 0.0, &[]).unwrap();
    ens.poll().unwrap(); // drains the pending queue
    assert_eq!(
        order.borrow().as_slice(),
        ["first-begin", "first-end", "second"]
    );
}

#[test]
fn taps_fan_out_with_rewritten_service() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("publish0").unwrap();
    ens.service_new("subscribe0").unwrap();
    let (seen, push) = collector();
    {
        let push = push.clone();
        ens.method_new("/publish0/i", Some("i"), false, move |_, _, r| {
            push(r.get_i32()?);
            Ok(())
        })
        .unwrap();
    }
    {
        let push = push.clone();
        ens.method_new("/subscribe0/i", Some("i"), false, move |_, _, r| {
            push(r.get_i32()? + 1000);
            Ok(())
        })
        .unwrap();
    }
    ens.tap("publish0", "subscribe0", TapMode::Keep).unwrap();
    ens.send("/publish0/i", 0.0, &[Arg::Int32(42)]).unwrap();
    ens.poll().unwrap();
    let mut hits = seen.borrow().clone();
    hits.sort();
    assert_eq!(hits, [42, 1042]);
}

#[test]
fn service_entry_survives_while_tapped() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("watched").unwrap();
    ens.service_new("watcher").unwrap();
    ens.tap("watched", "watcher", TapMode::Keep).unwrap();
    ens.service_free("watched").unwrap();
    // no provider, but the tap keeps the entry alive
    assert!(ens
        .services_list()
        .iter()
        .any(|s| s.service == "watched" && s.tapper.is_some()));
    ens.untap("watched", "watcher").unwrap();
    assert!(!ens.services_list().iter().any(|s| s.service == "watched"));
}

#[test]
fn status_and_can_send_for_local_services() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("here").unwrap();
    assert_eq!(ens.status("here").unwrap(), Status::LocalNoTime);
    assert_eq!(ens.can_send("here").unwrap(), CanSend::Ready);
    assert!(matches!(
        ens.status("absent").unwrap_err(),
        Error::ServiceNotFound
    ));
    ens.clock_set().unwrap();
    assert_eq!(ens.status("here").unwrap(), Status::Local);
}

#[test]
fn properties_are_listed_and_searchable() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("synth").unwrap();
    ens.set_property("synth", "kind", "fm;weird").unwrap();
    ens.set_property("synth", "rank", "7").unwrap();
    assert_eq!(ens.property("synth", "kind").as_deref(), Some("fm;weird"));
    assert_eq!(ens.property("synth", "rank").as_deref(), Some("7"));
    assert_eq!(ens.search_property("rank", "7"), ["synth"]);
    assert!(ens.search_property("rank", "8").is_empty());
    ens.remove_property("synth", "rank").unwrap();
    assert_eq!(ens.property("synth", "rank"), None);

    let list = ens.services_list();
    let row = list.iter().find(|s| s.service == "synth").unwrap();
    assert_eq!(row.process, ens.process_name());
    assert!(row.properties.contains("kind:"));
}

#[test]
fn injected_messages_are_delivered_by_poll() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("inbox").unwrap();
    let (seen, push) = collector();
    ens.method_new("/inbox/n", Some("i"), false, move |_, _, r| {
        push(r.get_i32()?);
        Ok(())
    })
    .unwrap();

    let injector = ens.injector();
    let t = std::thread::spawn(move || {
        for i in 0..10 {
            let msg = tutti::Msg::build("/inbox/n", 0.0, false, &[Arg::Int32(i)]).unwrap();
            injector.inject(msg);
        }
    });
    t.join().unwrap();
    ens.poll().unwrap();
    assert_eq!(seen.borrow().as_slice(), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
}

#[test]
fn handler_panic_is_contained() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("bad").unwrap();
    ens.method_new("/bad/x", None, false, |_, _, _| panic!("boom"))
        .unwrap();
    let warned = Rc::new(RefCell::new(0usize));
    let w = warned.clone();
    ens.set_drop_warning(move |_, _| *w.borrow_mut() += 1);
    // the panic becomes a drop warning, not a crash
    ens.send("/bad/x", 0.0, &[]).unwrap();
    assert_eq!(*warned.borrow(), 1);
    // the loop keeps working afterwards
    ens.poll().unwrap();
}

#[test]
fn bundles_split_into_individual_deliveries() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("drum").unwrap();
    let (seen, push) = collector();
    ens.method_new("/drum/hit", Some("i"), false, move |_, _, r| {
        push(r.get_i32()?);
        Ok(())
    })
    .unwrap();
    let m1 = tutti::Msg::build("/drum/hit", 0.0, false, &[Arg::Int32(1)]).unwrap();
    let m2 = tutti::Msg::build("/drum/hit", 0.0, false, &[Arg::Int32(2)]).unwrap();
    let mut b = tutti::MsgBuilder::new();
    b.start();
    b.add_message(&m1).unwrap();
    b.add_message(&m2).unwrap();
    let bundle = b.finish_service(0.0, "drum", "", false).unwrap();
    ens.message_send(bundle).unwrap();
    ens.poll().unwrap();
    assert_eq!(seen.borrow().as_slice(), [1, 2]);
}

#[test]
fn builder_api_send() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("mix").unwrap();
    let (seen, push) = collector();
    ens.method_new("/mix/gain", Some("if"), false, move |_, _, r| {
        let ch = r.get_i32()?;
        let _level = r.get_f32()?;
        push(ch);
        Ok(())
    })
    .unwrap();
    let b = ens.send_start();
    b.add_i32(2).unwrap();
    b.add_f32(0.7).unwrap();
    ens.send_finish(0.0, "/mix/gain", false).unwrap();
    assert_eq!(seen.borrow().as_slice(), [2]);
}

#[test]
fn method_free_removes_leaf_and_full_path() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("s").unwrap();
    let (seen, push) = collector();
    ens.method_new("/s/x", None, false, move |_, _, _| {
        push(1);
        Ok(())
    })
    .unwrap();
    ens.send("!s/x", 0.0, &[]).unwrap();
    assert_eq!(seen.borrow().len(), 1);
    ens.method_free("/s/x").unwrap();
    // both the tree leaf and the literal entry are gone
    let warned = Rc::new(RefCell::new(0usize));
    let w = warned.clone();
    ens.set_drop_warning(move |_, _| *w.borrow_mut() += 1);
    ens.send("!s/x", 0.0, &[]).unwrap();
    ens.send("/s/x", 0.0, &[]).unwrap();
    assert_eq!(*warned.borrow(), 2);
    assert!(ens.method_free("/s/x").is_err());
}

#[test]
fn bridge_provider_receives_routed_messages() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    let seen: Rc<RefCell<Vec<(String, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    ens.bridge_new(
        "ether",
        Box::new(move |msg, tcp| {
            sink.borrow_mut().push((msg.address().to_owned(), tcp));
        }),
    )
    .unwrap();
    assert_eq!(ens.status("ether").unwrap(), Status::BridgeNoTime);
    ens.send_cmd("/ether/note", 0.0, &[Arg::Int32(60)]).unwrap();
    ens.send("/ether/off", 0.0, &[]).unwrap();
    assert_eq!(
        seen.borrow().as_slice(),
        [("/ether/note".to_owned(), true), ("/ether/off".to_owned(), false)]
    );
    ens.service_free("ether").unwrap();
    assert!(ens.status("ether").is_err());
}

#[test]
fn service_conflict_and_bad_names() {
    let tp = Arc::new(ManualTimeProvider::new(0.0));
    let mut ens = quiet(&tp);
    ens.service_new("once").unwrap();
    assert!(matches!(
        ens.service_new("once").unwrap_err(),
        Error::ServiceConflict
    ));
    assert!(matches!(
        ens.service_new("no/slash").unwrap_err(),
        Error::BadName
    ));
    assert!(matches!(ens.service_new("").unwrap_err(), Error::BadName));
    assert!(matches!(
        ens.method_new("/ghost/x", None, false, |_, _, _| Ok(())),
        Err(Error::ServiceNotFound)
    ));
}
