mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use common::{ready, sim_host};
use crossbeam::channel;
use pdhost_core::engine::EngineCall;
use pdhost_core::{Atom, HostError, Message, Payload};

#[test]
fn send_to_released_instance_never_reaches_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    host.release(0).unwrap();
    engine.clear_calls();

    let router = host.router();
    for message in [
        Message::Bang,
        Message::Float(1.0),
        Message::Symbol("on".into()),
        Message::List(vec![Atom::Float(1.0)]),
        Message::typed("set", vec![]),
    ] {
        assert!(matches!(
            router.send(0, "pitch", message),
            Err(HostError::InvalidInstance(0))
        ));
    }
    assert!(matches!(router.send_note_on(0, 0, 60), Err(HostError::InvalidInstance(0))));
    assert!(engine.calls().is_empty());
}

#[test]
fn send_to_uninitialized_instance_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    let gate = engine.hold_init();
    let pending = host.create(0, 44100).unwrap();

    assert!(matches!(
        host.router().send_float(0, "pitch", 1.0),
        Err(HostError::InvalidInstance(0))
    ));

    drop(gate);
    pending.wait().unwrap();
    host.router().send_float(0, "pitch", 1.0).unwrap();
}

#[test]
fn rejected_destination_leaves_instance_usable() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    engine.reject_destination("nowhere");

    let err = host.router().send_bang(0, "nowhere").unwrap_err();
    assert!(matches!(
        err,
        HostError::UnknownDestination { instance: 0, ref destination } if destination == "nowhere"
    ));
    host.router().send_bang(0, "pitch").unwrap();
}

#[test]
fn typed_messages_reach_engine_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 1);
    engine.clear_calls();

    let router = host.router();
    router.send_list(1, "pair", vec![1.0f32.into(), "x".into()]).unwrap();
    router
        .send(1, "synth", Message::typed("set", vec![Atom::Float(2.0)]))
        .unwrap();
    router.send_note_on(1, 0, 64).unwrap();

    assert_eq!(
        engine.calls(),
        vec![
            EngineCall::SendList {
                instance: 1,
                dest: "pair".into(),
                atoms: vec![Atom::Float(1.0), Atom::Symbol("x".into())],
            },
            EngineCall::SendMessage {
                instance: 1,
                dest: "synth".into(),
                selector: "set".into(),
                atoms: vec![Atom::Float(2.0)],
            },
            EngineCall::SendNoteOn {
                instance: 1,
                channel: 0,
                pitch: 64
            },
        ]
    );
}

#[test]
fn subscribing_twice_keeps_one_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    engine.clear_calls();

    let router = host.router();
    router.subscribe(0, "frequency").unwrap();
    router.subscribe(0, "frequency").unwrap();
    let _rx = router.listen(0, "frequency").unwrap();

    assert_eq!(router.subscriptions(0).unwrap(), vec!["frequency"]);
    assert_eq!(engine.subscriptions(0), vec!["frequency"]);
    assert_eq!(
        engine.calls(),
        vec![EngineCall::Subscribe {
            instance: 0,
            source: "frequency".into()
        }]
    );
}

#[test]
fn unsubscribing_unknown_source_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    engine.clear_calls();

    host.router().unsubscribe(0, "never").unwrap();
    assert!(engine.calls().is_empty());

    host.router().subscribe(0, "frequency").unwrap();
    host.router().unsubscribe(0, "frequency").unwrap();
    host.router().unsubscribe(0, "frequency").unwrap();
    assert!(host.router().subscriptions(0).unwrap().is_empty());
    assert!(engine.subscriptions(0).is_empty());
}

#[test]
fn inbound_messages_are_scoped_to_their_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    ready(&host, 1);
    engine.loopback("inputGain", "frequency");

    let router = host.router();
    let rx0 = router.listen(0, "frequency").unwrap();
    let rx1 = router.listen(1, "frequency").unwrap();

    router.send_float(0, "inputGain", 220.0).unwrap();
    router.send_float(1, "inputGain", 880.0).unwrap();
    router.poll(0).unwrap();
    router.poll(1).unwrap();

    let msg = rx0.try_recv().unwrap();
    assert_eq!((msg.instance, msg.payload), (0, Payload::Float(220.0)));
    assert!(rx0.try_recv().is_err());
    assert_eq!(rx1.try_recv().unwrap().payload, Payload::Float(880.0));

    assert_eq!(router.latest_float(0, "frequency").unwrap(), Some(220.0));
    assert_eq!(router.latest_float(1, "frequency").unwrap(), Some(880.0));
}

#[test]
fn inbound_kinds_reach_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    host.router()
        .on_message(0, "state", move |msg| sink.lock().unwrap().push(msg.payload.clone()))
        .unwrap();

    assert!(engine.emit_bang(0, "state"));
    assert!(engine.emit_float(0, "state", 1.5));
    assert!(engine.emit_symbol(0, "state", "ready"));
    assert!(engine.emit(0, "state", Payload::List(vec![Atom::Float(1.0)])));
    host.router().poll(0).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Payload::Bang,
            Payload::Float(1.5),
            Payload::Symbol("ready".into()),
            Payload::List(vec![Atom::Float(1.0)]),
        ]
    );
    assert_eq!(
        host.router().latest(0, "state").unwrap(),
        Some(Payload::List(vec![Atom::Float(1.0)]))
    );
}

#[test]
fn removed_listener_stops_receiving() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let router = host.router();
    let id = router
        .on_message(0, "tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let dropped_rx = router.listen(0, "tick").unwrap();
    drop(dropped_rx);

    engine.emit_bang(0, "tick");
    router.poll(0).unwrap();
    assert!(router.remove_listener(0, id).unwrap());

    engine.emit_bang(0, "tick");
    router.poll(0).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // Subscription itself survives its listeners
    assert_eq!(router.subscriptions(0).unwrap(), vec!["tick"]);
}

#[test]
fn callback_may_send_back_into_its_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let router = host.router().clone();
    host.router()
        .on_message(0, "frequency", move |msg| {
            if let Some(hz) = msg.payload.as_float() {
                router.send_float(msg.instance, "osc", hz * 2.0).unwrap();
            }
        })
        .unwrap();

    engine.emit_float(0, "frequency", 110.0);
    host.router().poll(0).unwrap();
    assert!(engine.calls().contains(&EngineCall::SendFloat {
        instance: 0,
        dest: "osc".into(),
        value: 220.0
    }));
}

#[test]
fn release_from_own_callback_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let outcome = Arc::new(Mutex::new(None));
    let record = outcome.clone();
    let inner = host.clone();
    host.router()
        .on_message(0, "done", move |msg| {
            *record.lock().unwrap() = Some(inner.release(msg.instance));
        })
        .unwrap();

    engine.emit_bang(0, "done");
    host.router().poll(0).unwrap();

    assert!(matches!(
        outcome.lock().unwrap().take(),
        Some(Err(HostError::ReentrantRelease(0)))
    ));
    host.release(0).unwrap();
}

#[test]
fn release_of_other_instance_from_callback_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    ready(&host, 1);

    let outcome = Arc::new(Mutex::new(None));
    let record = outcome.clone();
    let inner = host.clone();
    host.router()
        .on_message(0, "done", move |_| {
            *record.lock().unwrap() = Some(inner.release(1));
        })
        .unwrap();

    engine.emit_bang(0, "done");
    host.router().poll(0).unwrap();

    assert!(matches!(
        outcome.lock().unwrap().take(),
        Some(Err(HostError::ReentrantRelease(1)))
    ));
    host.router().send_bang(1, "go").unwrap();
}

#[test]
fn crossed_releases_from_callbacks_do_not_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);
    ready(&host, 1);

    let both_inside = Arc::new(Barrier::new(2));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for (instance, other) in [(0, 1), (1, 0)] {
        let barrier = both_inside.clone();
        let record = outcomes.clone();
        let inner = host.clone();
        host.router()
            .on_message(instance, "done", move |_| {
                barrier.wait();
                record.lock().unwrap().push(inner.release(other));
            })
            .unwrap();
        engine.emit_bang(instance, "done");
    }

    let (done_tx, done_rx) = channel::unbounded();
    let pollers: Vec<_> = [0, 1]
        .into_iter()
        .map(|instance| {
            let router = host.router().clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                router.poll(instance).unwrap();
                done.send(instance).unwrap();
            })
        })
        .collect();

    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("releases from callbacks deadlocked");
    }
    for poller in pollers {
        poller.join().unwrap();
    }

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|r| matches!(r, Err(HostError::ReentrantRelease(_)))));

    // Outside of callbacks both can be released
    host.release(0).unwrap();
    host.release(1).unwrap();
}

#[test]
fn release_waits_for_running_callback_and_drops_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, host) = sim_host(dir.path());
    ready(&host, 0);

    let (entered_tx, entered_rx) = channel::bounded(1);
    let (proceed_tx, proceed_rx) = channel::bounded::<()>(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    host.router()
        .on_message(0, "frequency", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.try_send(());
            let _ = proceed_rx.recv();
        })
        .unwrap();

    engine.emit_float(0, "frequency", 1.0);
    engine.emit_float(0, "frequency", 2.0);

    let router = host.router().clone();
    let poller = thread::spawn(move || router.poll(0));
    entered_rx.recv().unwrap();

    let releasing = host.clone();
    let releaser = thread::spawn(move || releasing.release(0));
    thread::sleep(Duration::from_millis(50));
    assert!(!releaser.is_finished());

    drop(proceed_tx);
    releaser.join().unwrap().unwrap();
    poller.join().unwrap().unwrap();

    // The second message arrived after release began
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.state(0), None);
}
