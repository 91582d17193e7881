//! Digest convergence, equality modes, and mutation-during-scan behavior.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use quiesce::{CallbackSite, DigestError, MAX_DIGEST_PASSES, Scope, Value, WatchHandle};

#[test]
fn chained_watchers_converge_in_one_digest() {
    let scope = Scope::new();
    scope.set("name", "jane");

    scope.watch(
        |s| Ok(s.get("name")),
        |new, _, s| {
            s.set("upper", new.as_str().unwrap_or("").to_uppercase());
            Ok(())
        },
    );
    scope.watch(
        |s| Ok(s.get("upper")),
        |new, _, s| {
            if let Some(first) = new.as_str().and_then(|u| u.get(..1)) {
                s.set("initial", format!("{first}."));
            }
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert_eq!(scope.get_str("initial").as_deref(), Some("J."));

    scope.set("name", "bob");
    scope.digest().unwrap();
    assert_eq!(scope.get_str("initial").as_deref(), Some("B."));
}

#[test]
fn coupled_watchers_fail_after_exactly_ten_passes() {
    let scope = Scope::new();
    scope.set("a", 0);
    scope.set("b", 0);

    // Each watcher bumps the value the other one reads.
    scope.watch(
        |s| Ok(s.get("a")),
        |_, _, s| {
            let b = s.get_number("b").unwrap_or(0.0);
            s.set("b", b + 1.0);
            Ok(())
        },
    );
    scope.watch(
        |s| Ok(s.get("b")),
        |_, _, s| {
            let a = s.get_number("a").unwrap_or(0.0);
            s.set("a", a + 1.0);
            Ok(())
        },
    );

    match scope.digest() {
        Err(DigestError::Unstable { passes }) => assert_eq!(passes, MAX_DIGEST_PASSES),
        other => panic!("expected a stabilization failure, got {other:?}"),
    }
}

#[test]
fn first_digest_fires_even_for_an_undefined_value() {
    let scope = Scope::new();
    let observed = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&observed);
    scope.watch(
        |s| Ok(s.get("nothing_here")),
        move |new, _, _| {
            *slot.borrow_mut() = Some(new.clone());
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert_eq!(*observed.borrow(), Some(Value::Null));
}

#[test]
fn deep_watch_detects_in_place_mutation() {
    let scope = Scope::new();
    scope.set("items", Value::list([Value::from(1)]));
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    scope.watch_deep(
        |s| Ok(s.get("items")),
        move |_, _, _| {
            counter.set(counter.get() + 1);
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert_eq!(calls.get(), 1);

    // Same container, changed contents, no reassignment.
    scope.get("items").push(Value::from(2));
    scope.digest().unwrap();
    assert_eq!(calls.get(), 2);
}

#[test]
fn deep_watch_old_value_is_the_prior_snapshot() {
    let scope = Scope::new();
    scope.set("items", Value::list([Value::from(1)]));
    let old_len = Rc::new(Cell::new(None));
    let seen = Rc::clone(&old_len);
    scope.watch_deep(
        |s| Ok(s.get("items")),
        move |_, old, _| {
            seen.set(old.len());
            Ok(())
        },
    );

    scope.digest().unwrap();
    scope.get("items").push(Value::from(2));
    scope.digest().unwrap();
    assert_eq!(
        old_len.get(),
        Some(1),
        "old value must be the snapshot taken before the mutation"
    );
}

#[test]
fn identity_watch_ignores_in_place_mutation() {
    let scope = Scope::new();
    scope.set("items", Value::list([Value::from(1)]));
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    scope.watch(
        |s| Ok(s.get("items")),
        move |_, _, _| {
            counter.set(counter.get() + 1);
            Ok(())
        },
    );

    scope.digest().unwrap();
    scope.get("items").push(Value::from(2));
    scope.digest().unwrap();
    assert_eq!(calls.get(), 1, "same container, so nothing changed by identity");

    // Reassignment is a change.
    scope.set("items", Value::list([Value::from(1), Value::from(2)]));
    scope.digest().unwrap();
    assert_eq!(calls.get(), 2);
}

#[test]
fn nan_valued_watch_stays_quiescent() {
    let scope = Scope::new();
    scope.set("number", f64::NAN);
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    scope.watch(
        |s| Ok(s.get("number")),
        move |_, _, _| {
            counter.set(counter.get() + 1);
            Ok(())
        },
    );

    scope.digest().unwrap();
    scope.digest().unwrap();
    assert_eq!(calls.get(), 1, "NaN must compare equal to itself");
}

#[test]
fn watch_registered_by_a_listener_runs_in_the_same_digest() {
    let scope = Scope::new();
    scope.set("a", 1);
    let inner_fired = Rc::new(Cell::new(false));

    let flag = Rc::clone(&inner_fired);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, s| {
            let flag = Rc::clone(&flag);
            s.watch(
                |s| Ok(s.get("a")),
                move |_, _, _| {
                    flag.set(true);
                    Ok(())
                },
            );
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert!(inner_fired.get());
}

#[test]
fn a_watcher_can_deregister_itself_during_a_digest() {
    let scope = Scope::new();
    scope.set("a", 1);
    let log = Rc::new(RefCell::new(Vec::new()));

    let first = Rc::clone(&log);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            first.borrow_mut().push("first");
            Ok(())
        },
    );

    let handle: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
    let own = Rc::clone(&handle);
    let second = Rc::clone(&log);
    let registered = scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            second.borrow_mut().push("second");
            if let Some(h) = own.borrow().as_ref() {
                h.deregister();
            }
            Ok(())
        },
    );
    *handle.borrow_mut() = Some(registered);

    let third = Rc::clone(&log);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            third.borrow_mut().push("third");
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert_eq!(*log.borrow(), ["first", "second", "third"]);

    scope.set("a", 2);
    scope.digest().unwrap();
    assert_eq!(
        *log.borrow(),
        ["first", "second", "third", "first", "third"],
        "the self-removed watcher must not fire again"
    );
}

#[test]
fn a_watcher_can_deregister_another_during_a_digest() {
    let scope = Scope::new();
    scope.set("a", 1);
    let other_fired = Rc::new(Cell::new(0));

    let handle: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
    let target = Rc::clone(&handle);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            if let Some(h) = target.borrow().as_ref() {
                h.deregister();
            }
            Ok(())
        },
    );

    let counter = Rc::clone(&other_fired);
    let registered = scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            counter.set(counter.get() + 1);
            Ok(())
        },
    );
    *handle.borrow_mut() = Some(registered);

    scope.digest().unwrap();
    assert_eq!(other_fired.get(), 0, "deregistered before its first visit");
}

#[test]
fn a_watch_fn_can_deregister_several_watchers_at_once() {
    let scope = Scope::new();
    scope.set("a", 1);

    let handles: Rc<RefCell<Vec<WatchHandle>>> = Rc::new(RefCell::new(Vec::new()));
    let destroyed = Rc::clone(&handles);
    let survivor_fired = Rc::new(Cell::new(false));

    let first = scope.watch(
        move |s| {
            for handle in destroyed.borrow().iter() {
                handle.deregister();
            }
            Ok(s.get("a"))
        },
        |_, _, _| Ok(()),
    );
    let second = scope.watch(|s| Ok(s.get("a")), |_, _, _| Ok(()));
    handles.borrow_mut().push(first);
    handles.borrow_mut().push(second);

    let flag = Rc::clone(&survivor_fired);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            flag.set(true);
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert!(survivor_fired.get(), "untouched watchers still run");
}

#[test]
fn listener_errors_are_reported_and_contained() {
    let scope = Scope::new();
    scope.set("a", 1);
    let sites = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&sites);
    scope.set_error_sink(move |site, _| sink.borrow_mut().push(site));

    scope.watch(|s| Ok(s.get("a")), |_, _, _| Err("listener broke".into()));
    let healthy = Rc::new(Cell::new(false));
    let flag = Rc::clone(&healthy);
    scope.watch(
        |s| Ok(s.get("a")),
        move |_, _, _| {
            flag.set(true);
            Ok(())
        },
    );

    scope.digest().unwrap();
    assert!(healthy.get());
    assert!(sites.borrow().contains(&CallbackSite::Listener));
}

#[test]
fn digest_from_a_watch_fn_is_a_phase_conflict() {
    let scope = Scope::new();
    scope.set("a", 1);
    let conflicted = Rc::new(Cell::new(false));
    let flag = Rc::clone(&conflicted);
    scope.watch(
        move |s| {
            if s.digest().is_err() {
                flag.set(true);
            }
            Ok(s.get("a"))
        },
        |_, _, _| Ok(()),
    );

    scope.digest().unwrap();
    assert!(conflicted.get());
}
