//! End-to-end behavior of `Engine`: record sharing/separation, structural
//! comparison with cycle detection, and the tentative-allocation safety net.

use wick_core::{Config, ErrNum, Val};
use wick_runtime::Engine;

fn engine() -> Engine {
    Engine::new(Config::default())
}

#[test]
fn record_def_then_get_roundtrips() {
    let mut e = engine();
    let rec = e.alloc_record().commit();
    e.record_def(rec, Val::Int(1), Val::Int(42)).unwrap();
    assert_eq!(e.record_get(rec, &Val::Int(1)).unwrap(), Val::Int(42));
}

#[test]
fn set_before_def_fails() {
    let mut e = engine();
    let rec = e.alloc_record().commit();
    let err = e.record_set(rec, Val::Int(1), Val::Int(42)).unwrap_err();
    assert_eq!(err.num, ErrNum::SetUndefined);
}

#[test]
fn def_to_udf_fails() {
    let mut e = engine();
    let rec = e.alloc_record().commit();
    let err = e.record_def(rec, Val::Int(1), Val::Udf).unwrap_err();
    assert_eq!(err.num, ErrNum::SetToUdf);
}

#[test]
fn sharing_a_record_then_defining_on_either_side_separates() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    e.record_def(a, Val::Int(1), Val::Int(10)).unwrap();

    let b = e.alloc_record_sharing(a).unwrap().commit();
    assert_eq!(e.record_get(b, &Val::Int(1)).unwrap(), Val::Int(10));

    // defining a new field on `b` must not leak into `a`'s schema.
    e.record_def(b, Val::Int(2), Val::Int(99)).unwrap();
    assert_eq!(e.record_get(a, &Val::Int(2)).unwrap(), Val::Udf);
    assert_eq!(e.record_get(b, &Val::Int(2)).unwrap(), Val::Int(99));

    // `a` keeps working independently after `b` separated away from it.
    e.record_def(a, Val::Int(3), Val::Int(7)).unwrap();
    assert_eq!(e.record_get(b, &Val::Int(3)).unwrap(), Val::Udf);
    assert_eq!(e.record_get(a, &Val::Int(3)).unwrap(), Val::Int(7));
}

#[test]
fn equal_records_with_different_field_order_compare_equal() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    e.record_def(a, Val::Int(1), Val::Int(1)).unwrap();
    e.record_def(a, Val::Int(2), Val::Int(2)).unwrap();

    let b = e.alloc_record().commit();
    e.record_def(b, Val::Int(2), Val::Int(2)).unwrap();
    e.record_def(b, Val::Int(1), Val::Int(1)).unwrap();

    assert!(e.val_equal(Val::Obj(a), Val::Obj(b)).unwrap());
}

#[test]
fn records_with_extra_field_are_not_equal() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    e.record_def(a, Val::Int(1), Val::Int(1)).unwrap();

    let b = e.alloc_record().commit();
    e.record_def(b, Val::Int(1), Val::Int(1)).unwrap();
    e.record_def(b, Val::Int(2), Val::Int(2)).unwrap();

    assert!(!e.val_equal(Val::Obj(a), Val::Obj(b)).unwrap());
}

#[test]
fn direct_mutual_cycle_is_rejected_as_cyclic() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    let b = e.alloc_record().commit();
    // a.1 = b, b.1 = a: comparing a's and b's *distinct* field sets to each
    // other (not a to itself) must walk into the cycle and bail out.
    e.record_def(a, Val::Int(1), Val::Obj(b)).unwrap();
    e.record_def(b, Val::Int(1), Val::Obj(a)).unwrap();

    let c = e.alloc_record().commit();
    let d = e.alloc_record().commit();
    e.record_def(c, Val::Int(1), Val::Obj(d)).unwrap();
    e.record_def(d, Val::Int(1), Val::Obj(c)).unwrap();

    let err = e.val_equal(Val::Obj(a), Val::Obj(c)).unwrap_err();
    assert_eq!(err.num, ErrNum::CyclicRecord);
}

#[test]
fn identical_record_handle_is_equal_without_walking_fields() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    assert!(e.val_equal(Val::Obj(a), Val::Obj(a)).unwrap());
}

#[test]
fn less_or_equal_is_reflexive_and_respects_missing_fields() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    e.record_def(a, Val::Int(1), Val::Int(1)).unwrap();

    let b = e.alloc_record().commit();
    e.record_def(b, Val::Int(1), Val::Int(2)).unwrap();
    e.record_def(b, Val::Int(2), Val::Int(99)).unwrap();

    assert!(e.val_less_or_equal(Val::Obj(a), Val::Obj(b)).unwrap());
    assert!(!e.val_less_or_equal(Val::Obj(b), Val::Obj(a)).unwrap());
}

#[test]
fn uncommitted_anchor_does_not_leak_a_permanent_slot() {
    let mut e = engine();
    {
        let _anchor = e.alloc_record();
        // dropped without commit
    }
    e.reclaim_cancellations();
    // A fresh record should reuse the reclaimed slot rather than growing
    // the heap indefinitely; this is a smoke check, not an exact-slot
    // assertion, since slot numbering is an implementation detail.
    let rec = e.alloc_record().commit();
    e.record_def(rec, Val::Int(0), Val::Int(1)).unwrap();
    assert_eq!(e.record_get(rec, &Val::Int(0)).unwrap(), Val::Int(1));
}

#[test]
fn separation_after_sharer_is_cancelled_still_leaves_original_intact() {
    let mut e = engine();
    let a = e.alloc_record().commit();
    e.record_def(a, Val::Int(1), Val::Int(10)).unwrap();
    {
        let _sharer = e.alloc_record_sharing(a).unwrap();
        // dropped uncommitted: the sharer never got a chance to separate.
    }
    e.reclaim_cancellations();
    // `a` must still read back correctly and accept further definitions,
    // unaffected by its would-be sharer's cancelled allocation.
    e.record_def(a, Val::Int(2), Val::Int(20)).unwrap();
    assert_eq!(e.record_get(a, &Val::Int(1)).unwrap(), Val::Int(10));
    assert_eq!(e.record_get(a, &Val::Int(2)).unwrap(), Val::Int(20));
}
