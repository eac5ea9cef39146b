//! Property-based fuzz coverage for the string pool and the index, per the
//! round-trip and insert/lookup volume requirements of the public API.

use proptest::prelude::*;

use wick_core::{Config, Val};
use wick_runtime::StringPool;
use wick_runtime::Index;

fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn string_round_trips_through_the_pool(bytes in arb_bytes()) {
        let mut pool = StringPool::new();
        let handle = pool.make(&bytes);
        let loan = pool.borrow(&handle);
        let read_back: Vec<u8> = match &loan {
            wick_runtime::Loan::Owned(v) => v.clone(),
            wick_runtime::Loan::Pooled { .. } => pool.bytes(&handle).to_vec(),
        };
        prop_assert_eq!(read_back, bytes);
        pool.return_loan(loan);
    }

    #[test]
    fn equal_content_strings_compare_equal(bytes in arb_bytes()) {
        let mut pool = StringPool::new();
        let a = pool.make(&bytes);
        let b = pool.make(&bytes);
        prop_assert!(pool.equal(&a, &b));
    }
}

#[test]
fn ten_thousand_integer_keys_round_trip_through_the_index() {
    let config = Config::default();
    let strings = StringPool::new();
    let mut idx = Index::new(&config);
    let mut assigned = Vec::with_capacity(10_000);
    for i in 0..10_000i32 {
        assigned.push(idx.insert(Val::Int(i), &strings).unwrap());
    }
    for i in 0..10_000i32 {
        assert_eq!(idx.lookup(&Val::Int(i), &strings).unwrap(), Some(assigned[i as usize]));
    }
    // every assigned slot must be unique: two distinct keys never collide
    // onto the same slot number.
    let mut sorted = assigned.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), assigned.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn index_lookup_matches_insertion_order_for_random_int_keys(
        keys in proptest::collection::hash_set(any::<i32>(), 1..500)
    ) {
        let config = Config::default();
        let strings = StringPool::new();
        let mut idx = Index::new(&config);
        let keys: Vec<i32> = keys.into_iter().collect();
        let mut slots = Vec::with_capacity(keys.len());
        for &k in &keys {
            slots.push(idx.insert(Val::Int(k), &strings).unwrap());
        }
        for (k, &slot) in keys.iter().zip(slots.iter()) {
            prop_assert_eq!(idx.lookup(&Val::Int(*k), &strings).unwrap(), Some(slot));
        }
    }
}
