//! Property tests for the optimistic local view.

use docsync_model::{DocumentKey, Mutation, ObjectValue};
use docsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn expected_contents(mutations: &[Mutation]) -> BTreeMap<DocumentKey, Option<ObjectValue>> {
    let mut contents = BTreeMap::new();
    for mutation in mutations {
        let value = match mutation {
            Mutation::Set { value, .. } => Some(value.clone()),
            _ => None,
        };
        contents.insert(mutation.key().clone(), value);
    }
    contents
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn listeners_see_the_last_write_to_each_document(
        mutations in prop::collection::vec(mutation_strategy("rooms"), 1..8)
    ) {
        let mut h = SyncHarness::new();
        h.engine.disable_network().unwrap();
        let mut latest = h.listen(query("rooms"));
        for mutation in &mutations {
            let _completion = h.write(vec![mutation.clone()]);
            if let Some(snapshot) = h.last_snapshot() {
                latest = snapshot;
            }
        }

        for (key, value) in expected_contents(&mutations) {
            match value {
                Some(value) => {
                    let doc = latest.docs.get(&key);
                    prop_assert!(doc.is_some(), "missing {}", key);
                    prop_assert_eq!(doc.unwrap().data(), &value);
                    prop_assert!(latest.mutated_keys.contains(&key));
                }
                None => prop_assert!(!latest.docs.contains(&key)),
            }
        }
    }
}
