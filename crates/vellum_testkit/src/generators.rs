//! Property-based test generators.

use proptest::prelude::*;
use vellum_mapper::Value;

/// Legal node names: non-empty, no path separators.
pub fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,15}"
}

/// Arbitrary scalar values as stored in simple fragments.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Long),
        "[ -~]{0,32}".prop_map(Value::String),
        (-1_000_000_000i64..1_000_000_000).prop_map(Value::Timestamp),
    ]
}

/// Tree shapes of up to `max_nodes` nodes.
///
/// Element `i` of the result is the parent index of node `i + 1`; it is
/// always `<= i`, so node 0 is the root and every node's parent
/// precedes it. Useful to build small hierarchies and test recursive
/// operations (removal, orphan detection) over arbitrary shapes.
pub fn tree_shape(max_nodes: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(any::<prop::sample::Index>(), 0..max_nodes).prop_map(|parents| {
        parents
            .into_iter()
            .enumerate()
            .map(|(i, index)| index.index(i + 1))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn names_are_legal(name in name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('/'));
        }

        #[test]
        fn tree_shapes_are_well_formed(shape in tree_shape(12)) {
            for (i, parent) in shape.iter().enumerate() {
                // the parent of node i+1 must precede it
                prop_assert!(*parent <= i);
            }
        }
    }
}
