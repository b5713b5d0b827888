use proptest::prelude::*;

use tg_columnar::Column;
use tg_query::{apply_filter, FilterOp, FilterSpec, FilterValue};
use tg_store::Dataset;
use tg_types::{DType, Scalar};

fn fare_column() -> impl Strategy<Value = Vec<Option<i64>>> {
    prop::collection::vec(prop::option::of(-100_i64..100), 0..64)
}

fn dataset_from(values: &[Option<i64>]) -> Dataset {
    let scalars: Vec<Scalar> = values
        .iter()
        .map(|v| v.map_or(Scalar::Null, Scalar::Int64))
        .collect();
    let column = Column::new(DType::Int64, scalars).expect("column");
    Dataset::from_columns(vec![("fare".into(), column)]).expect("dataset")
}

fn spec(op: FilterOp, value: FilterValue, value2: Option<Scalar>, limit: Option<usize>) -> FilterSpec {
    FilterSpec {
        column: "fare".into(),
        op,
        value,
        value2,
        limit,
    }
}

proptest! {
    /// Returned positions are always a prefix of the full match set, and
    /// total_matches never undercounts.
    #[test]
    fn limited_results_are_a_prefix_of_all_matches(
        values in fare_column(),
        probe in -100_i64..100,
        limit in 0_usize..16,
    ) {
        let dataset = dataset_from(&values);
        let unlimited = apply_filter(
            &dataset,
            &spec(FilterOp::Gte, FilterValue::One(Scalar::Int64(probe)), None, Some(usize::MAX)),
        ).expect("unlimited");
        let limited = apply_filter(
            &dataset,
            &spec(FilterOp::Gte, FilterValue::One(Scalar::Int64(probe)), None, Some(limit)),
        ).expect("limited");

        prop_assert_eq!(limited.total_matches, unlimited.total_matches);
        prop_assert_eq!(limited.total_matches, unlimited.positions.len());
        prop_assert!(limited.positions.len() <= limit);
        prop_assert_eq!(
            &limited.positions[..],
            &unlimited.positions[..limited.positions.len()]
        );
    }

    /// between(a, b) selects exactly the rows gte(a) and lte(b) both select.
    #[test]
    fn between_equals_gte_and_lte(
        values in fare_column(),
        a in -100_i64..100,
        b in -100_i64..100,
    ) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let dataset = dataset_from(&values);

        let between = apply_filter(
            &dataset,
            &spec(
                FilterOp::Between,
                FilterValue::One(Scalar::Int64(low)),
                Some(Scalar::Int64(high)),
                Some(usize::MAX),
            ),
        ).expect("between");
        let gte = apply_filter(
            &dataset,
            &spec(FilterOp::Gte, FilterValue::One(Scalar::Int64(low)), None, Some(usize::MAX)),
        ).expect("gte");
        let lte = apply_filter(
            &dataset,
            &spec(FilterOp::Lte, FilterValue::One(Scalar::Int64(high)), None, Some(usize::MAX)),
        ).expect("lte");

        let conjunction: Vec<usize> = gte
            .positions
            .iter()
            .copied()
            .filter(|idx| lte.positions.contains(idx))
            .collect();
        prop_assert_eq!(between.positions, conjunction);
    }

    /// Membership is a set test: reordering (or duplicating) the probe
    /// values cannot change which rows match.
    #[test]
    fn in_is_invariant_under_probe_reordering(
        values in fare_column(),
        probes in prop::collection::vec(-100_i64..100, 1..8),
    ) {
        let dataset = dataset_from(&values);
        let forward: Vec<Scalar> = probes.iter().copied().map(Scalar::Int64).collect();
        let mut shuffled = forward.clone();
        shuffled.reverse();
        shuffled.push(forward[0].clone());

        let base = apply_filter(
            &dataset,
            &spec(FilterOp::In, FilterValue::Many(forward), None, Some(usize::MAX)),
        ).expect("in");
        let reordered = apply_filter(
            &dataset,
            &spec(FilterOp::In, FilterValue::Many(shuffled), None, Some(usize::MAX)),
        ).expect("in reordered");

        prop_assert_eq!(base.positions, reordered.positions);
        prop_assert_eq!(base.total_matches, reordered.total_matches);
    }

    /// Null rows never appear in any operator's match set.
    #[test]
    fn nulls_never_match(
        values in fare_column(),
        probe in -100_i64..100,
    ) {
        let dataset = dataset_from(&values);
        for op in [FilterOp::Eq, FilterOp::Gt, FilterOp::Lt, FilterOp::Gte, FilterOp::Lte] {
            let result = apply_filter(
                &dataset,
                &spec(op, FilterValue::One(Scalar::Int64(probe)), None, Some(usize::MAX)),
            ).expect("filter");
            for idx in &result.positions {
                prop_assert!(values[*idx].is_some());
            }
        }
    }
}
