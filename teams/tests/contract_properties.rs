//! Property tests over the breaking-change detector.

use ensemble_core::model::{ContractField, ContractSpec};
use ensemble_teams::contracts::diff_specs;
use proptest::prelude::*;

fn field_strategy() -> impl Strategy<Value = ContractField> {
    (
        "[a-z]{1,8}",
        prop_oneof![
            Just("string".to_string()),
            Just("number".to_string()),
            Just("object".to_string())
        ],
        proptest::bool::ANY,
    )
        .prop_map(|(name, field_type, required)| ContractField {
            name,
            field_type,
            required,
        })
}

fn spec_strategy() -> impl Strategy<Value = ContractSpec> {
    proptest::collection::vec(field_strategy(), 0..8).prop_map(|mut fields| {
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        fields.dedup_by(|a, b| a.name == b.name);
        ContractSpec {
            fields,
            endpoints: Vec::new(),
            models: Vec::new(),
        }
    })
}

proptest! {
    #[test]
    fn identical_specs_never_break(spec in spec_strategy()) {
        let changes = diff_specs(&spec, &spec.clone());
        prop_assert!(changes.is_empty());
        prop_assert!(!changes.is_breaking());
    }

    #[test]
    fn removing_any_field_is_breaking(spec in spec_strategy(), index in 0usize..8) {
        prop_assume!(!spec.fields.is_empty());
        let index = index % spec.fields.len();
        let mut reduced = spec.clone();
        let removed = reduced.fields.remove(index);
        let changes = diff_specs(&spec, &reduced);
        prop_assert!(changes.removed_fields.contains(&removed.name));
        prop_assert!(changes.is_breaking());
    }

    #[test]
    fn changing_any_field_type_is_breaking(spec in spec_strategy(), index in 0usize..8) {
        prop_assume!(!spec.fields.is_empty());
        let index = index % spec.fields.len();
        let mut mutated = spec.clone();
        mutated.fields[index].field_type = format!("{}_v2", mutated.fields[index].field_type);
        let changes = diff_specs(&spec, &mutated);
        prop_assert!(changes.typechanged_fields.contains(&mutated.fields[index].name));
        prop_assert!(changes.is_breaking());
    }

    #[test]
    fn adding_a_required_field_is_breaking(spec in spec_strategy(), name in "[a-z]{9,12}") {
        let mut extended = spec.clone();
        extended.fields.push(ContractField {
            name: name.clone(),
            field_type: "string".into(),
            required: true,
        });
        let changes = diff_specs(&spec, &extended);
        prop_assert!(changes.new_required_params.contains(&name));
        prop_assert!(changes.is_breaking());
    }

    #[test]
    fn adding_an_optional_field_alone_never_breaks(spec in spec_strategy(), name in "[a-z]{9,12}") {
        let mut extended = spec.clone();
        extended.fields.push(ContractField {
            name,
            field_type: "string".into(),
            required: false,
        });
        let changes = diff_specs(&spec, &extended);
        prop_assert!(!changes.is_breaking());
    }
}
