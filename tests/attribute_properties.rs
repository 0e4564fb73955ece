//! Property tests for attribute assignment and notification.

use daq_model::Attribute;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #[test]
    fn get_returns_last_valid_value(writes in prop::collection::vec(-5i32..15, 0..40)) {
        let attribute = Attribute::builder("gain", 0).range(0, 10).build();
        let mut expected = 0;
        for value in writes {
            let accepted = attribute.set(value).is_ok();
            prop_assert_eq!(accepted, (0..=10).contains(&value));
            if accepted {
                expected = value;
            }
            prop_assert_eq!(attribute.get(), expected);
        }
    }

    #[test]
    fn one_notification_per_effective_change(writes in prop::collection::vec(0u32..4, 0..40)) {
        let attribute = Attribute::builder("binning", 0_u32).build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = attribute.subscribe(move |v: &u32| sink.lock().push(*v), true);

        let mut expected = vec![0];
        for value in writes {
            attribute.set(value).unwrap();
            if expected.last() != Some(&value) {
                expected.push(value);
            }
        }
        prop_assert_eq!(seen.lock().clone(), expected);
    }

    #[test]
    fn choices_reject_everything_else(value in 0u32..20) {
        let attribute = Attribute::builder("binning", 1_u32).choices(vec![1, 2, 4, 8]).build();
        let result = attribute.set(value);
        prop_assert_eq!(result.is_ok(), [1, 2, 4, 8].contains(&value));
        let expected = if result.is_ok() { value } else { 1 };
        prop_assert_eq!(attribute.get(), expected);
    }
}
