//! Property-based testing utilities using proptest.
//!
//! Strategies generate configurations that pass
//! [`EventJoinConfig::validate`](gather_core::EventJoinConfig::validate).

use chrono::{DateTime, Duration, TimeZone, Utc};
use gather_core::{EventId, EventJoinConfig, JoinMode};
use proptest::prelude::*;

/// Start instant shared by generated configurations
#[must_use]
pub fn base_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Any join mode
pub fn arb_join_mode() -> impl Strategy<Value = JoinMode> {
    prop_oneof![
        Just(JoinMode::Open),
        Just(JoinMode::Request),
        Just(JoinMode::InviteOnly),
    ]
}

/// Valid configurations: end after start, cutoff strictly before opening, offsets in
/// minutes up to two weeks.
pub fn arb_config() -> impl Strategy<Value = EventJoinConfig> {
    (
        1i64..=10_080,
        proptest::option::of(0i64..=20_160),
        proptest::option::of(0i64..=20_160),
        any::<bool>(),
        proptest::option::of(0i64..=20_160),
        arb_join_mode(),
        proptest::option::of(1u32..=500),
    )
        .prop_map(
            |(length, opens, cutoff, late, late_cutoff, mode, max)| {
                let start = base_start();
                let mut config = EventJoinConfig::new(
                    EventId::new(),
                    start,
                    start + Duration::minutes(length),
                    mode,
                    max,
                );
                config.join_cutoff_offset = cutoff.map(Duration::minutes);
                // Opening must precede the cutoff
                config.join_opens_offset = match (opens, cutoff) {
                    (Some(opens), Some(cutoff)) => {
                        Some(Duration::minutes(opens.max(cutoff + 1)))
                    }
                    (opens, _) => opens.map(Duration::minutes),
                };
                config.allow_join_late = late;
                config.late_join_cutoff_offset = late_cutoff.map(Duration::minutes);
                config
            },
        )
}

/// Instants spread around a configuration's window, in seconds from
/// [`base_start`], as a sorted list.
pub fn arb_sorted_offsets(len: usize) -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(-2_000_000i64..=1_000_000, len).prop_map(|mut offsets| {
        offsets.sort_unstable();
        offsets
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_configs_are_valid(config in arb_config()) {
            prop_assert!(config.validate().is_ok());
        }
    }
}
