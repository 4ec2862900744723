use protocol::StepEvent;

/// Sum of `usage_for_step` over `steps`; missing values count as zero.
///
/// Works on any prefix of a run's history, so it doubles as the
/// usage-so-far counter for progress and timeout messages.
pub fn total_usage<'a, I>(steps: I) -> u64
where
    I: IntoIterator<Item = &'a StepEvent>,
{
    steps
        .into_iter()
        .map(|step| step.usage_for_step.unwrap_or(0))
        .fold(0, u64::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::step;

    #[test]
    fn sums_usage_and_skips_missing() {
        let steps = vec![step(1, Some(10)), step(2, None), step(3, Some(5))];
        assert_eq!(total_usage(&steps), 15);
    }

    #[test]
    fn empty_history_is_zero() {
        let steps: Vec<StepEvent> = Vec::new();
        assert_eq!(total_usage(&steps), 0);
    }

    #[test]
    fn prefix_sums_are_monotonic() {
        let steps = vec![step(1, Some(3)), step(2, Some(4)), step(3, None), step(4, Some(1))];
        let prefixes: Vec<u64> = (0..=steps.len())
            .map(|end| total_usage(&steps[..end]))
            .collect();
        assert_eq!(prefixes, vec![0, 3, 7, 7, 8]);
    }

    #[test]
    fn order_does_not_matter() {
        let forward = vec![step(1, Some(2)), step(2, Some(9)), step(3, Some(4))];
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(total_usage(&forward), total_usage(&reversed));
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let steps = vec![step(1, Some(u64::MAX)), step(2, Some(1))];
        assert_eq!(total_usage(&steps), u64::MAX);
    }
}
