//! Property-based tests for the backoff schedule
//!
//! - The delay after failure k is min(initial * factor^(k-1), max)
//! - Delays never decrease and never exceed the cap
//! - A retried operation observes exactly that schedule before exhaustion

use super::*;
use proptest::prelude::*;

fn expected_delay(initial_ms: u64, factor: u64, max_ms: u64, attempt: u32) -> Duration {
    let mut ms = u128::from(initial_ms);
    for _ in 1..attempt {
        ms = ms.saturating_mul(u128::from(factor));
        if ms >= u128::from(max_ms) {
            break;
        }
    }
    Duration::from_millis(u64::try_from(ms.min(u128::from(max_ms))).unwrap_or(max_ms))
}

#[allow(clippy::cast_precision_loss)]
fn options(initial_ms: u64, factor: u64, max_ms: u64, max_retries: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        backoff_factor: factor as f64,
        timeout: Duration::from_secs(1),
        ..RetryOptions::default()
    }
}

proptest! {
    #[test]
    fn delay_matches_capped_exponential(
        initial_ms in 1u64..5_000,
        factor in 1u64..5,
        max_ms in 1u64..600_000,
        attempt in 1u32..40,
    ) {
        let opts = options(initial_ms, factor, max_ms, 3);
        prop_assert_eq!(
            opts.delay_for_attempt(attempt),
            expected_delay(initial_ms, factor, max_ms, attempt)
        );
    }

    #[test]
    fn delays_are_monotonic_and_capped(
        initial_ms in 1u64..5_000,
        factor in 1u64..5,
        max_ms in 1u64..600_000,
    ) {
        let opts = options(initial_ms, factor, max_ms, 3);
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = opts.delay_for_attempt(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= opts.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn observed_schedule_matches_formula(
        initial_ms in 1u64..2_000,
        factor in 1u64..4,
        max_ms in 1u64..20_000,
        max_retries in 1u32..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&observed);
        let opts = options(initial_ms, factor, max_ms, max_retries)
            .with_on_retry(move |a| recorded.lock().unwrap().push((a.attempt, a.next_delay)));

        let result: Result<(), RetryError> = runtime.block_on(with_retry(
            || async { Err(DeliveryError::network("down")) },
            &opts,
        ));

        let observed = observed.lock().unwrap().clone();
        let expected: Vec<_> = (1..max_retries)
            .map(|k| (k, expected_delay(initial_ms, factor, max_ms, k)))
            .collect();
        prop_assert_eq!(observed, expected);
        prop_assert!(
            matches!(result, Err(RetryError::Exhausted { attempts, .. }) if attempts == max_retries),
            "expected exhaustion after {} attempts",
            max_retries
        );
    }
}
