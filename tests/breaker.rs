use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tonic::Status;

use resiliency_lib::breaker::{BreakerSettings, CircuitBreaker, State};
use resiliency_lib::error::CallError;

fn settings(name: &str) -> BreakerSettings {
    BreakerSettings {
        name: name.to_string(),
        ..BreakerSettings::default()
    }
}

/// One guarded call with a scripted outcome; counts how often the underlying
/// operation actually ran.
async fn drive(
    breaker: &CircuitBreaker,
    invocations: &Arc<AtomicU32>,
    success: bool,
) -> Result<(), CallError> {
    let invocations = Arc::clone(invocations);

    breaker
        .call(|| async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            if success {
                Ok(())
            } else {
                Err(CallError::Transport(Status::unknown("scripted failure")))
            }
        })
        .await
}

#[tokio::test]
async fn stays_closed_below_minimum_attempts() {
    let breaker = CircuitBreaker::new(settings("min-attempts"));
    let invocations = Arc::new(AtomicU32::new(0));

    // Two failures is 100% failure ratio but under the attempt floor.
    for _ in 0..2 {
        let _ = drive(&breaker, &invocations, false).await;
    }

    assert_eq!(breaker.state(), State::Closed);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn counts_track_both_outcomes_within_a_generation() {
    let breaker = CircuitBreaker::new(settings("counts"));
    let invocations = Arc::new(AtomicU32::new(0));

    drive(&breaker, &invocations, true).await.unwrap();
    let _ = drive(&breaker, &invocations, false).await;

    let counts = breaker.counts();
    assert_eq!(counts.requests, 2);
    assert_eq!(counts.total_successes, 1);
    assert_eq!(counts.total_failures, 1);
    assert!((counts.failure_ratio() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn trips_open_after_three_consecutive_failures() {
    let breaker = CircuitBreaker::new(settings("trip"));
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let _ = drive(&breaker, &invocations, false).await;
    }

    assert_eq!(breaker.state(), State::Open);

    // Fourth call must short-circuit without touching the operation.
    let err = drive(&breaker, &invocations, true).await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn mixed_outcomes_trip_at_sixty_percent() {
    let breaker = CircuitBreaker::new(settings("ratio"));
    let invocations = Arc::new(AtomicU32::new(0));

    // The trip check runs after every completed call, successes included:
    // two failures then a success is 2/3 >= 0.6 at the third completion.
    let _ = drive(&breaker, &invocations, false).await;
    let _ = drive(&breaker, &invocations, false).await;
    assert_eq!(breaker.state(), State::Closed);

    let _ = drive(&breaker, &invocations, true).await;
    assert_eq!(breaker.state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn cooldown_moves_open_to_half_open() {
    let breaker = CircuitBreaker::new(settings("cooldown"));
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let _ = drive(&breaker, &invocations, false).await;
    }
    assert_eq!(breaker.state(), State::Open);

    // Still inside the cool-down window.
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(breaker.state(), State::Open);
    let err = drive(&breaker, &invocations, true).await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(breaker.state(), State::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn half_open_closes_after_trial_successes() {
    let breaker = CircuitBreaker::new(settings("recover"));
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let _ = drive(&breaker, &invocations, false).await;
    }
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(breaker.state(), State::HalfOpen);

    // Default trial budget is three consecutive successes.
    for _ in 0..3 {
        drive(&breaker, &invocations, true).await.unwrap();
    }

    assert_eq!(breaker.state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens() {
    let breaker = CircuitBreaker::new(settings("relapse"));
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let _ = drive(&breaker, &invocations, false).await;
    }
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(breaker.state(), State::HalfOpen);

    let _ = drive(&breaker, &invocations, false).await;
    assert_eq!(breaker.state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn closed_interval_rolls_the_counting_window() {
    let breaker = CircuitBreaker::new(BreakerSettings {
        name: "interval".to_string(),
        interval: Some(Duration::from_secs(10)),
        ..BreakerSettings::default()
    });
    let invocations = Arc::new(AtomicU32::new(0));

    let _ = drive(&breaker, &invocations, false).await;
    let _ = drive(&breaker, &invocations, false).await;
    assert_eq!(breaker.counts().total_failures, 2);

    // The rollover wipes the window; the next failure starts from scratch
    // and must not trip.
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(breaker.counts().total_failures, 0);

    let _ = drive(&breaker, &invocations, false).await;
    assert_eq!(breaker.state(), State::Closed);
}

/// Reference model from the state-machine definition: while closed, the
/// breaker is open if and only if some completed call saw
/// `requests >= 3 && failures / requests >= 0.6` in the current generation.
struct Model {
    requests: u32,
    failures: u32,
    open: bool,
}

impl Model {
    fn new() -> Model {
        Model {
            requests: 0,
            failures: 0,
            open: false,
        }
    }

    /// Returns whether the call was admitted.
    fn step(&mut self, success: bool) -> bool {
        if self.open {
            return false;
        }

        self.requests += 1;
        if !success {
            self.failures += 1;
        }

        let ratio = f64::from(self.failures) / f64::from(self.requests);
        if self.requests >= 3 && ratio >= 0.6 {
            self.open = true;
        }

        true
    }
}

proptest! {
    #[test]
    fn breaker_state_matches_reference_model(
        outcomes in proptest::collection::vec(any::<bool>(), 0..20)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async {
            let breaker = CircuitBreaker::new(settings("model"));
            let invocations = Arc::new(AtomicU32::new(0));
            let mut model = Model::new();
            let mut admitted = 0u32;

            for &success in &outcomes {
                let result = drive(&breaker, &invocations, success).await;

                if model.step(success) {
                    admitted += 1;
                    prop_assert_eq!(result.is_err(), !success);
                } else {
                    prop_assert!(result.unwrap_err().is_breaker_open());
                }

                let expected = if model.open { State::Open } else { State::Closed };
                prop_assert_eq!(breaker.state(), expected);
            }

            // Rejected calls never reached the operation.
            prop_assert_eq!(invocations.load(Ordering::SeqCst), admitted);
            Ok(())
        })?;
    }
}
