//! # Marketplace Testing
//!
//! Testing utilities for the ticket marketplace.
//!
//! This crate provides:
//! - [`FixedClock`]: deterministic, manually advanced time
//! - [`ReducerTest`]: Given-When-Then harness for reducers
//! - [`assertions`]: helpers for checking returned effects
//!
//! ## Example
//!
//! ```ignore
//! use marketplace_testing::{test_clock, ReducerTest};
//!
//! ReducerTest::new(WalletReducer::new())
//!     .with_env(WalletEnvironment::new(Arc::new(test_clock()), audit))
//!     .given_state(WalletState::new(balance))
//!     .when_action(WalletAction::Credit { .. })
//!     .then_state(|state| assert!(state.last_error.is_none()))
//!     .run();
//! ```


pub use reducer_test::{assertions, ReducerTest};

use chrono::{DateTime, Duration, Utc};
use marketplace_core::environment::Clock;
use std::sync::{Arc, RwLock};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Arc, Clock, DateTime, Duration, RwLock, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same instant until [`FixedClock::advance`] moves it. Clones
    /// share the same underlying time, so a test can hold one handle while the
    /// services under test hold another.
    ///
    /// # Example
    ///
    /// ```
    /// use marketplace_testing::mocks::FixedClock;
    /// use marketplace_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// assert_eq!(before, clock.now());
    ///
    /// clock.advance(Duration::minutes(20));
    /// assert_eq!(clock.now() - before, Duration::minutes(20));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Moves the clock forward by `by`
        pub fn advance(&self, by: Duration) {
            if let Ok(mut time) = self.time.write() {
                *time += by;
            }
        }

        /// Sets the clock to an absolute instant
        pub fn set(&self, to: DateTime<Utc>) {
            if let Ok(mut time) = self.time.write() {
                *time = to;
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            // A poisoned lock still holds a valid instant.
            match self.time.read() {
                Ok(time) => *time,
                Err(poisoned) => *poisoned.into_inner(),
            }
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_735_689_600))
    }
}

// Re-export commonly used items
pub use mocks::{test_clock, FixedClock};
