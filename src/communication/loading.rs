// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Loading indicator stages derived from the outstanding request.
//!
//! ```text
//! no request ──▶ Idle
//! elapsed <  first  ──▶ Pending   (not shown yet)
//! elapsed <  second ──▶ First
//! elapsed <  third  ──▶ Second
//! otherwise         ──▶ Third
//! ```
//!
//! Delays come from configuration unless the session publishes them on the
//! root node. The embedding application maps stages to whatever it renders.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::SyncConfig;
use crate::tree::{features, StateTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Idle,
    Pending,
    First,
    Second,
    Third,
}

impl LoadingState {
    /// Whether an indicator should be visible.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::Idle | Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingDelays {
    pub first: Duration,
    pub second: Duration,
    pub third: Duration,
}

impl LoadingDelays {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            first: Duration::from_millis(config.loading_first_delay_ms),
            second: Duration::from_millis(config.loading_second_delay_ms),
            third: Duration::from_millis(config.loading_third_delay_ms),
        }
    }
}

#[derive(Debug)]
pub struct LoadingIndicator {
    configured: LoadingDelays,
    delays: LoadingDelays,
}

impl LoadingIndicator {
    #[must_use]
    pub fn new(configured: LoadingDelays) -> Self {
        Self {
            configured,
            delays: configured,
        }
    }

    #[must_use]
    pub fn delays(&self) -> LoadingDelays {
        self.delays
    }

    /// Stage for a request outstanding since `busy_since`.
    #[must_use]
    pub fn state(&self, busy_since: Option<Instant>, now: Instant) -> LoadingState {
        let Some(since) = busy_since else {
            return LoadingState::Idle;
        };
        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.delays.first {
            LoadingState::Pending
        } else if elapsed < self.delays.second {
            LoadingState::First
        } else if elapsed < self.delays.third {
            LoadingState::Second
        } else {
            LoadingState::Third
        }
    }

    pub fn set_configured(&mut self, configured: LoadingDelays, tree: &StateTree) {
        self.configured = configured;
        self.update_from_tree(tree);
    }

    /// Root-published delays win over configured ones; zero or negative
    /// means the stage starts immediately.
    pub fn update_from_tree(&mut self, tree: &StateTree) {
        let root = tree.root();
        let pick = |feature: &str, configured: Duration| match root.millis(feature) {
            Some(published) => published.unwrap_or(Duration::ZERO),
            None => configured,
        };
        let delays = LoadingDelays {
            first: pick(features::LOADING_FIRST_DELAY, self.configured.first),
            second: pick(features::LOADING_SECOND_DELAY, self.configured.second),
            third: pick(features::LOADING_THIRD_DELAY, self.configured.third),
        };
        if delays != self.delays {
            debug!(?delays, "Loading indicator delays changed");
            self.delays = delays;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeChange, NodeId};
    use serde_json::json;

    fn indicator() -> LoadingIndicator {
        LoadingIndicator::new(LoadingDelays::from_config(&SyncConfig::default()))
    }

    #[test]
    fn test_stages_follow_elapsed_time() {
        let indicator = indicator();
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        assert_eq!(indicator.state(None, at(10_000)), LoadingState::Idle);
        assert_eq!(indicator.state(Some(start), at(299)), LoadingState::Pending);
        assert_eq!(indicator.state(Some(start), at(300)), LoadingState::First);
        assert_eq!(indicator.state(Some(start), at(1_500)), LoadingState::Second);
        assert_eq!(indicator.state(Some(start), at(5_000)), LoadingState::Third);
        assert!(!LoadingState::Pending.is_visible());
        assert!(LoadingState::First.is_visible());
    }

    #[test]
    fn test_root_features_override_delays() {
        let mut indicator = indicator();
        let mut tree = StateTree::new();
        tree.apply_changes(&[
            NodeChange::put(NodeId::ROOT, features::LOADING_FIRST_DELAY, json!(0)),
            NodeChange::put(NodeId::ROOT, features::LOADING_THIRD_DELAY, json!(2000.0)),
        ])
        .unwrap();
        indicator.update_from_tree(&tree);

        let delays = indicator.delays();
        assert_eq!(delays.first, Duration::ZERO);
        assert_eq!(delays.second, Duration::from_millis(1_500));
        assert_eq!(delays.third, Duration::from_millis(2_000));

        let start = Instant::now();
        assert_eq!(indicator.state(Some(start), start), LoadingState::First);

        // A config change keeps the published overrides.
        let config = SyncConfig {
            loading_second_delay_ms: 1_000,
            ..Default::default()
        };
        indicator.set_configured(LoadingDelays::from_config(&config), &tree);
        assert_eq!(indicator.delays().first, Duration::ZERO);
        assert_eq!(indicator.delays().second, Duration::from_millis(1_000));
    }
}
