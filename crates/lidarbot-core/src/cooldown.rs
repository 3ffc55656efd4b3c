use crate::config::CooldownConfig;
use crate::domain::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No action admitted within the last interval.
    Settled,
    /// An action was just admitted; new proposals repeat it until the interval passes.
    Cooling,
}

/// Hysteresis between decided and executed actions.
///
/// A new decision only takes effect once `min_interval_us` has passed since
/// the last admitted one. Inside the interval the previous action is repeated.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    pub min_interval_us: i64,
    pub(crate) last_action_ts_us: Option<i64>,
    pub(crate) last_admitted: Option<Action>,
}

impl CooldownGate {
    pub fn new(min_interval_us: i64) -> Self {
        Self { min_interval_us: min_interval_us.max(0), last_action_ts_us: None, last_admitted: None }
    }

    pub fn from_config(cfg: &CooldownConfig) -> Self {
        Self::new(cfg.min_interval_us())
    }

    /// Returns the action to execute at `now_us`.
    pub fn admit(&mut self, proposed: Action, now_us: i64) -> Action {
        match (self.last_admitted, self.last_action_ts_us) {
            (Some(prev), Some(last_ts)) if now_us - last_ts < self.min_interval_us => prev,
            _ => {
                self.last_admitted = Some(proposed);
                self.last_action_ts_us = Some(now_us);
                proposed
            }
        }
    }

    /// Admit `action` regardless of the interval and restart the cooldown.
    pub fn force(&mut self, action: Action, now_us: i64) -> Action {
        self.last_admitted = Some(action);
        self.last_action_ts_us = Some(now_us);
        action
    }

    pub fn state(&self, now_us: i64) -> GateState {
        match self.last_action_ts_us {
            Some(last_ts) if now_us - last_ts < self.min_interval_us => GateState::Cooling,
            _ => GateState::Settled,
        }
    }

    pub fn last_admitted(&self) -> Option<Action> {
        self.last_admitted
    }

    pub fn reset(&mut self) {
        self.last_action_ts_us = None;
        self.last_admitted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_proposal_is_admitted() {
        let mut g = CooldownGate::new(100_000);
        assert_eq!(g.state(0), GateState::Settled);
        assert_eq!(g.admit(Action::Left, 0), Action::Left);
        assert_eq!(g.state(50_000), GateState::Cooling);
        assert_eq!(g.state(100_000), GateState::Settled);
    }

    #[test]
    fn rapid_alternation_repeats_first_action() {
        let mut g = CooldownGate::new(100_000);
        let proposals = [Action::Left, Action::Right, Action::Left, Action::Right, Action::Forward];
        let executed: Vec<Action> = proposals
            .iter()
            .enumerate()
            .map(|(i, a)| g.admit(*a, i as i64 * 20_000))
            .collect();
        assert_eq!(executed, vec![Action::Left; 5]);
        // interval elapsed: next distinct proposal gets through
        assert_eq!(g.admit(Action::Right, 100_000), Action::Right);
        assert_eq!(g.admit(Action::Left, 150_000), Action::Right);
        assert_eq!(g.admit(Action::Left, 200_000), Action::Left);
    }

    #[test]
    fn repeated_same_action_still_restarts_interval() {
        let mut g = CooldownGate::new(100_000);
        g.admit(Action::Forward, 0);
        assert_eq!(g.admit(Action::Forward, 120_000), Action::Forward);
        assert_eq!(g.admit(Action::Left, 150_000), Action::Forward);
    }

    #[test]
    fn zero_interval_admits_everything() {
        let mut g = CooldownGate::new(0);
        assert_eq!(g.admit(Action::Left, 0), Action::Left);
        assert_eq!(g.admit(Action::Right, 0), Action::Right);
        assert_eq!(g.state(0), GateState::Settled);
    }

    #[test]
    fn force_bypasses_and_restarts() {
        let mut g = CooldownGate::new(100_000);
        g.admit(Action::Left, 0);
        assert_eq!(g.force(Action::Stop, 10_000), Action::Stop);
        assert_eq!(g.admit(Action::Forward, 50_000), Action::Stop);
        assert_eq!(g.admit(Action::Forward, 110_000), Action::Forward);
        g.reset();
        assert_eq!(g.last_admitted(), None);
        assert_eq!(g.admit(Action::Right, 110_001), Action::Right);
    }

    #[test]
    fn config_seconds_become_micros() {
        let g = CooldownGate::from_config(&CooldownConfig { obstacle_cooldown_s: 1.0 / 6.0 });
        assert_eq!(g.min_interval_us, 166_667);
    }
}
