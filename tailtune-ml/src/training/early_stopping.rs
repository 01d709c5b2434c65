//! Early stopping on a monitored validation metric.

use serde::{Deserialize, Serialize};

use crate::training::config::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Improving,
    Stalled,
    /// Terminal.
    Stopped,
}

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The metric set a new best; the caller saves the `best` slot.
    pub improved: bool,
    pub state: MonitorState,
}

/// Serializable monitor state, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub best: Option<f64>,
    pub epochs_without_improvement: usize,
    pub state: MonitorState,
}

#[derive(Debug, Clone)]
pub struct EarlyStoppingMonitor {
    pub patience: usize,
    pub min_delta: f64,
    pub direction: Direction,
    best: Option<f64>,
    counter: usize,
    state: MonitorState,
}

impl EarlyStoppingMonitor {
    pub fn new(patience: usize, min_delta: f64, direction: Direction) -> Self {
        Self {
            patience,
            min_delta,
            direction,
            best: None,
            counter: 0,
            state: MonitorState::Improving,
        }
    }

    pub fn observe(&mut self, metric: f64) -> Observation {
        if self.state == MonitorState::Stopped {
            return Observation {
                improved: false,
                state: self.state,
            };
        }

        let improved = !metric.is_nan()
            && match self.best {
                None => true,
                Some(best) => self.direction.improves(metric, best, self.min_delta),
            };

        if improved {
            self.best = Some(metric);
            self.counter = 0;
            self.state = MonitorState::Improving;
        } else {
            self.counter += 1;
            self.state = if self.counter >= self.patience {
                MonitorState::Stopped
            } else {
                MonitorState::Stalled
            };
        }
        Observation {
            improved,
            state: self.state,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.counter
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == MonitorState::Stopped
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            best: self.best,
            epochs_without_improvement: self.counter,
            state: self.state,
        }
    }

    pub fn restore(&mut self, snapshot: &MonitorSnapshot) {
        self.best = snapshot.best;
        self.counter = snapshot.epochs_without_improvement;
        self.state = snapshot.state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience_plateau() {
        let mut m = EarlyStoppingMonitor::new(3, 0.0, Direction::Maximize);
        let states: Vec<MonitorState> = [0.5, 0.6, 0.6, 0.6, 0.6]
            .iter()
            .map(|&v| m.observe(v).state)
            .collect();
        assert_eq!(
            states,
            vec![
                MonitorState::Improving,
                MonitorState::Improving,
                MonitorState::Stalled,
                MonitorState::Stalled,
                MonitorState::Stopped,
            ]
        );
        assert_eq!(m.best(), Some(0.6));
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut m = EarlyStoppingMonitor::new(1, 0.0, Direction::Maximize);
        m.observe(0.5);
        assert_eq!(m.observe(0.4).state, MonitorState::Stopped);
        let late = m.observe(0.99);
        assert!(!late.improved);
        assert_eq!(late.state, MonitorState::Stopped);
        assert_eq!(m.best(), Some(0.5));
    }

    #[test]
    fn test_min_delta_and_direction() {
        let mut m = EarlyStoppingMonitor::new(5, 0.05, Direction::Minimize);
        assert!(m.observe(1.0).improved);
        assert!(!m.observe(0.97).improved);
        assert!(m.observe(0.9).improved);
        assert_eq!(m.epochs_without_improvement(), 0);
    }

    #[test]
    fn test_nan_never_improves() {
        let mut m = EarlyStoppingMonitor::new(2, 0.0, Direction::Maximize);
        assert!(!m.observe(f64::NAN).improved);
        assert_eq!(m.best(), None);
        assert!(m.observe(0.1).improved);
    }

    #[test]
    fn test_snapshot_restores_patience_budget() {
        let mut a = EarlyStoppingMonitor::new(3, 0.0, Direction::Maximize);
        a.observe(0.5);
        a.observe(0.4);
        a.observe(0.4);

        let mut b = EarlyStoppingMonitor::new(3, 0.0, Direction::Maximize);
        b.restore(&a.snapshot());
        assert_eq!(b.observe(0.45).state, MonitorState::Stopped);
    }
}
