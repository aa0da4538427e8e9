//! Target-tracking autoscaler for one service.
//!
//! Pure state machine: callers feed it metric samples together with the
//! current time and apply the actions it returns. Time is passed in as
//! milliseconds so cooldowns can be tested without a clock.

use serde::Serialize;
use tracing::{debug, info};

use stratus_common::ScalingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoscalerState {
    Steady,
    /// A scale-out is in flight or its cooldown has not elapsed.
    ScalingOut,
    /// A scale-in is in flight or its cooldown has not elapsed.
    ScalingIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleAction {
    pub direction: ScaleDirection,
    pub from: u32,
    pub to: u32,
    pub decided_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Autoscaler {
    policy: ScalingPolicy,
    state: AutoscalerState,
    above_target: u32,
    below_target: u32,
    last_scale_out_ms: Option<u64>,
    last_scale_in_ms: Option<u64>,
    in_flight: Option<ScaleAction>,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            state: AutoscalerState::Steady,
            above_target: 0,
            below_target: 0,
            last_scale_out_ms: None,
            last_scale_in_ms: None,
            in_flight: None,
        }
    }

    pub fn state(&self) -> AutoscalerState {
        self.state
    }

    pub fn in_flight(&self) -> Option<ScaleAction> {
        self.in_flight
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    fn cooling(last: Option<u64>, cooldown_ms: u64, now_ms: u64) -> bool {
        last.is_some_and(|at| now_ms < at.saturating_add(cooldown_ms))
    }

    fn out_cooling(&self, now_ms: u64) -> bool {
        Self::cooling(self.last_scale_out_ms, self.policy.scale_out_cooldown_ms, now_ms)
    }

    fn in_cooling(&self, now_ms: u64) -> bool {
        Self::cooling(self.last_scale_in_ms, self.policy.scale_in_cooldown_ms, now_ms)
    }

    fn settle(&mut self, now_ms: u64) {
        if self.in_flight.is_some() {
            return;
        }
        self.state = match self.state {
            AutoscalerState::ScalingOut if !self.out_cooling(now_ms) => AutoscalerState::Steady,
            AutoscalerState::ScalingIn if !self.in_cooling(now_ms) => AutoscalerState::Steady,
            s => s,
        };
    }

    /// Feed one utilization sample. Returns the action to apply, if any.
    /// While an action is in flight every sample is ignored.
    pub fn observe(&mut self, utilization: f64, desired: u32, now_ms: u64) -> Option<ScaleAction> {
        if self.in_flight.is_some() {
            debug!(utilization, "autoscaler: action in flight, sample ignored");
            return None;
        }
        self.settle(now_ms);

        let target = self.policy.target_cpu_percent;
        if utilization > target {
            self.above_target += 1;
            self.below_target = 0;
        } else if utilization < target - self.policy.scale_in_margin_percent {
            self.below_target += 1;
            self.above_target = 0;
        } else {
            self.above_target = 0;
            self.below_target = 0;
        }

        let bounds = self.policy.bounds;
        let desired = bounds.clamp(desired);
        let window = self.policy.evaluation_periods.max(1);

        let action = if self.above_target >= window
            && desired < bounds.max
            && !self.out_cooling(now_ms)
        {
            self.above_target = 0;
            self.last_scale_out_ms = Some(now_ms);
            self.state = AutoscalerState::ScalingOut;
            ScaleAction {
                direction: ScaleDirection::Out,
                from: desired,
                to: bounds.clamp(desired.saturating_add(self.policy.step)),
                decided_at_ms: now_ms,
            }
        } else if self.below_target >= window
            && desired > bounds.min
            && !self.in_cooling(now_ms)
        {
            self.below_target = 0;
            self.last_scale_in_ms = Some(now_ms);
            self.state = AutoscalerState::ScalingIn;
            ScaleAction {
                direction: ScaleDirection::In,
                from: desired,
                to: bounds.clamp(desired.saturating_sub(self.policy.step)),
                decided_at_ms: now_ms,
            }
        } else {
            return None;
        };

        info!(
            direction = ?action.direction,
            from = action.from,
            to = action.to,
            utilization,
            "autoscale decision"
        );
        self.in_flight = Some(action);
        Some(action)
    }

    /// The in-flight action was applied; its cooldown keeps running.
    pub fn complete(&mut self) {
        self.in_flight = None;
    }

    /// The in-flight action could not be applied. Its cooldown is withdrawn
    /// so the next sustained window may try again.
    pub fn abandon(&mut self) {
        if let Some(action) = self.in_flight.take() {
            match action.direction {
                ScaleDirection::Out => self.last_scale_out_ms = None,
                ScaleDirection::In => self.last_scale_in_ms = None,
            }
            self.state = AutoscalerState::Steady;
        }
    }
}
