//! # Grid Load Balancer
//!
//! Periodic control loop turning per-phase grid current samples into the
//! maximum current the charger may draw.
//!
//! Every tick picks a state from the highest phase current:
//!
//! ```text
//!  grid current
//!      ^
//!      |  ALARM_LIMIT   ramp down by alarm change, fast
//!  alarm_limit ---------------------------------------
//!      |  UPPER_LIMIT   ramp down by upper change
//!  upper_limit ---------------------------------------
//!      |  NORMAL        hold
//!  lower_limit ---------------------------------------
//!      |  LOWER_LIMIT   ramp up by lower change
//!      +--------------------------------------------->
//! ```
//!
//! A state's adjustment fires each time its wait timer runs out and repeats
//! for as long as the state holds. When no sample has arrived for the
//! fallback wait time the state is FALLBACK, which resets the limit to the
//! fallback limit.
//!
//! ```rust
//! use evse_loadbalancer::loadbalancer::{LoadBalancer, LoadBalancerConfig, Phase};
//!
//! let mut lb = LoadBalancer::new(LoadBalancerConfig::default());
//! let mut applied = Vec::new();
//!
//! lb.set_grid_current(Phase::L1, 20_000);
//! lb.task(0, &mut |limit: u16| applied.push(limit));
//! assert_eq!(applied, vec![0]);
//! ```

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::CHECK_INTERVAL_MS;

/// Value of `grid_current_age` meaning "no recent sample"
pub const GRID_CURRENT_STALE: u8 = u8::MAX;

/// Load balancer configuration. Currents in mA, times in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Rated maximum of the charger
    pub charger_limit: u16,
    pub number_of_phases: u8,
    pub alarm_limit: u16,
    pub alarm_limit_wait_time: u8,
    pub alarm_limit_change_amount: u16,
    pub upper_limit: u16,
    pub upper_limit_wait_time: u8,
    pub upper_limit_change_amount: u16,
    pub lower_limit: u16,
    pub lower_limit_wait_time: u8,
    pub lower_limit_change_amount: u16,
    pub fallback_limit: u16,
    pub fallback_limit_wait_time: u8,
}

impl Default for LoadBalancerConfig {
    /// Factory defaults for a 25 A grid connection
    fn default() -> Self {
        Self {
            charger_limit: 16000,
            number_of_phases: 3,
            alarm_limit: 24000,
            alarm_limit_wait_time: 1,
            alarm_limit_change_amount: 12500,
            upper_limit: 22000,
            upper_limit_wait_time: 5,
            upper_limit_change_amount: 1000,
            lower_limit: 19000,
            lower_limit_wait_time: 5,
            lower_limit_change_amount: 1000,
            fallback_limit: 0,
            fallback_limit_wait_time: 30,
        }
    }
}

impl LoadBalancerConfig {
    /// Check that the configuration can be applied
    pub fn validate(&self) -> ModbusResult<()> {
        if !(1..=3).contains(&self.number_of_phases) {
            return Err(ModbusError::configuration(format!(
                "number_of_phases must be 1-3, got {}",
                self.number_of_phases
            )));
        }

        let waits = [
            ("alarm", self.alarm_limit_wait_time),
            ("upper", self.upper_limit_wait_time),
            ("lower", self.lower_limit_wait_time),
            ("fallback", self.fallback_limit_wait_time),
        ];
        for (name, wait) in waits {
            if wait == GRID_CURRENT_STALE {
                return Err(ModbusError::configuration(format!(
                    "{} wait time must be below {}",
                    name, GRID_CURRENT_STALE
                )));
            }
        }

        if !(self.lower_limit < self.upper_limit && self.upper_limit < self.alarm_limit) {
            return Err(ModbusError::configuration(format!(
                "limits must satisfy lower < upper < alarm ({} / {} / {})",
                self.lower_limit, self.upper_limit, self.alarm_limit
            )));
        }

        Ok(())
    }
}

/// Control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum LbState {
    #[default]
    Normal = 0,
    LowerLimit = 1,
    UpperLimit = 2,
    AlarmLimit = 3,
    Fallback = 4,
}

impl LbState {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Grid phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1 = 0,
    L2 = 1,
    L3 = 2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Collaborator applying the computed limit to the charger
pub trait LimitSink {
    fn limit_charger(&mut self, current_ma: u16);
}

impl<F: FnMut(u16)> LimitSink for F {
    fn limit_charger(&mut self, current_ma: u16) {
        self(current_ma)
    }
}

/// Two-branch clamp: an over-limit value drops to the override only when it
/// exceeds the override too, otherwise to the charger limit.
fn clamp_limit(raw: i32, charger_limit: u16, limit_override: u16) -> i32 {
    if raw < 0 {
        0
    } else if raw > charger_limit as i32 {
        if raw > limit_override as i32 {
            limit_override as i32
        } else {
            charger_limit as i32
        }
    } else {
        raw
    }
}

/// Load balancer state machine
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    state: LbState,
    wait_timer: Option<u8>,
    grid_current: [u16; 3],
    grid_current_age: u8,
    charger_max_current: i32,
    charger_limit_override: u16,
    last_tick_ms: Option<u64>,
    last_check_secs: Option<u64>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        info!(
            "⚖️  Load balancer: {} phase(s), charger limit {} mA",
            config.number_of_phases, config.charger_limit
        );

        Self {
            config,
            state: LbState::Normal,
            wait_timer: None,
            grid_current: [0; 3],
            grid_current_age: GRID_CURRENT_STALE,
            charger_max_current: 0,
            charger_limit_override: u16::MAX,
            last_tick_ms: None,
            last_check_secs: None,
        }
    }

    /// Start from `limit` instead of 0
    pub fn with_initial_limit(mut self, limit: u16) -> Self {
        self.charger_max_current = limit as i32;
        self
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Mutable configuration; changes take effect on the next tick
    pub fn config_mut(&mut self) -> &mut LoadBalancerConfig {
        &mut self.config
    }

    /// Record a fresh sample for `phase`
    pub fn set_grid_current(&mut self, phase: Phase, current_ma: u16) {
        self.grid_current[phase.index()] = current_ma;
        self.grid_current_age = 0;
    }

    pub fn grid_current(&self, phase: Phase) -> u16 {
        self.grid_current[phase.index()]
    }

    /// Seconds since the last sample, saturating at [`GRID_CURRENT_STALE`]
    pub fn grid_current_age(&self) -> u8 {
        self.grid_current_age
    }

    pub fn set_charger_limit_override(&mut self, limit: u16) {
        self.charger_limit_override = limit;
    }

    pub fn charger_limit_override(&self) -> u16 {
        self.charger_limit_override
    }

    pub fn state(&self) -> LbState {
        self.state
    }

    /// Current charger limit in mA
    pub fn limit(&self) -> u16 {
        self.charger_max_current.clamp(0, u16::MAX as i32) as u16
    }

    /// Run a check if the check interval has passed since the previous one
    pub fn task(&mut self, now_ms: u64, sink: &mut dyn LimitSink) {
        let due = match self.last_tick_ms {
            Some(last) => now_ms.saturating_sub(last) >= CHECK_INTERVAL_MS,
            None => true,
        };

        if due {
            self.last_tick_ms = Some(now_ms);
            self.check(now_ms / 1000, sink);
        }
    }

    fn max_grid_current(&self) -> u16 {
        let phases = (self.config.number_of_phases as usize).clamp(1, self.grid_current.len());
        self.grid_current[..phases].iter().copied().max().unwrap_or(0)
    }

    fn set_state(&mut self, state: LbState) {
        if self.state != state {
            debug!("Load balancer state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.wait_timer = None;
        }
    }

    fn wait_time(&self) -> u8 {
        match self.state {
            LbState::Normal => 0,
            LbState::LowerLimit => self.config.lower_limit_wait_time,
            LbState::UpperLimit => self.config.upper_limit_wait_time,
            LbState::AlarmLimit => self.config.alarm_limit_wait_time,
            LbState::Fallback => self.config.fallback_limit_wait_time,
        }
    }

    /// Limit after the current state's adjustment
    fn adjusted(&self) -> i32 {
        let current = self.charger_max_current;
        match self.state {
            LbState::Normal => current,
            LbState::LowerLimit => current + self.config.lower_limit_change_amount as i32,
            LbState::UpperLimit => current - self.config.upper_limit_change_amount as i32,
            LbState::AlarmLimit => current - self.config.alarm_limit_change_amount as i32,
            LbState::Fallback => self.config.fallback_limit as i32,
        }
    }

    /// One control step at `now_secs`
    pub fn check(&mut self, now_secs: u64, sink: &mut dyn LimitSink) {
        let elapsed = self
            .last_check_secs
            .map(|last| now_secs.saturating_sub(last))
            .unwrap_or(0);
        self.last_check_secs = Some(now_secs);
        let elapsed = u8::try_from(elapsed).unwrap_or(u8::MAX);

        let grid_max = self.max_grid_current();

        if let Some(timer) = self.wait_timer {
            self.wait_timer = Some(timer.saturating_sub(elapsed));
        }
        self.grid_current_age = self.grid_current_age.saturating_add(elapsed);

        let config = &self.config;
        let target = if self.grid_current_age >= config.fallback_limit_wait_time {
            LbState::Fallback
        } else if grid_max > config.alarm_limit {
            LbState::AlarmLimit
        } else if grid_max > config.upper_limit {
            LbState::UpperLimit
        } else if grid_max <= config.lower_limit {
            LbState::LowerLimit
        } else {
            LbState::Normal
        };
        self.set_state(target);

        if self.state != LbState::Normal {
            let wait_time = self.wait_time();
            match self.wait_timer {
                None => self.wait_timer = Some(wait_time),
                Some(0) => {
                    self.charger_max_current = self.adjusted();
                    self.wait_timer = Some(wait_time);
                }
                Some(_) => {}
            }
        }

        self.charger_max_current = clamp_limit(
            self.charger_max_current,
            self.config.charger_limit,
            self.charger_limit_override,
        );

        debug!(
            "Grid max {} mA, age {} s, state {:?}, limit {} mA",
            grid_max, self.grid_current_age, self.state, self.charger_max_current
        );
        sink.limit_charger(self.limit());
    }
}
