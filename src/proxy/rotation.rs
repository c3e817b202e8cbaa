use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::modules::account::CredentialPool;
use crate::proxy::config::RelayConfig;
use crate::proxy::error::RotationError;
use crate::proxy::upstream::IdentityActivator;

/// What the controller is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPhase {
    Idle,
    Switching,
    Recovering,
}

/// Rotation triggers
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Consecutive generative failures before switching (0 disables)
    pub failure_threshold: u32,
    /// Generative requests per identity before switching (0 disables)
    pub switch_on_uses: u32,
    /// Upstream statuses that switch right away
    pub immediate_switch_status_codes: HashSet<u16>,
}

impl RotationPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            switch_on_uses: config.switch_on_uses,
            immediate_switch_status_codes: config
                .immediate_switch_status_codes
                .iter()
                .copied()
                .collect(),
        }
    }
}

/// Result of a switch that did not fail fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched { from: Option<u32>, to: u32 },
    /// The target failed to activate; the previous identity was restored.
    FellBack {
        attempted: u32,
        restored: u32,
        reason: String,
    },
}

impl SwitchOutcome {
    pub fn describe(&self) -> String {
        match self {
            Self::Switched { from: Some(from), to } => {
                format!("switched account #{} -> #{}", from, to)
            }
            Self::Switched { from: None, to } => format!("switched to account #{}", to),
            Self::FellBack {
                attempted,
                restored,
                reason,
            } => format!(
                "switch to account #{} failed ({}), kept account #{}",
                attempted, reason, restored
            ),
        }
    }
}

struct RotationState {
    current_index: Option<u32>,
    failure_count: u32,
    usage_count: u32,
    phase: RotationPhase,
    degraded: bool,
    /// A usage-quota rotation has been requested and not yet run
    usage_rotation_pending: bool,
    switch_count: u64,
    last_error: Option<String>,
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RotationSnapshot {
    pub current_index: Option<u32>,
    pub failure_count: u32,
    pub usage_count: u32,
    pub phase: RotationPhase,
    pub busy: bool,
    pub degraded: bool,
    pub switch_count: u64,
    pub last_error: Option<String>,
    pub available: Vec<u32>,
}

/// Resets the phase to `Idle` on every exit path of a critical section.
struct PhaseGuard<'a> {
    state: &'a Mutex<RotationState>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(state: &'a Mutex<RotationState>, phase: RotationPhase) -> Self {
        state.lock().unwrap_or_else(|e| e.into_inner()).phase = phase;
        Self { state }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).phase = RotationPhase::Idle;
    }
}

/// Identity failover state machine.
///
/// `switch_lock` is the only guard over switching and recovery: while it is held
/// the controller reports busy and request admission is refused.
pub struct RotationController {
    pool: Arc<CredentialPool>,
    activator: Arc<dyn IdentityActivator>,
    policy: RotationPolicy,
    state: Mutex<RotationState>,
    switch_lock: tokio::sync::Mutex<()>,
}

impl RotationController {
    pub fn new(
        pool: Arc<CredentialPool>,
        activator: Arc<dyn IdentityActivator>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            pool,
            activator,
            policy,
            state: Mutex::new(RotationState {
                current_index: None,
                failure_count: 0,
                usage_count: 0,
                phase: RotationPhase::Idle,
                degraded: false,
                usage_rotation_pending: false,
                switch_count: 0,
                last_error: None,
            }),
            switch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn current_index(&self) -> Option<u32> {
        self.lock_state().current_index
    }

    pub fn failure_count(&self) -> u32 {
        self.lock_state().failure_count
    }

    pub fn usage_count(&self) -> u32 {
        self.lock_state().usage_count
    }

    /// Set after a fatal rotation or failed recovery; cleared by the next successful activation.
    pub fn is_degraded(&self) -> bool {
        self.lock_state().degraded
    }

    /// True while a switch or recovery holds the rotation lock.
    pub fn is_busy(&self) -> bool {
        self.switch_lock.try_lock().is_err()
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        let busy = self.is_busy();
        let state = self.lock_state();
        RotationSnapshot {
            current_index: state.current_index,
            failure_count: state.failure_count,
            usage_count: state.usage_count,
            phase: state.phase,
            busy,
            degraded: state.degraded,
            switch_count: state.switch_count,
            last_error: state.last_error.clone(),
            available: self.pool.indices().to_vec(),
        }
    }

    /// Re-reads the bundle and hands it to the automation driver.
    async fn activate(&self, index: u32) -> Result<(), RotationError> {
        let pool = self.pool.clone();
        let content = tokio::task::spawn_blocking(move || pool.get(index))
            .await
            .map_err(|e| RotationError::ActivationFailed {
                index,
                reason: format!("credential read task failed: {}", e),
            })?
            .ok_or(RotationError::CredentialUnavailable(index))?;

        self.activator
            .activate(index, content)
            .await
            .map_err(|reason| RotationError::ActivationFailed { index, reason })
    }

    fn complete_switch(&self, index: u32) {
        let mut state = self.lock_state();
        state.current_index = Some(index);
        state.failure_count = 0;
        state.usage_count = 0;
        state.degraded = false;
        state.usage_rotation_pending = false;
        state.last_error = None;
        state.switch_count += 1;
    }

    fn mark_degraded(&self, reason: String) {
        let mut state = self.lock_state();
        state.degraded = true;
        state.last_error = Some(reason);
    }

    /// Activates the startup identity: `initial` if it is in the pool, else the first index.
    pub async fn initialize(&self, initial: Option<u32>) -> Result<u32, RotationError> {
        let target = match initial {
            Some(index) if self.pool.contains(index) => index,
            Some(index) => {
                tracing::warn!(
                    "Initial account #{} is not available, falling back to the first one",
                    index
                );
                self.pool.first().ok_or(RotationError::UnknownIndex(index))?
            }
            None => self.pool.first().ok_or(RotationError::OnlyOneAccount)?,
        };

        let _lock = self.switch_lock.lock().await;
        let _phase = PhaseGuard::enter(&self.state, RotationPhase::Switching);

        match self.activate(target).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.current_index = Some(target);
                state.failure_count = 0;
                state.usage_count = 0;
                tracing::info!("Account #{} activated at startup", target);
                Ok(target)
            }
            Err(e) => {
                self.mark_degraded(e.to_string());
                Err(e)
            }
        }
    }

    /// Rotates to the next identity in the pool, falling back to the current one on failure.
    pub async fn switch_to_next(&self) -> Result<SwitchOutcome, RotationError> {
        if self.pool.len() < 2 {
            return Err(RotationError::OnlyOneAccount);
        }
        let _lock = self
            .switch_lock
            .try_lock()
            .map_err(|_| RotationError::AlreadySwitching)?;
        let _phase = PhaseGuard::enter(&self.state, RotationPhase::Switching);

        let previous = self.current_index();
        let target = self
            .pool
            .next_after(previous)
            .ok_or(RotationError::OnlyOneAccount)?;
        tracing::info!("Switching account {:?} -> #{}", previous, target);

        let err = match self.activate(target).await {
            Ok(()) => {
                self.complete_switch(target);
                tracing::info!("✓ Now using account #{}", target);
                return Ok(SwitchOutcome::Switched {
                    from: previous,
                    to: target,
                });
            }
            Err(e) => e,
        };

        let reason = err.to_string();
        tracing::warn!("Switch to account #{} failed: {}", target, reason);

        let Some(fallback) = previous else {
            self.mark_degraded(reason);
            return Err(err);
        };

        match self.activate(fallback).await {
            Ok(()) => {
                {
                    let mut state = self.lock_state();
                    state.current_index = Some(fallback);
                    state.last_error = Some(reason.clone());
                }
                tracing::warn!("Restored previous account #{}", fallback);
                Ok(SwitchOutcome::FellBack {
                    attempted: target,
                    restored: fallback,
                    reason,
                })
            }
            Err(fallback_err) => {
                let reason = format!("{}; fallback: {}", reason, fallback_err);
                tracing::error!(
                    "Fallback to account #{} failed, service degraded: {}",
                    fallback,
                    reason
                );
                self.mark_degraded(reason.clone());
                Err(RotationError::Fatal {
                    target,
                    fallback,
                    reason,
                })
            }
        }
    }

    /// Activates an operator-chosen identity. No fallback.
    pub async fn switch_to_specific(&self, index: u32) -> Result<SwitchOutcome, RotationError> {
        if !self.pool.contains(index) {
            return Err(RotationError::UnknownIndex(index));
        }
        let _lock = self
            .switch_lock
            .try_lock()
            .map_err(|_| RotationError::AlreadySwitching)?;
        let _phase = PhaseGuard::enter(&self.state, RotationPhase::Switching);

        let previous = self.current_index();
        tracing::info!("Switching account {:?} -> #{} on request", previous, index);

        match self.activate(index).await {
            Ok(()) => {
                self.complete_switch(index);
                Ok(SwitchOutcome::Switched {
                    from: previous,
                    to: index,
                })
            }
            Err(e) => {
                tracing::error!("Requested switch to account #{} failed: {}", index, e);
                self.lock_state().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Reactivates the current identity after the bridging peer went away.
    pub async fn recover_current(&self) -> Result<u32, RotationError> {
        let _lock = self
            .switch_lock
            .try_lock()
            .map_err(|_| RotationError::AlreadySwitching)?;
        let _phase = PhaseGuard::enter(&self.state, RotationPhase::Recovering);

        let index = self
            .current_index()
            .or_else(|| self.pool.first())
            .ok_or(RotationError::OnlyOneAccount)?;
        tracing::warn!("Recovering browser session with account #{}", index);

        match self.activate(index).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.current_index = Some(index);
                state.degraded = false;
                Ok(index)
            }
            Err(e) => {
                tracing::error!("Recovery of account #{} failed: {}", index, e);
                self.mark_degraded(e.to_string());
                Err(e)
            }
        }
    }

    /// Counts a terminal failure. Returns whether the caller should switch identities.
    pub fn record_failure(&self, status: Option<u16>) -> bool {
        let mut state = self.lock_state();
        if self.policy.failure_threshold > 0 {
            state.failure_count += 1;
        }

        let immediate = status
            .map(|s| self.policy.immediate_switch_status_codes.contains(&s))
            .unwrap_or(false);
        let threshold_hit = self.policy.failure_threshold > 0
            && state.failure_count >= self.policy.failure_threshold;

        if immediate || threshold_hit {
            tracing::warn!(
                "Failure {}/{} (status {:?}) requests an account switch",
                state.failure_count,
                self.policy.failure_threshold,
                status
            );
        }
        immediate || threshold_hit
    }

    /// Clears the failure streak. Only generative requests count.
    pub fn record_success(&self, is_generative: bool) {
        if !is_generative {
            return;
        }
        let mut state = self.lock_state();
        if state.failure_count > 0 {
            tracing::debug!("Generative request succeeded, failure count reset");
        }
        state.failure_count = 0;
    }

    /// Counts a generative request. Returns true for the one request that should
    /// trigger the usage-quota rotation; later requests return false until that
    /// rotation has run.
    pub fn record_usage(&self, is_generative: bool) -> bool {
        if !is_generative || self.policy.switch_on_uses == 0 {
            return false;
        }
        let mut state = self.lock_state();
        state.usage_count += 1;
        if state.usage_count < self.policy.switch_on_uses
            || state.usage_rotation_pending
            || self.pool.len() < 2
        {
            return false;
        }
        state.usage_rotation_pending = true;
        tracing::info!(
            "Account {:?} served {} generative requests, rotating after this one",
            state.current_index,
            state.usage_count
        );
        true
    }

    /// Runs the rotation requested by [`record_usage`](Self::record_usage). When it
    /// does not switch, the next request over the quota requests it again.
    pub async fn rotate_for_usage(&self) -> Result<SwitchOutcome, RotationError> {
        let result = self.switch_to_next().await;
        self.lock_state().usage_rotation_pending = false;
        result
    }
}
