//! Shared scarce-resource coordination.
//!
//! Three resizable counting semaphores gate the ASR engine, LLM connections,
//! and ffmpeg-bound work. Limits come from the stored runtime profile and can
//! change while waiters are blocked; `set_max_value` wakes everyone so they
//! re-check. Acquire never errors on timeout, it returns `false`; callers
//! translate that into a typed concurrency-timeout failure.

use crate::error::{Result, SiktError};
use serde::{Deserialize, Serialize};
use std::sync::Mutex as StdMutex;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct SemState {
    max: usize,
    in_use: usize,
}

/// Counting semaphore whose capacity can be resized at runtime.
#[derive(Debug)]
pub struct DynamicSemaphore {
    state: StdMutex<SemState>,
    notify: Notify,
}

/// Point-in-time view of a semaphore, surfaced in diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterSnapshot {
    pub max: usize,
    pub in_use: usize,
}

impl DynamicSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            state: StdMutex::new(SemState { max, in_use: 0 }),
            notify: Notify::new(),
        }
    }

    pub fn max_value(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).max
    }

    /// Resize capacity and wake all waiters so they re-check.
    pub fn set_max_value(&self, max: usize) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).max = max;
        self.notify.notify_waiters();
    }

    /// Acquire one slot, waiting at most `timeout` (forever when `None`).
    /// Returns `false` on deadline or when capacity is zero.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Register interest before checking state so a concurrent resize
            // or release cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if state.max == 0 {
                    return false;
                }
                if state.in_use < state.max {
                    state.in_use += 1;
                    return true;
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        // Deadline hit while parked; one final state check.
                        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                        if state.max > 0 && state.in_use < state.max {
                            state.in_use += 1;
                            return true;
                        }
                        return false;
                    }
                }
            }
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.in_use > 0 {
            state.in_use -= 1;
        }
        drop(state);
        self.notify.notify_one();
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        LimiterSnapshot {
            max: state.max,
            in_use: state.in_use,
        }
    }
}

/// RAII slot holder; releases on drop.
pub struct LimitGuard<'a> {
    semaphore: &'a DynamicSemaphore,
}

impl Drop for LimitGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Owned LLM-limiter slot, released on drop.
pub struct OwnedLlmGuard {
    runtime: std::sync::Arc<Runtime>,
}

impl Drop for OwnedLlmGuard {
    fn drop(&mut self) {
        self.runtime.llm.release();
    }
}

fn env_timeout(key: &str) -> Duration {
    let seconds = std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(3.0)
        .max(0.0);
    Duration::from_secs_f64(seconds)
}

pub fn asr_concurrency_timeout() -> Duration {
    env_timeout("ASR_CONCURRENCY_TIMEOUT_SECONDS")
}

pub fn llm_concurrency_timeout() -> Duration {
    env_timeout("LLM_CONCURRENCY_TIMEOUT_SECONDS")
}

pub fn heavy_concurrency_timeout() -> Duration {
    env_timeout("HEAVY_CONCURRENCY_TIMEOUT_SECONDS")
}

/// Stored runtime profile preferences; every field optional so the profile
/// defaults fill in the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimePreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_concurrency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_concurrency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heavy_concurrency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_compute_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_model: Option<String>,
}

/// Fully-resolved runtime preferences, after merging with profile defaults.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EffectivePreferences {
    pub profile: String,
    pub asr_concurrency: usize,
    pub llm_concurrency: usize,
    pub heavy_concurrency: usize,
    pub llm_timeout_seconds: u64,
    pub asr_device: String,
    pub asr_compute_type: String,
    pub asr_model: String,
}

fn normalize_profile(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.as_str() {
        "" => "balanced".to_string(),
        "gpu" => "gpu_recommended".to_string(),
        _ => name,
    }
}

/// Baseline limits and ASR placement per profile.
pub fn profile_defaults(profile: &str, default_asr_model: &str) -> EffectivePreferences {
    let profile = normalize_profile(profile);
    let (asr_device, asr_compute_type) = match profile.as_str() {
        "gpu_recommended" => ("cuda", "float16"),
        _ => ("cpu", "int8"),
    };
    let profile = match profile.as_str() {
        "cpu" | "gpu_recommended" => profile,
        _ => "balanced".to_string(),
    };

    EffectivePreferences {
        profile,
        asr_concurrency: 1,
        llm_concurrency: 1,
        heavy_concurrency: 1,
        llm_timeout_seconds: 600,
        asr_device: asr_device.to_string(),
        asr_compute_type: asr_compute_type.to_string(),
        asr_model: default_asr_model.to_string(),
    }
}

/// Merge stored preferences over profile defaults.
pub fn effective_preferences(
    prefs: &RuntimePreferences,
    default_asr_model: &str,
) -> EffectivePreferences {
    let base = profile_defaults(prefs.profile.as_deref().unwrap_or("balanced"), default_asr_model);

    let clamp = |v: Option<i64>, default: usize| -> usize {
        v.map(|v| v.max(0) as usize).unwrap_or(default)
    };

    EffectivePreferences {
        profile: base.profile.clone(),
        asr_concurrency: clamp(prefs.asr_concurrency, base.asr_concurrency),
        llm_concurrency: clamp(prefs.llm_concurrency, base.llm_concurrency),
        heavy_concurrency: clamp(prefs.heavy_concurrency, base.heavy_concurrency),
        llm_timeout_seconds: prefs
            .llm_timeout_seconds
            .map(|v| v.max(5) as u64)
            .unwrap_or(base.llm_timeout_seconds),
        asr_device: prefs
            .asr_device
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&base.asr_device)
            .to_string(),
        asr_compute_type: prefs
            .asr_compute_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&base.asr_compute_type)
            .to_string(),
        asr_model: prefs
            .asr_model
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&base.asr_model)
            .to_string(),
    }
}

/// Process-wide resource coordination: the three limiters plus the currently
/// published effective preferences (LLM timeout, ASR placement).
#[derive(Debug)]
pub struct Runtime {
    pub asr: DynamicSemaphore,
    pub llm: DynamicSemaphore,
    pub heavy: DynamicSemaphore,
    effective: RwLock<EffectivePreferences>,
    default_asr_model: String,
}

impl Runtime {
    pub fn new(default_asr_model: &str) -> Self {
        let effective = profile_defaults("balanced", default_asr_model);
        Self {
            asr: DynamicSemaphore::new(effective.asr_concurrency),
            llm: DynamicSemaphore::new(effective.llm_concurrency),
            heavy: DynamicSemaphore::new(effective.heavy_concurrency),
            effective: RwLock::new(effective),
            default_asr_model: default_asr_model.to_string(),
        }
    }

    /// Resolve and apply stored preferences: resize all limiters and publish
    /// the effective values.
    pub fn apply_preferences(&self, prefs: &RuntimePreferences) -> EffectivePreferences {
        let effective = effective_preferences(prefs, &self.default_asr_model);
        self.asr.set_max_value(effective.asr_concurrency);
        self.llm.set_max_value(effective.llm_concurrency);
        self.heavy.set_max_value(effective.heavy_concurrency);
        *self.effective.write().unwrap_or_else(|p| p.into_inner()) = effective.clone();
        effective
    }

    /// Resolve preferences without applying them.
    pub fn resolve(&self, prefs: &RuntimePreferences) -> EffectivePreferences {
        effective_preferences(prefs, &self.default_asr_model)
    }

    pub fn effective(&self) -> EffectivePreferences {
        self.effective.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn llm_request_timeout(&self) -> Duration {
        let seconds = std::env::var("LLM_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|v| v.max(5))
            .unwrap_or_else(|| self.effective.read().unwrap_or_else(|p| p.into_inner()).llm_timeout_seconds);
        Duration::from_secs(seconds)
    }

    pub async fn limit_asr(&self) -> Result<LimitGuard<'_>> {
        if !self.asr.acquire(Some(asr_concurrency_timeout())).await {
            return Err(SiktError::ConcurrencyTimeout("ASR_CONCURRENCY_TIMEOUT"));
        }
        Ok(LimitGuard { semaphore: &self.asr })
    }

    pub async fn limit_llm(&self) -> Result<LimitGuard<'_>> {
        if !self.llm.acquire(Some(llm_concurrency_timeout())).await {
            return Err(SiktError::ConcurrencyTimeout("LLM_CONCURRENCY_TIMEOUT"));
        }
        Ok(LimitGuard { semaphore: &self.llm })
    }

    /// Acquire the LLM limiter without a deadline; still fails fast when
    /// capacity is zero.
    pub async fn limit_llm_wait(&self) -> Result<LimitGuard<'_>> {
        if !self.llm.acquire(None).await {
            return Err(SiktError::ConcurrencyTimeout("LLM_CONCURRENCY_TIMEOUT"));
        }
        Ok(LimitGuard { semaphore: &self.llm })
    }

    /// Like [`Runtime::limit_llm_wait`], but the returned guard owns its
    /// runtime handle so it can be held across a streaming response.
    pub async fn limit_llm_owned(self: &std::sync::Arc<Self>) -> Result<OwnedLlmGuard> {
        if !self.llm.acquire(None).await {
            return Err(SiktError::ConcurrencyTimeout("LLM_CONCURRENCY_TIMEOUT"));
        }
        Ok(OwnedLlmGuard {
            runtime: self.clone(),
        })
    }

    pub async fn limit_heavy(&self) -> Result<LimitGuard<'_>> {
        if !self.heavy.acquire(Some(heavy_concurrency_timeout())).await {
            return Err(SiktError::ConcurrencyTimeout("HEAVY_CONCURRENCY_TIMEOUT"));
        }
        Ok(LimitGuard {
            semaphore: &self.heavy,
        })
    }

    pub fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "limiters": {
                "asr": self.asr.snapshot(),
                "llm": self.llm.snapshot(),
                "heavy": self.heavy.snapshot(),
            },
            "timeouts": {
                "asr": asr_concurrency_timeout().as_secs_f64(),
                "llm": llm_concurrency_timeout().as_secs_f64(),
                "heavy": heavy_concurrency_timeout().as_secs_f64(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let sem = DynamicSemaphore::new(1);
        assert!(sem.acquire(Some(Duration::from_millis(10))).await);
        assert_eq!(sem.snapshot().in_use, 1);
        assert!(!sem.acquire(Some(Duration::from_millis(10))).await);
        sem.release();
        assert!(sem.acquire(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn test_zero_capacity_fails_fast() {
        let sem = DynamicSemaphore::new(0);
        assert!(!sem.acquire(Some(Duration::from_secs(5))).await);
    }

    #[tokio::test]
    async fn test_resize_wakes_blocked_waiter() {
        let sem = std::sync::Arc::new(DynamicSemaphore::new(1));
        assert!(sem.acquire(None).await);

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sem.set_max_value(2);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_resize_to_zero_fails_waiters() {
        let sem = std::sync::Arc::new(DynamicSemaphore::new(1));
        assert!(sem.acquire(None).await);

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sem.set_max_value(0);
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_profile_defaults() {
        let cpu = profile_defaults("cpu", "small");
        assert_eq!(cpu.asr_device, "cpu");
        assert_eq!(cpu.asr_compute_type, "int8");
        assert_eq!(cpu.llm_timeout_seconds, 600);

        let gpu = profile_defaults("gpu", "small");
        assert_eq!(gpu.profile, "gpu_recommended");
        assert_eq!(gpu.asr_device, "cuda");
        assert_eq!(gpu.asr_compute_type, "float16");

        let unknown = profile_defaults("quantum", "small");
        assert_eq!(unknown.profile, "balanced");
    }

    #[test]
    fn test_effective_preferences_merge_and_clamp() {
        let prefs = RuntimePreferences {
            profile: Some("cpu".into()),
            asr_concurrency: Some(-3),
            llm_concurrency: Some(4),
            llm_timeout_seconds: Some(1),
            asr_model: Some("large-v3".into()),
            ..Default::default()
        };
        let eff = effective_preferences(&prefs, "small");
        assert_eq!(eff.asr_concurrency, 0);
        assert_eq!(eff.llm_concurrency, 4);
        assert_eq!(eff.llm_timeout_seconds, 5);
        assert_eq!(eff.asr_model, "large-v3");
        assert_eq!(eff.heavy_concurrency, 1);
    }

    #[tokio::test]
    async fn test_runtime_apply_resizes_limiters() {
        let runtime = Runtime::new("small");
        let prefs = RuntimePreferences {
            llm_concurrency: Some(3),
            ..Default::default()
        };
        let eff = runtime.apply_preferences(&prefs);
        assert_eq!(eff.llm_concurrency, 3);
        assert_eq!(runtime.llm.max_value(), 3);

        let guard = runtime.limit_llm().await.unwrap();
        assert_eq!(runtime.llm.snapshot().in_use, 1);
        drop(guard);
        assert_eq!(runtime.llm.snapshot().in_use, 0);
    }
}
