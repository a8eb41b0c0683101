//! Reload-aware retry policy for editor mode transitions.
//!
//! Entering or leaving play mode makes the Unity editor reload its scripting
//! domain, which kills the bridge socket mid-command. A transition therefore
//! fires its trigger command, rides out the disconnect by reconnecting on a
//! fixed interval, then polls a status command until the state flag reaches
//! the target value.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::ipc::connection::CommandChannel;
use crate::ipc::error::ChannelError;
use crate::ipc::extract::find_flag_container;

/// Status command every editor package answers.
pub const DEFAULT_STATUS_COMMAND: &str = "get_editor_state";

/// Timing knobs for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Grace period after a transient trigger failure before reconnecting.
    pub initial_delay: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Pause between status polls.
    pub poll_interval: Duration,
    /// Overall deadline. `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(250),
            max_wait: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// A trigger command plus the state it should lead to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeTransition {
    pub trigger: String,
    pub trigger_params: Value,
    pub status_command: String,
    /// Boolean field searched for in status replies.
    pub flag: String,
    pub target: bool,
    /// Fallback message when the trigger reply carries none.
    pub description: String,
}

impl ModeTransition {
    pub fn new(trigger: impl Into<String>, flag: impl Into<String>, target: bool) -> Self {
        let trigger = trigger.into();
        let flag = flag.into();
        Self {
            description: format!("{} completed ({} = {})", trigger, flag, target),
            trigger,
            trigger_params: json!({}),
            status_command: DEFAULT_STATUS_COMMAND.to_string(),
            flag,
            target,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.trigger_params = params;
        self
    }

    pub fn with_status_command(mut self, command: impl Into<String>) -> Self {
        self.status_command = command.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Result of a completed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    /// Trigger reply, absent when the trigger's connection dropped.
    pub trigger_result: Option<Value>,
    /// The object in the status reply that held the flag.
    pub state: Value,
    pub reconnected: bool,
    pub reconnect_attempts: u32,
    pub polls: u32,
    pub waited_ms: u64,
    pub message: String,
}

/// Result of a poll-only wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOutcome {
    pub reached: bool,
    /// Last state object seen, `Null` if none was.
    pub state: Value,
    pub waited_ms: u64,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("Timed out waiting to reconnect after {waited_ms}ms ({attempts} attempts): {last_error}")]
    ReconnectTimeout {
        waited_ms: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Timed out waiting for {flag} == {target} after {waited_ms}ms")]
    StateTimeout {
        flag: String,
        target: bool,
        waited_ms: u64,
        last_state: Option<Value>,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl TransitionError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransitionError::ReconnectTimeout { .. } | TransitionError::StateTimeout { .. } => true,
            TransitionError::Channel(err) => err.is_timeout(),
        }
    }
}

/// Deadline bookkeeping shared by one transition run.
struct Clock {
    started: Instant,
    deadline: Option<Instant>,
}

impl Clock {
    fn start(max_wait: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            // An unrepresentable deadline is no deadline.
            deadline: max_wait.and_then(|wait| started.checked_add(wait)),
        }
    }

    fn waited_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleep for `duration`, cut short at the deadline.
    async fn pause(&self, duration: Duration) {
        match self.deadline {
            Some(deadline) => {
                let wake = match Instant::now().checked_add(duration) {
                    Some(wake) => wake.min(deadline),
                    None => deadline,
                };
                tokio::time::sleep_until(wake).await
            }
            None => sleep(duration).await,
        }
    }

    /// Run `call`, giving up at the deadline. `None` means the deadline won.
    async fn bounded<T>(&self, call: impl Future<Output = T>) -> Option<T> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
            None => Some(call.await),
        }
    }
}

struct Progress {
    reconnected: bool,
    reconnect_attempts: u32,
    polls: u32,
}

/// Fire `transition.trigger` and wait until the editor reports
/// `flag == target`, reconnecting through any domain reload in between.
///
/// # Errors
///
/// - `TransitionError::Channel` for editor-reported failures and other
///   non-transient channel errors
/// - `TransitionError::ReconnectTimeout` when `max_wait` runs out while
///   reconnecting
/// - `TransitionError::StateTimeout` when `max_wait` runs out before the
///   flag reaches the target
pub async fn run_transition<C: CommandChannel>(
    channel: &C,
    transition: &ModeTransition,
    policy: &RetryPolicy,
) -> Result<TransitionOutcome, TransitionError> {
    let clock = Clock::start(policy.max_wait);
    let mut progress = Progress {
        reconnected: false,
        reconnect_attempts: 0,
        polls: 0,
    };

    info!("Sending {}", transition.trigger);
    let trigger = clock
        .bounded(channel.invoke(&transition.trigger, transition.trigger_params.clone()))
        .await;

    let trigger_result = match trigger {
        Some(Ok(result)) => Some(result),
        Some(Err(err)) if err.is_transient() => {
            info!(
                "{} interrupted ({}); waiting for the editor to come back",
                transition.trigger, err
            );
            clock.pause(policy.initial_delay).await;
            await_reconnect(channel, policy, &clock, &mut progress, &err.to_string()).await?;
            None
        }
        Some(Err(err)) => return Err(err.into()),
        None => return Err(state_timeout(transition, &clock, None)),
    };

    let state = poll_until(channel, transition, policy, &clock, &mut progress).await?;

    let mut message = trigger_result
        .as_ref()
        .and_then(|result| result.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| transition.description.clone());
    if progress.reconnected {
        message.push_str(" (reconnected after editor reload)");
    }

    let outcome = TransitionOutcome {
        trigger_result,
        state,
        reconnected: progress.reconnected,
        reconnect_attempts: progress.reconnect_attempts,
        polls: progress.polls,
        waited_ms: clock.waited_ms(),
        message,
    };
    info!(
        "{} done after {}ms ({} polls, {} reconnect attempts)",
        transition.trigger, outcome.waited_ms, outcome.polls, outcome.reconnect_attempts
    );
    Ok(outcome)
}

/// Poll `status_command` until `flag == target` or `max_wait` runs out.
///
/// Timing out is not an error here: the outcome reports `reached: false`
/// with the last state seen. Non-transient channel errors are returned.
pub async fn wait_for_flag<C: CommandChannel>(
    channel: &C,
    status_command: &str,
    flag: &str,
    target: bool,
    policy: &RetryPolicy,
) -> Result<WaitOutcome, TransitionError> {
    let clock = Clock::start(policy.max_wait);
    let mut progress = Progress {
        reconnected: false,
        reconnect_attempts: 0,
        polls: 0,
    };
    let transition = ModeTransition::new(status_command, flag, target)
        .with_status_command(status_command);

    match poll_until(channel, &transition, policy, &clock, &mut progress).await {
        Ok(state) => Ok(WaitOutcome {
            reached: true,
            state,
            waited_ms: clock.waited_ms(),
            polls: progress.polls,
        }),
        Err(TransitionError::StateTimeout { last_state, .. }) => Ok(WaitOutcome {
            reached: false,
            state: last_state.unwrap_or(Value::Null),
            waited_ms: clock.waited_ms(),
            polls: progress.polls,
        }),
        Err(TransitionError::ReconnectTimeout { .. }) => Ok(WaitOutcome {
            reached: false,
            state: Value::Null,
            waited_ms: clock.waited_ms(),
            polls: progress.polls,
        }),
        Err(err) => Err(err),
    }
}

async fn await_reconnect<C: CommandChannel>(
    channel: &C,
    policy: &RetryPolicy,
    clock: &Clock,
    progress: &mut Progress,
    cause: &str,
) -> Result<(), TransitionError> {
    let mut last_error = cause.to_string();
    loop {
        if clock.expired() {
            return Err(TransitionError::ReconnectTimeout {
                waited_ms: clock.waited_ms(),
                attempts: progress.reconnect_attempts,
                last_error,
            });
        }

        progress.reconnect_attempts += 1;
        match clock.bounded(channel.connect()).await {
            Some(Ok(())) => {
                progress.reconnected = true;
                info!("Reconnected after {} attempt(s)", progress.reconnect_attempts);
                return Ok(());
            }
            Some(Err(err)) => {
                debug!("Reconnect attempt {} failed: {}", progress.reconnect_attempts, err);
                last_error = err.to_string();
            }
            None => last_error = "connect attempt cut off by deadline".to_string(),
        }
        clock.pause(policy.reconnect_interval).await;
    }
}

async fn poll_until<C: CommandChannel>(
    channel: &C,
    transition: &ModeTransition,
    policy: &RetryPolicy,
    clock: &Clock,
    progress: &mut Progress,
) -> Result<Value, TransitionError> {
    let mut last_state: Option<Value> = None;
    loop {
        if clock.expired() {
            return Err(state_timeout(transition, clock, last_state));
        }
        if !channel.is_connected() {
            await_reconnect(channel, policy, clock, progress, "not connected").await?;
        }

        let reply = match clock
            .bounded(channel.invoke(&transition.status_command, json!({})))
            .await
        {
            Some(reply) => reply,
            None => return Err(state_timeout(transition, clock, last_state)),
        };
        progress.polls += 1;

        match reply {
            Ok(reply) => {
                if let Some(container) = find_flag_container(&reply, &transition.flag) {
                    if container.get(&transition.flag).and_then(Value::as_bool)
                        == Some(transition.target)
                    {
                        return Ok(container.clone());
                    }
                    last_state = Some(container.clone());
                }
                debug!(
                    "Poll {}: {} not yet {}",
                    progress.polls, transition.flag, transition.target
                );
            }
            Err(err) if err.is_transient() => {
                debug!("Poll {} failed ({}); reconnecting", progress.polls, err);
                await_reconnect(channel, policy, clock, progress, &err.to_string()).await?;
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        clock.pause(policy.poll_interval).await;
    }
}

fn state_timeout(
    transition: &ModeTransition,
    clock: &Clock,
    last_state: Option<Value>,
) -> TransitionError {
    TransitionError::StateTimeout {
        flag: transition.flag.clone(),
        target: transition.target,
        waited_ms: clock.waited_ms(),
        last_state,
    }
}
