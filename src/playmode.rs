//! Play-mode operations built on the reload-aware retry policy.

use std::time::Duration;

use serde_json::json;

use crate::ipc::{
    run_transition, wait_for_flag, CommandChannel, ModeTransition, RetryPolicy, TransitionError,
    TransitionOutcome, WaitOutcome,
};

pub const PLAY_COMMAND: &str = "play_game";
pub const STOP_COMMAND: &str = "stop_game";
pub const STATE_COMMAND: &str = "get_editor_state";
pub const PLAYING_FLAG: &str = "isPlaying";

/// Enter play mode and wait until the editor reports `isPlaying == true`.
pub async fn enter_play_mode<C: CommandChannel>(
    channel: &C,
    policy: &RetryPolicy,
) -> Result<TransitionOutcome, TransitionError> {
    let transition = ModeTransition::new(PLAY_COMMAND, PLAYING_FLAG, true)
        .with_params(json!({}))
        .with_status_command(STATE_COMMAND)
        .with_description("Entered play mode");
    run_transition(channel, &transition, policy).await
}

/// Leave play mode and wait until the editor reports `isPlaying == false`.
pub async fn exit_play_mode<C: CommandChannel>(
    channel: &C,
    policy: &RetryPolicy,
) -> Result<TransitionOutcome, TransitionError> {
    let transition = ModeTransition::new(STOP_COMMAND, PLAYING_FLAG, false)
        .with_status_command(STATE_COMMAND)
        .with_description("Exited play mode");
    run_transition(channel, &transition, policy).await
}

/// Poll until play mode matches `playing`, without triggering anything.
pub async fn wait_for_play_state<C: CommandChannel>(
    channel: &C,
    playing: bool,
    max_wait: Option<Duration>,
    poll_interval: Duration,
) -> Result<WaitOutcome, TransitionError> {
    let policy = RetryPolicy {
        max_wait,
        poll_interval,
        ..RetryPolicy::default()
    };
    wait_for_flag(channel, STATE_COMMAND, PLAYING_FLAG, playing, &policy).await
}
