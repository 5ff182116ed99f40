//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use clinichub_sdk::channel::{ChannelOptions, EventChannel};
use clinichub_sdk::reconnect::ReconnectPolicy;
use clinichub_sdk::transport::memory::MemoryHub;

/// Fast backoff so paused-clock tests stay short.
pub fn fast_options(max_attempts: u32) -> ChannelOptions {
    ChannelOptions {
        policy: ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(100), max_attempts, true),
        handshake_timeout: Duration::from_secs(5),
        jitter: Duration::ZERO,
    }
}

pub fn channel(hub: &MemoryHub) -> EventChannel {
    EventChannel::new("test", Arc::new(hub.connector()), fast_options(5))
}

pub fn channel_with(hub: &MemoryHub, options: ChannelOptions) -> EventChannel {
    EventChannel::new("test", Arc::new(hub.connector()), options)
}

/// Poll `cond` on the (usually paused) tokio clock until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
