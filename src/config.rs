use anyhow::bail;
use std::time::Duration;

/// The default UDP port a NetTask server binds to.
pub const NETTASK_DEFAULT_PORT: u16 = 24001;

/// All protocol constants in one place. The protocol's semantics do not depend on the
///  concrete values, so they are configurable rather than hard-coded - but all peers should
///  run with compatible timeouts (a keep-alive interval longer than the peer's keep-alive
///  timeout makes the peer declare this side dead during idle periods).
pub struct NetTaskConfig {
    /// Retransmission timeout used before the first RTT sample exists.
    pub initial_timeout: Duration,

    /// Lower bound for retransmission timeouts and for the driver's sleep intervals. This
    ///  exists purely to avoid busy-looping on near-zero-latency loopback links.
    pub min_timeout: Duration,

    /// An idle connection initiator sends a keep-alive once nothing liveness-refreshing was
    ///  sent for this long.
    pub keep_alive_interval: Duration,

    /// A peer that was silent for longer than this is considered dead.
    pub keep_alive_timeout: Duration,

    /// The number of outstanding sequence numbers this side is willing to buffer per
    ///  connection. This is what gets advertised in WINDOW segments.
    pub receive_window_size: u32,

    /// A fresh WINDOW advertisement is sent once this many segments were consumed by the
    ///  application since the last one, so a slow consumer's flow-control grant does not
    ///  go stale. Must be smaller than the window itself to be of any use.
    pub window_update_threshold: u32,

    /// The maximum number of messages buffered per connection while the peer's window is
    ///  exhausted. `send` suspends once this is reached.
    pub max_send_queue_len: usize,

    /// Ceiling for the driver's sleep when no connection has an earlier deadline, so a lost
    ///  connection start is still retried in a timely fashion.
    pub poll_interval: Duration,

    /// Depth of the command channel between API callers and the driver task.
    pub command_channel_depth: usize,
}

impl NetTaskConfig {
    pub fn default_config() -> NetTaskConfig {
        NetTaskConfig {
            initial_timeout: Duration::from_secs(5),
            min_timeout: Duration::from_millis(50),
            keep_alive_interval: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(15),
            receive_window_size: 128,
            window_update_threshold: 64,
            max_send_queue_len: 1024,
            poll_interval: Duration::from_secs(2),
            command_channel_depth: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_timeout.is_zero() {
            bail!("minimum timeout must be positive");
        }
        if self.receive_window_size == 0 {
            bail!("receive window must admit at least one segment");
        }
        if self.window_update_threshold == 0 || self.window_update_threshold > self.receive_window_size {
            bail!("window update threshold must be in 1..=receive_window_size");
        }
        if self.max_send_queue_len == 0 {
            bail!("send queue must hold at least one message");
        }
        if self.keep_alive_interval >= self.keep_alive_timeout {
            bail!("keep-alive interval must be shorter than the keep-alive timeout");
        }
        if self.command_channel_depth == 0 {
            bail!("command channel depth must be positive");
        }
        Ok(())
    }
}
