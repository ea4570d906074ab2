use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Capacity of each subscriber's event queue. A subscriber that falls
    /// further behind than this drops new events instead of blocking the
    /// producer.
    #[serde(default = "d_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: d_subscriber_buffer(),
        }
    }
}

fn d_subscriber_buffer() -> usize {
    1024
}
