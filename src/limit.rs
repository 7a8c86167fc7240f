use crate::store::{CounterStore, StoreError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a limiter counts by. `Ip` and `UserId` get their keys from the
/// request pipeline; the others are for handler-side limits with an
/// explicitly supplied key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Ip,
    UserId,
    Name,
    Phone,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "Ip",
            Self::UserId => "UserId",
            Self::Name => "Name",
            Self::Phone => "Phone",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimitConfig {
    pub limit_type: LimitType,
    pub max_times: i64,
    pub interval: Duration,
}

/// Fixed-window counter over the shared store: every event within one
/// interval shares a single bucket that expires as a whole. The window's
/// expiry is set only when the key did not exist before the increment;
/// two concurrent first events may both set it, which is idempotent.
#[derive(Clone)]
pub struct Limit {
    store: Arc<dyn CounterStore>,
    config: LimitConfig,
}

impl Limit {
    pub fn new(store: Arc<dyn CounterStore>, config: LimitConfig) -> Self {
        Self { store, config }
    }

    pub fn limit_type(&self) -> LimitType {
        self.config.limit_type
    }

    pub fn max_times(&self) -> i64 {
        self.config.max_times
    }

    fn format_key(&self, key: &str) -> String {
        format!("Limit:{}:{}", self.config.limit_type, key)
    }

    /// Record one event. Returns whether the window's cumulative count is
    /// still within bounds; the event that reaches exactly `max_times`
    /// passes, the next one fails.
    pub async fn add(&self, key: &str) -> Result<bool, StoreError> {
        let format_key = self.format_key(key);
        let existed = self.store.exists(&format_key).await?;
        let times = self.store.incr(&format_key).await?;

        if !existed {
            self.store.expire(&format_key, self.config.interval).await?;
        }

        Ok(times <= self.config.max_times)
    }

    /// Remaining allowance, floored at zero. A key with no window yet has
    /// the full allowance.
    pub async fn left(&self, key: &str) -> Result<i64, StoreError> {
        let format_key = self.format_key(key);

        let Some(raw) = self.store.get(&format_key).await? else {
            return Ok(self.config.max_times);
        };

        let times = std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or_else(|| StoreError::NotAnInteger(format_key))?;

        Ok((self.config.max_times - times).max(0))
    }

    /// Drop the window so the next `add` starts fresh.
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let format_key = self.format_key(key);
        self.store.del(&format_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Limit, LimitConfig, LimitType};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn limit(max_times: i64, interval: Duration) -> Limit {
        Limit::new(
            Arc::new(MemoryStore::new()),
            LimitConfig {
                limit_type: LimitType::Ip,
                max_times,
                interval,
            },
        )
    }

    #[tokio::test]
    async fn allows_until_max_then_rejects() {
        let limit = limit(2, Duration::from_secs(60));

        assert!(limit.add("1.2.3.4").await.expect("add"));
        assert!(limit.add("1.2.3.4").await.expect("add"));
        assert!(!limit.add("1.2.3.4").await.expect("add"));
    }

    #[tokio::test]
    async fn window_expiry_opens_a_fresh_bucket() {
        let limit = limit(1, Duration::from_millis(30));

        assert!(limit.add("1.2.3.4").await.expect("add"));
        assert!(!limit.add("1.2.3.4").await.expect("add"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limit.add("1.2.3.4").await.expect("add"));
    }

    #[tokio::test]
    async fn left_tracks_successful_adds() {
        let limit = limit(3, Duration::from_secs(60));

        assert_eq!(limit.left("1.2.3.4").await.expect("left"), 3);
        limit.add("1.2.3.4").await.expect("add");
        assert_eq!(limit.left("1.2.3.4").await.expect("left"), 2);
        limit.add("1.2.3.4").await.expect("add");
        limit.add("1.2.3.4").await.expect("add");
        assert_eq!(limit.left("1.2.3.4").await.expect("left"), 0);

        // Rejected events still count but the allowance never goes negative.
        limit.add("1.2.3.4").await.expect("add");
        assert_eq!(limit.left("1.2.3.4").await.expect("left"), 0);
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let limit = limit(1, Duration::from_secs(60));

        assert!(limit.add("1.2.3.4").await.expect("add"));
        assert!(!limit.add("1.2.3.4").await.expect("add"));

        limit.reset("1.2.3.4").await.expect("reset");
        assert!(limit.add("1.2.3.4").await.expect("add"));
    }

    #[tokio::test]
    async fn keys_are_isolated_by_type_and_value() {
        let store = Arc::new(MemoryStore::new());
        let by_ip = Limit::new(
            store.clone(),
            LimitConfig {
                limit_type: LimitType::Ip,
                max_times: 1,
                interval: Duration::from_secs(60),
            },
        );
        let by_name = Limit::new(
            store,
            LimitConfig {
                limit_type: LimitType::Name,
                max_times: 1,
                interval: Duration::from_secs(60),
            },
        );

        assert!(by_ip.add("alice").await.expect("add"));
        assert!(by_name.add("alice").await.expect("add"));
        assert!(by_ip.add("bob").await.expect("add"));
        assert!(!by_ip.add("alice").await.expect("add"));
    }
}
