use std::sync::Arc;

use error_stack::{Report, ResultExt, bail};

use crate::config::LimitsConfig;
use crate::error::StoreError;
use crate::model::{ExchangeKind, MarketType, Subscription, Tier, TimeFrame, User};
use crate::storage::Storage;

/// Business-rule layer over `Storage`: subscription/alert caps by tier,
/// disabled-user gating, and default preference management. The core only
/// needs this much of the admin/tier surface — the chat command parsing and
/// billing flows around it are peripheral.
pub struct SubscriptionStore {
    storage: Arc<dyn Storage>,
    limits: LimitsConfig,
}

impl SubscriptionStore {
    pub fn new(storage: Arc<dyn Storage>, limits: LimitsConfig) -> Self {
        Self { storage, limits }
    }

    fn subscription_limit(&self, tier: Tier) -> usize {
        match tier {
            Tier::Free => self.limits.free_subscription_limit,
            Tier::Premium => self.limits.premium_subscription_limit,
            Tier::Admin => usize::MAX,
        }
    }

    fn alert_limit(&self, tier: Tier) -> usize {
        match tier {
            Tier::Free => self.limits.free_alert_limit,
            Tier::Premium => self.limits.premium_alert_limit,
            Tier::Admin => usize::MAX,
        }
    }

    async fn require_enabled_user(&self, chat_id: i64) -> Result<User, Report<StoreError>> {
        let user = self
            .storage
            .get_user(chat_id)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })?
            .ok_or(StoreError::NotAllowed { chat_id })?;
        if !user.enabled {
            bail!(StoreError::NotAllowed { chat_id });
        }
        Ok(user)
    }

    /// Register (or update) a user with default preferences, enabled.
    pub async fn register_user(
        &self,
        chat_id: i64,
        default_exchange: ExchangeKind,
        market_type: MarketType,
    ) -> Result<(), Report<StoreError>> {
        let user = User {
            chat_id,
            tier: Tier::Free,
            enabled: true,
            tier_expires_at: None,
            default_exchange,
            market_type,
        };
        self.storage
            .upsert_user(&user)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Insert,
            })
    }

    /// Subscribe a user to `(symbol, timeframe)`, idempotent, enforcing the
    /// tier's subscription cap on genuinely new subscriptions.
    pub async fn subscribe(
        &self,
        chat_id: i64,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<(), Report<StoreError>> {
        let user = self.require_enabled_user(chat_id).await?;
        let existing = self
            .storage
            .list_subscriptions(chat_id)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })?;
        let already_subscribed = existing
            .iter()
            .any(|s| s.symbol.eq_ignore_ascii_case(symbol) && s.timeframe == timeframe);

        if !already_subscribed {
            let limit = self.subscription_limit(user.tier);
            if existing.len() >= limit {
                bail!(StoreError::LimitExceeded {
                    limit_name: "subscriptions".into(),
                    current: existing.len(),
                    max: limit,
                });
            }
        }

        self.storage
            .add_subscription(&Subscription {
                chat_id,
                symbol: symbol.to_owned(),
                timeframe,
            })
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Insert,
            })
    }

    pub async fn unsubscribe(
        &self,
        chat_id: i64,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<(), Report<StoreError>> {
        self.require_enabled_user(chat_id).await?;
        self.storage
            .remove_subscription(chat_id, symbol, timeframe)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })
    }

    pub async fn subscriptions(&self, chat_id: i64) -> Result<Vec<Subscription>, Report<StoreError>> {
        self.storage
            .list_subscriptions(chat_id)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })
    }

    /// Add a price alert, enforcing the tier's alert cap.
    pub async fn add_alert(
        &self,
        alert: &crate::model::PriceAlert,
    ) -> Result<i64, Report<StoreError>> {
        let user = self.require_enabled_user(alert.chat_id).await?;
        let current = self
            .storage
            .count_alerts(alert.chat_id)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })?;
        let limit = self.alert_limit(user.tier);
        if current >= limit {
            bail!(StoreError::LimitExceeded {
                limit_name: "alerts".into(),
                current,
                max: limit,
            });
        }
        self.storage.add_alert(alert).await.change_context(StoreError::Storage {
            source: crate::error::StorageError::Insert,
        })
    }

    /// Read a free-form per-user preference (e.g. notification markdown
    /// formatting). Returns `None` if unset.
    pub async fn get_preference(
        &self,
        chat_id: i64,
        key: &str,
    ) -> Result<Option<String>, Report<StoreError>> {
        self.require_enabled_user(chat_id).await?;
        self.storage
            .get_preference(chat_id, key)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Query,
            })
    }

    pub async fn set_preference(
        &self,
        chat_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), Report<StoreError>> {
        self.require_enabled_user(chat_id).await?;
        self.storage
            .set_preference(chat_id, key, value)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Insert,
            })
    }

    /// Change a user's tier, recording the change in `subscription_history`.
    /// Insertion point for the (peripheral, out-of-core) billing flow; this
    /// signature covers a plain tier flip. `record_tier_payment` covers
    /// payment-carrying changes (renewals, upgrades).
    pub async fn set_tier(
        &self,
        chat_id: i64,
        tier: Tier,
        reason: Option<&str>,
    ) -> Result<(), Report<StoreError>> {
        self.set_tier_with_payment(chat_id, tier, "tier_change", None, None, None, reason)
            .await
    }

    /// Change a user's tier, recording a full billing audit row — used by
    /// the payment/renewal flow where duration and payment details matter.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_tier_with_payment(
        &self,
        chat_id: i64,
        tier: Tier,
        action: &str,
        duration_days: Option<i64>,
        payment_amount: Option<f64>,
        payment_method: Option<&str>,
        notes: Option<&str>,
    ) -> Result<(), Report<StoreError>> {
        let mut user = self.require_enabled_user(chat_id).await?;
        user.tier = tier;
        self.storage
            .upsert_user(&user)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Insert,
            })?;
        let event = crate::model::TierChange {
            chat_id,
            tier,
            action: action.to_owned(),
            duration_days,
            payment_amount,
            payment_method: payment_method.map(str::to_owned),
            notes: notes.map(str::to_owned),
        };
        self.storage
            .record_tier_event(&event)
            .await
            .change_context(StoreError::Storage {
                source: crate::error::StorageError::Insert,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            free_subscription_limit: 2,
            free_alert_limit: 1,
            premium_subscription_limit: 20,
            premium_alert_limit: 20,
        }
    }

    async fn test_store() -> (SubscriptionStore, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("store-test-{}.db", uuid::Uuid::new_v4()));
        let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
        (SubscriptionStore::new(storage, limits()), path)
    }

    #[tokio::test]
    async fn subscribe_rejects_disabled_user_before_registration() {
        let (store, path) = test_store().await;
        let result = store.subscribe(1, "BTCUSDT", TimeFrame::Hour1).await;
        assert!(result.is_err());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn subscribe_enforces_free_tier_cap() {
        let (store, path) = test_store().await;
        store.register_user(1, ExchangeKind::Binance, MarketType::Spot).await.unwrap();
        store.subscribe(1, "BTCUSDT", TimeFrame::Hour1).await.unwrap();
        store.subscribe(1, "ETHUSDT", TimeFrame::Hour1).await.unwrap();
        let third = store.subscribe(1, "SOLUSDT", TimeFrame::Hour1).await;
        assert!(third.is_err());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_does_not_count_twice() {
        let (store, path) = test_store().await;
        store.register_user(1, ExchangeKind::Binance, MarketType::Spot).await.unwrap();
        store.subscribe(1, "BTCUSDT", TimeFrame::Hour1).await.unwrap();
        store.subscribe(1, "BTCUSDT", TimeFrame::Hour1).await.unwrap();
        let subs = store.subscriptions(1).await.unwrap();
        assert_eq!(subs.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn preference_round_trip_and_default_none() {
        let (store, path) = test_store().await;
        store.register_user(1, ExchangeKind::Binance, MarketType::Spot).await.unwrap();
        assert_eq!(store.get_preference(1, "parse_markdown").await.unwrap(), None);
        store.set_preference(1, "parse_markdown", "false").await.unwrap();
        assert_eq!(
            store.get_preference(1, "parse_markdown").await.unwrap(),
            Some("false".into())
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn set_tier_updates_user_and_is_visible_on_next_lookup() {
        let (store, path) = test_store().await;
        store.register_user(1, ExchangeKind::Binance, MarketType::Spot).await.unwrap();
        store.set_tier(1, Tier::Premium, Some("promo")).await.unwrap();
        for i in 0..25 {
            store.subscribe(1, &format!("SYM{i}USDT"), TimeFrame::Hour1).await.unwrap();
        }
        std::fs::remove_file(&path).ok();
    }
}
