//! Trigger repository trait.

use chrono::{DateTime, Utc};
use dagflow_types::error::RepositoryError;
use dagflow_types::trigger::{NewTrigger, Trigger, TriggerKind, TriggerScope};

/// Repository trait for trigger registrations.
pub trait TriggerRepository: Send + Sync {
    /// Insert or re-activate the trigger identified by
    /// `(scope, kind, target)`. Idempotent.
    fn upsert_trigger(
        &self,
        new: &NewTrigger,
    ) -> impl std::future::Future<Output = Result<Trigger, RepositoryError>> + Send;

    /// Mark every active trigger inside `scope` inactive. `None` fields of
    /// the scope match anything. Returns the number deactivated.
    fn deactivate_triggers(
        &self,
        scope: &TriggerScope,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn get_trigger(
        &self,
        trigger_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<Trigger>, RepositoryError>> + Send;

    /// Active triggers, optionally filtered by kind and target.
    fn list_active_triggers(
        &self,
        kind: Option<TriggerKind>,
        target: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Trigger>, RepositoryError>> + Send;

    /// Every trigger (any status) inside `scope`.
    fn list_triggers(
        &self,
        scope: &TriggerScope,
    ) -> impl std::future::Future<Output = Result<Vec<Trigger>, RepositoryError>> + Send;

    fn record_trigger_fire(
        &self,
        trigger_id: i64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
