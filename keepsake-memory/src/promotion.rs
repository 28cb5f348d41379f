//! Promotion of ephemeral items into the durable tier

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DurableDeletePolicy, PromotionConfig};
use crate::error::{Error, Result};
use crate::memory::{ContentItem, ContentType, ListFilter, MemoryStore, Tier};

/// Why an item qualifies. Any one reason is enough.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "criterion", rename_all = "snake_case")]
pub enum PromotionReason {
    Importance { importance: f32, threshold: f32 },
    RetrievalCount { count: u32, threshold: u32 },
    AgeAndImportance { age_days: i64, importance: f32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionCandidate {
    pub item: ContentItem,
    /// Stored importance re-scored for current age and retrieval count
    pub effective_importance: f32,
    pub reasons: Vec<PromotionReason>,
}

/// Result of promoting one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionOutcome {
    pub ephemeral_id: String,
    pub durable_id: String,
    pub path: PathBuf,
    /// The item had been promoted before; nothing was written
    pub already_promoted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoPromoteReport {
    pub dry_run: bool,
    pub candidates: Vec<String>,
    pub promoted: Vec<PromotionOutcome>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Durable records dropped because their file is gone
    pub detached: Vec<String>,
    /// Original ids brought back into the ephemeral tier under `detach`
    pub restored: Vec<String>,
    /// Ephemeral shadows deleted under the cascade policy
    pub cascaded: Vec<String>,
}

/// Decide eligibility. The three criteria are OR'd.
pub fn evaluate(
    rules: &PromotionConfig,
    item: &ContentItem,
    effective_importance: f32,
    now: DateTime<Utc>,
) -> Vec<PromotionReason> {
    let mut reasons = Vec::new();
    let meta = &item.metadata;

    if effective_importance >= rules.importance_threshold {
        reasons.push(PromotionReason::Importance {
            importance: effective_importance,
            threshold: rules.importance_threshold,
        });
    }
    if meta.retrieval_count > rules.retrieval_count_threshold {
        reasons.push(PromotionReason::RetrievalCount {
            count: meta.retrieval_count,
            threshold: rules.retrieval_count_threshold,
        });
    }
    let age_days = item.age(now).num_days();
    if age_days >= rules.age_importance_days && effective_importance >= rules.age_importance_score {
        reasons.push(PromotionReason::AgeAndImportance {
            age_days,
            importance: effective_importance,
        });
    }
    reasons
}

pub struct PromotionEngine {
    store: Arc<MemoryStore>,
}

impl PromotionEngine {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    fn rules(&self) -> &PromotionConfig {
        &self.store.config().promotion
    }

    /// Ephemeral items of promotable types that meet at least one criterion,
    /// most important first.
    pub fn scan(&self, filter: &ListFilter) -> Result<Vec<PromotionCandidate>> {
        let now = Utc::now();
        let limit = filter.limit;
        let filter = ListFilter {
            tier: Some(Tier::Ephemeral),
            include_promoted: false,
            limit: None,
            ..filter.clone()
        };

        let mut candidates: Vec<PromotionCandidate> = self
            .store
            .list(&filter)?
            .into_iter()
            .filter(|item| item.metadata.item_type.is_promotable())
            .filter_map(|item| {
                let effective_importance = self.store.scorer().rescore(&item, now);
                let reasons = evaluate(self.rules(), &item, effective_importance, now);
                (!reasons.is_empty()).then_some(PromotionCandidate {
                    item,
                    effective_importance,
                    reasons,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.effective_importance
                .partial_cmp(&a.effective_importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    /// Move one item to the durable tier. Promoting an already-promoted item
    /// returns the existing path.
    pub async fn promote(&self, id: &str) -> Result<PromotionOutcome> {
        let sqlite = self.store.sqlite();

        if let Some(target_id) = sqlite.resolve_alias(id)? {
            if let Some(target) = sqlite.get_item(&target_id)? {
                if let Some(path) = target.durable_path {
                    debug!(item_id = %id, durable_id = %target_id, "already promoted");
                    return Ok(PromotionOutcome {
                        ephemeral_id: id.to_string(),
                        durable_id: target_id,
                        path,
                        already_promoted: true,
                    });
                }
            }
        }

        let item = sqlite
            .get_item(id)?
            .ok_or_else(|| Error::not_found(format!("id '{}'", id)))?;

        if !item.metadata.item_type.is_promotable() {
            return Err(Error::UnsupportedPromotion {
                item_type: item.metadata.item_type.to_string(),
            });
        }

        if item.tier == Tier::Durable {
            let path = item
                .durable_path
                .clone()
                .unwrap_or_else(|| self.store.durable().path_for(&item));
            return Ok(PromotionOutcome {
                ephemeral_id: item.promoted_from.clone().unwrap_or_else(|| item.id.clone()),
                durable_id: item.id,
                path,
                already_promoted: true,
            });
        }

        let now = Utc::now();
        let durable_id = self.durable_id_for(&item)?;
        let mut durable = ContentItem {
            id: durable_id.clone(),
            tier: Tier::Durable,
            promoted_from: Some(item.id.clone()),
            promoted_at: Some(now),
            durable_path: None,
            ..item.clone()
        };
        durable.metadata.modified_at = now;

        let path = self.store.durable().path_for(&durable);
        self.store.durable().write(&durable, &path)?;
        durable.durable_path = Some(path.clone());

        let drop_ephemeral = !self.rules().keep_ephemeral_copy;
        if let Err(e) = sqlite.commit_promotion(&durable, &item.id, drop_ephemeral) {
            // No half-promoted state: the file goes if the index did not move
            if let Err(cleanup) = self.store.durable().remove(&path) {
                warn!(path = %path.display(), error = %cleanup, "failed to clean up durable file");
            }
            return Err(e);
        }

        self.store.index_item(&durable).await;
        if drop_ephemeral {
            self.store.unindex(&item.id).await;
        }

        info!(
            item_id = %item.id,
            durable_id = %durable_id,
            path = %self.store.durable().display_path(&path),
            "promoted item"
        );

        Ok(PromotionOutcome {
            ephemeral_id: item.id,
            durable_id,
            path,
            already_promoted: false,
        })
    }

    /// `memory:<slug>`, suffixed when an unrelated item already owns the id
    fn durable_id_for(&self, item: &ContentItem) -> Result<String> {
        let base = format!("{}:{}", ContentType::Memory, item.slug());
        let mut candidate = base.clone();
        let mut n = 2;
        while let Some(existing) = self.store.sqlite().get_item(&candidate)? {
            if existing.promoted_from.as_deref() == Some(item.id.as_str()) {
                break;
            }
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        Ok(candidate)
    }

    /// Promote every eligible item, or with `dry_run` only report them
    pub async fn auto_promote(&self, filter: &ListFilter, dry_run: bool) -> Result<AutoPromoteReport> {
        let candidates = self.scan(filter)?;
        let mut report = AutoPromoteReport {
            dry_run,
            candidates: candidates.iter().map(|c| c.item.id.clone()).collect(),
            ..Default::default()
        };
        if dry_run {
            return Ok(report);
        }

        for candidate in candidates {
            match self.promote(&candidate.item.id).await {
                Ok(outcome) => report.promoted.push(outcome),
                Err(e) => {
                    warn!(item_id = %candidate.item.id, error = %e, "auto-promotion failed");
                    report.failed.push((candidate.item.id, e.to_string()));
                }
            }
        }

        info!(
            promoted = report.promoted.len(),
            failed = report.failed.len(),
            "auto-promotion complete"
        );
        Ok(report)
    }

    /// Apply the durable-delete policy to durable items whose file is gone
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let policy = self.rules().on_durable_delete;
        let durable_items = self.store.list(&ListFilter {
            tier: Some(Tier::Durable),
            include_promoted: true,
            sort_by: crate::memory::SortBy::None,
            ..Default::default()
        })?;

        let mut report = ReconcileReport::default();
        for item in durable_items {
            let missing = item.durable_path.as_ref().is_some_and(|p| !p.exists());
            if !missing {
                continue;
            }

            let sqlite = self.store.sqlite();
            let shadow = match &item.promoted_from {
                Some(original) => sqlite.get_item(original)?,
                None => None,
            };

            match policy {
                DurableDeletePolicy::Detach => {
                    // No kept copy: the durable record becomes the ephemeral item again
                    let restored = match (&item.promoted_from, &shadow) {
                        (Some(original), None) => Some(ContentItem {
                            id: original.clone(),
                            tier: Tier::Ephemeral,
                            durable_path: None,
                            promoted_from: None,
                            promoted_at: None,
                            ..item.clone()
                        }),
                        _ => None,
                    };
                    sqlite.detach_promotion(&item.id, restored.as_ref())?;
                    self.store.unindex(&item.id).await;
                    if let Some(restored) = restored {
                        self.store.index_item(&restored).await;
                        report.restored.push(restored.id);
                    }
                }
                DurableDeletePolicy::Cascade => {
                    sqlite.delete_item(&item.id)?;
                    self.store.unindex(&item.id).await;
                    if let Some(shadow) = shadow {
                        sqlite.delete_item(&shadow.id)?;
                        self.store.unindex(&shadow.id).await;
                        report.cascaded.push(shadow.id);
                    }
                }
            }
            report.detached.push(item.id);
        }

        if !report.detached.is_empty() {
            info!(
                detached = report.detached.len(),
                restored = report.restored.len(),
                cascaded = report.cascaded.len(),
                policy = ?policy,
                "reconciled deleted durable files"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashingEmbedder;
    use crate::memory::{Lookup, ProjectContext, Scope, StoreRequest};
    use chrono::Duration;
    use tempfile::TempDir;

    async fn engine_with(dir: &TempDir, tweak: impl FnOnce(&mut Config)) -> (Arc<MemoryStore>, PromotionEngine) {
        let mut config = Config::with_data_dir(dir.path());
        tweak(&mut config);
        let store = Arc::new(
            MemoryStore::with_embedder(config, Arc::new(HashingEmbedder::new(64)))
                .await
                .unwrap(),
        );
        (store.clone(), PromotionEngine::new(store))
    }

    fn stored(item_type: ContentType, importance: f32, count: u32, age_days: i64) -> ContentItem {
        let now = Utc::now();
        let mut item = ContentItem {
            id: format!("{}:x", item_type),
            name: None,
            tier: Tier::Ephemeral,
            content: "content".to_string(),
            metadata: crate::memory::ItemMetadata {
                item_type,
                tags: Default::default(),
                importance,
                retrieval_count: count,
                created_at: now - Duration::days(age_days),
                modified_at: now,
                last_retrieved_at: None,
                project: ProjectContext::default(),
                relevant_files: Vec::new(),
                scope: None,
            },
            durable_path: None,
            promoted_from: None,
            promoted_at: None,
        };
        item.metadata.tags.insert("t".to_string());
        item
    }

    #[test]
    fn criteria_are_ored() {
        let rules = PromotionConfig::default();
        let now = Utc::now();

        let important = stored(ContentType::Observation, 0.9, 0, 0);
        assert_eq!(evaluate(&rules, &important, 0.9, now).len(), 1);

        let popular = stored(ContentType::Observation, 0.1, 4, 0);
        assert!(matches!(
            evaluate(&rules, &popular, 0.1, now).as_slice(),
            [PromotionReason::RetrievalCount { count: 4, .. }]
        ));

        let at_threshold = stored(ContentType::Observation, 0.1, 3, 0);
        assert!(evaluate(&rules, &at_threshold, 0.1, now).is_empty());

        let aged = stored(ContentType::Observation, 0.55, 0, 8);
        assert!(matches!(
            evaluate(&rules, &aged, 0.55, now).as_slice(),
            [PromotionReason::AgeAndImportance { .. }]
        ));

        let young = stored(ContentType::Observation, 0.55, 0, 2);
        assert!(evaluate(&rules, &young, 0.55, now).is_empty());
    }

    #[tokio::test]
    async fn promote_moves_item_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = engine_with(&dir, |_| {}).await;

        let item = store
            .store(
                StoreRequest::new(ContentType::Decision, "Adopt trunk-based development")
                    .with_name("trunk based")
                    .with_importance(0.9),
            )
            .await
            .unwrap();

        let first = engine.promote(&item.id).await.unwrap();
        assert!(!first.already_promoted);
        assert_eq!(first.durable_id, "memory:trunk-based");
        assert!(first.path.ends_with("decisions/trunk-based.md"));
        assert!(first.path.exists());

        let second = engine.promote(&item.id).await.unwrap();
        assert!(second.already_promoted);
        assert_eq!(second.path, first.path);

        let resolved = store.retrieve(Lookup::Id(&item.id)).unwrap();
        assert_eq!(resolved.tier, Tier::Durable);
        assert_eq!(resolved.promoted_from.as_deref(), Some(item.id.as_str()));

        // The ephemeral row is gone by default
        let ephemeral = store
            .list(&ListFilter {
                tier: Some(Tier::Ephemeral),
                include_promoted: true,
                ..Default::default()
            })
            .unwrap();
        assert!(ephemeral.is_empty());
    }

    #[tokio::test]
    async fn unsupported_types_are_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = engine_with(&dir, |_| {}).await;

        for item_type in [ContentType::Note, ContentType::Plan, ContentType::Hint] {
            let item = store
                .store(StoreRequest::new(item_type, "some text").with_importance(0.95))
                .await
                .unwrap();
            let result = engine.promote(&item.id).await;
            assert!(matches!(result, Err(Error::UnsupportedPromotion { .. })));
            assert_eq!(
                store.peek(Lookup::Id(&item.id)).unwrap().unwrap().tier,
                Tier::Ephemeral
            );
        }
        assert!(std::fs::read_dir(store.config().durable_root())
            .unwrap()
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn project_scoped_items_nest_under_project_dir() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = engine_with(&dir, |_| {}).await;
        let item = store
            .store(
                StoreRequest::new(ContentType::Pattern, "Handlers return typed errors")
                    .with_name("typed errors")
                    .with_importance(0.85)
                    .with_scope(Scope::Project)
                    .with_project(ProjectContext {
                        project_dir: Some("/src/api-server".to_string()),
                        branch: None,
                    }),
            )
            .await
            .unwrap();

        let outcome = engine.promote(&item.id).await.unwrap();
        assert!(outcome
            .path
            .ends_with("patterns/projects/api-server/typed-errors.md"));
    }

    #[tokio::test]
    async fn scan_and_dry_run_do_not_write() {
        let dir = TempDir::new().unwrap();
        let (store, engine) = engine_with(&dir, |_| {}).await;

        let eligible = store
            .store(StoreRequest::new(ContentType::Learning, "Pin the toolchain").with_importance(0.9))
            .await
            .unwrap();
        store
            .store(StoreRequest::new(ContentType::Learning, "Minor detail").with_importance(0.2))
            .await
            .unwrap();
        store
            .store(StoreRequest::new(ContentType::Note, "Unpromotable").with_importance(0.99))
            .await
            .unwrap();

        let candidates = engine.scan(&ListFilter::default()).unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.item.id.as_str()).collect();
        assert_eq!(ids, vec![eligible.id.as_str()]);

        let report = engine.auto_promote(&ListFilter::default(), true).await.unwrap();
        assert_eq!(report.candidates, vec![eligible.id.clone()]);
        assert!(report.promoted.is_empty());
        assert_eq!(
            store.peek(Lookup::Id(&eligible.id)).unwrap().unwrap().tier,
            Tier::Ephemeral
        );

        let report = engine.auto_promote(&ListFilter::default(), false).await.unwrap();
        assert_eq!(report.promoted.len(), 1);
        assert!(engine.scan(&ListFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_keeps_the_item_without_a_kept_copy() {
        for policy in [DurableDeletePolicy::Detach, DurableDeletePolicy::Cascade] {
            let dir = TempDir::new().unwrap();
            let (store, engine) = engine_with(&dir, |c| c.promotion.on_durable_delete = policy).await;
            assert!(!store.config().promotion.keep_ephemeral_copy);

            let item = store
                .store(
                    StoreRequest::new(ContentType::Learning, "Migrations run before the cache warms")
                        .with_importance(0.9),
                )
                .await
                .unwrap();
            let outcome = engine.promote(&item.id).await.unwrap();
            assert!(store.peek(Lookup::Id(&outcome.durable_id)).unwrap().is_some());

            std::fs::remove_file(&outcome.path).unwrap();
            let report = engine.reconcile().await.unwrap();
            assert_eq!(report.detached, vec![outcome.durable_id.clone()]);
            assert!(store.sqlite().get_item(&outcome.durable_id).unwrap().is_none());

            let original = store.peek(Lookup::Id(&item.id)).unwrap();
            match policy {
                DurableDeletePolicy::Detach => {
                    let original = original.unwrap();
                    assert_eq!(original.id, item.id);
                    assert_eq!(original.tier, Tier::Ephemeral);
                    assert!(original.durable_path.is_none());
                    assert_eq!(original.content, item.content);
                    assert_eq!(report.restored, vec![item.id.clone()]);

                    // Eligible again, so it can be promoted afresh
                    let again = engine.promote(&item.id).await.unwrap();
                    assert!(!again.already_promoted);
                    assert!(again.path.exists());
                }
                DurableDeletePolicy::Cascade => {
                    assert!(original.is_none());
                    assert!(report.restored.is_empty());
                }
            }
        }
    }

    #[tokio::test]
    async fn reconcile_detaches_or_cascades() {
        for policy in [DurableDeletePolicy::Detach, DurableDeletePolicy::Cascade] {
            let dir = TempDir::new().unwrap();
            let (store, engine) = engine_with(&dir, |c| {
                c.promotion.keep_ephemeral_copy = true;
                c.promotion.on_durable_delete = policy;
            })
            .await;

            let item = store
                .store(StoreRequest::new(ContentType::Summary, "Sprint summary").with_importance(0.9))
                .await
                .unwrap();
            let outcome = engine.promote(&item.id).await.unwrap();

            // Kept shadow is hidden from listings while the durable copy exists
            assert!(store.list(&ListFilter::default()).unwrap().iter().all(|i| i.id != item.id));

            std::fs::remove_file(&outcome.path).unwrap();
            let report = engine.reconcile().await.unwrap();
            assert_eq!(report.detached, vec![outcome.durable_id.clone()]);

            let shadow = store.peek(Lookup::Id(&item.id)).unwrap();
            match policy {
                DurableDeletePolicy::Detach => {
                    let shadow = shadow.unwrap();
                    assert_eq!(shadow.tier, Tier::Ephemeral);
                    assert!(store.list(&ListFilter::default()).unwrap().iter().any(|i| i.id == item.id));
                }
                DurableDeletePolicy::Cascade => {
                    assert!(shadow.is_none());
                    assert_eq!(report.cascaded, vec![item.id.clone()]);
                }
            }
        }
    }
}
