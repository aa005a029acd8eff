//! Enqueue and external-state synchronization operations.

use std::path::Path;
use std::sync::atomic::Ordering;

use chrono::Utc;

use super::{QueueError, QueueManager, Result};
use crate::models::{Priority, ProcessingState, QueueItem, QueueItemStatus};

impl QueueManager {
    /// Enqueue one document for a deal.
    ///
    /// Fails with `MissingFile` when the document is not on disk,
    /// `Duplicate` when an item for the same `(deal, path)` is still in
    /// flight, and `DealRejected` when the deal name fails validation.
    /// On success the item is inserted in queue order, the deal mirror
    /// marks the file queued, and a snapshot is written.
    pub async fn enqueue_document(
        &self,
        deal_name: &str,
        document_path: &Path,
        document_name: &str,
        priority: Priority,
        metadata: serde_json::Value,
    ) -> Result<QueueItem> {
        self.validate_deal_name(deal_name)?;
        if !document_path.exists() {
            return Err(QueueError::MissingFile(document_path.to_path_buf()));
        }

        let item = {
            let mut state = self.state.write().await;
            let duplicate = state.items.iter().any(|existing| {
                existing.deal_name == deal_name
                    && existing.document_path == document_path
                    && existing.status.is_in_flight()
            });
            if duplicate {
                return Err(QueueError::Duplicate {
                    deal: deal_name.to_string(),
                    path: document_path.to_path_buf(),
                });
            }

            let item = QueueItem::new(
                deal_name,
                document_path.to_path_buf(),
                document_name,
                priority,
                metadata,
            );
            state.insert_ordered(item.clone());
            item
        };

        self.mark_mirror_file(
            deal_name,
            document_path,
            ProcessingState::Queued,
            Some(&item.id),
        )
        .await;

        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "snapshot after enqueue failed");
        }

        tracing::info!(
            deal = deal_name,
            document = document_name,
            priority = priority.as_str(),
            item = %item.id,
            "document enqueued"
        );
        Ok(item)
    }

    /// Map an engine-reported workflow state onto the queue item owning
    /// `job_id`. Recognized states: queued, processing, completed, failed,
    /// canceled.
    pub async fn synchronize_workflow_state(
        &self,
        job_id: &str,
        external_state: &str,
    ) -> Result<QueueItem> {
        let now = Utc::now();
        let (item, was_processing) = {
            let mut state = self.state.write().await;
            let item = state
                .items
                .iter_mut()
                .find(|i| i.job_id == job_id)
                .ok_or_else(|| QueueError::JobUnknown(job_id.to_string()))?;
            let was_processing = item.status == QueueItemStatus::Processing;

            match external_state {
                "queued" => item.status = QueueItemStatus::Pending,
                "processing" => item.mark_processing(now),
                "completed" => item.mark_terminal(QueueItemStatus::Completed, now),
                "failed" => item.mark_failed("engine", "analysis engine reported failure", now),
                "canceled" => item.mark_terminal(QueueItemStatus::Canceled, now),
                other => return Err(QueueError::UnknownState(other.to_string())),
            }
            (item.clone(), was_processing)
        };

        // Keep the processing gauge in step with status transitions driven
        // from outside the dispatch loop.
        if was_processing && item.status != QueueItemStatus::Processing {
            self.processing_count.fetch_sub(1, Ordering::SeqCst);
        } else if !was_processing && item.status == QueueItemStatus::Processing {
            self.processing_count.fetch_add(1, Ordering::SeqCst);
        }

        let mirror_state = match item.status {
            QueueItemStatus::Pending | QueueItemStatus::Retrying | QueueItemStatus::Blocked => {
                ProcessingState::Queued
            }
            QueueItemStatus::Processing => ProcessingState::Processing,
            QueueItemStatus::Completed => ProcessingState::Completed,
            QueueItemStatus::Failed | QueueItemStatus::Canceled => ProcessingState::Failed,
        };
        self.mark_mirror_file(
            &item.deal_name,
            &item.document_path,
            mirror_state,
            Some(&item.id),
        )
        .await;

        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "snapshot after state sync failed");
        }
        Ok(item)
    }

    fn validate_deal_name(&self, deal_name: &str) -> Result<()> {
        if deal_name.is_empty() {
            return Err(QueueError::DealRejected("deal name is empty".to_string()));
        }
        if deal_name.len() > self.config.max_deal_name_len {
            return Err(QueueError::DealRejected(format!(
                "deal name exceeds {} characters",
                self.config.max_deal_name_len
            )));
        }
        // Deal names become folder names under the data root.
        if deal_name.contains('/') || deal_name.contains('\\') || deal_name.contains("..") {
            return Err(QueueError::DealRejected(format!(
                "deal name contains path components: {deal_name}"
            )));
        }
        Ok(())
    }
}
