use crate::error::Result;
use labchain_chain::ChainCaller;
use labchain_storage::{StorageBackend, StorageTransaction};
use labchain_types::{AlgorithmExecution, EntityType, TxHash};
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point for scientists submitting an algorithm for review.
pub struct Submitter {
    storage: Arc<dyn StorageBackend>,
    chain: Arc<dyn ChainCaller>,
}

impl Submitter {
    pub fn new(storage: Arc<dyn StorageBackend>, chain: Arc<dyn ChainCaller>) -> Self {
        Self { storage, chain }
    }

    /// Create the execution and put it on chain for review.
    ///
    /// The algorithm, execution and PENDING transaction rows are written
    /// only if the chain accepts the submission.
    pub async fn submit_algorithm(
        &self,
        name: &str,
        link: &str,
        bundle_cid: &str,
        dataset: &str,
        scientist: &str,
    ) -> Result<(AlgorithmExecution, TxHash)> {
        self.chain.ensure_wallet_funded(scientist).await?;

        let existing = self.storage.find_algorithm(name, bundle_cid).await?;
        let mut tx = self.storage.begin().await?;
        let staged = self
            .stage(tx.as_mut(), existing.map(|a| a.id), name, link, bundle_cid, dataset, scientist)
            .await;

        match staged {
            Ok((execution, hash)) => {
                tx.commit().await?;
                info!(
                    execution_id = execution.id,
                    cid = bundle_cid,
                    dataset,
                    tx_hash = %hash,
                    "📨 Algorithm submitted for review"
                );
                Ok((execution, hash))
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                warn!(cid = bundle_cid, error = %e, "Submission rejected");
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage(
        &self,
        tx: &mut dyn StorageTransaction,
        algorithm_id: Option<u64>,
        name: &str,
        link: &str,
        bundle_cid: &str,
        dataset: &str,
        scientist: &str,
    ) -> Result<(AlgorithmExecution, TxHash)> {
        let algorithm_id = match algorithm_id {
            Some(id) => id,
            None => tx.create_algorithm(name, link, bundle_cid).await?.id,
        };
        let execution = tx.create_execution(algorithm_id, dataset, scientist).await?;
        let submitted = self
            .chain
            .submit_algorithm(execution.id, bundle_cid)
            .await?;
        tx.create_transaction(&submitted.hash, execution.id, EntityType::Execution)
            .await?;
        Ok((execution, submitted.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labchain_chain::{ChainCall, SimulatedChain};
    use labchain_storage::MemoryBackend;
    use labchain_types::{ExecStatus, ReviewStatus, TxStatus};

    #[tokio::test]
    async fn test_submission_funds_wallet_and_stores_pending_tx() {
        let chain = SimulatedChain::default();
        let storage = Arc::new(MemoryBackend::new());
        let submitter = Submitter::new(storage.clone(), Arc::new(chain.clone()));

        let (execution, hash) = submitter
            .submit_algorithm("cbc", "https://example.org/cbc", "Qm123", "blood", "0xsci")
            .await
            .unwrap();
        assert_eq!(execution.status, ExecStatus::Queued);
        assert_eq!(execution.review_status, ReviewStatus::Reviewing);
        assert!(chain.balance("0xsci").await > 0);

        let row = storage.get_transaction(&hash).await.unwrap();
        assert_eq!(row.status, TxStatus::Pending);
        assert_eq!(row.entity_id, execution.id);

        // Same bundle again reuses the algorithm row.
        let (second, _) = submitter
            .submit_algorithm("cbc", "https://example.org/cbc", "Qm123", "blood", "0xsci")
            .await
            .unwrap();
        assert_eq!(second.algorithm_id, execution.algorithm_id);
        assert_ne!(second.id, execution.id);
    }

    #[tokio::test]
    async fn test_rejected_submission_rolls_back() {
        let chain = SimulatedChain::default();
        let storage = Arc::new(MemoryBackend::new());
        let submitter = Submitter::new(storage.clone(), Arc::new(chain.clone()));

        // Ids are shared across tables: the algorithm gets 1, the execution 2.
        chain.submit_algorithm(2, "Qm0").await.unwrap();
        assert!(submitter
            .submit_algorithm("cbc", "", "Qm123", "blood", "0xsci")
            .await
            .is_err());
        assert!(storage.find_algorithm("cbc", "Qm123").await.unwrap().is_none());
        assert_eq!(
            chain
                .calls()
                .await
                .iter()
                .filter(|c| matches!(c, ChainCall::SubmitAlgorithm { .. }))
                .count(),
            1
        );
    }
}
