use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::snapshot::SnapshotQuestion;
use crate::store::SnapshotStore;

/// Read-only lookup of frozen questions inside assignment snapshots.
#[derive(Clone)]
pub struct SnapshotResolver {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotResolver {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// The question `question_id` exactly as it was when `snapshot_id` was
    /// published.
    pub async fn resolve(
        &self,
        snapshot_id: Uuid,
        question_id: Uuid,
    ) -> Result<SnapshotQuestion, PipelineError> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or(PipelineError::SnapshotNotFound(snapshot_id))?;

        find_question(&snapshot.snapshot, question_id)
            .map_err(|reason| PipelineError::MalformedSnapshot {
                snapshot_id,
                reason,
            })?
            .ok_or(PipelineError::QuestionNotFound {
                snapshot_id,
                question_id,
            })
    }
}

/// Find a question in a snapshot document. Only the matching entry has to
/// deserialize; unrelated malformed questions are ignored.
fn find_question(document: &Value, question_id: Uuid) -> Result<Option<SnapshotQuestion>, String> {
    let Some(questions) = document.get("questions").and_then(Value::as_array) else {
        return Ok(None);
    };

    let wanted = question_id.to_string();
    let Some(entry) = questions.iter().find(|q| {
        q.get("questionId")
            .and_then(Value::as_str)
            .is_some_and(|id| id.eq_ignore_ascii_case(&wanted))
    }) else {
        return Ok(None);
    };

    serde_json::from_value(entry.clone())
        .map(Some)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::AssignmentSnapshot;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn resolver_with(snapshot: Value) -> (SnapshotResolver, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        store.add_snapshot(AssignmentSnapshot {
            id,
            assignment_id: Uuid::new_v4(),
            snapshot,
        });
        (SnapshotResolver::new(store), id)
    }

    #[tokio::test]
    async fn test_resolves_question() {
        let qid = Uuid::new_v4();
        let (resolver, sid) = resolver_with(json!({
            "questions": [
                { "questionId": Uuid::new_v4().to_string(), "questionIndex": 1 },
                {
                    "questionId": qid.to_string(),
                    "questionIndex": 2,
                    "prompt": { "text": "Prove it" },
                    "rubric": [{ "rubricItemKey": "R1", "maxScore": 5, "criteria": "steps" }]
                }
            ]
        }));

        let question = resolver.resolve(sid, qid).await.unwrap();
        assert_eq!(question.question_index, 2);
        assert_eq!(question.prompt_text(), "Prove it");
        assert_eq!(question.rubric.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_and_question() {
        let (resolver, sid) = resolver_with(json!({ "questions": [] }));

        let err = resolver.resolve(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SnapshotNotFound(_)));

        let err = resolver.resolve(sid, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::QuestionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_question_is_reported() {
        let qid = Uuid::new_v4();
        let (resolver, sid) = resolver_with(json!({
            "questions": [{ "questionId": qid.to_string(), "rubric": "not a list" }]
        }));

        let err = resolver.resolve(sid, qid).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedSnapshot { .. }));
    }
}
