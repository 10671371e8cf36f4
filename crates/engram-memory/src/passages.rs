//! The typed passage API above the store and the vector mirror. Agent and
//! source passages are split end to end; the undifferentiated variants at
//! the bottom exist for callers that only hold an id.

use chrono::Utc;
use engram_schema::{
    id_prefix, new_id, Actor, EmbeddingConfig, EngramError, Passage, PassageOwner, Result,
};
use engram_store::vector::VectorFilter;
use engram_store::{Store, VectorStore};

#[derive(Debug, Clone)]
pub enum SearchScope {
    /// Archival passages private to one agent.
    Agent(String),
    /// Passages of one document source.
    Source(String),
}

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PassageUpdate {
    pub text: Option<String>,
    pub embedding: Option<(Vec<f32>, EmbeddingConfig)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageUnit {
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
}

impl StorageUnit {
    fn divisor(&self) -> f64 {
        match self {
            StorageUnit::Bytes => 1.0,
            StorageUnit::Kilobytes => 1024.0,
            StorageUnit::Megabytes => 1024.0 * 1024.0,
            StorageUnit::Gigabytes => 1024.0 * 1024.0 * 1024.0,
        }
    }
}

#[derive(Clone)]
pub struct PassageManager {
    store: Store,
    vector: VectorStore,
}

impl PassageManager {
    pub fn new(store: Store, vector: VectorStore) -> Self {
        Self { store, vector }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn vector(&self) -> &VectorStore {
        &self.vector
    }

    /// Build a validated agent passage value; nothing is written yet.
    pub fn new_agent_passage(
        agent_id: &str,
        text: impl Into<String>,
        embedding: Vec<f32>,
        embedding_config: EmbeddingConfig,
        actor: &Actor,
    ) -> Passage {
        let now = Utc::now();
        Passage {
            id: new_id(id_prefix::PASSAGE),
            organization_id: actor.organization_id.clone(),
            owner: PassageOwner::Agent {
                agent_id: agent_id.to_string(),
            },
            text: text.into(),
            embedding,
            embedding_config,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: Some(actor.id.clone()),
            updated_by: Some(actor.id.clone()),
        }
    }

    pub fn new_source_passage(
        source_id: &str,
        file_id: &str,
        file_name: &str,
        text: impl Into<String>,
        embedding: Vec<f32>,
        embedding_config: EmbeddingConfig,
        actor: &Actor,
    ) -> Passage {
        let now = Utc::now();
        Passage {
            id: new_id(id_prefix::PASSAGE),
            organization_id: actor.organization_id.clone(),
            owner: PassageOwner::Source {
                source_id: source_id.to_string(),
                file_id: file_id.to_string(),
                file_name: file_name.to_string(),
            },
            text: text.into(),
            embedding,
            embedding_config,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: Some(actor.id.clone()),
            updated_by: Some(actor.id.clone()),
        }
    }

    pub async fn create_agent_passage(&self, passage: Passage, actor: &Actor) -> Result<Passage> {
        if passage.owner.agent_id().is_none() {
            return Err(EngramError::invalid_argument(
                "agent passage must have agent_id and no source_id",
            ));
        }
        let created = self.store.insert_agent_passage(passage, actor).await?;
        self.mirror_to_vector_store(&created).await;
        Ok(created)
    }

    pub async fn create_source_passage(&self, passage: Passage, actor: &Actor) -> Result<Passage> {
        if passage.owner.source_id().is_none() {
            return Err(EngramError::invalid_argument(
                "source passage must have source_id and no agent_id",
            ));
        }
        let created = self.store.insert_source_passage(passage, actor).await?;
        self.mirror_to_vector_store(&created).await;
        Ok(created)
    }

    pub async fn create_many_agent_passages(
        &self,
        passages: Vec<Passage>,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        let created = self
            .store
            .insert_many_agent_passages(passages, actor)
            .await?;
        self.mirror_batch(&created).await;
        Ok(created)
    }

    pub async fn create_many_source_passages(
        &self,
        passages: Vec<Passage>,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        let created = self
            .store
            .insert_many_source_passages(passages, actor)
            .await?;
        self.mirror_batch(&created).await;
        Ok(created)
    }

    pub async fn get_agent_passage_by_id(
        &self,
        passage_id: &str,
        actor: &Actor,
    ) -> Result<Passage> {
        self.store.get_agent_passage(passage_id, actor).await
    }

    pub async fn get_source_passage_by_id(
        &self,
        passage_id: &str,
        actor: &Actor,
    ) -> Result<Passage> {
        self.store.get_source_passage(passage_id, actor).await
    }

    /// Deprecated-style lookup for callers that only hold an id: source
    /// passages are tried first, then archival.
    pub async fn get_passage_by_id(&self, passage_id: &str, actor: &Actor) -> Result<Passage> {
        match self.store.get_source_passage(passage_id, actor).await {
            Ok(passage) => Ok(passage),
            Err(EngramError::NotFound(_)) => {
                self.store.get_agent_passage(passage_id, actor).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_agent_passage_by_id(
        &self,
        passage_id: &str,
        update: PassageUpdate,
        actor: &Actor,
    ) -> Result<Passage> {
        let mut passage = self.store.get_agent_passage(passage_id, actor).await?;
        let remirror = apply_update(&mut passage, update);
        let updated = self.store.update_agent_passage(passage, actor).await?;
        if remirror {
            self.mirror_to_vector_store(&updated).await;
        }
        Ok(updated)
    }

    pub async fn update_source_passage_by_id(
        &self,
        passage_id: &str,
        update: PassageUpdate,
        actor: &Actor,
    ) -> Result<Passage> {
        let mut passage = self.store.get_source_passage(passage_id, actor).await?;
        let remirror = apply_update(&mut passage, update);
        let updated = self.store.update_source_passage(passage, actor).await?;
        if remirror {
            self.mirror_to_vector_store(&updated).await;
        }
        Ok(updated)
    }

    pub async fn delete_agent_passage_by_id(
        &self,
        passage_id: &str,
        actor: &Actor,
    ) -> Result<bool> {
        let deleted = self.store.hard_delete_agent_passage(passage_id, actor).await?;
        if deleted {
            self.remove_from_vector_store(passage_id).await;
        }
        Ok(deleted)
    }

    pub async fn delete_source_passage_by_id(
        &self,
        passage_id: &str,
        actor: &Actor,
    ) -> Result<bool> {
        let deleted = self
            .store
            .hard_delete_source_passage(passage_id, actor)
            .await?;
        if deleted {
            self.remove_from_vector_store(passage_id).await;
        }
        Ok(deleted)
    }

    /// Deprecated-style delete dispatching on which table holds the row.
    pub async fn delete_passage_by_id(&self, passage_id: &str, actor: &Actor) -> Result<bool> {
        if self.delete_source_passage_by_id(passage_id, actor).await? {
            return Ok(true);
        }
        self.delete_agent_passage_by_id(passage_id, actor).await
    }

    /// Cascade for agent deletion: hard-delete the archival store and its
    /// vector rows.
    pub async fn delete_agent_passages(&self, agent_id: &str, actor: &Actor) -> Result<usize> {
        let ids = self
            .store
            .delete_agent_passages_for_agent(agent_id, actor)
            .await?;
        for id in &ids {
            self.remove_from_vector_store(id).await;
        }
        Ok(ids.len())
    }

    pub async fn agent_passage_size(
        &self,
        actor: &Actor,
        agent_id: Option<&str>,
    ) -> Result<u64> {
        self.store.agent_passage_size(actor, agent_id).await
    }

    pub async fn source_passage_size(
        &self,
        actor: &Actor,
        source_id: Option<&str>,
    ) -> Result<u64> {
        self.store.source_passage_size(actor, source_id).await
    }

    /// Storage estimate: 4 bytes per stored dimension, normalized to `unit`.
    pub async fn estimate_embeddings_size(
        &self,
        actor: &Actor,
        unit: StorageUnit,
    ) -> Result<f64> {
        let dims = self.store.total_embedding_dims(actor).await?;
        Ok((dims as f64 * 4.0) / unit.divisor())
    }

    pub async fn list_passages_by_file_id(
        &self,
        file_id: &str,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        self.store.list_passages_by_file_id(file_id, actor).await
    }

    /// Top-K retrieval scoped to one agent's archival store or one source.
    /// Vector hits are re-hydrated through the relational store, preserving
    /// score order; ids that no longer resolve are dropped.
    pub async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        min_similarity: f64,
        scope: SearchScope,
        actor: &Actor,
    ) -> Result<Vec<ScoredPassage>> {
        let filter = match &scope {
            SearchScope::Agent(agent_id) => VectorFilter::for_agent(agent_id.clone()),
            SearchScope::Source(source_id) => VectorFilter::for_source(source_id.clone()),
        };
        let matches = self
            .vector
            .search_similar(query_embedding, top_k, min_similarity, filter)
            .await?;
        let ids: Vec<String> = matches.iter().map(|m| m.passage_id.clone()).collect();
        let passages = self.store.get_passages_by_ids(ids, actor).await?;

        let mut scored = Vec::with_capacity(passages.len());
        for passage in passages {
            let score = matches
                .iter()
                .find(|m| m.passage_id == passage.id)
                .map(|m| m.score)
                .unwrap_or_default();
            scored.push(ScoredPassage { passage, score });
        }
        Ok(scored)
    }

    async fn mirror_to_vector_store(&self, passage: &Passage) {
        let metadata = mirror_metadata(passage);
        if let Err(e) = self
            .vector
            .upsert(&passage.id, &passage.embedding, Some(metadata))
            .await
        {
            tracing::warn!(passage_id = %passage.id, "vector mirror write failed: {e}");
        }
    }

    async fn mirror_batch(&self, passages: &[Passage]) {
        let rows: Vec<(String, Vec<f32>, Option<serde_json::Value>)> = passages
            .iter()
            .map(|p| (p.id.clone(), p.embedding.clone(), Some(mirror_metadata(p))))
            .collect();
        if let Err(e) = self.vector.batch_upsert(rows).await {
            tracing::warn!("vector mirror batch write failed: {e}");
        }
    }

    async fn remove_from_vector_store(&self, passage_id: &str) {
        if let Err(e) = self.vector.delete(passage_id).await {
            tracing::warn!(passage_id, "vector mirror delete failed: {e}");
        }
    }
}

fn apply_update(passage: &mut Passage, update: PassageUpdate) -> bool {
    let mut remirror = false;
    if let Some(text) = update.text {
        passage.text = text;
    }
    if let Some((embedding, config)) = update.embedding {
        passage.embedding = embedding;
        passage.embedding_config = config;
        remirror = true;
    }
    remirror
}

fn mirror_metadata(passage: &Passage) -> serde_json::Value {
    let preview: String = passage.text.chars().take(1000).collect();
    serde_json::json!({
        "agent_id": passage.owner.agent_id(),
        "source_id": passage.owner.source_id(),
        "text": preview,
        "created_at": passage.created_at.to_rfc3339(),
    })
}
