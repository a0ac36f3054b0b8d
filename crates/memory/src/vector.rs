//! Turn similarity index using Qdrant
//!
//! Dense vector storage and similarity search over turn embeddings. Every
//! search carries a mandatory `user_id` payload filter applied before
//! scoring, so cross-user turns are unreachable regardless of vector
//! proximity.

use qdrant_client::{
    qdrant::{
        condition::ConditionOneOf, r#match::MatchValue, value::Kind, Condition,
        CreateCollectionBuilder, Distance, FieldCondition, Filter, Match, PointStruct,
        SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
    },
    Qdrant,
};
use std::collections::HashMap;

use colloquy_core::Turn;

use crate::error::MemoryError;

/// Distance metric, deploy-time configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorDistance {
    #[default]
    Cosine,
    L2,
}

impl VectorDistance {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cosine" => Some(Self::Cosine),
            "l2" => Some(Self::L2),
            _ => None,
        }
    }
}

impl From<VectorDistance> for Distance {
    fn from(d: VectorDistance) -> Self {
        match d {
            VectorDistance::Cosine => Distance::Cosine,
            VectorDistance::L2 => Distance::Euclid,
        }
    }
}

/// Index configuration.
#[derive(Debug, Clone)]
pub struct TurnIndexConfig {
    pub endpoint: String,
    pub collection: String,
    pub vector_dim: usize,
    pub distance: VectorDistance,
    pub api_key: Option<String>,
}

impl Default for TurnIndexConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6334".to_string(),
            collection: "conversation_turns".to_string(),
            vector_dim: 384,
            distance: VectorDistance::Cosine,
            api_key: None,
        }
    }
}

/// A similarity search hit.
#[derive(Debug, Clone)]
pub struct SimilarTurn {
    pub turn_id: String,
    pub text: String,
    /// Distance under the configured metric, lower is more similar.
    pub distance: f32,
}

/// ANN index over turn embeddings.
pub struct TurnIndex {
    client: Qdrant,
    config: TurnIndexConfig,
}

impl TurnIndex {
    pub async fn new(config: TurnIndexConfig) -> Result<Self, MemoryError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| MemoryError::Connection(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Create the collection if it doesn't exist.
    pub async fn ensure_collection(&self) -> Result<(), MemoryError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| MemoryError::Index(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(
                            self.config.vector_dim as u64,
                            Distance::from(self.config.distance),
                        ),
                    ),
                )
                .await
                .map_err(|e| MemoryError::Index(e.to_string()))?;
            tracing::info!(collection = %self.config.collection, "Created turn index collection");
        }

        Ok(())
    }

    /// Upsert the embedding point for a persisted turn.
    pub async fn upsert_turn(&self, turn: &Turn, embedding: &[f32]) -> Result<(), MemoryError> {
        let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
        payload.insert("user_id".to_string(), turn.user_id.clone().into());
        payload.insert("agent_id".to_string(), turn.agent_id.clone().into());
        payload.insert(
            "text".to_string(),
            format!("User: {}\nAgent: {}", turn.user_utterance, turn.agent_reply).into(),
        );
        payload.insert("turn_index".to_string(), (turn.turn_index as i64).into());
        if let Some(ref session_id) = turn.session_id {
            payload.insert("session_id".to_string(), session_id.clone().into());
        }

        let point = PointStruct::new(turn.id.to_string(), embedding.to_vec(), payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.config.collection, vec![point]))
            .await
            .map_err(|e| MemoryError::Index(e.to_string()))?;

        Ok(())
    }

    /// Top-k nearest turns for a user, ascending distance.
    pub async fn search(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<SimilarTurn>, MemoryError> {
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(
                    &self.config.collection,
                    query_embedding.to_vec(),
                    k as u64,
                )
                .filter(user_filter(user_id))
                .with_payload(true),
            )
            .await
            .map_err(|e| MemoryError::Index(e.to_string()))?;

        let hits = results
            .result
            .into_iter()
            .map(|point| {
                let mut text = String::new();
                for (key, value) in point.payload {
                    if key == "text" {
                        if let Some(Kind::StringValue(s)) = value.kind {
                            text = s;
                        }
                    }
                }

                let turn_id = point
                    .id
                    .and_then(|pid| pid.point_id_options)
                    .map(|opt| match opt {
                        qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u) => u,
                        qdrant_client::qdrant::point_id::PointIdOptions::Num(n) => n.to_string(),
                    })
                    .unwrap_or_default();

                SimilarTurn {
                    turn_id,
                    text,
                    distance: score_to_distance(self.config.distance, point.score),
                }
            })
            .collect();

        Ok(hits)
    }

    /// One-shot liveness.
    pub async fn health(&self) -> bool {
        self.client.health_check().await.is_ok()
    }
}

/// Qdrant scores cosine as similarity (higher is better) and L2 as the
/// distance itself; normalize both to ascending distance.
fn score_to_distance(distance: VectorDistance, score: f32) -> f32 {
    match distance {
        VectorDistance::Cosine => 1.0 - score,
        VectorDistance::L2 => score,
    }
}

/// Mandatory per-user scope applied before scoring. Every search path goes
/// through this filter; cross-user turns are unreachable regardless of
/// vector proximity.
fn user_filter(user_id: &str) -> Filter {
    Filter {
        must: vec![Condition {
            condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                key: "user_id".to_string(),
                r#match: Some(Match {
                    match_value: Some(MatchValue::Keyword(user_id.to_string())),
                }),
                ..Default::default()
            })),
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TurnIndexConfig::default();
        assert_eq!(config.vector_dim, 384);
        assert_eq!(config.distance, VectorDistance::Cosine);
    }

    #[test]
    fn test_distance_parse() {
        assert_eq!(VectorDistance::parse("cosine"), Some(VectorDistance::Cosine));
        assert_eq!(VectorDistance::parse("l2"), Some(VectorDistance::L2));
        assert_eq!(VectorDistance::parse("dot"), None);
    }

    #[test]
    fn test_user_filter_scopes_search() {
        let filter = user_filter("u1");
        assert_eq!(filter.must.len(), 1);
        match &filter.must[0].condition_one_of {
            Some(ConditionOneOf::Field(field)) => {
                assert_eq!(field.key, "user_id");
                assert_eq!(
                    field.r#match.as_ref().unwrap().match_value,
                    Some(MatchValue::Keyword("u1".to_string()))
                );
            },
            other => panic!("unexpected condition: {:?}", other),
        }
    }

    #[test]
    fn test_score_to_distance() {
        // Cosine similarity 0.92 -> distance 0.08
        assert!((score_to_distance(VectorDistance::Cosine, 0.92) - 0.08).abs() < 1e-6);
        // L2 scores are already distances
        assert_eq!(score_to_distance(VectorDistance::L2, 0.92), 0.92);
    }
}
