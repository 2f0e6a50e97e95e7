//! Fixed catalog of canonical prompts that pin down regions of semantic space.
//!
//! Anchor ids are stable: `category_index * 64 + position`, so every id fits
//! in `0..1024`. Vectors produced for an anchor by some model are cached in an
//! injectable [`AnchorVectorStore`] and drive nearest-anchor queries,
//! calibration, and the verifier's pattern and consistency checks.

use crate::config::CalibrationConfig;
use crate::error::{ProtocolError, Result};
use crate::math::cosine_similarity;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

const IDS_PER_CATEGORY: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorCategory {
    FactualKnowledge,
    LogicalReasoning,
    CausalReasoning,
    Mathematical,
    EthicalReasoning,
    CreativeWriting,
    CodeGeneration,
    ScientificExplanation,
    TemporalReasoning,
    SpatialReasoning,
    EmotionalUnderstanding,
    Commonsense,
    LanguageTranslation,
    Summarization,
    Dialogue,
    Planning,
}

impl AnchorCategory {
    pub const ALL: [AnchorCategory; 16] = [
        AnchorCategory::FactualKnowledge,
        AnchorCategory::LogicalReasoning,
        AnchorCategory::CausalReasoning,
        AnchorCategory::Mathematical,
        AnchorCategory::EthicalReasoning,
        AnchorCategory::CreativeWriting,
        AnchorCategory::CodeGeneration,
        AnchorCategory::ScientificExplanation,
        AnchorCategory::TemporalReasoning,
        AnchorCategory::SpatialReasoning,
        AnchorCategory::EmotionalUnderstanding,
        AnchorCategory::Commonsense,
        AnchorCategory::LanguageTranslation,
        AnchorCategory::Summarization,
        AnchorCategory::Dialogue,
        AnchorCategory::Planning,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnchorCategory::FactualKnowledge => "factual_knowledge",
            AnchorCategory::LogicalReasoning => "logical_reasoning",
            AnchorCategory::CausalReasoning => "causal_reasoning",
            AnchorCategory::Mathematical => "mathematical",
            AnchorCategory::EthicalReasoning => "ethical_reasoning",
            AnchorCategory::CreativeWriting => "creative_writing",
            AnchorCategory::CodeGeneration => "code_generation",
            AnchorCategory::ScientificExplanation => "scientific_explanation",
            AnchorCategory::TemporalReasoning => "temporal_reasoning",
            AnchorCategory::SpatialReasoning => "spatial_reasoning",
            AnchorCategory::EmotionalUnderstanding => "emotional_understanding",
            AnchorCategory::Commonsense => "commonsense",
            AnchorCategory::LanguageTranslation => "language_translation",
            AnchorCategory::Summarization => "summarization",
            AnchorCategory::Dialogue => "dialogue",
            AnchorCategory::Planning => "planning",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == name)
            .ok_or_else(|| ProtocolError::UnknownCategory(name.to_string()))
    }

    fn index(&self) -> u32 {
        *self as u32
    }

    fn prompts(&self) -> &'static [&'static str] {
        match self {
            AnchorCategory::FactualKnowledge => &[
                "What is the capital city of Japan?",
                "Who wrote the play Romeo and Juliet?",
                "How many continents are there on Earth?",
                "What is the chemical symbol for gold?",
                "Which planet is closest to the Sun?",
            ],
            AnchorCategory::LogicalReasoning => &[
                "If all roses are flowers and some flowers fade quickly, can we conclude that some roses fade quickly?",
                "A is taller than B and B is taller than C. Who is the shortest?",
                "If it rains the ground gets wet. The ground is dry. Did it rain?",
                "Every student in the class passed. Maria is in the class. What follows?",
                "Which statement contradicts the claim that no birds can swim?",
            ],
            AnchorCategory::CausalReasoning => &[
                "Why does ice float on water?",
                "What happens to a plant kept in complete darkness for two weeks?",
                "Why do metal spoons get hot in a pot of soup?",
                "What causes the seasons to change?",
                "If a factory closes, what might happen to the nearby town's economy?",
            ],
            AnchorCategory::Mathematical => &[
                "What is 17 multiplied by 23?",
                "Solve for x: 3x + 7 = 22.",
                "What is the derivative of x squared?",
                "How many prime numbers are there between 1 and 20?",
                "What is the area of a circle with radius 4?",
            ],
            AnchorCategory::EthicalReasoning => &[
                "Is it acceptable to lie to protect someone's feelings?",
                "Should a self-driving car prioritize its passengers or pedestrians?",
                "Is it fair to pay people differently for the same work?",
                "What obligations do we have towards future generations?",
                "Is breaking a promise ever justified?",
            ],
            AnchorCategory::CreativeWriting => &[
                "Write the opening line of a mystery novel set in a lighthouse.",
                "Describe a sunset to someone who has never seen one.",
                "Compose a haiku about the first snow of winter.",
                "Invent a name and backstory for a dragon who fears heights.",
                "Write a short dialogue between the moon and the ocean.",
            ],
            AnchorCategory::CodeGeneration => &[
                "Write a function that reverses a string.",
                "Implement binary search over a sorted array.",
                "Write a SQL query that counts orders per customer.",
                "How do you read a file line by line?",
                "Write a function that checks whether a number is prime.",
            ],
            AnchorCategory::ScientificExplanation => &[
                "Explain how photosynthesis works.",
                "What is the difference between a virus and a bacterium?",
                "How does a vaccine train the immune system?",
                "Why is the sky blue?",
                "Explain the theory of plate tectonics.",
            ],
            AnchorCategory::TemporalReasoning => &[
                "If today is Wednesday, what day was it four days ago?",
                "Which came first, the printing press or the steam engine?",
                "A meeting starts at 14:45 and lasts 90 minutes. When does it end?",
                "How many months are between March and November?",
                "What will the date be 30 days after January 15?",
            ],
            AnchorCategory::SpatialReasoning => &[
                "If you face north and turn right twice, which way are you facing?",
                "How many faces does a cube have?",
                "The cup is left of the plate and the plate is left of the fork. Where is the cup relative to the fork?",
                "Can a square peg of side 2 fit through a round hole of diameter 2?",
                "Describe the shape you get when slicing a cone parallel to its base.",
            ],
            AnchorCategory::EmotionalUnderstanding => &[
                "How might someone feel after losing their job unexpectedly?",
                "What does it mean when a friend suddenly stops replying to messages?",
                "Why do people cry at weddings?",
                "How can you comfort someone who is grieving?",
                "Describe the feeling of nostalgia.",
            ],
            AnchorCategory::Commonsense => &[
                "Why do people carry umbrellas when it is cloudy?",
                "What should you do if you smell smoke in your house?",
                "Can you fit an elephant inside a refrigerator?",
                "Why do we put food in the fridge?",
                "What happens if you leave a glass of water in the freezer overnight?",
            ],
            AnchorCategory::LanguageTranslation => &[
                "Translate 'good morning' into French.",
                "What does the Spanish word 'biblioteca' mean?",
                "Translate 'thank you very much' into Japanese.",
                "How do you say 'where is the train station' in German?",
                "Translate the Italian phrase 'buon appetito' into English.",
            ],
            AnchorCategory::Summarization => &[
                "Summarize the plot of Cinderella in one sentence.",
                "Give a one-line summary of the causes of the First World War.",
                "Condense this idea: exercise improves mood, sleep and long-term health.",
                "Summarize the main argument for renewable energy.",
                "Describe the water cycle in two sentences.",
            ],
            AnchorCategory::Dialogue => &[
                "Hi, how are you doing today?",
                "Can you recommend a good book for a long flight?",
                "I'm sorry, I didn't catch your name.",
                "What did you think of the movie last night?",
                "Thanks for your help, have a great weekend!",
            ],
            AnchorCategory::Planning => &[
                "Plan a three-day trip to Rome on a small budget.",
                "What steps are needed to bake a loaf of bread?",
                "Outline a weekly study schedule for learning a new language.",
                "How would you organize moving to a new apartment?",
                "List the steps to launch a small online store.",
            ],
        }
    }
}

impl std::fmt::Display for AnchorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticAnchor {
    pub anchor_id: u32,
    pub category: AnchorCategory,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestAnchor {
    pub anchor_id: u32,
    pub category: AnchorCategory,
    pub prompt: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub calibration_score: f32,
    /// Distinct categories among the top anchors, over all 16 categories.
    pub coverage: f32,
    pub top_anchors: Vec<NearestAnchor>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorStatistics {
    pub total_anchors: usize,
    pub category_counts: BTreeMap<AnchorCategory, usize>,
    pub vectors_cached: usize,
}

/// Concurrent cache of anchor vectors. Writes are atomic per anchor id and
/// visible to every later read.
pub trait AnchorVectorStore: Send + Sync {
    fn get(&self, anchor_id: u32) -> Option<Arc<Vec<f32>>>;
    fn put(&self, anchor_id: u32, vector: Arc<Vec<f32>>);
    fn entries(&self) -> Vec<(u32, Arc<Vec<f32>>)>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryAnchorStore {
    vectors: DashMap<u32, Arc<Vec<f32>>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnchorVectorStore for MemoryAnchorStore {
    fn get(&self, anchor_id: u32) -> Option<Arc<Vec<f32>>> {
        self.vectors.get(&anchor_id).map(|v| Arc::clone(v.value()))
    }

    fn put(&self, anchor_id: u32, vector: Arc<Vec<f32>>) {
        self.vectors.insert(anchor_id, vector);
    }

    fn entries(&self) -> Vec<(u32, Arc<Vec<f32>>)> {
        self.vectors
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct CatalogEntry {
    anchor_id: u32,
    category: AnchorCategory,
    prompt: &'static str,
}

pub struct SemanticAnchorIndex {
    catalog: Vec<CatalogEntry>,
    store: Arc<dyn AnchorVectorStore>,
    config: CalibrationConfig,
}

impl SemanticAnchorIndex {
    pub fn new(config: CalibrationConfig) -> Self {
        Self::with_store(Arc::new(MemoryAnchorStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn AnchorVectorStore>, config: CalibrationConfig) -> Self {
        let catalog = AnchorCategory::ALL
            .iter()
            .flat_map(|&category| {
                category
                    .prompts()
                    .iter()
                    .enumerate()
                    .map(move |(i, &prompt)| CatalogEntry {
                        anchor_id: category.index() * IDS_PER_CATEGORY + i as u32,
                        category,
                        prompt,
                    })
            })
            .collect();
        Self {
            catalog,
            store,
            config,
        }
    }

    fn entry(&self, anchor_id: u32) -> Option<&CatalogEntry> {
        self.catalog
            .binary_search_by_key(&anchor_id, |e| e.anchor_id)
            .ok()
            .map(|i| &self.catalog[i])
    }

    fn materialize(&self, e: &CatalogEntry) -> SemanticAnchor {
        SemanticAnchor {
            anchor_id: e.anchor_id,
            category: e.category,
            prompt: e.prompt.to_string(),
            vector: self.store.get(e.anchor_id).map(|v| v.as_ref().clone()),
        }
    }

    pub fn get(&self, anchor_id: u32) -> Result<SemanticAnchor> {
        self.entry(anchor_id)
            .map(|e| self.materialize(e))
            .ok_or(ProtocolError::UnknownAnchor(anchor_id))
    }

    pub fn get_all(&self) -> Vec<SemanticAnchor> {
        self.catalog.iter().map(|e| self.materialize(e)).collect()
    }

    pub fn get_by_category(&self, category: &str) -> Result<Vec<SemanticAnchor>> {
        let category = AnchorCategory::parse(category)?;
        Ok(self
            .catalog
            .iter()
            .filter(|e| e.category == category)
            .map(|e| self.materialize(e))
            .collect())
    }

    pub fn get_categories(&self) -> Vec<AnchorCategory> {
        AnchorCategory::ALL.to_vec()
    }

    pub fn category_of(&self, anchor_id: u32) -> Result<AnchorCategory> {
        self.entry(anchor_id)
            .map(|e| e.category)
            .ok_or(ProtocolError::UnknownAnchor(anchor_id))
    }

    pub fn store_anchor_vector(&self, anchor_id: u32, vector: Vec<f32>) -> Result<()> {
        if self.entry(anchor_id).is_none() {
            return Err(ProtocolError::UnknownAnchor(anchor_id));
        }
        if vector.is_empty() {
            return Err(ProtocolError::InvalidDimension {
                field: "vector",
                value: 0,
            });
        }
        self.store.put(anchor_id, Arc::new(vector));
        debug!(anchor_id, "anchor vector cached");
        Ok(())
    }

    pub fn anchor_vector(&self, anchor_id: u32) -> Option<Arc<Vec<f32>>> {
        self.store.get(anchor_id)
    }

    /// Cached vectors of the catalog, in ascending id order.
    pub(crate) fn cached_vectors(&self) -> Vec<(u32, Arc<Vec<f32>>)> {
        let mut entries: Vec<_> = self
            .store
            .entries()
            .into_iter()
            .filter(|(id, _)| self.entry(*id).is_some())
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Cached anchors ranked by cosine similarity, highest first, ties by id.
    /// Anchors cached with a different dimension are skipped.
    pub fn find_nearest(&self, vector: &[f32], top_k: usize) -> Vec<NearestAnchor> {
        let mut ranked: Vec<NearestAnchor> = self
            .cached_vectors()
            .into_iter()
            .filter(|(_, v)| v.len() == vector.len())
            .filter_map(|(id, v)| {
                let e = self.entry(id)?;
                Some(NearestAnchor {
                    anchor_id: id,
                    category: e.category,
                    prompt: e.prompt.to_string(),
                    similarity: cosine_similarity(vector, &v),
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.anchor_id.cmp(&b.anchor_id))
        });
        ranked.truncate(top_k);
        ranked
    }

    pub fn calibrate(&self, vector: &[f32]) -> CalibrationResult {
        let top = self.find_nearest(vector, self.config.top_anchors);
        let mut recommendations = Vec::new();

        if top.is_empty() {
            recommendations.push(
                "no anchor vectors cached for this dimension; store anchor vectors before calibrating"
                    .to_string(),
            );
            return CalibrationResult {
                calibration_score: 0.0,
                coverage: 0.0,
                top_anchors: top,
                recommendations,
            };
        }

        let calibration_score = top.iter().map(|a| a.similarity).sum::<f32>() / top.len() as f32;
        let categories: BTreeSet<AnchorCategory> = top.iter().map(|a| a.category).collect();
        let coverage = categories.len() as f32 / AnchorCategory::ALL.len() as f32;

        if calibration_score < self.config.min_score {
            recommendations.push(format!(
                "low similarity to canonical anchors ({:.2}); check that the vector comes from the declared model",
                calibration_score
            ));
        }
        if coverage < self.config.min_coverage {
            recommendations.push(format!(
                "nearest anchors span only {} categories; the vector may be narrowly specialized",
                categories.len()
            ));
        }

        CalibrationResult {
            calibration_score,
            coverage,
            top_anchors: top,
            recommendations,
        }
    }

    pub fn get_statistics(&self) -> AnchorStatistics {
        let mut category_counts = BTreeMap::new();
        for e in &self.catalog {
            *category_counts.entry(e.category).or_insert(0) += 1;
        }
        AnchorStatistics {
            total_anchors: self.catalog.len(),
            category_counts,
            vectors_cached: self.cached_vectors().len(),
        }
    }

    /// `count` anchor ids spread round-robin over shuffled categories, so no
    /// category repeats before every category has been used once.
    pub(crate) fn sample_spread<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<u32> {
        let mut categories = AnchorCategory::ALL.to_vec();
        categories.shuffle(rng);
        let mut pools: Vec<Vec<u32>> = categories
            .iter()
            .map(|&c| {
                let mut ids: Vec<u32> = self
                    .catalog
                    .iter()
                    .filter(|e| e.category == c)
                    .map(|e| e.anchor_id)
                    .collect();
                ids.shuffle(rng);
                ids
            })
            .collect();

        let total = self.catalog.len();
        let mut picked = Vec::with_capacity(count.min(total));
        while picked.len() < count.min(total) {
            for pool in pools.iter_mut() {
                if picked.len() == count.min(total) {
                    break;
                }
                if let Some(id) = pool.pop() {
                    picked.push(id);
                }
            }
        }
        picked
    }
}

impl Default for SemanticAnchorIndex {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}
