use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An instructor-authored problem. `test_cases[i]` is an expression whose
/// result must render exactly as `solutions[i]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Exercise {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub difficulty: i64,
    #[serde(alias = "testCases")]
    pub test_cases: Vec<String>,
    pub solutions: Vec<String>,
}

impl Exercise {
    /// Whether every test case has exactly one expected answer
    pub fn is_consistent(&self) -> bool {
        self.test_cases.len() == self.solutions.len()
    }
}

/// Read access to stored exercises
#[async_trait]
pub trait ExerciseRepository: Send + Sync {
    /// `Ok(None)` when no exercise has this id
    async fn fetch_by_id(&self, id: u32) -> anyhow::Result<Option<Exercise>>;
}

/// Exercises declared inline in the configuration file
pub struct ConfigExerciseRepository {
    exercises: HashMap<u32, Exercise>,
}

impl ConfigExerciseRepository {
    pub fn new(exercises: Vec<Exercise>) -> Self {
        let mut by_id = HashMap::with_capacity(exercises.len());
        for exercise in exercises {
            if let Some(previous) = by_id.insert(exercise.id, exercise) {
                log::warn!("Exercise {} declared more than once, keeping the last one", previous.id);
            }
        }
        Self { exercises: by_id }
    }
}

#[async_trait]
impl ExerciseRepository for ConfigExerciseRepository {
    async fn fetch_by_id(&self, id: u32) -> anyhow::Result<Option<Exercise>> {
        Ok(self.exercises.get(&id).cloned())
    }
}
