use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::exercise::{Exercise, ExerciseRepository};

const DATABASE_NAME: &str = "grader.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "grader")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS exercises (
            id            INTEGER  PRIMARY KEY,
            title         TEXT     NOT NULL,
            body          TEXT     NOT NULL,
            difficulty    INTEGER  NOT NULL,
            test_cases    TEXT     NOT NULL,
            solutions     TEXT     NOT NULL,
            created_at    TEXT     NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at    TEXT     NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )
    .execute(&db_pool)
    .await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

/// Inserts or replaces the given exercises in one transaction
pub async fn seed_exercises(pool: &SqlitePool, exercises: &[Exercise]) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    for exercise in exercises {
        sqlx::query(
            r"
            INSERT INTO exercises (id, title, body, difficulty, test_cases, solutions)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                difficulty = excluded.difficulty,
                test_cases = excluded.test_cases,
                solutions = excluded.solutions,
                updated_at = CURRENT_TIMESTAMP
            ",
        )
        .bind(exercise.id)
        .bind(&exercise.title)
        .bind(&exercise.body)
        .bind(exercise.difficulty)
        .bind(serde_json::to_string(&exercise.test_cases)?)
        .bind(serde_json::to_string(&exercise.solutions)?)
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;

    log::info!("Seeded {} exercises into the database", exercises.len());
    Ok(())
}

#[derive(FromRow)]
struct ExerciseRow {
    id: i64,
    title: String,
    body: String,
    difficulty: i64,
    test_cases: String,
    solutions: String,
}

impl TryFrom<ExerciseRow> for Exercise {
    type Error = anyhow::Error;

    fn try_from(row: ExerciseRow) -> anyhow::Result<Self> {
        let id = u32::try_from(row.id).with_context(|| format!("exercise id {} out of range", row.id))?;
        let test_cases = serde_json::from_str(&row.test_cases)
            .with_context(|| format!("exercise {id} has malformed test_cases"))?;
        let solutions = serde_json::from_str(&row.solutions)
            .with_context(|| format!("exercise {id} has malformed solutions"))?;
        Ok(Exercise {
            id,
            title: row.title,
            body: row.body,
            difficulty: row.difficulty,
            test_cases,
            solutions,
        })
    }
}

/// Exercises stored in the `exercises` table
pub struct SqliteExerciseRepository {
    pool: SqlitePool,
}

impl SqliteExerciseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExerciseRepository for SqliteExerciseRepository {
    async fn fetch_by_id(&self, id: u32) -> anyhow::Result<Option<Exercise>> {
        log::debug!("Trying to fetch exercise {id} from database");

        let row = sqlx::query_as::<_, ExerciseRow>(
            r"
            SELECT id, title, body, difficulty, test_cases, solutions
            FROM exercises
            WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Exercise::try_from).transpose()
    }
}
