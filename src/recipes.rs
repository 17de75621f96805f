use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Vllm,
    Sglang,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Sglang => "sglang",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Vllm => 8000,
            Self::Sglang => 30000,
        }
    }
}

/// Launch configuration for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model_path: String,
    #[serde(default)]
    pub served_model_name: Option<String>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Recipe {
    /// The name the backend serves this recipe under.
    pub fn canonical_name(&self) -> &str {
        match self.served_model_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid recipe data: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// All recipes in store order.
    async fn list(&self) -> Result<Vec<Recipe>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteRecipeStore {
    pool: Pool<Sqlite>,
}

impl SqliteRecipeStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS recipes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn upsert(&self, recipe: &Recipe) -> Result<(), StoreError> {
        let data = serde_json::to_string(recipe)?;
        sqlx::query(
            r#"INSERT INTO recipes (id, name, data, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                data = excluded.data,
                updated_at = excluded.updated_at"#,
        )
        .bind(&recipe.id)
        .bind(&recipe.name)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Recipe>, StoreError> {
        let row = sqlx::query("SELECT data FROM recipes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM recipes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RecipeStore for SqliteRecipeStore {
    async fn list(&self) -> Result<Vec<Recipe>, StoreError> {
        let rows = sqlx::query("SELECT data FROM recipes ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }
}
