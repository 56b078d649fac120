use chrono::{DateTime, Utc};

use crate::paths::ProjectLayout;
use crate::types::Constitution;

#[derive(Debug, thiserror::Error)]
pub enum ConstitutionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConstitutionError>;

/// Write `.orc/CONSTITUTION.md`, creating the `.orc` directory if needed.
pub async fn save_constitution(layout: &ProjectLayout, content: &str) -> Result<()> {
    let path = layout.constitution_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(())
}

/// Load the project constitution. Returns `None` when the file is absent;
/// `updated_at` reflects the file's mtime.
pub async fn load_constitution(layout: &ProjectLayout) -> Result<Option<Constitution>> {
    let path = layout.constitution_path();
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let content = tokio::fs::read_to_string(&path).await?;
    let updated_at: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(Some(Constitution {
        content,
        path: path.display().to_string(),
        updated_at,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
