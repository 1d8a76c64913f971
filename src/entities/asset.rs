use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "assets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub title: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub content_kind: ContentKind,
    pub storage_provider: StorageProvider,
    #[sea_orm(unique)]
    pub storage_path: String,
    pub format: String,
    pub size: i64,
    pub duration: Option<f64>,
    pub resolution: Option<String>,
    pub processing_state: ProcessingState,
    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,
    pub match_id: Option<String>,
    pub match_date: Option<DateTime>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub competition: Option<String>,
    pub season: Option<String>,
    pub has_tracking_data: bool,
    pub tracking_path: Option<String>,
    pub event_path: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
    pub purged_at: Option<DateTime>,
}

impl Model {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Every storage key this asset points at, primary object first.
    pub fn storage_keys(&self) -> Vec<&str> {
        let mut keys = vec![self.storage_path.as_str()];
        for extra in [&self.tracking_path, &self.event_path].into_iter().flatten() {
            if extra != &self.storage_path {
                keys.push(extra.as_str());
            }
        }
        keys
    }
}

#[derive(
    EnumIter, DeriveActiveEnum, Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize,
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl ProcessingState {
    /// Legal edges: pending -> processing -> {completed, failed}, and the
    /// explicit retry failed -> pending. `completed` is terminal.
    pub fn can_transition_to(self, target: ProcessingState) -> bool {
        use ProcessingState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ProcessingState::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processing => "processing",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ProcessingState::Pending),
            "processing" => Ok(ProcessingState::Processing),
            "completed" => Ok(ProcessingState::Completed),
            "failed" => Ok(ProcessingState::Failed),
            other => Err(format!("unknown processing state '{}'", other)),
        }
    }
}

#[derive(
    EnumIter, DeriveActiveEnum, Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize,
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    #[sea_orm(string_value = "filesystem")]
    Filesystem,
    #[sea_orm(string_value = "cloud_blob")]
    CloudBlob,
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageProvider::Filesystem => f.write_str("filesystem"),
            StorageProvider::CloudBlob => f.write_str("cloud_blob"),
        }
    }
}

#[derive(
    EnumIter, DeriveActiveEnum, Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize,
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[sea_orm(string_value = "video")]
    Video,
    #[sea_orm(string_value = "tracking")]
    Tracking,
    #[sea_orm(string_value = "event")]
    Event,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Tracking => "tracking",
            ContentKind::Event => "event",
        }
    }

    /// Lower-case extensions (without the dot) accepted for this kind.
    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            ContentKind::Video => &["mp4", "mov", "avi", "mkv", "webm"],
            ContentKind::Tracking | ContentKind::Event => {
                &["gzip", "gz", "parquet", "json", "jsonl", "csv"]
            }
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(ContentKind::Video),
            "tracking" => Ok(ContentKind::Tracking),
            "event" | "events" => Ok(ContentKind::Event),
            other => Err(format!("unknown content kind '{}'", other)),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessingState::*;

    #[test]
    fn only_documented_edges_are_legal() {
        let all = [Pending, Processing, Completed, Failed];
        let legal = [
            (Pending, Processing),
            (Processing, Completed),
            (Processing, Failed),
            (Failed, Pending),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn completed_is_terminal() {
        assert!(Completed.is_terminal());
        assert!(!Failed.is_terminal());
        for target in [Pending, Processing, Completed, Failed] {
            assert!(!Completed.can_transition_to(target));
        }
    }

    #[test]
    fn parses_kinds_and_states() {
        assert_eq!("Tracking".parse::<ContentKind>().unwrap(), ContentKind::Tracking);
        assert_eq!("events".parse::<ContentKind>().unwrap(), ContentKind::Event);
        assert!("audio".parse::<ContentKind>().is_err());
        assert_eq!(" failed ".parse::<ProcessingState>().unwrap(), Failed);
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Processing).unwrap(), "\"processing\"");
        assert_eq!(
            serde_json::to_string(&StorageProvider::CloudBlob).unwrap(),
            "\"cloud_blob\""
        );
    }
}
