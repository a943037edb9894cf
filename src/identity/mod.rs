//! Persistent agent identities.
//!
//! One JSON document on disk holds every identity, keyed by `agent_id`.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written store. `identity_uuid`, `agent_id` and `created_at` are
//! immutable after creation.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

const PROTECTED_FIELDS: &[&str] = &["identity_uuid", "agent_id", "created_at"];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no identity for agent {0}")]
    NotFound(String),

    #[error("field `{0}` is protected and cannot be updated")]
    ProtectedField(String),

    #[error("unknown identity field `{0}`")]
    UnknownField(String),
}

/// A persistent identity for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub identity_uuid: String,
    pub agent_id: String,
    pub display_name: String,
    pub role: String,
    pub personality_traits: Vec<String>,
    pub appearance: Appearance,
    pub created_at: String,
    pub last_active: String,
    pub conversation_count: u64,
    pub sessions: Vec<SessionRef>,
    pub preferences: Value,
    pub stats: IdentityStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appearance {
    pub avatar_style: String,
    pub color_theme: String,
    pub icon: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityStats {
    pub messages_sent: u64,
    pub conversations_participated: u64,
    pub tasks_completed: u64,
    pub tools_used: Vec<String>,
}

/// What an agent did, for `record_activity`.
#[derive(Debug, Clone)]
pub enum Activity {
    MessageSent,
    ConversationJoined { session_id: String },
    TaskCompleted,
    ToolUsed { tool: String },
}

/// Manages the identity document.
pub struct IdentityManager {
    storage_path: PathBuf,
    identities: RwLock<HashMap<String, Identity>>,
}

impl IdentityManager {
    /// Load identities from `storage_path`, starting empty when the file
    /// does not exist yet.
    pub fn load(storage_path: PathBuf) -> Result<Self> {
        let identities = match std::fs::read_to_string(&storage_path) {
            Ok(raw) => serde_json::from_str(&raw).with_context(|| {
                format!("corrupt identity store at {}", storage_path.display())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read identity store {}", storage_path.display())
                })
            }
        };
        tracing::info!(count = identities.len(), "loaded identities");
        Ok(Self {
            storage_path,
            identities: RwLock::new(identities),
        })
    }

    /// Create an identity, filling role-based defaults for anything the
    /// caller left out. Creating over an existing agent id replaces it.
    pub async fn create(
        &self,
        agent_id: &str,
        display_name: Option<String>,
        role: Option<String>,
        personality_traits: Option<Vec<String>>,
        appearance: Option<String>,
    ) -> Result<Identity> {
        let role = role.unwrap_or_else(|| "general".to_string());
        let display_name = display_name.unwrap_or_else(|| default_display_name(agent_id, &role));
        let traits = personality_traits.unwrap_or_else(|| default_traits(&role));
        let appearance = match appearance {
            Some(style) => Appearance {
                avatar_style: style,
                ..default_appearance(&role)
            },
            None => default_appearance(&role),
        };
        let now = ksi_protocol::timestamp_utc();
        let identity = Identity {
            identity_uuid: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            display_name,
            role,
            personality_traits: traits,
            appearance,
            created_at: now.clone(),
            last_active: now,
            conversation_count: 0,
            sessions: Vec::new(),
            preferences: json!({
                "communication_style": "professional",
                "verbosity": "moderate",
                "formality": "balanced",
            }),
            stats: IdentityStats::default(),
        };

        let mut identities = self.identities.write().await;
        identities.insert(agent_id.to_string(), identity.clone());
        self.persist(&identities).await?;
        tracing::info!(agent_id, display_name = %identity.display_name, "created identity");
        Ok(identity)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Identity> {
        self.identities.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Identity> {
        let mut all: Vec<Identity> = self.identities.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    /// Merge `updates` into an identity. Protected fields are rejected, not
    /// silently dropped, so callers learn about their mistake.
    pub async fn update(
        &self,
        agent_id: &str,
        updates: &HashMap<String, Value>,
    ) -> Result<Identity, IdentityError> {
        for field in updates.keys() {
            if PROTECTED_FIELDS.contains(&field.as_str()) {
                return Err(IdentityError::ProtectedField(field.clone()));
            }
        }

        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::NotFound(agent_id.to_string()))?;

        for (field, value) in updates {
            apply_field(identity, field, value)?;
        }
        identity.last_active = ksi_protocol::timestamp_utc();

        let updated = identity.clone();
        if let Err(e) = self.persist(&identities).await {
            tracing::error!(error = %e, "failed to persist identity update");
        }
        Ok(updated)
    }

    pub async fn remove(&self, agent_id: &str) -> Result<Option<Identity>> {
        let mut identities = self.identities.write().await;
        let removed = identities.remove(agent_id);
        if removed.is_some() {
            self.persist(&identities).await?;
        }
        Ok(removed)
    }

    /// Bump activity stats and `last_active`.
    pub async fn record_activity(&self, agent_id: &str, activity: Activity) -> Result<()> {
        let mut identities = self.identities.write().await;
        let Some(identity) = identities.get_mut(agent_id) else {
            return Ok(());
        };
        match activity {
            Activity::MessageSent => identity.stats.messages_sent += 1,
            Activity::ConversationJoined { session_id } => {
                identity.stats.conversations_participated += 1;
                identity.conversation_count += 1;
                identity.sessions.push(SessionRef {
                    session_id,
                    started_at: ksi_protocol::timestamp_utc(),
                });
            }
            Activity::TaskCompleted => identity.stats.tasks_completed += 1,
            Activity::ToolUsed { tool } => {
                if !identity.stats.tools_used.contains(&tool) {
                    identity.stats.tools_used.push(tool);
                }
            }
        }
        identity.last_active = ksi_protocol::timestamp_utc();
        self.persist(&identities).await
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    async fn persist(&self, identities: &HashMap<String, Identity>) -> Result<()> {
        let payload = serde_json::to_vec_pretty(identities)?;
        let path = self.storage_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let tmp = path.with_extension("json.tmp");
            {
                use std::io::Write;
                let mut file = std::fs::File::create(&tmp)
                    .with_context(|| format!("failed to create {}", tmp.display()))?;
                file.write_all(&payload)?;
                file.sync_all()?;
            }
            std::fs::rename(&tmp, &path)
                .with_context(|| format!("failed to replace {}", path.display()))?;
            Ok(())
        })
        .await
        .context("identity persist task panicked")?
    }
}

/// Apply one update to a known field; unknown names are an error rather
/// than a silent no-op.
fn apply_field(identity: &mut Identity, field: &str, value: &Value) -> Result<(), IdentityError> {
    let invalid = || IdentityError::UnknownField(field.to_string());
    match field {
        "display_name" => {
            identity.display_name = value.as_str().ok_or_else(invalid)?.to_string();
        }
        "role" => {
            identity.role = value.as_str().ok_or_else(invalid)?.to_string();
        }
        "personality_traits" => {
            identity.personality_traits =
                serde_json::from_value(value.clone()).map_err(|_| invalid())?;
        }
        "appearance" => {
            identity.appearance = serde_json::from_value(value.clone()).map_err(|_| invalid())?;
        }
        "preferences" => {
            identity.preferences = value.clone();
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

fn default_display_name(agent_id: &str, role: &str) -> String {
    let tail: String = agent_id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let mut role_title = role.to_string();
    if let Some(first) = role_title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!("{role_title}-{tail}")
}

fn default_traits(role: &str) -> Vec<String> {
    let traits: &[&str] = match role {
        "researcher" => &["analytical", "thorough", "curious", "methodical"],
        "coder" => &["logical", "detail-oriented", "problem-solver", "systematic"],
        "debater" => &["articulate", "persuasive", "competitive", "analytical"],
        "teacher" => &["patient", "explanatory", "encouraging", "structured"],
        "creative" => &["imaginative", "innovative", "expressive", "artistic"],
        "analyst" => &["logical", "systematic", "objective", "precise"],
        "collaborator" => &["cooperative", "diplomatic", "supportive", "flexible"],
        "orchestrator" => &["organized", "strategic", "coordinating", "decisive"],
        _ => &["adaptive", "helpful", "professional", "reliable"],
    };
    traits.iter().map(|s| s.to_string()).collect()
}

fn default_appearance(role: &str) -> Appearance {
    let (avatar_style, color_theme, icon) = match role {
        "researcher" => ("academic", "blue", "🧑‍🔬"),
        "coder" => ("technical", "green", "🧑‍💻"),
        "debater" => ("formal", "red", "🗣️"),
        "teacher" => ("friendly", "orange", "🧑‍🏫"),
        "creative" => ("artistic", "purple", "🎨"),
        "analyst" => ("professional", "navy", "📊"),
        "collaborator" => ("approachable", "teal", "🤝"),
        "orchestrator" => ("executive", "gold", "🎭"),
        _ => ("neutral", "gray", "🤖"),
    };
    Appearance {
        avatar_style: avatar_style.to_string(),
        color_theme: color_theme.to_string(),
        icon: icon.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, IdentityManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = IdentityManager::load(dir.path().join("identities.json")).unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn creates_with_role_defaults() {
        let (_dir, manager) = manager();
        let identity = manager
            .create("agent-1234", None, Some("researcher".into()), None, None)
            .await
            .unwrap();
        assert_eq!(identity.display_name, "Researcher-1234");
        assert!(identity
            .personality_traits
            .contains(&"analytical".to_string()));
        assert_eq!(identity.appearance.color_theme, "blue");
        assert_eq!(identity.stats.messages_sent, 0);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        {
            let manager = IdentityManager::load(path.clone()).unwrap();
            manager
                .create("a1", Some("Ada".into()), None, None, None)
                .await
                .unwrap();
        }
        let reloaded = IdentityManager::load(path).unwrap();
        let identity = reloaded.get("a1").await.unwrap();
        assert_eq!(identity.display_name, "Ada");
        assert_eq!(identity.role, "general");
    }

    #[tokio::test]
    async fn protected_fields_are_rejected() {
        let (_dir, manager) = manager();
        manager.create("a1", None, None, None, None).await.unwrap();

        let mut updates = HashMap::new();
        updates.insert("agent_id".to_string(), Value::String("a2".into()));
        let err = manager.update("a1", &updates).await.unwrap_err();
        assert!(matches!(err, IdentityError::ProtectedField(f) if f == "agent_id"));

        // Nothing changed.
        assert_eq!(manager.get("a1").await.unwrap().agent_id, "a1");
    }

    #[tokio::test]
    async fn update_merges_known_fields() {
        let (_dir, manager) = manager();
        manager.create("a1", None, None, None, None).await.unwrap();

        let mut updates = HashMap::new();
        updates.insert("display_name".to_string(), Value::String("Turing".into()));
        updates.insert(
            "personality_traits".to_string(),
            serde_json::json!(["terse"]),
        );
        let updated = manager.update("a1", &updates).await.unwrap();
        assert_eq!(updated.display_name, "Turing");
        assert_eq!(updated.personality_traits, vec!["terse".to_string()]);

        let unknown: HashMap<String, Value> =
            [("no_such_field".to_string(), Value::Null)].into();
        assert!(matches!(
            manager.update("a1", &unknown).await.unwrap_err(),
            IdentityError::UnknownField(_)
        ));
    }

    #[tokio::test]
    async fn record_activity_updates_stats() {
        let (_dir, manager) = manager();
        manager.create("a1", None, None, None, None).await.unwrap();

        manager
            .record_activity("a1", Activity::MessageSent)
            .await
            .unwrap();
        manager
            .record_activity(
                "a1",
                Activity::ConversationJoined {
                    session_id: "s1".into(),
                },
            )
            .await
            .unwrap();
        manager
            .record_activity("a1", Activity::ToolUsed { tool: "Read".into() })
            .await
            .unwrap();
        manager
            .record_activity("a1", Activity::ToolUsed { tool: "Read".into() })
            .await
            .unwrap();

        let identity = manager.get("a1").await.unwrap();
        assert_eq!(identity.stats.messages_sent, 1);
        assert_eq!(identity.conversation_count, 1);
        assert_eq!(identity.sessions.len(), 1);
        assert_eq!(identity.stats.tools_used, vec!["Read".to_string()]);
    }

    #[tokio::test]
    async fn remove_deletes_and_persists() {
        let (_dir, manager) = manager();
        manager.create("a1", None, None, None, None).await.unwrap();
        assert!(manager.remove("a1").await.unwrap().is_some());
        assert!(manager.remove("a1").await.unwrap().is_none());
        assert_eq!(manager.len().await, 0);
    }
}
