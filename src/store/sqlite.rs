//! sqlite implementation of [`RoutingStore`].
//!
//! One connection behind a mutex; multi-statement operations run inside a
//! transaction. Branch creation, routing, and fact replacement write rows to
//! the `routing_log` audit table. Centroids and fact entry histories are
//! JSON text columns.

use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::EngineError;
use crate::model::facts::{FactMap, FactValue};
use crate::model::{Branch, Conversation, Message, Role};
use crate::store::{BranchUpdate, NewBranch, NewMessage, RoutingStore};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Store(anyhow!("db lock poisoned: {e}")))
    }
}

fn store_err(e: rusqlite::Error) -> EngineError {
    EngineError::Store(anyhow!(e))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn centroid_to_json(centroid: &[f32]) -> String {
    serde_json::to_string(centroid).expect("f32 slice serializes")
}

fn centroid_from_json(json: &str) -> Vec<f32> {
    serde_json::from_str(json).unwrap_or_default()
}

/// Write an entry to the routing_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    branch_id: Option<&str>,
    message_id: Option<&str>,
    details: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO routing_log (operation, branch_id, message_id, details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            operation,
            branch_id,
            message_id,
            details.map(|d| d.to_string()),
            now()
        ],
    )?;
    Ok(())
}

fn branch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        parent_id: row.get(2)?,
        topic: row.get(3)?,
        context: row.get(4)?,
        message_count: row.get(5)?,
        centroid: centroid_from_json(&row.get::<_, String>(6)?),
        depth: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const BRANCH_COLUMNS: &str = "id, conversation_id, parent_id, topic, context, \
     message_count, centroid, depth, created_at, updated_at";

impl RoutingStore for SqliteStore {
    fn get_or_create_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, EngineError> {
        let conn = self.lock()?;

        // Composite-key lookup: the id alone is not enough, tenants are
        // isolated.
        let existing = conn
            .query_row(
                "SELECT id, tenant_id, active_branch_id, created_at, updated_at \
                 FROM conversations WHERE id = ?1 AND tenant_id = ?2",
                params![conversation_id, tenant_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        active_branch_id: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(store_err)?;

        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        // A conversation id owned by another tenant must not be adopted.
        let taken: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if taken {
            return Err(EngineError::NotFound(format!(
                "conversation not found: {conversation_id}"
            )));
        }

        let timestamp = now();
        conn.execute(
            "INSERT INTO conversations (id, tenant_id, active_branch_id, created_at, updated_at) \
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![conversation_id, tenant_id, timestamp],
        )
        .map_err(store_err)?;
        tracing::info!(conversation = %conversation_id, tenant = %tenant_id, "conversation created");

        Ok(Conversation {
            id: conversation_id.to_string(),
            tenant_id: tenant_id.to_string(),
            active_branch_id: None,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        })
    }

    fn list_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {BRANCH_COLUMNS} FROM branches WHERE conversation_id = ?1 \
                 ORDER BY updated_at DESC, created_at DESC"
            ))
            .map_err(store_err)?;
        let branches = stmt
            .query_map(params![conversation_id], branch_from_row)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(branches)
    }

    fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>, EngineError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1"),
            params![branch_id],
            branch_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn create_branch(&self, branch: NewBranch<'_>) -> Result<Branch, EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;

        let id = uuid::Uuid::now_v7().to_string();
        let timestamp = now();
        tx.execute(
            "INSERT INTO branches (id, conversation_id, parent_id, topic, context, \
             message_count, centroid, depth, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)",
            params![
                id,
                branch.conversation_id,
                branch.parent_id,
                branch.topic,
                branch.context,
                centroid_to_json(branch.centroid),
                branch.depth,
                timestamp,
            ],
        )
        .map_err(store_err)?;

        write_audit_log(
            &tx,
            "create_branch",
            Some(&id),
            None,
            Some(&serde_json::json!({"topic": branch.topic, "depth": branch.depth})),
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        tracing::info!(branch = %id, topic = %branch.topic, "branch created");

        Ok(Branch {
            id,
            conversation_id: branch.conversation_id.to_string(),
            parent_id: branch.parent_id.map(str::to_string),
            topic: branch.topic.to_string(),
            context: branch.context.map(str::to_string),
            message_count: 0,
            centroid: branch.centroid.to_vec(),
            depth: branch.depth,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        })
    }

    fn append_message(&self, message: NewMessage<'_>) -> Result<Message, EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;

        let id = uuid::Uuid::now_v7().to_string();
        let timestamp = now();
        tx.execute(
            "INSERT INTO messages (id, branch_id, role, content, embedding, action, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                message.branch_id,
                message.role.as_str(),
                message.content,
                message.embedding.map(centroid_to_json),
                message.action.as_str(),
                message.reason,
                timestamp,
            ],
        )
        .map_err(store_err)?;

        write_audit_log(
            &tx,
            "route",
            Some(message.branch_id),
            Some(&id),
            Some(&serde_json::json!({"action": message.action.as_str(), "role": message.role.as_str()})),
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;

        Ok(Message {
            id,
            branch_id: message.branch_id.to_string(),
            role: message.role,
            content: message.content.to_string(),
            embedding: message.embedding.map(<[f32]>::to_vec),
            action: message.action,
            reason: message.reason.to_string(),
            created_at: timestamp,
        })
    }

    fn update_branch(
        &self,
        branch_id: &str,
        update: BranchUpdate<'_>,
    ) -> Result<(), EngineError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE branches SET \
                 context = COALESCE(?1, context), \
                 centroid = COALESCE(?2, centroid), \
                 message_count = COALESCE(?3, message_count), \
                 updated_at = ?4 \
                 WHERE id = ?5",
                params![
                    update.context,
                    update.centroid.map(centroid_to_json),
                    update.message_count,
                    now(),
                    branch_id,
                ],
            )
            .map_err(store_err)?;
        if rows == 0 {
            return Err(EngineError::NotFound(format!("branch not found: {branch_id}")));
        }
        Ok(())
    }

    fn set_active_branch(
        &self,
        conversation_id: &str,
        branch_id: &str,
    ) -> Result<(), EngineError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE conversations SET active_branch_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![branch_id, now(), conversation_id],
            )
            .map_err(store_err)?;
        if rows == 0 {
            return Err(EngineError::NotFound(format!(
                "conversation not found: {conversation_id}"
            )));
        }
        Ok(())
    }

    fn load_facts(&self, branch_id: &str) -> Result<FactMap, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, entries FROM branch_facts WHERE branch_id = ?1")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![branch_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        let mut map = FactMap::new();
        for (key, entries_json) in rows {
            let entries: Vec<FactValue> = serde_json::from_str(&entries_json)
                .map_err(|e| EngineError::Store(anyhow!("corrupt fact entries for {key}: {e}")))?;
            map.0.insert(key, entries);
        }
        Ok(map)
    }

    fn replace_facts(&self, branch_id: &str, facts: &FactMap) -> Result<(), EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        replace_facts_tx(&tx, branch_id, facts).map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    fn recent_messages(
        &self,
        branch_id: &str,
        role: Role,
        limit: usize,
    ) -> Result<Vec<String>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT content FROM messages WHERE branch_id = ?1 AND role = ?2 \
                 ORDER BY created_at DESC LIMIT ?3",
            )
            .map_err(store_err)?;
        let mut contents = stmt
            .query_map(params![branch_id, role.as_str(), limit as i64], |row| {
                row.get(0)
            })
            .map_err(store_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(store_err)?;
        contents.reverse(); // oldest first
        Ok(contents)
    }

    fn branch_transcript(
        &self,
        branch_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT role, content FROM messages WHERE branch_id = ?1 \
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(store_err)?;
        let mut lines = stmt
            .query_map(params![branch_id, limit as i64], |row| {
                Ok(format!(
                    "{}: {}",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?
                ))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(store_err)?;
        lines.reverse();
        Ok(lines)
    }

    fn ancestor_chain(&self, branch_id: &str) -> Result<Vec<Branch>, EngineError> {
        let mut chain = Vec::new();
        let mut cursor = self
            .get_branch(branch_id)?
            .ok_or_else(|| EngineError::NotFound(format!("branch not found: {branch_id}")))?;

        // Depth bounds the walk; parent links cannot cycle under the
        // one-parent invariant.
        for _ in 0..=cursor.depth {
            let Some(parent_id) = cursor.parent_id.clone() else {
                break;
            };
            let parent = self.get_branch(&parent_id)?.ok_or_else(|| {
                EngineError::Store(anyhow!("dangling parent link: {parent_id}"))
            })?;
            chain.push(parent.clone());
            cursor = parent;
        }
        Ok(chain)
    }
}

/// Delete and rewrite all fact rows of a branch inside the given
/// transaction, with one audit entry for the replacement.
fn replace_facts_tx(
    tx: &Transaction<'_>,
    branch_id: &str,
    facts: &FactMap,
) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM branch_facts WHERE branch_id = ?1",
        params![branch_id],
    )?;

    let timestamp = now();
    for (key, entries) in &facts.0 {
        // Contributing message ids: everything that introduced or superseded
        // a value under this key.
        let message_ids: BTreeSet<&str> = entries
            .iter()
            .flat_map(|e| {
                std::iter::once(e.source_message_id.as_str())
                    .chain(e.superseded_by.as_deref())
            })
            .collect();

        tx.execute(
            "INSERT INTO branch_facts (branch_id, key, entries, message_ids, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                branch_id,
                key,
                serde_json::to_string(entries).expect("fact entries serialize"),
                serde_json::to_string(&message_ids).expect("id set serializes"),
                timestamp,
            ],
        )?;
    }

    write_audit_log(
        tx,
        "facts_replace",
        Some(branch_id),
        None,
        Some(&serde_json::json!({"keys": facts.0.len()})),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::facts::{merge_facts, ExtractedFact, ExtractedValue};
    use crate::model::RouteAction;

    fn test_store() -> SqliteStore {
        SqliteStore::new(crate::db::open_memory_database().unwrap())
    }

    fn seed_branch(store: &SqliteStore, conversation_id: &str, topic: &str) -> Branch {
        store.get_or_create_conversation("tenant-a", conversation_id).unwrap();
        store
            .create_branch(NewBranch {
                conversation_id,
                parent_id: None,
                topic,
                context: None,
                centroid: &[],
                depth: 0,
            })
            .unwrap()
    }

    #[test]
    fn conversation_is_created_once() {
        let store = test_store();
        let first = store.get_or_create_conversation("tenant-a", "conv-1").unwrap();
        let second = store.get_or_create_conversation("tenant-a", "conv-1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn conversation_is_tenant_isolated() {
        let store = test_store();
        store.get_or_create_conversation("tenant-a", "conv-1").unwrap();
        let err = store
            .get_or_create_conversation("tenant-b", "conv-1")
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn branches_list_most_recently_updated_first() {
        let store = test_store();
        let a = seed_branch(&store, "conv-1", "first");
        let b = store
            .create_branch(NewBranch {
                conversation_id: "conv-1",
                parent_id: Some(&a.id),
                topic: "second",
                context: None,
                centroid: &[],
                depth: 1,
            })
            .unwrap();

        // Touch the older branch so it becomes most recent
        store
            .update_branch(
                &a.id,
                BranchUpdate {
                    message_count: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();

        let branches = store.list_branches("conv-1").unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].id, a.id);
        assert_eq!(branches[1].id, b.id);
    }

    #[test]
    fn message_round_trips_with_action() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");

        let message = store
            .append_message(NewMessage {
                branch_id: &branch.id,
                role: Role::User,
                content: "hello",
                embedding: Some(&[0.5, 0.5]),
                action: RouteAction::Branch,
                reason: "first message",
            })
            .unwrap();

        let recent = store.recent_messages(&branch.id, Role::User, 5).unwrap();
        assert_eq!(recent, vec!["hello"]);
        assert_eq!(message.action, RouteAction::Branch);
    }

    #[test]
    fn recent_messages_filters_by_role_and_orders_oldest_first() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");
        for (i, role) in [Role::User, Role::Assistant, Role::User].iter().enumerate() {
            store
                .append_message(NewMessage {
                    branch_id: &branch.id,
                    role: *role,
                    content: &format!("m{i}"),
                    embedding: None,
                    action: RouteAction::Stay,
                    reason: "",
                })
                .unwrap();
        }

        let recent = store.recent_messages(&branch.id, Role::User, 5).unwrap();
        assert_eq!(recent, vec!["m0", "m2"]);
    }

    #[test]
    fn transcript_limits_apply_and_keep_oldest_first_order() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");
        for i in 0..4 {
            store
                .append_message(NewMessage {
                    branch_id: &branch.id,
                    role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                    content: &format!("m{i}"),
                    embedding: None,
                    action: RouteAction::Stay,
                    reason: "",
                })
                .unwrap();
        }

        // Limit keeps the most recent rows but returns them oldest first
        let transcript = store.branch_transcript(&branch.id, 2).unwrap();
        assert_eq!(transcript, vec!["user: m2", "assistant: m3"]);

        let recent = store.recent_messages(&branch.id, Role::User, 1).unwrap();
        assert_eq!(recent, vec!["m2"]);

        // A limit larger than the row count returns everything
        let all = store.branch_transcript(&branch.id, 100).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn branch_update_overwrites_context_and_centroid() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");

        store
            .update_branch(
                &branch.id,
                BranchUpdate {
                    context: Some("planning a trip"),
                    centroid: Some(&[1.0, 0.0]),
                    message_count: Some(3),
                },
            )
            .unwrap();

        let reloaded = store.get_branch(&branch.id).unwrap().unwrap();
        assert_eq!(reloaded.context.as_deref(), Some("planning a trip"));
        assert_eq!(reloaded.centroid, vec![1.0, 0.0]);
        assert_eq!(reloaded.message_count, 3);
    }

    #[test]
    fn update_missing_branch_is_not_found() {
        let store = test_store();
        seed_branch(&store, "conv-1", "topic");
        let err = store
            .update_branch("missing", BranchUpdate::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn facts_bulk_replace_round_trips() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");

        let mut map = FactMap::new();
        merge_facts(
            &mut map,
            &[ExtractedFact {
                key: "destination".into(),
                is_update: false,
                values: vec![ExtractedValue {
                    value: "Paris".into(),
                    confidence: 0.9,
                    supersedes: vec![],
                }],
            }],
            "msg-1",
        );

        store.replace_facts(&branch.id, &map).unwrap();
        let loaded = store.load_facts(&branch.id).unwrap();
        assert_eq!(loaded.active_values("destination"), vec!["Paris"]);

        // Replacing again with an updated map leaves exactly the new rows
        merge_facts(
            &mut map,
            &[ExtractedFact {
                key: "hotel".into(),
                is_update: false,
                values: vec![ExtractedValue {
                    value: "Ritz".into(),
                    confidence: 0.8,
                    supersedes: vec![],
                }],
            }],
            "msg-2",
        );
        store.replace_facts(&branch.id, &map).unwrap();
        let loaded = store.load_facts(&branch.id).unwrap();
        assert_eq!(loaded.keys(), vec!["destination", "hotel"]);
    }

    #[test]
    fn ancestor_chain_walks_to_root() {
        let store = test_store();
        let root = seed_branch(&store, "conv-1", "root");
        let mid = store
            .create_branch(NewBranch {
                conversation_id: "conv-1",
                parent_id: Some(&root.id),
                topic: "mid",
                context: None,
                centroid: &[],
                depth: 1,
            })
            .unwrap();
        let leaf = store
            .create_branch(NewBranch {
                conversation_id: "conv-1",
                parent_id: Some(&mid.id),
                topic: "leaf",
                context: None,
                centroid: &[],
                depth: 2,
            })
            .unwrap();

        let chain = store.ancestor_chain(&leaf.id).unwrap();
        let topics: Vec<&str> = chain.iter().map(|b| b.topic.as_str()).collect();
        assert_eq!(topics, vec!["mid", "root"]);
    }

    #[test]
    fn audit_log_records_branch_creation_and_routing() {
        let store = test_store();
        let branch = seed_branch(&store, "conv-1", "topic");
        store
            .append_message(NewMessage {
                branch_id: &branch.id,
                role: Role::User,
                content: "hi",
                embedding: None,
                action: RouteAction::Branch,
                reason: "",
            })
            .unwrap();

        let conn = store.conn.lock().unwrap();
        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM routing_log ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(ops, vec!["create_branch", "route"]);
    }
}
