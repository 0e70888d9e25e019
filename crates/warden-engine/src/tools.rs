//! Provider-neutral stateful tool registry (spec §4.D), wrapping
//! `warden-tools`'s static handlers and adding the tools that need
//! Store/Queue/subagent access: `ask_user`, the scheduled-job CRUD trio,
//! and `delegate_task`/`explore_task`.
//!
//! Grounded on the teacher's `gateway/runtime/tools.rs` `dispatch_tool`
//! (schema validation before invocation, synthesized error for missing
//! required args) and `sa_domain::tool::ToolDefinition`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use warden_domain::model::{self, ScheduledJob};
use warden_domain::tool::ToolDefinition;
use warden_domain::{Error, Result};
use warden_providers::LlmRouter;
use warden_store::Store;
use warden_tools::{file_ops, shell};

use crate::cancel::CancelToken;
use crate::subagent::{self, SubagentKind};

/// Per-call context threaded through dispatch: which job/conversation this
/// call belongs to (if any), whether the job runs headless, and the
/// cancellation token that sub-agent loops should observe.
#[derive(Clone)]
pub struct ToolContext {
    pub job_id: Option<String>,
    pub conversation_id: Option<String>,
    pub headless: bool,
    pub ask_user_default: Option<String>,
    pub cancel: CancelToken,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            job_id: None,
            conversation_id: None,
            headless: false,
            ask_user_default: None,
            cancel: CancelToken::new(),
        }
    }
}

pub struct ToolRegistry {
    workspace_root: PathBuf,
    store: Arc<Store>,
    router: Arc<LlmRouter>,
    defaults: HashMap<String, Value>,
}

fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a file within the workspace, optionally by line range.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"},
                },
                "required": ["path"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "write_file".into(),
            description: "Write (overwrite) a file within the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "list_dir".into(),
            description: "List a directory within the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": [],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "search_in_files".into(),
            description: "Fast exact-text search across workspace files (like grep).".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "glob": {"type": "string"},
                    "max_results": {"type": "integer"},
                    "case_sensitive": {"type": "boolean"},
                },
                "required": ["query"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "recall_from_chat".into(),
            description: "Search earlier messages in the current conversation for exact details.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "role_filter": {"type": "string"},
                    "max_results": {"type": "integer"},
                },
                "required": ["query"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command with a timeout, confined to the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_secs": {"type": "integer"},
                    "workdir": {"type": "string"},
                },
                "required": ["command"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "ask_user".into(),
            description: "Ask the user a clarifying question and pause for their reply.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "options": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["question"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "create_scheduled_job".into(),
            description: "Create a new CRON-driven scheduled job.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "prompt": {"type": "string"},
                    "cron_expression": {"type": "string"},
                    "schedule_description": {"type": "string"},
                    "timezone": {"type": "string"},
                },
                "required": ["name", "prompt", "cron_expression"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "update_scheduled_job".into(),
            description: "Update fields on an existing scheduled job.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "prompt": {"type": "string"},
                    "cron_expression": {"type": "string"},
                    "is_enabled": {"type": "boolean"},
                },
                "required": ["id"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "list_scheduled_jobs".into(),
            description: "List all scheduled jobs.".into(),
            parameters: json!({"type": "object", "properties": {}, "additionalProperties": false}),
        },
        ToolDefinition {
            name: "delegate_task".into(),
            description: "Delegate a bounded task to a sub-agent with the full tool set.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"task": {"type": "string"}},
                "required": ["task"],
                "additionalProperties": false,
            }),
        },
        ToolDefinition {
            name: "explore_task".into(),
            description: "Investigate a question using only read-only tools.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"task": {"type": "string"}},
                "required": ["task"],
                "additionalProperties": false,
            }),
        },
    ]
}

impl ToolRegistry {
    pub fn new(workspace_root: PathBuf, store: Arc<Store>, router: Arc<LlmRouter>) -> Self {
        Self {
            workspace_root,
            store,
            router,
            defaults: HashMap::new(),
        }
    }

    pub fn set_default(&mut self, tool_name: impl Into<String>, value: Value) {
        self.defaults.insert(tool_name.into(), value);
    }

    /// All schemas, provider-neutral function-calling shape (spec §4.D
    /// `get_openai_specs`).
    pub fn get_openai_specs(&self) -> Vec<ToolDefinition> {
        definitions()
    }

    /// Schemas filtered to a restricted subset (used by sub-agent executors).
    pub fn specs_for(&self, names: &[&str]) -> Vec<ToolDefinition> {
        definitions().into_iter().filter(|d| names.contains(&d.name.as_str())).collect()
    }

    /// Validate required parameters are present (non-null) without
    /// invoking the handler — the caller uses this to synthesize a
    /// descriptive error for schema violations (spec §4.J.5 step 2).
    pub fn validate_required(&self, name: &str, args: &Value) -> std::result::Result<(), String> {
        let def = definitions()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| format!("unknown tool '{name}'"))?;
        let required = def
            .parameters
            .get("required")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for field in required {
            let Some(field) = field.as_str() else { continue };
            let present = args.get(field).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(format!("missing required argument: {field}"));
            }
        }
        Ok(())
    }

    fn merge_defaults(&self, name: &str, mut args: Value) -> Value {
        if let Some(defaults) = self.defaults.get(name) {
            if let (Some(obj), Some(default_obj)) = (args.as_object_mut(), defaults.as_object()) {
                for (k, v) in default_obj {
                    let missing = obj.get(k).map(|existing| existing.is_null()).unwrap_or(true);
                    if missing {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        args
    }

    /// Invoke `name` with `args`, merging defaults for missing/null keys
    /// first. Errors are returned as `Ok` with an `is_error` wrapper by the
    /// caller (the registry itself surfaces a `Result` only for the
    /// "unknown tool" and "invalid arguments" cases; handler-level failures
    /// come back as a JSON error payload so the LLM can see and react).
    pub async fn call(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
        let args = self.merge_defaults(name, args);
        match name {
            "read_file" => self.read_file(args).await,
            "write_file" => self.write_file(args).await,
            "list_dir" => self.list_dir(args).await,
            "search_in_files" => self.search_in_files(args).await,
            "recall_from_chat" => self.recall_from_chat(args, ctx),
            "shell" => self.shell(args, ctx).await,
            "ask_user" => self.ask_user(args, ctx),
            "create_scheduled_job" => self.create_scheduled_job(args),
            "update_scheduled_job" => self.update_scheduled_job(args),
            "list_scheduled_jobs" => self.list_scheduled_jobs(),
            "delegate_task" => self.delegate_task(args, ctx).await,
            "explore_task" => self.explore_task(args, ctx).await,
            other => Err(Error::ToolNotFound(other.to_string())),
        }
    }

    async fn read_file(&self, args: Value) -> Result<Value> {
        let req: file_ops::FileReadRequest =
            serde_json::from_value(args).map_err(|e| Error::Other(format!("invalid arguments: {e}")))?;
        file_ops::file_read(&self.workspace_root, req)
            .await
            .map_err(Error::Other)
    }

    async fn write_file(&self, args: Value) -> Result<Value> {
        let req: file_ops::FileWriteRequest =
            serde_json::from_value(args).map_err(|e| Error::Other(format!("invalid arguments: {e}")))?;
        file_ops::file_write(&self.workspace_root, req)
            .await
            .map_err(Error::Other)
    }

    async fn list_dir(&self, args: Value) -> Result<Value> {
        let req: file_ops::FileListRequest =
            serde_json::from_value(args).map_err(|e| Error::Other(format!("invalid arguments: {e}")))?;
        file_ops::file_list(&self.workspace_root, req)
            .await
            .map_err(Error::Other)
    }

    async fn search_in_files(&self, args: Value) -> Result<Value> {
        let req: file_ops::FileSearchRequest =
            serde_json::from_value(args).map_err(|e| Error::Other(format!("invalid arguments: {e}")))?;
        file_ops::file_search(&self.workspace_root, req).await.map_err(Error::Other)
    }

    /// spec §4.F/§4.I: keyword search over the current conversation's
    /// persisted messages, excluding tool messages by default. Returns full
    /// message content (not snippets) so the agent can recover exact values
    /// a summary may have dropped.
    fn recall_from_chat(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let query = field_str(&args, "query")?;
        let Some(conversation_id) = ctx.conversation_id.as_deref() else {
            return Ok(json!({"error": "no conversation context", "results": []}));
        };
        let role_filter = args.get("role_filter").and_then(|v| v.as_str());
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|n| n.clamp(1, 20) as usize)
            .unwrap_or(5);

        let needle = query.to_lowercase();
        let mut matches: Vec<model::Message> = self
            .store
            .list_messages(conversation_id)
            .into_iter()
            .filter(|m| match role_filter {
                Some("user") => m.role == model::Role::User,
                Some("assistant") => m.role == model::Role::Assistant,
                Some("tool") => m.role == model::Role::Tool,
                _ => matches!(m.role, model::Role::User | model::Role::Assistant),
            })
            .filter(|m| m.content.as_deref().unwrap_or_default().to_lowercase().contains(&needle))
            .collect();

        matches.sort_by(|a, b| b.id.cmp(&a.id));
        matches.truncate(max_results);
        matches.reverse();

        let results: Vec<Value> = matches
            .iter()
            .map(|m| {
                let mut content = m.content.clone().unwrap_or_default();
                if content.len() > 4000 {
                    let omitted = content.len() - 3500;
                    content.truncate(3500);
                    content.push_str(&format!("\n...[truncated {omitted} chars]..."));
                }
                json!({
                    "message_id": m.id,
                    "role": m.role,
                    "timestamp": m.created_at,
                    "content": content,
                })
            })
            .collect();

        Ok(json!({
            "query": query,
            "results_count": results.len(),
            "results": results,
        }))
    }

    async fn shell(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let req: shell::ShellRequest =
            serde_json::from_value(args).map_err(|e| Error::Other(format!("invalid arguments: {e}")))?;
        let command = req.command.clone();
        let resp = shell::run(req).await.map_err(Error::Other)?;
        let run = warden_store::ShellRun {
            id: 0,
            job_id: ctx.job_id.clone(),
            command,
            exit_code: resp.exit_code,
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        };
        self.store.record_shell_run(run)?;
        Ok(serde_json::to_value(resp)?)
    }

    /// spec §4.J.6: headless jobs record the default answer immediately and
    /// never pause; interactive jobs return a `stop_execution` signal that
    /// the main loop turns into a visible question and a transition to
    /// `waiting_for_input`.
    fn ask_user(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let question = args
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let options = args.get("options").cloned();

        if ctx.headless {
            let answer = ctx.ask_user_default.clone().unwrap_or_default();
            Ok(json!({"answered": true, "question": question, "answer": answer}))
        } else {
            Ok(json!({"stop_execution": true, "question": question, "options": options}))
        }
    }

    fn create_scheduled_job(&self, args: Value) -> Result<Value> {
        let name = field_str(&args, "name")?;
        let prompt = field_str(&args, "prompt")?;
        let cron_expression = field_str(&args, "cron_expression")?;
        crate::scheduler::validate_cron(&cron_expression).map_err(Error::Config)?;
        let schedule_description = args
            .get("schedule_description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let timezone = args
            .get("timezone")
            .and_then(|v| v.as_str())
            .unwrap_or("Europe/Warsaw")
            .to_string();

        let now = chrono::Utc::now();
        let job = ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: String::new(),
            name,
            prompt,
            cron_expression: cron_expression.clone(),
            schedule_description,
            timezone: timezone.clone(),
            is_enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: crate::scheduler::next_run_after(&cron_expression, &now, &timezone),
            run_count: 0,
            context_json: None,
            files_dir: None,
        };
        self.store.upsert_scheduled_job(job.clone())?;
        Ok(serde_json::to_value(job)?)
    }

    fn update_scheduled_job(&self, args: Value) -> Result<Value> {
        let id = field_str(&args, "id")?;
        if let Some(cron) = args.get("cron_expression").and_then(|v| v.as_str()) {
            crate::scheduler::validate_cron(cron).map_err(Error::Config)?;
        }
        let updated = self.store.update_scheduled_job(&id, |job| {
            if let Some(prompt) = args.get("prompt").and_then(|v| v.as_str()) {
                job.prompt = prompt.to_string();
            }
            if let Some(cron) = args.get("cron_expression").and_then(|v| v.as_str()) {
                job.cron_expression = cron.to_string();
                job.next_run_at = crate::scheduler::next_run_after(cron, &chrono::Utc::now(), &job.timezone);
            }
            if let Some(enabled) = args.get("is_enabled").and_then(|v| v.as_bool()) {
                job.is_enabled = enabled;
            }
            job.updated_at = chrono::Utc::now();
        })?;
        if !updated {
            return Err(Error::Store(format!("unknown scheduled job {id}")));
        }
        Ok(json!({"updated": true, "id": id}))
    }

    fn list_scheduled_jobs(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.store.list_scheduled_jobs())?)
    }

    async fn delegate_task(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let task = field_str(&args, "task")?;
        let result = subagent::run_subagent(SubagentKind::Delegate, &task, &self.router, self, &ctx.cancel).await;
        Ok(serde_json::to_value(result)?)
    }

    async fn explore_task(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let task = field_str(&args, "task")?;
        let result = subagent::run_subagent(SubagentKind::Explore, &task, &self.router, self, &ctx.cancel).await;
        Ok(serde_json::to_value(result)?)
    }
}

fn field_str(args: &Value, field: &str) -> Result<String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Other(format!("missing required argument: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ToolRegistry, tempfile::TempDir, tempfile::TempDir) {
        let ws = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(state.path()).unwrap());
        let router = Arc::new(LlmRouter::from_config(&warden_domain::config::LlmConfig::default()).unwrap());
        (ToolRegistry::new(ws.path().to_path_buf(), store, router), ws, state)
    }

    #[test]
    fn validate_required_catches_missing_field() {
        let (reg, _ws, _state) = registry();
        let err = reg.validate_required("read_file", &json!({})).unwrap_err();
        assert!(err.contains("path"));
    }

    #[test]
    fn validate_required_passes_when_present() {
        let (reg, _ws, _state) = registry();
        assert!(reg.validate_required("read_file", &json!({"path": "a.txt"})).is_ok());
    }

    #[tokio::test]
    async fn ask_user_headless_answers_immediately() {
        let (reg, _ws, _state) = registry();
        let ctx = ToolContext {
            headless: true,
            ask_user_default: Some("yes".into()),
            ..Default::default()
        };
        let result = reg.call("ask_user", json!({"question": "continue?"}), &ctx).await.unwrap();
        assert_eq!(result["answered"], json!(true));
        assert_eq!(result["answer"], json!("yes"));
    }

    #[tokio::test]
    async fn ask_user_interactive_signals_stop() {
        let (reg, _ws, _state) = registry();
        let ctx = ToolContext::default();
        let result = reg
            .call("ask_user", json!({"question": "which format?", "options": ["PDF"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["stop_execution"], json!(true));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (reg, _ws, _state) = registry();
        let ctx = ToolContext::default();
        reg.call("write_file", json!({"path": "a.txt", "content": "hi"}), &ctx)
            .await
            .unwrap();
        let result = reg.call("read_file", json!({"path": "a.txt"}), &ctx).await.unwrap();
        assert_eq!(result["content"], json!("hi"));
    }

    #[test]
    fn defaults_merge_for_missing_keys() {
        let (mut reg, _ws, _state) = registry();
        reg.set_default("list_dir", json!({"path": "."}));
        let merged = reg.merge_defaults("list_dir", json!({}));
        assert_eq!(merged["path"], json!("."));
    }

    #[test]
    fn unknown_tool_is_not_in_specs() {
        let (reg, _ws, _state) = registry();
        assert!(reg.specs_for(&["read_file"]).iter().all(|d| d.name == "read_file"));
    }

    #[tokio::test]
    async fn search_in_files_finds_written_content() {
        let (reg, _ws, _state) = registry();
        let ctx = ToolContext::default();
        reg.call("write_file", json!({"path": "a.txt", "content": "needle here"}), &ctx)
            .await
            .unwrap();
        let result = reg
            .call("search_in_files", json!({"query": "needle"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["results_count"], json!(1));
    }

    #[tokio::test]
    async fn recall_from_chat_without_conversation_returns_empty() {
        let (reg, _ws, _state) = registry();
        let ctx = ToolContext::default();
        let result = reg.call("recall_from_chat", json!({"query": "anything"}), &ctx).await.unwrap();
        assert_eq!(result["results"], json!([]));
    }

    fn test_message(conversation_id: &str, role: model::Role, content: &str) -> model::Message {
        model::Message {
            id: 0,
            conversation_id: conversation_id.to_string(),
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn recall_from_chat_matches_stored_messages() {
        let (reg, _ws, state) = registry();
        let store = Store::open(state.path()).unwrap();
        let conv = store.create_conversation(Some("test".into())).unwrap();
        store
            .append_message(&conv.id, test_message(&conv.id, model::Role::User, "where is the treasure map?"))
            .unwrap();
        store
            .append_message(&conv.id, test_message(&conv.id, model::Role::Assistant, "it's in the attic"))
            .unwrap();

        let ctx = ToolContext {
            conversation_id: Some(conv.id.clone()),
            ..Default::default()
        };
        let result = reg
            .call("recall_from_chat", json!({"query": "treasure"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["results_count"], json!(1));
        assert_eq!(result["results"][0]["role"], json!("user"));
    }
}
