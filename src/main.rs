use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    serde::{Deserialize, Serialize},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde_json::json;
use tracing::{info, warn};

use graph_memory_mcp::config::{Config, load_config};
use graph_memory_mcp::logging::{DEFAULT_LOG_FILE, TransportMode, init_logging};
use graph_memory_mcp::memory::embedding::{embed_entities, embed_entity, reindex_embeddings};
use graph_memory_mcp::memory::import::{ImportMode, parse_decisions};
use graph_memory_mcp::memory::tree::{TreeDocument, parse_document, parse_document_value};
use graph_memory_mcp::memory::{
    Database, Embedder, EntityUpdate, GraphError, GraphExporter, HybridRanker, ImportExecutor,
    ImportMatcher, NewEntity, NodeConsolidator, OrphanMatcher,
};
use graph_memory_mcp::params::{id_list, number_or_string, option_number_or_string};

const DEFAULT_REINDEX_LIMIT: usize = 100;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// SQLite database file (must end in .db); overrides the config file
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file (default: <binary>.toml next to the executable)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable streamable HTTP mode (default: stdio)
    #[arg(short = 's', long = "stream")]
    stream_mode: bool,

    /// HTTP port for stream mode
    #[arg(short = 'p', long, default_value = "8000")]
    port: u16,

    /// Bind address for stream mode
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable file logging. Optionally specify log file name (default: graph-memory-mcp.log)
    #[arg(short = 'l', long, value_name = "FILE", num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    log: Option<String>,
}

#[derive(Clone)]
struct GraphMemoryServer {
    db: Database,
    embedder: Arc<dyn Embedder>,
    search_limit: usize,
    import_mode: ImportMode,
    tool_router: ToolRouter<Self>,
}

impl GraphMemoryServer {
    fn new(db: Database, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        Self {
            db,
            embedder,
            search_limit: config.search_limit,
            import_mode: config.import_mode,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: "graph-memory-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Long-term knowledge graph memory. Entities are linked child -> parent by \
                 part_of/depends_on relations; use search_nodes to find them, export_nodes and \
                 preview_import/execute_import to move subtrees, merge_nodes/move_node/delete_node \
                 to reorganize."
                    .to_string(),
            ),
        }
    }

    /// Run an engine call on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, McpError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &dyn Embedder) -> graph_memory_mcp::memory::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let embedder = self.embedder.clone();
        tokio::task::spawn_blocking(move || f(&db, embedder.as_ref()))
            .await
            .map_err(internal_err("Worker task failed"))?
            .map_err(graph_error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct SearchNodesArgs {
    query: String,
    #[serde(default, deserialize_with = "option_number_or_string")]
    #[schemars(with = "Option<usize>")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ExportNodesArgs {
    /// Root entity ids to export
    #[serde(deserialize_with = "id_list")]
    #[schemars(with = "Vec<i64>")]
    entity_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct PreviewImportArgs {
    /// Export document (object or JSON string) with a root_nodes array
    document: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ExecuteImportArgs {
    /// Export document (object or JSON string) with a root_nodes array
    document: serde_json::Value,
    /// Map of node_path to {action, target_id?, parent_id?}; missing paths are created
    #[serde(default)]
    decisions: serde_json::Value,
    /// best_effort (default from config) or atomic
    #[serde(default)]
    mode: Option<ImportMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct MoveNodeArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    node_id: i64,
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    parent_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct MergeNodesArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    source_id: i64,
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    target_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteNodeArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    node_id: i64,
    /// Also delete every descendant reachable through part_of/depends_on
    #[serde(default)]
    cascade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct UpdateEntityArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    entity_id: i64,
    #[serde(flatten)]
    update: EntityUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct AddObservationsArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    entity_id: i64,
    observations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteObservationArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    observation_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CreateRelationArgs {
    /// Child (or source) entity id
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    from_id: i64,
    /// Parent (or target) entity id
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    to_id: i64,
    relation_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteRelationArgs {
    #[serde(deserialize_with = "number_or_string")]
    #[schemars(with = "i64")]
    relation_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct OpenNodeArgs {
    #[serde(default, deserialize_with = "option_number_or_string")]
    #[schemars(with = "Option<i64>")]
    entity_id: Option<i64>,
    /// Exact entity name, used when entity_id is absent
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ReindexArgs {
    #[serde(default, deserialize_with = "option_number_or_string")]
    #[schemars(with = "Option<usize>")]
    limit: Option<usize>,
}

#[tool_router]
impl GraphMemoryServer {
    #[tool(
        name = "search_nodes",
        description = "Rank entities by name, type and aliases; fused with semantic similarity when embeddings are enabled."
    )]
    async fn search_nodes(
        &self,
        Parameters(SearchNodesArgs { query, limit }): Parameters<SearchNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let limit = limit.unwrap_or(self.search_limit);
        let results = self
            .run(move |db, embedder| HybridRanker::new(db, embedder).search(&query, limit))
            .await?;

        let lines: Vec<String> = results
            .iter()
            .map(|r| {
                format!(
                    "#{} {} [{}] score {:.4}",
                    r.entity.id, r.entity.name, r.entity.entity_type, r.score
                )
            })
            .collect();
        structured(
            if lines.is_empty() { "No matches".to_string() } else { lines.join("\n") },
            json!({ "results": results }),
        )
    }

    #[tool(
        name = "list_root_nodes",
        description = "List entities without a parent: Projects first, then everything else, by name."
    )]
    async fn list_root_nodes(&self) -> Result<CallToolResult, McpError> {
        let roots = self.run(|db, _| GraphExporter::new(db).root_nodes()).await?;
        let text = roots
            .iter()
            .map(|e| format!("#{} {} [{}]", e.id, e.name, e.entity_type))
            .collect::<Vec<_>>()
            .join("\n");
        structured(text, json!({ "root_nodes": roots }))
    }

    #[tool(
        name = "export_nodes",
        description = "Export entities and their subtrees (children and lateral links) as a portable JSON tree."
    )]
    async fn export_nodes(
        &self,
        Parameters(ExportNodesArgs { entity_ids }): Parameters<ExportNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        if entity_ids.is_empty() {
            return Err(McpError::invalid_params("entity_ids must not be empty", None));
        }
        let document = self
            .run(move |db, _| GraphExporter::new(db).export(&entity_ids))
            .await?;
        let value = serde_json::to_value(&document).map_err(internal_err("Failed to serialize export"))?;
        let text = serde_json::to_string_pretty(&value).map_err(internal_err("Failed to serialize export"))?;
        structured(text, value)
    }

    #[tool(
        name = "list_orphans",
        description = "List non-Project roots with their top suggested parent Projects."
    )]
    async fn list_orphans(&self) -> Result<CallToolResult, McpError> {
        let orphans = self.run(|db, _| OrphanMatcher::new(db).orphans_with_matches()).await?;
        let text = orphans
            .iter()
            .map(|o| {
                let suggestions = o
                    .suggested_parents
                    .iter()
                    .map(|p| format!("{} ({})", p.project_name, p.score))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("#{} {} [{}] -> {}", o.id, o.name, o.entity_type, suggestions)
            })
            .collect::<Vec<_>>()
            .join("\n");
        structured(text, json!({ "orphans": orphans }))
    }

    #[tool(
        name = "preview_import",
        description = "Classify every node of an export document against the graph (high/low/new, child actions) without writing."
    )]
    async fn preview_import(
        &self,
        Parameters(PreviewImportArgs { document }): Parameters<PreviewImportArgs>,
    ) -> Result<CallToolResult, McpError> {
        let document = import_document(document).map_err(graph_error)?;
        let preview = self
            .run(move |db, _| ImportMatcher::new(db).preview(&document))
            .await?;
        let s = &preview.summary;
        let text = format!(
            "{} nodes: {} high, {} low, {} new; children: {} create, {} add_relation, {} skip",
            s.total, s.high, s.low, s.new, s.create, s.add_relation, s.skip
        );
        structured(text, json!(preview))
    }

    #[tool(
        name = "execute_import",
        description = "Apply an export document using per-node decisions (create, merge, skip, add_relation) keyed by node_path."
    )]
    async fn execute_import(
        &self,
        Parameters(ExecuteImportArgs { document, decisions, mode }): Parameters<ExecuteImportArgs>,
    ) -> Result<CallToolResult, McpError> {
        let document = import_document(document).map_err(graph_error)?;
        let decisions = parse_decisions(decisions).map_err(graph_error)?;
        let mode = mode.unwrap_or(self.import_mode);
        let report = self
            .run(move |db, embedder| {
                let report = ImportExecutor::new(db).with_mode(mode).execute(&document, &decisions)?;
                refresh_embeddings(db, embedder, &report.touched_ids);
                Ok(report)
            })
            .await?;
        let mut text = format!(
            "{}: {} created, {} merged, {} skipped, {} observations, {} relations",
            if report.rolled_back {
                "Rolled back"
            } else if report.success {
                "Imported"
            } else {
                "Imported with errors"
            },
            report.entities_created,
            report.entities_merged,
            report.entities_skipped,
            report.observations_created,
            report.relations_created
        );
        for error in &report.errors {
            text.push_str(&format!("\n- {}", error));
        }
        structured(text, json!(report))
    }

    #[tool(
        name = "move_node",
        description = "Re-parent a node: drop its part_of/depends_on links and add part_of to the new parent."
    )]
    async fn move_node(
        &self,
        Parameters(MoveNodeArgs { node_id, parent_id }): Parameters<MoveNodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let relation = self
            .run(move |db, _| NodeConsolidator::new(db).move_node(node_id, parent_id))
            .await?;
        structured(
            format!("Moved #{} under #{}", node_id, parent_id),
            json!({ "relation": relation }),
        )
    }

    #[tool(
        name = "merge_nodes",
        description = "Merge source into target: aliases unioned, all observations and relations moved, source deleted."
    )]
    async fn merge_nodes(
        &self,
        Parameters(MergeNodesArgs { source_id, target_id }): Parameters<MergeNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .run(move |db, embedder| {
                let report = NodeConsolidator::new(db).merge(source_id, target_id)?;
                refresh_embeddings(db, embedder, &[report.target.id]);
                Ok(report)
            })
            .await?;
        structured(
            format!(
                "Merged #{} into #{}: {} observations moved, {} relations re-pointed, {} dropped",
                source_id,
                target_id,
                report.observations_moved,
                report.relations_repointed,
                report.relations_dropped
            ),
            json!(report),
        )
    }

    #[tool(
        name = "delete_node",
        description = "Delete a node. Without cascade its children become roots; with cascade the whole subtree goes."
    )]
    async fn delete_node(
        &self,
        Parameters(DeleteNodeArgs { node_id, cascade }): Parameters<DeleteNodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let deleted = self
            .run(move |db, _| NodeConsolidator::new(db).delete(node_id, cascade))
            .await?;
        structured(
            format!("Deleted {} entities", deleted),
            json!({ "deleted": deleted }),
        )
    }

    #[tool(
        name = "create_entity",
        description = "Create an entity with optional aliases, description and initial observations."
    )]
    async fn create_entity(
        &self,
        Parameters(input): Parameters<NewEntity>,
    ) -> Result<CallToolResult, McpError> {
        let entity = self
            .run(move |db, embedder| {
                let entity = db.create_entity(&input)?;
                embed_entity(db, embedder, &entity)?;
                Ok(entity)
            })
            .await?;
        info!(id = entity.id, name = %entity.name, "Created entity");
        structured(
            format!("Created #{} {}", entity.id, entity.name),
            json!({ "entity": entity }),
        )
    }

    #[tool(
        name = "update_entity",
        description = "Update an entity's name, type, aliases or description; omitted fields stay unchanged."
    )]
    async fn update_entity(
        &self,
        Parameters(UpdateEntityArgs { entity_id, update }): Parameters<UpdateEntityArgs>,
    ) -> Result<CallToolResult, McpError> {
        let entity = self
            .run(move |db, embedder| {
                let entity = db.update_entity(entity_id, &update)?;
                embed_entity(db, embedder, &entity)?;
                Ok(entity)
            })
            .await?;
        structured(
            format!("Updated #{} {}", entity.id, entity.name),
            json!({ "entity": entity }),
        )
    }

    #[tool(
        name = "add_observations",
        description = "Attach observations to an entity; contents it already has are skipped."
    )]
    async fn add_observations(
        &self,
        Parameters(AddObservationsArgs { entity_id, observations }): Parameters<AddObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let added = self
            .run(move |db, _| db.add_observations(entity_id, &observations))
            .await?;
        structured(
            format!("Added {} observations to #{}", added.len(), entity_id),
            json!({ "added": added }),
        )
    }

    #[tool(name = "delete_observation", description = "Delete one observation by id.")]
    async fn delete_observation(
        &self,
        Parameters(DeleteObservationArgs { observation_id }): Parameters<DeleteObservationArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run(move |db, _| db.delete_observation(observation_id)).await?;
        structured(
            format!("Deleted observation #{}", observation_id),
            json!({ "deleted": observation_id }),
        )
    }

    #[tool(
        name = "create_relation",
        description = "Link two entities. part_of/depends_on read child (from) -> parent (to). Duplicates are ignored."
    )]
    async fn create_relation(
        &self,
        Parameters(CreateRelationArgs { from_id, to_id, relation_type }): Parameters<CreateRelationArgs>,
    ) -> Result<CallToolResult, McpError> {
        let relation = self
            .run(move |db, _| db.create_relation(from_id, to_id, &relation_type))
            .await?;
        let text = match &relation {
            Some(r) => format!("Created relation #{}", r.id),
            None => "Relation already exists".to_string(),
        };
        structured(text, json!({ "relation": relation }))
    }

    #[tool(name = "delete_relation", description = "Delete one relation by id.")]
    async fn delete_relation(
        &self,
        Parameters(DeleteRelationArgs { relation_id }): Parameters<DeleteRelationArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run(move |db, _| db.delete_relation(relation_id)).await?;
        structured(
            format!("Deleted relation #{}", relation_id),
            json!({ "deleted": relation_id }),
        )
    }

    #[tool(
        name = "open_node",
        description = "Show an entity (by id or exact name) with its observations and relations."
    )]
    async fn open_node(
        &self,
        Parameters(OpenNodeArgs { entity_id, name }): Parameters<OpenNodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        if entity_id.is_none() && name.is_none() {
            return Err(McpError::invalid_params("Provide entity_id or name", None));
        }
        let (entity, observations, relations) = self
            .run(move |db, _| {
                let found = match (entity_id, &name) {
                    (Some(id), _) => db.get_entity(id)?,
                    (None, Some(name)) => db.find_entity_by_name(name)?,
                    (None, None) => None,
                };
                let entity = found.ok_or_else(|| GraphError::NotFound {
                    kind: "Entity",
                    id: entity_id.map(|id| id.to_string()).or(name).unwrap_or_default(),
                })?;
                let observations = db.observations_for(entity.id)?;
                let relations = db.relations_for(entity.id)?;
                Ok((entity, observations, relations))
            })
            .await?;

        let mut text = format!("#{} {} [{}]", entity.id, entity.name, entity.entity_type);
        if let Some(aliases) = &entity.aliases {
            text.push_str(&format!("\naliases: {}", aliases));
        }
        for observation in &observations {
            text.push_str(&format!("\n- {}", observation.content));
        }
        structured(
            text,
            json!({ "entity": entity, "observations": observations, "relations": relations }),
        )
    }

    #[tool(
        name = "reindex_embeddings",
        description = "Compute embeddings for entities that have none (no-op when embeddings are disabled)."
    )]
    async fn reindex_embeddings(
        &self,
        Parameters(ReindexArgs { limit }): Parameters<ReindexArgs>,
    ) -> Result<CallToolResult, McpError> {
        let limit = limit.unwrap_or(DEFAULT_REINDEX_LIMIT);
        let updated = self
            .run(move |db, embedder| reindex_embeddings(db, embedder, limit))
            .await?;
        structured(
            format!("Embedded {} entities", updated),
            json!({ "updated": updated, "vector_enabled": self.embedder.vector_enabled() }),
        )
    }

    #[tool(name = "graph_stats", description = "Count entities, observations and relations.")]
    async fn graph_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.run(|db, _| db.stats()).await?;
        structured(
            format!(
                "{} entities, {} observations, {} relations",
                stats.entities, stats.observations, stats.relations
            ),
            json!(stats),
        )
    }
}

#[tool_handler]
impl ServerHandler for GraphMemoryServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

/// Run server in stdio mode (default)
async fn run_stdio_mode(server: GraphMemoryServer) -> anyhow::Result<()> {
    let transport = stdio();
    let svc = server.serve(transport).await?;
    svc.waiting().await?;
    Ok(())
}

/// Run server in streamable HTTP mode
async fn run_stream_mode(server: GraphMemoryServer, bind: &str, port: u16) -> anyhow::Result<()> {
    use rmcp::transport::StreamableHttpService;
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;

    let addr = format!("{}:{}", bind, port);
    info!("Starting MCP HTTP server on http://{}/mcp", addr);

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "OK" }));

    let tcp_listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mode = if args.stream_mode {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };

    // stdio mode must not write to stderr before the handshake completes
    init_logging(mode, args.log)?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let embedder = config.build_embedder();
    let server = GraphMemoryServer::new(db, embedder, &config);

    match mode {
        TransportMode::Stdio => run_stdio_mode(server).await,
        TransportMode::Stream => run_stream_mode(server, &args.bind, args.port).await,
    }
}

fn internal_err<T: ToString>(message: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::internal_error(message, Some(json!({ "error": err.to_string() })))
}

fn graph_error(err: GraphError) -> McpError {
    if err.is_client_error() {
        McpError::invalid_params(err.to_string(), None)
    } else {
        McpError::internal_error(err.to_string(), None)
    }
}

fn structured(text: String, value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(value),
        is_error: Some(false),
        meta: None,
    })
}

/// Re-embed entities whose text just changed. The write is already committed,
/// so a failure here only leaves a stale vector behind.
fn refresh_embeddings(db: &Database, embedder: &dyn Embedder, ids: &[i64]) {
    if let Err(err) = embed_entities(db, embedder, ids) {
        warn!(error = %err, "Failed to refresh embeddings");
    }
}

/// Accept the document either as a JSON object or as a JSON-encoded string.
fn import_document(value: serde_json::Value) -> graph_memory_mcp::memory::Result<TreeDocument> {
    match value {
        serde_json::Value::String(text) => parse_document(&text),
        other => parse_document_value(other),
    }
}
