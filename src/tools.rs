//! Tool descriptors and the handlers behind `MCP/callTool`.
//!
//! Every failure a tool can hit, from a missing parameter to a driver error,
//! is reported as `{success: false, error}` inside a successful RPC result.

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::classifier::{classify, Verdict};
use crate::db::{quote_identifier, ConnectionManager, Target};
use crate::executor::{self, QueryLimits, QueryRequest, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Array,
}

impl ParamKind {
    fn schema_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Array => "array",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_u64() || value.is_i64(),
            ParamKind::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    pub allow_empty: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            allow_empty: false,
            default: None,
        }
    }

    fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ConnectDb,
    ListDatabases,
    ListTables,
    DescribeTable,
    ExecuteQuery,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    kind: ToolKind,
}

impl ToolDescriptor {
    fn schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = json!({
                "type": param.kind.schema_type(),
                "description": param.description,
            });
            if let (Some(default), Value::Object(map)) = (&param.default, &mut property) {
                map.insert("default".into(), default.clone());
            }
            properties.insert(param.name.into(), property);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        json!({
            "description": self.description,
            "parameters": {
                "properties": properties,
                "required": required,
            }
        })
    }

    /// Check `arguments` against the schema and fill in defaults.
    fn validate(&self, arguments: Value) -> Result<Map<String, Value>, String> {
        let mut args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err("Tool parameters must be an object".to_string()),
        };

        for param in &self.params {
            let missing = matches!(args.get(param.name), None | Some(Value::Null));
            if missing {
                if param.required {
                    return Err(format!("Missing required parameter: {}", param.name));
                }
                args.remove(param.name);
                if let Some(default) = &param.default {
                    args.insert(param.name.into(), default.clone());
                }
                continue;
            }

            let value = &args[param.name];
            if !param.kind.accepts(value) {
                return Err(format!(
                    "Parameter '{}' must be of type {}",
                    param.name,
                    param.kind.schema_type()
                ));
            }
            if param.required && !param.allow_empty && value.as_str().is_some_and(|s| s.trim().is_empty()) {
                return Err(format!("Parameter '{}' must not be empty", param.name));
            }
        }
        Ok(args)
    }
}

/// What a tool call hands back inside the RPC `result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolResult {
    Query(QueryResult),
    Connected {
        success: bool,
        message: String,
        database: Option<String>,
    },
}

impl ToolResult {
    pub fn failure(message: impl Into<String>) -> Self {
        ToolResult::Query(QueryResult::failure(message))
    }

    pub fn is_success(&self) -> bool {
        match self {
            ToolResult::Query(result) => result.success,
            ToolResult::Connected { success, .. } => *success,
        }
    }
}

/// The state a handler may touch.
pub struct ToolContext<'a> {
    pub db: &'a mut ConnectionManager,
    pub limits: &'a QueryLimits,
}

pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let database = || ParamSpec::optional("database", ParamKind::String, "Database name");
        let tools = vec![
            ToolDescriptor {
                name: "connect_db",
                description: "Connect to a MySQL server, replacing the current connection",
                params: vec![
                    ParamSpec::required("host", ParamKind::String, "Server hostname or IP address"),
                    ParamSpec::optional("port", ParamKind::Integer, "Server port").with_default(json!(3306)),
                    ParamSpec::required("user", ParamKind::String, "Username"),
                    ParamSpec::required("password", ParamKind::String, "Password").allow_empty(),
                    ParamSpec::optional("database", ParamKind::String, "Default database"),
                ],
                kind: ToolKind::ConnectDb,
            },
            ToolDescriptor {
                name: "list_databases",
                description: "List all accessible databases",
                params: vec![],
                kind: ToolKind::ListDatabases,
            },
            ToolDescriptor {
                name: "list_tables",
                description: "List all tables in a database",
                params: vec![database()],
                kind: ToolKind::ListTables,
            },
            ToolDescriptor {
                name: "describe_table",
                description: "Show the schema for a table",
                params: vec![
                    ParamSpec::required("table", ParamKind::String, "Table name"),
                    database(),
                ],
                kind: ToolKind::DescribeTable,
            },
            ToolDescriptor {
                name: "execute_query",
                description: "Execute a read-only SQL query",
                params: vec![
                    ParamSpec::required(
                        "query",
                        ParamKind::String,
                        "SQL query (SELECT, SHOW, DESCRIBE, DESC or EXPLAIN only)",
                    ),
                    database(),
                    ParamSpec::optional(
                        "params",
                        ParamKind::Array,
                        "Values bound to ? placeholders, in order",
                    ),
                ],
                kind: ToolKind::ExecuteQuery,
            },
        ];
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Payload for `MCP/listTools`.
    pub fn list(&self) -> Value {
        let tools: Map<String, Value> = self
            .tools
            .iter()
            .map(|t| (t.name.to_string(), t.schema()))
            .collect();
        json!({ "tools": tools })
    }

    pub async fn call(&self, name: &str, arguments: Value, ctx: ToolContext<'_>) -> ToolResult {
        let Some(tool) = self.get(name) else {
            warn!("Unknown tool requested: {name}");
            return ToolResult::failure(format!("Unknown tool: {name}"));
        };
        let args = match tool.validate(arguments) {
            Ok(args) => args,
            Err(message) => {
                debug!("Rejected parameters for {name}: {message}");
                return ToolResult::failure(message);
            }
        };
        debug!("Calling tool {name}");

        match tool.kind {
            ToolKind::ConnectDb => connect_db(&args, ctx).await,
            ToolKind::ListDatabases => run(ctx, QueryRequest::new("SHOW DATABASES")).await,
            ToolKind::ListTables => {
                run(ctx, QueryRequest::new("SHOW FULL TABLES").in_database(database_arg(&args))).await
            }
            ToolKind::DescribeTable => describe_table(&args, ctx).await,
            ToolKind::ExecuteQuery => execute_query(&args, ctx).await,
        }
    }
}

fn string_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

/// The optional `database` override. An empty string means no override.
fn database_arg(args: &Map<String, Value>) -> Option<String> {
    string_arg(args, "database").filter(|db| !db.is_empty())
}

async fn connect_db(args: &Map<String, Value>, ctx: ToolContext<'_>) -> ToolResult {
    let port = match args.get("port").and_then(Value::as_u64).map(u16::try_from) {
        Some(Ok(port)) if port > 0 => port,
        _ => return ToolResult::failure("Parameter 'port' must be between 1 and 65535"),
    };
    let target = Target {
        host: string_arg(args, "host").unwrap_or_default(),
        port,
        user: string_arg(args, "user").unwrap_or_default(),
        password: string_arg(args, "password").unwrap_or_default(),
        database: database_arg(args),
    };

    if let Some(previous) = ctx.db.target() {
        info!("Replacing connection to {previous}");
    }
    info!("Connecting to {target}");
    let summary = target.to_string();
    let database = target.database.clone();
    match ctx.db.configure(target, 1).await {
        Ok(()) => ToolResult::Connected {
            success: true,
            message: format!("Connected to {summary}"),
            database,
        },
        Err(e) => ToolResult::failure(format!("Failed to connect: {e}")),
    }
}

async fn describe_table(args: &Map<String, Value>, ctx: ToolContext<'_>) -> ToolResult {
    let table = string_arg(args, "table").unwrap_or_default();
    let quoted = match quote_identifier(&table) {
        Ok(quoted) => quoted,
        Err(e) => return ToolResult::failure(e.to_string()),
    };
    run(
        ctx,
        QueryRequest::new(format!("DESCRIBE {quoted}")).in_database(database_arg(args)),
    )
    .await
}

async fn execute_query(args: &Map<String, Value>, ctx: ToolContext<'_>) -> ToolResult {
    let query = string_arg(args, "query").unwrap_or_default();
    if let Verdict::Rejected(reason) = classify(&query) {
        info!("Rejected query: {reason}");
        return ToolResult::failure(reason.to_string());
    }
    let params = match args.get("params") {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    };
    run(
        ctx,
        QueryRequest::new(query)
            .in_database(database_arg(args))
            .with_params(params),
    )
    .await
}

async fn run(ctx: ToolContext<'_>, request: QueryRequest) -> ToolResult {
    if let Some(db) = &request.database {
        if let Err(e) = quote_identifier(db) {
            return ToolResult::failure(e.to_string());
        }
    }
    let checkout = match ctx.db.acquire().await {
        Ok(checkout) => checkout,
        Err(e) => return ToolResult::failure(e.to_string()),
    };
    ToolResult::Query(executor::execute(checkout, &request, ctx.limits).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PoolSettings;

    async fn call(name: &str, arguments: Value) -> ToolResult {
        let mut db = ConnectionManager::new(PoolSettings::default());
        let limits = QueryLimits::default();
        ToolRegistry::new()
            .call(name, arguments, ToolContext { db: &mut db, limits: &limits })
            .await
    }

    fn error_of(result: ToolResult) -> String {
        match result {
            ToolResult::Query(QueryResult {
                success: false,
                error: Some(error),
                ..
            }) => error,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn listing_describes_every_tool() {
        let listing = ToolRegistry::new().list();
        let tools = listing["tools"].as_object().unwrap();
        let mut names: Vec<&str> = tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["connect_db", "describe_table", "execute_query", "list_databases", "list_tables"]
        );
        assert_eq!(tools["describe_table"]["parameters"]["required"], json!(["table"]));
        assert_eq!(tools["execute_query"]["parameters"]["required"], json!(["query"]));
        assert_eq!(
            tools["connect_db"]["parameters"]["properties"]["port"],
            json!({"type": "integer", "description": "Server port", "default": 3306})
        );
        assert_eq!(tools["list_databases"]["parameters"]["properties"], json!({}));
    }

    #[test]
    fn validation_fills_defaults_and_checks_types() {
        let registry = ToolRegistry::new();
        let connect = registry.get("connect_db").unwrap();
        let args = connect
            .validate(json!({"host": "h", "user": "u", "password": ""}))
            .unwrap();
        assert_eq!(args["port"], json!(3306));

        assert_eq!(
            connect
                .validate(json!({"host": "h", "user": "u", "password": "p", "port": "3306"}))
                .unwrap_err(),
            "Parameter 'port' must be of type integer"
        );
        assert_eq!(
            connect.validate(json!({"host": "h", "password": "p"})).unwrap_err(),
            "Missing required parameter: user"
        );
        assert_eq!(
            registry
                .get("list_databases")
                .unwrap()
                .validate(json!([1]))
                .unwrap_err(),
            "Tool parameters must be an object"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_level_failure() {
        let result = call("drop_everything", json!({})).await;
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": false, "error": "Unknown tool: drop_everything"})
        );
    }

    #[tokio::test]
    async fn describe_table_requires_table() {
        assert_eq!(
            error_of(call("describe_table", json!({"database": "shop"})).await),
            "Missing required parameter: table"
        );
        assert_eq!(
            error_of(call("describe_table", json!({"table": ""})).await),
            "Parameter 'table' must not be empty"
        );
    }

    #[tokio::test]
    async fn describe_table_rejects_backticks() {
        assert_eq!(
            error_of(call("describe_table", json!({"table": "users` ; DROP TABLE x; --"})).await),
            "Invalid identifier: users` ; DROP TABLE x; --"
        );
    }

    #[tokio::test]
    async fn execute_query_classifies_before_touching_the_database() {
        let error = error_of(call("execute_query", json!({"query": "UPDATE users SET x=1"})).await);
        assert!(error.starts_with("Only read-only queries are allowed"), "{error}");

        let error = error_of(call("execute_query", json!({"query": "SELECT 1; SELECT 2"})).await);
        assert!(error.starts_with("Multiple statements"), "{error}");

        assert_eq!(
            error_of(call("execute_query", json!({"query": 42})).await),
            "Parameter 'query' must be of type string"
        );
    }

    #[tokio::test]
    async fn queries_without_a_pool_report_not_initialized() {
        for (tool, args) in [
            ("list_databases", json!({})),
            ("list_tables", json!({"database": "shop"})),
            ("describe_table", json!({"table": "users"})),
            ("execute_query", json!({"query": "SELECT 1"})),
        ] {
            assert_eq!(
                error_of(call(tool, args).await),
                "Database connection not initialized",
                "{tool}"
            );
        }
    }

    #[tokio::test]
    async fn empty_database_override_is_ignored() {
        for (tool, args) in [
            ("list_tables", json!({"database": ""})),
            ("describe_table", json!({"table": "users", "database": ""})),
            ("execute_query", json!({"query": "SELECT 1", "database": ""})),
        ] {
            assert_eq!(
                error_of(call(tool, args).await),
                "Database connection not initialized",
                "{tool}"
            );
        }
    }

    #[tokio::test]
    async fn database_override_is_validated() {
        assert_eq!(
            error_of(call("list_tables", json!({"database": "a`b"})).await),
            "Invalid identifier: a`b"
        );
    }

    #[tokio::test]
    async fn connect_db_rejects_out_of_range_port() {
        assert_eq!(
            error_of(
                call(
                    "connect_db",
                    json!({"host": "h", "user": "u", "password": "p", "port": 70000})
                )
                .await
            ),
            "Parameter 'port' must be between 1 and 65535"
        );
    }

    #[tokio::test]
    async fn connect_db_failure_is_reported_as_result() {
        let result = call(
            "connect_db",
            json!({"host": "127.0.0.1", "port": 1, "user": "u", "password": "p"}),
        )
        .await;
        assert!(!result.is_success());
        assert!(error_of(result).starts_with("Failed to connect"));
    }
}
