// # SQL Template Renderer
//
// Expands ReportGenerationQuery templates into executable SQL. Templates are
// Tera templates with a `report` context object and a set of registered
// functions for resolving identifiers against the resource store:
//
// - `generation_query_view_name(name=...)`: Presto view identifier of a
//   materialized query; fails for disabled or unmaterialized views.
// - `datasource_table_name(name=...)`: table backing a ReportDataSource;
//   fails while the datasource has no table in status.
// - `render_generation_query(name=...)`: inlines the referenced query's
//   rendered template with the same report context.
// - `presto_timestamp(t=...)`: `YYYY-MM-DD HH:MM:SS.mmm`.
// - `billing_period_timestamp(t=...)`: `YYYYMMDD` partition prefix form.
//
// The renderer performs no dependency ordering; callers materialize
// referenced views first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{MeteringError, Result};
use crate::resources::{QueryInput, ReportDataSource, ReportGenerationQuery};
use crate::store::ResourceStore;

/// Nesting guard for dynamic queries. Legitimate chains stay shallow; the
/// dependency resolver rejects true cycles before execution.
const MAX_RENDER_DEPTH: usize = 10;

/// Resolved inputs plus the reporting window, bound as `report` inside
/// templates.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub reporting_start: DateTime<Utc>,
    pub reporting_end: DateTime<Utc>,
    pub inputs: BTreeMap<String, Value>,
}

impl ReportContext {
    pub fn new(
        reporting_start: DateTime<Utc>,
        reporting_end: DateTime<Utc>,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            reporting_start,
            reporting_end,
            inputs,
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "reporting_start": self.reporting_start.to_rfc3339(),
            "reporting_end": self.reporting_end.to_rfc3339(),
            "inputs": self.inputs,
        })
    }
}

/// Merge declared inputs with the values a report provides. Declared inputs
/// fall back to their defaults; a required input with neither value nor
/// default fails with a diagnostic naming the input.
pub fn resolve_inputs(
    declared: &[QueryInput],
    provided: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = provided.clone();
    for input in declared {
        if resolved.contains_key(&input.name) {
            continue;
        }
        match &input.default {
            Some(default) => {
                resolved.insert(input.name.clone(), default.clone());
            }
            None if input.required => {
                return Err(MeteringError::Render(format!(
                    "missing required input: {}",
                    input.name
                )));
            }
            None => {}
        }
    }
    Ok(resolved)
}

pub struct QueryRenderer {
    queries: Arc<ResourceStore<ReportGenerationQuery>>,
    datasources: Arc<ResourceStore<ReportDataSource>>,
    namespace: String,
    log_rendered: bool,
}

impl QueryRenderer {
    pub fn new(
        queries: Arc<ResourceStore<ReportGenerationQuery>>,
        datasources: Arc<ResourceStore<ReportDataSource>>,
        namespace: impl Into<String>,
        log_rendered: bool,
    ) -> Self {
        Self {
            queries,
            datasources,
            namespace: namespace.into(),
            log_rendered,
        }
    }

    /// Render with a full report context.
    pub fn render(&self, template: &str, context: &ReportContext) -> Result<String> {
        let sql = render_template(
            &self.queries,
            &self.datasources,
            &self.namespace,
            template,
            Some(context.to_value()),
            0,
        )?;
        if self.log_rendered {
            info!(%sql, "rendered report query");
        }
        Ok(sql)
    }

    /// Render with no report context, as used for view materialization.
    /// Templates referencing reporting-window bindings fail here.
    pub fn render_view(&self, template: &str) -> Result<String> {
        render_template(
            &self.queries,
            &self.datasources,
            &self.namespace,
            template,
            None,
            0,
        )
    }
}

fn render_template(
    queries: &Arc<ResourceStore<ReportGenerationQuery>>,
    datasources: &Arc<ResourceStore<ReportDataSource>>,
    namespace: &str,
    template: &str,
    report: Option<Value>,
    depth: usize,
) -> Result<String> {
    if depth > MAX_RENDER_DEPTH {
        return Err(MeteringError::Render(format!(
            "dynamic query nesting exceeds {MAX_RENDER_DEPTH} levels"
        )));
    }

    let mut tera = tera::Tera::default();
    tera.add_raw_template("query", template)
        .map_err(|e| MeteringError::Render(tera_message(&e)))?;

    {
        let queries = Arc::clone(queries);
        let namespace = namespace.to_string();
        tera.register_function(
            "generation_query_view_name",
            move |args: &HashMap<String, Value>| {
                let name = string_arg(args, "name", "generation_query_view_name")?;
                let query = queries
                    .get(&namespace, &name)
                    .map_err(|_| tera::Error::msg(format!("unknown generation query: {name}")))?;
                if query.spec.view.disabled {
                    return Err(tera::Error::msg(format!(
                        "query {name} has its view disabled; inline it with render_generation_query"
                    )));
                }
                match &query.status.view_name {
                    Some(view) => Ok(Value::String(view.clone())),
                    None => Err(tera::Error::msg(format!(
                        "view for query {name} is not materialized yet"
                    ))),
                }
            },
        );
    }

    {
        let datasources = Arc::clone(datasources);
        let namespace = namespace.to_string();
        tera.register_function(
            "datasource_table_name",
            move |args: &HashMap<String, Value>| {
                let name = string_arg(args, "name", "datasource_table_name")?;
                let source = datasources
                    .get(&namespace, &name)
                    .map_err(|_| tera::Error::msg(format!("unknown datasource: {name}")))?;
                match &source.status.table_name {
                    Some(table) => Ok(Value::String(table.clone())),
                    None => Err(tera::Error::msg(format!(
                        "datasource {name} has no backing table yet"
                    ))),
                }
            },
        );
    }

    {
        let queries = Arc::clone(queries);
        let datasources = Arc::clone(datasources);
        let namespace = namespace.to_string();
        let report = report.clone();
        tera.register_function(
            "render_generation_query",
            move |args: &HashMap<String, Value>| {
                let name = string_arg(args, "name", "render_generation_query")?;
                let query = queries
                    .get(&namespace, &name)
                    .map_err(|_| tera::Error::msg(format!("unknown generation query: {name}")))?;
                let rendered = render_template(
                    &queries,
                    &datasources,
                    &namespace,
                    &query.spec.query,
                    report.clone(),
                    depth + 1,
                )
                .map_err(|e| tera::Error::msg(e.to_string()))?;
                Ok(Value::String(rendered))
            },
        );
    }

    tera.register_function("presto_timestamp", |args: &HashMap<String, Value>| {
        let t = timestamp_arg(args, "presto_timestamp")?;
        Ok(Value::String(t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()))
    });

    tera.register_function(
        "billing_period_timestamp",
        |args: &HashMap<String, Value>| {
            let t = timestamp_arg(args, "billing_period_timestamp")?;
            Ok(Value::String(t.format("%Y%m%d").to_string()))
        },
    );

    let mut context = tera::Context::new();
    if let Some(report) = &report {
        context.insert("report", report);
    }

    tera.render("query", &context)
        .map_err(|e| MeteringError::Render(tera_message(&e)))
}

fn string_arg(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(tera::Error::msg(format!(
            "{func}: argument `{name}` must be a string, got {other}"
        ))),
        None => Err(tera::Error::msg(format!(
            "{func}: missing argument `{name}`"
        ))),
    }
}

fn timestamp_arg(args: &HashMap<String, Value>, func: &str) -> tera::Result<DateTime<Utc>> {
    let raw = string_arg(args, "t", func)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| tera::Error::msg(format!("{func}: `{raw}` is not an RFC 3339 timestamp")))
}

/// Tera buries the interesting message in the error's source chain.
fn tera_message(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}
