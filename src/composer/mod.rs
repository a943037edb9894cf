//! The prompt composition engine.
//!
//! Compositions are YAML recipes under `prompts/compositions/`; components
//! are Markdown bodies with optional YAML frontmatter under `prompts/`.
//! Components may `extends` a single parent and pull in `mixins`, both
//! resolved recursively with cycle detection; compositions may do the same
//! at their level. Rendering is deterministic and cached per
//! `(component, variables)` pair.

pub mod template;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub use template::TemplateError;

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("composition not found: {name} (available: {})", available.join(", "))]
    CompositionNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("component not found: {name} (available in {dir}: {})", available.join(", "))]
    ComponentNotFound {
        name: String,
        dir: String,
        available: Vec<String>,
    },

    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("missing required context {}: available {}", missing.join(", "), available.join(", "))]
    MissingContext {
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("invalid composition {name}: {message}")]
    Invalid { name: String, message: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One component reference inside a composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalMixins {
    pub condition: String,
    #[serde(default)]
    pub mixins: Vec<String>,
}

/// A composition recipe as parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Composition {
    pub name: String,
    #[serde(default = "Composition::default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub mixins: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionalMixins>,
    #[serde(default)]
    pub required_context: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Composition {
    fn default_version() -> String {
        "1.0".to_string()
    }
}

/// A component after frontmatter parsing and mixin/extends resolution.
#[derive(Debug, Clone)]
struct ComponentContext {
    content: String,
    variables: Map<String, Value>,
}

/// Issues reported by `VALIDATE_COMPOSITION`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: String,
    pub message: String,
}

pub struct PromptComposer {
    base_path: PathBuf,
    cache: Mutex<HashMap<String, ComponentContext>>,
}

impl PromptComposer {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn compositions_dir(&self) -> PathBuf {
        self.base_path.join("compositions")
    }

    fn components_dir(&self) -> PathBuf {
        self.base_path.join("components")
    }

    /// Names of every composition on disk, sorted.
    pub fn list_compositions(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.compositions_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let path = e.path();
                        let is_yaml = matches!(
                            path.extension().and_then(|x| x.to_str()),
                            Some("yaml") | Some("yml")
                        );
                        is_yaml
                            .then(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                            .flatten()
                    })
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Composition summaries for `GET_COMPOSITIONS`.
    pub fn composition_summaries(&self, include_metadata: bool) -> Vec<Value> {
        self.list_compositions()
            .into_iter()
            .filter_map(|name| {
                let doc = self.load_raw(&name).ok()?;
                let mut summary = json!({
                    "name": doc.name,
                    "version": doc.version,
                    "description": doc.description,
                    "author": doc.author,
                    "component_count": doc.components.len(),
                });
                if include_metadata {
                    summary["metadata"] = Value::Object(doc.metadata.clone());
                    summary["required_context"] = Value::Object(doc.required_context.clone());
                }
                Some(summary)
            })
            .collect()
    }

    /// Parse one composition file, without resolving its graph.
    pub fn load_raw(&self, name: &str) -> Result<Composition, ComposerError> {
        let path = self.compositions_dir().join(format!("{name}.yaml"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ComposerError::CompositionNotFound {
                    name: name.to_string(),
                    available: self.list_compositions(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&raw).map_err(|e| ComposerError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Load a composition and flatten its `extends`/`mixins` graph into a
    /// single component list, parents first.
    pub fn load_resolved(&self, name: &str) -> Result<Composition, ComposerError> {
        let mut ancestors = Vec::new();
        self.load_resolved_inner(name, &mut ancestors)
    }

    fn load_resolved_inner(
        &self,
        name: &str,
        ancestors: &mut Vec<String>,
    ) -> Result<Composition, ComposerError> {
        if ancestors.iter().any(|a| a == name) {
            let mut cycle = ancestors.clone();
            cycle.push(name.to_string());
            return Err(ComposerError::CircularDependency { cycle });
        }
        ancestors.push(name.to_string());

        let mut doc = self.load_raw(name)?;

        if let Some(parent_name) = doc.extends.clone() {
            let parent = self.load_resolved_inner(&parent_name, ancestors)?;
            doc = merge_compositions(parent, doc);
        }
        for mixin_name in doc.mixins.clone() {
            let mixin = self.load_resolved_inner(&mixin_name, ancestors)?;
            doc.components.extend(mixin.components);
            for (k, v) in mixin.required_context {
                doc.required_context.entry(k).or_insert(v);
            }
        }

        ancestors.pop();
        Ok(doc)
    }

    /// Render a composition against `context` into the final prompt text.
    pub fn compose(&self, name: &str, context: &Value) -> Result<String, ComposerError> {
        let doc = self.load_resolved(name)?;
        let full_context = self.build_context(&doc, context)?;

        // Conditional composition-level mixins join the component list.
        let mut components = doc.components.clone();
        for conditional in &doc.conditions {
            if template::evaluate_condition(&conditional.condition, &full_context) {
                for mixin_name in &conditional.mixins {
                    let mut ancestors = vec![name.to_string()];
                    let mixin = self.load_resolved_inner(mixin_name, &mut ancestors)?;
                    components.extend(mixin.components);
                }
            }
        }

        let mut parts: Vec<String> = Vec::new();
        for spec in &components {
            if let Some(condition) = &spec.condition {
                if !template::evaluate_condition(condition, &full_context) {
                    continue;
                }
            }

            // Per-component vars resolve against the composition context,
            // then override it for this component's render.
            let mut component_context = full_context.clone();
            if let Value::Object(ctx_map) = &mut component_context {
                for (key, value) in &spec.vars {
                    let resolved = match value {
                        Value::String(s) => {
                            Value::String(template::substitute(s, &full_context, false)?)
                        }
                        other => other.clone(),
                    };
                    ctx_map.insert(key.clone(), resolved);
                }
            }

            let rendered = self.render_component(&spec.source, &component_context)?;
            if !rendered.trim().is_empty() {
                parts.push(rendered.trim_end().to_string());
            }
        }

        Ok(parts.join("\n\n"))
    }

    /// Render one component (by path relative to the prompt tree) with full
    /// mixin resolution and strict substitution.
    pub fn render_component(
        &self,
        source: &str,
        context: &Value,
    ) -> Result<String, ComposerError> {
        let variables = match context {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut stack = Vec::new();
        let resolved = self.resolve_component(source, &variables, &mut stack)?;

        let mut render_context = Value::Object(resolved.variables.clone());
        if let (Value::Object(out), Value::Object(provided)) = (&mut render_context, context) {
            for (k, v) in provided {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(template::substitute(&resolved.content, &render_context, true)?)
    }

    fn resolve_component(
        &self,
        source: &str,
        provided: &Map<String, Value>,
        stack: &mut Vec<String>,
    ) -> Result<ComponentContext, ComposerError> {
        let canonical = canonical_component_name(source);
        if stack.iter().any(|s| s == &canonical) {
            let mut cycle = stack.clone();
            cycle.push(canonical);
            return Err(ComposerError::CircularDependency { cycle });
        }

        let cache_key = format!("{canonical}#{}", hash_variables(provided));
        if let Some(cached) = self.cache.lock().expect("composer cache poisoned").get(&cache_key)
        {
            return Ok(cached.clone());
        }

        stack.push(canonical.clone());
        let result = self.resolve_component_uncached(&canonical, provided, stack);
        stack.pop();

        let resolved = result?;
        self.cache
            .lock()
            .expect("composer cache poisoned")
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    fn resolve_component_uncached(
        &self,
        canonical: &str,
        provided: &Map<String, Value>,
        stack: &mut Vec<String>,
    ) -> Result<ComponentContext, ComposerError> {
        let (frontmatter, content) = self.load_component_file(canonical)?;

        let declared = frontmatter
            .get("variables")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let variables = merge_variables(&declared, provided);

        let mut context = ComponentContext {
            content,
            variables: variables.clone(),
        };

        // extends: parent renders first, child overrides.
        if let Some(parent) = frontmatter.get("extends").and_then(Value::as_str) {
            let parent_context = self.resolve_component(parent, &variables, stack)?;
            context = merge_contexts(parent_context, context);
        }

        // mixins, then conditional mixins, each merged over the current
        // context in order.
        let mut mixin_names: Vec<String> = frontmatter
            .get("mixins")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(conditions) = frontmatter.get("conditions").and_then(Value::as_array) {
            let eval_context = Value::Object(variables.clone());
            for entry in conditions {
                let condition = entry.get("condition").and_then(Value::as_str).unwrap_or("");
                if template::evaluate_condition(condition, &eval_context) {
                    if let Some(list) = entry.get("mixins").and_then(Value::as_array) {
                        mixin_names
                            .extend(list.iter().filter_map(Value::as_str).map(String::from));
                    }
                }
            }
        }
        for mixin in mixin_names {
            let resolved_name = template::substitute(
                &mixin,
                &Value::Object(variables.clone()),
                false,
            )?;
            let mixin_context = self.resolve_component(&resolved_name, &variables, stack)?;
            context = merge_contexts(context, mixin_context);
        }

        Ok(context)
    }

    fn load_component_file(
        &self,
        canonical: &str,
    ) -> Result<(Map<String, Value>, String), ComposerError> {
        let path = self.base_path.join(format!("{canonical}.md"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let dir = path
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                let available = path
                    .parent()
                    .and_then(|p| std::fs::read_dir(p).ok())
                    .map(|entries| {
                        entries
                            .filter_map(|e| e.ok())
                            .filter_map(|e| e.file_name().into_string().ok())
                            .filter(|n| n.ends_with(".md"))
                            .collect()
                    })
                    .unwrap_or_default();
                return Err(ComposerError::ComponentNotFound {
                    name: canonical.to_string(),
                    dir,
                    available,
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse_frontmatter(&raw))
    }

    /// Validate a composition without rendering it for real. Every problem
    /// becomes an issue; the reply is always `success` with `valid` set.
    pub fn validate(&self, name: &str, context: &Value) -> (bool, Vec<ValidationIssue>) {
        let mut issues = Vec::new();

        let doc = match self.load_resolved(name) {
            Ok(doc) => doc,
            Err(e) => {
                issues.push(ValidationIssue {
                    severity: "error".to_string(),
                    message: e.to_string(),
                });
                return (false, issues);
            }
        };

        if let Err(e) = self.build_context(&doc, context) {
            issues.push(ValidationIssue {
                severity: "error".to_string(),
                message: e.to_string(),
            });
        }

        for spec in &doc.components {
            let mut stack = Vec::new();
            if let Err(e) = self.resolve_component(&spec.source, &Map::new(), &mut stack) {
                issues.push(ValidationIssue {
                    severity: "error".to_string(),
                    message: format!("component {}: {e}", spec.name),
                });
            }
        }

        (issues.is_empty(), issues)
    }

    /// Inventory of the component tree for `LIST_COMPONENTS`.
    pub fn list_components(&self, directory: Option<&str>) -> Result<Vec<Value>, ComposerError> {
        let root = match directory {
            Some(dir) => self.components_dir().join(dir),
            None => self.components_dir(),
        };
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut components = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("md") {
                continue;
            }
            let relative = path
                .strip_prefix(&self.base_path)
                .unwrap_or(path)
                .with_extension("");
            let raw = std::fs::read_to_string(path)?;
            let (frontmatter, content) = parse_frontmatter(&raw);
            components.push(json!({
                "name": relative.to_string_lossy(),
                "description": frontmatter.get("description").cloned().unwrap_or(Value::Null),
                "has_frontmatter": !frontmatter.is_empty(),
                "mixins": frontmatter.get("mixins").cloned().unwrap_or_else(|| json!([])),
                "lines": content.lines().count(),
            }));
        }
        Ok(components)
    }

    /// Compose-time context: required-context defaults, then the caller's
    /// values, with the caller's values mirrored under `_ksi_context`.
    fn build_context(
        &self,
        doc: &Composition,
        provided: &Value,
    ) -> Result<Value, ComposerError> {
        let provided_map = provided.as_object().cloned().unwrap_or_default();

        let mut missing = Vec::new();
        let mut context = Map::new();
        for (key, requirement) in &doc.required_context {
            if let Some(value) = provided_map.get(key) {
                context.insert(key.clone(), value.clone());
                continue;
            }
            match requirement.get("default") {
                Some(default) => {
                    context.insert(key.clone(), default.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            let mut available: Vec<String> = provided_map.keys().cloned().collect();
            available.sort();
            missing.sort();
            return Err(ComposerError::MissingContext { missing, available });
        }

        for (key, value) in &provided_map {
            context.entry(key.clone()).or_insert_with(|| value.clone());
        }
        context.insert("_ksi_context".to_string(), Value::Object(provided_map));
        Ok(Value::Object(context))
    }

    /// Drop every cached component resolution. Output is unaffected.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("composer cache poisoned").clear();
    }
}

/// `components/agent_identity.md` and `components/agent_identity` name the
/// same component.
fn canonical_component_name(source: &str) -> String {
    source.strip_suffix(".md").unwrap_or(source).to_string()
}

/// Split optional `---` YAML frontmatter from a Markdown body.
fn parse_frontmatter(raw: &str) -> (Map<String, Value>, String) {
    let Some(rest) = raw.strip_prefix("---") else {
        return (Map::new(), raw.to_string());
    };
    let Some(end) = rest.find("\n---") else {
        return (Map::new(), raw.to_string());
    };
    let frontmatter_raw = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');
    let frontmatter = serde_yaml::from_str::<Value>(frontmatter_raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    (frontmatter, body.to_string())
}

/// Declared variables (with optional `{default: ...}` specs) merged with
/// caller-provided values; the caller wins.
fn merge_variables(
    declared: &Map<String, Value>,
    provided: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    for (name, definition) in declared {
        if let Some(value) = provided.get(name) {
            merged.insert(name.clone(), value.clone());
        } else if let Some(default) = definition.get("default") {
            merged.insert(name.clone(), default.clone());
        } else if !definition.is_object() {
            merged.insert(name.clone(), definition.clone());
        } else {
            merged.insert(name.clone(), Value::String(String::new()));
        }
    }
    for (name, value) in provided {
        merged.entry(name.clone()).or_insert_with(|| value.clone());
    }
    merged
}

/// Override wins: content replaces only when non-empty, variables merge.
fn merge_contexts(base: ComponentContext, override_ctx: ComponentContext) -> ComponentContext {
    let content = if override_ctx.content.trim().is_empty() {
        base.content
    } else {
        override_ctx.content
    };
    let mut variables = base.variables;
    for (k, v) in override_ctx.variables {
        variables.insert(k, v);
    }
    ComponentContext { content, variables }
}

/// Stable across runs: canonical JSON (sorted keys) through a std hasher.
fn hash_variables(variables: &Map<String, Value>) -> u64 {
    use std::hash::{Hash, Hasher};
    let canonical =
        serde_json::to_string(&Value::Object(variables.clone())).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

/// Merge a parent composition into its child: parent components first,
/// child's required context and metadata win.
fn merge_compositions(parent: Composition, mut child: Composition) -> Composition {
    let mut components = parent.components;
    components.extend(child.components);
    child.components = components;
    for (k, v) in parent.required_context {
        child.required_context.entry(k).or_insert(v);
    }
    for (k, v) in parent.metadata {
        child.metadata.entry(k).or_insert(v);
    }
    child.extends = None;
    child
}
