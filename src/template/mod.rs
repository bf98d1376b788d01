//! TemplateEngine (§4.2): evaluates `${dotted.path}` expressions, lazily and
//! recursively, over a [`context::ContextNode`] tree, detecting cycles.

pub mod context;

use std::collections::HashSet;

use context::{ContextNode, Primitive, Resolved};

use crate::error::TemplateError;

/// Split a template string into literal runs and top-level `${...}` spans.
/// A span's content may itself contain nested `${...}` — braces are
/// balanced by depth, not by the first `}` encountered.
enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

fn split_top_level(template: &str) -> Vec<Segment<'_>> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if i > literal_start {
                segments.push(Segment::Literal(&template[literal_start..i]));
            }
            let content_start = i + 2;
            let mut depth = 1usize;
            let mut j = content_start;
            while j < bytes.len() && depth > 0 {
                if bytes[j] == b'$' && j + 1 < bytes.len() && bytes[j + 1] == b'{' {
                    depth += 1;
                    j += 2;
                    continue;
                }
                if bytes[j] == b'}' {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                j += 1;
            }
            if depth == 0 {
                segments.push(Segment::Expr(&template[content_start..j]));
                literal_start = j + 1;
                i = literal_start;
            } else {
                // Unbalanced — treat the rest as literal text.
                segments.push(Segment::Literal(&template[i..]));
                literal_start = bytes.len();
                i = bytes.len();
            }
        } else {
            i += 1;
        }
    }

    if literal_start < bytes.len() {
        segments.push(Segment::Literal(&template[literal_start..]));
    }

    segments
}

/// Lazily evaluates `${...}` expressions against a [`ContextNode`] tree.
pub struct TemplateEngine;

impl TemplateEngine {
    /// Resolve every `${...}` segment in `template`, substituting each with
    /// its resolved primitive's string form.
    pub fn resolve_string(
        template: &str,
        root: &dyn ContextNode,
    ) -> Result<String, TemplateError> {
        let mut stack = Vec::new();
        Self::resolve_string_inner(template, root, &mut stack)
    }

    fn resolve_string_inner(
        template: &str,
        root: &dyn ContextNode,
        stack: &mut Vec<String>,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        for segment in split_top_level(template) {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(raw) => {
                    // Nested ${...} inside this expression are resolved first,
                    // turning e.g. "modules.${moduleName}.path" into a
                    // concrete dotted path before it's ever looked up.
                    let path = Self::resolve_string_inner(raw, root, stack)?;
                    let value = Self::resolve_path_inner(&path, root, stack)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Resolve a single dotted path (no surrounding `${}`) to a primitive.
    pub fn resolve_path(path: &str, root: &dyn ContextNode) -> Result<Primitive, TemplateError> {
        let mut stack = Vec::new();
        Self::resolve_path_inner(path, root, &mut stack)
    }

    fn resolve_path_inner(
        path: &str,
        root: &dyn ContextNode,
        stack: &mut Vec<String>,
    ) -> Result<Primitive, TemplateError> {
        if stack.iter().any(|p| p == path) {
            stack.push(path.to_string());
            let cycle = stack.join(" → ");
            return Err(TemplateError::CircularReference(cycle));
        }
        stack.push(path.to_string());

        let result = (|| {
            let mut current: Resolved = Resolved::Context(wrap_root(root));
            let segments: Vec<&str> = path.split('.').collect();

            for (idx, segment) in segments.iter().enumerate() {
                let is_last = idx == segments.len() - 1;
                current = match current {
                    Resolved::Context(ctx) => ctx.get(segment).ok_or_else(|| {
                        TemplateError::KeyNotFound { path: path.to_string() }
                    })?,
                    Resolved::Lazy(callable) => {
                        let called = callable.call()?;
                        match called {
                            Resolved::Context(ctx) => ctx.get(segment).ok_or_else(|| {
                                TemplateError::KeyNotFound { path: path.to_string() }
                            })?,
                            other if is_last => other,
                            _ => {
                                return Err(TemplateError::KeyNotFound { path: path.to_string() })
                            }
                        }
                    }
                    // Can't navigate a `.segment` into an already-resolved
                    // primitive — only the context/lazy cases above advance.
                    Resolved::Primitive(_) => {
                        return Err(TemplateError::NonPrimitive { path: path.to_string() })
                    }
                };

                // A templated string held at this step is resolved
                // recursively before the walk continues (or returns).
                if let Resolved::Primitive(Primitive::String(s)) = &current {
                    let resolved = Self::resolve_string_inner(s, root, stack)?;
                    current = Resolved::Primitive(Primitive::String(resolved));
                }
            }

            match current {
                Resolved::Primitive(p) => Ok(p),
                Resolved::Lazy(callable) => match callable.call()? {
                    Resolved::Primitive(p) => Ok(p),
                    _ => Err(TemplateError::NonPrimitive { path: path.to_string() }),
                },
                Resolved::Context(_) => Err(TemplateError::NonPrimitive { path: path.to_string() }),
            }
        })();

        stack.pop();
        result
    }

    /// Recursively scan a JSON value for `${...}` references, returning the
    /// set of dotted paths found — including ones nested inside another
    /// expression (`${outer.${inner}}` yields both `inner` and, once that's
    /// substituted, is not itself a static path and is therefore not
    /// reported — only statically-complete paths are useful prerequisites).
    pub fn collect_template_references(value: &serde_json::Value) -> HashSet<String> {
        let mut refs = HashSet::new();
        match value {
            serde_json::Value::String(s) => collect_from_string(s, &mut refs),
            serde_json::Value::Array(items) => {
                for item in items {
                    refs.extend(Self::collect_template_references(item));
                }
            }
            serde_json::Value::Object(map) => {
                for v in map.values() {
                    refs.extend(Self::collect_template_references(v));
                }
            }
            _ => {}
        }
        refs
    }
}

fn collect_from_string(s: &str, refs: &mut HashSet<String>) {
    for segment in split_top_level(s) {
        if let Segment::Expr(raw) = segment {
            let inner = split_top_level(raw);
            let has_nested = inner.iter().any(|seg| matches!(seg, Segment::Expr(_)));
            if has_nested {
                collect_from_string(raw, refs);
            } else {
                refs.insert(raw.to_string());
            }
        }
    }
}

/// Adapt a bare `&dyn ContextNode` root into the `Arc<dyn ContextNode>` shape
/// `Resolved::Context` holds, for the duration of one resolution pass.
fn wrap_root(root: &dyn ContextNode) -> std::sync::Arc<dyn ContextNode + '_> {
    struct Wrapper<'a>(&'a dyn ContextNode);
    impl<'a> ContextNode for Wrapper<'a> {
        fn get(&self, key: &str) -> Option<Resolved> {
            self.0.get(key)
        }
    }
    std::sync::Arc::new(Wrapper(root))
}

#[cfg(test)]
mod tests {
    use super::context::{LayeredNode, MapNode};
    use super::*;
    use std::sync::Arc;

    fn leaf_ctx() -> MapNode {
        MapNode::new()
            .with_string("name", "api")
            .with_number("port", 8080.0)
            .with_bool("enabled", true)
    }

    #[test]
    fn resolves_simple_path() {
        let ctx = leaf_ctx();
        let v = TemplateEngine::resolve_path("name", &ctx).unwrap();
        assert_eq!(v.to_string(), "api");
    }

    #[test]
    fn resolves_string_with_embedded_expr() {
        let ctx = leaf_ctx();
        let s = TemplateEngine::resolve_string("service ${name} on ${port}", &ctx).unwrap();
        assert_eq!(s, "service api on 8080");
    }

    #[test]
    fn missing_key_is_reported() {
        let ctx = leaf_ctx();
        let err = TemplateEngine::resolve_path("missing", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::KeyNotFound { .. }));
    }

    #[test]
    fn private_keys_resolve_to_missing() {
        let ctx = MapNode::new().with_string("_hidden", "nope");
        let err = TemplateEngine::resolve_path("_hidden", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::KeyNotFound { .. }));
    }

    #[test]
    fn nested_context_resolves_dotted_path() {
        let inner = MapNode::new().with_string("path", "/src/api");
        let outer = MapNode::new().with_context("api", Arc::new(inner));
        let v = TemplateEngine::resolve_path("api.path", &outer).unwrap();
        assert_eq!(v.to_string(), "/src/api");
    }

    #[test]
    fn direct_self_reference_is_a_cycle() {
        struct SelfRef;
        impl ContextNode for SelfRef {
            fn get(&self, key: &str) -> Option<Resolved> {
                if key == "a" {
                    Some(Resolved::string("${a}"))
                } else {
                    None
                }
            }
        }
        let err = TemplateEngine::resolve_path("a", &SelfRef).unwrap_err();
        assert!(matches!(err, TemplateError::CircularReference(ref c) if c == "a → a"));
    }

    #[test]
    fn mutual_reference_is_detected_as_a_cycle() {
        struct Mutual;
        impl ContextNode for Mutual {
            fn get(&self, key: &str) -> Option<Resolved> {
                match key {
                    "a" => Some(Resolved::string("${b}")),
                    "b" => Some(Resolved::string("${a}")),
                    _ => None,
                }
            }
        }

        let err = TemplateEngine::resolve_path("a", &Mutual).unwrap_err();
        assert!(matches!(err, TemplateError::CircularReference(ref c) if c.contains('a') && c.contains('b')));
    }

    #[test]
    fn collects_static_template_references() {
        let value = serde_json::json!({
            "command": "build ${modules.api.version}",
            "nested": ["run ${modules.web.outputs.url}"]
        });
        let refs = TemplateEngine::collect_template_references(&value);
        assert!(refs.contains("modules.api.version"));
        assert!(refs.contains("modules.web.outputs.url"));
    }
}
