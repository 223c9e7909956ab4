//! Interpolator & Resolver Registry (spec §2): expands `{{var}}` and
//! `{{fn(arg)}}` templates against a flat variable scope, falling back to
//! plugin-supplied resolvers for function-call forms.

use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;
    async fn resolve(&self, arg: &str) -> anyhow::Result<String>;
}

#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.push(resolver);
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Resolver>> {
        self.resolvers.iter().find(|r| r.name() == name)
    }
}

/// Expands `{{identifier}}` against `variables` and `{{fn(arg)}}` against
/// `registry`. Unresolvable tokens are left verbatim rather than erroring,
/// matching a template engine's usual tolerance for partial substitution.
pub async fn interpolate(template: &str, variables: &BTreeMap<String, String>, registry: &ResolverRegistry) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i..].find("}}") {
                let inner = template[i + 2..i + end].trim();
                let replacement = resolve_token(inner, variables, registry).await;
                match replacement {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&template[i..i + end + 2]),
                }
                i += end + 2;
                continue;
            }
        }
        let ch_len = next_char_len(template, i);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn next_char_len(s: &str, byte_idx: usize) -> usize {
    s[byte_idx..].chars().next().map(char::len_utf8).unwrap_or(1)
}

async fn resolve_token(inner: &str, variables: &BTreeMap<String, String>, registry: &ResolverRegistry) -> Option<String> {
    if let Some(open) = inner.find('(') {
        if inner.ends_with(')') {
            let fn_name = inner[..open].trim();
            let arg = inner[open + 1..inner.len() - 1].trim();
            if let Some(resolver) = registry.find(fn_name) {
                return resolver.resolve(arg).await.ok();
            }
            return None;
        }
    }
    variables.get(inner).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn substitutes_known_variable() {
        let mut vars = BTreeMap::new();
        vars.insert("host".to_string(), "example.com".to_string());
        let registry = ResolverRegistry::new();
        let out = interpolate("https://{{host}}/path", &vars, &registry).await;
        assert_eq!(out, "https://example.com/path");
    }

    #[tokio::test]
    async fn leaves_unknown_token_verbatim() {
        let vars = BTreeMap::new();
        let registry = ResolverRegistry::new();
        let out = interpolate("{{missing}}", &vars, &registry).await;
        assert_eq!(out, "{{missing}}");
    }

    struct UpperResolver;

    #[async_trait::async_trait]
    impl Resolver for UpperResolver {
        fn name(&self) -> &str {
            "upper"
        }
        async fn resolve(&self, arg: &str) -> anyhow::Result<String> {
            Ok(arg.to_uppercase())
        }
    }

    #[tokio::test]
    async fn calls_registered_resolver_function() {
        let vars = BTreeMap::new();
        let mut registry = ResolverRegistry::new();
        registry.register(Arc::new(UpperResolver));
        let out = interpolate("{{upper(abc)}}", &vars, &registry).await;
        assert_eq!(out, "ABC");
    }
}
