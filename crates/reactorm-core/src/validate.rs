//! Validation rules checked at commit time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{ConfigError, Result, ValidationError};
use crate::id::EntityRef;
use crate::reader::EntityReader;
use crate::value::Value;

/// Thread-safe regex cache for compiled patterns.
///
/// Patterns are compiled lazily on first use and cached for the lifetime
/// of the program.
struct RegexCache {
    cache: std::sync::RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Invalid patterns are logged and treated as a non-match; metadata
/// construction rejects them up front so this only happens for patterns
/// checked directly.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Returns an error message if the pattern is invalid, None if valid.
pub fn validate_pattern(pattern: &str) -> Option<String> {
    match Regex::new(pattern) {
        Ok(_) => None,
        Err(e) => Some(format!("invalid regex pattern: {e}")),
    }
}

type CustomFn = dyn Fn(&dyn EntityReader, EntityRef) -> Result<Option<String>> + Send + Sync;

/// What a [`ValidationRule`] checks.
#[derive(Clone)]
pub enum RuleCheck {
    MinLength(usize),
    MaxLength(usize),
    Pattern(String),
    /// Returns a failure message, or `None` when the entity is valid.
    Custom(Arc<CustomFn>),
}

impl fmt::Debug for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCheck::MinLength(n) => write!(f, "MinLength({n})"),
            RuleCheck::MaxLength(n) => write!(f, "MaxLength({n})"),
            RuleCheck::Pattern(p) => write!(f, "Pattern({p:?})"),
            RuleCheck::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A field-level rule declared on an entity type.
///
/// Null values pass every rule except `Custom`; required-ness is part of
/// the field declaration.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub field: &'static str,
    pub check: RuleCheck,
}

impl ValidationRule {
    pub fn min_length(field: &'static str, min: usize) -> Self {
        Self {
            field,
            check: RuleCheck::MinLength(min),
        }
    }

    pub fn max_length(field: &'static str, max: usize) -> Self {
        Self {
            field,
            check: RuleCheck::MaxLength(max),
        }
    }

    /// A regex rule; the pattern is compiled (and rejected) up front.
    pub fn pattern(field: &'static str, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if let Some(message) = validate_pattern(&pattern) {
            return Err(ConfigError::new(format!("rule on '{field}': {message}")).into());
        }
        Ok(Self {
            field,
            check: RuleCheck::Pattern(pattern),
        })
    }

    pub fn custom(
        field: &'static str,
        f: impl Fn(&dyn EntityReader, EntityRef) -> Result<Option<String>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            field,
            check: RuleCheck::Custom(Arc::new(f)),
        }
    }

    /// Check `entity`, appending failures to `errors`.
    pub fn check(
        &self,
        reader: &dyn EntityReader,
        entity: EntityRef,
        errors: &mut ValidationError,
    ) -> Result<()> {
        match &self.check {
            RuleCheck::Custom(f) => {
                if let Some(message) = f(reader, entity)? {
                    errors.add_custom(self.field, message);
                }
            }
            RuleCheck::MinLength(min) => {
                if let Value::Text(s) = reader.get(entity, self.field)? {
                    let len = s.chars().count();
                    if len < *min {
                        errors.add_min_length(self.field, *min, len);
                    }
                }
            }
            RuleCheck::MaxLength(max) => {
                if let Value::Text(s) = reader.get(entity, self.field)? {
                    let len = s.chars().count();
                    if len > *max {
                        errors.add_max_length(self.field, *max, len);
                    }
                }
            }
            RuleCheck::Pattern(pattern) => {
                if let Some(s) = reader.get(entity, self.field)?.as_str() {
                    if !matches_pattern(s, pattern) {
                        errors.add_pattern(self.field, pattern);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ValidationErrorKind};
    use crate::id::EntityId;

    struct OneField(Value);

    impl EntityReader for OneField {
        fn entity_type(&self, _entity: EntityRef) -> Result<&'static str> {
            Ok("Author")
        }

        fn id(&self, _entity: EntityRef) -> Result<EntityId> {
            Ok(EntityId::Placeholder(1))
        }

        fn get(&self, _entity: EntityRef, _field: &str) -> Result<Value> {
            Ok(self.0.clone())
        }

        fn reference(&self, _entity: EntityRef, _field: &str) -> Result<Option<EntityRef>> {
            Ok(None)
        }

        fn collection(&self, _entity: EntityRef, _field: &str) -> Result<Vec<EntityRef>> {
            Ok(Vec::new())
        }
    }

    fn run(rule: &ValidationRule, value: Value) -> ValidationError {
        let mut errors = ValidationError::new();
        rule.check(&OneField(value), EntityRef::new(0), &mut errors)
            .unwrap();
        errors
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("a@b.com", r"^[^@]+@[^@]+$"));
        assert!(!matches_pattern("invalid", r"^[^@]+@[^@]+$"));
        assert!(!matches_pattern("x", r"(unclosed"));
    }

    #[test]
    fn test_pattern_rule_rejects_invalid_regex() {
        let err = ValidationRule::pattern("email", "(unclosed").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_length_rules() {
        let min = ValidationRule::min_length("firstName", 2);
        assert_eq!(run(&min, Value::from("a")).len(), 1);
        assert!(run(&min, Value::from("ab")).is_empty());
        assert!(run(&min, Value::Null).is_empty());

        let max = ValidationRule::max_length("firstName", 3);
        let errors = run(&max, Value::from("abcd"));
        assert_eq!(errors.errors[0].kind, ValidationErrorKind::MaxLength);
    }

    #[test]
    fn test_custom_rule() {
        let rule = ValidationRule::custom("age", |reader, entity| {
            let age = reader.get(entity, "age")?.as_i64().unwrap_or(0);
            Ok((age < 0).then(|| "must not be negative".to_string()))
        });
        assert_eq!(run(&rule, Value::BigInt(-1)).len(), 1);
        assert!(run(&rule, Value::BigInt(3)).is_empty());
    }
}
