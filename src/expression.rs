//! Filter and condition expression builders
//!
//! Every builder returns an [`Expression`]: the expression text plus the
//! `#name` and `:value` placeholder bindings DynamoDB expects next to it.
//! Attribute names always go through a `#` placeholder, so reserved words such
//! as `name` or `status` are safe to use. Builders that may have nothing to
//! express return `None`, which [`combine`] skips.

use aws_sdk_dynamodb::types::AttributeValue;
use serde::Serialize;
use serde_dynamo::to_item;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::Error;

/// Logical operator joining clauses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BooleanOperator {
    /// All clauses must hold
    #[default]
    And,
    /// Any clause may hold
    Or,
}

impl fmt::Display for BooleanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanOperator::And => f.write_str("AND"),
            BooleanOperator::Or => f.write_str("OR"),
        }
    }
}

impl FromStr for BooleanOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(BooleanOperator::And),
            "OR" => Ok(BooleanOperator::Or),
            other => Err(Error::InvalidArgument(format!(
                "unknown boolean operator {other:?}"
            ))),
        }
    }
}

/// Expression text with its placeholder bindings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Expression {
    text: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Expression {
    /// Expression with no bindings yet
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Bind `placeholder` (e.g. `#status`) to an attribute name
    pub fn with_name(mut self, placeholder: impl Into<String>, attribute: impl Into<String>) -> Self {
        let _ = self.names.insert(placeholder.into(), attribute.into());
        self
    }

    /// Bind `placeholder` (e.g. `:status`) to a value
    pub fn with_value(mut self, placeholder: impl Into<String>, value: AttributeValue) -> Self {
        let _ = self.values.insert(placeholder.into(), value);
        self
    }

    /// Expression text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// `#name` placeholder to attribute name
    pub fn names(&self) -> &HashMap<String, String> {
        &self.names
    }

    /// `:value` placeholder to value
    pub fn values(&self) -> &HashMap<String, AttributeValue> {
        &self.values
    }

    /// Split into text, names and values, ready for a request builder
    pub fn into_parts(
        self,
    ) -> (
        String,
        HashMap<String, String>,
        HashMap<String, AttributeValue>,
    ) {
        (self.text, self.names, self.values)
    }

    /// Check that text and bindings agree
    ///
    /// Every placeholder in the text must be bound and every binding must be
    /// referenced; DynamoDB rejects requests carrying unused values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidArgument("expression text is empty".to_string()));
        }

        let used: HashSet<&str> = placeholders(&self.text).collect();

        for token in &used {
            let bound = if token.starts_with('#') {
                self.names.contains_key(*token)
            } else {
                self.values.contains_key(*token)
            };
            if !bound {
                return Err(Error::InvalidArgument(format!(
                    "placeholder {token} in {:?} has no binding",
                    self.text
                )));
            }
        }

        let unused = self
            .names
            .keys()
            .chain(self.values.keys())
            .find(|placeholder| !used.contains(placeholder.as_str()));
        if let Some(placeholder) = unused {
            return Err(Error::InvalidArgument(format!(
                "placeholder {placeholder} is bound but not used in {:?}",
                self.text
            )));
        }

        Ok(())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// `#name` and `:value` tokens in expression text, in order of appearance
fn placeholders(text: &str) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    let mut position = 0;

    std::iter::from_fn(move || {
        while position < bytes.len() {
            let start = position;
            position += 1;
            if bytes[start] != b'#' && bytes[start] != b':' {
                continue;
            }

            let end = bytes[position..]
                .iter()
                .position(|b| !is_token_byte(*b))
                .map_or(bytes.len(), |offset| position + offset);
            position = end;

            if end > start + 1 {
                return Some(&text[start..end]);
            }
        }
        None
    })
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Replace whole tokens of `text` according to `renames`
fn rewrite_placeholders(text: &str, renames: &HashMap<String, String>) -> String {
    if renames.is_empty() {
        return text.to_string();
    }

    let mut rewritten = String::with_capacity(text.len());
    let mut copied = 0;
    for token in placeholders(text) {
        let Some(replacement) = renames.get(token) else {
            continue;
        };
        // Tokens are subslices of `text`; recover their offsets.
        let start = token.as_ptr() as usize - text.as_ptr() as usize;
        rewritten.push_str(&text[copied..start]);
        rewritten.push_str(replacement);
        copied = start + token.len();
    }
    rewritten.push_str(&text[copied..]);
    rewritten
}

/// Attribute name reduced to placeholder-safe characters
fn placeholder_stem(attribute: &str) -> String {
    let stem: String = attribute
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "attr".to_string() } else { stem }
}

fn fresh_placeholder(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Accumulates clauses while keeping placeholders unique
#[derive(Default)]
struct ClauseBuilder {
    clauses: Vec<String>,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ClauseBuilder {
    /// Placeholder for `attribute`, shared when the attribute repeats
    fn name(&mut self, attribute: &str) -> String {
        let base = format!("#{}", placeholder_stem(attribute));
        let placeholder = fresh_placeholder(&base, |candidate| {
            self.names
                .get(candidate)
                .is_some_and(|bound| bound != attribute)
        });
        let _ = self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    /// Fresh placeholder for `value`
    fn value(&mut self, stem: &str, value: AttributeValue) -> String {
        let base = format!(":{}", placeholder_stem(stem));
        let placeholder = fresh_placeholder(&base, |candidate| self.values.contains_key(candidate));
        let _ = self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn finish(self, operator: BooleanOperator) -> Option<Expression> {
        if self.clauses.is_empty() {
            return None;
        }
        Some(Expression {
            text: self.clauses.join(&format!(" {operator} ")),
            names: self.names,
            values: self.values,
        })
    }
}

/// Members of a list-typed value, or `None` for scalars
fn list_members(value: &AttributeValue) -> Option<Vec<AttributeValue>> {
    match value {
        AttributeValue::L(members) => Some(members.clone()),
        AttributeValue::Ss(members) => {
            Some(members.iter().cloned().map(AttributeValue::S).collect())
        }
        AttributeValue::Ns(members) => {
            Some(members.iter().cloned().map(AttributeValue::N).collect())
        }
        _ => None,
    }
}

/// One clause per condition, joined with `operator`
///
/// The key decides the comparison:
///
/// | key            | clause                     |
/// |----------------|----------------------------|
/// | `f_contains`   | `contains(#f, :f_contains)`|
/// | `f_gte`        | `#f >= :f_gte`             |
/// | `f_lte`        | `#f <= :f_lte`             |
/// | `f` (list)     | `#f IN (:f_in_0, ...)`     |
/// | `f`            | `#f = :f`                  |
///
/// Suffixes take precedence over the list rule. Empty lists are skipped.
/// Returns `None` when no clause was produced.
///
/// ```
/// use aws_sdk_dynamodb::types::AttributeValue;
/// use dynamo_batch::expression::{BooleanOperator, equality_or_range};
///
/// let expr = equality_or_range(
///     [("age_gte", AttributeValue::N("30".into()))],
///     BooleanOperator::And,
/// )
/// .unwrap();
/// assert_eq!(expr.text(), "#age >= :age_gte");
/// assert_eq!(expr.names()["#age"], "age");
/// ```
pub fn equality_or_range<I, K>(conditions: I, operator: BooleanOperator) -> Option<Expression>
where
    I: IntoIterator<Item = (K, AttributeValue)>,
    K: AsRef<str>,
{
    let mut builder = ClauseBuilder::default();

    for (key, value) in conditions {
        let key = key.as_ref();
        if key.is_empty() {
            warn!("skipping condition with empty attribute name");
            continue;
        }

        let suffixed = [("_contains", None), ("_gte", Some(">=")), ("_lte", Some("<="))]
            .into_iter()
            .find_map(|(suffix, comparator)| {
                key.strip_suffix(suffix)
                    .filter(|field| !field.is_empty())
                    .map(|field| (field, comparator))
            });

        if let Some((field, comparator)) = suffixed {
            let name = builder.name(field);
            let placeholder = builder.value(key, value);
            let clause = match comparator {
                Some(comparator) => format!("{name} {comparator} {placeholder}"),
                None => format!("contains({name}, {placeholder})"),
            };
            builder.push(clause);
            continue;
        }

        if let Some(members) = list_members(&value) {
            if members.is_empty() {
                warn!(attribute = key, "skipping IN condition with an empty list");
                continue;
            }
            let name = builder.name(key);
            let stem = format!("{key}_in");
            let placeholders: Vec<String> = members
                .into_iter()
                .enumerate()
                .map(|(i, member)| builder.value(&format!("{stem}_{i}"), member))
                .collect();
            builder.push(format!("{name} IN ({})", placeholders.join(", ")));
            continue;
        }

        let name = builder.name(key);
        let placeholder = builder.value(key, value);
        builder.push(format!("{name} = {placeholder}"));
    }

    builder.finish(operator)
}

/// [`equality_or_range`] over the fields of a serializable map or struct
///
/// Fields are taken in key order; `None` fields are skipped.
pub fn equality_or_range_from<U>(
    conditions: &U,
    operator: BooleanOperator,
) -> Result<Option<Expression>, Error>
where
    U: Serialize,
{
    let item: HashMap<String, AttributeValue> = to_item(conditions)?;
    let mut conditions: Vec<(String, AttributeValue)> = item
        .into_iter()
        .filter(|(_, value)| !matches!(value, AttributeValue::Null(_)))
        .collect();
    conditions.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(equality_or_range(conditions, operator))
}

/// Case-insensitive substring search across `fields`, joined with OR
///
/// The term is lower-cased, so the searched attributes should hold lower-case
/// copies of the text. Blank terms or an empty field list give `None`.
pub fn text_search<I, F>(term: &str, fields: I) -> Option<Expression>
where
    I: IntoIterator<Item = F>,
    F: AsRef<str>,
{
    if term.trim().is_empty() {
        return None;
    }

    let mut builder = ClauseBuilder::default();
    let term = AttributeValue::S(term.to_lowercase());
    let mut shared_value: Option<String> = None;

    for field in fields {
        let field = field.as_ref();
        if field.is_empty() {
            continue;
        }
        let name = builder.name(field);
        let placeholder = shared_value
            .get_or_insert_with(|| builder.value("search_term", term.clone()))
            .clone();
        builder.push(format!("contains({name}, {placeholder})"));
    }

    builder.finish(BooleanOperator::Or)
}

/// Inclusive range on a date-like string attribute
///
/// Either bound may be omitted; with neither there is nothing to filter and
/// the result is `None`.
pub fn date_range(field: &str, start: Option<&str>, end: Option<&str>) -> Option<Expression> {
    if start.is_none() && end.is_none() {
        return None;
    }

    let mut builder = ClauseBuilder::default();
    let name = builder.name(field);

    if let Some(start) = start {
        let placeholder = builder.value("start_date", AttributeValue::S(start.to_string()));
        builder.push(format!("{name} >= {placeholder}"));
    }
    if let Some(end) = end {
        let placeholder = builder.value("end_date", AttributeValue::S(end.to_string()));
        builder.push(format!("{name} <= {placeholder}"));
    }

    builder.finish(BooleanOperator::And)
}

/// `#field = :field`
pub fn equals(field: &str, value: AttributeValue) -> Expression {
    single_clause(field, field, value, |name, value| format!("{name} = {value}"))
}

/// `contains(#field, :field)`
pub fn contains(field: &str, value: AttributeValue) -> Expression {
    single_clause(field, field, value, |name, value| {
        format!("contains({name}, {value})")
    })
}

/// Guard for a write that expects `version_field` to still hold `expected`
pub fn optimistic_lock(version_field: &str, expected: i64) -> Expression {
    single_clause(
        version_field,
        "expected_version",
        AttributeValue::N(expected.to_string()),
        |name, value| format!("{name} = {value}"),
    )
}

/// Matches items whose boolean `flag_field` is absent or false
pub fn not_deleted(flag_field: &str) -> Expression {
    single_clause(
        flag_field,
        "not_deleted",
        AttributeValue::Bool(false),
        |name, value| format!("attribute_not_exists({name}) OR {name} = {value}"),
    )
}

fn single_clause(
    field: &str,
    value_stem: &str,
    value: AttributeValue,
    clause: impl FnOnce(&str, &str) -> String,
) -> Expression {
    let mut builder = ClauseBuilder::default();
    let name = builder.name(field);
    let placeholder = builder.value(value_stem, value);
    Expression {
        text: clause(&name, &placeholder),
        names: builder.names,
        values: builder.values,
    }
}

/// Join expressions with `operator`, each wrapped in parentheses
///
/// `None` inputs are skipped. With no expressions left the result is `None`;
/// a single expression is returned unchanged. When two inputs use the same
/// placeholder for different bindings, the later one is renamed.
///
/// ```
/// use dynamo_batch::expression::{BooleanOperator, combine, not_deleted, text_search};
///
/// let filter = combine(
///     [text_search("Seoul", ["title"]), Some(not_deleted("deleted"))],
///     BooleanOperator::And,
/// )
/// .unwrap();
/// assert!(filter.validate().is_ok());
/// ```
pub fn combine<I, E>(expressions: I, operator: BooleanOperator) -> Option<Expression>
where
    I: IntoIterator<Item = E>,
    E: Into<Option<Expression>>,
{
    let mut expressions = expressions.into_iter().filter_map(Into::into);
    let first = expressions.next()?;
    let Some(second) = expressions.next() else {
        return Some(first);
    };

    let mut clauses = vec![format!("({})", first.text)];
    let mut names = first.names;
    let mut values = first.values;

    for expression in std::iter::once(second).chain(expressions) {
        let mut renames = HashMap::new();

        for (placeholder, attribute) in expression.names {
            let target = match names.get(&placeholder) {
                None => placeholder.clone(),
                Some(bound) if *bound == attribute => placeholder.clone(),
                Some(_) => {
                    let fresh = fresh_placeholder(&placeholder, |candidate| {
                        names.contains_key(candidate)
                            || expression.text.contains(candidate)
                            || renames.values().any(|r: &String| r == candidate)
                    });
                    let _ = renames.insert(placeholder.clone(), fresh.clone());
                    fresh
                }
            };
            let _ = names.insert(target, attribute);
        }

        for (placeholder, value) in expression.values {
            let target = match values.get(&placeholder) {
                None => placeholder.clone(),
                Some(bound) if *bound == value => placeholder.clone(),
                Some(_) => {
                    let fresh = fresh_placeholder(&placeholder, |candidate| {
                        values.contains_key(candidate)
                            || expression.text.contains(candidate)
                            || renames.values().any(|r: &String| r == candidate)
                    });
                    let _ = renames.insert(placeholder.clone(), fresh.clone());
                    fresh
                }
            };
            let _ = values.insert(target, value);
        }

        let text = rewrite_placeholders(&expression.text, &renames);
        clauses.push(format!("({text})"));
    }

    Some(Expression {
        text: clauses.join(&format!(" {operator} ")),
        names,
        values,
    })
}
