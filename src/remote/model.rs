use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Error body returned by PostgREST.
#[derive(Deserialize, Debug, Default)]
pub struct PostgrestError {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl PostgrestError {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| Self {
            message: Some(body.trim().to_string()).filter(|m| !m.is_empty()),
            ..Self::default()
        })
    }

    pub fn describe(&self) -> String {
        let mut out = self.message.clone().unwrap_or_else(|| "no message".into());
        if let Some(details) = self.details.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(" (");
            out.push_str(details);
            out.push(')');
        }
        if let Some(hint) = self.hint.as_deref().filter(|h| !h.is_empty()) {
            out.push_str("; hint: ");
            out.push_str(hint);
        }
        out
    }
}

/// Row filter rendered as a PostgREST query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(column.into(), value.into())
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(column.into(), value.into())
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::Gte(c, _) | Self::Lte(c, _) => c,
        }
    }

    /// `eq.<value>` style operand.
    pub fn operand(&self) -> String {
        let (op, value) = match self {
            Self::Eq(_, v) => ("eq", v),
            Self::Gte(_, v) => ("gte", v),
            Self::Lte(_, v) => ("lte", v),
        };
        format!("{op}.{}", plain(value))
    }

    /// Whether a row satisfies the filter, for in-process stores.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(self.column()) else {
            return false;
        };
        match self {
            Self::Eq(_, v) => plain(actual) == plain(v),
            Self::Gte(_, v) => plain(actual) >= plain(v),
            Self::Lte(_, v) => plain(actual) <= plain(v),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column(), self.operand())
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
