use serde::{Deserialize, Serialize};

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Branch selector for `if-else` and `while` sources; ignored elsewhere.
    #[serde(default)]
    pub label: Option<String>,
}

/// Outgoing branch of a branching node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    True,
    False,
    Body,
    Exit,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Body => "body",
            Self::Exit => "exit",
        }
    }

    /// Parse an edge label. Case-insensitive; surrounding whitespace ignored.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(Self::True),
            "false" | "no" => Some(Self::False),
            "body" | "loop" => Some(Self::Body),
            "exit" | "done" => Some(Self::Exit),
            _ => None,
        }
    }
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn branch(&self) -> Option<Branch> {
        self.label.as_deref().and_then(Branch::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_aliases() {
        assert_eq!(Branch::parse("TRUE"), Some(Branch::True));
        assert_eq!(Branch::parse(" yes "), Some(Branch::True));
        assert_eq!(Branch::parse("No"), Some(Branch::False));
        assert_eq!(Branch::parse("loop"), Some(Branch::Body));
        assert_eq!(Branch::parse("done"), Some(Branch::Exit));
        assert_eq!(Branch::parse("maybe"), None);
    }

    #[test]
    fn test_edge_builder() {
        let e = Edge::new("e1", "a", "b").with_label("exit");
        assert_eq!(e.branch(), Some(Branch::Exit));
        assert_eq!(Edge::new("e2", "a", "b").branch(), None);
    }

    #[test]
    fn test_missing_label_deserializes() {
        let e: Edge = serde_json::from_str(r#"{"id":"e","source":"a","target":"b"}"#).unwrap();
        assert!(e.label.is_none());
    }
}
