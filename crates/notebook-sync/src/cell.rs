//! Cell and output types shared by the store, the wire protocol and the
//! REST client.
//!
//! Cells carry no stable identity: a cell is addressed by its position in the
//! notebook's cell list.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Cell type tag. Only code and markdown cells exist in pup notebooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    Code,
    Markdown,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
        }
    }
}

/// A single notebook cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    /// Source lines, each keeping its trailing newline.
    #[serde(default, deserialize_with = "deserialize_source")]
    pub source: Vec<String>,
    /// Only meaningful for code cells.
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl Cell {
    /// A fresh, empty code cell.
    pub fn empty_code() -> Self {
        Self::default()
    }

    /// A cell of the given type holding `content` as its source.
    pub fn with_content(cell_type: CellType, content: &str) -> Self {
        Self {
            cell_type,
            source: source_to_lines(content),
            outputs: Vec::new(),
        }
    }

    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    /// The full source text (lines joined).
    pub fn source_text(&self) -> String {
        self.source.concat()
    }

    pub fn set_source_text(&mut self, content: &str) {
        self.source = source_to_lines(content);
    }
}

/// Split source text into lines that keep their trailing newline.
pub fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

/// Accept `source` either as one string or as a list of line strings.
fn deserialize_source<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct SourceVisitor;

    impl<'de> de::Visitor<'de> for SourceVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<String>, E> {
            Ok(source_to_lines(v))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<String>, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<String>, A::Error> {
            let mut lines = Vec::new();
            while let Some(line) = seq.next_element::<String>()? {
                lines.push(line);
            }
            Ok(lines)
        }
    }

    deserializer.deserialize_any(SourceVisitor)
}

/// Output kind tag for structured outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stream,
    ExecuteResult,
    DisplayData,
    Error,
}

/// A structured execution result, as produced by the server's executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub output_type: OutputKind,
    /// MIME type → payload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
    /// Plain-text fallback (stream text, formatted traceback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Stream name (`stdout` / `stderr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

impl StructuredOutput {
    /// A stream output with the given name and text.
    pub fn stream(name: &str, text: &str) -> Self {
        Self {
            output_type: OutputKind::Stream,
            data: BTreeMap::new(),
            text: Some(text.to_string()),
            name: Some(name.to_string()),
            execution_count: None,
            metadata: None,
            ename: None,
            evalue: None,
            traceback: None,
        }
    }
}

/// One entry of a cell's output log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Output {
    Text(String),
    Structured(StructuredOutput),
}

impl Output {
    /// Best-effort plain-text rendering of the output.
    pub fn display_text(&self) -> String {
        match self {
            Output::Text(text) => text.clone(),
            Output::Structured(out) => {
                if let Some(text) = &out.text {
                    return text.clone();
                }
                match out.data.get("text/plain") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(lines)) => lines
                        .iter()
                        .filter_map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .concat(),
                    Some(other) => other.to_string(),
                    None => match (&out.ename, &out.evalue) {
                        (Some(ename), Some(evalue)) => format!("{}: {}", ename, evalue),
                        (Some(ename), None) => ename.clone(),
                        _ => String::new(),
                    },
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Structured(s) if s.output_type == OutputKind::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_lines_keep_newlines() {
        assert_eq!(source_to_lines("a\nb"), vec!["a\n", "b"]);
        assert_eq!(source_to_lines("a\n"), vec!["a\n"]);
        assert!(source_to_lines("").is_empty());
    }

    #[test]
    fn test_cell_accepts_string_source() {
        let json = r#"{"cell_type": "code", "source": "x = 1\ny = 2", "outputs": []}"#;
        let cell: Cell = serde_json::from_str(json).unwrap();
        assert_eq!(cell.source, vec!["x = 1\n", "y = 2"]);
        assert_eq!(cell.source_text(), "x = 1\ny = 2");
    }

    #[test]
    fn test_cell_accepts_list_source_and_missing_outputs() {
        let json = r##"{"cell_type": "markdown", "source": ["# Title\n", "body"]}"##;
        let cell: Cell = serde_json::from_str(json).unwrap();
        assert_eq!(cell.cell_type, CellType::Markdown);
        assert_eq!(cell.source_text(), "# Title\nbody");
        assert!(cell.outputs.is_empty());
    }

    #[test]
    fn test_cell_rejects_unknown_type() {
        let json = r#"{"cell_type": "raw", "source": []}"#;
        assert!(serde_json::from_str::<Cell>(json).is_err());
    }

    #[test]
    fn test_output_untagged_variants() {
        let text: Output = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text, Output::Text("hello".into()));

        let json = r#"{"output_type": "execute_result", "data": {"text/plain": "42"}, "execution_count": 3}"#;
        let result: Output = serde_json::from_str(json).unwrap();
        match &result {
            Output::Structured(s) => {
                assert_eq!(s.output_type, OutputKind::ExecuteResult);
                assert_eq!(s.execution_count, Some(3));
            }
            _ => panic!("expected structured output"),
        }
        assert_eq!(result.display_text(), "42");
    }

    #[test]
    fn test_error_output_display_text() {
        let json = r#"{"output_type": "error", "ename": "NameError", "evalue": "x is not defined", "traceback": []}"#;
        let out: Output = serde_json::from_str(json).unwrap();
        assert!(out.is_error());
        assert_eq!(out.display_text(), "NameError: x is not defined");
    }

    #[test]
    fn test_stream_output_serializes_compactly() {
        let out = Output::Structured(StructuredOutput::stream("stdout", "hi\n"));
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"output_type": "stream", "name": "stdout", "text": "hi\n"})
        );
    }
}
