//! Tree-sitter based splitter for Python sources
//!
//! A file becomes an ordered list of top-level function units plus the
//! preamble (imports, constants) that precedes the first of them.

use crate::error::OptimizeError;
use crate::optimize::state::FunctionUnit;
use std::cell::RefCell;
use std::collections::HashSet;
use tree_sitter::{Node, Parser, Tree};

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// Result of splitting one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub functions: Vec<FunctionUnit>,
    /// Everything before the first function, right-trimmed.
    pub preamble: String,
}

fn parse(source: &str) -> Result<Tree, OptimizeError> {
    PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(source, None))
        .ok_or_else(|| OptimizeError::Extraction {
            message: "Python parser is unavailable".to_string(),
        })
}

/// Split `source` into top-level functions and the preamble.
///
/// Decorated and `async` definitions count as functions and keep their
/// decorators. Classes and module-level statements after the first
/// function are not carried into any unit.
pub fn extract_functions(source: &str) -> Result<ExtractedFile, OptimizeError> {
    let tree = parse(source)?;
    let root = tree.root_node();

    if root.has_error() {
        let line = first_error_line(&root).unwrap_or(1);
        return Err(OptimizeError::Extraction {
            message: format!("invalid Python syntax near line {}", line),
        });
    }

    let mut functions = Vec::new();
    let mut seen = HashSet::new();
    let mut first_start: Option<usize> = None;
    let mut cursor = root.walk();

    for node in root.children(&mut cursor) {
        let Some(name) = function_name(&node, source) else {
            continue;
        };
        if !seen.insert(name.clone()) {
            return Err(OptimizeError::Extraction {
                message: format!(
                    "function '{}' is defined more than once (line {})",
                    name,
                    node.start_position().row + 1
                ),
            });
        }
        first_start.get_or_insert(node.start_byte());
        functions.push(FunctionUnit::new(name, get_node_text(&node, source)));
    }

    let preamble = match first_start {
        Some(start) => &source[..start],
        None => source,
    };

    tracing::debug!(functions = functions.len(), "extracted functions");
    Ok(ExtractedFile {
        functions,
        preamble: preamble.trim_end().to_string(),
    })
}

/// Name of a top-level function node, looking through decorators.
fn function_name(node: &Node, source: &str) -> Option<String> {
    match node.kind() {
        "function_definition" => node
            .child_by_field_name("name")
            .map(|n| get_node_text(&n, source)),
        "decorated_definition" => {
            let inner = node.child_by_field_name("definition")?;
            if inner.kind() == "function_definition" {
                inner
                    .child_by_field_name("name")
                    .map(|n| get_node_text(&n, source))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// 1-based line of the first error or missing node, in document order.
fn first_error_line(root: &Node) -> Option<usize> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }

        // Only descend into subtrees that contain an error.
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

fn get_node_text(node: &Node, source: &str) -> String {
    source[node.start_byte()..node.end_byte()].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_functions_and_preamble() {
        let source = "import math\nimport random\n\nSCALE = 3\n\n\ndef f(x=2):\n    return math.sqrt(x) * SCALE\n\n\ndef g():\n    return f() + random.random()\n";
        let file = extract_functions(source).unwrap();
        assert_eq!(file.preamble, "import math\nimport random\n\nSCALE = 3");
        let names: Vec<&str> = file.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f", "g"]);
        assert_eq!(
            file.functions[0].source,
            "def f(x=2):\n    return math.sqrt(x) * SCALE"
        );
    }

    #[test]
    fn decorated_and_async_functions_are_units() {
        let source = "import functools\n\n@functools.lru_cache(maxsize=None)\ndef fib(n=20):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n\nasync def fetch():\n    return 1\n";
        let file = extract_functions(source).unwrap();
        assert_eq!(file.functions.len(), 2);
        assert_eq!(file.functions[0].name, "fib");
        assert!(file.functions[0].source.starts_with("@functools.lru_cache"));
        assert_eq!(file.functions[1].name, "fetch");
        assert!(file.functions[1].source.starts_with("async def fetch"));
        assert_eq!(file.preamble, "import functools");
    }

    #[test]
    fn nested_functions_and_methods_are_not_units() {
        let source = "class Box:\n    def size(self):\n        return 1\n\ndef outer():\n    def inner():\n        return 2\n    return inner()\n";
        let file = extract_functions(source).unwrap();
        let names: Vec<&str> = file.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["outer"]);
        assert!(file.preamble.starts_with("class Box:"));
    }

    #[test]
    fn file_without_functions_is_all_preamble() {
        let file = extract_functions("X = 1\nY = 2\n\n").unwrap();
        assert!(file.functions.is_empty());
        assert_eq!(file.preamble, "X = 1\nY = 2");
    }

    #[test]
    fn syntax_error_is_reported_with_line() {
        let err = extract_functions("def ok():\n    return 1\n\ndef broken(:\n    pass\n").unwrap_err();
        assert_eq!(err.kind(), "extraction_failure");
        assert!(err.to_string().contains("line"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = extract_functions("def f():\n    return 1\n\ndef f():\n    return 2\n").unwrap_err();
        assert!(err.to_string().contains("'f'"));
    }
}
