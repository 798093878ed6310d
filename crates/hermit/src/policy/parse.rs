//! Extract invoked commands from a shell script.

use thiserror::Error;
use tree_sitter::{Node, Parser};

use super::handler::CommandInfo;

/// Why a script could not be analysed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The bash grammar could not be loaded.
    #[error("failed to load bash grammar: {0}")]
    Grammar(String),
    /// The parser gave up.
    #[error("failed to parse script")]
    Failed,
    /// The script contains syntax errors.
    #[error("script has syntax errors")]
    Syntax,
}

/// Parse `script` and return every command it would invoke, in source order.
pub fn extract_commands(script: &str) -> Result<Vec<CommandInfo>, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|e| ParseError::Grammar(e.to_string()))?;

    let tree = parser.parse(script, None).ok_or(ParseError::Failed)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(ParseError::Syntax);
    }

    let mut commands = Vec::new();
    collect(root, script.as_bytes(), &mut commands);
    Ok(commands)
}

fn collect(node: Node<'_>, src: &[u8], out: &mut Vec<CommandInfo>) {
    if node.kind() == "command"
        && let Some(name) = node.child_by_field_name("name")
    {
        let mut cursor = node.walk();
        let args = node
            .children_by_field_name("argument", &mut cursor)
            .map(|arg| text(arg, src))
            .collect();
        out.push(CommandInfo::new(unquote(&text(name, src)), args));
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect(child, src, out);
    }
}

fn text(node: Node<'_>, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().to_string()
}

fn unquote(name: &str) -> String {
    let trimmed = name.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn names(script: &str) -> Vec<String> {
        extract_commands(script)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_simple_command() {
        let cmds = extract_commands("ls -la src").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "ls");
        assert_eq!(cmds[0].args, vec!["-la", "src"]);
    }

    #[test]
    fn test_pipelines_and_lists() {
        assert_eq!(
            names("cat a.txt | grep foo && wc -l; echo done"),
            vec!["cat", "grep", "wc", "echo"]
        );
    }

    #[test]
    fn test_nested_substitution_and_subshell() {
        let found = names("echo $(whoami) && (cd src; make)");
        assert!(found.contains(&"whoami".to_string()));
        assert!(found.contains(&"make".to_string()));
        assert!(found.contains(&"cd".to_string()));
    }

    #[test]
    fn test_function_body_is_inspected() {
        let found = names("f() { curl evil.example; }; f");
        assert!(found.contains(&"curl".to_string()));
    }

    #[test]
    fn test_quoted_command_name() {
        assert_eq!(names("'ls' -l"), vec!["ls"]);
    }

    #[test]
    fn test_syntax_error() {
        assert_eq!(
            extract_commands("echo \"unterminated").unwrap_err(),
            ParseError::Syntax
        );
    }
}
