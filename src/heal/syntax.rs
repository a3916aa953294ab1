//! 补丁后单文件语法校验（tree-sitter）
//!
//! 只解析被修改的那一个文件；不认识的扩展名直接放行。

use tree_sitter::{Language, Node, Parser};

fn language_for(path: &str) -> Option<Language> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    let lang: Language = match ext.as_str() {
        "rs" => tree_sitter_rust::LANGUAGE.into(),
        "py" => tree_sitter_python::LANGUAGE.into(),
        "js" | "jsx" | "mjs" | "cjs" => tree_sitter_javascript::LANGUAGE.into(),
        "ts" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        "tsx" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        "go" => tree_sitter_go::LANGUAGE.into(),
        _ => return None,
    };
    Some(lang)
}

/// 是否有对应的语法（用于日志）
pub fn is_supported(path: &str) -> bool {
    language_for(path).is_some()
}

/// 校验源码能否被解析；失败时返回首个错误位置的描述
pub fn check_syntax(path: &str, source: &str) -> Result<(), String> {
    let Some(lang) = language_for(path) else {
        return Ok(());
    };
    let mut parser = Parser::new();
    parser
        .set_language(&lang)
        .map_err(|e| format!("grammar unavailable for {path}: {e}"))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| format!("parser gave up on {path}"))?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }
    let (line, col) = first_error(root)
        .map(|n| {
            let p = n.start_position();
            (p.row + 1, p.column + 1)
        })
        .unwrap_or((0, 0));
    Err(format!("{path}:{line}:{col}: patched file does not parse"))
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}
