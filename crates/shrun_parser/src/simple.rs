//! Line-oriented parser.
//!
//! One statement per line (or several separated by `;`), with multi-line
//! blocks for functions, `if`, `for` and `while`. Heredoc bodies are taken
//! verbatim from the lines following the command.

use crate::ast::{Command, FunctionDef, Node, Position, Redirect, RedirectOp, ScriptNode};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::{ParseError, Parser};

/// Default parser implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleParser;

impl SimpleParser {
    pub fn new() -> Self {
        Self
    }
}

impl Parser for SimpleParser {
    fn parse_string(&self, source: &str) -> Result<ScriptNode, ParseError> {
        let mut cursor = LineCursor::new(source);
        let (nodes, _) = parse_block(&mut cursor, &[])?;
        tracing::trace!(nodes = nodes.len(), "parsed script");
        Ok(ScriptNode {
            pos: Position::line(1),
            nodes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    number: usize,
    offset: usize,
    raw: &'a str,
}

impl<'a> Line<'a> {
    fn text(&self) -> &'a str {
        self.raw.trim()
    }

    fn indent(&self) -> usize {
        self.raw.len() - self.raw.trim_start().len()
    }

    fn position(&self) -> Position {
        Position::new(self.number, self.indent() + 1, self.offset + self.indent())
    }

    fn is_blank_or_comment(&self) -> bool {
        let text = self.text();
        text.is_empty() || text.starts_with('#')
    }
}

struct LineCursor<'a> {
    lines: Vec<Line<'a>>,
    next: usize,
}

impl<'a> LineCursor<'a> {
    fn new(source: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut offset = 0;
        for (idx, raw) in source.split('\n').enumerate() {
            lines.push(Line {
                number: idx + 1,
                offset,
                raw: raw.strip_suffix('\r').unwrap_or(raw),
            });
            offset += raw.len() + 1;
        }
        Self { lines, next: 0 }
    }

    fn next_raw(&mut self) -> Option<Line<'a>> {
        let line = self.lines.get(self.next).copied()?;
        self.next += 1;
        Some(line)
    }

    /// Next line that carries a statement.
    fn next_statement(&mut self) -> Option<Line<'a>> {
        while let Some(line) = self.next_raw() {
            if !line.is_blank_or_comment() {
                return Some(line);
            }
        }
        None
    }
}

/// Block terminator found by [`parse_block`].
struct Terminator<'a> {
    keyword: &'static str,
    line: Line<'a>,
}

const KEYWORDS: [&str; 5] = ["fi", "else", "elif", "done", "}"];

fn first_word(text: &str) -> &str {
    text.split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or("")
}

fn parse_block<'a>(
    cursor: &mut LineCursor<'a>,
    terminators: &[&'static str],
) -> Result<(Vec<Node>, Option<Terminator<'a>>), ParseError> {
    let mut nodes = Vec::new();
    while let Some(line) = cursor.next_statement() {
        let text = line.text();
        let head = first_word(text);
        if let Some(keyword) = KEYWORDS.iter().find(|k| **k == head) {
            if let Some(found) = terminators.iter().find(|t| **t == *keyword) {
                return Ok((nodes, Some(Terminator { keyword: *found, line })));
            }
            return Err(ParseError::Unexpected {
                token: head.to_string(),
                line: line.number,
            });
        }
        parse_line(cursor, line, &mut nodes)?;
    }
    Ok((nodes, None))
}

fn parse_line<'a>(
    cursor: &mut LineCursor<'a>,
    line: Line<'a>,
    nodes: &mut Vec<Node>,
) -> Result<(), ParseError> {
    let text = line.text();

    if let Some(rest) = text.strip_prefix('@') {
        nodes.push(parse_annotation(rest, line)?);
        return Ok(());
    }
    if let Some((name, inline)) = function_header(text) {
        nodes.push(parse_function(cursor, line, name, inline)?);
        return Ok(());
    }
    match first_word(text) {
        "if" => nodes.push(parse_if(cursor, line, &text[2..])?),
        "for" => nodes.push(parse_for(cursor, line)?),
        "while" => nodes.push(parse_while(cursor, line)?),
        _ => nodes.extend(parse_statements(Some(cursor), line, text)?),
    }
    Ok(())
}

fn parse_annotation(content: &str, line: Line<'_>) -> Result<Node, ParseError> {
    let (name, value) = match content.find('(') {
        Some(idx) => {
            let value = content[idx + 1..]
                .strip_suffix(')')
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            (content[..idx].trim(), value)
        }
        None => (content.trim(), String::new()),
    };
    if name.is_empty() {
        return Err(ParseError::Invalid {
            message: "annotation without a name".into(),
            line: line.number,
        });
    }
    Ok(Node::Annotation {
        pos: line.position(),
        name: name.to_string(),
        value,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Recognizes `name() {`, `name () {`, `function name {` and
/// `function name() {`. Returns the name and any text following the brace.
fn function_header(text: &str) -> Option<(&str, &str)> {
    let brace = text.find('{')?;
    let (head, inline) = (text[..brace].trim(), text[brace + 1..].trim());
    let head = head.strip_prefix("function ").map(str::trim).unwrap_or(head);
    let explicit = text.starts_with("function ");
    let name = match head.strip_suffix("()") {
        Some(name) => name.trim(),
        None if explicit => head,
        None => return None,
    };
    is_identifier(name).then_some((name, inline))
}

fn parse_function<'a>(
    cursor: &mut LineCursor<'a>,
    line: Line<'a>,
    name: &str,
    inline: &str,
) -> Result<Node, ParseError> {
    let body = if let Some(inner) = inline.strip_suffix('}') {
        parse_statements(None, line, inner.trim().trim_end_matches(';'))?
    } else {
        if !inline.is_empty() {
            return Err(ParseError::Invalid {
                message: format!("unexpected text after `{{` in function {name}"),
                line: line.number,
            });
        }
        let (nodes, end) = parse_block(cursor, &["}"])?;
        if end.is_none() {
            return Err(unterminated("function", "}", line));
        }
        nodes
    };
    Ok(Node::Function(FunctionDef {
        pos: line.position(),
        name: name.to_string(),
        body: block(line, body),
    }))
}

fn unterminated(construct: &'static str, expected: &str, line: Line<'_>) -> ParseError {
    ParseError::Unterminated {
        construct,
        expected: expected.to_string(),
        line: line.number,
    }
}

fn block(line: Line<'_>, nodes: Vec<Node>) -> ScriptNode {
    ScriptNode {
        pos: line.position(),
        nodes,
    }
}

/// Strip a trailing `; keyword` from a header. When the keyword is absent
/// the next statement line must consist of it alone.
fn header_body<'a>(
    cursor: &mut LineCursor<'a>,
    line: Line<'a>,
    header: &'a str,
    keyword: &'static str,
    construct: &'static str,
) -> Result<&'a str, ParseError> {
    let header = header.trim();
    if let Some(head) = header.strip_suffix(keyword) {
        let head = head.trim_end();
        if let Some(head) = head.strip_suffix(';') {
            return Ok(head.trim());
        }
    }
    match cursor.next_statement() {
        Some(next) if next.text() == keyword => Ok(header.trim_end_matches(';').trim()),
        _ => Err(unterminated(construct, keyword, line)),
    }
}

fn parse_condition(line: Line<'_>, text: &str) -> Result<Box<Node>, ParseError> {
    let mut nodes = parse_statements(None, line, text)?;
    match (nodes.pop(), nodes.is_empty()) {
        (Some(node), true) => Ok(Box::new(node)),
        _ => Err(ParseError::Invalid {
            message: "condition must be a single command".into(),
            line: line.number,
        }),
    }
}

fn parse_if<'a>(
    cursor: &mut LineCursor<'a>,
    line: Line<'a>,
    header: &'a str,
) -> Result<Node, ParseError> {
    let condition = header_body(cursor, line, header, "then", "if")?;
    let condition = parse_condition(line, condition)?;
    let (then_nodes, end) = parse_block(cursor, &["else", "elif", "fi"])?;
    let end = end.ok_or_else(|| unterminated("if", "fi", line))?;
    let otherwise = match end.keyword {
        "fi" => None,
        "else" => {
            let (else_nodes, fi) = parse_block(cursor, &["fi"])?;
            if fi.is_none() {
                return Err(unterminated("if", "fi", line));
            }
            Some(block(end.line, else_nodes))
        }
        _ => {
            // elif: the nested `if` consumes the closing `fi`
            let nested = parse_if(cursor, end.line, &end.line.text()[4..])?;
            Some(block(end.line, vec![nested]))
        }
    };
    Ok(Node::If {
        pos: line.position(),
        condition,
        then: block(line, then_nodes),
        otherwise,
    })
}

fn parse_for<'a>(cursor: &mut LineCursor<'a>, line: Line<'a>) -> Result<Node, ParseError> {
    let header = header_body(cursor, line, &line.text()[3..], "do", "for")?;
    let (variable, items) = match header.split_once(" in ") {
        Some((variable, items)) => (variable.trim(), items),
        None if header.trim_end().ends_with(" in") => (header.trim_end().trim_end_matches(" in").trim(), ""),
        None => {
            return Err(ParseError::Invalid {
                message: "expected `for NAME in ITEMS`".into(),
                line: line.number,
            })
        }
    };
    if !is_identifier(variable) {
        return Err(ParseError::Invalid {
            message: format!("invalid loop variable `{variable}`"),
            line: line.number,
        });
    }
    let list = tokenize(items)
        .into_iter()
        .map(|t| match t.kind {
            TokenKind::Word(w) => Ok(w),
            other => Err(ParseError::Unexpected {
                token: format!("{other:?}"),
                line: line.number,
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (body, end) = parse_block(cursor, &["done"])?;
    if end.is_none() {
        return Err(unterminated("for", "done", line));
    }
    Ok(Node::For {
        pos: line.position(),
        variable: variable.to_string(),
        list,
        body: block(line, body),
    })
}

fn parse_while<'a>(cursor: &mut LineCursor<'a>, line: Line<'a>) -> Result<Node, ParseError> {
    let header = header_body(cursor, line, &line.text()[5..], "do", "while")?;
    let condition = parse_condition(line, header)?;
    let (body, end) = parse_block(cursor, &["done"])?;
    if end.is_none() {
        return Err(unterminated("while", "done", line));
    }
    Ok(Node::While {
        pos: line.position(),
        condition,
        body: block(line, body),
    })
}

/// Parse the `;`-separated statements of one line. Heredoc bodies are read
/// from `cursor` when one is available.
fn parse_statements<'a>(
    mut cursor: Option<&mut LineCursor<'a>>,
    line: Line<'a>,
    text: &str,
) -> Result<Vec<Node>, ParseError> {
    let tokens = tokenize(text);
    let base = line.position();
    let mut nodes = Vec::new();
    for group in tokens.split(|t| t.kind == TokenKind::Semicolon) {
        if group.is_empty() {
            continue;
        }
        let pos = Position::new(
            base.line,
            base.column + group[0].span.start,
            base.offset + group[0].span.start,
        );
        let raw = &text[group[0].span.start..group[group.len() - 1].span.end];
        if let Some(node) = parse_assignment(raw, pos) {
            nodes.push(node);
            continue;
        }
        if let [only] = group {
            match only.word() {
                Some("break") => {
                    nodes.push(Node::Break(pos));
                    continue;
                }
                Some("continue") => {
                    nodes.push(Node::Continue(pos));
                    continue;
                }
                _ => {}
            }
        }
        nodes.push(parse_and_or(cursor.as_deref_mut(), line, pos, text, group)?);
    }
    Ok(nodes)
}

/// `name=value` with an identifier on the left. Surrounding quotes on the
/// value are removed.
fn parse_assignment(raw: &str, pos: Position) -> Option<Node> {
    let mut quote = None;
    let mut equals = None;
    for (idx, ch) in raw.char_indices() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            ('=', None) => {
                equals = Some(idx);
                break;
            }
            (c, None) if c.is_whitespace() => return None,
            _ => {}
        }
    }
    let equals = equals?;
    let name = raw[..equals].trim();
    if !is_identifier(name) {
        return None;
    }
    let mut value = raw[equals + 1..].trim();
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        let (first, last) = (bytes[0], bytes[value.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            value = &value[1..value.len() - 1];
        }
    }
    Some(Node::Assignment {
        pos,
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_and_or<'a>(
    cursor: Option<&mut LineCursor<'a>>,
    line: Line<'a>,
    pos: Position,
    text: &str,
    tokens: &[Token],
) -> Result<Node, ParseError> {
    let (tokens, background) = match tokens.split_last() {
        Some((last, rest)) if last.kind == TokenKind::Ampersand => (rest, true),
        _ => (tokens, false),
    };

    let mut heredoc = None;
    let mut node: Option<Node> = None;
    let mut pending_op: Option<TokenKind> = None;
    let mut start = 0;
    for idx in 0..=tokens.len() {
        let at_end = idx == tokens.len();
        if !at_end && !matches!(tokens[idx].kind, TokenKind::And | TokenKind::Or) {
            continue;
        }
        let segment = &tokens[start..idx];
        let pipeline = parse_pipeline(line, segment, &mut heredoc)?;
        node = Some(match (node.take(), pending_op.take()) {
            (None, _) => pipeline,
            (Some(left), Some(TokenKind::And)) => Node::And {
                pos,
                left: Box::new(left),
                right: Box::new(pipeline),
            },
            (Some(left), _) => Node::Or {
                pos,
                left: Box::new(left),
                right: Box::new(pipeline),
            },
        });
        if !at_end {
            pending_op = Some(tokens[idx].kind.clone());
            start = idx + 1;
        }
    }
    let mut node = node.ok_or_else(|| ParseError::Unexpected {
        token: text.to_string(),
        line: line.number,
    })?;

    if let Some(delimiter) = heredoc {
        let cursor = cursor.ok_or_else(|| ParseError::Invalid {
            message: "heredoc is not allowed here".into(),
            line: line.number,
        })?;
        let body = read_heredoc(cursor, line, &delimiter)?;
        node = Node::Heredoc {
            pos,
            command: Box::new(node),
            body,
        };
    }
    if background {
        node = Node::Background {
            pos,
            command: Box::new(node),
        };
    }
    Ok(node)
}

fn read_heredoc(cursor: &mut LineCursor<'_>, line: Line<'_>, delimiter: &str) -> Result<String, ParseError> {
    let mut body = String::new();
    while let Some(next) = cursor.next_raw() {
        if next.text() == delimiter {
            return Ok(body);
        }
        body.push_str(next.raw);
        body.push('\n');
    }
    Err(ParseError::Unterminated {
        construct: "heredoc",
        expected: delimiter.to_string(),
        line: line.number,
    })
}

fn parse_pipeline(
    line: Line<'_>,
    tokens: &[Token],
    heredoc: &mut Option<String>,
) -> Result<Node, ParseError> {
    let mut node: Option<Node> = None;
    for segment in tokens.split(|t| t.kind == TokenKind::Pipe) {
        let cmd = Node::Command(parse_command(line, segment, heredoc)?);
        node = Some(match node {
            None => cmd,
            Some(left) => Node::pipe(left, cmd),
        });
    }
    node.ok_or_else(|| ParseError::Unexpected {
        token: "|".into(),
        line: line.number,
    })
}

fn parse_command(
    line: Line<'_>,
    tokens: &[Token],
    heredoc: &mut Option<String>,
) -> Result<Command, ParseError> {
    let base = line.position();
    let mut words = Vec::new();
    let mut redirect: Option<Redirect> = None;
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        let pos = Position::new(
            base.line,
            base.column + token.span.start,
            base.offset + token.span.start,
        );
        match &token.kind {
            TokenKind::Word(w) => words.push(w.clone()),
            TokenKind::HeredocStart(delim) => *heredoc = Some(delim.clone()),
            TokenKind::Redirect { op, fd } => {
                let file = if *op == RedirectOp::StderrToStdout {
                    String::new()
                } else {
                    match iter.next().and_then(Token::word) {
                        Some(file) => file.to_string(),
                        None => {
                            return Err(ParseError::Invalid {
                                message: format!("missing target for `{op}`"),
                                line: line.number,
                            })
                        }
                    }
                };
                let next = Redirect { pos, op: *op, file, fd: *fd };
                redirect = Some(merge_redirect(line, redirect, next)?);
            }
            other => {
                return Err(ParseError::Unexpected {
                    token: format!("{other:?}"),
                    line: line.number,
                })
            }
        }
    }
    if words.is_empty() {
        return Err(ParseError::Invalid {
            message: "missing command name".into(),
            line: line.number,
        });
    }
    let name = words.remove(0);
    Ok(Command {
        pos: base_for(tokens, base),
        name,
        args: words,
        redirect,
    })
}

fn base_for(tokens: &[Token], base: Position) -> Position {
    match tokens.first() {
        Some(t) => Position::new(base.line, base.column + t.span.start, base.offset + t.span.start),
        None => base,
    }
}

/// A command carries a single redirect; `> file 2>&1` folds into `&> file`.
fn merge_redirect(
    line: Line<'_>,
    current: Option<Redirect>,
    next: Redirect,
) -> Result<Redirect, ParseError> {
    match current {
        None => Ok(next),
        Some(cur)
            if cur.op == RedirectOp::Out
                && cur.fd == 1
                && next.op == RedirectOp::StderrToStdout =>
        {
            Ok(Redirect {
                op: RedirectOp::All,
                ..cur
            })
        }
        Some(_) => Err(ParseError::Invalid {
            message: "only one redirection per command is supported".into(),
            line: line.number,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ScriptNode {
        SimpleParser::new().parse_string(src).expect("parse")
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let script = parse("\n# comment\necho hi\n\n");
        assert_eq!(script.len(), 1);
        assert_eq!(script.nodes[0].position().line, 3);
    }

    #[test]
    fn assignment_strips_matching_quotes() {
        let script = parse("name=\"hello world\"\nother='x'\nraw=\"unbalanced");
        let values: Vec<_> = script
            .nodes
            .iter()
            .map(|n| match n {
                Node::Assignment { value, .. } => value.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec!["hello world", "x", "\"unbalanced"]);
    }

    #[test]
    fn argument_with_equals_is_not_an_assignment() {
        let script = parse("echo a=b");
        assert!(matches!(&script.nodes[0], Node::Command(c) if c.args == vec!["a=b"]));
    }

    #[test]
    fn array_assignment_keeps_parenthesised_value() {
        let script = parse("arr=(a \"b c\" 'd e')");
        match &script.nodes[0] {
            Node::Assignment { name, value, .. } => {
                assert_eq!(name, "arr");
                assert_eq!(value, "(a \"b c\" 'd e')");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pipeline_is_left_nested() {
        let script = parse("echo a | grep a | wc -l");
        match &script.nodes[0] {
            Node::Pipe { left, right, .. } => {
                assert!(matches!(left.as_ref(), Node::Pipe { .. }));
                assert_eq!(right.as_command().map(|c| c.name.as_str()), Some("wc"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn and_or_chain_is_left_associative() {
        let script = parse("true && false || echo x");
        match &script.nodes[0] {
            Node::Or { left, .. } => assert!(matches!(left.as_ref(), Node::And { .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trailing_ampersand_makes_background() {
        let script = parse("sleep 1 &");
        assert!(matches!(&script.nodes[0], Node::Background { .. }));
    }

    #[test]
    fn redirect_with_stderr_merge_folds_into_all() {
        let script = parse("make > build.log 2>&1");
        let cmd = script.nodes[0].as_command().expect("command");
        let redirect = cmd.redirect.as_ref().expect("redirect");
        assert_eq!(redirect.op, RedirectOp::All);
        assert_eq!(redirect.file, "build.log");
    }

    #[test]
    fn heredoc_body_is_read_verbatim() {
        let script = parse("cat <<EOF\n  line one\nline two\nEOF\necho after");
        assert_eq!(script.len(), 2);
        match &script.nodes[0] {
            Node::Heredoc { body, command, .. } => {
                assert_eq!(body, "  line one\nline two\n");
                assert_eq!(command.as_command().map(|c| c.name.as_str()), Some("cat"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn function_blocks_in_all_spellings() {
        let script = parse(
            "greet() {\n  echo hi\n}\nfunction bye {\n  echo bye\n}\nfunction one() { echo 1; echo 2; }",
        );
        let names: Vec<_> = script
            .nodes
            .iter()
            .map(|n| match n {
                Node::Function(f) => (f.name.clone(), f.body.len()),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            names,
            vec![("greet".into(), 1), ("bye".into(), 1), ("one".into(), 2)]
        );
    }

    #[test]
    fn if_else_and_elif() {
        let script = parse("if test -f x; then\n echo a\nelif true; then\n echo b\nelse\n echo c\nfi");
        match &script.nodes[0] {
            Node::If { then, otherwise: Some(other), .. } => {
                assert_eq!(then.len(), 1);
                match &other.nodes[0] {
                    Node::If { otherwise: Some(inner), .. } => assert_eq!(inner.len(), 1),
                    n => panic!("unexpected {n:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn for_and_while_loops() {
        let script = parse("for x in a \"b c\"; do\n echo $x\n break\ndone\nwhile true\ndo\n continue\ndone");
        match &script.nodes[0] {
            Node::For { variable, list, body, .. } => {
                assert_eq!(variable, "x");
                assert_eq!(list, &vec!["a".to_string(), "b c".to_string()]);
                assert!(matches!(body.nodes[1], Node::Break(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&script.nodes[1], Node::While { .. }));
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let err = SimpleParser::new().parse_string("if true; then\necho x").unwrap_err();
        assert!(matches!(err, ParseError::Unterminated { construct: "if", .. }));
    }

    #[test]
    fn stray_terminator_is_an_error() {
        let err = SimpleParser::new().parse_string("echo x\ndone").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { line: 2, .. }));
    }

    #[test]
    fn annotations_are_parsed() {
        let script = parse("@Route(/users)\necho hi");
        match &script.nodes[0] {
            Node::Annotation { name, value, .. } => {
                assert_eq!(name, "Route");
                assert_eq!(value, "/users");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn semicolons_split_statements_on_one_line() {
        let script = parse("echo a; echo b");
        assert_eq!(script.len(), 2);
        assert!(script.nodes.iter().all(|n| n.position().line == 1));
    }
}
