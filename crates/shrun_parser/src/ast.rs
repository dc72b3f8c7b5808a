//! Abstract syntax tree consumed by the execution engine.
//!
//! The tree is immutable once produced: the engine and the debugger only
//! ever hold shared references into it.

use std::fmt;

/// Source position of a node. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self { line, column, offset }
    }

    /// Position at the start of the given line.
    pub fn line(line: usize) -> Self {
        Self { line, column: 1, offset: 0 }
    }
}

/// Redirection operators understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// `>`
    Out,
    /// `>>`
    Append,
    /// `<`
    In,
    /// `2>&1`
    StderrToStdout,
    /// `&>`
    All,
}

impl RedirectOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectOp::Out => ">",
            RedirectOp::Append => ">>",
            RedirectOp::In => "<",
            RedirectOp::StderrToStdout => "2>&1",
            RedirectOp::All => "&>",
        }
    }
}

impl fmt::Display for RedirectOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single input/output redirection attached to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub pos: Position,
    pub op: RedirectOp,
    /// Target file; empty for `2>&1`.
    pub file: String,
    /// File descriptor the redirect applies to (0 and 1 mean stdout, 2 stderr).
    pub fd: i32,
}

/// A simple command: a name, its literal arguments and an optional redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub pos: Position,
    pub name: String,
    pub args: Vec<String>,
    pub redirect: Option<Redirect>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            pos: Position::default(),
            name: name.into(),
            args,
            redirect: None,
        }
    }

    pub fn at(mut self, pos: Position) -> Self {
        self.pos = pos;
        self
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = Some(redirect);
        self
    }

    /// Name and arguments joined by spaces, used for job listings and logs.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.args.join(" "))
        }
    }
}

/// A user-defined function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub pos: Position,
    pub name: String,
    pub body: ScriptNode,
}

/// An ordered sequence of statements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptNode {
    pub pos: Position,
    pub nodes: Vec<Node>,
}

impl ScriptNode {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            pos: Position::line(1),
            nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Command(Command),
    Pipe {
        pos: Position,
        left: Box<Node>,
        right: Box<Node>,
    },
    If {
        pos: Position,
        condition: Box<Node>,
        then: ScriptNode,
        otherwise: Option<ScriptNode>,
    },
    For {
        pos: Position,
        variable: String,
        list: Vec<String>,
        body: ScriptNode,
    },
    While {
        pos: Position,
        condition: Box<Node>,
        body: ScriptNode,
    },
    Assignment {
        pos: Position,
        name: String,
        value: String,
    },
    Array {
        pos: Position,
        name: String,
        values: Vec<String>,
    },
    Function(FunctionDef),
    And {
        pos: Position,
        left: Box<Node>,
        right: Box<Node>,
    },
    Or {
        pos: Position,
        left: Box<Node>,
        right: Box<Node>,
    },
    Background {
        pos: Position,
        command: Box<Node>,
    },
    Heredoc {
        pos: Position,
        command: Box<Node>,
        body: String,
    },
    Break(Position),
    Continue(Position),
    Annotation {
        pos: Position,
        name: String,
        value: String,
    },
}

impl Node {
    pub fn position(&self) -> Position {
        match self {
            Node::Command(cmd) => cmd.pos,
            Node::Function(func) => func.pos,
            Node::Break(pos) | Node::Continue(pos) => *pos,
            Node::Pipe { pos, .. }
            | Node::If { pos, .. }
            | Node::For { pos, .. }
            | Node::While { pos, .. }
            | Node::Assignment { pos, .. }
            | Node::Array { pos, .. }
            | Node::And { pos, .. }
            | Node::Or { pos, .. }
            | Node::Background { pos, .. }
            | Node::Heredoc { pos, .. }
            | Node::Annotation { pos, .. } => *pos,
        }
    }

    /// Short variant name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Command(_) => "command",
            Node::Pipe { .. } => "pipe",
            Node::If { .. } => "if",
            Node::For { .. } => "for",
            Node::While { .. } => "while",
            Node::Assignment { .. } => "assignment",
            Node::Array { .. } => "array",
            Node::Function(_) => "function",
            Node::And { .. } => "and",
            Node::Or { .. } => "or",
            Node::Background { .. } => "background",
            Node::Heredoc { .. } => "heredoc",
            Node::Break(_) => "break",
            Node::Continue(_) => "continue",
            Node::Annotation { .. } => "annotation",
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Node::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Convenience constructor for a bare command node.
    pub fn command(name: impl Into<String>, args: &[&str]) -> Self {
        Node::Command(Command::new(
            name,
            args.iter().map(|a| a.to_string()).collect(),
        ))
    }

    pub fn pipe(left: Node, right: Node) -> Self {
        Node::Pipe {
            pos: left.position(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

impl From<Command> for Node {
    fn from(cmd: Command) -> Self {
        Node::Command(cmd)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Command(cmd) => f.write_str(&cmd.name),
            Node::Pipe { .. } => f.write_str("|"),
            Node::Function(func) => write!(f, "function {}", func.name),
            other => f.write_str(other.kind()),
        }
    }
}
