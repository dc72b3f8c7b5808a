//! Word expansion: command substitution, `+` concatenation and variables.
//!
//! Expansion needs two things from its caller: a way to read variables and
//! a way to run a nested script. Both come through [`ExpansionHost`], which
//! keeps this module free of engine internals.

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Variable lookup and command substitution as seen by [`expand`].
pub trait ExpansionHost {
    /// Current value of `name`, if set.
    fn lookup(&self, name: &str) -> Option<String>;

    /// Run `source` as a script and return its stdout, or `None` when it
    /// fails to parse or run.
    fn substitute(&mut self, source: &str) -> Option<String>;
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn braced_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\$\{([^}]+)\}")
}

fn named_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\$([A-Za-z_][A-Za-z0-9_]*)")
}

fn positional_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\$([0-9#@])")
}

/// Set and non-empty. Empty variables behave as unset during expansion.
fn value_of(host: &dyn ExpansionHost, name: &str) -> Option<String> {
    host.lookup(name).filter(|v| !v.is_empty())
}

/// Expand one word.
///
/// Order: command substitution, then `+` concatenation (which ends expansion
/// when it applies), then `${NAME}`, `$NAME` and positional parameters, and
/// finally a lone bare word naming a variable.
pub fn expand(host: &mut dyn ExpansionHost, text: &str) -> String {
    let text = substitute_commands(host, text);

    let parts = split_concat(&text);
    if parts.len() > 1 {
        return parts
            .iter()
            .map(|part| {
                let part = part.trim();
                if let Some(inner) = unquote(part) {
                    inner.to_string()
                } else {
                    value_of(host, part).unwrap_or_else(|| part.to_string())
                }
            })
            .collect();
    }

    let host: &dyn ExpansionHost = host;
    let text = replace_vars(braced_re(), host, &text);
    let text = replace_vars(named_re(), host, &text);
    let text = replace_vars(positional_re(), host, &text);

    let trimmed = text.trim();
    if !trimmed.is_empty() && !trimmed.contains(' ') && !trimmed.contains('$') {
        if let Some(value) = value_of(host, trimmed) {
            return value;
        }
    }
    text
}

fn replace_vars(re: Option<&Regex>, host: &dyn ExpansionHost, text: &str) -> String {
    let Some(re) = re else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures<'_>| {
        value_of(host, &caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Replace every `$(…)` and `` `…` `` with the output of running its body.
/// Unterminated forms are kept as written.
pub fn substitute_commands(host: &mut dyn ExpansionHost, text: &str) -> String {
    if !text.contains("$(") && !text.contains('`') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$(") {
            if let Some(end) = closing_paren(after) {
                out.push_str(&run_substitution(host, &after[..end]));
                rest = &after[end + 1..];
                continue;
            }
        } else if let Some(after) = rest.strip_prefix('`') {
            if let Some(end) = after.find('`') {
                out.push_str(&run_substitution(host, &after[..end]));
                rest = &after[end + 1..];
                continue;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn run_substitution(host: &mut dyn ExpansionHost, source: &str) -> String {
    if source.trim().is_empty() {
        return String::new();
    }
    match host.substitute(source) {
        Some(output) => output.strip_suffix('\n').unwrap_or(&output).to_string(),
        None => String::new(),
    }
}

/// Byte index of the `)` matching an already consumed `(`.
fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `+` outside quotes. Quotes are kept in the parts and empty
/// parts are dropped; a string with no non-empty part comes back whole.
pub fn split_concat(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match (quote, c) {
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '+') => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.is_empty() {
        parts.push(text.to_string());
    }
    parts
}

/// Inner text of a `"…"` or `'…'` word.
pub fn unquote(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

/// Elements of an array literal body (the text between the parentheses).
///
/// Whitespace separates elements outside quotes; quotes group and are
/// removed; a backslash before a quote or another backslash makes it literal.
pub fn parse_array_elements(input: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('\'' | '"' | '\\')) => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ' ' | '\t' if !in_single && !in_double => {
                if !current.is_empty() {
                    elements.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        elements.push(current);
    }
    elements
}

/// Body of a `(…)` array literal, if `value` is one.
pub fn array_literal(value: &str) -> Option<&str> {
    value.strip_prefix('(')?.strip_suffix(')')
}

/// Body of a value that is exactly one `$(…)` or `` `…` `` substitution.
pub fn whole_substitution(value: &str) -> Option<&str> {
    if let Some(after) = value.strip_prefix("$(") {
        let end = closing_paren(after)?;
        return (end + 1 == after.len()).then(|| &after[..end]);
    }
    let inner = value.strip_prefix('`')?.strip_suffix('`')?;
    (!inner.contains('`')).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Host {
        vars: HashMap<String, String>,
        ran: Vec<String>,
    }

    impl Host {
        fn with(vars: &[(&str, &str)]) -> Self {
            Self {
                vars: vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ran: Vec::new(),
            }
        }
    }

    impl ExpansionHost for Host {
        fn lookup(&self, name: &str) -> Option<String> {
            self.vars.get(name).cloned()
        }

        fn substitute(&mut self, source: &str) -> Option<String> {
            self.ran.push(source.to_string());
            match source {
                "fail" => None,
                other => Some(format!("<{other}>\n")),
            }
        }
    }

    #[test]
    fn braced_and_plain_variables() {
        let mut host = Host::with(&[("NAME", "world"), ("X", "1")]);
        assert_eq!(expand(&mut host, "hello ${NAME}"), "hello world");
        assert_eq!(expand(&mut host, "$NAME-$X"), "world-1");
        assert_eq!(expand(&mut host, "$MISSING and ${MISSING}"), "$MISSING and ${MISSING}");
    }

    #[test]
    fn empty_variables_are_left_as_written() {
        let mut host = Host::with(&[("E", "")]);
        assert_eq!(expand(&mut host, "$E"), "$E");
        assert_eq!(expand(&mut host, "E"), "E");
    }

    #[test]
    fn positional_parameters() {
        let mut host = Host::with(&[("1", "a"), ("#", "2"), ("@", "a b")]);
        assert_eq!(expand(&mut host, "$1:$#:$@"), "a:2:a b");
        assert_eq!(expand(&mut host, "$2"), "$2");
    }

    #[test]
    fn bare_word_resolves_only_when_alone() {
        let mut host = Host::with(&[("greeting", "hi")]);
        assert_eq!(expand(&mut host, "greeting"), "hi");
        assert_eq!(expand(&mut host, "greeting there"), "greeting there");
    }

    #[test]
    fn concatenation_unquotes_and_resolves_parts() {
        let mut host = Host::with(&[("a", "foo"), ("b", "bar")]);
        assert_eq!(expand(&mut host, "a + \" \" + b"), "foo bar");
        assert_eq!(expand(&mut host, "a+'-'+unknown"), "foo-unknown");
        assert_eq!(expand(&mut host, "\"1+1\""), "\"1+1\"");
    }

    #[test]
    fn split_concat_keeps_quoted_plus() {
        assert_eq!(split_concat("x + 'a+b'"), vec!["x ", " 'a+b'"]);
        assert_eq!(split_concat("+"), vec!["+"]);
        assert_eq!(split_concat("c++"), vec!["c"]);
    }

    #[test]
    fn command_substitution_trims_one_newline() {
        let mut host = Host::default();
        assert_eq!(expand(&mut host, "v=$(echo hi)"), "v=<echo hi>");
        assert_eq!(expand(&mut host, "`date`!"), "<date>!");
        assert_eq!(host.ran, vec!["echo hi", "date"]);
    }

    #[test]
    fn nested_parens_and_failures() {
        let mut host = Host::default();
        assert_eq!(expand(&mut host, "$(f (x))"), "<f (x)>");
        assert_eq!(expand(&mut host, "[$(fail)]"), "[]");
        assert_eq!(expand(&mut host, "$(open"), "$(open");
        assert_eq!(expand(&mut host, "`open"), "`open");
    }

    #[test]
    fn array_elements_honor_quotes_and_escapes() {
        assert_eq!(
            parse_array_elements(r#"one "two words" 'three' four\"s"#),
            vec!["one", "two words", "three", "four\"s"]
        );
        assert_eq!(parse_array_elements("  a\t b  "), vec!["a", "b"]);
        assert!(parse_array_elements("   ").is_empty());
    }

    #[test]
    fn literal_detection() {
        assert_eq!(array_literal("(a b)"), Some("a b"));
        assert_eq!(array_literal("a b"), None);
        assert_eq!(whole_substitution("$(ls -l)"), Some("ls -l"));
        assert_eq!(whole_substitution("$(a) $(b)"), None);
        assert_eq!(whole_substitution("`pwd`"), Some("pwd"));
        assert_eq!(whole_substitution("x$(pwd)"), None);
    }
}
