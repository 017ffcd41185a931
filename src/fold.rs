use itertools::Itertools;
use nix::unistd::Pid;

/// How much of an argv literal to keep when it cannot be decoded.
const RAW_ARGV_CLIP: usize = 32;

/// Build the flame-chart frame for one exec epoch from its raw execve
/// argument text.
///
/// Many processes (like /bin/bash) aren't interesting by path alone, so the
/// frame carries the argv list too: `"/bin/sh"(123) ['sh', '-c', 'x']`.
/// Semicolons are the folded-stack separator and get replaced with 'z'.
pub fn frame(pid: Pid, args: &str) -> String {
    let (arg0, argv) = args.split_once(',').unwrap_or((args, ""));
    let arg0 = arg0.trim();
    let arg0 = unquote(arg0).unwrap_or_else(|| arg0.to_owned());

    let argv = argv.trim_start();
    let argv = if argv.starts_with('[') {
        render_argv(argv)
    } else {
        argv.to_owned()
    };

    format!("{}({}) {}", arg0, pid, argv).replace(';', "z")
}

/// Render the argv list literal. The trailer after the closing bracket (the
/// envp pointer, a vars comment) is dropped; a list the tracer truncated to
/// `"..."...]` is patched into a well-formed one first.
fn render_argv(argv: &str) -> String {
    let argv = match argv.rfind(']') {
        Some(end) => &argv[..=end],
        None => return clip(argv),
    };
    let argv = if argv.ends_with("...]") {
        format!("{}, \"...\"]", &argv[..argv.len() - 4])
    } else {
        argv.to_owned()
    };
    match parse_list(&argv) {
        Some(items) => format!("[{}]", items.iter().map(|item| quote(item)).join(", ")),
        // couldn't decode, just take some content to identify it
        None => clip(&argv),
    }
}

fn clip(s: &str) -> String {
    s.chars().take(RAW_ARGV_CLIP).collect()
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Decode a double-quoted string literal as the tracer prints them: standard
/// escapes plus `\xHH` and octal byte escapes. Unknown escapes are kept
/// verbatim.
pub fn unquote(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            'a' => out.push('\u{7}'),
            'b' => out.push('\u{8}'),
            'x' => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return None;
                }
                out.push(char::from(value as u8));
            }
            digit @ '0'..='7' => {
                let mut value = digit.to_digit(8).unwrap_or(0);
                let mut digits = 1;
                while digits < 3 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                out.push(char::from(value as u8));
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Parse a `["a", "b"]` list of string literals. Anything else is `None` and
/// the caller falls back to raw text.
fn parse_list(s: &str) -> Option<Vec<String>> {
    let inner = s.strip_prefix('[')?.strip_suffix(']')?.trim();
    let mut items = Vec::new();
    if inner.is_empty() {
        return Some(items);
    }
    let mut rest = inner;
    loop {
        rest = rest.trim_start();
        let end = quoted_end(rest)?;
        items.push(unquote(&rest[..end])?);
        rest = rest[end..].trim_start();
        if rest.is_empty() {
            return Some(items);
        }
        rest = rest.strip_prefix(',')?;
    }
}

/// Index one past the closing quote of the literal `s` starts with.
fn quoted_end(s: &str) -> Option<usize> {
    if !s.starts_with('"') {
        return None;
    }
    let bytes = s.as_bytes();
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        match b {
            b'\\' if !escaped => escaped = true,
            b'"' if !escaped => return Some(i + 1),
            _ => escaped = false,
        }
    }
    None
}
