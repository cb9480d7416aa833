pub mod ascii;

pub use ascii::Ascii;

/// Matches a byte string against ASCII patterns, ignoring case, and yields the
/// arm of the first match.
macro_rules! bmatch_caseless {
    ($value:expr; $($pattern:literal => $arm:expr),+ , _ => $default:expr $(,)?) => {{
        let value: &[u8] = $value;
        $(if value.eq_ignore_ascii_case($pattern) { $arm } else)+ { $default }
    }};
}

pub(crate) use bmatch_caseless;

/// Byte offset of `inner` within `outer`, if `inner` borrows from it.
pub fn offset_within(outer: &str, inner: &str) -> Option<usize> {
    let range = outer.as_bytes().as_ptr_range();
    let at = inner.as_ptr();
    (range.start <= at && at <= range.end).then(|| at as usize - range.start as usize)
}

/// Returns whether `c` may appear in an identifier. Non-ASCII characters are
/// always identifier characters.
pub fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || !c.is_ascii()
}

pub fn is_ident_start(c: char) -> bool {
    is_ident_char(c) && !c.is_ascii_digit()
}

/// Validates a label or variable name, returning a message describing the
/// first offending character.
pub fn check_ident(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("name is empty".to_owned());
    };
    if !is_ident_start(first) {
        return Err(format!("name `{name}` cannot start with `{first}`"));
    }
    if let Some(c) = chars.find(|&c| !is_ident_char(c)) {
        return Err(format!("name `{name}` contains invalid character `{c}`"));
    }
    Ok(())
}

/// Strips a `;` comment, ignoring semicolons inside double-quoted strings.
pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_str = false;
    let mut i = 0;
    while i < bytes.len() {
        let Some(pos) = memchr::memchr3(b';', b'"', b'\\', &bytes[i..]) else {
            break;
        };
        let at = i + pos;
        i = at + 1;
        match bytes[at] {
            b'\\' if in_str => i += 1,
            b'"' => in_str = !in_str,
            b';' if !in_str => return &line[..at],
            _ => (),
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caseless_byte_match() {
        let kind = |s: &str| {
            bmatch_caseless!(s.as_bytes();
                b"SKIPSTART" => 1,
                b"SkipEnd" => 2,
                _ => 0,
            )
        };
        assert_eq!(kind("skipstart"), 1);
        assert_eq!(kind("SKIPEND"), 2);
        assert_eq!(kind("SKIP"), 0);
        let text = "#DIM X = 1";
        assert_eq!(offset_within(text, &text[5..]), Some(5));
        assert_eq!(offset_within(text, "elsewhere"), None);
    }

    #[test]
    fn comments_and_idents() {
        assert_eq!(strip_comment(r#"PRINT a;b"#), "PRINT a");
        assert_eq!(strip_comment(r#"X = "a;b" ; c"#), r#"X = "a;b" "#);
        assert_eq!(strip_comment(r#"S = "\";" ;x"#), r#"S = "\";" "#);
        assert_eq!(strip_comment(r#"S = "\"#), r#"S = "\"#);
        assert!(check_ident("COM_ABLE12").is_ok());
        assert!(check_ident("1ABC").is_err());
        assert!(check_ident("A-B").is_err());
        assert!(check_ident("").is_err());
    }
}
